//! Skill self-assessment: the taxonomy and the persisted selection set.
//!
//! The taxonomy is Category → Subgroup → Skill. Subgroups flagged
//! `singleSelect` hold at most one selected skill; picking another one evicts
//! the previous pick. Selection is cumulative across categories.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::state::StageCompletion;
use crate::error::{ConfigError, Error, OnboardingError};
use crate::remote::SkillTaxonomyLoader;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subgroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub single_select: bool,
    pub skills: Vec<Skill>,
}

impl Subgroup {
    pub fn contains(&self, skill_id: &str) -> bool {
        self.skills.iter().any(|s| s.id == skill_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub subgroups: Vec<Subgroup>,
}

/// Ordered list of categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillTaxonomy {
    pub categories: Vec<Category>,
}

impl SkillTaxonomy {
    /// The subgroup a skill belongs to.
    pub fn subgroup_of(&self, skill_id: &str) -> Option<&Subgroup> {
        self.categories
            .iter()
            .flat_map(|c| c.subgroups.iter())
            .find(|g| g.contains(skill_id))
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }
}

/// Selected skill ids, in selection order. Persisted under `selectedSkills`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkillSelection {
    ids: Vec<String>,
}

impl SkillSelection {
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selection = Self::default();
        for id in ids {
            let id = id.into();
            if !selection.contains(&id) {
                selection.ids.push(id);
            }
        }
        selection
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn contains(&self, skill_id: &str) -> bool {
        self.ids.iter().any(|id| id == skill_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Toggle `skill_id` within `subgroup`. Returns whether it is now selected.
    pub fn toggle(&mut self, skill_id: &str, subgroup: &Subgroup) -> bool {
        if self.contains(skill_id) {
            self.ids.retain(|id| id != skill_id);
            return false;
        }
        if subgroup.single_select {
            self.ids.retain(|id| !subgroup.contains(id));
        }
        self.ids.push(skill_id.to_string());
        true
    }
}

/// Applies toggles against a loaded taxonomy.
pub struct SkillSelector<'a> {
    taxonomy: &'a SkillTaxonomy,
}

impl<'a> SkillSelector<'a> {
    pub fn new(taxonomy: &'a SkillTaxonomy) -> Self {
        Self { taxonomy }
    }

    /// Toggle a skill by id. Unknown ids are rejected.
    pub fn toggle(
        &self,
        selection: &mut SkillSelection,
        skill_id: &str,
    ) -> Result<bool, OnboardingError> {
        let subgroup = self
            .taxonomy
            .subgroup_of(skill_id)
            .ok_or_else(|| OnboardingError::UnknownSkill(skill_id.to_string()))?;
        Ok(selection.toggle(skill_id, subgroup))
    }

    pub fn is_last_category(&self, category_index: usize) -> bool {
        category_index + 1 >= self.taxonomy.category_count()
    }

    /// The stage completes from the last category, whatever the selection size.
    pub fn completion(&self, category_index: usize) -> StageCompletion {
        if self.is_last_category(category_index) {
            StageCompletion::Ready
        } else {
            StageCompletion::Blocked(format!(
                "still on category {} of {}",
                category_index + 1,
                self.taxonomy.category_count()
            ))
        }
    }
}

/// Loads the taxonomy from a JSON file (an array of categories).
pub struct FileTaxonomyLoader {
    path: PathBuf,
}

impl FileTaxonomyLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SkillTaxonomyLoader for FileTaxonomyLoader {
    async fn load(&self) -> Result<SkillTaxonomy, Error> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(ConfigError::Io)?;
        let taxonomy: SkillTaxonomy = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!(
                "skill taxonomy {}: {e}",
                self.path.display()
            ))
        })?;
        tracing::info!(
            path = %self.path.display(),
            categories = taxonomy.category_count(),
            "Loaded skill taxonomy from file"
        );
        Ok(taxonomy)
    }
}
