//! Narrow contracts for the services the pipeline consumes. Adapters that talk
//! to reasoning services or code hosting normalise their responses into these
//! types before returning.

use super::error::CollaboratorError;
use crate::changeset::{ChangeSet, DependencyEdit};
use crate::sandbox::{Ecosystem, ValidationVerdict};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub path: PathBuf,
    pub ecosystem: Ecosystem,
    pub target_branch: String,
}

/// A collaborator result plus what it cost to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Costed<T> {
    pub value: T,
    #[serde(default)]
    pub cost_usd: f64,
}

impl<T> Costed<T> {
    pub fn free(value: T) -> Self {
        Self {
            value,
            cost_usd: 0.0,
        }
    }

    pub fn with_cost(value: T, cost_usd: f64) -> Self {
        Self { value, cost_usd }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSuggestion {
    /// Lower runs first.
    #[serde(default)]
    pub priority: u32,
    pub description: String,
    #[serde(default)]
    pub edit: Option<DependencyEdit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub suggestions: Vec<FixSuggestion>,
    #[serde(default)]
    pub confidence: f64,
}

impl Diagnosis {
    pub fn has_usable_fix(&self) -> bool {
        self.suggestions
            .iter()
            .any(|suggestion| !suggestion.description.trim().is_empty() || suggestion.edit.is_some())
    }

    /// Edits in priority order, stable for equal priorities.
    pub fn edits(&self) -> Vec<DependencyEdit> {
        let mut ordered: Vec<&FixSuggestion> = self.suggestions.iter().collect();
        ordered.sort_by_key(|suggestion| suggestion.priority);
        ordered
            .into_iter()
            .filter_map(|suggestion| suggestion.edit.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub branch: String,
    pub change_request: String,
}

pub trait Planner: Send + Sync {
    fn plan(&self, project: &ProjectSnapshot) -> Result<Costed<ChangeSet>, CollaboratorError>;
}

pub trait Diagnoser: Send + Sync {
    fn diagnose(
        &self,
        verdict: &ValidationVerdict,
        change_set: &ChangeSet,
    ) -> Result<Costed<Diagnosis>, CollaboratorError>;
}

pub trait ChangeStager: Send + Sync {
    fn stage(
        &self,
        project: &ProjectSnapshot,
        change_set: &ChangeSet,
        verdict: &ValidationVerdict,
    ) -> Result<Costed<DeploymentRecord>, CollaboratorError>;
}
