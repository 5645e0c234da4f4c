//! Machine-actionable description of a dependency migration.
//!
//! A [`ChangeSet`] is produced once per run by the planner and never mutated in
//! place afterwards; diagnosis edits are applied to a copy that becomes the
//! next sandbox input.

pub mod manifest;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use manifest::{apply_to_package_json, apply_to_requirements, ManifestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upgrade,
    Remove,
    Keep,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Upgrade => write!(f, "upgrade"),
            ChangeAction::Remove => write!(f, "remove"),
            ChangeAction::Keep => write!(f, "keep"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyChange {
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub target_version: Option<String>,
    pub action: ChangeAction,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub breaking_changes: Vec<String>,
}

impl DependencyChange {
    pub fn upgrade(current: &str, target: &str) -> Self {
        Self {
            current_version: Some(current.to_string()),
            target_version: Some(target.to_string()),
            action: ChangeAction::Upgrade,
            risk: RiskLevel::Low,
            rationale: String::new(),
            breaking_changes: Vec::new(),
        }
    }

    pub fn remove(current: &str) -> Self {
        Self {
            current_version: Some(current.to_string()),
            target_version: None,
            action: ChangeAction::Remove,
            risk: RiskLevel::Low,
            rationale: String::new(),
            breaking_changes: Vec::new(),
        }
    }

    pub fn keep(current: &str) -> Self {
        Self {
            current_version: Some(current.to_string()),
            target_version: None,
            action: ChangeAction::Keep,
            risk: RiskLevel::Low,
            rationale: String::new(),
            breaking_changes: Vec::new(),
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPhase {
    pub phase: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Kept in the order the planner listed them; diagnosis additions go last.
    #[serde(default)]
    pub dependencies: IndexMap<String, DependencyChange>,
    #[serde(default)]
    pub overall_risk: RiskLevel,
    #[serde(default)]
    pub phases: Vec<RolloutPhase>,
}

/// A single dependency edit proposed by diagnosis, applied to a copy of the
/// planned change set before the next validation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdit {
    pub name: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub target_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeSetError {
    #[error("change set names no dependencies")]
    Empty,
    #[error("dependency name must be non-empty")]
    EmptyName,
    #[error("dependency `{name}` is an upgrade without a target version")]
    MissingTargetVersion { name: String },
    #[error("phase {phase} names unknown dependency `{name}`")]
    UnknownPhaseDependency { phase: u32, name: String },
    #[error("dependency `{name}` appears in phase {first} and phase {second}")]
    OverlappingPhases { name: String, first: u32, second: u32 },
    #[error("phase {phase} is out of order (previous phase {previous})")]
    PhaseOrder { phase: u32, previous: u32 },
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, name: impl Into<String>, change: DependencyChange) -> Self {
        self.dependencies.insert(name.into(), change);
        self
    }

    pub fn with_phase(mut self, phase: u32, name: &str, dependencies: &[&str]) -> Self {
        self.phases.push(RolloutPhase {
            phase,
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn get(&self, name: &str) -> Option<&DependencyChange> {
        self.dependencies.get(name)
    }

    /// Entries whose action changes the manifest.
    pub fn actionable(&self) -> impl Iterator<Item = (&String, &DependencyChange)> {
        self.dependencies
            .iter()
            .filter(|(_, change)| change.action != ChangeAction::Keep)
    }

    pub fn count_by_action(&self, action: ChangeAction) -> usize {
        self.dependencies
            .values()
            .filter(|change| change.action == action)
            .count()
    }

    /// Checks the structural invariants: non-empty mapping, upgrades carry a
    /// target, and phases are strictly ordered and partition known names.
    pub fn validate(&self) -> Result<(), ChangeSetError> {
        if self.dependencies.is_empty() {
            return Err(ChangeSetError::Empty);
        }
        for (name, change) in &self.dependencies {
            if name.trim().is_empty() {
                return Err(ChangeSetError::EmptyName);
            }
            let has_target = change
                .target_version
                .as_deref()
                .is_some_and(|v| !v.trim().is_empty());
            if change.action == ChangeAction::Upgrade && !has_target {
                return Err(ChangeSetError::MissingTargetVersion { name: name.clone() });
            }
        }

        let mut owner: BTreeMap<&str, u32> = BTreeMap::new();
        let mut previous: Option<u32> = None;
        for phase in &self.phases {
            if let Some(prev) = previous {
                if phase.phase <= prev {
                    return Err(ChangeSetError::PhaseOrder {
                        phase: phase.phase,
                        previous: prev,
                    });
                }
            }
            previous = Some(phase.phase);

            let mut seen_in_phase = BTreeSet::new();
            for name in &phase.dependencies {
                if !self.dependencies.contains_key(name) {
                    return Err(ChangeSetError::UnknownPhaseDependency {
                        phase: phase.phase,
                        name: name.clone(),
                    });
                }
                if !seen_in_phase.insert(name.as_str()) {
                    continue;
                }
                if let Some(first) = owner.insert(name.as_str(), phase.phase) {
                    return Err(ChangeSetError::OverlappingPhases {
                        name: name.clone(),
                        first,
                        second: phase.phase,
                    });
                }
            }
        }
        Ok(())
    }

    /// Returns a copy with `edits` applied. `Keep` edits reset an entry to a
    /// no-op; edits naming unknown dependencies add them.
    pub fn with_edits(&self, edits: &[DependencyEdit]) -> ChangeSet {
        let mut next = self.clone();
        for edit in edits {
            let entry = next
                .dependencies
                .entry(edit.name.clone())
                .or_insert_with(|| DependencyChange {
                    current_version: None,
                    target_version: None,
                    action: ChangeAction::Keep,
                    risk: RiskLevel::Medium,
                    rationale: "added by diagnosis".to_string(),
                    breaking_changes: Vec::new(),
                });
            entry.action = edit.action;
            match edit.action {
                ChangeAction::Upgrade => {
                    if edit.target_version.is_some() {
                        entry.target_version = edit.target_version.clone();
                    }
                }
                ChangeAction::Remove | ChangeAction::Keep => entry.target_version = None,
            }
        }
        next
    }
}
