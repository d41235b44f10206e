use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{normalize_statement, ArtifactId, AssumptionId, FalsifierId};

/// Ordinal impact on the conclusion if the falsifier fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Conclusion survives with minor adjustment.
    Low,
    /// Conclusion needs revisiting.
    Medium,
    /// Conclusion collapses.
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(label)
    }
}

/// Condition whose occurrence would invalidate an assumption or disprove a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Falsifier {
    /// Identity derived from the condition text.
    pub id: FalsifierId,
    /// Observable condition.
    pub condition: String,
    /// How the condition is detected.
    pub detection_method: String,
    /// Impact if triggered.
    pub severity: Severity,
    /// Assumption this falsifier guards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption_ref: Option<AssumptionId>,
    /// Claim this falsifier targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<String>,
}

/// Falsifiers produced for one session, sorted by normalized condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FalsifierSet {
    /// Artifact id.
    pub id: ArtifactId,
    /// Falsifiers.
    pub falsifiers: Vec<Falsifier>,
}

impl FalsifierSet {
    /// Wraps falsifiers in a new set.
    #[must_use]
    pub fn new(falsifiers: Vec<Falsifier>) -> Self {
        Self {
            id: Uuid::new_v4(),
            falsifiers,
        }
    }

    /// Normalized conditions, for order-independent comparison.
    #[must_use]
    pub fn conditions(&self) -> BTreeSet<String> {
        self.falsifiers
            .iter()
            .map(|falsifier| normalize_statement(&falsifier.condition))
            .collect()
    }

    /// Whether a falsifier id belongs to this set.
    #[must_use]
    pub fn contains(&self, id: FalsifierId) -> bool {
        self.falsifiers.iter().any(|falsifier| falsifier.id == id)
    }

    /// Looks up a falsifier.
    #[must_use]
    pub fn get(&self, id: FalsifierId) -> Option<&Falsifier> {
        self.falsifiers.iter().find(|falsifier| falsifier.id == id)
    }

    /// Highest severity present.
    #[must_use]
    pub fn max_severity(&self) -> Option<Severity> {
        self.falsifiers.iter().map(|falsifier| falsifier.severity).max()
    }

    /// Ids of falsifiers at exactly the given severity.
    #[must_use]
    pub fn ids_at(&self, severity: Severity) -> Vec<FalsifierId> {
        self.falsifiers
            .iter()
            .filter(|falsifier| falsifier.severity == severity)
            .map(|falsifier| falsifier.id)
            .collect()
    }

    /// All ids in set order.
    #[must_use]
    pub fn ids(&self) -> Vec<FalsifierId> {
        self.falsifiers.iter().map(|falsifier| falsifier.id).collect()
    }

    /// Number of falsifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.falsifiers.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.falsifiers.is_empty()
    }
}
