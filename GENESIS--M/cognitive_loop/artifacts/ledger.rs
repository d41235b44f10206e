use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{content_id, normalize_statement, ArtifactId, ArtifactViolation, AssumptionId, SessionId};

/// Lifecycle of an assumption. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssumptionStatus {
    /// Holding, no contrary evidence.
    Active,
    /// Contrary evidence observed but not conclusive.
    Weakened,
    /// Conclusively false.
    Invalidated,
    /// Can no longer be assessed.
    Unknown,
}

impl AssumptionStatus {
    /// Whether moving from `self` to `next` is a legal forward transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Weakened | Self::Invalidated | Self::Unknown)
                | (Self::Weakened | Self::Unknown, Self::Invalidated)
        )
    }

    /// Load-bearing assumptions still carry a conclusion.
    #[must_use]
    pub const fn is_load_bearing(self) -> bool {
        matches!(self, Self::Active | Self::Weakened)
    }
}

impl fmt::Display for AssumptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Weakened => "weakened",
            Self::Invalidated => "invalidated",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Where an assumption was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssumptionOrigin {
    /// Stated in the request (`assume ...`).
    Request,
    /// Proposed by the reasoner.
    Reasoner,
}

/// Single ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumptionEntry {
    /// Content-derived identity, stable across sessions of a principal.
    pub id: AssumptionId,
    /// Short name (`A1`, or reasoner supplied).
    pub name: String,
    /// Assumed statement.
    pub statement: String,
    /// Current status.
    pub status: AssumptionStatus,
    /// Evidence references supporting the current status.
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    /// Declaration origin.
    pub origin: AssumptionOrigin,
}

/// Errors raised by ledger mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// No entry with that id.
    #[error("assumption {0} is not in the ledger")]
    UnknownAssumption(AssumptionId),
    /// Backwards or sideways transition.
    #[error("assumption {id} cannot move from {from} to {to}")]
    IllegalTransition {
        /// Assumption id.
        id: AssumptionId,
        /// Current status.
        from: AssumptionStatus,
        /// Requested status.
        to: AssumptionStatus,
    },
}

/// Assumptions owned by one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumptionLedger {
    /// Artifact id.
    pub id: ArtifactId,
    /// Owning session.
    pub session_id: SessionId,
    /// Entries in declaration order.
    pub entries: Vec<AssumptionEntry>,
}

impl AssumptionLedger {
    /// Creates an empty ledger for a session.
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            entries: Vec::new(),
        }
    }

    /// Declares an assumption. Re-declaring the same statement returns the existing id.
    ///
    /// `inherited` carries a status already reached in the principal's history so that
    /// an invalidated assumption is never silently reset to active.
    pub fn declare(
        &mut self,
        name: Option<&str>,
        statement: &str,
        origin: AssumptionOrigin,
        inherited: Option<AssumptionStatus>,
    ) -> AssumptionId {
        let id = content_id("assumption", statement);
        if self.entries.iter().any(|entry| entry.id == id) {
            return id;
        }
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map_or_else(|| format!("A{}", self.entries.len() + 1), str::to_string);
        self.entries.push(AssumptionEntry {
            id,
            name,
            statement: statement.trim().to_string(),
            status: inherited.unwrap_or(AssumptionStatus::Active),
            evidence_refs: Vec::new(),
            origin,
        });
        id
    }

    /// Moves an entry forward, recording the evidence.
    pub fn transition(
        &mut self,
        id: AssumptionId,
        next: AssumptionStatus,
        evidence: impl Into<String>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(LedgerError::UnknownAssumption(id))?;
        if !entry.status.can_transition_to(next) {
            return Err(LedgerError::IllegalTransition {
                id,
                from: entry.status,
                to: next,
            });
        }
        entry.status = next;
        entry.evidence_refs.push(evidence.into());
        Ok(())
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: AssumptionId) -> Option<&AssumptionEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Finds an entry by name or statement.
    #[must_use]
    pub fn find(&self, reference: &str) -> Option<&AssumptionEntry> {
        let wanted = normalize_statement(reference);
        self.entries.iter().find(|entry| {
            normalize_statement(&entry.name) == wanted
                || normalize_statement(&entry.statement) == wanted
        })
    }

    /// Entries whose status still carries a conclusion.
    pub fn load_bearing(&self) -> impl Iterator<Item = &AssumptionEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.status.is_load_bearing())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks identity and naming invariants.
    pub fn validate(&self) -> Result<(), ArtifactViolation> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.statement.trim().is_empty() {
                return Err(ArtifactViolation::new(
                    "AssumptionLedger",
                    format!("entry {} has an empty statement", entry.name),
                ));
            }
            if entry.id != content_id("assumption", &entry.statement) {
                return Err(ArtifactViolation::new(
                    "AssumptionLedger",
                    format!("entry {} id does not match its statement", entry.name),
                ));
            }
            if self.entries[..idx].iter().any(|other| other.id == entry.id) {
                return Err(ArtifactViolation::new(
                    "AssumptionLedger",
                    format!("entry {} is declared twice", entry.name),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_dedups_and_names_entries() {
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        let a = ledger.declare(None, "funding secured", AssumptionOrigin::Request, None);
        let b = ledger.declare(None, "Funding secured.", AssumptionOrigin::Reasoner, None);
        ledger.declare(None, "no new competitor", AssumptionOrigin::Request, None);
        assert_eq!(a, b);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.entries[1].name, "A2");
        assert!(ledger.validate().is_ok());
    }

    #[test]
    fn transitions_only_move_forward() {
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        let id = ledger.declare(None, "funding secured", AssumptionOrigin::Request, None);
        ledger
            .transition(id, AssumptionStatus::Weakened, "bridge round delayed")
            .unwrap();
        ledger
            .transition(id, AssumptionStatus::Invalidated, "round cancelled")
            .unwrap();
        let err = ledger
            .transition(id, AssumptionStatus::Active, "new investor")
            .unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
        assert_eq!(ledger.get(id).unwrap().evidence_refs.len(), 2);
    }

    #[test]
    fn inherited_status_is_not_reset() {
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        let id = ledger.declare(
            None,
            "funding secured",
            AssumptionOrigin::Request,
            Some(AssumptionStatus::Invalidated),
        );
        assert_eq!(ledger.get(id).unwrap().status, AssumptionStatus::Invalidated);
        assert_eq!(ledger.load_bearing().count(), 0);
        assert!(!AssumptionStatus::Unknown.can_transition_to(AssumptionStatus::Active));
    }
}
