//! Canonical artifacts produced and referenced by a session.

/// Assumption ledger and status transitions.
pub mod ledger;
/// Falsifiers and falsifier sets.
pub mod falsifier;
/// Scenario packs and outcome bounds.
pub mod scenario;
/// Strategy playbooks.
pub mod playbook;
/// Terminal decision records.
pub mod record;
/// Weak signal log entries.
pub mod signal;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::will::WillVector;

pub use falsifier::{Falsifier, FalsifierSet, Severity};
pub use ledger::{AssumptionEntry, AssumptionLedger, AssumptionOrigin, AssumptionStatus, LedgerError};
pub use playbook::{PlaybookAction, StrategyPlaybook};
pub use record::{AssumptionDigest, DecisionRecord, DecisionStatus, FalsifierDigest, RefusalSummary};
pub use scenario::{Indicator, OutcomeBounds, Scenario, ScenarioPack, ScenarioType};
pub use signal::WeakSignal;

/// Principal (tenant) owning long-lived state.
pub type PrincipalId = String;
/// Identity of any stored artifact.
pub type ArtifactId = Uuid;
/// Session identity.
pub type SessionId = Uuid;
/// Content-derived assumption identity.
pub type AssumptionId = Uuid;
/// Content-derived falsifier identity.
pub type FalsifierId = Uuid;
/// Scenario identity (unique within a pack).
pub type ScenarioId = Uuid;
/// Weak signal identity.
pub type SignalId = Uuid;
/// Decision record identity.
pub type RecordId = Uuid;

/// Namespace for name-based artifact identities.
pub const ARTIFACT_NAMESPACE: Uuid = Uuid::from_u128(0x6765_6e65_7369_732d_636f_676e_6c6f_6f70);

/// Lowercases, collapses whitespace, and strips trailing punctuation.
#[must_use]
pub fn normalize_statement(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', '?', ';', ',', ':'])
        .trim()
        .to_string()
}

/// Name-based identity: the same normalized text always yields the same id.
#[must_use]
pub fn content_id(kind: &str, text: &str) -> Uuid {
    let key = format!("{kind}:{}", normalize_statement(text));
    Uuid::new_v5(&ARTIFACT_NAMESPACE, key.as_bytes())
}

/// Declared time scope of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Horizon {
    /// Immediate execution.
    H1,
    /// Mid-term.
    H2,
    /// Long-term.
    H3,
}

impl Horizon {
    /// All horizons, shortest first.
    pub const ALL: [Self; 3] = [Self::H1, Self::H2, Self::H3];

    /// Canonical label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::H1 => "H1",
            Self::H2 => "H2",
            Self::H3 => "H3",
        }
    }

    /// Maps a duration in months onto a horizon.
    #[must_use]
    pub fn from_months(months: f64) -> Self {
        if months <= 3.0 {
            Self::H1
        } else if months <= 18.0 {
            Self::H2
        } else {
            Self::H3
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Horizon {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "H1" | "IMMEDIATE" => Ok(Self::H1),
            "H2" | "MID" | "MID-TERM" => Ok(Self::H2),
            "H3" | "LONG" | "LONG-TERM" => Ok(Self::H3),
            other => Err(format!("unknown horizon `{other}`")),
        }
    }
}

impl From<Horizon> for String {
    fn from(value: Horizon) -> Self {
        value.as_str().to_string()
    }
}

/// Invariant violation found while validating a canonical artifact.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{schema}: {reason}")]
pub struct ArtifactViolation {
    /// Schema the artifact claims to conform to.
    pub schema: &'static str,
    /// What failed.
    pub reason: String,
}

impl ArtifactViolation {
    pub(crate) fn new(schema: &'static str, reason: impl Into<String>) -> Self {
        Self {
            schema,
            reason: reason.into(),
        }
    }
}

/// The only shapes allowed to leave the loop as a terminal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schema", content = "artifact")]
pub enum CanonicalArtifact {
    /// Terminal decision.
    DecisionRecord(DecisionRecord),
    /// Assumptions of a session.
    AssumptionLedger(AssumptionLedger),
    /// Anchored purpose and constraints.
    WillVector(WillVector),
    /// Alternative futures.
    ScenarioPack(ScenarioPack),
    /// Action plan.
    StrategyPlaybook(StrategyPlaybook),
}

impl CanonicalArtifact {
    /// Schema name used in the envelope.
    #[must_use]
    pub const fn schema(&self) -> &'static str {
        match self {
            Self::DecisionRecord(_) => "DecisionRecord",
            Self::AssumptionLedger(_) => "AssumptionLedger",
            Self::WillVector(_) => "WillVector",
            Self::ScenarioPack(_) => "ScenarioPack",
            Self::StrategyPlaybook(_) => "StrategyPlaybook",
        }
    }

    /// Checks the structural invariants of the wrapped artifact.
    pub fn validate(&self, min_scenario_types: usize) -> Result<(), ArtifactViolation> {
        match self {
            Self::DecisionRecord(record) => record.validate(),
            Self::AssumptionLedger(ledger) => ledger.validate(),
            Self::WillVector(will) => will.validate(),
            Self::ScenarioPack(pack) => pack.validate(min_scenario_types),
            Self::StrategyPlaybook(playbook) => playbook.validate(None),
        }
    }

    /// Serializes the envelope as a single JSON object.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
