//! Principal-scoped purpose and constraints.
//!
//! A [`WillVector`] is immutable once anchored. Sessions hold it behind an
//! `Arc`; the only way to change it is [`WillAnchor::reanchor`], which writes a
//! new version and an audit entry.

use std::{collections::{BTreeSet, HashMap}, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    artifacts::{content_id, normalize_statement, ArtifactId, ArtifactViolation, PrincipalId},
    store::{AuditLog, LogEntryBody, StoreError, WillAnchorEntry},
};

/// Rules that govern drift detection for a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftRules {
    /// Past records that must depend on an assumption before its invalidation counts as drift.
    pub min_dependent_records: usize,
    /// Whether observed outcomes are checked against non-negotiables.
    pub watch_non_negotiables: bool,
}

impl Default for DriftRules {
    fn default() -> Self {
        Self {
            min_dependent_records: 2,
            watch_non_negotiables: true,
        }
    }
}

/// Operator input for anchoring or re-anchoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WillDraft {
    /// Purpose statement.
    pub purpose: String,
    /// Constraints no outcome may compromise.
    pub non_negotiables: BTreeSet<String>,
    /// Ethical limits.
    pub ethical_bounds: Vec<String>,
    /// Priorities, highest first.
    pub priority_axes: Vec<String>,
    /// Drift detection rules.
    pub drift_rules: DriftRules,
}

impl WillDraft {
    /// Starts a draft with a purpose.
    #[must_use]
    pub fn new(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ..Self::default()
        }
    }

    /// Adds a non-negotiable.
    #[must_use]
    pub fn non_negotiable(mut self, value: impl Into<String>) -> Self {
        self.non_negotiables.insert(value.into());
        self
    }

    /// Appends a priority axis (lower priority than those already present).
    #[must_use]
    pub fn priority(mut self, axis: impl Into<String>) -> Self {
        self.priority_axes.push(axis.into());
        self
    }

    /// Adds an ethical bound.
    #[must_use]
    pub fn ethical_bound(mut self, bound: impl Into<String>) -> Self {
        self.ethical_bounds.push(bound.into());
        self
    }

    /// Overrides the drift rules.
    #[must_use]
    pub fn drift_rules(mut self, rules: DriftRules) -> Self {
        self.drift_rules = rules;
        self
    }
}

/// Version pointer stored on records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WillRef {
    /// Will id (stable per principal).
    pub will_id: ArtifactId,
    /// Version the session ran against.
    pub version: u32,
}

/// Anchored purpose and constraints for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillVector {
    /// Stable id.
    pub id: ArtifactId,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Anchor version, starting at 1.
    pub version: u32,
    /// Purpose statement.
    pub purpose: String,
    /// Constraints no outcome may compromise.
    pub non_negotiables: BTreeSet<String>,
    /// Ethical limits.
    pub ethical_bounds: Vec<String>,
    /// Priorities, highest first.
    pub priority_axes: Vec<String>,
    /// Drift detection rules.
    pub drift_rules: DriftRules,
    /// Anchor time.
    pub anchored_at: DateTime<Utc>,
}

impl WillVector {
    /// Builds a versioned vector from a draft.
    #[must_use]
    pub fn from_draft(principal: impl Into<PrincipalId>, draft: WillDraft, version: u32) -> Self {
        let principal = principal.into();
        Self {
            id: content_id("will", &principal),
            principal,
            version,
            purpose: draft.purpose.trim().to_string(),
            non_negotiables: draft
                .non_negotiables
                .into_iter()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            ethical_bounds: draft.ethical_bounds,
            priority_axes: draft.priority_axes,
            drift_rules: draft.drift_rules,
            anchored_at: Utc::now(),
        }
    }

    /// Version pointer for records.
    #[must_use]
    pub const fn reference(&self) -> WillRef {
        WillRef {
            will_id: self.id,
            version: self.version,
        }
    }

    /// Non-negotiable matched by the given label, if any.
    #[must_use]
    pub fn non_negotiable_matching(&self, label: &str) -> Option<&str> {
        let wanted = normalize_statement(label);
        self.non_negotiables
            .iter()
            .find(|value| normalize_statement(value) == wanted)
            .map(String::as_str)
    }

    /// Checks identity and content invariants.
    pub fn validate(&self) -> Result<(), ArtifactViolation> {
        if self.purpose.is_empty() {
            return Err(ArtifactViolation::new("WillVector", "purpose is empty"));
        }
        if self.version == 0 {
            return Err(ArtifactViolation::new("WillVector", "version starts at 1"));
        }
        let mut axes = BTreeSet::new();
        if let Some(dup) = self
            .priority_axes
            .iter()
            .find(|axis| !axes.insert(normalize_statement(axis)))
        {
            return Err(ArtifactViolation::new(
                "WillVector",
                format!("priority axis `{dup}` appears twice"),
            ));
        }
        if self.drift_rules.min_dependent_records == 0 {
            return Err(ArtifactViolation::new(
                "WillVector",
                "drift rules need at least one dependent record",
            ));
        }
        Ok(())
    }
}

/// Errors raised by the Will anchor.
#[derive(Debug, Error)]
pub enum WillError {
    /// No Will for the principal.
    #[error("principal `{0}` has no anchored Will")]
    NotAnchored(PrincipalId),
    /// Initial anchor attempted twice.
    #[error("principal `{0}` is already anchored; re-anchor instead")]
    AlreadyAnchored(PrincipalId),
    /// Draft failed validation.
    #[error(transparent)]
    Invalid(#[from] ArtifactViolation),
    /// Audit entry could not be written.
    #[error("writing will audit entry: {0}")]
    Store(#[from] StoreError),
}

/// Holds the current Will per principal and writes every change to the audit log.
#[derive(Debug)]
pub struct WillAnchor {
    current: RwLock<HashMap<PrincipalId, Arc<WillVector>>>,
    log: Arc<dyn AuditLog>,
}

impl WillAnchor {
    /// Creates an anchor, restoring the latest version per principal from the log.
    pub fn from_log(log: Arc<dyn AuditLog>) -> Result<Self, WillError> {
        let mut current = HashMap::new();
        for entry in log.snapshot()? {
            if let LogEntryBody::WillAnchored(anchored) = entry.body {
                current.insert(entry.principal, Arc::new(anchored.will));
            }
        }
        Ok(Self {
            current: RwLock::new(current),
            log,
        })
    }

    /// Anchors a principal for the first time.
    pub fn anchor(
        &self,
        principal: &str,
        draft: WillDraft,
        operator: &str,
    ) -> Result<Arc<WillVector>, WillError> {
        let mut current = self.current.write();
        if current.contains_key(principal) {
            return Err(WillError::AlreadyAnchored(principal.to_string()));
        }
        let will = WillVector::from_draft(principal, draft, 1);
        will.validate()?;
        self.log.append(
            principal,
            LogEntryBody::WillAnchored(WillAnchorEntry {
                will: will.clone(),
                operator: operator.to_string(),
                reason: "initial anchor".into(),
            }),
        )?;
        let will = Arc::new(will);
        current.insert(principal.to_string(), Arc::clone(&will));
        Ok(will)
    }

    /// Replaces the principal's Will with a new version. Sessions already holding
    /// the previous `Arc` keep running against it.
    pub fn reanchor(
        &self,
        principal: &str,
        draft: WillDraft,
        operator: &str,
        reason: &str,
    ) -> Result<Arc<WillVector>, WillError> {
        let mut current = self.current.write();
        let previous = current
            .get(principal)
            .ok_or_else(|| WillError::NotAnchored(principal.to_string()))?;
        let will = WillVector::from_draft(principal, draft, previous.version + 1);
        will.validate()?;
        self.log.append(
            principal,
            LogEntryBody::WillAnchored(WillAnchorEntry {
                will: will.clone(),
                operator: operator.to_string(),
                reason: reason.to_string(),
            }),
        )?;
        let will = Arc::new(will);
        current.insert(principal.to_string(), Arc::clone(&will));
        Ok(will)
    }

    /// Current Will for a principal.
    #[must_use]
    pub fn current(&self, principal: &str) -> Option<Arc<WillVector>> {
        self.current.read().get(principal).cloned()
    }

    /// Principals with an anchored Will.
    #[must_use]
    pub fn principals(&self) -> Vec<PrincipalId> {
        let mut principals: Vec<_> = self.current.read().keys().cloned().collect();
        principals.sort();
        principals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAuditLog;

    fn draft() -> WillDraft {
        WillDraft::new("build durable regional presence")
            .non_negotiable("customer data privacy")
            .priority("capital preservation")
            .priority("market share")
    }

    #[test]
    fn reanchor_bumps_version_and_audits() {
        let log: Arc<dyn AuditLog> = Arc::new(MemoryAuditLog::default());
        let anchor = WillAnchor::from_log(Arc::clone(&log)).unwrap();
        let first = anchor.anchor("acme", draft(), "ops").unwrap();
        assert!(matches!(
            anchor.anchor("acme", draft(), "ops"),
            Err(WillError::AlreadyAnchored(_))
        ));
        let second = anchor
            .reanchor("acme", draft().priority("speed"), "ops", "board review")
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.id, second.id);
        assert_eq!(log.snapshot().unwrap().len(), 2);

        let restored = WillAnchor::from_log(log).unwrap();
        assert_eq!(restored.current("acme").unwrap().version, 2);
    }

    #[test]
    fn rejects_duplicate_priority_axes() {
        let log: Arc<dyn AuditLog> = Arc::new(MemoryAuditLog::default());
        let anchor = WillAnchor::from_log(log).unwrap();
        let err = anchor
            .anchor("acme", draft().priority("Market share"), "ops")
            .unwrap_err();
        assert!(matches!(err, WillError::Invalid(_)));
        assert!(anchor.current("acme").is_none());
        assert!(matches!(
            anchor.reanchor("ghost", draft(), "ops", "n/a"),
            Err(WillError::NotAnchored(_))
        ));
    }
}
