//! Drift detection over a principal's decision history.
//!
//! The monitor reads a snapshot of the audit log and flags two kinds of drift:
//! an assumption that several past records leaned on has since been invalidated,
//! or an executed action compromised one of the Will's non-negotiables. Detected
//! drift raises the principal's strictness until an operator re-anchors the Will.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    artifacts::{
        AssumptionId, AssumptionStatus, PrincipalId, RecordId, SessionId, ARTIFACT_NAMESPACE,
    },
    error::LoopError,
    store::{AuditLog, LogEntry, LogEntryBody},
    telemetry::LoopTelemetry,
    will::{WillAnchor, WillVector},
};

/// What drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// A load-bearing assumption behind past records was invalidated.
    AssumptionInvalidated,
    /// An executed action compromised a Will non-negotiable.
    WillDivergence,
}

impl fmt::Display for DriftKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AssumptionInvalidated => "assumption_invalidated",
            Self::WillDivergence => "will_divergence",
        })
    }
}

/// Detected drift, appended to the audit log once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEvent {
    /// Stable id derived from principal, kind, key, and Will version.
    pub id: Uuid,
    /// Affected principal.
    pub principal: PrincipalId,
    /// Drift kind.
    pub kind: DriftKind,
    /// Assumption id or outcome id the drift is keyed on.
    pub key: String,
    /// Invalidated assumption, for assumption drift.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assumption_id: Option<AssumptionId>,
    /// Human-readable summary.
    pub description: String,
    /// Will version the drift was measured against.
    pub will_version: u32,
    /// Records affected.
    pub dependent_records: Vec<RecordId>,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
}

impl DriftEvent {
    fn new(
        principal: &str,
        kind: DriftKind,
        key: String,
        will_version: u32,
        description: String,
    ) -> Self {
        let name = format!("{principal}:{kind}:{key}:{will_version}");
        Self {
            id: Uuid::new_v5(&ARTIFACT_NAMESPACE, name.as_bytes()),
            principal: principal.to_string(),
            kind,
            key,
            assumption_id: None,
            description,
            will_version,
            dependent_records: Vec::new(),
            detected_at: Utc::now(),
        }
    }
}

/// Observed result of an action a principal actually executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeObservation {
    /// Observation id.
    pub id: Uuid,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Session whose decision led to the action, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Action that was executed.
    pub action: String,
    /// Values the action turned out to compromise.
    #[serde(default)]
    pub compromised: Vec<String>,
    /// Observation time.
    pub observed_at: DateTime<Utc>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: String,
}

impl OutcomeObservation {
    /// Starts an observation.
    #[must_use]
    pub fn new(principal: impl Into<PrincipalId>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            session_id: None,
            action: action.into(),
            compromised: Vec::new(),
            observed_at: Utc::now(),
            notes: String::new(),
        }
    }

    /// Links the observation to a session.
    #[must_use]
    pub const fn for_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Adds a compromised value.
    #[must_use]
    pub fn compromising(mut self, value: impl Into<String>) -> Self {
        self.compromised.push(value.into());
        self
    }

    /// Sets notes.
    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// Raised strictness for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strictness {
    /// Will version the strictness applies to.
    pub will_version: u32,
    /// Drift events that raised it.
    pub reasons: Vec<Uuid>,
    /// First raise time.
    pub raised_at: DateTime<Utc>,
}

/// Per-principal strictness, shared by sessions and the monitor.
#[derive(Debug, Default)]
pub struct StrictnessRegistry {
    raised: RwLock<HashMap<PrincipalId, Strictness>>,
}

impl StrictnessRegistry {
    /// Rebuilds from the log: a principal stays strict while drift exists at its current Will version.
    #[must_use]
    pub fn rebuild_from(entries: &[LogEntry], anchor: &WillAnchor) -> Self {
        let registry = Self::default();
        for entry in entries {
            if let LogEntryBody::Drift(event) = &entry.body {
                let current = anchor.current(&entry.principal).map(|will| will.version);
                if current == Some(event.will_version) {
                    registry.raise(&entry.principal, event.will_version, event.id);
                }
            }
        }
        registry
    }

    /// Raises strictness. Repeated raises accumulate reasons.
    pub fn raise(&self, principal: &str, will_version: u32, reason: Uuid) {
        let mut raised = self.raised.write();
        let entry = raised.entry(principal.to_string()).or_insert_with(|| Strictness {
            will_version,
            reasons: Vec::new(),
            raised_at: Utc::now(),
        });
        if entry.will_version != will_version {
            entry.will_version = will_version;
            entry.reasons.clear();
        }
        if !entry.reasons.contains(&reason) {
            entry.reasons.push(reason);
        }
    }

    /// Clears strictness after a re-anchor.
    pub fn clear(&self, principal: &str) -> Option<Strictness> {
        self.raised.write().remove(principal)
    }

    /// Whether strictness is raised for the principal.
    #[must_use]
    pub fn is_raised(&self, principal: &str) -> bool {
        self.raised.read().contains_key(principal)
    }

    /// Current strictness, if raised.
    #[must_use]
    pub fn current(&self, principal: &str) -> Option<Strictness> {
        self.raised.read().get(principal).cloned()
    }
}

/// Scans decision history for drift and raises strictness.
#[derive(Debug)]
pub struct DriftMonitor {
    log: Arc<dyn AuditLog>,
    anchor: Arc<WillAnchor>,
    strictness: Arc<StrictnessRegistry>,
    telemetry: Option<LoopTelemetry>,
}

impl DriftMonitor {
    /// Creates a monitor over shared loop state.
    #[must_use]
    pub fn new(
        log: Arc<dyn AuditLog>,
        anchor: Arc<WillAnchor>,
        strictness: Arc<StrictnessRegistry>,
    ) -> Self {
        Self {
            log,
            anchor,
            strictness,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LoopTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Detects drift in a principal's entries against its current Will. Pure.
    #[must_use]
    pub fn detect(principal: &str, entries: &[LogEntry], will: &WillVector) -> Vec<DriftEvent> {
        let mut events = Vec::new();
        let principal_entries = || entries.iter().filter(|entry| entry.principal == principal);

        let mut last_status: HashMap<AssumptionId, (u64, AssumptionStatus)> = HashMap::new();
        for entry in principal_entries() {
            if let LogEntryBody::AssumptionStatus(event) = &entry.body {
                last_status.insert(event.assumption_id, (entry.seq, event.status));
            }
        }
        let mut invalidated: Vec<(AssumptionId, u64)> = last_status
            .into_iter()
            .filter(|(_, (_, status))| *status == AssumptionStatus::Invalidated)
            .map(|(id, (seq, _))| (id, seq))
            .collect();
        invalidated.sort_by_key(|(_, seq)| *seq);

        for (assumption_id, invalidated_at) in invalidated {
            let dependent: Vec<RecordId> = principal_entries()
                .filter(|entry| entry.seq < invalidated_at)
                .filter_map(|entry| match &entry.body {
                    LogEntryBody::Decision(record)
                        if record.will_ref.version == will.version
                            && record.depends_on(assumption_id) =>
                    {
                        Some(record.id)
                    }
                    _ => None,
                })
                .collect();
            if dependent.len() < will.drift_rules.min_dependent_records {
                continue;
            }
            let mut event = DriftEvent::new(
                principal,
                DriftKind::AssumptionInvalidated,
                assumption_id.to_string(),
                will.version,
                format!(
                    "assumption {assumption_id} was invalidated after {} records relied on it",
                    dependent.len()
                ),
            );
            event.assumption_id = Some(assumption_id);
            event.dependent_records = dependent;
            events.push(event);
        }

        if !will.drift_rules.watch_non_negotiables {
            return events;
        }
        let anchored_at = principal_entries()
            .filter(|entry| matches!(&entry.body, LogEntryBody::WillAnchored(anchored) if anchored.will.version == will.version))
            .map(|entry| entry.seq)
            .last()
            .unwrap_or(0);
        for entry in principal_entries().filter(|entry| entry.seq > anchored_at) {
            let LogEntryBody::Outcome(outcome) = &entry.body else {
                continue;
            };
            let hits: Vec<&str> = outcome
                .compromised
                .iter()
                .filter_map(|label| will.non_negotiable_matching(label))
                .collect();
            if hits.is_empty() {
                continue;
            }
            let record = outcome.session_id.and_then(|session_id| {
                principal_entries().find_map(|entry| match &entry.body {
                    LogEntryBody::Decision(record) if record.session_id == session_id => {
                        Some(record)
                    }
                    _ => None,
                })
            });
            let deviation = match record.and_then(|record| record.chosen_path.as_deref()) {
                Some(chosen) if chosen != outcome.action => {
                    format!(" instead of the chosen path `{chosen}`")
                }
                _ => String::new(),
            };
            let mut event = DriftEvent::new(
                principal,
                DriftKind::WillDivergence,
                outcome.id.to_string(),
                will.version,
                format!(
                    "executed `{}`{deviation} compromised non-negotiable {}",
                    outcome.action,
                    hits.join(", ")
                ),
            );
            event.dependent_records = record.map(|record| vec![record.id]).unwrap_or_default();
            events.push(event);
        }
        events
    }

    /// Scans one principal, appending and reporting only drift not already logged.
    pub fn scan_principal(&self, principal: &str) -> Result<Vec<DriftEvent>, LoopError> {
        let Some(will) = self.anchor.current(principal) else {
            return Ok(Vec::new());
        };
        let entries = self.log.for_principal(principal)?;
        let logged: HashSet<Uuid> = entries
            .iter()
            .filter_map(|entry| match &entry.body {
                LogEntryBody::Drift(event) => Some(event.id),
                _ => None,
            })
            .collect();
        let fresh: Vec<DriftEvent> = Self::detect(principal, &entries, &will)
            .into_iter()
            .filter(|event| !logged.contains(&event.id))
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        // a concurrent scan may have logged the same events since the snapshot
        let fresh: Vec<DriftEvent> = self
            .log
            .append_batch(principal, fresh.into_iter().map(LogEntryBody::Drift).collect())?
            .into_iter()
            .filter_map(|entry| match entry.body {
                LogEntryBody::Drift(event) => Some(event),
                _ => None,
            })
            .collect();
        if fresh.is_empty() {
            return Ok(fresh);
        }
        for event in &fresh {
            self.strictness.raise(principal, event.will_version, event.id);
            warn!(principal, kind = %event.kind, key = %event.key, "drift detected");
            if let Some(tel) = &self.telemetry {
                let _ = tel.log(
                    LogLevel::Warn,
                    "loop.drift.detected",
                    json!({
                        "principal": principal,
                        "kind": event.kind,
                        "description": event.description,
                        "dependent_records": event.dependent_records.len(),
                    }),
                );
                let _ = tel.event(principal, "loop.drift.detected", json!(event));
            }
        }
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(
                principal,
                "loop.will.reanchor_requested",
                json!({ "will_version": will.version, "drift": fresh.len() }),
            );
        }
        Ok(fresh)
    }

    /// Scans every anchored principal.
    pub fn scan_all(&self) -> Result<Vec<DriftEvent>, LoopError> {
        let mut events = Vec::new();
        for principal in self.anchor.principals() {
            events.extend(self.scan_principal(&principal)?);
        }
        Ok(events)
    }

    /// Runs `scan_all` on a fixed period off the async workers.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let monitor = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || monitor.scan_all()).await {
                    Ok(Ok(events)) => debug!(detected = events.len(), "drift pass complete"),
                    Ok(Err(err)) => warn!(error = %err, "drift pass failed"),
                    Err(err) => warn!(error = %err, "drift pass panicked"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifacts::{content_id, AssumptionDigest, DecisionRecord, DecisionStatus},
        session::Stage,
        store::{AssumptionEvent, MemoryAuditLog},
        will::WillDraft,
    };

    fn record(will: &WillVector, assumption: AssumptionId, chosen: &str) -> DecisionRecord {
        DecisionRecord {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            principal: will.principal.clone(),
            will_ref: will.reference(),
            decision_status: DecisionStatus::Proceed,
            refusal_check: false,
            refusal: None,
            assumptions_ref: None,
            falsifiers_ref: None,
            scenario_ref: None,
            playbook_ref: None,
            assumptions: vec![AssumptionDigest {
                id: assumption,
                name: "A1".into(),
                status: AssumptionStatus::Active,
            }],
            falsifiers: Vec::new(),
            scenario_tags: None,
            rationale: "all gates passed".into(),
            information_request: Vec::new(),
            chosen_path: Some(chosen.into()),
            stages_run: vec![Stage::ContextBoundary, Stage::DecisionRecorder],
            claim_bearing: false,
            recorded_at: Utc::now(),
        }
    }

    fn invalidate(log: &dyn AuditLog, id: AssumptionId) {
        log.append(
            "acme",
            LogEntryBody::AssumptionStatus(AssumptionEvent {
                assumption_id: id,
                status: AssumptionStatus::Invalidated,
                evidence: "funding round cancelled".into(),
            }),
        )
        .unwrap();
    }

    fn setup() -> (Arc<dyn AuditLog>, Arc<WillAnchor>, Arc<StrictnessRegistry>, DriftMonitor) {
        let log: Arc<dyn AuditLog> = Arc::new(MemoryAuditLog::default());
        let anchor = Arc::new(WillAnchor::from_log(Arc::clone(&log)).unwrap());
        anchor
            .anchor(
                "acme",
                WillDraft::new("grow without debt").non_negotiable("customer privacy"),
                "ops",
            )
            .unwrap();
        let strictness = Arc::new(StrictnessRegistry::default());
        let monitor = DriftMonitor::new(Arc::clone(&log), Arc::clone(&anchor), Arc::clone(&strictness));
        (log, anchor, strictness, monitor)
    }

    #[test]
    fn invalidation_needs_enough_dependent_records() {
        let (log, anchor, _, _) = setup();
        let will = anchor.current("acme").unwrap();
        let assumption = content_id("assumption", "funding secured");
        log.append("acme", LogEntryBody::Decision(record(&will, assumption, "pilot")))
            .unwrap();
        invalidate(log.as_ref(), assumption);
        let entries = log.for_principal("acme").unwrap();
        assert!(DriftMonitor::detect("acme", &entries, &will).is_empty());

        log.append("acme", LogEntryBody::Decision(record(&will, assumption, "pilot")))
            .unwrap();
        let entries = log.for_principal("acme").unwrap();
        // the second record came after the invalidation and does not count
        assert!(DriftMonitor::detect("acme", &entries, &will).is_empty());

        invalidate(log.as_ref(), assumption);
        let entries = log.for_principal("acme").unwrap();
        let events = DriftMonitor::detect("acme", &entries, &will);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DriftKind::AssumptionInvalidated);
        assert_eq!(events[0].dependent_records.len(), 2);
    }

    #[test]
    fn scan_dedups_raises_and_reanchor_resets() {
        let (log, anchor, strictness, monitor) = setup();
        let will = anchor.current("acme").unwrap();
        let assumption = content_id("assumption", "funding secured");
        for _ in 0..2 {
            log.append("acme", LogEntryBody::Decision(record(&will, assumption, "pilot")))
                .unwrap();
        }
        invalidate(log.as_ref(), assumption);

        assert_eq!(monitor.scan_principal("acme").unwrap().len(), 1);
        assert!(strictness.is_raised("acme"));
        assert!(monitor.scan_all().unwrap().is_empty());

        let rebuilt = StrictnessRegistry::rebuild_from(&log.snapshot().unwrap(), &anchor);
        assert!(rebuilt.is_raised("acme"));

        anchor
            .reanchor("acme", WillDraft::new("grow without debt"), "ops", "funding assumption gone")
            .unwrap();
        strictness.clear("acme");
        assert!(monitor.scan_principal("acme").unwrap().is_empty());
        let rebuilt = StrictnessRegistry::rebuild_from(&log.snapshot().unwrap(), &anchor);
        assert!(!rebuilt.is_raised("acme"));
    }

    #[test]
    fn concurrent_scans_log_each_drift_once() {
        let (log, anchor, strictness, monitor) = setup();
        let will = anchor.current("acme").unwrap();
        let assumption = content_id("assumption", "funding secured");
        for _ in 0..2 {
            log.append("acme", LogEntryBody::Decision(record(&will, assumption, "pilot")))
                .unwrap();
        }
        invalidate(log.as_ref(), assumption);

        let reported: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| monitor.scan_principal("acme").unwrap().len()))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).sum()
        });
        assert_eq!(reported, 1);
        assert_eq!(log.kind_counts("acme").unwrap()["drift"], 1);
        assert_eq!(strictness.current("acme").unwrap().reasons.len(), 1);
    }

    #[test]
    fn outcome_compromising_non_negotiable_is_divergence() {
        let (log, anchor, strictness, monitor) = setup();
        let will = anchor.current("acme").unwrap();
        let prior = record(&will, content_id("assumption", "demand exists"), "pilot launch");
        let session_id = prior.session_id;
        log.append("acme", LogEntryBody::Decision(prior)).unwrap();
        log.append(
            "acme",
            LogEntryBody::Outcome(
                OutcomeObservation::new("acme", "sell customer data")
                    .for_session(session_id)
                    .compromising("Customer Privacy"),
            ),
        )
        .unwrap();

        let events = monitor.scan_principal("acme").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DriftKind::WillDivergence);
        assert!(events[0].description.contains("pilot launch"));
        assert_eq!(strictness.current("acme").unwrap().reasons, vec![events[0].id]);
    }
}
