//! Terminal stage: assembles the decision record and commits the session.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use tracing::warn;
use uuid::Uuid;

use crate::{
    artifacts::{
        AssumptionDigest, DecisionRecord, DecisionStatus, FalsifierDigest, RefusalSummary,
    },
    error::LoopError,
    refusal::{ReasonCode, Refusal},
    session::{Halt, Session, SessionStatus, Stage},
    store::{AuditLog, LogEntryBody, StoreError, StoredArtifact},
    telemetry::LoopTelemetry,
};

/// Exponential backoff for audit log writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.max_delay_ms);
        let jitter = if capped > 1 { rng.gen_range(0..=capped / 2) } else { 0 };
        Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms))
    }
}

/// Writes exactly one record per session.
#[derive(Debug, Clone)]
pub struct DecisionRecorder {
    log: Arc<dyn AuditLog>,
    retry: RetryPolicy,
    telemetry: Option<LoopTelemetry>,
}

impl DecisionRecorder {
    /// Creates a recorder over a log.
    #[must_use]
    pub fn new(log: Arc<dyn AuditLog>, retry: RetryPolicy) -> Self {
        Self {
            log,
            retry,
            telemetry: None,
        }
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: LoopTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Assembles the record from whatever artifacts the session holds.
    #[must_use]
    pub fn assemble(session: &Session) -> DecisionRecord {
        let claim_bearing = session.is_claim_bearing();
        let mut halt = session.halt.clone();
        let falsifiers_empty = session.falsifiers.as_ref().map_or(true, |set| set.is_empty());
        if halt.is_none() && claim_bearing && falsifiers_empty {
            halt = Some(Halt::Refuse(Refusal::new(
                Stage::Falsifier,
                ReasonCode::UnfalsifiableClaim,
                "claim-bearing request reached the recorder without falsifiers",
            )));
        }

        let mut stages_run = session.stages_run.clone();
        if stages_run.last() != Some(&Stage::DecisionRecorder) {
            stages_run.push(Stage::DecisionRecorder);
        }

        let (decision_status, refusal, rationale, information_request, chosen_path) = match &halt {
            Some(Halt::Refuse(refusal)) => (
                DecisionStatus::Refuse,
                Some(RefusalSummary {
                    gate: refusal.gate,
                    family: refusal.family(),
                    code: refusal.code,
                }),
                format!(
                    "refused at {}: {} ({})",
                    refusal.gate,
                    refusal.rationale,
                    refusal.code.label()
                ),
                Vec::new(),
                refusal.chosen_path.clone(),
            ),
            Some(Halt::Wait(wait)) => (
                DecisionStatus::Wait,
                Some(RefusalSummary {
                    gate: wait.gate,
                    family: wait.code.family(),
                    code: wait.code,
                }),
                format!("waiting at {}: {}", wait.gate, wait.rationale),
                wait.information_needed.clone(),
                None,
            ),
            None => {
                let selected = session
                    .options
                    .as_ref()
                    .and_then(|options| options.selected.clone());
                let rationale = match (&selected, session.options.as_ref()) {
                    (Some(name), Some(options)) => format!(
                        "all gates passed; `{name}` selected with regret bound {:.2}",
                        options.regret_bound.unwrap_or_default()
                    ),
                    _ => "all gates passed".to_string(),
                };
                (DecisionStatus::Proceed, None, rationale, Vec::new(), selected)
            }
        };

        DecisionRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            principal: session.principal.clone(),
            will_ref: session.will_ref(),
            decision_status,
            refusal_check: decision_status != DecisionStatus::Proceed,
            refusal,
            assumptions_ref: (!session.ledger.is_empty()).then_some(session.ledger.id),
            falsifiers_ref: session.falsifiers.as_ref().map(|set| set.id),
            scenario_ref: session.scenarios.as_ref().map(|pack| pack.id),
            playbook_ref: session.playbook.as_ref().map(|playbook| playbook.id),
            assumptions: session
                .ledger
                .entries
                .iter()
                .map(|entry| AssumptionDigest {
                    id: entry.id,
                    name: entry.name.clone(),
                    status: entry.status,
                })
                .collect(),
            falsifiers: session
                .falsifiers
                .as_ref()
                .map(|set| {
                    set.falsifiers
                        .iter()
                        .map(|falsifier| FalsifierDigest {
                            id: falsifier.id,
                            condition: falsifier.condition.clone(),
                            severity: falsifier.severity,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            scenario_tags: session.scenarios.as_ref().map(|pack| pack.tags()),
            rationale,
            information_request,
            chosen_path,
            stages_run,
            claim_bearing,
            recorded_at: Utc::now(),
        }
    }

    fn entries(session: &Session, record: &DecisionRecord) -> Vec<LogEntryBody> {
        let mut bodies = Vec::new();
        let artifact = |artifact| LogEntryBody::Artifact {
            session_id: session.id,
            artifact,
        };
        if !session.ledger.is_empty() {
            bodies.push(artifact(StoredArtifact::AssumptionLedger(session.ledger.clone())));
        }
        if let Some(set) = &session.falsifiers {
            bodies.push(artifact(StoredArtifact::FalsifierSet(set.clone())));
        }
        if let Some(pack) = &session.scenarios {
            bodies.push(artifact(StoredArtifact::ScenarioPack(pack.clone())));
        }
        if let Some(playbook) = &session.playbook {
            bodies.push(artifact(StoredArtifact::StrategyPlaybook(playbook.clone())));
        }
        bodies.extend(
            session
                .pending_signals
                .iter()
                .cloned()
                .map(LogEntryBody::WeakSignal),
        );
        bodies.push(LogEntryBody::Decision(record.clone()));
        bodies
    }

    fn close(session: &mut Session, record: DecisionRecord) -> DecisionRecord {
        session.enter(Stage::DecisionRecorder);
        session.output(Stage::DecisionRecorder, record.id);
        session.status = match record.decision_status {
            DecisionStatus::Proceed => SessionStatus::Proceed,
            DecisionStatus::Wait => SessionStatus::Wait,
            DecisionStatus::Refuse => SessionStatus::Refuse,
        };
        session.record = Some(record.clone());
        record
    }

    /// Commits the session. Re-invoking on a recorded session returns the stored record.
    pub async fn record(&self, session: &mut Session) -> Result<DecisionRecord, LoopError> {
        if let Some(record) = &session.record {
            return Ok(record.clone());
        }
        if let Some(existing) = self.log.record_for_session(session.id)? {
            return Ok(Self::close(session, existing));
        }

        let record = Self::assemble(session);
        let bodies = Self::entries(session, &record);
        let mut rng = SmallRng::from_entropy();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.log.append_batch(&session.principal, bodies.clone()) {
                Ok(_) => break,
                Err(StoreError::DuplicateRecord(id)) => {
                    let existing = self
                        .log
                        .record_for_session(session.id)?
                        .ok_or(StoreError::DuplicateRecord(id))?;
                    return Ok(Self::close(session, existing));
                }
                Err(err) if attempt >= self.retry.max_attempts => {
                    self.log_failure(session, attempt, &err);
                    return Err(LoopError::Storage {
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.retry.delay_for(attempt, &mut rng);
                    warn!(session = %session.id, attempt, ?delay, error = %err, "decision record write failed; retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if let Some(tel) = &self.telemetry {
            let _ = tel.session_log(
                LogLevel::Info,
                "loop.decision.recorded",
                &session.principal,
                session.id,
                json!({
                    "decision_status": record.decision_status,
                    "refusal": record.refusal,
                    "stages_run": record.stages_run,
                    "attempts": attempt,
                }),
            );
            let _ = tel.event(
                &session.principal,
                "loop.decision.recorded",
                json!({
                    "session_id": session.id,
                    "record_id": record.id,
                    "decision_status": record.decision_status,
                }),
            );
        }
        Ok(Self::close(session, record))
    }

    fn log_failure(&self, session: &Session, attempts: u32, err: &StoreError) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.session_log(
                LogLevel::Error,
                "loop.decision.write_failed",
                &session.principal,
                session.id,
                json!({ "attempts": attempts, "error": err.to_string() }),
            );
        }
    }
}
