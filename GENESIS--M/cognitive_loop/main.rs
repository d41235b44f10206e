use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use serde_json::{json, Value};
use shared_logging::LogLevel;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{
    artifacts::{AssumptionId, AssumptionStatus, DecisionRecord, LedgerError, WeakSignal},
    config::LoopConfig,
    drift::{DriftEvent, DriftMonitor, OutcomeObservation, StrictnessRegistry},
    error::LoopError,
    gates::{
        falsifier::FalsifierInputs,
        is_future_oriented,
        options::{build_playbook, PlaybookInputs},
        scenario::FramingInputs,
        ContextBoundaryValidator, FalsifierEngine, KnowledgeGate, OptionMapper, ScenarioFramer,
    },
    reasoner::{parse_draft, Reasoner, ReasonerError},
    recorder::DecisionRecorder,
    refusal::{ReasonCode, WaitRequest},
    session::{DecisionRequest, Halt, Session, Stage},
    store::{AssumptionEvent, AuditLog, LogEntry, LogEntryBody, MemoryAuditLog},
    telemetry::LoopTelemetry,
    will::{WillAnchor, WillDraft, WillVector},
};

/// Closed session and its terminal record.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// The record written to the audit log.
    pub record: DecisionRecord,
    /// Session state at close.
    pub session: Session,
}

/// Principal history read once per session, before the gates run.
struct History {
    statuses: HashMap<AssumptionId, AssumptionStatus>,
    strict: bool,
    signals: Vec<WeakSignal>,
}

/// Builder for [`CognitiveLoop`].
pub struct CognitiveLoopBuilder {
    reasoner: Arc<dyn Reasoner>,
    config: LoopConfig,
    audit_log: Option<Arc<dyn AuditLog>>,
    telemetry: Option<LoopTelemetry>,
}

impl CognitiveLoopBuilder {
    /// Sets thresholds.
    #[must_use]
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the audit log. Defaults to an in-memory log.
    #[must_use]
    pub fn audit_log(mut self, log: Arc<dyn AuditLog>) -> Self {
        self.audit_log = Some(log);
        self
    }

    /// Sets telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: LoopTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Validates the config and restores Wills and strictness from the log.
    pub fn build(self) -> Result<CognitiveLoop> {
        self.config.validate()?;
        let log: Arc<dyn AuditLog> = match self.audit_log {
            Some(log) => log,
            None => Arc::new(MemoryAuditLog::default()),
        };
        if let (Some(bytes), Some(tel)) = (log.discarded_tail(), &self.telemetry) {
            let _ = tel.log(
                LogLevel::Warn,
                "loop.audit.torn_tail_discarded",
                json!({ "bytes": bytes }),
            );
        }
        let anchor = Arc::new(WillAnchor::from_log(Arc::clone(&log))?);
        let strictness = Arc::new(StrictnessRegistry::rebuild_from(&log.snapshot()?, &anchor));

        let mut recorder = DecisionRecorder::new(Arc::clone(&log), self.config.storage_retry);
        let mut drift = DriftMonitor::new(Arc::clone(&log), Arc::clone(&anchor), Arc::clone(&strictness));
        if let Some(tel) = &self.telemetry {
            recorder = recorder.with_telemetry(tel.clone());
            drift = drift.with_telemetry(tel.clone());
        }

        Ok(CognitiveLoop {
            reasoner: self.reasoner,
            boundary: ContextBoundaryValidator,
            knowledge: KnowledgeGate::new(self.config.clone()),
            falsifier: FalsifierEngine,
            framer: ScenarioFramer::new(self.config.clone()),
            mapper: OptionMapper::new(self.config.downside_ceiling),
            recorder,
            drift: Arc::new(drift),
            anchor,
            strictness,
            log,
            telemetry: self.telemetry,
            config: self.config,
        })
    }
}

/// Runs requests through the gates and owns the principal-scoped state
/// (Will anchor, strictness, audit log) shared by every session.
pub struct CognitiveLoop {
    reasoner: Arc<dyn Reasoner>,
    boundary: ContextBoundaryValidator,
    knowledge: KnowledgeGate,
    falsifier: FalsifierEngine,
    framer: ScenarioFramer,
    mapper: OptionMapper,
    recorder: DecisionRecorder,
    drift: Arc<DriftMonitor>,
    anchor: Arc<WillAnchor>,
    strictness: Arc<StrictnessRegistry>,
    log: Arc<dyn AuditLog>,
    telemetry: Option<LoopTelemetry>,
    config: LoopConfig,
}

impl CognitiveLoop {
    /// Returns a builder around a reasoner.
    #[must_use]
    pub fn builder(reasoner: Arc<dyn Reasoner>) -> CognitiveLoopBuilder {
        CognitiveLoopBuilder {
            reasoner,
            config: LoopConfig::default(),
            audit_log: None,
            telemetry: None,
        }
    }

    /// Anchors a principal's first Will.
    pub fn anchor(
        &self,
        principal: &str,
        draft: WillDraft,
        operator: &str,
    ) -> Result<Arc<WillVector>, LoopError> {
        let will = self.anchor.anchor(principal, draft, operator)?;
        self.log(
            LogLevel::Info,
            "loop.will.anchored",
            json!({ "principal": principal, "version": will.version, "operator": operator }),
        );
        Ok(will)
    }

    /// Re-anchors a principal's Will and clears raised strictness.
    pub fn reanchor(
        &self,
        principal: &str,
        draft: WillDraft,
        operator: &str,
        reason: &str,
    ) -> Result<Arc<WillVector>, LoopError> {
        let will = self.anchor.reanchor(principal, draft, operator, reason)?;
        let cleared = self.strictness.clear(principal).is_some();
        self.log(
            LogLevel::Info,
            "loop.will.reanchored",
            json!({
                "principal": principal,
                "version": will.version,
                "operator": operator,
                "reason": reason,
                "strictness_cleared": cleared,
            }),
        );
        self.event(principal, "loop.will.reanchored", json!({ "version": will.version }));
        Ok(will)
    }

    /// Current Will of a principal.
    #[must_use]
    pub fn will(&self, principal: &str) -> Option<Arc<WillVector>> {
        self.anchor.current(principal)
    }

    /// Whether drift has raised the principal's strictness.
    #[must_use]
    pub fn is_strict(&self, principal: &str) -> bool {
        self.strictness.is_raised(principal)
    }

    /// The audit log.
    #[must_use]
    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.log
    }

    /// Active thresholds.
    #[must_use]
    pub const fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Runs one request to a terminal record. Gate exits are records, not errors;
    /// only a missing Will or an unpersistable record fail the call.
    pub async fn run(&self, request: DecisionRequest) -> Result<SessionOutcome, LoopError> {
        let will = self
            .anchor
            .current(&request.principal)
            .ok_or_else(|| LoopError::WillNotAnchored(request.principal.clone()))?;
        if let Err(err) = self.drift.scan_principal(&request.principal) {
            warn!(principal = %request.principal, error = %err, "inline drift scan failed");
        }

        let mut session = Session::open(request, will);
        let history = History {
            statuses: self.log.assumption_statuses(&session.principal)?,
            strict: self.strictness.is_raised(&session.principal),
            signals: self.log.active_signals(&session.principal)?,
        };
        if let Err(halt) = self.evaluate(&mut session, &history).await {
            self.log(
                LogLevel::Info,
                "loop.session.halted",
                json!({ "session_id": session.id, "gate": halt.gate(), "halt": halt }),
            );
            session.halt = Some(halt);
        }
        let record = self.recorder.record(&mut session).await?;
        Ok(SessionOutcome { record, session })
    }

    async fn evaluate(&self, session: &mut Session, history: &History) -> Result<(), Halt> {
        session.enter(Stage::ContextBoundary);
        let boundary = self.boundary.validate(&session.request).into_result()?;
        session.boundary = Some(boundary.clone());

        session.enter(Stage::KnowledgeSufficiency);
        let timeout = self.config.reasoner_timeout();
        let draft = match tokio::time::timeout(
            timeout,
            self.reasoner.elicit(&session.request.request_text, &boundary),
        )
        .await
        {
            Ok(reply) => reply,
            Err(_) => Err(ReasonerError::Timeout(timeout)),
        }
        .and_then(|text| parse_draft(&text));
        if let Err(err) = &draft {
            self.log(
                LogLevel::Warn,
                "loop.reasoner.failed",
                json!({ "session_id": session.id, "reasoner": self.reasoner.name(), "error": err.to_string() }),
            );
        }
        let knowledge = self
            .knowledge
            .assess(
                &session.request,
                &boundary,
                &draft,
                &history.statuses,
                history.strict,
                &mut session.ledger,
            )
            .into_result()?;
        session.output(Stage::KnowledgeSufficiency, session.ledger.id);
        session.knowledge = Some(knowledge.clone());
        let draft = draft.unwrap_or_default();

        session.enter(Stage::Falsifier);
        let mut actions = session.request.candidate_actions.clone();
        for action in &draft.actions {
            if !actions.iter().any(|known| known.name == action.name) {
                actions.push(action.clone());
            }
        }
        session.actions.clone_from(&actions);
        let falsifiers = self
            .falsifier
            .run(FalsifierInputs {
                claims: &knowledge.claims,
                ledger: &session.ledger,
                candidates: &draft.falsifiers,
                actions: &actions,
                will: &session.will,
                claim_bearing: session.is_claim_bearing(),
            })
            .into_result()?;
        session.output(Stage::Falsifier, falsifiers.id);
        session.falsifiers = Some(falsifiers.clone());

        if is_future_oriented(&boundary) {
            session.enter(Stage::ScenarioFramer);
            let framed = self
                .framer
                .frame(FramingInputs {
                    session_id: session.id,
                    principal: &session.principal,
                    request_text: &session.request.request_text,
                    knowledge: &knowledge,
                    ledger: &session.ledger,
                    falsifiers: &falsifiers,
                    hints: &draft.scenarios,
                    signals: &draft.signals,
                    prior_signals: &history.signals,
                })
                .into_result()?;
            session.output(Stage::ScenarioFramer, framed.pack.id);
            session.scenarios = Some(framed.pack);
            session.pending_signals = framed.signals;
        }

        session.enter(Stage::OptionMapper);
        let options = self
            .mapper
            .map(&boundary, &actions, session.scenarios.as_ref(), &session.will)
            .into_result()?;
        session.options = Some(options.clone());

        if let (true, Some(pack), Some(_)) = (boundary.strategic, &session.scenarios, &options.selected) {
            let playbook = build_playbook(PlaybookInputs {
                session_id: session.id,
                boundary: &boundary,
                options: &options,
                actions: &actions,
                pack,
                falsifiers: &falsifiers,
                objectives: &draft.objectives,
                success_metrics: &draft.success_metrics,
            });
            let untraceable = |detail: String| {
                Halt::Wait(WaitRequest::new(
                    Stage::OptionMapper,
                    ReasonCode::NoCandidateActions,
                    detail,
                    vec!["candidate actions tied to the framed scenarios and their falsifiers".into()],
                ))
            };
            let Some(playbook) = playbook else {
                return Err(untraceable(
                    "no admissible action traces to both a falsifier and a scenario".into(),
                ));
            };
            if let Err(violation) = playbook.validate(Some(&falsifiers)) {
                return Err(untraceable(violation.reason));
            }
            session.output(Stage::OptionMapper, playbook.id);
            session.playbook = Some(playbook);
        }
        session.draft = Some(draft);
        Ok(())
    }

    /// Records a status change for an assumption the principal's history references.
    pub fn observe_assumption(
        &self,
        principal: &str,
        assumption_id: AssumptionId,
        status: AssumptionStatus,
        evidence: &str,
    ) -> Result<LogEntry, LoopError> {
        let known = self
            .log
            .by_assumption(assumption_id)?
            .iter()
            .any(|entry| entry.principal == principal);
        if !known {
            return Err(LedgerError::UnknownAssumption(assumption_id).into());
        }
        let current = self
            .log
            .assumption_statuses(principal)?
            .get(&assumption_id)
            .copied()
            .unwrap_or(AssumptionStatus::Active);
        if !current.can_transition_to(status) {
            return Err(LedgerError::IllegalTransition {
                id: assumption_id,
                from: current,
                to: status,
            }
            .into());
        }
        let entry = self.log.append(
            principal,
            LogEntryBody::AssumptionStatus(AssumptionEvent {
                assumption_id,
                status,
                evidence: evidence.to_string(),
            }),
        )?;
        self.log(
            LogLevel::Info,
            "loop.assumption.status_changed",
            json!({ "principal": principal, "assumption_id": assumption_id, "from": current, "to": status }),
        );
        Ok(entry)
    }

    /// Records an executed action's outcome and scans the principal for drift.
    pub fn observe_outcome(
        &self,
        observation: OutcomeObservation,
    ) -> Result<Vec<DriftEvent>, LoopError> {
        let principal = observation.principal.clone();
        if self.anchor.current(&principal).is_none() {
            return Err(LoopError::WillNotAnchored(principal));
        }
        self.log.append(&principal, LogEntryBody::Outcome(observation))?;
        self.drift.scan_principal(&principal)
    }

    /// Scans every anchored principal for drift now.
    pub fn scan_drift(&self) -> Result<Vec<DriftEvent>, LoopError> {
        self.drift.scan_all()
    }

    /// Starts the periodic drift pass on the current runtime.
    #[must_use]
    pub fn spawn_drift_pass(&self) -> JoinHandle<()> {
        Arc::clone(&self.drift).spawn_periodic(self.config.drift_interval())
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }

    fn event(&self, principal: &str, event_type: &str, payload: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.event(principal, event_type, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        artifacts::{content_id, DecisionStatus, Horizon, ScenarioType},
        gates::CandidateAction,
        reasoner::StaticReasoner,
        refusal::RefusalFamily,
        session::SessionStatus,
        store::JsonlAuditLog,
    };
    use futures::future::join_all;
    use tempfile::tempdir;

    const GROUNDED_REPLY: &str = r#"Analysis follows.
{"facts": ["regional demand grew 4% last year"],
 "unknowns": [{"statement": "competitor pricing", "critical": false},
              {"statement": "channel cost", "critical": false}],
 "falsifiers": [{"condition": "Competitor announces Spanish launch",
                 "assumption": "no new competitor", "severity": "high"}]}"#;

    const MARKET_ENTRY_REPLY: &str = r#"{"facts": ["regional demand grew 4% last year"],
 "unknowns": [{"statement": "competitor pricing", "critical": false}],
 "falsifiers": [{"condition": "Competitor announces Spanish launch",
                 "assumption": "no new competitor", "severity": "high"}],
 "actions": [{"name": "pilot in one region", "owner": "growth lead",
              "addresses": ["no new competitor"]}]}"#;

    fn build(reasoner: StaticReasoner) -> CognitiveLoop {
        let engine = CognitiveLoop::builder(Arc::new(reasoner)).build().unwrap();
        engine
            .anchor("acme", WillDraft::new("grow without debt").non_negotiable("customer privacy"), "ops")
            .unwrap();
        engine
    }

    fn market_entry(principal: &str) -> DecisionRequest {
        DecisionRequest::new(
            principal,
            "Plan market entry into Spain within 24 months, assume funding secured, assume no new competitor",
        )
        .scope("Spanish retail")
        .constraint("no new debt")
        .stakeholder("board")
        .stakeholder("regional staff")
        .candidate(
            CandidateAction::new("pilot in Madrid", "growth lead")
                .outcome(ScenarioType::Downside, -0.2, 0.1)
                .outcome(ScenarioType::Wildcard, -0.3, 0.2)
                .addresses("no new competitor"),
        )
    }

    fn price_probe() -> DecisionRequest {
        DecisionRequest::new("acme", "Should we raise prices by 5% within 6 months? assume steady demand")
            .scope("domestic catalogue")
            .constraint("keep churn flat")
            .stakeholder("customers")
    }

    #[tokio::test]
    async fn prediction_without_data_is_refused() {
        let engine = build(StaticReasoner::replying("UNKNOWN: adoption rate\nUNKNOWN: competitor response"));
        let outcome = engine
            .run(
                DecisionRequest::new("acme", "Will this product succeed in 12 months?")
                    .scope("new product line")
                    .constraint("current budget")
                    .stakeholder("board"),
            )
            .await
            .unwrap();
        let record = outcome.record;
        assert_eq!(record.decision_status, DecisionStatus::Refuse);
        let refusal = record.refusal.clone().unwrap();
        assert_eq!(refusal.family, RefusalFamily::Epistemic);
        assert_eq!(refusal.code, ReasonCode::InsufficientGrounding);
        assert!(record.refusal_check);
        assert_eq!(
            record.stages_run,
            vec![Stage::ContextBoundary, Stage::KnowledgeSufficiency, Stage::DecisionRecorder]
        );
        assert!(record.validate().is_ok());
    }

    #[tokio::test]
    async fn market_entry_produces_traceable_plan() {
        let engine = build(StaticReasoner::replying(GROUNDED_REPLY));
        let outcome = engine.run(market_entry("acme")).await.unwrap();
        let record = &outcome.record;
        assert_eq!(record.decision_status, DecisionStatus::Proceed, "{}", record.rationale);
        assert_eq!(record.assumptions.len(), 2);
        assert!(record.falsifiers.len() >= 2);
        assert!(record.has_scenario(ScenarioType::Base));
        assert_eq!(record.chosen_path.as_deref(), Some("pilot in Madrid"));

        let session = &outcome.session;
        let set = session.falsifiers.as_ref().unwrap();
        let playbook = session.playbook.as_ref().unwrap();
        assert!(playbook.validate(Some(set)).is_ok());
        for action in &playbook.actions {
            assert!(action.falsifier_refs.iter().all(|id| set.contains(*id)));
            assert!(!action.scenario_refs.is_empty());
        }
        let stored = engine.audit_log().artifact(record.playbook_ref.unwrap()).unwrap();
        assert!(stored.is_some());
        assert_eq!(session.status, SessionStatus::Proceed);
    }

    #[tokio::test]
    async fn plain_market_entry_request_proceeds_on_default_bounds() {
        let engine = build(StaticReasoner::replying(MARKET_ENTRY_REPLY));
        let request = DecisionRequest::new(
            "acme",
            "Plan market entry for H2, assume funding secured, assume no new competitor",
        )
        .scope("Spanish retail")
        .constraint("no new debt")
        .stakeholder("board");
        let outcome = engine.run(request).await.unwrap();
        let record = &outcome.record;
        assert_eq!(record.decision_status, DecisionStatus::Proceed, "{}", record.rationale);
        assert_eq!(record.chosen_path.as_deref(), Some("pilot in one region"));

        let session = &outcome.session;
        assert_eq!(session.boundary.as_ref().unwrap().horizon, Horizon::H2);
        assert_eq!(session.ledger.load_bearing().count(), 2);
        assert!(session
            .ledger
            .entries
            .iter()
            .all(|entry| entry.status == AssumptionStatus::Active));
        let set = session.falsifiers.as_ref().unwrap();
        assert!(set.len() >= 2);
        assert!(record.has_scenario(ScenarioType::Base));
        assert!(session.scenarios.as_ref().unwrap().scenarios.len() >= 2);
        let playbook = session.playbook.as_ref().unwrap();
        assert!(!playbook.actions.is_empty());
        for action in &playbook.actions {
            assert!(!action.falsifier_refs.is_empty());
            assert!(action.falsifier_refs.iter().all(|id| set.contains(*id)));
        }
    }

    #[tokio::test]
    async fn reasoner_proposed_action_needs_falsifiers() {
        let engine = build(StaticReasoner::replying(
            r#"{"facts": ["backlog grew 30% this quarter"], "actions": [{"name": "hire contractor"}]}"#,
        ));
        let outcome = engine
            .run(
                DecisionRequest::new("acme", "Should we hire a contractor by tomorrow?")
                    .scope("delivery team")
                    .constraint("current budget")
                    .stakeholder("engineering"),
            )
            .await
            .unwrap();
        assert!(outcome.session.request.candidate_actions.is_empty());
        assert!(outcome.session.is_claim_bearing());
        let record = outcome.record;
        assert_eq!(record.decision_status, DecisionStatus::Refuse, "{}", record.rationale);
        let refusal = record.refusal.clone().unwrap();
        assert_eq!(refusal.code, ReasonCode::UnfalsifiableClaim);
        assert_eq!(refusal.gate, Stage::Falsifier);
        assert!(record.chosen_path.is_none());
        assert!(record.validate().is_ok());
    }

    #[tokio::test]
    async fn missing_horizon_stops_at_the_boundary() {
        let engine = build(StaticReasoner::failing(ReasonerError::Unavailable("unused".into())));
        let outcome = engine
            .run(
                DecisionRequest::new("acme", "Should we open a second warehouse?")
                    .scope("logistics")
                    .constraint("capex")
                    .stakeholder("operations"),
            )
            .await
            .unwrap();
        let record = outcome.record;
        assert_eq!(record.decision_status, DecisionStatus::Refuse);
        assert_eq!(record.stages_run, vec![Stage::ContextBoundary, Stage::DecisionRecorder]);
        let refusal = record.refusal.unwrap();
        assert_eq!(refusal.gate, Stage::ContextBoundary);
        assert_eq!(refusal.family, RefusalFamily::Structural);
        assert_eq!(refusal.code, ReasonCode::MissingHorizon);
    }

    #[tokio::test]
    async fn missing_stakeholders_stop_at_the_boundary() {
        let engine = build(StaticReasoner::failing(ReasonerError::Unavailable("unused".into())));
        let outcome = engine
            .run(DecisionRequest::new("acme", "Expand to Brazil in 2 years").scope("LATAM").constraint("capex"))
            .await
            .unwrap();
        let record = outcome.record;
        assert_eq!(record.stages_run, vec![Stage::ContextBoundary, Stage::DecisionRecorder]);
        let refusal = record.refusal.unwrap();
        assert_eq!(refusal.family, RefusalFamily::Structural);
        assert_eq!(refusal.code, ReasonCode::UndefinedStakeholders);
        assert!(record.assumptions_ref.is_none());
    }

    #[tokio::test]
    async fn reasoner_timeout_and_malformed_output_are_grounding_refusals() {
        let config = LoopConfig {
            reasoner_timeout_ms: 20,
            ..LoopConfig::default()
        };
        let slow = CognitiveLoop::builder(Arc::new(
            StaticReasoner::replying(GROUNDED_REPLY).with_delay(Duration::from_millis(500)),
        ))
        .config(config)
        .build()
        .unwrap();
        slow.anchor("acme", WillDraft::new("grow without debt"), "ops").unwrap();
        let record = slow.run(price_probe()).await.unwrap().record;
        assert_eq!(record.refusal.unwrap().code, ReasonCode::InsufficientGrounding);
        assert!(record.rationale.contains("timed out"));

        let garbled = build(StaticReasoner::replying("I would rather not say."));
        let record = garbled.run(price_probe()).await.unwrap().record;
        assert_eq!(record.refusal.unwrap().code, ReasonCode::InsufficientGrounding);
        assert!(record.rationale.contains("malformed"));
    }

    #[tokio::test]
    async fn drift_tightens_tolerance_until_reanchor() {
        let engine = build(StaticReasoner::replying(GROUNDED_REPLY));
        let baseline = engine.run(price_probe()).await.unwrap();
        assert_eq!(baseline.record.decision_status, DecisionStatus::Proceed, "{}", baseline.record.rationale);
        assert_eq!(baseline.session.knowledge.as_ref().unwrap().tolerance, 2);

        for _ in 0..2 {
            let outcome = engine.run(market_entry("acme")).await.unwrap();
            assert_eq!(outcome.record.decision_status, DecisionStatus::Proceed);
        }
        let funding = content_id("assumption", "funding secured");
        engine
            .observe_assumption("acme", funding, AssumptionStatus::Invalidated, "round cancelled")
            .unwrap();
        let err = engine
            .observe_assumption("acme", funding, AssumptionStatus::Weakened, "second look")
            .unwrap_err();
        assert!(matches!(err, LoopError::Ledger(LedgerError::IllegalTransition { .. })));

        let events = engine.scan_drift().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].dependent_records.len(), 2);
        assert!(engine.is_strict("acme"));

        let strict = engine.run(price_probe()).await.unwrap();
        assert_eq!(strict.record.decision_status, DecisionStatus::Wait);
        assert!(!strict.record.information_request.is_empty());
        assert_eq!(strict.record.refusal.unwrap().gate, Stage::KnowledgeSufficiency);

        engine
            .reanchor("acme", WillDraft::new("grow without debt"), "ops", "funding assumption retired")
            .unwrap();
        assert!(!engine.is_strict("acme"));
        let relaxed = engine.run(price_probe()).await.unwrap();
        assert_eq!(relaxed.record.decision_status, DecisionStatus::Proceed);
        assert_eq!(relaxed.record.will_ref.version, 2);
    }

    #[tokio::test]
    async fn concurrent_sessions_share_the_log_without_interference() {
        let engine = build(StaticReasoner::replying(GROUNDED_REPLY));
        engine.anchor("globex", WillDraft::new("serve regulated markets"), "ops").unwrap();
        let requests = (0..8).map(|idx| {
            let principal = if idx % 2 == 0 { "acme" } else { "globex" };
            engine.run(market_entry(principal))
        });
        let outcomes: Vec<_> = join_all(requests).await.into_iter().map(Result::unwrap).collect();
        let mut sessions: Vec<_> = outcomes.iter().map(|outcome| outcome.record.session_id).collect();
        sessions.sort();
        sessions.dedup();
        assert_eq!(sessions.len(), 8);
        assert_eq!(engine.audit_log().records("acme").unwrap().len(), 4);
        assert_eq!(engine.audit_log().records("globex").unwrap().len(), 4);
        assert!(outcomes.iter().all(|outcome| outcome.record.validate().is_ok()));
    }

    #[tokio::test]
    async fn recording_again_is_idempotent() {
        let engine = build(StaticReasoner::replying(GROUNDED_REPLY));
        let mut outcome = engine.run(market_entry("acme")).await.unwrap();
        let again = engine.recorder.record(&mut outcome.session).await.unwrap();
        assert_eq!(outcome.record.canonical_json(), again.canonical_json());
        assert_eq!(engine.audit_log().records("acme").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unanchored_principal_is_an_error_not_a_refusal() {
        let engine = build(StaticReasoner::replying(GROUNDED_REPLY));
        let err = engine.run(market_entry("initech")).await.unwrap_err();
        assert!(matches!(err, LoopError::WillNotAnchored(principal) if principal == "initech"));
    }

    #[tokio::test]
    async fn file_backed_state_survives_restart() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        {
            let log: Arc<dyn AuditLog> = Arc::new(JsonlAuditLog::open(&path).unwrap());
            let engine = CognitiveLoop::builder(Arc::new(StaticReasoner::replying(GROUNDED_REPLY)))
                .audit_log(log)
                .build()
                .unwrap();
            engine.anchor("acme", WillDraft::new("grow without debt"), "ops").unwrap();
            engine.run(market_entry("acme")).await.unwrap();
        }
        let log: Arc<dyn AuditLog> = Arc::new(JsonlAuditLog::open(&path).unwrap());
        let engine = CognitiveLoop::builder(Arc::new(StaticReasoner::replying(GROUNDED_REPLY)))
            .audit_log(log)
            .build()
            .unwrap();
        assert_eq!(engine.will("acme").unwrap().version, 1);
        assert_eq!(engine.audit_log().records("acme").unwrap().len(), 1);
    }
}
