use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    artifacts::{
        ArtifactId, AssumptionLedger, DecisionRecord, FalsifierSet, Horizon, PrincipalId,
        ScenarioPack, SessionId, StrategyPlaybook, WeakSignal,
    },
    gates::{Boundary, CandidateAction, KnowledgeAssessment, OptionMap},
    reasoner::ReasonerDraft,
    refusal::{Refusal, WaitRequest},
    will::{WillRef, WillVector},
};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Scope, horizon, constraints, stakeholders, intent.
    ContextBoundary,
    /// Facts, assumptions, unknowns.
    KnowledgeSufficiency,
    /// Counterexamples for claims and plans.
    Falsifier,
    /// Alternative futures.
    ScenarioFramer,
    /// Exposure and regret over candidate actions.
    OptionMapper,
    /// Terminal record.
    DecisionRecorder,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ContextBoundary => "context_boundary",
            Self::KnowledgeSufficiency => "knowledge_sufficiency",
            Self::Falsifier => "falsifier",
            Self::ScenarioFramer => "scenario_framer",
            Self::OptionMapper => "option_mapper",
            Self::DecisionRecorder => "decision_recorder",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Gates still running.
    Running,
    /// Closed with PROCEED.
    Proceed,
    /// Closed with WAIT.
    Wait,
    /// Closed with REFUSE.
    Refuse,
}

/// Incoming reasoning request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionRequest {
    /// Requesting principal.
    pub principal: PrincipalId,
    /// Free-form request.
    pub request_text: String,
    /// Explicit scope.
    pub scope: Option<String>,
    /// Explicit horizon.
    pub horizon: Option<Horizon>,
    /// Explicit constraints.
    pub constraints: Vec<String>,
    /// Explicit stakeholders.
    pub stakeholders: Vec<String>,
    /// Forces strategic handling on or off.
    pub strategic: Option<bool>,
    /// Caller-supplied candidate actions.
    pub candidate_actions: Vec<CandidateAction>,
}

impl DecisionRequest {
    /// Starts a request for a principal.
    #[must_use]
    pub fn new(principal: impl Into<PrincipalId>, request_text: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            request_text: request_text.into(),
            ..Self::default()
        }
    }

    /// Sets the scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the horizon.
    #[must_use]
    pub const fn horizon(mut self, horizon: Horizon) -> Self {
        self.horizon = Some(horizon);
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Adds a stakeholder.
    #[must_use]
    pub fn stakeholder(mut self, stakeholder: impl Into<String>) -> Self {
        self.stakeholders.push(stakeholder.into());
        self
    }

    /// Marks the request strategic.
    #[must_use]
    pub const fn strategic(mut self, strategic: bool) -> Self {
        self.strategic = Some(strategic);
        self
    }

    /// Adds a candidate action.
    #[must_use]
    pub fn candidate(mut self, action: CandidateAction) -> Self {
        self.candidate_actions.push(action);
        self
    }
}

/// Early exit raised by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Halt {
    /// More information needed.
    Wait(WaitRequest),
    /// Terminal refusal.
    Refuse(Refusal),
}

impl Halt {
    /// Gate that raised the halt.
    #[must_use]
    pub const fn gate(&self) -> Stage {
        match self {
            Self::Wait(wait) => wait.gate,
            Self::Refuse(refusal) => refusal.gate,
        }
    }
}

/// In-flight pipeline state. Owned by exactly one run.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Original request.
    pub request: DecisionRequest,
    /// Will snapshot the session runs against.
    pub will: Arc<WillVector>,
    /// Artifact ids produced per stage, in stage order.
    pub stage_outputs: IndexMap<Stage, ArtifactId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Stages entered so far.
    pub stages_run: Vec<Stage>,
    /// Normalized boundary.
    pub boundary: Option<Boundary>,
    /// Structured reasoner output.
    pub draft: Option<ReasonerDraft>,
    /// Knowledge assessment.
    pub knowledge: Option<KnowledgeAssessment>,
    /// Assumption ledger.
    pub ledger: AssumptionLedger,
    /// Falsifier set.
    pub falsifiers: Option<FalsifierSet>,
    /// Scenario pack.
    pub scenarios: Option<ScenarioPack>,
    /// Caller and reasoner candidate actions, merged by name.
    pub actions: Vec<CandidateAction>,
    /// Option map.
    pub options: Option<OptionMap>,
    /// Strategy playbook.
    pub playbook: Option<StrategyPlaybook>,
    /// Signals persisted with the record.
    pub pending_signals: Vec<WeakSignal>,
    /// First gate exit, if any.
    pub halt: Option<Halt>,
    /// Terminal record once written.
    pub record: Option<DecisionRecord>,
}

impl Session {
    /// Opens a session for a request under the given Will.
    #[must_use]
    pub fn open(request: DecisionRequest, will: Arc<WillVector>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            principal: request.principal.clone(),
            request,
            will,
            stage_outputs: IndexMap::new(),
            status: SessionStatus::Running,
            stages_run: Vec::new(),
            boundary: None,
            draft: None,
            knowledge: None,
            ledger: AssumptionLedger::new(id),
            falsifiers: None,
            scenarios: None,
            actions: Vec::new(),
            options: None,
            playbook: None,
            pending_signals: Vec::new(),
            halt: None,
            record: None,
        }
    }

    /// Marks a stage as entered. Stages never repeat.
    pub fn enter(&mut self, stage: Stage) {
        if !self.stages_run.contains(&stage) {
            self.stages_run.push(stage);
        }
    }

    /// Records the artifact produced by a stage.
    pub fn output(&mut self, stage: Stage, artifact: ArtifactId) {
        self.stage_outputs.insert(stage, artifact);
    }

    /// Will version reference.
    #[must_use]
    pub fn will_ref(&self) -> WillRef {
        self.will.reference()
    }

    /// Whether the request carries a claim or plan that must be falsifiable.
    #[must_use]
    pub fn is_claim_bearing(&self) -> bool {
        let strategic = self.boundary.as_ref().is_some_and(|boundary| boundary.strategic);
        let claims = self
            .knowledge
            .as_ref()
            .is_some_and(|knowledge| !knowledge.claims.is_empty());
        let selected = self
            .options
            .as_ref()
            .is_some_and(|options| options.selected.is_some());
        strategic
            || claims
            || selected
            || !self.actions.is_empty()
            || !self.request.candidate_actions.is_empty()
    }

    /// Whether the terminal record has been written.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.record.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::will::WillDraft;

    #[test]
    fn stages_are_entered_once_in_order() {
        let will = Arc::new(WillVector::from_draft("acme", WillDraft::new("grow sustainably"), 1));
        let mut session = Session::open(DecisionRequest::new("acme", "plan"), will);
        session.enter(Stage::ContextBoundary);
        session.enter(Stage::ContextBoundary);
        session.enter(Stage::KnowledgeSufficiency);
        assert_eq!(
            session.stages_run,
            vec![Stage::ContextBoundary, Stage::KnowledgeSufficiency]
        );
        assert!(Stage::ContextBoundary < Stage::DecisionRecorder);
        assert_eq!(session.ledger.session_id, session.id);
    }

    #[test]
    fn reasoner_actions_make_a_session_claim_bearing() {
        let will = Arc::new(WillVector::from_draft("acme", WillDraft::new("grow sustainably"), 1));
        let mut session = Session::open(DecisionRequest::new("acme", "hire?"), will);
        assert!(!session.is_claim_bearing());
        session.actions.push(CandidateAction::new("hire contractor", "ops"));
        assert!(session.is_claim_bearing());
    }
}
