use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::Stage;

/// Top-level grouping of refusal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalFamily {
    /// Grounding and falsifiability failures.
    Epistemic,
    /// Framing and risk failures.
    Strategic,
    /// Intent, authority and Will failures.
    EthicalCognitive,
    /// Missing structure in the request.
    Structural,
}

impl fmt::Display for RefusalFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Epistemic => "epistemic",
            Self::Strategic => "strategic",
            Self::EthicalCognitive => "ethical_cognitive",
            Self::Structural => "structural",
        };
        f.write_str(label)
    }
}

/// Machine-readable refusal reason. Every code maps to exactly one family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Facts and assumptions do not support the conclusion.
    InsufficientGrounding,
    /// A claim admits no counterexample.
    UnfalsifiableClaim,
    /// Scope or constraints missing; the request generalizes past its context.
    OvergeneralizedContext,
    /// Only one future was requested or constructible.
    SingleScenarioFraming,
    /// Action claims unbounded upside.
    UnboundedUpside,
    /// Irreversible action without a safeguard.
    IrreversibleWithoutSafeguard,
    /// Every admissible action exceeds the downside ceiling.
    DownsideExceedsCeiling,
    /// Request seeks to manipulate or deceive.
    ManipulativeIntent,
    /// Request substitutes for professional judgement.
    UnqualifiedAuthority,
    /// Outcome compromises a Will non-negotiable.
    WillConflict,
    /// Horizon could not be determined.
    MissingHorizon,
    /// Stakeholders could not be determined.
    UndefinedStakeholders,
    /// Plan requested without candidate actions.
    NoCandidateActions,
}

impl ReasonCode {
    /// Owning family.
    #[must_use]
    pub const fn family(self) -> RefusalFamily {
        match self {
            Self::InsufficientGrounding | Self::UnfalsifiableClaim | Self::OvergeneralizedContext => {
                RefusalFamily::Epistemic
            }
            Self::SingleScenarioFraming
            | Self::UnboundedUpside
            | Self::IrreversibleWithoutSafeguard
            | Self::DownsideExceedsCeiling => RefusalFamily::Strategic,
            Self::ManipulativeIntent | Self::UnqualifiedAuthority | Self::WillConflict => {
                RefusalFamily::EthicalCognitive
            }
            Self::MissingHorizon | Self::UndefinedStakeholders | Self::NoCandidateActions => {
                RefusalFamily::Structural
            }
        }
    }

    /// Snake-case code as written to the log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientGrounding => "insufficient_grounding",
            Self::UnfalsifiableClaim => "unfalsifiable_claim",
            Self::OvergeneralizedContext => "overgeneralized_context",
            Self::SingleScenarioFraming => "single_scenario_framing",
            Self::UnboundedUpside => "unbounded_upside",
            Self::IrreversibleWithoutSafeguard => "irreversible_without_safeguard",
            Self::DownsideExceedsCeiling => "downside_exceeds_ceiling",
            Self::ManipulativeIntent => "manipulative_intent",
            Self::UnqualifiedAuthority => "unqualified_authority",
            Self::WillConflict => "will_conflict",
            Self::MissingHorizon => "missing_horizon",
            Self::UndefinedStakeholders => "undefined_stakeholders",
            Self::NoCandidateActions => "no_candidate_actions",
        }
    }

    /// Human label for rationales.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::InsufficientGrounding => "insufficient grounding",
            Self::UnfalsifiableClaim => "unfalsifiable claim",
            Self::OvergeneralizedContext => "overgeneralized context",
            Self::SingleScenarioFraming => "single-scenario framing",
            Self::UnboundedUpside => "unbounded upside",
            Self::IrreversibleWithoutSafeguard => "irreversible action without safeguard",
            Self::DownsideExceedsCeiling => "downside exceeds ceiling",
            Self::ManipulativeIntent => "manipulative intent",
            Self::UnqualifiedAuthority => "unqualified authority",
            Self::WillConflict => "conflict with Will",
            Self::MissingHorizon => "missing horizon",
            Self::UndefinedStakeholders => "undefined stakeholders",
            Self::NoCandidateActions => "no candidate actions",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal refusal produced by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refusal {
    /// Refusing gate.
    pub gate: Stage,
    /// Reason code.
    pub code: ReasonCode,
    /// Unmet condition.
    pub rationale: String,
    /// Softened path, set only for the educational downgrade.
    pub chosen_path: Option<String>,
}

impl Refusal {
    /// Creates a refusal.
    #[must_use]
    pub fn new(gate: Stage, code: ReasonCode, rationale: impl Into<String>) -> Self {
        Self {
            gate,
            code,
            rationale: rationale.into(),
            chosen_path: None,
        }
    }

    /// Attaches a softened path.
    #[must_use]
    pub fn with_chosen_path(mut self, path: impl Into<String>) -> Self {
        self.chosen_path = Some(path.into());
        self
    }

    /// Family of the reason code.
    #[must_use]
    pub const fn family(&self) -> RefusalFamily {
        self.code.family()
    }
}

/// Request for more information before the loop can conclude.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitRequest {
    /// Gate asking to wait.
    pub gate: Stage,
    /// Reason code.
    pub code: ReasonCode,
    /// Why the loop cannot conclude yet.
    pub rationale: String,
    /// Minimal items to resolve, most critical first.
    pub information_needed: Vec<String>,
}

impl WaitRequest {
    /// Creates a wait request.
    #[must_use]
    pub fn new(
        gate: Stage,
        code: ReasonCode,
        rationale: impl Into<String>,
        information_needed: Vec<String>,
    ) -> Self {
        Self {
            gate,
            code,
            rationale: rationale.into(),
            information_needed,
        }
    }
}
