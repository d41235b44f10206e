//! Gating stages of the loop. Each gate either hands its output to the next
//! stage or ends the run with WAIT or REFUSE.

/// Keyword and marker helpers shared by the gates.
pub mod helper;
/// Context boundary validation and intent screening.
pub mod boundary;
/// Knowledge sufficiency assessment.
pub mod knowledge;
/// Falsifier construction.
pub mod falsifier;
/// Scenario framing.
pub mod scenario;
/// Option mapping and playbook construction.
pub mod options;

use crate::{
    refusal::{Refusal, WaitRequest},
    session::Halt,
};

pub use boundary::{Boundary, ContextBoundaryValidator};
pub use falsifier::FalsifierEngine;
pub use knowledge::{KnowledgeAssessment, KnowledgeGate, UnknownItem};
pub use options::{ActionAssessment, CandidateAction, OptionMap, OptionMapper};
pub use scenario::{is_future_oriented, FramedScenarios, ScenarioFramer};

/// Result of a gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome<T> {
    /// Continue with the gate's output.
    Proceed(T),
    /// Stop and ask for information.
    Wait(WaitRequest),
    /// Stop and refuse.
    Refuse(Refusal),
}

impl<T> GateOutcome<T> {
    /// Converts into a `Result` so stages can chain with `?`.
    pub fn into_result(self) -> Result<T, Halt> {
        match self {
            Self::Proceed(value) => Ok(value),
            Self::Wait(wait) => Err(Halt::Wait(wait)),
            Self::Refuse(refusal) => Err(Halt::Refuse(refusal)),
        }
    }

    /// Whether the gate let the session through.
    #[must_use]
    pub const fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed(_))
    }

    /// Refusal, if the gate refused.
    #[must_use]
    pub const fn refusal(&self) -> Option<&Refusal> {
        match self {
            Self::Refuse(refusal) => Some(refusal),
            _ => None,
        }
    }

    /// Wait request, if the gate asked to wait.
    #[must_use]
    pub const fn wait(&self) -> Option<&WaitRequest> {
        match self {
            Self::Wait(wait) => Some(wait),
            _ => None,
        }
    }
}
