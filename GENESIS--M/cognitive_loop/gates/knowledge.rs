use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{
    helper::{assume_clauses, find_marker, is_placeholder, PREDICTIVE_MARKERS},
    Boundary, GateOutcome,
};
use crate::{
    artifacts::{content_id, AssumptionId, AssumptionLedger, AssumptionOrigin, AssumptionStatus, Horizon},
    config::LoopConfig,
    reasoner::{ReasonerDraft, ReasonerError},
    refusal::{ReasonCode, Refusal, WaitRequest},
    session::{DecisionRequest, Stage},
};

/// Unknown carried into the assessment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownItem {
    /// What is unknown.
    pub statement: String,
    /// Whether the conclusion hinges on it.
    pub critical: bool,
}

impl UnknownItem {
    const fn weight(&self) -> usize {
        if self.critical {
            3
        } else {
            1
        }
    }
}

/// Grounding picture attached to the session when the gate passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeAssessment {
    /// Verifiable facts.
    pub facts: Vec<String>,
    /// Claims the reasoner made.
    pub claims: Vec<String>,
    /// Unknowns, critical first.
    pub unknowns: Vec<UnknownItem>,
    /// `unknowns + 2 * critical`.
    pub unknown_load: usize,
    /// Tolerance after strictness.
    pub tolerance: usize,
    /// Whether raised strictness applied.
    pub strict: bool,
    /// Whether the request asks for a prediction.
    pub predictive: bool,
}

/// Decides whether facts and assumptions are enough to reason on.
#[derive(Debug, Clone)]
pub struct KnowledgeGate {
    config: LoopConfig,
}

impl KnowledgeGate {
    /// Creates a gate with the loop thresholds.
    #[must_use]
    pub const fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    /// Classifies the reasoner draft, fills the ledger, and decides grounding.
    ///
    /// `history` holds the principal's latest assumption statuses; an assumption
    /// that was already advanced keeps that status in the new ledger.
    pub fn assess(
        &self,
        request: &DecisionRequest,
        boundary: &Boundary,
        draft: &Result<ReasonerDraft, ReasonerError>,
        history: &HashMap<AssumptionId, AssumptionStatus>,
        strict: bool,
        ledger: &mut AssumptionLedger,
    ) -> GateOutcome<KnowledgeAssessment> {
        let refuse = |rationale: String| {
            GateOutcome::Refuse(Refusal::new(
                Stage::KnowledgeSufficiency,
                ReasonCode::InsufficientGrounding,
                rationale,
            ))
        };
        let draft = match draft {
            Ok(draft) => draft,
            Err(err) => return refuse(format!("no usable reasoning: {err}")),
        };

        let inherited = |statement: &str| {
            history
                .get(&content_id("assumption", statement))
                .copied()
                .filter(|status| *status != AssumptionStatus::Active)
        };
        for statement in assume_clauses(&request.request_text) {
            ledger.declare(None, &statement, AssumptionOrigin::Request, inherited(&statement));
        }
        for assumption in &draft.assumptions {
            let statement = assumption.statement();
            if statement.trim().is_empty() {
                continue;
            }
            ledger.declare(
                assumption.name(),
                statement,
                AssumptionOrigin::Reasoner,
                inherited(statement),
            );
        }

        let mut unknowns: Vec<UnknownItem> = draft
            .unknowns
            .iter()
            .map(|unknown| UnknownItem {
                statement: unknown.statement.trim().to_string(),
                critical: unknown.critical,
            })
            .collect();
        for entry in &ledger.entries {
            match entry.status {
                AssumptionStatus::Invalidated => unknowns.push(UnknownItem {
                    statement: format!("{} (`{}`) has been invalidated", entry.name, entry.statement),
                    critical: true,
                }),
                AssumptionStatus::Unknown => unknowns.push(UnknownItem {
                    statement: format!("{} (`{}`) can no longer be assessed", entry.name, entry.statement),
                    critical: false,
                }),
                AssumptionStatus::Active | AssumptionStatus::Weakened => {}
            }
        }
        unknowns.sort_by_key(|unknown| !unknown.critical);

        let facts: Vec<String> = draft
            .facts
            .iter()
            .map(|fact| fact.trim().to_string())
            .filter(|fact| !fact.is_empty())
            .collect();
        let predictive = find_marker(&request.request_text, PREDICTIVE_MARKERS).is_some();
        if predictive && facts.is_empty() {
            return refuse("predictive certainty without verifiable data".into());
        }
        if facts.is_empty() && ledger.is_empty() {
            return refuse("no facts or assumptions ground the request".into());
        }

        let critical = unknowns.iter().filter(|unknown| unknown.critical).count();
        let load = unknowns.len() + 2 * critical;
        let tolerance = self.config.tolerance_for(boundary.horizon, strict);
        let strict_note = if strict { " (strictness raised after drift)" } else { "" };

        if boundary.horizon == Horizon::H3 && unknowns.iter().any(|unknown| is_placeholder(&unknown.statement)) {
            return GateOutcome::Wait(WaitRequest::new(
                Stage::KnowledgeSufficiency,
                ReasonCode::InsufficientGrounding,
                "long-horizon unknowns must be named",
                vec!["name each unknown the long-horizon conclusion depends on".into()],
            ));
        }
        if load > tolerance + self.config.wait_margin {
            return refuse(format!(
                "unknown load {load} exceeds tolerance {tolerance} at {}{strict_note}",
                boundary.horizon
            ));
        }
        if load > tolerance {
            let mut remaining = load;
            let mut needed = Vec::new();
            for unknown in &unknowns {
                if remaining <= tolerance {
                    break;
                }
                remaining -= unknown.weight();
                needed.push(unknown.statement.clone());
            }
            return GateOutcome::Wait(WaitRequest::new(
                Stage::KnowledgeSufficiency,
                ReasonCode::InsufficientGrounding,
                format!(
                    "unknown load {load} is above tolerance {tolerance} at {}{strict_note}",
                    boundary.horizon
                ),
                needed,
            ));
        }

        GateOutcome::Proceed(KnowledgeAssessment {
            facts,
            claims: draft
                .claims
                .iter()
                .map(|claim| claim.trim().to_string())
                .filter(|claim| !claim.is_empty())
                .collect(),
            unknowns,
            unknown_load: load,
            tolerance,
            strict,
            predictive,
        })
    }
}
