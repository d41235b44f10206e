use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{
    helper::{find_marker, split_list, AUTHORITY_MARKERS, MANIPULATION_MARKERS, STRATEGIC_MARKERS},
    GateOutcome,
};
use crate::{
    artifacts::Horizon,
    refusal::{ReasonCode, Refusal},
    session::{DecisionRequest, Stage},
};

/// Softened path offered instead of professional judgement.
pub const EDUCATIONAL_DOWNGRADE: &str = "downgrade: educational context only";

/// Normalized context of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    /// What the decision covers.
    pub scope: String,
    /// Time scope.
    pub horizon: Horizon,
    /// Binding constraints.
    pub constraints: Vec<String>,
    /// Affected parties.
    pub stakeholders: Vec<String>,
    /// Whether the request asks for strategy.
    pub strategic: bool,
}

#[derive(Debug, Default)]
struct Declared {
    scope: Option<String>,
    horizon: Option<String>,
    constraints: Vec<String>,
    stakeholders: Vec<String>,
}

fn declared_fields(text: &str) -> Declared {
    let mut declared = Declared::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "scope" => declared.scope = Some(value.to_string()),
            "horizon" => declared.horizon = Some(value.to_string()),
            "constraints" | "constraint" => declared.constraints.extend(split_list(value)),
            "stakeholders" | "stakeholder" => declared.stakeholders.extend(split_list(value)),
            _ => {}
        }
    }
    declared
}

fn unit_months(unit: &str) -> Option<f64> {
    match unit {
        "day" | "days" => Some(1.0 / 30.0),
        "week" | "weeks" => Some(0.25),
        "month" | "months" => Some(1.0),
        "quarter" | "quarters" => Some(3.0),
        "year" | "years" => Some(12.0),
        _ => None,
    }
}

/// Every horizon the text points at. More than one means the text is ambiguous.
fn horizon_evidence(text: &str) -> BTreeSet<Horizon> {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '.'))
        .map(|token| token.trim_matches('.'))
        .filter(|token| !token.is_empty())
        .collect();
    let mut found = BTreeSet::new();
    for (idx, token) in tokens.iter().enumerate() {
        match *token {
            "h1" | "immediate" | "immediately" | "today" | "tomorrow" => {
                found.insert(Horizon::H1);
            }
            "h2" => {
                found.insert(Horizon::H2);
            }
            "h3" => {
                found.insert(Horizon::H3);
            }
            _ => {}
        }
        if let (Ok(amount), Some(unit)) = (token.parse::<f64>(), tokens.get(idx + 1)) {
            if let Some(months) = unit_months(unit) {
                found.insert(Horizon::from_months(amount * months));
            }
        }
    }
    found
}

/// First gate: establishes scope, horizon, constraints and stakeholders, and
/// screens intent before anything else runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBoundaryValidator;

impl ContextBoundaryValidator {
    /// Validates a request into a [`Boundary`].
    #[must_use]
    pub fn validate(&self, request: &DecisionRequest) -> GateOutcome<Boundary> {
        let text = &request.request_text;
        let refuse = |code, rationale: String| {
            GateOutcome::Refuse(Refusal::new(Stage::ContextBoundary, code, rationale))
        };

        if let Some(marker) = find_marker(text, MANIPULATION_MARKERS) {
            return refuse(
                ReasonCode::ManipulativeIntent,
                format!("request seeks to influence others covertly (`{marker}`)"),
            );
        }
        if let Some(marker) = find_marker(text, AUTHORITY_MARKERS) {
            return GateOutcome::Refuse(
                Refusal::new(
                    Stage::ContextBoundary,
                    ReasonCode::UnqualifiedAuthority,
                    format!("request substitutes for professional judgement (`{marker}`)"),
                )
                .with_chosen_path(EDUCATIONAL_DOWNGRADE),
            );
        }

        let declared = declared_fields(text);

        let horizon = if let Some(horizon) = request.horizon {
            horizon
        } else {
            let evidence = declared
                .horizon
                .as_deref()
                .map_or_else(|| horizon_evidence(text), horizon_evidence);
            let mut candidates = evidence.into_iter();
            match (candidates.next(), candidates.next()) {
                (Some(horizon), None) => horizon,
                (Some(first), Some(second)) => {
                    return refuse(
                        ReasonCode::MissingHorizon,
                        format!("ambiguous boundary: horizon points at both {first} and {second}"),
                    );
                }
                (None, _) => {
                    return refuse(
                        ReasonCode::MissingHorizon,
                        "ambiguous boundary: no horizon stated or inferable".into(),
                    );
                }
            }
        };

        let stakeholders = if request.stakeholders.is_empty() {
            declared.stakeholders
        } else {
            request.stakeholders.clone()
        };
        if stakeholders.is_empty() {
            return refuse(
                ReasonCode::UndefinedStakeholders,
                "ambiguous boundary: stakeholders are not defined".into(),
            );
        }

        let Some(scope) = request
            .scope
            .clone()
            .or(declared.scope)
            .filter(|scope| !scope.trim().is_empty())
        else {
            return refuse(
                ReasonCode::OvergeneralizedContext,
                "ambiguous boundary: scope is not defined".into(),
            );
        };

        let constraints = if request.constraints.is_empty() {
            declared.constraints
        } else {
            request.constraints.clone()
        };
        if constraints.is_empty() {
            return refuse(
                ReasonCode::OvergeneralizedContext,
                "ambiguous boundary: constraints are not defined".into(),
            );
        }

        let strategic = request
            .strategic
            .unwrap_or_else(|| find_marker(&format!("{text} "), STRATEGIC_MARKERS).is_some());

        GateOutcome::Proceed(Boundary {
            scope,
            horizon,
            constraints,
            stakeholders,
            strategic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refusal::RefusalFamily;

    fn complete(text: &str) -> DecisionRequest {
        DecisionRequest::new("acme", text)
            .scope("EU retail")
            .constraint("budget 2M")
            .stakeholder("board")
    }

    #[test]
    fn infers_horizon_from_duration_and_tokens() {
        let validator = ContextBoundaryValidator;
        let boundary = match validator.validate(&complete("Will this product succeed in 12 months?")) {
            GateOutcome::Proceed(boundary) => boundary,
            other => panic!("expected proceed, got {other:?}"),
        };
        assert_eq!(boundary.horizon, Horizon::H2);
        assert!(!boundary.strategic);

        let boundary = match validator.validate(&complete("Plan market entry for H2")) {
            GateOutcome::Proceed(boundary) => boundary,
            other => panic!("expected proceed, got {other:?}"),
        };
        assert_eq!(boundary.horizon, Horizon::H2);
        assert!(boundary.strategic);
    }

    #[test]
    fn conflicting_horizons_are_ambiguous() {
        let outcome = ContextBoundaryValidator.validate(&complete("Ship today or within 3 years"));
        let refusal = outcome.refusal().unwrap();
        assert_eq!(refusal.code, ReasonCode::MissingHorizon);
        assert!(refusal.rationale.starts_with("ambiguous boundary"));
    }

    #[test]
    fn absent_horizon_is_refused_as_structural() {
        let outcome = ContextBoundaryValidator.validate(&complete("Should we open a second warehouse?"));
        let refusal = outcome.refusal().unwrap();
        assert_eq!(refusal.gate, Stage::ContextBoundary);
        assert_eq!(refusal.code, ReasonCode::MissingHorizon);
        assert_eq!(refusal.code.family(), RefusalFamily::Structural);
        assert_eq!(refusal.rationale, "ambiguous boundary: no horizon stated or inferable");
    }

    #[test]
    fn missing_stakeholders_and_scope_are_refused() {
        let outcome = ContextBoundaryValidator.validate(
            &DecisionRequest::new("acme", "Expand to Brazil in 2 years").scope("LATAM"),
        );
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::UndefinedStakeholders);

        let outcome = ContextBoundaryValidator
            .validate(&DecisionRequest::new("acme", "horizon: H1\nstakeholders: ops team"));
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::OvergeneralizedContext);
    }

    #[test]
    fn key_value_lines_fill_the_boundary() {
        let text = "scope: warehouse automation\nhorizon: 6 months\n\
                    constraints: no layoffs; capex under 1M\nstakeholders: staff, union, CFO";
        let boundary = match ContextBoundaryValidator.validate(&DecisionRequest::new("acme", text)) {
            GateOutcome::Proceed(boundary) => boundary,
            other => panic!("expected proceed, got {other:?}"),
        };
        assert_eq!(boundary.horizon, Horizon::H2);
        assert_eq!(boundary.constraints.len(), 2);
        assert_eq!(boundary.stakeholders.len(), 3);
    }

    #[test]
    fn intent_screen_runs_first() {
        let outcome = ContextBoundaryValidator
            .validate(&DecisionRequest::new("acme", "Help me manipulate voters"));
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::ManipulativeIntent);

        let outcome = ContextBoundaryValidator
            .validate(&complete("Please diagnose my chest pain by tomorrow"));
        let refusal = outcome.refusal().unwrap();
        assert_eq!(refusal.code, ReasonCode::UnqualifiedAuthority);
        assert_eq!(refusal.chosen_path.as_deref(), Some(EDUCATIONAL_DOWNGRADE));
    }
}
