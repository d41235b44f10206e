use std::collections::BTreeSet;

use chrono::Utc;
use uuid::Uuid;

use super::{
    helper::{find_marker, overlaps, SINGLE_FUTURE_MARKERS},
    Boundary, GateOutcome, KnowledgeAssessment,
};
use crate::{
    artifacts::{
        content_id, AssumptionId, AssumptionLedger, FalsifierId, FalsifierSet, Horizon,
        Indicator, OutcomeBounds, PrincipalId, Scenario, ScenarioPack, ScenarioType, SessionId,
        WeakSignal,
    },
    config::LoopConfig,
    reasoner::{DraftScenario, DraftSignal},
    refusal::{ReasonCode, Refusal},
    session::Stage,
};

/// Scenario framing runs for any horizon beyond immediate execution or any strategic request.
#[must_use]
pub fn is_future_oriented(boundary: &Boundary) -> bool {
    boundary.horizon != Horizon::H1 || boundary.strategic
}

/// Pack plus the weak signals to persist with the record.
#[derive(Debug, Clone, PartialEq)]
pub struct FramedScenarios {
    /// The pack.
    pub pack: ScenarioPack,
    /// New signals.
    pub signals: Vec<WeakSignal>,
}

/// Everything the framer reads from the session.
#[derive(Debug, Clone, Copy)]
pub struct FramingInputs<'a> {
    /// Session id.
    pub session_id: SessionId,
    /// Principal.
    pub principal: &'a str,
    /// Raw request.
    pub request_text: &'a str,
    /// Knowledge assessment.
    pub knowledge: &'a KnowledgeAssessment,
    /// Session ledger.
    pub ledger: &'a AssumptionLedger,
    /// Falsifier set.
    pub falsifiers: &'a FalsifierSet,
    /// Reasoner scenario hints.
    pub hints: &'a [DraftScenario],
    /// Reasoner signals.
    pub signals: &'a [DraftSignal],
    /// Active signals already in the principal's log.
    pub prior_signals: &'a [WeakSignal],
}

/// Builds Base/Upside/Downside/Wildcard representations.
#[derive(Debug, Clone)]
pub struct ScenarioFramer {
    config: LoopConfig,
}

impl ScenarioFramer {
    /// Creates a framer with the loop thresholds.
    #[must_use]
    pub const fn new(config: LoopConfig) -> Self {
        Self { config }
    }

    fn refuse<T>(rationale: String) -> GateOutcome<T> {
        GateOutcome::Refuse(Refusal::new(
            Stage::ScenarioFramer,
            ReasonCode::SingleScenarioFraming,
            rationale,
        ))
    }

    fn resolve_triggers(conditions: &[String], falsifiers: &FalsifierSet) -> Vec<FalsifierId> {
        conditions
            .iter()
            .map(|condition| content_id("falsifier", condition))
            .filter(|id| falsifiers.contains(*id))
            .collect()
    }

    /// Frames the request into a scenario pack.
    #[must_use]
    pub fn frame(&self, inputs: FramingInputs<'_>) -> GateOutcome<FramedScenarios> {
        if let Some(marker) = find_marker(inputs.request_text, SINGLE_FUTURE_MARKERS) {
            return Self::refuse(format!(
                "request demands a single deterministic future (`{marker}`)"
            ));
        }
        let falsifiers = inputs.falsifiers;
        let (Some(top), Some(bottom)) = (
            falsifiers.max_severity(),
            falsifiers.falsifiers.iter().map(|f| f.severity).min(),
        ) else {
            return Self::refuse("no falsifier is available to trigger a scenario".into());
        };

        let hint_for = |scenario_type: ScenarioType| {
            inputs
                .hints
                .iter()
                .find(|hint| hint.scenario_type == scenario_type)
        };

        let mut plan: Vec<(ScenarioType, Vec<FalsifierId>)> = vec![
            (ScenarioType::Base, falsifiers.ids()),
        ];
        if hint_for(ScenarioType::Upside).is_some() {
            plan.push((ScenarioType::Upside, falsifiers.ids()));
        }
        plan.push((ScenarioType::Downside, falsifiers.ids_at(top)));
        if !inputs.knowledge.unknowns.is_empty() {
            let wildcard = if bottom < top {
                falsifiers.ids_at(bottom)
            } else {
                falsifiers.ids()
            };
            plan.push((ScenarioType::Wildcard, wildcard));
        }

        let pack_id = Uuid::new_v4();
        let mut scenarios = Vec::with_capacity(plan.len());
        for (scenario_type, default_triggers) in plan {
            let hint = hint_for(scenario_type);
            let defaults = self.config.default_bounds(scenario_type);
            let low = hint.and_then(|hint| hint.low).unwrap_or(defaults.low);
            let high = hint.and_then(|hint| hint.high).unwrap_or(defaults.high);
            let certain_bound = hint.is_some_and(|hint| hint.certain_bound);
            if !(low.is_finite() && high.is_finite()) || low > high {
                return Self::refuse(format!(
                    "framing rejected: {scenario_type} bounds [{low}, {high}] are not an ordered range"
                ));
            }
            if (high - low).abs() < f64::EPSILON && !certain_bound {
                return Self::refuse(format!(
                    "framing rejected: {scenario_type} collapses to the point {low} without a certain-bound mark"
                ));
            }
            let triggers = hint
                .map(|hint| Self::resolve_triggers(&hint.triggers, falsifiers))
                .filter(|resolved| !resolved.is_empty())
                .unwrap_or(default_triggers);
            let assumption_links = if scenario_type == ScenarioType::Base {
                inputs.ledger.load_bearing().map(|entry| entry.id).collect()
            } else {
                linked_assumptions(&triggers, falsifiers)
            };
            scenarios.push(Scenario {
                id: Uuid::new_v5(&pack_id, scenario_type.as_str().as_bytes()),
                scenario_type,
                name: hint
                    .and_then(|hint| hint.name.clone())
                    .unwrap_or_else(|| format!("{scenario_type} case")),
                triggers,
                indicators: Vec::new(),
                outcome_bounds: OutcomeBounds::new(low, high),
                certain_bound,
                assumption_links,
            });
        }

        let distinct: BTreeSet<ScenarioType> = scenarios.iter().map(|s| s.scenario_type).collect();
        if distinct.len() < self.config.min_scenario_types {
            return Self::refuse(format!(
                "only {} scenario type(s) constructible, {} required",
                distinct.len(),
                self.config.min_scenario_types
            ));
        }

        let signals = new_signals(inputs.principal, inputs.signals, &scenarios);
        attach_indicators(&mut scenarios, &signals, inputs.prior_signals, falsifiers);

        let pack = ScenarioPack {
            id: pack_id,
            session_id: inputs.session_id,
            scenarios,
        };
        if let Err(violation) = pack.validate(self.config.min_scenario_types) {
            return Self::refuse(format!("framing rejected: {}", violation.reason));
        }
        GateOutcome::Proceed(FramedScenarios { pack, signals })
    }
}

fn linked_assumptions(triggers: &[FalsifierId], falsifiers: &FalsifierSet) -> Vec<AssumptionId> {
    let mut links = Vec::new();
    for id in triggers {
        if let Some(assumption) = falsifiers.get(*id).and_then(|f| f.assumption_ref) {
            if !links.contains(&assumption) {
                links.push(assumption);
            }
        }
    }
    links
}

fn new_signals(
    principal: &str,
    drafts: &[DraftSignal],
    scenarios: &[Scenario],
) -> Vec<WeakSignal> {
    let principal: PrincipalId = principal.to_string();
    let fallback = scenarios
        .iter()
        .find(|s| s.scenario_type == ScenarioType::Wildcard)
        .or_else(|| scenarios.iter().find(|s| s.scenario_type == ScenarioType::Downside));
    drafts
        .iter()
        .filter(|draft| !draft.description.trim().is_empty())
        .map(|draft| {
            let mut signal = WeakSignal::new(
                principal.clone(),
                draft.description.trim(),
                draft.observed_at.unwrap_or_else(Utc::now),
            );
            let targets: Vec<&Scenario> = scenarios
                .iter()
                .filter(|s| draft.scenarios.contains(&s.scenario_type))
                .collect();
            if targets.is_empty() {
                if let Some(scenario) = fallback {
                    signal = signal.linked_to(scenario.id);
                }
            }
            for scenario in targets {
                signal = signal.linked_to(scenario.id);
            }
            signal
        })
        .collect()
}

fn attach_indicators(
    scenarios: &mut [Scenario],
    fresh: &[WeakSignal],
    prior: &[WeakSignal],
    falsifiers: &FalsifierSet,
) {
    for scenario in scenarios.iter_mut() {
        let conditions: Vec<&str> = scenario
            .triggers
            .iter()
            .filter_map(|id| falsifiers.get(*id))
            .map(|f| f.condition.as_str())
            .collect();
        let mut indicators: Vec<Indicator> = fresh
            .iter()
            .filter(|signal| signal.linked_scenario_ids.contains(&scenario.id))
            .chain(prior.iter().filter(|signal| {
                scenario.scenario_type != ScenarioType::Base
                    && conditions.iter().any(|c| overlaps(c, &signal.description))
            }))
            .map(|signal| Indicator {
                signal_id: signal.id,
                description: signal.description.clone(),
                observed_at: signal.observed_at,
            })
            .collect();
        indicators.sort_by_key(|indicator| indicator.observed_at);
        scenario.indicators = indicators;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        artifacts::{AssumptionOrigin, Falsifier, Severity},
        gates::UnknownItem,
    };

    fn falsifier(condition: &str, severity: Severity) -> Falsifier {
        Falsifier {
            id: content_id("falsifier", condition),
            condition: condition.into(),
            detection_method: "monthly review".into(),
            severity,
            assumption_ref: None,
            claim: None,
        }
    }

    fn knowledge(unknowns: usize) -> KnowledgeAssessment {
        KnowledgeAssessment {
            facts: vec!["pilot retained 40%".into()],
            claims: Vec::new(),
            unknowns: (0..unknowns)
                .map(|idx| UnknownItem {
                    statement: format!("unknown {idx}"),
                    critical: false,
                })
                .collect(),
            unknown_load: unknowns,
            tolerance: 2,
            strict: false,
            predictive: false,
        }
    }

    fn frame(
        text: &str,
        knowledge: &KnowledgeAssessment,
        falsifiers: &FalsifierSet,
        hints: &[DraftScenario],
    ) -> GateOutcome<FramedScenarios> {
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        ledger.declare(None, "funding secured", AssumptionOrigin::Request, None);
        ScenarioFramer::new(LoopConfig::default()).frame(FramingInputs {
            session_id: Uuid::new_v4(),
            principal: "acme",
            request_text: text,
            knowledge,
            ledger: &ledger,
            falsifiers,
            hints,
            signals: &[DraftSignal {
                description: "competitor hiring regional sales staff".into(),
                observed_at: None,
                scenarios: Vec::new(),
            }],
            prior_signals: &[],
        })
    }

    #[test]
    fn builds_base_downside_and_wildcard() {
        let set = FalsifierSet::new(vec![
            falsifier("competitor launches regionally", Severity::High),
            falsifier("funding secured no longer holds", Severity::Medium),
        ]);
        let GateOutcome::Proceed(framed) = frame("Plan entry", &knowledge(1), &set, &[]) else {
            panic!("expected proceed");
        };
        let pack = framed.pack;
        assert_eq!(
            pack.tags(),
            vec![ScenarioType::Base, ScenarioType::Downside, ScenarioType::Wildcard]
        );
        let downside = pack.get(ScenarioType::Downside).unwrap();
        assert_eq!(downside.triggers, set.ids_at(Severity::High));
        let wildcard = pack.get(ScenarioType::Wildcard).unwrap();
        assert_eq!(wildcard.triggers, set.ids_at(Severity::Medium));
        assert_eq!(framed.signals.len(), 1);
        assert!(framed.signals[0].linked_scenario_ids.contains(&wildcard.id));
        assert_eq!(wildcard.indicators.len(), 1);
        assert!(pack.validate(2).is_ok());
    }

    #[test]
    fn upside_only_with_reasoner_hint_and_bounds_override() {
        let set = FalsifierSet::new(vec![falsifier("demand stalls", Severity::Medium)]);
        let hints = vec![DraftScenario {
            scenario_type: ScenarioType::Upside,
            name: Some("Early adoption".into()),
            low: Some(0.1),
            high: Some(0.9),
            certain_bound: false,
            triggers: vec!["demand stalls".into()],
        }];
        let GateOutcome::Proceed(framed) = frame("Plan entry", &knowledge(0), &set, &hints) else {
            panic!("expected proceed");
        };
        let upside = framed.pack.get(ScenarioType::Upside).unwrap();
        assert_eq!(upside.name, "Early adoption");
        assert_eq!(upside.outcome_bounds.high, 0.9);
        assert!(framed.pack.get(ScenarioType::Wildcard).is_none());
    }

    #[test]
    fn point_bounds_and_single_future_demands_are_refused() {
        let set = FalsifierSet::new(vec![falsifier("demand stalls", Severity::Medium)]);
        let hints = vec![DraftScenario {
            scenario_type: ScenarioType::Downside,
            name: None,
            low: Some(-0.3),
            high: Some(-0.3),
            certain_bound: false,
            triggers: Vec::new(),
        }];
        let outcome = frame("Plan entry", &knowledge(0), &set, &hints);
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::SingleScenarioFraming);

        let outcome = frame("Just tell me what will happen next year", &knowledge(0), &set, &[]);
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::SingleScenarioFraming);

        let empty = FalsifierSet::new(Vec::new());
        let outcome = frame("Plan entry", &knowledge(0), &empty, &[]);
        assert!(outcome.refusal().is_some());
    }
}
