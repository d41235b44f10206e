use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{helper::overlaps, Boundary, GateOutcome};
use crate::{
    artifacts::{
        FalsifierId, FalsifierSet, OutcomeBounds, PlaybookAction, ScenarioPack, ScenarioType,
        SessionId, StrategyPlaybook,
    },
    refusal::{ReasonCode, Refusal, WaitRequest},
    session::Stage,
    will::WillVector,
};

fn default_owner() -> String {
    "unassigned".into()
}

const fn default_reversible() -> bool {
    true
}

const fn default_optionality() -> f64 {
    0.5
}

/// Action the mapper may select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    /// Action name.
    pub name: String,
    /// Accountable owner.
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Whether the action can be undone.
    #[serde(default = "default_reversible")]
    pub reversible: bool,
    /// Rollback or safeguard for irreversible actions.
    #[serde(default)]
    pub safeguard: Option<String>,
    /// Action advertises unbounded upside.
    #[serde(default)]
    pub unbounded_upside: bool,
    /// Labels of Will non-negotiables the action would compromise.
    #[serde(default)]
    pub compromises: Vec<String>,
    /// Outcome per scenario; missing entries take the scenario's bounds.
    #[serde(default)]
    pub outcomes: BTreeMap<ScenarioType, OutcomeBounds>,
    /// Scenarios the action is exposed to; empty means all.
    #[serde(default)]
    pub exposed_to: Vec<ScenarioType>,
    /// Remaining room to change course, 0..=1.
    #[serde(default = "default_optionality")]
    pub optionality: f64,
    /// Assumptions or falsifier conditions the action answers to.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl CandidateAction {
    /// Reversible action with default optionality.
    #[must_use]
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            reversible: true,
            safeguard: None,
            unbounded_upside: false,
            compromises: Vec::new(),
            outcomes: BTreeMap::new(),
            exposed_to: Vec::new(),
            optionality: default_optionality(),
            addresses: Vec::new(),
        }
    }

    /// Marks the action irreversible with an optional safeguard.
    #[must_use]
    pub fn irreversible(mut self, safeguard: Option<&str>) -> Self {
        self.reversible = false;
        self.safeguard = safeguard.map(str::to_string);
        self
    }

    /// Sets the outcome range in one scenario.
    #[must_use]
    pub fn outcome(mut self, scenario: ScenarioType, low: f64, high: f64) -> Self {
        self.outcomes.insert(scenario, OutcomeBounds::new(low, high));
        self
    }

    /// Sets optionality.
    #[must_use]
    pub const fn optionality(mut self, optionality: f64) -> Self {
        self.optionality = optionality;
        self
    }

    /// Names an assumption or condition the action answers to.
    #[must_use]
    pub fn addresses(mut self, target: impl Into<String>) -> Self {
        self.addresses.push(target.into());
        self
    }

    /// Names a non-negotiable the action would compromise.
    #[must_use]
    pub fn compromising(mut self, non_negotiable: impl Into<String>) -> Self {
        self.compromises.push(non_negotiable.into());
        self
    }

    fn is_exposed_to(&self, scenario: ScenarioType) -> bool {
        self.exposed_to.is_empty() || self.exposed_to.contains(&scenario)
    }
}

/// Evaluation of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAssessment {
    /// Action name.
    pub name: String,
    /// Loss at the worst adverse `low`, never negative.
    pub downside_exposure: f64,
    /// Worst shortfall against the best admissible alternative.
    pub regret: f64,
    /// Scenario where the shortfall occurs.
    pub least_suited: Option<ScenarioType>,
    /// Optionality.
    pub optionality: f64,
    /// Reversibility.
    pub reversible: bool,
    /// Exclusion reason, if excluded outright.
    pub excluded: Option<ReasonCode>,
    /// Whether the action is within the downside ceiling.
    pub within_ceiling: bool,
}

impl ActionAssessment {
    fn admissible(&self) -> bool {
        self.excluded.is_none() && self.within_ceiling
    }
}

/// Option mapper output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionMap {
    /// Every candidate, in input order.
    pub assessments: Vec<ActionAssessment>,
    /// Selected action.
    pub selected: Option<String>,
    /// Regret of the selected action.
    pub regret_bound: Option<f64>,
}

impl OptionMap {
    /// Admissible assessments, selected first.
    pub fn admissible(&self) -> impl Iterator<Item = &ActionAssessment> {
        let selected = self.selected.clone();
        let first = self
            .assessments
            .iter()
            .filter(move |a| Some(&a.name) == selected.as_ref());
        let selected = self.selected.clone();
        let rest = self
            .assessments
            .iter()
            .filter(move |a| a.admissible() && Some(&a.name) != selected.as_ref());
        first.chain(rest)
    }
}

/// Scenario outcome of an action: its own estimate, else the scenario's bounds.
fn outcome_in(
    action: &CandidateAction,
    scenario: ScenarioType,
    pack: Option<&ScenarioPack>,
) -> OutcomeBounds {
    action
        .outcomes
        .get(&scenario)
        .copied()
        .or_else(|| pack.and_then(|pack| pack.get(scenario)).map(|s| s.outcome_bounds))
        .unwrap_or(OutcomeBounds::new(0.0, 0.0))
}

/// Maps exposure and regret over candidates and picks one.
#[derive(Debug, Clone, Copy)]
pub struct OptionMapper {
    downside_ceiling: f64,
}

impl OptionMapper {
    /// Creates a mapper with the given ceiling.
    #[must_use]
    pub const fn new(downside_ceiling: f64) -> Self {
        Self { downside_ceiling }
    }

    /// Scenario universe: the pack's tags, or the union of declared outcomes.
    fn scenario_set(actions: &[CandidateAction], pack: Option<&ScenarioPack>) -> Vec<ScenarioType> {
        if let Some(pack) = pack {
            return pack.tags();
        }
        let mut tags: Vec<ScenarioType> = actions
            .iter()
            .flat_map(|action| action.outcomes.keys().copied())
            .collect();
        tags.sort();
        tags.dedup();
        if tags.is_empty() {
            tags.push(ScenarioType::Base);
        }
        tags
    }

    /// Evaluates candidates. Plans without candidates wait; sessions that are
    /// not plans proceed with an empty map.
    #[must_use]
    pub fn map(
        &self,
        boundary: &Boundary,
        actions: &[CandidateAction],
        pack: Option<&ScenarioPack>,
        will: &WillVector,
    ) -> GateOutcome<OptionMap> {
        if actions.is_empty() {
            if boundary.strategic {
                return GateOutcome::Wait(WaitRequest::new(
                    Stage::OptionMapper,
                    ReasonCode::NoCandidateActions,
                    "plan requested without candidate actions",
                    vec!["candidate actions with owners and expected outcomes".into()],
                ));
            }
            return GateOutcome::Proceed(OptionMap {
                assessments: Vec::new(),
                selected: None,
                regret_bound: None,
            });
        }

        let scenarios = Self::scenario_set(actions, pack);
        let mut assessments: Vec<ActionAssessment> = actions
            .iter()
            .map(|action| {
                let worst_adverse = scenarios
                    .iter()
                    .filter(|s| s.is_adverse() && action.is_exposed_to(**s))
                    .map(|s| outcome_in(action, *s, pack).low)
                    .fold(f64::INFINITY, f64::min);
                let downside_exposure = if worst_adverse.is_finite() {
                    (-worst_adverse).max(0.0)
                } else {
                    0.0
                };
                let excluded = if action
                    .compromises
                    .iter()
                    .any(|label| will.non_negotiable_matching(label).is_some())
                {
                    Some(ReasonCode::WillConflict)
                } else if action.unbounded_upside {
                    Some(ReasonCode::UnboundedUpside)
                } else if !action.reversible
                    && action.safeguard.as_deref().map_or(true, |s| s.trim().is_empty())
                {
                    Some(ReasonCode::IrreversibleWithoutSafeguard)
                } else {
                    None
                };
                ActionAssessment {
                    name: action.name.clone(),
                    downside_exposure,
                    regret: 0.0,
                    least_suited: None,
                    optionality: action.optionality,
                    reversible: action.reversible,
                    excluded,
                    within_ceiling: downside_exposure <= self.downside_ceiling,
                }
            })
            .collect();

        if !assessments.iter().any(ActionAssessment::admissible) {
            let over_ceiling: Vec<&ActionAssessment> =
                assessments.iter().filter(|a| a.excluded.is_none()).collect();
            if over_ceiling.is_empty() {
                let first = &assessments[0];
                let code = first.excluded.unwrap_or(ReasonCode::DownsideExceedsCeiling);
                return GateOutcome::Refuse(Refusal::new(
                    Stage::OptionMapper,
                    code,
                    format!("no admissible action: `{}` excluded for {}", first.name, code.label()),
                ));
            }
            return GateOutcome::Wait(WaitRequest::new(
                Stage::OptionMapper,
                ReasonCode::DownsideExceedsCeiling,
                format!(
                    "every admissible action exceeds the downside ceiling {}",
                    self.downside_ceiling
                ),
                over_ceiling
                    .iter()
                    .map(|a| {
                        format!(
                            "evidence bounding the downside of `{}` (exposure {:.2})",
                            a.name, a.downside_exposure
                        )
                    })
                    .collect(),
            ));
        }

        let best: BTreeMap<ScenarioType, f64> = scenarios
            .iter()
            .map(|s| {
                let best = actions
                    .iter()
                    .zip(&assessments)
                    .filter(|(_, assessment)| assessment.admissible())
                    .map(|(action, _)| outcome_in(action, *s, pack).low)
                    .fold(f64::NEG_INFINITY, f64::max);
                (*s, best)
            })
            .collect();
        for (action, assessment) in actions.iter().zip(assessments.iter_mut()) {
            if !assessment.admissible() {
                continue;
            }
            let mut regret = 0.0;
            let mut least_suited = None;
            for scenario in &scenarios {
                let shortfall = best[scenario] - outcome_in(action, *scenario, pack).low;
                if least_suited.is_none() || shortfall > regret {
                    regret = shortfall;
                    least_suited = Some(*scenario);
                }
            }
            assessment.regret = regret.max(0.0);
            assessment.least_suited = least_suited;
        }

        let selected = assessments
            .iter()
            .filter(|a| a.admissible())
            .min_by(|a, b| {
                a.regret
                    .partial_cmp(&b.regret)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        b.optionality
                            .partial_cmp(&a.optionality)
                            .unwrap_or(Ordering::Equal)
                    })
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|a| (a.name.clone(), a.regret));

        GateOutcome::Proceed(OptionMap {
            selected: selected.as_ref().map(|(name, _)| name.clone()),
            regret_bound: selected.map(|(_, regret)| regret),
            assessments,
        })
    }
}

/// Inputs for playbook construction.
#[derive(Debug, Clone, Copy)]
pub struct PlaybookInputs<'a> {
    /// Session id.
    pub session_id: SessionId,
    /// Boundary.
    pub boundary: &'a Boundary,
    /// Mapper output.
    pub options: &'a OptionMap,
    /// Candidate actions.
    pub actions: &'a [CandidateAction],
    /// Scenario pack.
    pub pack: &'a ScenarioPack,
    /// Falsifier set.
    pub falsifiers: &'a FalsifierSet,
    /// Reasoner objectives.
    pub objectives: &'a [String],
    /// Reasoner success metrics.
    pub success_metrics: &'a [String],
}

/// Builds the playbook for a strategic session. Actions that cannot trace to a
/// falsifier and a scenario are left out; no traceable action means no playbook.
#[must_use]
pub fn build_playbook(inputs: PlaybookInputs<'_>) -> Option<StrategyPlaybook> {
    let mut actions = Vec::new();
    let mut low = f64::INFINITY;
    let mut high = f64::NEG_INFINITY;
    for assessment in inputs.options.admissible() {
        let Some(action) = inputs.actions.iter().find(|a| a.name == assessment.name) else {
            continue;
        };
        let scenarios: Vec<_> = inputs
            .pack
            .scenarios
            .iter()
            .filter(|s| action.is_exposed_to(s.scenario_type))
            .collect();
        let mut falsifier_refs: Vec<FalsifierId> = Vec::new();
        for scenario in &scenarios {
            for id in &scenario.triggers {
                if !falsifier_refs.contains(id) {
                    falsifier_refs.push(*id);
                }
            }
            let bounds = outcome_in(action, scenario.scenario_type, Some(inputs.pack));
            low = low.min(bounds.low);
            high = high.max(bounds.high);
        }
        let addressed: Vec<FalsifierId> = falsifier_refs
            .iter()
            .copied()
            .filter(|id| {
                inputs.falsifiers.get(*id).is_some_and(|falsifier| {
                    action
                        .addresses
                        .iter()
                        .any(|target| overlaps(target, &falsifier.condition))
                })
            })
            .collect();
        if !addressed.is_empty() {
            falsifier_refs = addressed;
        }
        let Some(first) = falsifier_refs.first().and_then(|id| inputs.falsifiers.get(*id)) else {
            continue;
        };
        if scenarios.is_empty() {
            continue;
        }
        actions.push(PlaybookAction {
            name: action.name.clone(),
            owner: action.owner.clone(),
            trigger: format!("if '{}' fires", first.condition),
            falsifier_refs,
            scenario_refs: scenarios.iter().map(|s| s.id).collect(),
            reversible: action.reversible,
            safeguard: action.safeguard.clone(),
        });
    }
    if actions.is_empty() {
        return None;
    }
    let mut falsifier_refs: Vec<FalsifierId> = Vec::new();
    for action in &actions {
        for id in &action.falsifier_refs {
            if !falsifier_refs.contains(id) {
                falsifier_refs.push(*id);
            }
        }
    }
    let objectives = if inputs.objectives.is_empty() {
        vec![inputs.boundary.scope.clone()]
    } else {
        inputs.objectives.to_vec()
    };
    let success_metrics = if inputs.success_metrics.is_empty() {
        vec![format!(
            "no high-severity falsifier fires before the {} review",
            inputs.boundary.horizon
        )]
    } else {
        inputs.success_metrics.to_vec()
    };
    Some(StrategyPlaybook {
        id: Uuid::new_v4(),
        session_id: inputs.session_id,
        horizon: inputs.boundary.horizon,
        objectives,
        actions,
        success_metrics,
        falsifier_refs,
        risk_bounds: OutcomeBounds::new(low, high),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{artifacts::Horizon, will::WillDraft};

    fn boundary(strategic: bool) -> Boundary {
        Boundary {
            scope: "Iberian market entry".into(),
            horizon: Horizon::H2,
            constraints: vec!["budget 2M".into()],
            stakeholders: vec!["board".into()],
            strategic,
        }
    }

    fn will() -> WillVector {
        WillVector::from_draft(
            "acme",
            WillDraft::new("durable growth").non_negotiable("customer data privacy"),
            1,
        )
    }

    fn proceed(outcome: GateOutcome<OptionMap>) -> OptionMap {
        match outcome {
            GateOutcome::Proceed(map) => map,
            other => panic!("expected proceed, got {other:?}"),
        }
    }

    #[test]
    fn selects_minimum_regret_and_excludes_without_penalty() {
        let actions = vec![
            CandidateAction::new("pilot in Lisbon", "growth")
                .outcome(ScenarioType::Base, 0.0, 0.2)
                .outcome(ScenarioType::Downside, -0.2, 0.0),
            CandidateAction::new("full launch", "growth")
                .outcome(ScenarioType::Base, 0.2, 0.6)
                .outcome(ScenarioType::Downside, -0.45, 0.0),
            CandidateAction::new("sell customer data", "growth")
                .compromising("Customer data privacy")
                .outcome(ScenarioType::Base, 0.5, 0.9),
            CandidateAction::new("buy competitor", "cfo").irreversible(None),
        ];
        let map = proceed(OptionMapper::new(0.5).map(&boundary(true), &actions, None, &will()));
        assert_eq!(map.assessments[2].excluded, Some(ReasonCode::WillConflict));
        assert_eq!(
            map.assessments[3].excluded,
            Some(ReasonCode::IrreversibleWithoutSafeguard)
        );
        // pilot regret: base 0.2 short; full launch regret: downside 0.25 short.
        assert_eq!(map.selected.as_deref(), Some("pilot in Lisbon"));
        assert_eq!(map.assessments[1].least_suited, Some(ScenarioType::Downside));
    }

    #[test]
    fn all_over_ceiling_waits_and_all_excluded_refuses() {
        let risky = vec![CandidateAction::new("leveraged expansion", "cfo")
            .outcome(ScenarioType::Downside, -0.9, 0.1)];
        let outcome = OptionMapper::new(0.5).map(&boundary(true), &risky, None, &will());
        assert_eq!(outcome.wait().unwrap().code, ReasonCode::DownsideExceedsCeiling);

        let mut hype = CandidateAction::new("moonshot", "ceo");
        hype.unbounded_upside = true;
        let outcome = OptionMapper::new(0.5).map(&boundary(true), &[hype], None, &will());
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::UnboundedUpside);
    }

    #[test]
    fn plans_without_candidates_wait() {
        let outcome = OptionMapper::new(0.5).map(&boundary(true), &[], None, &will());
        assert_eq!(outcome.wait().unwrap().code, ReasonCode::NoCandidateActions);
        let map = proceed(OptionMapper::new(0.5).map(&boundary(false), &[], None, &will()));
        assert!(map.selected.is_none());
    }

    #[test]
    fn ties_break_on_optionality_then_name() {
        let actions = vec![
            CandidateAction::new("beta", "ops").optionality(0.4),
            CandidateAction::new("alpha", "ops").optionality(0.4),
            CandidateAction::new("gamma", "ops").optionality(0.9),
        ];
        let map = proceed(OptionMapper::new(0.5).map(&boundary(false), &actions, None, &will()));
        assert_eq!(map.selected.as_deref(), Some("gamma"));
        let names: Vec<_> = map.admissible().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);
    }
}
