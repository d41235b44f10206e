use serde::{Deserialize, Serialize};

use super::{
    ArtifactId, ArtifactViolation, FalsifierId, FalsifierSet, Horizon, OutcomeBounds, ScenarioId,
    SessionId,
};

/// Action with an owner and the condition that sets it in motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookAction {
    /// Action name.
    pub name: String,
    /// Accountable owner.
    pub owner: String,
    /// Trigger condition, phrased from a falsifier.
    pub trigger: String,
    /// Falsifiers the action traces to.
    pub falsifier_refs: Vec<FalsifierId>,
    /// Scenarios the action is exposed to.
    pub scenario_refs: Vec<ScenarioId>,
    /// Whether the action can be undone.
    pub reversible: bool,
    /// Rollback or safeguard for irreversible actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safeguard: Option<String>,
}

/// Horizon-scoped plan of traced actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPlaybook {
    /// Artifact id.
    pub id: ArtifactId,
    /// Owning session.
    pub session_id: SessionId,
    /// Horizon.
    pub horizon: Horizon,
    /// Objectives.
    pub objectives: Vec<String>,
    /// Actions, selected action first.
    pub actions: Vec<PlaybookAction>,
    /// Success metrics.
    pub success_metrics: Vec<String>,
    /// Union of the actions' falsifier references.
    pub falsifier_refs: Vec<FalsifierId>,
    /// Outcome range across admissible actions and scenarios.
    pub risk_bounds: OutcomeBounds,
}

impl StrategyPlaybook {
    /// Every action traces to at least one falsifier and one scenario; when the
    /// session's falsifier set is supplied, every reference must resolve in it.
    pub fn validate(&self, falsifiers: Option<&FalsifierSet>) -> Result<(), ArtifactViolation> {
        let invalid = |reason: String| ArtifactViolation::new("StrategyPlaybook", reason);
        if self.actions.is_empty() {
            return Err(invalid("playbook has no actions".into()));
        }
        if !self.risk_bounds.is_well_formed() {
            return Err(invalid("risk bounds are not an ordered finite range".into()));
        }
        for action in &self.actions {
            if action.falsifier_refs.is_empty() {
                return Err(invalid(format!("action `{}` traces to no falsifier", action.name)));
            }
            if action.scenario_refs.is_empty() {
                return Err(invalid(format!("action `{}` traces to no scenario", action.name)));
            }
            if !action.reversible
                && action
                    .safeguard
                    .as_deref()
                    .map_or(true, |safeguard| safeguard.trim().is_empty())
            {
                return Err(invalid(format!(
                    "irreversible action `{}` has no safeguard",
                    action.name
                )));
            }
            if let Some(set) = falsifiers {
                if let Some(missing) = action.falsifier_refs.iter().find(|id| !set.contains(**id)) {
                    return Err(invalid(format!(
                        "action `{}` references falsifier {missing} outside the session set",
                        action.name
                    )));
                }
            }
            if let Some(missing) = action
                .falsifier_refs
                .iter()
                .find(|id| !self.falsifier_refs.contains(id))
            {
                return Err(invalid(format!(
                    "action `{}` references falsifier {missing} missing from the playbook",
                    action.name
                )));
            }
        }
        Ok(())
    }
}
