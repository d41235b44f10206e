use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PrincipalId, ScenarioId, SignalId};

/// Time-indexed weak signal. Never deleted; a newer signal may supersede it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeakSignal {
    /// Signal id.
    pub id: SignalId,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Observation text.
    pub description: String,
    /// When it was observed.
    pub observed_at: DateTime<Utc>,
    /// Scenarios this signal indicates.
    #[serde(default)]
    pub linked_scenario_ids: Vec<ScenarioId>,
    /// Earlier signal this one replaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<SignalId>,
}

impl WeakSignal {
    /// Creates a signal.
    #[must_use]
    pub fn new(
        principal: impl Into<PrincipalId>,
        description: impl Into<String>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.into(),
            description: description.into(),
            observed_at,
            linked_scenario_ids: Vec::new(),
            supersedes: None,
        }
    }

    /// Links the signal to a scenario.
    #[must_use]
    pub fn linked_to(mut self, scenario: ScenarioId) -> Self {
        if !self.linked_scenario_ids.contains(&scenario) {
            self.linked_scenario_ids.push(scenario);
        }
        self
    }

    /// New signal replacing this one; the original stays in the log.
    #[must_use]
    pub fn supersede(&self, description: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: self.principal.clone(),
            description: description.into(),
            observed_at,
            linked_scenario_ids: self.linked_scenario_ids.clone(),
            supersedes: Some(self.id),
        }
    }
}

/// Signals that no later signal supersedes, oldest first.
#[must_use]
pub fn current_signals(signals: &[WeakSignal]) -> Vec<&WeakSignal> {
    let mut current: Vec<&WeakSignal> = signals
        .iter()
        .filter(|signal| {
            !signals
                .iter()
                .any(|other| other.supersedes == Some(signal.id))
        })
        .collect();
    current.sort_by_key(|signal| signal.observed_at);
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superseded_signals_drop_out_of_current_view() {
        let first = WeakSignal::new("acme", "competitor hiring sales staff", Utc::now());
        let second = first.supersede("competitor announced regional launch", Utc::now());
        let log = vec![first.clone(), second.clone()];
        let current = current_signals(&log);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, second.id);
        assert_eq!(second.supersedes, Some(first.id));
    }
}
