use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ArtifactId, ArtifactViolation, AssumptionId, FalsifierId, ScenarioId, SessionId, SignalId};

/// The four fixed scenario tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScenarioType {
    /// Assumptions hold.
    Base,
    /// Favourable deviation.
    Upside,
    /// Unfavourable deviation.
    Downside,
    /// Low-probability, high-impact break.
    Wildcard,
}

impl ScenarioType {
    /// Fixed ordering used when framing.
    pub const ALL: [Self; 4] = [Self::Base, Self::Upside, Self::Downside, Self::Wildcard];

    /// Canonical label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Base => "Base",
            Self::Upside => "Upside",
            Self::Downside => "Downside",
            Self::Wildcard => "Wildcard",
        }
    }

    /// Scenarios that count toward downside exposure.
    #[must_use]
    pub const fn is_adverse(self) -> bool {
        matches!(self, Self::Downside | Self::Wildcard)
    }
}

impl fmt::Display for ScenarioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ScenarioType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "upside" => Ok(Self::Upside),
            "downside" => Ok(Self::Downside),
            "wildcard" => Ok(Self::Wildcard),
            other => Err(format!("unknown scenario type `{other}`")),
        }
    }
}

impl From<ScenarioType> for String {
    fn from(value: ScenarioType) -> Self {
        value.as_str().to_string()
    }
}

/// Outcome range on a normalized index (0 = status quo, negative = loss).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeBounds {
    /// Worst case.
    pub low: f64,
    /// Best case.
    pub high: f64,
}

impl OutcomeBounds {
    /// Creates a range.
    #[must_use]
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// Finite and ordered.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.low.is_finite() && self.high.is_finite() && self.low <= self.high
    }

    /// Collapsed to a single value.
    #[must_use]
    pub fn is_point(&self) -> bool {
        (self.high - self.low).abs() < f64::EPSILON
    }
}

/// Time-indexed weak signal referenced by a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    /// Signal in the weak-signal log.
    pub signal_id: SignalId,
    /// Signal text.
    pub description: String,
    /// Observation time.
    pub observed_at: DateTime<Utc>,
}

/// One alternative future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario id.
    pub id: ScenarioId,
    /// Fixed tag.
    #[serde(rename = "type")]
    pub scenario_type: ScenarioType,
    /// Display name.
    pub name: String,
    /// Falsifiers whose firing moves the world into this scenario.
    pub triggers: Vec<FalsifierId>,
    /// Weak signals, oldest first.
    #[serde(default)]
    pub indicators: Vec<Indicator>,
    /// Outcome range.
    pub outcome_bounds: OutcomeBounds,
    /// Permits `low == high` (contractual deadlines and similar).
    #[serde(default)]
    pub certain_bound: bool,
    /// Assumptions this scenario depends on.
    #[serde(default)]
    pub assumption_links: Vec<AssumptionId>,
}

/// Bundle of tagged futures, never a single prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPack {
    /// Artifact id.
    pub id: ArtifactId,
    /// Owning session.
    pub session_id: SessionId,
    /// Scenarios, Base first.
    pub scenarios: Vec<Scenario>,
}

impl ScenarioPack {
    /// Scenario with the given tag.
    #[must_use]
    pub fn get(&self, scenario_type: ScenarioType) -> Option<&Scenario> {
        self.scenarios
            .iter()
            .find(|scenario| scenario.scenario_type == scenario_type)
    }

    /// Tags present, in pack order.
    #[must_use]
    pub fn tags(&self) -> Vec<ScenarioType> {
        self.scenarios
            .iter()
            .map(|scenario| scenario.scenario_type)
            .collect()
    }

    /// Whether a scenario id belongs to this pack.
    #[must_use]
    pub fn contains(&self, id: ScenarioId) -> bool {
        self.scenarios.iter().any(|scenario| scenario.id == id)
    }

    /// Shape invariants: exactly one Base, enough distinct tags, ranged bounds, triggers.
    pub fn validate(&self, min_types: usize) -> Result<(), ArtifactViolation> {
        let invalid = |reason: String| ArtifactViolation::new("ScenarioPack", reason);
        let bases = self
            .scenarios
            .iter()
            .filter(|scenario| scenario.scenario_type == ScenarioType::Base)
            .count();
        if bases != 1 {
            return Err(invalid(format!("expected exactly one Base scenario, found {bases}")));
        }
        let distinct: BTreeSet<ScenarioType> = self.tags().into_iter().collect();
        let required = min_types.max(2);
        if self.scenarios.len() < 2 || distinct.len() < required {
            return Err(invalid(format!(
                "{} scenario type(s) present, at least {required} required",
                distinct.len()
            )));
        }
        if distinct.len() != self.scenarios.len() {
            return Err(invalid("scenario types must not repeat".into()));
        }
        for scenario in &self.scenarios {
            let bounds = scenario.outcome_bounds;
            if !bounds.is_well_formed() {
                return Err(invalid(format!(
                    "{} outcome bounds [{}, {}] are not an ordered finite range",
                    scenario.scenario_type, bounds.low, bounds.high
                )));
            }
            if bounds.is_point() && !scenario.certain_bound {
                return Err(invalid(format!(
                    "{} outcome bounds collapse to the point {} without a certain-bound mark",
                    scenario.scenario_type, bounds.low
                )));
            }
            if scenario.triggers.is_empty() {
                return Err(invalid(format!(
                    "{} scenario has no falsifier triggers",
                    scenario.scenario_type
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn scenario(scenario_type: ScenarioType, low: f64, high: f64) -> Scenario {
        Scenario {
            id: Uuid::new_v4(),
            scenario_type,
            name: scenario_type.to_string(),
            triggers: vec![Uuid::new_v4()],
            indicators: Vec::new(),
            outcome_bounds: OutcomeBounds::new(low, high),
            certain_bound: false,
            assumption_links: Vec::new(),
        }
    }

    fn pack(scenarios: Vec<Scenario>) -> ScenarioPack {
        ScenarioPack {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            scenarios,
        }
    }

    #[test]
    fn accepts_base_plus_downside() {
        let pack = pack(vec![
            scenario(ScenarioType::Base, -0.1, 0.3),
            scenario(ScenarioType::Downside, -0.7, -0.1),
        ]);
        assert!(pack.validate(2).is_ok());
        assert_eq!(pack.tags(), vec![ScenarioType::Base, ScenarioType::Downside]);
    }

    #[test]
    fn rejects_point_bounds_unless_certain() {
        let mut downside = scenario(ScenarioType::Downside, -0.4, -0.4);
        let rejected = pack(vec![scenario(ScenarioType::Base, 0.0, 0.2), downside.clone()]);
        assert!(rejected.validate(2).is_err());
        downside.certain_bound = true;
        let accepted = pack(vec![scenario(ScenarioType::Base, 0.0, 0.2), downside]);
        assert!(accepted.validate(2).is_ok());
    }

    #[test]
    fn rejects_single_scenario_and_inverted_bounds() {
        assert!(pack(vec![scenario(ScenarioType::Base, 0.0, 0.2)])
            .validate(2)
            .is_err());
        let inverted = pack(vec![
            scenario(ScenarioType::Base, 0.0, 0.2),
            scenario(ScenarioType::Wildcard, 0.5, -0.5),
        ]);
        assert!(inverted.validate(2).is_err());
    }

    #[test]
    fn scenario_type_parses_case_insensitively() {
        let parsed: ScenarioType = serde_json::from_str("\"downside\"").unwrap();
        assert_eq!(parsed, ScenarioType::Downside);
        assert!(ScenarioType::Wildcard.is_adverse());
        assert!(!ScenarioType::Upside.is_adverse());
    }
}
