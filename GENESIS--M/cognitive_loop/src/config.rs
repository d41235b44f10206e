use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    artifacts::{Horizon, OutcomeBounds, ScenarioType},
    recorder::RetryPolicy,
};

/// Tunable thresholds of the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Unknown load tolerated per horizon.
    pub unknown_tolerance_by_horizon: BTreeMap<Horizon, usize>,
    /// Largest acceptable downside exposure. An action without its own
    /// estimates is measured against the adverse `scenario_defaults`, so a
    /// default Downside or Wildcard low below `-downside_ceiling` makes every
    /// unestimated action WAIT.
    pub downside_ceiling: f64,
    /// Distinct scenario types a pack needs.
    pub min_scenario_types: usize,
    /// Divisor applied to tolerance while a principal is under raised strictness.
    pub drift_strictness_multiplier: f64,
    /// Load above tolerance that still yields WAIT rather than REFUSE.
    pub wait_margin: usize,
    /// Reasoner call budget.
    pub reasoner_timeout_ms: u64,
    /// Retry policy for audit log writes.
    pub storage_retry: RetryPolicy,
    /// Bounds used when the reasoner supplies none. The adverse defaults sit
    /// inside the default `downside_ceiling`.
    pub scenario_defaults: BTreeMap<ScenarioType, OutcomeBounds>,
    /// Period of the background drift pass.
    pub drift_interval_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            unknown_tolerance_by_horizon: default_tolerances(),
            downside_ceiling: 0.5,
            min_scenario_types: 2,
            drift_strictness_multiplier: 2.0,
            wait_margin: 1,
            reasoner_timeout_ms: 30_000,
            storage_retry: RetryPolicy::default(),
            scenario_defaults: default_scenario_bounds(),
            drift_interval_ms: 60_000,
        }
    }
}

fn default_tolerances() -> BTreeMap<Horizon, usize> {
    BTreeMap::from([(Horizon::H1, 0), (Horizon::H2, 2), (Horizon::H3, 5)])
}

fn default_scenario_bounds() -> BTreeMap<ScenarioType, OutcomeBounds> {
    BTreeMap::from([
        (ScenarioType::Base, OutcomeBounds::new(-0.1, 0.3)),
        (ScenarioType::Upside, OutcomeBounds::new(0.2, 0.8)),
        (ScenarioType::Downside, OutcomeBounds::new(-0.4, -0.05)),
        (ScenarioType::Wildcard, OutcomeBounds::new(-0.45, 0.4)),
    ])
}

impl LoopConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading loop config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses TOML, fills gaps with defaults, and validates.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for (horizon, tolerance) in default_tolerances() {
            self.unknown_tolerance_by_horizon
                .entry(horizon)
                .or_insert(tolerance);
        }
        for (scenario, bounds) in default_scenario_bounds() {
            self.scenario_defaults.entry(scenario).or_insert(bounds);
        }
        if self.min_scenario_types == 0 {
            self.min_scenario_types = 2;
        }
    }

    /// Rejects thresholds the gates cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(self.downside_ceiling.is_finite() && self.downside_ceiling >= 0.0) {
            bail!("downside_ceiling must be a non-negative number");
        }
        if !(2..=4).contains(&self.min_scenario_types) {
            bail!(
                "min_scenario_types must be between 2 and 4, got {}",
                self.min_scenario_types
            );
        }
        if !(self.drift_strictness_multiplier.is_finite() && self.drift_strictness_multiplier >= 1.0)
        {
            bail!("drift_strictness_multiplier must be at least 1.0");
        }
        if self.reasoner_timeout_ms == 0 {
            bail!("reasoner_timeout_ms must be positive");
        }
        if self.storage_retry.max_attempts == 0 {
            bail!("storage_retry.max_attempts must be positive");
        }
        for (scenario, bounds) in &self.scenario_defaults {
            if !bounds.is_well_formed() || bounds.is_point() {
                bail!(
                    "scenario_defaults.{scenario} must be an ordered range, got [{}, {}]",
                    bounds.low,
                    bounds.high
                );
            }
        }
        Ok(())
    }

    /// Unknown tolerance at a horizon, reduced while strictness is raised.
    #[must_use]
    pub fn tolerance_for(&self, horizon: Horizon, strict: bool) -> usize {
        let base = self
            .unknown_tolerance_by_horizon
            .get(&horizon)
            .copied()
            .unwrap_or(0);
        if strict {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let reduced = (base as f64 / self.drift_strictness_multiplier).floor() as usize;
            reduced
        } else {
            base
        }
    }

    /// Default bounds for a scenario type.
    #[must_use]
    pub fn default_bounds(&self, scenario: ScenarioType) -> OutcomeBounds {
        self.scenario_defaults
            .get(&scenario)
            .copied()
            .unwrap_or(OutcomeBounds::new(-0.5, 0.5))
    }

    /// Reasoner call budget.
    #[must_use]
    pub const fn reasoner_timeout(&self) -> Duration {
        Duration::from_millis(self.reasoner_timeout_ms)
    }

    /// Period of the background drift pass.
    #[must_use]
    pub const fn drift_interval(&self) -> Duration {
        Duration::from_millis(self.drift_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = LoopConfig::from_toml_str(
            r#"
downside_ceiling = 0.3

[unknown_tolerance_by_horizon]
H3 = 4

[scenario_defaults.Downside]
low = -0.9
high = -0.2
"#,
        )
        .unwrap();
        assert_eq!(config.tolerance_for(Horizon::H3, false), 4);
        assert_eq!(config.tolerance_for(Horizon::H2, false), 2);
        assert_eq!(config.default_bounds(ScenarioType::Downside).low, -0.9);
        assert_eq!(config.default_bounds(ScenarioType::Base).high, 0.3);
        assert_eq!(config.min_scenario_types, 2);
    }

    #[test]
    fn strictness_divides_and_floors_tolerance() {
        let config = LoopConfig::default();
        assert_eq!(config.tolerance_for(Horizon::H2, true), 1);
        assert_eq!(config.tolerance_for(Horizon::H3, true), 2);
        assert_eq!(config.tolerance_for(Horizon::H1, true), 0);
    }

    #[test]
    fn default_adverse_bounds_fit_under_the_default_ceiling() {
        let config = LoopConfig::default();
        for scenario in [ScenarioType::Downside, ScenarioType::Wildcard] {
            assert!(-config.default_bounds(scenario).low <= config.downside_ceiling);
        }
    }

    #[test]
    fn load_rejects_invalid_thresholds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loop.toml");
        fs::write(&path, "min_scenario_types = 7\n").unwrap();
        let err = LoopConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("min_scenario_types"));
    }
}
