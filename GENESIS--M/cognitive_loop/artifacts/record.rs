use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    ArtifactId, ArtifactViolation, AssumptionId, AssumptionStatus, FalsifierId, PrincipalId,
    RecordId, ScenarioType, SessionId, Severity,
};
use crate::{
    refusal::{ReasonCode, RefusalFamily},
    session::Stage,
    will::WillRef,
};

/// Terminal verdict of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    /// Every gate passed.
    Proceed,
    /// More information is required.
    Wait,
    /// A gate refused.
    Refuse,
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Proceed => "PROCEED",
            Self::Wait => "WAIT",
            Self::Refuse => "REFUSE",
        };
        f.write_str(label)
    }
}

/// Which gate stopped the run and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefusalSummary {
    /// First gate that refused or asked to wait.
    pub gate: Stage,
    /// Refusal family.
    pub family: RefusalFamily,
    /// Reason code.
    pub code: ReasonCode,
}

/// Assumption as it stood when the record was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumptionDigest {
    /// Assumption id.
    pub id: AssumptionId,
    /// Ledger name.
    pub name: String,
    /// Status at record time.
    pub status: AssumptionStatus,
}

/// Falsifier summary carried inline on the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FalsifierDigest {
    /// Falsifier id.
    pub id: FalsifierId,
    /// Condition text.
    pub condition: String,
    /// Severity.
    pub severity: Severity,
}

/// The single auditable outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Record id.
    pub id: RecordId,
    /// Session the record closes.
    pub session_id: SessionId,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Will version the session ran against.
    pub will_ref: WillRef,
    /// Verdict.
    pub decision_status: DecisionStatus,
    /// True for REFUSE and WAIT.
    pub refusal_check: bool,
    /// Gate, family and code when not PROCEED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<RefusalSummary>,
    /// Assumption ledger artifact.
    #[serde(default)]
    pub assumptions_ref: Option<ArtifactId>,
    /// Falsifier set artifact.
    #[serde(default)]
    pub falsifiers_ref: Option<ArtifactId>,
    /// Scenario pack artifact.
    #[serde(default)]
    pub scenario_ref: Option<ArtifactId>,
    /// Strategy playbook artifact.
    #[serde(default)]
    pub playbook_ref: Option<ArtifactId>,
    /// Inline assumption summary.
    #[serde(default)]
    pub assumptions: Vec<AssumptionDigest>,
    /// Inline falsifier summary.
    #[serde(default)]
    pub falsifiers: Vec<FalsifierDigest>,
    /// Scenario tags present, if framed.
    #[serde(default)]
    pub scenario_tags: Option<Vec<ScenarioType>>,
    /// Why this verdict.
    pub rationale: String,
    /// Items to resolve before retrying (WAIT only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub information_request: Vec<String>,
    /// Selected action or softened path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_path: Option<String>,
    /// Stages executed, in order.
    pub stages_run: Vec<Stage>,
    /// Whether the request carried a claim or plan.
    #[serde(default)]
    pub claim_bearing: bool,
    /// Persist time. Excluded from canonical comparison.
    pub recorded_at: DateTime<Utc>,
}

impl DecisionRecord {
    /// JSON form with timestamps removed, for idempotence comparison.
    #[must_use]
    pub fn canonical_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("recorded_at");
        }
        value
    }

    /// Whether the record depends on the given assumption.
    #[must_use]
    pub fn depends_on(&self, assumption: AssumptionId) -> bool {
        self.assumptions.iter().any(|digest| digest.id == assumption)
    }

    /// Whether the record references the given scenario tag set.
    #[must_use]
    pub fn has_scenario(&self, tag: ScenarioType) -> bool {
        self.scenario_tags
            .as_ref()
            .is_some_and(|tags| tags.contains(&tag))
    }

    /// Status, refusal and traceability invariants.
    pub fn validate(&self) -> Result<(), ArtifactViolation> {
        let invalid = |reason: &str| ArtifactViolation::new("DecisionRecord", reason);
        let refusing = self.decision_status != DecisionStatus::Proceed;
        if self.refusal_check != refusing {
            return Err(invalid("refusal_check must be true exactly for REFUSE and WAIT"));
        }
        if refusing != self.refusal.is_some() {
            return Err(invalid("refusal summary must be present exactly when not PROCEED"));
        }
        if let Some(refusal) = &self.refusal {
            if refusal.code.family() != refusal.family {
                return Err(invalid("reason code does not belong to the stated family"));
            }
        }
        if self.decision_status == DecisionStatus::Wait && self.information_request.is_empty() {
            return Err(invalid("WAIT must name the information to resolve"));
        }
        if self.decision_status == DecisionStatus::Proceed
            && self.claim_bearing
            && self.falsifiers.is_empty()
        {
            return Err(invalid("PROCEED on a claim-bearing request needs falsifiers"));
        }
        if self.rationale.trim().is_empty() {
            return Err(invalid("rationale is empty"));
        }
        if self.stages_run.last() != Some(&Stage::DecisionRecorder) {
            return Err(invalid("decision recorder must be the last stage run"));
        }
        if self.stages_run.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(invalid("stages must run in pipeline order without repeats"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn refused() -> DecisionRecord {
        DecisionRecord {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            principal: "acme".into(),
            will_ref: WillRef {
                will_id: Uuid::new_v4(),
                version: 1,
            },
            decision_status: DecisionStatus::Refuse,
            refusal_check: true,
            refusal: Some(RefusalSummary {
                gate: Stage::ContextBoundary,
                family: RefusalFamily::Structural,
                code: ReasonCode::MissingHorizon,
            }),
            assumptions_ref: None,
            falsifiers_ref: None,
            scenario_ref: None,
            playbook_ref: None,
            assumptions: Vec::new(),
            falsifiers: Vec::new(),
            scenario_tags: None,
            rationale: "ambiguous boundary: horizon".into(),
            information_request: Vec::new(),
            chosen_path: None,
            stages_run: vec![Stage::ContextBoundary, Stage::DecisionRecorder],
            claim_bearing: false,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn canonical_json_ignores_record_time() {
        let first = refused();
        let mut second = first.clone();
        second.recorded_at = first.recorded_at + chrono::Duration::seconds(5);
        assert_eq!(first.canonical_json(), second.canonical_json());
        assert!(first.canonical_json().get("recorded_at").is_none());
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_value(refused()).unwrap();
        assert_eq!(json["decision_status"], "REFUSE");
        assert_eq!(json["refusal"]["code"], "missing_horizon");
    }

    #[test]
    fn validate_catches_family_mismatch_and_stage_order() {
        assert!(refused().validate().is_ok());
        let mut wrong_family = refused();
        wrong_family.refusal = Some(RefusalSummary {
            gate: Stage::ContextBoundary,
            family: RefusalFamily::Epistemic,
            code: ReasonCode::MissingHorizon,
        });
        assert!(wrong_family.validate().is_err());
        let mut reordered = refused();
        reordered.stages_run = vec![Stage::DecisionRecorder, Stage::ContextBoundary];
        assert!(reordered.validate().is_err());
    }
}
