use std::collections::BTreeMap;

use super::{
    helper::{find_marker, overlaps, UNFALSIFIABLE_MARKERS},
    CandidateAction, GateOutcome,
};
use crate::{
    artifacts::{
        content_id, normalize_statement, AssumptionEntry, AssumptionLedger, Falsifier,
        FalsifierSet, Severity,
    },
    reasoner::DraftFalsifier,
    refusal::{ReasonCode, Refusal},
    session::Stage,
    will::WillVector,
};

/// Builds the counterexamples a conclusion must survive.
#[derive(Debug, Clone, Copy, Default)]
pub struct FalsifierEngine;

/// Inputs the engine reads from the session.
#[derive(Debug, Clone, Copy)]
pub struct FalsifierInputs<'a> {
    /// Claims from the knowledge assessment.
    pub claims: &'a [String],
    /// Session ledger.
    pub ledger: &'a AssumptionLedger,
    /// Reasoner candidates.
    pub candidates: &'a [DraftFalsifier],
    /// Candidate actions (caller and reasoner).
    pub actions: &'a [CandidateAction],
    /// Anchored Will.
    pub will: &'a WillVector,
    /// Whether the request carries a claim or plan.
    pub claim_bearing: bool,
}

fn touches_will(will: &WillVector, text: &str) -> bool {
    will.non_negotiables
        .iter()
        .chain(will.priority_axes.iter())
        .any(|value| overlaps(value, text))
}

fn references(entry: &AssumptionEntry, claims: &[String], actions: &[CandidateAction]) -> usize {
    let claim_refs = claims
        .iter()
        .filter(|claim| overlaps(claim, &entry.statement))
        .count();
    let action_refs = actions
        .iter()
        .filter(|action| {
            action.addresses.iter().any(|target| {
                normalize_statement(target) == normalize_statement(&entry.name)
                    || overlaps(target, &entry.statement)
            })
        })
        .count();
    claim_refs + action_refs
}

fn derived_severity(will: &WillVector, entry: &AssumptionEntry, refs: usize) -> Severity {
    if touches_will(will, &entry.statement) || refs >= 2 {
        Severity::High
    } else if refs == 1 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn is_valid_candidate(candidate: &DraftFalsifier) -> bool {
    !candidate.condition.trim().is_empty()
        && find_marker(&candidate.condition, UNFALSIFIABLE_MARKERS).is_none()
}

impl FalsifierEngine {
    /// Produces a deterministic, deduplicated falsifier set.
    #[must_use]
    pub fn run(&self, inputs: FalsifierInputs<'_>) -> GateOutcome<FalsifierSet> {
        let refuse = |rationale: String| {
            GateOutcome::Refuse(Refusal::new(
                Stage::Falsifier,
                ReasonCode::UnfalsifiableClaim,
                rationale,
            ))
        };
        let candidates: Vec<&DraftFalsifier> = inputs
            .candidates
            .iter()
            .filter(|candidate| is_valid_candidate(candidate))
            .collect();

        for claim in inputs.claims {
            if let Some(marker) = find_marker(claim, UNFALSIFIABLE_MARKERS) {
                let targeted = candidates.iter().any(|candidate| {
                    candidate
                        .claim
                        .as_deref()
                        .is_some_and(|target| normalize_statement(target) == normalize_statement(claim))
                });
                if !targeted {
                    return refuse(format!(
                        "claim `{claim}` uses absolute language (`{marker}`) and admits no counterexample"
                    ));
                }
            }
        }

        let mut by_condition: BTreeMap<String, Falsifier> = BTreeMap::new();
        let mut insert = |falsifier: Falsifier| {
            let key = normalize_statement(&falsifier.condition);
            by_condition
                .entry(key)
                .and_modify(|existing| {
                    existing.severity = existing.severity.max(falsifier.severity);
                    if existing.assumption_ref.is_none() {
                        existing.assumption_ref = falsifier.assumption_ref;
                    }
                    if existing.claim.is_none() {
                        existing.claim.clone_from(&falsifier.claim);
                    }
                })
                .or_insert(falsifier);
        };

        for entry in inputs.ledger.load_bearing() {
            let refs = references(entry, inputs.claims, inputs.actions);
            let derived = derived_severity(inputs.will, entry, refs);
            let attached: Vec<&&DraftFalsifier> = candidates
                .iter()
                .filter(|candidate| {
                    candidate.assumption.as_deref().is_some_and(|target| {
                        inputs.ledger.find(target).is_some_and(|found| found.id == entry.id)
                    })
                })
                .collect();
            if attached.is_empty() {
                let condition = format!("{} no longer holds", entry.statement);
                insert(Falsifier {
                    id: content_id("falsifier", &condition),
                    condition,
                    detection_method: format!(
                        "review evidence for {} at each horizon checkpoint",
                        entry.name
                    ),
                    severity: derived,
                    assumption_ref: Some(entry.id),
                    claim: None,
                });
            }
            for candidate in attached {
                insert(Falsifier {
                    id: content_id("falsifier", &candidate.condition),
                    condition: candidate.condition.trim().to_string(),
                    detection_method: candidate
                        .detection_method
                        .clone()
                        .unwrap_or_else(|| format!("monitor for: {}", candidate.condition.trim())),
                    severity: candidate.severity.unwrap_or(derived),
                    assumption_ref: Some(entry.id),
                    claim: candidate.claim.clone(),
                });
            }
        }

        for candidate in candidates.iter().filter(|candidate| {
            candidate
                .assumption
                .as_deref()
                .map_or(true, |target| inputs.ledger.find(target).is_none())
        }) {
            let severity = candidate.severity.unwrap_or_else(|| {
                if touches_will(inputs.will, &candidate.condition) {
                    Severity::High
                } else {
                    Severity::Medium
                }
            });
            insert(Falsifier {
                id: content_id("falsifier", &candidate.condition),
                condition: candidate.condition.trim().to_string(),
                detection_method: candidate
                    .detection_method
                    .clone()
                    .unwrap_or_else(|| format!("monitor for: {}", candidate.condition.trim())),
                severity,
                assumption_ref: None,
                claim: candidate.claim.clone(),
            });
        }

        let falsifiers: Vec<Falsifier> = by_condition.into_values().collect();
        if falsifiers.is_empty() && inputs.claim_bearing {
            return refuse("claim-bearing request produced no falsifier".into());
        }
        GateOutcome::Proceed(FalsifierSet::new(falsifiers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{artifacts::AssumptionOrigin, will::WillDraft};
    use uuid::Uuid;

    fn will() -> WillVector {
        WillVector::from_draft(
            "acme",
            WillDraft::new("grow without debt").priority("cash runway"),
            1,
        )
    }

    fn ledger() -> AssumptionLedger {
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        ledger.declare(None, "funding secured", AssumptionOrigin::Request, None);
        ledger.declare(None, "no new competitor", AssumptionOrigin::Request, None);
        ledger
    }

    fn run(
        claims: &[String],
        ledger: &AssumptionLedger,
        candidates: &[DraftFalsifier],
        will: &WillVector,
    ) -> GateOutcome<FalsifierSet> {
        FalsifierEngine.run(FalsifierInputs {
            claims,
            ledger,
            candidates,
            actions: &[],
            will,
            claim_bearing: true,
        })
    }

    #[test]
    fn every_active_assumption_gets_a_falsifier() {
        let will = will();
        let ledger = ledger();
        let GateOutcome::Proceed(set) = run(&[], &ledger, &[], &will) else {
            panic!("expected proceed");
        };
        assert_eq!(set.len(), 2);
        for entry in &ledger.entries {
            assert!(set
                .falsifiers
                .iter()
                .any(|falsifier| falsifier.assumption_ref == Some(entry.id)));
        }
        assert!(set.conditions().contains("funding secured no longer holds"));
    }

    #[test]
    fn identical_input_yields_identical_set() {
        let will = will();
        let ledger = ledger();
        let candidates = vec![DraftFalsifier {
            condition: "Competitor announces regional launch".into(),
            detection_method: None,
            severity: Some(Severity::High),
            assumption: Some("no new competitor".into()),
            claim: None,
        }];
        let first = run(&[], &ledger, &candidates, &will);
        let second = run(&[], &ledger, &candidates, &will);
        match (first, second) {
            (GateOutcome::Proceed(first), GateOutcome::Proceed(second)) => {
                assert_eq!(first.falsifiers, second.falsifiers);
                assert_eq!(first.max_severity(), Some(Severity::High));
            }
            other => panic!("expected proceed twice, got {other:?}"),
        }
    }

    #[test]
    fn absolute_claim_without_candidate_is_refused() {
        let will = will();
        let claims = vec!["This launch cannot fail".to_string()];
        let outcome = run(&claims, &ledger(), &[], &will);
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::UnfalsifiableClaim);

        let empty = AssumptionLedger::new(Uuid::new_v4());
        let outcome = run(&[], &empty, &[], &will);
        assert_eq!(outcome.refusal().unwrap().code, ReasonCode::UnfalsifiableClaim);
    }

    #[test]
    fn will_axis_overlap_raises_severity() {
        let will = will();
        let mut ledger = AssumptionLedger::new(Uuid::new_v4());
        ledger.declare(None, "cash runway covers 18 months", AssumptionOrigin::Request, None);
        ledger.declare(None, "supplier keeps prices", AssumptionOrigin::Request, None);
        let GateOutcome::Proceed(set) = run(&[], &ledger, &[], &will) else {
            panic!("expected proceed");
        };
        let severities: Vec<_> = set.falsifiers.iter().map(|f| f.severity).collect();
        assert_eq!(severities, vec![Severity::High, Severity::Low]);
    }
}
