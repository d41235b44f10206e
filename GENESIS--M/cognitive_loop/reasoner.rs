//! Seam to the natural-language reasoner and structuring of its output.
//!
//! Reasoner text is untrusted. [`parse_draft`] looks for a JSON object first
//! and falls back to tagged lines; anything else is malformed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    artifacts::{ScenarioType, Severity},
    gates::{Boundary, CandidateAction},
};

/// Failures of a reasoner call. All of them end the session as insufficient grounding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReasonerError {
    /// Backend could not be reached.
    #[error("reasoner unavailable: {0}")]
    Unavailable(String),
    /// Call exceeded its budget.
    #[error("reasoner timed out after {0:?}")]
    Timeout(Duration),
    /// Output carried no structure the loop can use.
    #[error("reasoner output malformed: {0}")]
    Malformed(String),
}

/// Natural-language reasoning backend.
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Backend label for telemetry.
    fn name(&self) -> &str;

    /// Produces free-form reasoning for a bounded request.
    async fn elicit(&self, request_text: &str, boundary: &Boundary) -> Result<String, ReasonerError>;
}

/// Assumption proposed by the reasoner, either a bare statement or named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DraftAssumption {
    /// Bare statement.
    Plain(String),
    /// Named statement.
    Named {
        /// Optional short name.
        #[serde(default)]
        name: Option<String>,
        /// Statement.
        statement: String,
    },
}

impl DraftAssumption {
    /// Optional name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Plain(_) => None,
            Self::Named { name, .. } => name.as_deref(),
        }
    }

    /// Statement text.
    #[must_use]
    pub fn statement(&self) -> &str {
        match self {
            Self::Plain(statement) | Self::Named { statement, .. } => statement,
        }
    }
}

/// Unknown named by the reasoner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftUnknown {
    /// What is unknown.
    pub statement: String,
    /// Whether the conclusion hinges on it.
    #[serde(default)]
    pub critical: bool,
}

/// Candidate falsifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftFalsifier {
    /// Observable condition.
    pub condition: String,
    /// Detection method.
    #[serde(default)]
    pub detection_method: Option<String>,
    /// Declared severity.
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Assumption name or statement it guards.
    #[serde(default)]
    pub assumption: Option<String>,
    /// Claim it targets.
    #[serde(default)]
    pub claim: Option<String>,
}

/// Scenario hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftScenario {
    /// Scenario tag.
    #[serde(rename = "type")]
    pub scenario_type: ScenarioType,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Lower bound.
    #[serde(default)]
    pub low: Option<f64>,
    /// Upper bound.
    #[serde(default)]
    pub high: Option<f64>,
    /// Permits a point range.
    #[serde(default)]
    pub certain_bound: bool,
    /// Falsifier conditions that trigger it.
    #[serde(default)]
    pub triggers: Vec<String>,
}

/// Weak signal noticed by the reasoner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftSignal {
    /// Observation.
    pub description: String,
    /// Observation time, defaults to now.
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
    /// Scenario tags the signal points at.
    #[serde(default)]
    pub scenarios: Vec<ScenarioType>,
}

/// Structured view of one reasoner reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerDraft {
    /// Verifiable facts.
    pub facts: Vec<String>,
    /// Proposed assumptions.
    pub assumptions: Vec<DraftAssumption>,
    /// Unknowns.
    pub unknowns: Vec<DraftUnknown>,
    /// Claims made.
    pub claims: Vec<String>,
    /// Candidate falsifiers.
    pub falsifiers: Vec<DraftFalsifier>,
    /// Scenario hints.
    pub scenarios: Vec<DraftScenario>,
    /// Weak signals.
    pub signals: Vec<DraftSignal>,
    /// Additional candidate actions.
    pub actions: Vec<CandidateAction>,
    /// Objectives for a playbook.
    pub objectives: Vec<String>,
    /// Success metrics for a playbook.
    pub success_metrics: Vec<String>,
}

impl ReasonerDraft {
    fn is_empty(&self) -> bool {
        self.facts.is_empty()
            && self.assumptions.is_empty()
            && self.unknowns.is_empty()
            && self.claims.is_empty()
            && self.falsifiers.is_empty()
            && self.scenarios.is_empty()
            && self.signals.is_empty()
            && self.actions.is_empty()
            && self.objectives.is_empty()
            && self.success_metrics.is_empty()
    }
}

/// First complete JSON object in `text`. Prose before or after it, braces
/// included, is ignored.
#[must_use]
pub fn extract_json(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(_))) => Some(&text[start..start + stream.byte_offset()]),
            _ => None,
        }
    })
}

/// Structures raw reasoner text.
pub fn parse_draft(text: &str) -> Result<ReasonerDraft, ReasonerError> {
    let json_error = match extract_json(text).map(serde_json::from_str::<ReasonerDraft>) {
        Some(Ok(draft)) if !draft.is_empty() => return Ok(draft),
        Some(Ok(_)) => "json object carried no known fields".to_string(),
        Some(Err(err)) => err.to_string(),
        None => "no json object found".to_string(),
    };
    let draft = parse_tagged_lines(text);
    if draft.is_empty() {
        return Err(ReasonerError::Malformed(format!(
            "{json_error}; no tagged lines either"
        )));
    }
    Ok(draft)
}

fn parse_tagged_lines(text: &str) -> ReasonerDraft {
    let mut draft = ReasonerDraft::default();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['-', '*']).trim();
        let Some((tag, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match tag.trim().to_ascii_uppercase().as_str() {
            "FACT" => draft.facts.push(value.into()),
            "ASSUMPTION" => draft.assumptions.push(DraftAssumption::Plain(value.into())),
            "UNKNOWN" => draft.unknowns.push(DraftUnknown {
                statement: value.into(),
                critical: false,
            }),
            "UNKNOWN!" => draft.unknowns.push(DraftUnknown {
                statement: value.into(),
                critical: true,
            }),
            "CLAIM" => draft.claims.push(value.into()),
            "FALSIFIER" => draft.falsifiers.push(DraftFalsifier {
                condition: value.into(),
                detection_method: None,
                severity: None,
                assumption: None,
                claim: None,
            }),
            "SIGNAL" => draft.signals.push(DraftSignal {
                description: value.into(),
                observed_at: None,
                scenarios: Vec::new(),
            }),
            "OBJECTIVE" => draft.objectives.push(value.into()),
            "METRIC" => draft.success_metrics.push(value.into()),
            _ => {}
        }
    }
    draft
}

/// Reasoner returning a fixed reply or error, optionally after a delay.
#[derive(Debug, Clone)]
pub struct StaticReasoner {
    name: String,
    reply: Result<String, ReasonerError>,
    delay: Option<Duration>,
}

impl StaticReasoner {
    /// Always replies with the given text.
    #[must_use]
    pub fn replying(reply: impl Into<String>) -> Self {
        Self {
            name: "static".into(),
            reply: Ok(reply.into()),
            delay: None,
        }
    }

    /// Always fails with the given error.
    #[must_use]
    pub fn failing(err: ReasonerError) -> Self {
        Self {
            name: "static".into(),
            reply: Err(err),
            delay: None,
        }
    }

    /// Sleeps before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Overrides the backend label.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Reasoner for StaticReasoner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn elicit(&self, _request_text: &str, _boundary: &Boundary) -> Result<String, ReasonerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let text = "Here is my analysis:\n{\"facts\": [\"pilot retained 40% of users\"], \
                    \"unknowns\": [{\"statement\": \"pricing response\", \"critical\": true}]}\nThanks.";
        let draft = parse_draft(text).unwrap();
        assert_eq!(draft.facts.len(), 1);
        assert!(draft.unknowns[0].critical);
    }

    #[test]
    fn falls_back_to_tagged_lines() {
        let text = "FACT: two distributors signed letters of intent\n\
                    - ASSUMPTION: regulator approves by Q3\n\
                    UNKNOWN!: competitor pricing\n\
                    unknown: churn after trial\n\
                    CLAIM: entry is viable within budget";
        let draft = parse_draft(text).unwrap();
        assert_eq!(draft.facts.len(), 1);
        assert_eq!(draft.assumptions[0].statement(), "regulator approves by Q3");
        assert_eq!(draft.unknowns.len(), 2);
        assert!(draft.unknowns[0].critical);
        assert!(!draft.unknowns[1].critical);
        assert_eq!(draft.claims.len(), 1);
    }

    #[test]
    fn prose_without_structure_is_malformed() {
        let err = parse_draft("I think it will probably go well.").unwrap_err();
        assert!(matches!(err, ReasonerError::Malformed(_)));
        assert_eq!(extract_json("no braces"), None);
        assert_eq!(extract_json("} reversed {"), None);
    }

    #[test]
    fn braces_in_surrounding_prose_do_not_break_extraction() {
        let text = "Scale {rough}: see below\n{\"facts\": [\"demand grew 4%\"]}\nConfidence: {moderate}";
        assert_eq!(extract_json(text), Some("{\"facts\": [\"demand grew 4%\"]}"));
        let draft = parse_draft(text).unwrap();
        assert_eq!(draft.facts, vec!["demand grew 4%".to_string()]);
    }

    #[test]
    fn named_and_plain_assumptions_both_parse() {
        let draft = parse_draft(
            r#"{"assumptions": ["funding secured", {"name": "A9", "statement": "no new competitor"}]}"#,
        )
        .unwrap();
        assert_eq!(draft.assumptions[0].name(), None);
        assert_eq!(draft.assumptions[1].name(), Some("A9"));
    }
}
