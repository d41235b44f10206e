use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use genesis_cognitive_loop::{
    artifacts::AssumptionStatus,
    drift::OutcomeObservation,
    reasoner::ReasonerError,
    AuditLog, CandidateAction, CanonicalArtifact, CognitiveLoop, DecisionRequest, Horizon,
    JsonlAuditLog, LoopConfig, LoopTelemetry, StaticReasoner, WillDraft,
};
use serde_json::{json, Value};
use shared_event_bus::FileEventPublisher;
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::Runtime;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "genesis", version, about = "Cognitive loop operator CLI")]
struct Cli {
    /// Audit log (JSON lines).
    #[arg(long, global = true, default_value = "GENESIS--M/cognitive_loop/logs/audit.jsonl")]
    log: PathBuf,
    /// Loop thresholds (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Structured telemetry log.
    #[arg(long, global = true)]
    telemetry_log: Option<PathBuf>,
    /// Lowest level written to the telemetry log.
    #[arg(long, global = true, value_enum, default_value_t = LevelArg::Info)]
    telemetry_level: LevelArg,
    /// Event log (JSON lines).
    #[arg(long, global = true)]
    event_log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one request against a recorded reasoner reply.
    Run(RunArgs),
    /// Checks a canonical artifact file.
    Validate {
        /// JSON file holding one canonical artifact.
        path: PathBuf,
    },
    /// Queries the audit log.
    Audit {
        #[arg(long)]
        principal: Option<String>,
        #[arg(long)]
        assumption: Option<Uuid>,
        #[arg(long)]
        scenario: Option<Uuid>,
    },
    /// Scans every anchored principal for drift.
    Drift,
    /// Anchors a principal's Will, or re-anchors it to a new version.
    Reanchor(WillArgs),
    /// Records an observation.
    Observe {
        #[command(subcommand)]
        target: ObserveCommand,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    principal: String,
    /// Request text.
    #[arg(long)]
    request: String,
    /// File with the reasoner's reply (JSON or tagged lines).
    #[arg(long)]
    reasoner_output: PathBuf,
    #[arg(long)]
    scope: Option<String>,
    /// H1, H2, or H3.
    #[arg(long)]
    horizon: Option<String>,
    #[arg(long)]
    constraint: Vec<String>,
    #[arg(long)]
    stakeholder: Vec<String>,
    #[arg(long)]
    strategic: Option<bool>,
    /// JSON array of candidate actions.
    #[arg(long)]
    candidates: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct WillArgs {
    #[arg(long)]
    principal: String,
    #[arg(long)]
    purpose: String,
    #[arg(long)]
    non_negotiable: Vec<String>,
    #[arg(long)]
    priority: Vec<String>,
    #[arg(long)]
    ethical_bound: Vec<String>,
    #[arg(long)]
    operator: String,
    #[arg(long, default_value = "operator re-anchor")]
    reason: String,
}

#[derive(Subcommand, Debug)]
enum ObserveCommand {
    /// Moves an assumption forward.
    Assumption {
        #[arg(long)]
        principal: String,
        #[arg(long)]
        id: Uuid,
        #[arg(long, value_enum)]
        status: StatusArg,
        #[arg(long)]
        evidence: String,
    },
    /// Records the outcome of an executed action.
    Outcome {
        #[arg(long)]
        principal: String,
        #[arg(long)]
        action: String,
        #[arg(long)]
        compromised: Vec<String>,
        #[arg(long)]
        session: Option<Uuid>,
        #[arg(long, default_value = "")]
        notes: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Weakened,
    Invalidated,
    Unknown,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LevelArg> for LogLevel {
    fn from(value: LevelArg) -> Self {
        match value {
            LevelArg::Debug => Self::Debug,
            LevelArg::Info => Self::Info,
            LevelArg::Warn => Self::Warn,
            LevelArg::Error => Self::Error,
        }
    }
}

impl From<StatusArg> for AssumptionStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Weakened => Self::Weakened,
            StatusArg::Invalidated => Self::Invalidated,
            StatusArg::Unknown => Self::Unknown,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = execute(&cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute(cli: &Cli) -> Result<Value> {
    let config = match &cli.config {
        Some(path) => LoopConfig::load(path)?,
        None => LoopConfig::default(),
    };
    match &cli.command {
        Commands::Validate { path } => validate(path, &config),
        Commands::Run(args) => {
            let reply = fs::read_to_string(&args.reasoner_output).with_context(|| {
                format!("reading reasoner output {}", args.reasoner_output.display())
            })?;
            let engine = open_loop(cli, config, StaticReasoner::replying(reply).named("file"))?;
            let request = build_request(args)?;
            let runtime = Runtime::new()?;
            let outcome = runtime.block_on(engine.run(request))?;
            Ok(serde_json::to_value(CanonicalArtifact::DecisionRecord(outcome.record))?)
        }
        Commands::Audit {
            principal,
            assumption,
            scenario,
        } => {
            let engine = open_loop(cli, config, offline_reasoner())?;
            let mut summary =
                audit(engine.audit_log().as_ref(), principal.as_deref(), *assumption, *scenario)?;
            if let (Some(principal), Some(path), Some(fields)) =
                (principal, &cli.telemetry_log, summary.as_object_mut())
            {
                fields.insert(
                    "telemetry".into(),
                    serde_json::to_value(principal_telemetry(path, principal)?)?,
                );
            }
            Ok(summary)
        }
        Commands::Drift => {
            let engine = open_loop(cli, config, offline_reasoner())?;
            let detected = engine.scan_drift()?;
            Ok(json!({ "detected": detected }))
        }
        Commands::Reanchor(args) => {
            let engine = open_loop(cli, config, offline_reasoner())?;
            let mut draft = WillDraft::new(&args.purpose);
            for value in &args.non_negotiable {
                draft = draft.non_negotiable(value);
            }
            for axis in &args.priority {
                draft = draft.priority(axis);
            }
            for bound in &args.ethical_bound {
                draft = draft.ethical_bound(bound);
            }
            let will = if engine.will(&args.principal).is_some() {
                engine.reanchor(&args.principal, draft, &args.operator, &args.reason)?
            } else {
                engine.anchor(&args.principal, draft, &args.operator)?
            };
            Ok(serde_json::to_value(CanonicalArtifact::WillVector((*will).clone()))?)
        }
        Commands::Observe { target } => {
            let engine = open_loop(cli, config, offline_reasoner())?;
            match target {
                ObserveCommand::Assumption {
                    principal,
                    id,
                    status,
                    evidence,
                } => {
                    let entry =
                        engine.observe_assumption(principal, *id, (*status).into(), evidence)?;
                    Ok(json!({ "entry": entry }))
                }
                ObserveCommand::Outcome {
                    principal,
                    action,
                    compromised,
                    session,
                    notes,
                } => {
                    let mut observation = OutcomeObservation::new(principal, action).notes(notes);
                    for value in compromised {
                        observation = observation.compromising(value);
                    }
                    if let Some(session) = session {
                        observation = observation.for_session(*session);
                    }
                    let drift = engine.observe_outcome(observation)?;
                    Ok(json!({ "drift": drift }))
                }
            }
        }
    }
}

fn offline_reasoner() -> StaticReasoner {
    StaticReasoner::failing(ReasonerError::Unavailable("no reasoner configured".into()))
}

fn open_loop(cli: &Cli, config: LoopConfig, reasoner: StaticReasoner) -> Result<CognitiveLoop> {
    let log = JsonlAuditLog::open(&cli.log)
        .with_context(|| format!("opening audit log {}", cli.log.display()))?;
    let mut builder = CognitiveLoop::builder(Arc::new(reasoner))
        .config(config)
        .audit_log(Arc::new(log));
    if cli.telemetry_log.is_some() || cli.event_log.is_some() {
        let mut telemetry = LoopTelemetry::builder("genesis").min_level(cli.telemetry_level.into());
        if let Some(path) = &cli.telemetry_log {
            telemetry = telemetry.log_path(path);
        }
        if let Some(path) = &cli.event_log {
            telemetry = telemetry.event_publisher(Arc::new(FileEventPublisher::new(path)?));
        }
        builder = builder.telemetry(telemetry.build()?);
    }
    builder.build()
}

/// Telemetry records correlated with a principal, oldest first.
fn principal_telemetry(path: &Path, principal: &str) -> Result<Vec<LogRecord>> {
    let records = JsonLogger::new(path)?.read_records()?;
    Ok(records
        .into_iter()
        .filter(|record| {
            record.principal.as_deref() == Some(principal)
                || record.metadata.get("principal").and_then(Value::as_str) == Some(principal)
        })
        .collect())
}

fn build_request(args: &RunArgs) -> Result<DecisionRequest> {
    ensure!(!args.request.trim().is_empty(), "request text must not be empty");
    let mut request = DecisionRequest::new(&args.principal, &args.request);
    request.scope.clone_from(&args.scope);
    if let Some(label) = &args.horizon {
        request.horizon = Some(Horizon::try_from(label.clone()).map_err(anyhow::Error::msg)?);
    }
    request.constraints.clone_from(&args.constraint);
    request.stakeholders.clone_from(&args.stakeholder);
    request.strategic = args.strategic;
    if let Some(path) = &args.candidates {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading candidates {}", path.display()))?;
        request.candidate_actions = serde_json::from_str::<Vec<CandidateAction>>(&raw)
            .with_context(|| format!("parsing candidates {}", path.display()))?;
    }
    Ok(request)
}

fn validate(path: &Path, config: &LoopConfig) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let artifact: CanonicalArtifact = match serde_json::from_str(&raw) {
        Ok(artifact) => artifact,
        Err(err) => return Ok(json!({ "valid": false, "schema": Value::Null, "reason": err.to_string() })),
    };
    Ok(match artifact.validate(config.min_scenario_types) {
        Ok(()) => json!({ "valid": true, "schema": artifact.schema() }),
        Err(violation) => json!({
            "valid": false,
            "schema": artifact.schema(),
            "reason": violation.reason,
        }),
    })
}

fn audit(
    log: &dyn AuditLog,
    principal: Option<&str>,
    assumption: Option<Uuid>,
    scenario: Option<Uuid>,
) -> Result<Value> {
    if let Some(id) = assumption {
        return Ok(json!({ "assumption": id, "entries": log.by_assumption(id)? }));
    }
    if let Some(id) = scenario {
        return Ok(json!({ "scenario": id, "entries": log.by_scenario(id)? }));
    }
    let Some(principal) = principal else {
        bail!("audit needs --principal, --assumption, or --scenario");
    };
    Ok(json!({
        "principal": principal,
        "counts": log.kind_counts(principal)?,
        "wills": log.will_history(principal)?,
        "records": log.records(principal)?,
        "active_signals": log.active_signals(principal)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("genesis").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn anchor_run_and_audit_through_the_cli() {
        let tmp = tempdir().unwrap();
        let log = tmp.path().join("audit.jsonl");
        let log_arg = log.to_str().unwrap();
        let reply = tmp.path().join("reply.txt");
        fs::write(&reply, "UNKNOWN: adoption rate").unwrap();

        let will = execute(&cli(&[
            "reanchor", "--principal", "acme", "--purpose", "grow without debt",
            "--non-negotiable", "customer privacy", "--operator", "ops", "--log", log_arg,
        ]))
        .unwrap();
        assert_eq!(will["schema"], "WillVector");
        assert_eq!(will["artifact"]["version"], 1);

        let record = execute(&cli(&[
            "run", "--principal", "acme", "--request", "Will this product succeed in 12 months?",
            "--reasoner-output", reply.to_str().unwrap(), "--scope", "product line",
            "--constraint", "budget", "--stakeholder", "board", "--log", log_arg,
        ]))
        .unwrap();
        assert_eq!(record["schema"], "DecisionRecord");
        assert_eq!(record["artifact"]["decision_status"], "REFUSE");

        let summary = execute(&cli(&["audit", "--principal", "acme", "--log", log_arg])).unwrap();
        assert_eq!(summary["counts"]["decision"], 1);
        assert_eq!(summary["counts"]["will_anchored"], 1);
        assert!(summary.get("telemetry").is_none());

        let path = tmp.path().join("record.json");
        fs::write(&path, serde_json::to_string(&record).unwrap()).unwrap();
        let verdict = execute(&cli(&["validate", path.to_str().unwrap(), "--log", log_arg])).unwrap();
        assert_eq!(verdict["valid"], true);
    }

    #[test]
    fn audit_includes_principal_telemetry() {
        let tmp = tempdir().unwrap();
        let log = tmp.path().join("audit.jsonl");
        let telemetry = tmp.path().join("telemetry.jsonl");
        let common = [
            "--log", log.to_str().unwrap(),
            "--telemetry-log", telemetry.to_str().unwrap(),
        ];
        let mut args = vec!["reanchor", "--principal", "acme", "--purpose", "grow", "--operator", "ops"];
        args.extend(common);
        execute(&cli(&args)).unwrap();

        let mut args = vec!["audit", "--principal", "acme"];
        args.extend(common);
        let summary = execute(&cli(&args)).unwrap();
        let records = summary["telemetry"].as_array().unwrap();
        assert!(records.iter().any(|record| record["message"] == "loop.will.anchored"));

        let mut args = vec!["audit", "--principal", "globex"];
        args.extend(common);
        let summary = execute(&cli(&args)).unwrap();
        assert!(summary["telemetry"].as_array().unwrap().is_empty());
    }

    #[test]
    fn audit_without_filters_is_rejected() {
        let tmp = tempdir().unwrap();
        let log = tmp.path().join("audit.jsonl");
        let err = execute(&cli(&["audit", "--log", log.to_str().unwrap()])).unwrap_err();
        assert!(err.to_string().contains("--principal"));
    }
}
