#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Cognitive loop: staged decision governance over an untrusted reasoner.
//!
//! A request passes the context boundary, knowledge sufficiency, falsifier,
//! scenario, and option gates, and always ends in exactly one decision record
//! (PROCEED, WAIT, or REFUSE) in the append-only audit log.

/// Canonical artifacts and identities.
#[path = "../artifacts/main.rs"]
pub mod artifacts;

/// Loop thresholds loaded from TOML.
pub mod config;

/// Refusal taxonomy.
pub mod refusal;

/// Session state and requests.
#[path = "../session.rs"]
pub mod session;

/// Principal-scoped Will and its anchor.
#[path = "../will.rs"]
pub mod will;

/// Audit log backends and queries.
#[path = "../store.rs"]
pub mod store;

/// Reasoner seam and draft parsing.
#[path = "../reasoner.rs"]
pub mod reasoner;

/// Gating stages.
#[path = "../gates/main.rs"]
pub mod gates;

/// Terminal recorder with retry.
#[path = "../recorder.rs"]
pub mod recorder;

/// Drift monitor and strictness.
#[path = "../drift.rs"]
pub mod drift;

/// Telemetry builder/hook for loop components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Operational errors.
#[path = "../error.rs"]
pub mod error;

/// Loop entry point.
#[path = "../main.rs"]
pub mod runtime;

pub use artifacts::{CanonicalArtifact, DecisionRecord, DecisionStatus, Horizon};
pub use config::LoopConfig;
pub use drift::{DriftEvent, DriftMonitor, OutcomeObservation, StrictnessRegistry};
pub use error::LoopError;
pub use gates::{CandidateAction, GateOutcome};
pub use reasoner::{Reasoner, ReasonerError, StaticReasoner};
pub use recorder::{DecisionRecorder, RetryPolicy};
pub use refusal::{ReasonCode, RefusalFamily};
pub use runtime::{CognitiveLoop, CognitiveLoopBuilder, SessionOutcome};
pub use session::{DecisionRequest, SessionStatus, Stage};
pub use store::{AuditLog, JsonlAuditLog, MemoryAuditLog};
pub use telemetry::{LoopTelemetry, LoopTelemetryBuilder};
pub use will::{WillAnchor, WillDraft, WillVector};
