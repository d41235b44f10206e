//! Append-only audit log and artifact store.
//!
//! Every durable fact is a [`LogEntry`]: decision records, session artifacts,
//! weak signals, assumption status events, Will anchors, drift events and
//! outcome observations. Entries are never rewritten; queries fold over the
//! log.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::{
    artifacts::{
        signal::current_signals, ArtifactId, AssumptionId, AssumptionLedger, AssumptionStatus,
        DecisionRecord, FalsifierSet, PrincipalId, ScenarioId, ScenarioPack, SessionId,
        StrategyPlaybook, WeakSignal,
    },
    drift::{DriftEvent, OutcomeObservation},
    will::WillVector,
};

/// Errors raised by log backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("audit log io: {0}")]
    Io(#[from] std::io::Error),
    /// Entry could not be encoded or decoded.
    #[error("audit log serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A record for this session already exists.
    #[error("session {0} already has a decision record")]
    DuplicateRecord(SessionId),
    /// Backend temporarily refused the write.
    #[error("audit log unavailable: {0}")]
    Unavailable(String),
}

/// Session artifact persisted alongside its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schema", content = "artifact")]
pub enum StoredArtifact {
    /// Assumption ledger.
    AssumptionLedger(AssumptionLedger),
    /// Falsifier set.
    FalsifierSet(FalsifierSet),
    /// Scenario pack.
    ScenarioPack(ScenarioPack),
    /// Strategy playbook.
    StrategyPlaybook(StrategyPlaybook),
}

impl StoredArtifact {
    /// Artifact id.
    #[must_use]
    pub const fn id(&self) -> ArtifactId {
        match self {
            Self::AssumptionLedger(ledger) => ledger.id,
            Self::FalsifierSet(set) => set.id,
            Self::ScenarioPack(pack) => pack.id,
            Self::StrategyPlaybook(playbook) => playbook.id,
        }
    }
}

/// Status change of an assumption, outside any session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssumptionEvent {
    /// Assumption id.
    pub assumption_id: AssumptionId,
    /// New status.
    pub status: AssumptionStatus,
    /// Evidence reference.
    pub evidence: String,
}

/// Audit entry written on every anchor or re-anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillAnchorEntry {
    /// The new Will.
    pub will: WillVector,
    /// Operator that performed the change.
    pub operator: String,
    /// Stated reason.
    pub reason: String,
}

/// Payload of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum LogEntryBody {
    /// Terminal decision record.
    Decision(DecisionRecord),
    /// Artifact produced by a session.
    Artifact {
        /// Owning session.
        session_id: SessionId,
        /// The artifact.
        artifact: StoredArtifact,
    },
    /// Weak signal.
    WeakSignal(WeakSignal),
    /// Assumption status event.
    AssumptionStatus(AssumptionEvent),
    /// Will anchor or re-anchor.
    WillAnchored(WillAnchorEntry),
    /// Detected drift.
    Drift(DriftEvent),
    /// Observed outcome of an executed action.
    Outcome(OutcomeObservation),
}

impl LogEntryBody {
    /// Short kind label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decision(_) => "decision",
            Self::Artifact { .. } => "artifact",
            Self::WeakSignal(_) => "weak_signal",
            Self::AssumptionStatus(_) => "assumption_status",
            Self::WillAnchored(_) => "will_anchored",
            Self::Drift(_) => "drift",
            Self::Outcome(_) => "outcome",
        }
    }

    fn mentions_assumption(&self, id: AssumptionId) -> bool {
        match self {
            Self::Decision(record) => record.depends_on(id),
            Self::Artifact {
                artifact: StoredArtifact::AssumptionLedger(ledger),
                ..
            } => ledger.get(id).is_some(),
            Self::Artifact {
                artifact: StoredArtifact::FalsifierSet(set),
                ..
            } => set
                .falsifiers
                .iter()
                .any(|falsifier| falsifier.assumption_ref == Some(id)),
            Self::Artifact {
                artifact: StoredArtifact::ScenarioPack(pack),
                ..
            } => pack
                .scenarios
                .iter()
                .any(|scenario| scenario.assumption_links.contains(&id)),
            Self::AssumptionStatus(event) => event.assumption_id == id,
            Self::Drift(event) => event.assumption_id == Some(id),
            _ => false,
        }
    }

    fn mentions_scenario(&self, id: ScenarioId) -> bool {
        match self {
            Self::Artifact {
                artifact: StoredArtifact::ScenarioPack(pack),
                ..
            } => pack.contains(id),
            Self::Artifact {
                artifact: StoredArtifact::StrategyPlaybook(playbook),
                ..
            } => playbook
                .actions
                .iter()
                .any(|action| action.scenario_refs.contains(&id)),
            Self::WeakSignal(signal) => signal.linked_scenario_ids.contains(&id),
            _ => false,
        }
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Owning principal.
    pub principal: PrincipalId,
    /// Append time.
    pub appended_at: DateTime<Utc>,
    /// Payload.
    pub body: LogEntryBody,
}

/// Append-only log backend. Queries are provided over [`AuditLog::snapshot`].
pub trait AuditLog: Send + Sync + fmt::Debug {
    /// Appends entries atomically. A batch containing a decision record for a
    /// session that already has one is rejected with [`StoreError::DuplicateRecord`].
    /// Drift events whose id is already logged are skipped; the result holds
    /// only the entries actually appended.
    fn append_batch(
        &self,
        principal: &str,
        bodies: Vec<LogEntryBody>,
    ) -> Result<Vec<LogEntry>, StoreError>;

    /// All entries in append order.
    fn snapshot(&self) -> Result<Vec<LogEntry>, StoreError>;

    /// Bytes of a torn final entry dropped when the backend was opened.
    fn discarded_tail(&self) -> Option<u64> {
        None
    }

    /// Appends one entry.
    fn append(&self, principal: &str, body: LogEntryBody) -> Result<LogEntry, StoreError> {
        self.append_batch(principal, vec![body])?
            .pop()
            .ok_or_else(|| StoreError::Unavailable("empty append result".into()))
    }

    /// Entries owned by a principal.
    fn for_principal(&self, principal: &str) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.principal == principal)
            .collect())
    }

    /// Entries that reference an assumption.
    fn by_assumption(&self, id: AssumptionId) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.body.mentions_assumption(id))
            .collect())
    }

    /// Entries that reference a scenario.
    fn by_scenario(&self, id: ScenarioId) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.body.mentions_scenario(id))
            .collect())
    }

    /// Decision record of a session, if written.
    fn record_for_session(&self, session_id: SessionId) -> Result<Option<DecisionRecord>, StoreError> {
        Ok(self.snapshot()?.into_iter().find_map(|entry| match entry.body {
            LogEntryBody::Decision(record) if record.session_id == session_id => Some(record),
            _ => None,
        }))
    }

    /// Decision records of a principal, oldest first.
    fn records(&self, principal: &str) -> Result<Vec<DecisionRecord>, StoreError> {
        Ok(self
            .for_principal(principal)?
            .into_iter()
            .filter_map(|entry| match entry.body {
                LogEntryBody::Decision(record) => Some(record),
                _ => None,
            })
            .collect())
    }

    /// Latest status per assumption for a principal.
    fn assumption_statuses(
        &self,
        principal: &str,
    ) -> Result<HashMap<AssumptionId, AssumptionStatus>, StoreError> {
        let mut statuses = HashMap::new();
        for entry in self.for_principal(principal)? {
            if let LogEntryBody::AssumptionStatus(event) = entry.body {
                statuses.insert(event.assumption_id, event.status);
            }
        }
        Ok(statuses)
    }

    /// Weak signals of a principal that nothing supersedes, oldest first.
    fn active_signals(&self, principal: &str) -> Result<Vec<WeakSignal>, StoreError> {
        let signals: Vec<WeakSignal> = self
            .for_principal(principal)?
            .into_iter()
            .filter_map(|entry| match entry.body {
                LogEntryBody::WeakSignal(signal) => Some(signal),
                _ => None,
            })
            .collect();
        Ok(current_signals(&signals).into_iter().cloned().collect())
    }

    /// Stored artifact by id.
    fn artifact(&self, id: ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        Ok(self.snapshot()?.into_iter().find_map(|entry| match entry.body {
            LogEntryBody::Artifact { artifact, .. } if artifact.id() == id => Some(artifact),
            _ => None,
        }))
    }

    /// Every Will version of a principal, oldest first.
    fn will_history(&self, principal: &str) -> Result<Vec<WillAnchorEntry>, StoreError> {
        Ok(self
            .for_principal(principal)?
            .into_iter()
            .filter_map(|entry| match entry.body {
                LogEntryBody::WillAnchored(anchored) => Some(anchored),
                _ => None,
            })
            .collect())
    }

    /// Entry counts per kind, for audit summaries.
    fn kind_counts(&self, principal: &str) -> Result<BTreeMap<&'static str, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for entry in self.for_principal(principal)? {
            *counts.entry(entry.body.kind()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

fn duplicate_in(existing: &[LogEntry], bodies: &[LogEntryBody]) -> Option<SessionId> {
    bodies.iter().find_map(|body| match body {
        LogEntryBody::Decision(record)
            if existing.iter().any(|entry| {
                matches!(&entry.body, LogEntryBody::Decision(prior) if prior.session_id == record.session_id)
            }) =>
        {
            Some(record.session_id)
        }
        _ => None,
    })
}

fn without_logged_drift(existing: &[LogEntry], bodies: Vec<LogEntryBody>) -> Vec<LogEntryBody> {
    let mut seen: HashSet<Uuid> = existing
        .iter()
        .filter_map(|entry| match &entry.body {
            LogEntryBody::Drift(event) => Some(event.id),
            _ => None,
        })
        .collect();
    bodies
        .into_iter()
        .filter(|body| match body {
            LogEntryBody::Drift(event) => seen.insert(event.id),
            _ => true,
        })
        .collect()
}

fn stamp(seq_start: u64, principal: &str, bodies: Vec<LogEntryBody>) -> Vec<LogEntry> {
    let appended_at = Utc::now();
    bodies
        .into_iter()
        .zip(seq_start..)
        .map(|(body, seq)| LogEntry {
            seq,
            principal: principal.to_string(),
            appended_at,
            body,
        })
        .collect()
}

/// In-memory log for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl AuditLog for MemoryAuditLog {
    fn append_batch(
        &self,
        principal: &str,
        bodies: Vec<LogEntryBody>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut entries = self.entries.lock();
        if let Some(session) = duplicate_in(&entries, &bodies) {
            return Err(StoreError::DuplicateRecord(session));
        }
        let bodies = without_logged_drift(&entries, bodies);
        let appended = stamp(entries.len() as u64 + 1, principal, bodies);
        entries.extend(appended.iter().cloned());
        Ok(appended)
    }

    fn snapshot(&self) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.entries.lock().clone())
    }
}

struct JsonlInner {
    file: File,
    entries: Vec<LogEntry>,
}

/// JSON-lines log on disk; one entry per line, appended and flushed under a mutex.
///
/// A failed write truncates the file back to its length before the batch, so
/// a retried batch never follows a partial line.
pub struct JsonlAuditLog {
    path: PathBuf,
    discarded_tail: Option<u64>,
    inner: Mutex<JsonlInner>,
}

impl fmt::Debug for JsonlAuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlAuditLog")
            .field("path", &self.path)
            .field("discarded_tail", &self.discarded_tail)
            .finish()
    }
}

impl JsonlAuditLog {
    /// Opens or creates the log, replaying existing entries.
    ///
    /// A final line that does not decode is a write torn by a crash; it is
    /// cut from the file. An undecodable line anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let (entries, discarded_tail) = if path.exists() {
            let bytes = fs::read(&path)?;
            let (entries, keep) = replay(&bytes)?;
            let discarded = keep.map(|keep| {
                let dropped = bytes.len() as u64 - keep;
                warn!(path = %path.display(), bytes = dropped, "discarding torn audit log tail");
                (keep, dropped)
            });
            if let Some((keep, _)) = discarded {
                OpenOptions::new().write(true).open(&path)?.set_len(keep)?;
            }
            (entries, discarded.map(|(_, dropped)| dropped))
        } else {
            (Vec::new(), None)
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            discarded_tail,
            inner: Mutex::new(JsonlInner { file, entries }),
        })
    }

    /// Backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLog for JsonlAuditLog {
    fn append_batch(
        &self,
        principal: &str,
        bodies: Vec<LogEntryBody>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(session) = duplicate_in(&inner.entries, &bodies) {
            return Err(StoreError::DuplicateRecord(session));
        }
        let bodies = without_logged_drift(&inner.entries, bodies);
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let next = inner.entries.last().map_or(1, |entry| entry.seq + 1);
        let appended = stamp(next, principal, bodies);
        let mut buffer = String::new();
        for entry in &appended {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }
        let len = inner.file.metadata()?.len();
        let written = inner
            .file
            .write_all(buffer.as_bytes())
            .and_then(|()| inner.file.flush());
        if let Err(err) = written {
            if let Err(rollback) = inner.file.set_len(len) {
                warn!(path = %self.path.display(), error = %rollback, "audit log rollback failed");
            }
            return Err(err.into());
        }
        inner.entries.extend(appended.iter().cloned());
        Ok(appended)
    }

    fn snapshot(&self) -> Result<Vec<LogEntry>, StoreError> {
        Ok(self.inner.lock().entries.clone())
    }

    fn discarded_tail(&self) -> Option<u64> {
        self.discarded_tail
    }
}

/// Decodes every line. Returns the byte length to keep when the final line is torn.
fn replay(bytes: &[u8]) -> Result<(Vec<LogEntry>, Option<u64>), StoreError> {
    let mut entries = Vec::new();
    let mut offset = 0;
    for line in bytes.split_inclusive(|byte| *byte == b'\n') {
        let start = offset;
        offset += line.len();
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(_) if bytes[offset..].iter().all(u8::is_ascii_whitespace) => {
                return Ok((entries, Some(start as u64)));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((entries, None))
}
