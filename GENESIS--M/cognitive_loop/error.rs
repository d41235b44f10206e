use thiserror::Error;

use crate::{
    artifacts::{LedgerError, PrincipalId},
    store::StoreError,
    will::WillError,
};

/// Operational failures of the loop. Gate refusals are never errors.
#[derive(Debug, Error)]
pub enum LoopError {
    /// Record could not be persisted after every retry.
    #[error("decision record not persisted after {attempts} attempts: {source}")]
    Storage {
        /// Attempts made.
        attempts: u32,
        /// Last backend error.
        #[source]
        source: StoreError,
    },
    /// Sessions require an anchored Will.
    #[error("principal `{0}` has no anchored Will")]
    WillNotAnchored(PrincipalId),
    /// Will anchor failure.
    #[error(transparent)]
    Will(#[from] WillError),
    /// Audit log read or non-record write failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Invalid assumption transition.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
