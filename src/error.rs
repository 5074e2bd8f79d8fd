//! Error taxonomy for block acceptance and storage.
//!
//! Every rejection carries enough context to tell an invalid block from a
//! local storage problem from a checkpoint divergence that needs a resync.

use thiserror::Error;

use crate::amount::Amount;
use crate::hash::Hash256;
use crate::transaction::OutPoint;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block log position {file}:{offset} is not readable")]
    BadLocation { file: u32, offset: u64 },
    #[error("serialization failed: {0}")]
    Codec(String),
    #[error("table write failed: {0}")]
    WriteFailed(String),
    #[error("view is not committable")]
    NotCommittable,
    #[error("missing stored entry: {0}")]
    MissingEntry(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {0} already indexed")]
    DuplicateBlock(Hash256),
    #[error("previous block {0} not indexed")]
    MissingPrev(Hash256),
    #[error("fork {0} is not registered")]
    UnknownFork(Hash256),
    #[error("block {0} is an invalid fork placement")]
    InvalidForkType(Hash256),
    #[error("block {block} exceeds the size limit ({size} bytes)")]
    Oversize { block: Hash256, size: u64 },

    #[error("proof of work invalid for block {0}")]
    ProofOfWorkInvalid(Hash256),
    #[error("proof of stake invalid for block {0}")]
    ProofOfStakeInvalid(Hash256),
    #[error("agreement mismatch for block {block}: declared {declared}, derived {derived}")]
    AgreementMismatch {
        block: Hash256,
        declared: Hash256,
        derived: Hash256,
    },
    #[error("timestamp {timestamp} out of range for block {block}")]
    TimestampOutOfRange { block: Hash256, timestamp: u32 },

    #[error("output {outpoint} already spent in this view")]
    DoubleSpend { outpoint: OutPoint },
    #[error("transaction {txid} spends {value_out} with only {value_in} available")]
    Overspend {
        txid: Hash256,
        value_in: Amount,
        value_out: Amount,
    },
    #[error("missing input {outpoint}")]
    MissingInput { outpoint: OutPoint },
    #[error("transaction {0} violates a validity rule")]
    TransactionInvalid(Hash256),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error(
        "checkpoint mismatch on fork {fork} at height {height}: expected {expected}, found {found}"
    )]
    CheckpointMismatch {
        fork: Hash256,
        height: u32,
        expected: Hash256,
        found: Hash256,
    },
}

/// Coarse class of a rejection, driving the caller's retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Proof,
    Transaction,
    Storage,
    Checkpoint,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DuplicateBlock(_)
            | Error::MissingPrev(_)
            | Error::UnknownFork(_)
            | Error::InvalidForkType(_)
            | Error::Oversize { .. } => ErrorKind::Structural,
            Error::ProofOfWorkInvalid(_)
            | Error::ProofOfStakeInvalid(_)
            | Error::AgreementMismatch { .. }
            | Error::TimestampOutOfRange { .. } => ErrorKind::Proof,
            Error::DoubleSpend { .. }
            | Error::Overspend { .. }
            | Error::MissingInput { .. }
            | Error::TransactionInvalid(_) => ErrorKind::Transaction,
            Error::Storage(_) => ErrorKind::Storage,
            Error::CheckpointMismatch { .. } => ErrorKind::Checkpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_partition_the_taxonomy() {
        assert_eq!(
            Error::DuplicateBlock(Hash256::zero()).kind(),
            ErrorKind::Structural
        );
        assert_eq!(
            Error::ProofOfWorkInvalid(Hash256::zero()).kind(),
            ErrorKind::Proof
        );
        assert_eq!(
            Error::TransactionInvalid(Hash256::zero()).kind(),
            ErrorKind::Transaction
        );
        assert_eq!(
            Error::Storage(StorageError::NotCommittable).kind(),
            ErrorKind::Storage
        );
        assert_eq!(
            Error::CheckpointMismatch {
                fork: Hash256::zero(),
                height: 1,
                expected: Hash256::zero(),
                found: Hash256::zero(),
            }
            .kind(),
            ErrorKind::Checkpoint
        );
    }
}
