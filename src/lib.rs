//! Multi-fork ledger engine with hybrid proof-of-work and delegated
//! proof-of-stake consensus.
//!
//! The crate is organised around a few layers:
//!
//! * [`index`] and [`fork`]: the in-memory block DAG and the registry of
//!   fork lines, each fork carrying its own cursor behind its own lock.
//! * [`view`] and [`store`]: copy-on-write ledger views over the backend
//!   tables, committed atomically per accepted block.
//! * [`delegate`] and [`verifier`]: enrollment windows, round agreements
//!   and the full block validation rules.
//! * [`chain`]: the [`ChainEngine`] facade a node embeds.
//!
//! Destination semantics, share cryptography and the primary reward
//! schedule are injected through the traits in [`destination`], keeping
//! the engine independent of the surrounding node.

pub mod amount;
pub mod block;
pub mod chain;
pub mod chaintrust;
pub mod checkpoints;
pub mod config;
pub mod delegate;
pub mod destination;
pub mod error;
pub mod fork;
pub mod hash;
pub mod index;
pub mod store;
pub mod testing;
pub mod transaction;
pub mod verifier;
pub mod view;

pub use amount::Amount;
pub use block::{Block, BlockType, ChangeSet, MintType};
pub use chain::{BlockStatus, ChainEngine, ForkStatus};
pub use checkpoints::Checkpoints;
pub use config::{ChainConfig, Network};
pub use destination::{Destination, ProofCrypto, RewardSource, TemplateOracle, TemplateRole};
pub use error::{Error, ErrorKind, Result, StorageError};
pub use fork::ForkProfile;
pub use hash::Hash256;
pub use store::{Backend, ChainStore, MemoryBackend};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut, TxType};
