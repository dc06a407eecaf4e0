//! Block indexer: unspent outputs, per-script history, headers and reorg rollback.

pub mod address_index;
pub mod history;
pub mod index;
pub mod indexer;
pub mod query;
pub mod txindex;
pub mod utxo;

pub use index::{ChainTip, HeaderRecord, SCHEMA_VERSION};
pub use indexer::{
    ensure_schema_version, AdvanceOutcome, ChainEvent, ChainSource, CommitGate, DirectCommit,
    IndexError, Indexer, IndexerConfig, IndexerState, SourceError, SyncProgress,
};
pub use query::{ChainQuery, UtxoRow};
