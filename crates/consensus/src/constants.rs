//! Chain-wide constants shared across the indexer.

/// Serialized block header size consumed by both hash families.
pub const HEADER_SIZE: usize = 80;
/// First height hashed with Xelis v2 instead of the legacy memehash chain.
pub const HASH_CUTOVER_HEIGHT: u32 = 1_930_000;
/// Deepest rollback the indexer will perform before declaring an integrity failure.
pub const DEFAULT_REORG_LIMIT: u32 = 100;
/// Raw blocks kept beyond the reorg limit before pruning.
pub const RAW_BLOCK_RETENTION_SLACK: u32 = 10;

pub const DEFAULT_DAEMON_RPC_PORT: u16 = 8833;
pub const DEFAULT_ELECTRUM_PORT: u16 = 50001;
pub const DEFAULT_ADMIN_PORT: u16 = 8000;

/// Upper bound used when estimating how many mempool bytes fit in one block.
pub const MAX_BLOCK_SIZE: u64 = 1_000_000;
/// Lowest fee rate the daemon relays, in satoshis per kB.
pub const MIN_RELAY_FEE_PER_KB: i64 = 1_000;

pub const ELECTRUM_PROTOCOL_MIN: &str = "1.4";
pub const ELECTRUM_PROTOCOL_MAX: &str = "1.4.2";
