//! PEPEPOW block and transaction types and consensus serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod script;
pub mod transaction;

pub use address::{address_to_script_pubkey, script_pubkey_to_address, AddressError};
pub use block::{Block, BlockDecodeError, BlockHeader, TxSpan};
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use script::ScriptHash;
pub use transaction::{Transaction, TransactionDecodeError, TxIn, TxOut};
