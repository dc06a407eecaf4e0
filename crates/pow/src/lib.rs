//! Header hashing for PEPEPOW.
//!
//! Heights below the cutover use the legacy memehash chain, which needs five
//! native sph transforms. Heights at or above it use Xelis v2, implemented here.

pub mod memehash;
pub mod selector;
pub mod xelis;

pub use memehash::{LegacyBackend, NativeBackend, SphStage};
pub use selector::{HashSelector, HeaderHasher};

#[derive(Debug)]
pub enum HashError {
    HeaderTooShort(usize),
    BackendUnavailable(String),
}

impl std::fmt::Display for HashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashError::HeaderTooShort(len) => {
                write!(f, "header must be at least 80 bytes (got {len})")
            }
            HashError::BackendUnavailable(message) => {
                write!(f, "legacy hash backend unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for HashError {}
