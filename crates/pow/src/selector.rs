//! Height-based choice between the two header hash families.

use std::sync::Arc;

use pepexd_consensus::Hash256;

use crate::memehash::{memehash, LegacyBackend};
use crate::xelis::xelis_v2_hash;
use crate::HashError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderHasher {
    Legacy,
    XelisV2,
}

impl HeaderHasher {
    pub fn for_height(height: u32, cutover: u32) -> Self {
        if height < cutover {
            HeaderHasher::Legacy
        } else {
            HeaderHasher::XelisV2
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HeaderHasher::Legacy => "memehash",
            HeaderHasher::XelisV2 => "xelis-v2",
        }
    }
}

#[derive(Clone)]
pub struct HashSelector {
    cutover: u32,
    legacy: Arc<dyn LegacyBackend>,
}

impl HashSelector {
    pub fn new(cutover: u32, legacy: Arc<dyn LegacyBackend>) -> Self {
        Self { cutover, legacy }
    }

    pub fn cutover(&self) -> u32 {
        self.cutover
    }

    pub fn family(&self, height: u32) -> HeaderHasher {
        HeaderHasher::for_height(height, self.cutover)
    }

    pub fn hash(&self, height: u32, header: &[u8]) -> Result<Hash256, HashError> {
        match self.family(height) {
            HeaderHasher::Legacy => memehash(self.legacy.as_ref(), header),
            HeaderHasher::XelisV2 => xelis_v2_hash(header),
        }
    }
}

impl std::fmt::Debug for HashSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashSelector")
            .field("cutover", &self.cutover)
            .finish_non_exhaustive()
    }
}
