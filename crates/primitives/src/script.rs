//! Script classification and the Electrum script hash.

use std::fmt;

use pepexd_consensus::Hash256;

use crate::hash::sha256;

pub const OP_RETURN: u8 = 0x6a;

/// `sha256(script_pubkey)`: the address key used by every per-address table.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ScriptHash(pub Hash256);

impl ScriptHash {
    pub fn from_script(script_pubkey: &[u8]) -> Self {
        Self(sha256(script_pubkey))
    }

    pub fn as_bytes(&self) -> &Hash256 {
        &self.0
    }

    /// Electrum clients send the digest byte-reversed, hex encoded.
    pub fn from_electrum_hex(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() != 64 || !input.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, out) in bytes.iter_mut().enumerate() {
            *out = u8::from_str_radix(&input[i * 2..i * 2 + 2], 16).ok()?;
        }
        bytes.reverse();
        Some(Self(bytes))
    }

    pub fn to_electrum_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0.iter().rev() {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({})", self.to_electrum_hex())
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_electrum_hex())
    }
}

/// Outputs that can never be spent are not tracked as UTXOs.
pub fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN)
}
