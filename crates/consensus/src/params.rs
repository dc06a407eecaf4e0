//! Network parameter definitions.

use crate::constants::{
    DEFAULT_ADMIN_PORT, DEFAULT_DAEMON_RPC_PORT, DEFAULT_ELECTRUM_PORT, DEFAULT_REORG_LIMIT,
    HASH_CUTOVER_HEIGHT,
};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub coin_name: &'static str,
    pub hash_genesis_block: Hash256,
    pub hash_cutover_height: u32,
    pub reorg_limit: u32,
    pub p2pkh_prefix: u8,
    pub p2sh_prefix: u8,
    pub default_daemon_port: u16,
    pub default_electrum_port: u16,
    pub default_admin_port: u16,
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash must be 64 hex characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (byte-reversed) 32-byte hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    if !hex.is_ascii() {
        return Err(HexError::InvalidHex);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&hex[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Renders a hash in display (byte-reversed) order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

const MAINNET_GENESIS: Hash256 = [
    0x13, 0x1f, 0xa3, 0xb0, 0x0a, 0x2c, 0x59, 0x42, 0x32, 0x41, 0x7b, 0x7d, 0x28, 0xc9, 0x71,
    0x1a, 0x25, 0xbc, 0x55, 0xaa, 0xc1, 0x3b, 0x3a, 0x70, 0x69, 0xb4, 0xc3, 0x8c, 0x30, 0x0a,
    0x00, 0x00,
];

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            coin_name: "PEPEPOW",
            hash_genesis_block: MAINNET_GENESIS,
            hash_cutover_height: HASH_CUTOVER_HEIGHT,
            reorg_limit: DEFAULT_REORG_LIMIT,
            p2pkh_prefix: 55,
            p2sh_prefix: 16,
            default_daemon_port: DEFAULT_DAEMON_RPC_PORT,
            default_electrum_port: DEFAULT_ELECTRUM_PORT,
            default_admin_port: DEFAULT_ADMIN_PORT,
        },
        Network::Regtest => ChainParams {
            network,
            coin_name: "PEPEPOW-regtest",
            hash_genesis_block: [0u8; 32],
            hash_cutover_height: 100,
            reorg_limit: DEFAULT_REORG_LIMIT,
            p2pkh_prefix: 140,
            p2sh_prefix: 19,
            default_daemon_port: 19_833,
            default_electrum_port: 60_401,
            default_admin_port: 18_000,
        },
    }
}
