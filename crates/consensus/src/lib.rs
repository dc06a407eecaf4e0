//! PEPEPOW chain constants and network parameters.

pub mod constants;
pub mod money;
pub mod params;

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, ChainParams, HexError, Network,
};

pub type Hash256 = [u8; 32];
