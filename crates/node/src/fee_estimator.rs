//! Fee estimates derived from the current mempool backlog.

use pepexd_consensus::constants::MAX_BLOCK_SIZE;
use pepexd_consensus::money::COIN;

const HISTOGRAM_FIRST_BIN: usize = 100_000;
const HISTOGRAM_BIN_SPACING: f64 = 1.1;
const MAX_TARGET_BLOCKS: u32 = 25;

/// One mempool transaction as the estimator sees it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BacklogTx {
    /// Satoshis per byte.
    pub fee_rate: f64,
    pub size: usize,
}

fn sorted_by_rate(backlog: &[BacklogTx]) -> Vec<BacklogTx> {
    let mut sorted = backlog.to_vec();
    sorted.sort_by(|a, b| b.fee_rate.total_cmp(&a.fee_rate));
    sorted
}

/// Fee rate (sat/byte) needed to be mined within `target_blocks`, assuming blocks are
/// filled highest fee rate first. `None` when the backlog fits in the target window,
/// so any relay-acceptable fee would do.
pub fn estimate_fee_rate(backlog: &[BacklogTx], target_blocks: u32) -> Option<f64> {
    let target = target_blocks.clamp(1, MAX_TARGET_BLOCKS) as u64;
    let budget = target.saturating_mul(MAX_BLOCK_SIZE);
    let mut used = 0u64;
    for tx in sorted_by_rate(backlog) {
        used = used.saturating_add(tx.size as u64);
        if used > budget {
            return Some(tx.fee_rate);
        }
    }
    None
}

/// `[fee_rate, size]` pairs, highest rate first. Each bin closes once it holds at
/// least the current bin size, which grows by 10% per bin.
pub fn fee_histogram(backlog: &[BacklogTx]) -> Vec<(f64, usize)> {
    let mut histogram = Vec::new();
    let mut bin_limit = HISTOGRAM_FIRST_BIN as f64;
    let mut bin_size = 0usize;
    let mut last_rate = None;
    for tx in sorted_by_rate(backlog) {
        if bin_size as f64 >= bin_limit {
            if let Some(rate) = last_rate {
                histogram.push((rate, bin_size));
            }
            bin_size = 0;
            bin_limit *= HISTOGRAM_BIN_SPACING;
        }
        bin_size += tx.size;
        last_rate = Some(tx.fee_rate);
    }
    if let Some(rate) = last_rate {
        if bin_size > 0 {
            histogram.push((rate, bin_size));
        }
    }
    histogram
}

/// Converts sat/byte into coins per kB, the unit Electrum clients expect.
pub fn sat_per_byte_to_coin_per_kb(rate: f64) -> f64 {
    rate * 1000.0 / COIN as f64
}
