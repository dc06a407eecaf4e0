//! Xelis v2 proof-of-work hash.
//!
//! Stage 1 fills a 429 KiB scratchpad with ChaCha8 keystream keyed by a
//! chain of blake3 digests over the padded header. Stage 3 runs three passes
//! of data-dependent mixing over the two scratchpad halves, each pass seeded by
//! one AES round. The digest is blake3 over the final scratchpad bytes.

use aes::hazmat::cipher_round;
use aes::Block;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha8, Key, Nonce};
use pepexd_consensus::constants::HEADER_SIZE;
use pepexd_consensus::Hash256;

use crate::HashError;

pub const INPUT_LEN: usize = 112;
/// Scratchpad size in 64-bit words.
pub const MEMORY_SIZE: usize = 429 * 128;
const BUFFER_SIZE: usize = MEMORY_SIZE / 2;
const MEMORY_BYTES: usize = MEMORY_SIZE * 8;
const CHUNKS: usize = 4;
const CHUNK_SIZE: usize = 32;
const CHUNK_BYTES: usize = MEMORY_BYTES / CHUNKS;
const NONCE_SIZE: usize = 12;
const SCRATCHPAD_ITERS: usize = 3;
const AES_KEY: [u8; 16] = *b"xelishash-pow-v2";

/// Reusable scratchpad; one per hashing thread avoids a large allocation per header.
pub struct XelisScratch {
    words: Vec<u64>,
    bytes: Vec<u8>,
}

impl XelisScratch {
    pub fn new() -> Self {
        Self {
            words: vec![0u64; MEMORY_SIZE],
            bytes: vec![0u8; MEMORY_BYTES],
        }
    }
}

impl Default for XelisScratch {
    fn default() -> Self {
        Self::new()
    }
}

pub fn xelis_v2_hash(header: &[u8]) -> Result<Hash256, HashError> {
    let mut scratch = XelisScratch::new();
    xelis_v2_hash_with(&mut scratch, header)
}

pub fn xelis_v2_hash_with(
    scratch: &mut XelisScratch,
    header: &[u8],
) -> Result<Hash256, HashError> {
    if header.len() < HEADER_SIZE {
        return Err(HashError::HeaderTooShort(header.len()));
    }
    let mut input = [0u8; INPUT_LEN];
    let len = header.len().min(INPUT_LEN);
    input[..len].copy_from_slice(&header[..len]);

    stage1(&input, scratch);
    stage3(&mut scratch.words);

    for (out, word) in scratch.bytes.chunks_exact_mut(8).zip(&scratch.words) {
        out.copy_from_slice(&word.to_le_bytes());
    }
    Ok(*blake3::hash(&scratch.bytes).as_bytes())
}

fn stage1(input: &[u8; INPUT_LEN], scratch: &mut XelisScratch) {
    let mut key = [0u8; CHUNK_SIZE * CHUNKS];
    key[..INPUT_LEN].copy_from_slice(input);

    let mut buffer = [0u8; CHUNK_SIZE * 2];
    buffer[..CHUNK_SIZE].copy_from_slice(blake3::hash(input).as_bytes());

    let bytes = &mut scratch.bytes;
    for chunk in 0..CHUNKS {
        let offset = chunk * CHUNK_BYTES;
        buffer[CHUNK_SIZE..].copy_from_slice(&key[chunk * CHUNK_SIZE..(chunk + 1) * CHUNK_SIZE]);
        let input_hash = *blake3::hash(&buffer).as_bytes();

        let mut nonce = [0u8; NONCE_SIZE];
        if chunk == 0 {
            nonce.copy_from_slice(&buffer[..NONCE_SIZE]);
        } else {
            nonce.copy_from_slice(&bytes[offset - NONCE_SIZE..offset]);
        }

        let out = &mut bytes[offset..offset + CHUNK_BYTES];
        out.fill(0);
        let mut cipher = ChaCha8::new(Key::from_slice(&input_hash), Nonce::from_slice(&nonce));
        cipher.apply_keystream(out);

        buffer[..CHUNK_SIZE].copy_from_slice(&input_hash);
    }

    for (word, raw) in scratch.words.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        *word = u64::from_le_bytes(le);
    }
}

fn stage3(words: &mut [u64]) {
    let (mem_a, mem_b) = words.split_at_mut(BUFFER_SIZE);

    let mut addr_a = mem_b[BUFFER_SIZE - 1];
    let mut addr_b = mem_a[BUFFER_SIZE - 1] >> 32;
    let mut r: usize = 0;

    for i in 0..SCRATCHPAD_ITERS {
        let mem_a_val = mem_a[index(addr_a)];
        let mem_b_val = mem_b[index(addr_b)];

        let mut block_bytes = [0u8; 16];
        block_bytes[..8].copy_from_slice(&mem_b_val.to_le_bytes());
        block_bytes[8..].copy_from_slice(&mem_a_val.to_le_bytes());
        let mut block = Block::clone_from_slice(&block_bytes);
        cipher_round(&mut block, &Block::from(AES_KEY));

        let mut low = [0u8; 8];
        low.copy_from_slice(&block[..8]);
        let hash1 = u64::from_le_bytes(low);
        addr_a = !(hash1 ^ mem_a_val ^ mem_b_val);

        for j in 0..BUFFER_SIZE {
            let a = mem_a[index(addr_a)];
            let b = mem_b[index(!addr_a.rotate_right(r as u32))];
            let c = if r < BUFFER_SIZE {
                mem_a[r]
            } else {
                mem_b[r - BUFFER_SIZE]
            };
            r = (r + 1) % MEMORY_SIZE;

            let op = (addr_a.rotate_left(c as u32) & 0xf) as u8;
            let v = mix(op, a, b, c, r as u32, addr_a, (i * j) as u32);
            addr_a = (addr_a ^ v).rotate_left(1);

            let target = BUFFER_SIZE - j - 1;
            let t = mem_a[target] ^ addr_a;
            mem_a[target] = t;
            mem_b[j] ^= t.rotate_right(addr_a as u32);
        }

        addr_b = isqrt(addr_a);
    }
}

#[inline]
fn index(addr: u64) -> usize {
    (addr % BUFFER_SIZE as u64) as usize
}

#[inline]
fn combine(high: u64, low: u64) -> u128 {
    (u128::from(high) << 64) | u128::from(low)
}

/// One of sixteen branches picked by the current address. `r` is the cursor
/// after it advanced; `ij` is the product of the pass and step counters.
fn mix(op: u8, a: u64, b: u64, c: u64, r: u32, result: u64, ij: u32) -> u64 {
    match op {
        0 => c.rotate_left(ij) ^ b,
        1 => c.rotate_right(ij) ^ a,
        2 => a ^ b ^ c,
        3 => a.wrapping_add(b).wrapping_mul(c),
        4 => b.wrapping_sub(c).wrapping_mul(a),
        5 => c.wrapping_sub(a).wrapping_add(b),
        6 => a.wrapping_sub(b).wrapping_add(c),
        7 => b.wrapping_mul(c).wrapping_add(a),
        8 => c.wrapping_mul(a).wrapping_add(b),
        9 => a.wrapping_mul(b).wrapping_mul(c),
        10 => (combine(a, b) % u128::from(c | 1)) as u64,
        11 => {
            let t2 = combine(result.rotate_left(r), a | 2);
            let t1 = combine(b, c);
            if t2 > t1 {
                c
            } else {
                (t1 % t2) as u64
            }
        }
        12 => (combine(c, a) / u128::from(b | 4)) as u64,
        13 => {
            let t1 = combine(result.rotate_left(r), b);
            let t2 = combine(a, c | 8);
            if t1 > t2 {
                (t1 / t2) as u64
            } else {
                a ^ b
            }
        }
        14 => (combine(b, a).wrapping_mul(u128::from(c)) >> 64) as u64,
        _ => {
            let left = combine(a, c);
            let right = combine(result.rotate_right(r), b);
            (left.wrapping_mul(right) >> 64) as u64
        }
    }
}

fn isqrt(value: u64) -> u64 {
    if value < 2 {
        return value;
    }
    let mut root = (value as f64).sqrt() as u64;
    while root.checked_mul(root).map_or(true, |sq| sq > value) {
        root -= 1;
    }
    while (root + 1).checked_mul(root + 1).is_some_and(|sq| sq <= value) {
        root += 1;
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isqrt_is_exact_near_perfect_squares() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(u64::MAX), u32::MAX as u64);
        let big = (1u64 << 32) - 5;
        assert_eq!(isqrt(big * big), big);
        assert_eq!(isqrt(big * big - 1), big - 1);
    }

    #[test]
    fn high_half_of_wide_products() {
        // (2^64 + 1) * 2^63 = 2^127 + 2^63; bits 64..128 are 2^63.
        assert_eq!(mix(14, 1, 1, 1 << 63, 0, 0, 0), 1 << 63);
        // combine(1, 0) * combine(rotr(0), 1) = 2^64; bits 64..128 are 1.
        assert_eq!(mix(15, 1, 1, 0, 0, 0, 0), 1);
    }

    #[test]
    fn division_branches_follow_guards() {
        // t2 = combine(0, 3) > combine(0, 1) selects c.
        assert_eq!(mix(11, 1, 0, 1, 0, 0, 0), 1);
        // t1 = combine(0, 5) is not above t2 = combine(0, 8): falls back to a ^ b.
        assert_eq!(mix(13, 0, 5, 0, 0, 0, 0), 5);
        assert_eq!(mix(12, 8, 0, 0, 0, 0, 0), 2);
    }

    #[test]
    fn rejects_short_headers() {
        assert!(matches!(
            xelis_v2_hash(&[0u8; 79]),
            Err(HashError::HeaderTooShort(79))
        ));
    }
}
