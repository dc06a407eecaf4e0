use pepexd_primitives::block::Block;
use pepexd_primitives::outpoint::OutPoint;
use pepexd_primitives::transaction::{Transaction, TxIn, TxOut};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u8(&mut self) -> u8 {
        (self.next_u64() >> 32) as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_vec(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_tx(rng: &mut Lcg) -> Transaction {
    let special = rng.gen_range(2) == 1;
    let vin = (0..rng.gen_range(4))
        .map(|_| TxIn {
            prevout: OutPoint::new(std::array::from_fn(|_| rng.next_u8()), rng.gen_range(8) as u32),
            script_sig: random_vec(rng, 40),
            sequence: rng.next_u64() as u32,
        })
        .collect();
    let vout = (0..rng.gen_range(4))
        .map(|_| TxOut {
            value: rng.gen_range(1_000_000) as i64,
            script_pubkey: random_vec(rng, 30),
        })
        .collect();
    Transaction {
        version: if special { 3 } else { 1 + rng.gen_range(2) as u32 },
        tx_type: if special { 1 + rng.gen_range(6) as u16 } else { 0 },
        vin,
        vout,
        lock_time: rng.next_u64() as u32,
        extra_payload: if special { random_vec(rng, 64) } else { Vec::new() },
    }
}

#[test]
fn random_transactions_reencode_to_the_same_bytes() {
    let mut rng = Lcg::new(7);
    for _ in 0..200 {
        let tx = random_tx(&mut rng);
        let raw = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&raw).expect("decode random tx");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }
}

#[test]
fn truncated_inputs_error_instead_of_panicking() {
    let mut rng = Lcg::new(99);
    for _ in 0..50 {
        let raw = random_tx(&mut rng).consensus_encode();
        for cut in 0..raw.len() {
            assert!(Transaction::consensus_decode(&raw[..cut]).is_err());
        }
    }
}

#[test]
fn arbitrary_bytes_never_panic_the_block_decoder() {
    let mut rng = Lcg::new(2024);
    for _ in 0..500 {
        let raw = random_vec(&mut rng, 300);
        let _ = Block::consensus_decode(&raw);
    }
}
