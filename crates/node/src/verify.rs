//! Sampled header-hash verification of a built index against the daemon.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pepexd_chainstate::{ensure_schema_version, ChainQuery, ChainSource};
use pepexd_consensus::constants::HASH_CUTOVER_HEIGHT;
use pepexd_consensus::hash256_to_hex;
use pepexd_pow::{HashSelector, NativeBackend};
use pepexd_storage::KeyValueStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::config::{load_conf, next_value, parse_value, usage, Backend, DaemonArgs};
use crate::daemon::{DaemonClient, DaemonConfig};
use crate::open_store;

const DEFAULT_SAMPLES: u32 = 64;

#[derive(Clone, Debug)]
pub struct VerifyConfig {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub daemon: DaemonConfig,
    pub samples: u32,
    pub seed: u64,
    pub cutover_height: u32,
    pub hash_lib_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub enum VerifyAction {
    Run(VerifyConfig),
    PrintHelp,
}

pub fn parse_verify_args<I>(raw_args: I) -> Result<VerifyAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir = PathBuf::from("data");
    let mut conf_path: Option<PathBuf> = None;
    let mut daemon = DaemonArgs::default();
    let mut samples = DEFAULT_SAMPLES;
    let mut seed: Option<u64> = None;
    let mut cutover_height = HASH_CUTOVER_HEIGHT;
    let mut hash_lib_dir = None;

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        if daemon.take(&arg, &mut args)? {
            continue;
        }
        match arg.as_str() {
            "--help" | "-h" => return Ok(VerifyAction::PrintHelp),
            "--backend" => {
                let value = next_value(&mut args, &arg)?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => data_dir = PathBuf::from(next_value(&mut args, &arg)?),
            "--conf" => conf_path = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            "--samples" => samples = parse_value(&next_value(&mut args, &arg)?, &arg)?,
            "--seed" => seed = Some(parse_value(&next_value(&mut args, &arg)?, &arg)?),
            "--cutover-height" => {
                cutover_height = parse_value(&next_value(&mut args, &arg)?, &arg)?;
            }
            "--hash-lib-dir" => hash_lib_dir = Some(PathBuf::from(next_value(&mut args, &arg)?)),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let conf = load_conf(conf_path.as_deref(), &data_dir)?;
    let seed = seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    });
    Ok(VerifyAction::Run(VerifyConfig {
        backend,
        data_dir,
        daemon: daemon.resolve(conf.as_ref())?,
        samples,
        seed,
        cutover_height,
        hash_lib_dir,
    }))
}

/// Distinct heights in `[0, db_height]`, always including both ends, ascending.
pub fn sample_heights(db_height: u32, samples: u32, seed: u64) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut heights = BTreeSet::from([0, db_height]);
    let wanted = (samples as usize).min(db_height as usize + 1);
    // Bounded so tiny ranges cannot spin.
    let mut draws = samples.saturating_mul(4);
    while heights.len() < wanted && draws > 0 {
        heights.insert(rng.gen_range(0..=db_height));
        draws -= 1;
    }
    heights.into_iter().collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mismatch {
    pub height: u32,
    pub stored: Option<String>,
    pub computed: Option<String>,
    pub daemon: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifySummary {
    pub db_height: Option<u32>,
    pub seed: u64,
    pub samples: usize,
    pub all_match: bool,
    pub first_mismatch: Option<Mismatch>,
}

/// Checks each sampled height: stored hash, recomputed hash and daemon hash must agree.
pub fn verify_index<S: KeyValueStore>(
    query: &ChainQuery<S>,
    selector: &HashSelector,
    source: &dyn ChainSource,
    samples: u32,
    seed: u64,
) -> Result<VerifySummary, String> {
    let Some(tip) = query.tip().map_err(|err| err.to_string())? else {
        return Ok(VerifySummary {
            db_height: None,
            seed,
            samples: 0,
            all_match: true,
            first_mismatch: None,
        });
    };

    let heights = sample_heights(tip.height, samples, seed);
    let mut first_mismatch = None;
    for height in &heights {
        let height = *height;
        let record = query.header(height).map_err(|err| err.to_string())?;
        let daemon = source
            .block_hash(height)
            .map_err(|err| format!("daemon getblockhash {height}: {err}"))?;
        let (computed, error) = match &record {
            Some(record) => match selector.hash(height, &record.raw) {
                Ok(hash) => (Some(hash), None),
                Err(err) => (None, Some(err.to_string())),
            },
            None => (None, Some("header missing from index".to_string())),
        };
        let stored = record.as_ref().map(|record| record.hash);
        let matches = stored.is_some() && stored == computed && stored == daemon;
        if !matches {
            log_warn!("height {height}: index and daemon disagree");
            first_mismatch = Some(Mismatch {
                height,
                stored: stored.as_ref().map(hash256_to_hex),
                computed: computed.as_ref().map(hash256_to_hex),
                daemon: daemon.as_ref().map(hash256_to_hex),
                error,
            });
            break;
        }
        log_debug!("height {height} ok");
    }

    Ok(VerifySummary {
        db_height: Some(tip.height),
        seed,
        samples: heights.len(),
        all_match: first_mismatch.is_none(),
        first_mismatch,
    })
}

pub fn run_verify(config: &VerifyConfig) -> Result<VerifySummary, String> {
    let legacy = NativeBackend::load(config.hash_lib_dir.as_deref())
        .map_err(|err| format!("hash backend: {err}"))?;
    let selector = HashSelector::new(config.cutover_height, Arc::new(legacy));
    let store = open_store(config.backend, &config.data_dir.join("db"), None)?;
    ensure_schema_version(&store).map_err(|err| err.to_string())?;
    let query = ChainQuery::new(Arc::new(store));
    let daemon = DaemonClient::new(&config.daemon);
    verify_index(&query, &selector, &daemon, config.samples, config.seed)
}

#[cfg(test)]
mod tests {
    use pepexd_chainstate::{Indexer, IndexerConfig, SourceError};
    use pepexd_consensus::Hash256;
    use pepexd_storage::memory::MemoryStore;

    use super::*;
    use crate::testutil::{coinbase, extend, selector, TestBlock};

    struct Hashes(Vec<Hash256>);

    impl ChainSource for Hashes {
        fn best_height_and_hash(&self) -> Result<(u32, Hash256), SourceError> {
            let height = self.0.len() as u32 - 1;
            Ok((height, self.0[height as usize]))
        }

        fn block_hash(&self, height: u32) -> Result<Option<Hash256>, SourceError> {
            Ok(self.0.get(height as usize).copied())
        }

        fn block(&self, _hash: &Hash256) -> Result<Vec<u8>, SourceError> {
            Err(SourceError("not used".into()))
        }
    }

    fn indexed_chain(blocks: u32) -> (Arc<MemoryStore>, Vec<TestBlock>) {
        let store = Arc::new(MemoryStore::new());
        let mut indexer = Indexer::open(Arc::clone(&store), selector(), IndexerConfig::new(10))
            .expect("open");
        let mut chain = Vec::new();
        for height in 0..blocks {
            let block = extend(&mut chain, &[coinbase(height, 1, 50)]);
            indexer
                .advance(block.height, block.hash, &block.raw)
                .expect("advance");
        }
        (store, chain)
    }

    #[test]
    fn samples_include_both_ends() {
        let heights = sample_heights(1000, 10, 7);
        assert_eq!(heights.len(), 10);
        assert_eq!(heights.first(), Some(&0));
        assert_eq!(heights.last(), Some(&1000));
        assert_eq!(heights, sample_heights(1000, 10, 7));
        assert_eq!(sample_heights(0, 10, 1), vec![0]);
        assert_eq!(sample_heights(3, 100, 1), vec![0, 1, 2, 3]);
    }

    #[test]
    fn matching_index_passes() {
        let (store, chain) = indexed_chain(6);
        let daemon = Hashes(chain.iter().map(|block| block.hash).collect());
        let summary = verify_index(&ChainQuery::new(store), &selector(), &daemon, 4, 3)
            .expect("verify");
        assert!(summary.all_match);
        assert_eq!(summary.db_height, Some(5));
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn daemon_disagreement_is_reported() {
        let (store, chain) = indexed_chain(4);
        let mut hashes: Vec<Hash256> = chain.iter().map(|block| block.hash).collect();
        hashes[3] = [0xee; 32];
        let summary = verify_index(&ChainQuery::new(store), &selector(), &Hashes(hashes), 2, 1)
            .expect("verify");
        assert!(!summary.all_match);
        let mismatch = summary.first_mismatch.expect("mismatch");
        assert_eq!(mismatch.height, 3);
        assert_eq!(mismatch.daemon, Some(hash256_to_hex(&[0xee; 32])));
        assert_eq!(mismatch.stored, mismatch.computed);
        assert!(mismatch.error.is_none());
    }

    #[test]
    fn empty_index_trivially_matches() {
        let store = Arc::new(MemoryStore::new());
        let summary = verify_index(&ChainQuery::new(store), &selector(), &Hashes(vec![]), 8, 0)
            .expect("verify");
        assert!(summary.all_match);
        assert_eq!(summary.db_height, None);
    }
}
