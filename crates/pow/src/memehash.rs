//! Legacy memehash: five sph 512-bit transforms followed by sha256 three times.
//!
//! The sph transforms come from native shared libraries. They are resolved
//! once at startup so a missing library stops the process before any header
//! is hashed.

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use libloading::Library;
use pepexd_consensus::constants::HEADER_SIZE;
use pepexd_consensus::Hash256;
use pepexd_log::log_info;
use pepexd_primitives::hash::sha256;

use crate::HashError;

const SPH_CTX_SIZE: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SphStage {
    Blake,
    Simd,
    Echo,
    CubeHash,
    Shavite,
}

impl SphStage {
    /// Pipeline order; each stage consumes the previous stage's full 64-byte output.
    pub const ALL: [SphStage; 5] = [
        SphStage::Blake,
        SphStage::Simd,
        SphStage::Echo,
        SphStage::CubeHash,
        SphStage::Shavite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SphStage::Blake => "blake",
            SphStage::Simd => "simd",
            SphStage::Echo => "echo",
            SphStage::CubeHash => "cubehash",
            SphStage::Shavite => "shavite",
        }
    }

    pub fn library_name(self) -> String {
        format!("libsph_{}.so", self.as_str())
    }
}

/// Source of the five 512-bit transforms.
pub trait LegacyBackend: Send + Sync {
    fn digest512(&self, stage: SphStage, data: &[u8]) -> [u8; 64];
}

pub fn memehash(backend: &dyn LegacyBackend, header: &[u8]) -> Result<Hash256, HashError> {
    if header.len() < HEADER_SIZE {
        return Err(HashError::HeaderTooShort(header.len()));
    }
    let mut state = backend.digest512(SphStage::Blake, header);
    for stage in &SphStage::ALL[1..] {
        state = backend.digest512(*stage, &state);
    }
    let first = sha256(&state);
    let second = sha256(&first);
    Ok(sha256(&second))
}

type InitFn = unsafe extern "C" fn(*mut c_void);
type UpdateFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize);
type CloseFn = unsafe extern "C" fn(*mut c_void, *mut c_void);

#[repr(C, align(16))]
struct SphContext([u8; SPH_CTX_SIZE]);

struct SphFunctions {
    init: InitFn,
    update: UpdateFn,
    close: CloseFn,
    // Keeps the symbols above valid.
    _library: Library,
}

pub struct NativeBackend {
    stages: Vec<SphFunctions>,
}

impl NativeBackend {
    /// Loads every transform from `dir` when given, else from the system search path.
    pub fn load(dir: Option<&Path>) -> Result<Self, HashError> {
        let mut stages = Vec::with_capacity(SphStage::ALL.len());
        for stage in SphStage::ALL {
            stages.push(load_stage(stage, dir)?);
        }
        let backend = Self { stages };
        backend.self_check()?;
        log_info!("loaded legacy hash backend ({} transforms)", backend.stages.len());
        Ok(backend)
    }

    fn self_check(&self) -> Result<(), HashError> {
        for stage in SphStage::ALL {
            let first = self.digest512(stage, b"pepexd");
            let second = self.digest512(stage, b"pepexd");
            if first != second || first == [0u8; 64] {
                return Err(HashError::BackendUnavailable(format!(
                    "sph_{}512 produced inconsistent output",
                    stage.as_str()
                )));
            }
        }
        Ok(())
    }
}

fn load_stage(stage: SphStage, dir: Option<&Path>) -> Result<SphFunctions, HashError> {
    let name = stage.library_name();
    let path = match dir {
        Some(dir) => dir.join(&name),
        None => PathBuf::from(&name),
    };
    // SAFETY: the sph libraries run no initialisation code with preconditions.
    let library = unsafe { Library::new(&path) }.map_err(|err| {
        HashError::BackendUnavailable(format!("{}: {err}", path.display()))
    })?;

    let prefix = format!("sph_{}512", stage.as_str());
    let symbol_err = |symbol: &str, err: libloading::Error| {
        HashError::BackendUnavailable(format!("{}: missing {symbol}: {err}", path.display()))
    };
    let init_name = format!("{prefix}_init\0");
    let update_name = format!("{prefix}\0");
    let close_name = format!("{prefix}_close\0");
    // SAFETY: the signatures match the sph C declarations.
    let (init, update, close) = unsafe {
        let init = *library
            .get::<InitFn>(init_name.as_bytes())
            .map_err(|err| symbol_err(&init_name, err))?;
        let update = *library
            .get::<UpdateFn>(update_name.as_bytes())
            .map_err(|err| symbol_err(&update_name, err))?;
        let close = *library
            .get::<CloseFn>(close_name.as_bytes())
            .map_err(|err| symbol_err(&close_name, err))?;
        (init, update, close)
    };

    Ok(SphFunctions {
        init,
        update,
        close,
        _library: library,
    })
}

impl LegacyBackend for NativeBackend {
    fn digest512(&self, stage: SphStage, data: &[u8]) -> [u8; 64] {
        let funcs = &self.stages[stage as usize];
        let mut ctx = SphContext([0u8; SPH_CTX_SIZE]);
        let mut out = [0u8; 64];
        let ctx_ptr = ctx.0.as_mut_ptr().cast::<c_void>();
        // SAFETY: ctx is larger than any sph 512 context and out holds 64 bytes.
        unsafe {
            (funcs.init)(ctx_ptr);
            (funcs.update)(ctx_ptr, data.as_ptr().cast::<c_void>(), data.len());
            (funcs.close)(ctx_ptr, out.as_mut_ptr().cast::<c_void>());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records each call so the pipeline wiring can be checked.
    struct Recording {
        calls: Mutex<Vec<(SphStage, Vec<u8>)>>,
    }

    impl LegacyBackend for Recording {
        fn digest512(&self, stage: SphStage, data: &[u8]) -> [u8; 64] {
            self.calls
                .lock()
                .expect("calls lock")
                .push((stage, data.to_vec()));
            [stage as u8 + 1; 64]
        }
    }

    #[test]
    fn stages_chain_full_width_outputs_then_triple_sha256() {
        let backend = Recording {
            calls: Mutex::new(Vec::new()),
        };
        let header = [7u8; 80];
        let digest = memehash(&backend, &header).expect("hash");

        let calls = backend.calls.lock().expect("calls lock");
        let stages: Vec<SphStage> = calls.iter().map(|(stage, _)| *stage).collect();
        assert_eq!(stages, SphStage::ALL.to_vec());
        assert_eq!(calls[0].1, header.to_vec());
        for (idx, (_, input)) in calls.iter().enumerate().skip(1) {
            assert_eq!(input, &vec![idx as u8; 64]);
        }

        let expected = sha256(&sha256(&sha256(&[5u8; 64])));
        assert_eq!(digest, expected);
    }

    #[test]
    fn rejects_short_headers() {
        let backend = Recording {
            calls: Mutex::new(Vec::new()),
        };
        assert!(matches!(
            memehash(&backend, &[0u8; 40]),
            Err(HashError::HeaderTooShort(40))
        ));
    }

    #[test]
    fn missing_library_is_reported_at_load() {
        let dir = Path::new("/nonexistent/pepexd-sph");
        match NativeBackend::load(Some(dir)) {
            Err(HashError::BackendUnavailable(message)) => {
                assert!(message.contains("libsph_blake.so"), "{message}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("load should fail without libraries"),
        }
    }
}
