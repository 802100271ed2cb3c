//! Wasmtime runner that boots VM modules and drives their HTTP handler.

mod instance;

use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use wasmtime::{Config, Engine, Module};

pub use instance::{RegisterOutcome, VmInstance};

pub(crate) const ENTRY_EXPORT: &str = "_start";
pub(crate) const ALLOC_EXPORT: &str = "alloc";
pub(crate) const MEMORY_EXPORT: &str = "memory";
pub(crate) const TERMINATE_EXPORT: &str = "terminate";
const WASMTIME_VERSION: &str = "36.0.3";

/// Shared engine plus compiled-module cache for VM modules.
pub struct VmRuntime {
    engine: Arc<Engine>,
    module_cache: Mutex<HashMap<ModuleKey, Arc<Module>>>,
    disk_cache: Option<DiskCache>,
}

impl VmRuntime {
    /// Build a runtime without threads, fuel or debug info.
    pub fn new() -> Result<Self> {
        Self::new_with_disk_cache(None)
    }

    /// Build a runtime and optionally persist compiled modules under `cache_dir`.
    pub fn new_with_disk_cache(cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.wasm_multi_value(true);
        cfg.wasm_threads(false);
        cfg.wasm_reference_types(true);
        cfg.consume_fuel(false);
        cfg.debug_info(false);
        let engine = Engine::new(&cfg)?;
        let disk_cache = if let Some(dir) = cache_dir {
            let fingerprint = engine_cache_fingerprint();
            let engine_dir = dir.join(&fingerprint);
            fs::create_dir_all(&engine_dir)
                .with_context(|| format!("create cache dir {}", engine_dir.display()))?;
            Some(DiskCache {
                root: dir,
                engine_fingerprint: fingerprint,
            })
        } else {
            None
        };
        Ok(Self {
            engine: Arc::new(engine),
            module_cache: Mutex::new(HashMap::new()),
            disk_cache,
        })
    }

    /// Compile a WASM blob without touching any cache.
    pub fn compile(&self, wasm_bytes: &[u8]) -> Result<Module> {
        Module::new(&self.engine, wasm_bytes)
    }

    /// Obtain (and cache) a compiled module for the given WASM bytes.
    ///
    /// `namespace` separates on-disk entries written for different launch cache keys.
    pub fn cached_module(&self, wasm_bytes: &[u8], namespace: Option<&str>) -> Result<Arc<Module>> {
        let key = ModuleKey::from_bytes(wasm_bytes);
        if let Some(existing) = self.get_cached_module(&key) {
            return Ok(existing);
        }

        if let Some(serialized) = self.load_serialized(&key, namespace)? {
            self.insert_cached_module(key, serialized.clone());
            return Ok(serialized);
        }

        let compiled = Arc::new(self.compile(wasm_bytes)?);
        if let Err(err) = self.store_serialized(&key, namespace, &compiled) {
            log::warn!("failed to persist compiled module: {err:#}");
        }
        self.insert_cached_module(key, compiled.clone());
        Ok(compiled)
    }

    /// Instantiate a compiled module with the host imports linked in.
    ///
    /// `argv` is what the module reads back through `args_get`.
    pub fn instantiate(&self, module: &Module, argv: Vec<String>) -> Result<VmInstance> {
        VmInstance::new(&self.engine, module, argv)
    }

    fn get_cached_module(&self, key: &ModuleKey) -> Option<Arc<Module>> {
        self.module_cache
            .lock()
            .expect("module cache poisoned")
            .get(key)
            .cloned()
    }

    fn insert_cached_module(&self, key: ModuleKey, module: Arc<Module>) {
        let mut cache = self.module_cache.lock().expect("module cache poisoned");
        cache.entry(key).or_insert(module);
    }

    fn load_serialized(&self, key: &ModuleKey, namespace: Option<&str>) -> Result<Option<Arc<Module>>> {
        let cache = match &self.disk_cache {
            Some(cache) => cache,
            None => return Ok(None),
        };
        let path = cache.module_path(key, namespace);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };
        match unsafe { Module::deserialize(&self.engine, &bytes) } {
            Ok(module) => {
                log::debug!("loaded compiled module from {}", path.display());
                Ok(Some(Arc::new(module)))
            }
            Err(_) => {
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn store_serialized(
        &self,
        key: &ModuleKey,
        namespace: Option<&str>,
        module: &Arc<Module>,
    ) -> Result<()> {
        let cache = match &self.disk_cache {
            Some(cache) => cache,
            None => return Ok(()),
        };
        let bytes = module.serialize().context("serialize compiled vm module")?;
        let path = cache.module_path(key, namespace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("write serialized module {}", path.display()))?;
        Ok(())
    }
}

struct DiskCache {
    root: PathBuf,
    engine_fingerprint: String,
}

impl DiskCache {
    fn module_path(&self, key: &ModuleKey, namespace: Option<&str>) -> PathBuf {
        let mut dir = self.root.join(&self.engine_fingerprint);
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            dir = dir.join(sanitize_namespace(ns));
        }
        dir.join(key.hex()).join("module.cmod")
    }
}

fn sanitize_namespace(ns: &str) -> String {
    ns.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ModuleKey([u8; 32]);

impl ModuleKey {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest: [u8; 32] = hasher.finalize().into();
        Self(digest)
    }

    fn hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            let _ = write!(&mut out, "{:02x}", byte);
        }
        out
    }
}

fn engine_cache_fingerprint() -> String {
    let desc = format!(
        "wasmtime:{version};arch:{arch};os:{os};multi_value:1;threads:0;ref_types:1;fuel:0;debug:0",
        version = WASMTIME_VERSION,
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
    );
    let digest = Sha256::digest(desc.as_bytes());
    format!("engine-{:x}", digest)
}


#[cfg(test)]
impl VmRuntime {
    fn cached_module_count(&self) -> usize {
        self.module_cache
            .lock()
            .expect("module cache poisoned")
            .len()
    }
}
