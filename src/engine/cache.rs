//! The process-wide program cache.
//!
//! The cache holds compiled libraries, never loaded programs: a library is
//! filed under its exact device and under the device's family, and every
//! lookup loads it on the device that asked. A miss on the exact key that
//! hits the family key skips render and compile. Compilation runs outside
//! the lock; when two callers race on the same key, the first insertion
//! wins and the loser loads the winner's library.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::device::{Device, KernelSource, Program, RenderContext};
use crate::error::LowerError;
use crate::ir::{ContentHash, Graph, NodeId};

use super::program::ProgramSpec;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Device name, or family name for family entries.
    pub device: String,
    pub ast: ContentHash,
    pub context: RenderContext,
    pub family: bool,
}

/// A compiled binary and what the engine needs to launch it.
#[derive(Debug)]
pub struct Library {
    /// Device the library was compiled for.
    pub device: String,
    pub spec: Arc<ProgramSpec>,
    pub lib: Arc<[u8]>,
}

/// A library loaded on one device.
pub struct CompiledProgram {
    pub device: String,
    pub spec: Arc<ProgramSpec>,
    pub lib: Arc<[u8]>,
    program: Box<dyn Program>,
}

impl CompiledProgram {
    pub fn program(&self) -> &dyn Program {
        self.program.as_ref()
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("device", &self.device)
            .field("name", &self.spec.name)
            .field("lib", &self.lib.len())
            .finish()
    }
}

/// Snapshot of the cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheCounters {
    pub hits: usize,
    pub rebinds: usize,
    pub misses: usize,
}

#[derive(Default)]
pub struct ProgramCache {
    entries: RwLock<HashMap<CacheKey, Arc<Library>>>,
    hits: AtomicUsize,
    rebinds: AtomicUsize,
    misses: AtomicUsize,
}

fn poisoned() -> LowerError {
    LowerError::Cache("program cache lock poisoned".to_string())
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.lookup(key), Ok(Some(_)))
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.hits.load(Ordering::Relaxed),
            rebinds: self.rebinds.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &CacheKey) -> Result<Option<Arc<Library>>, LowerError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn insert(&self, key: CacheKey, library: Arc<Library>) -> Result<Arc<Library>, LowerError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries.entry(key).or_insert(library).clone())
    }

    /// The library for `ast` on `device`, compiling it if needed.
    pub fn get_library(
        &self,
        device: &Device,
        g: &Graph,
        ast: NodeId,
        context: RenderContext,
    ) -> Result<Arc<Library>, LowerError> {
        let hash = g.content_hash(ast);
        let exact = CacheKey {
            device: device.name.clone(),
            ast: hash,
            context,
            family: false,
        };
        if let Some(library) = self.lookup(&exact)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(device = %device.name, ast = %hash, "program cache hit");
            return Ok(library);
        }

        let family = CacheKey {
            device: device.family().to_string(),
            family: true,
            ..exact.clone()
        };
        if let Some(library) = self.lookup(&family)? {
            self.rebinds.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                device = %device.name,
                from = %library.device,
                ast = %hash,
                "program cache rebind"
            );
            return self.insert(exact, library);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let spec = ProgramSpec::from_ast(g, ast)?;
        let src = device.renderer.render(&KernelSource {
            name: &spec.name,
            graph: g,
            ast,
            globals: &spec.globals,
            vars: &spec.vars,
            context,
        })?;
        let lib: Arc<[u8]> = device.compiler.compile(&src)?.into();
        tracing::debug!(
            device = %device.name,
            name = %spec.name,
            ast = %hash,
            bytes = lib.len(),
            "program cache miss"
        );
        let library = self.insert(
            exact,
            Arc::new(Library {
                device: device.name.clone(),
                spec: Arc::new(spec),
                lib,
            }),
        )?;
        self.insert(family, library.clone())?;
        Ok(library)
    }

    /// The program for `ast` loaded on `device`.
    pub fn get_runner(
        &self,
        device: &Device,
        g: &Graph,
        ast: NodeId,
        context: RenderContext,
    ) -> Result<Arc<CompiledProgram>, LowerError> {
        let library = self.get_library(device, g, ast, context)?;
        let program = device.runtime.load(&library.spec.name, &library.lib)?;
        Ok(Arc::new(CompiledProgram {
            device: device.name.clone(),
            spec: library.spec.clone(),
            lib: library.lib.clone(),
            program,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::ir::DType;

    fn neg_kernel(g: &mut Graph) -> NodeId {
        let a = g.buffer("HOST", DType::F32, 4);
        let n = g.unary(crate::ir::Op::Neg, a).unwrap();
        let sink = g.sink(vec![n]);
        let k = crate::kernelize::kernelize(g, sink, &Default::default()).unwrap();
        crate::schedule::create_schedule(g, k).unwrap().items[0].ast
    }

    #[test]
    fn test_poisoned_lock_is_an_error() {
        let cache = ProgramCache::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = cache.entries.write().unwrap();
            panic!("writer died");
        }));
        let mut g = Graph::new();
        let ast = neg_kernel(&mut g);
        let dev = DeviceRegistry::with_host().get("HOST").unwrap();

        let err = cache
            .get_runner(&dev, &g, ast, RenderContext::default())
            .unwrap_err();
        assert!(matches!(err, LowerError::Cache(_)), "{}", err);
        assert!(!cache.contains(&CacheKey {
            device: "HOST".to_string(),
            ast: g.content_hash(ast),
            context: RenderContext::default(),
            family: false,
        }));
    }

    #[test]
    fn test_hits_load_on_the_requesting_device() {
        let cache = ProgramCache::new();
        let mut g = Graph::new();
        let ast = neg_kernel(&mut g);
        let first = DeviceRegistry::with_host().get("HOST").unwrap();
        let second = DeviceRegistry::with_host().get("HOST").unwrap();

        let a = cache.get_runner(&first, &g, ast, RenderContext::default()).unwrap();
        let b = cache.get_runner(&second, &g, ast, RenderContext::default()).unwrap();
        assert_eq!(cache.counters().hits, 1);
        assert!(Arc::ptr_eq(&a.lib, &b.lib));
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
