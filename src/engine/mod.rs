//! Lowering schedule items to runners and executing them.
//!
//! An `Engine` is one execution session: it owns the device registry, the
//! runtime buffers and the counters, and shares a `ProgramCache` that may
//! outlive it. Items execute synchronously, one at a time, in schedule
//! order.

mod cache;
mod pool;
mod program;
mod runner;
mod stats;

use std::collections::VecDeque;
use std::sync::Arc;

use rayon::prelude::*;

use crate::device::{host, Device, DeviceRegistry, RenderContext};
use crate::error::{EngineError, Error, ExecError, GraphError, LowerError};
use crate::ir::{Graph, NodeId, Op};
use crate::kernelize::is_constexpr;
use crate::schedule::{BufferDesc, ScheduleItem};
use crate::shape::{eval_shape, unravel, VarVals};

pub use cache::{CacheCounters, CacheKey, CompiledProgram, Library, ProgramCache};
pub use pool::BufferPool;
pub use program::{fold_dims, Estimates, ProgramSpec};
pub use runner::{ExecItem, Runner};
pub use stats::Stats;

pub struct Engine {
    registry: DeviceRegistry,
    cache: Arc<ProgramCache>,
    pool: BufferPool,
    stats: Stats,
    context: RenderContext,
    wait: bool,
}

impl Engine {
    pub fn new(registry: DeviceRegistry, cache: Arc<ProgramCache>) -> Self {
        Self {
            registry,
            cache,
            pool: BufferPool::new(),
            stats: Stats::default(),
            context: RenderContext::default(),
            wait: false,
        }
    }

    /// A session over the `HOST` family with a fresh cache.
    pub fn host() -> Self {
        Self::new(DeviceRegistry::with_host(), Arc::new(ProgramCache::new()))
    }

    pub fn with_context(mut self, context: RenderContext) -> Self {
        self.context = context;
        self
    }

    /// Wait for every item and record its time.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ProgramCache> {
        &self.cache
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Counters over every item this session ran.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn device(&self, name: &str) -> Result<Arc<Device>, LowerError> {
        self.registry
            .get(name)
            .map_err(|_| LowerError::UnknownDevice(name.to_string()))
    }

    pub fn lower_schedule_item(&self, g: &Graph, item: &ScheduleItem) -> Result<ExecItem, LowerError> {
        let out = item
            .bufs
            .first()
            .ok_or_else(|| LowerError::UnsupportedAst("kernel without an output buffer".to_string()))?;
        let runner = match g.op(item.ast) {
            Op::Sink => {
                let dev = self.device(&out.device)?;
                Runner::Compiled(self.cache.get_runner(&dev, g, item.ast, self.context)?)
            }
            Op::Copy => {
                let src = item
                    .bufs
                    .get(1)
                    .ok_or_else(|| LowerError::UnsupportedAst("copy without a source".to_string()))?;
                let dest = self.device(&out.device)?;
                let src = self.device(&src.device)?;
                if dest.allocator.supports_transfer() && dest.family() == src.family() {
                    Runner::Transfer { dest, src }
                } else {
                    Runner::Copy { dest, src }
                }
            }
            op => return Err(LowerError::UnsupportedAst(format!("{} as a kernel root", op))),
        };
        Ok(ExecItem {
            runner,
            bufs: item.bufs.clone(),
            metadata: item.metadata.clone(),
            fixedvars: item.fixedvars.clone(),
        })
    }

    /// Pop and run every item. Returns the counters of this run; items that
    /// ran before a failure still count toward the session.
    pub fn run_schedule(
        &mut self,
        g: &Graph,
        schedule: &mut VecDeque<ScheduleItem>,
        var_vals: &VarVals,
    ) -> Result<Stats, EngineError> {
        let mut run = Stats::default();
        let result = self.run_items(g, schedule, var_vals, &mut run);
        self.stats.add(&run);
        result.map(|()| run)
    }

    fn run_items(
        &mut self,
        g: &Graph,
        schedule: &mut VecDeque<ScheduleItem>,
        var_vals: &VarVals,
        run: &mut Stats,
    ) -> Result<(), EngineError> {
        while let Some(item) = schedule.pop_front() {
            let ei = self.lower_schedule_item(g, &item).map_err(|source| {
                let kernel = item.name(g);
                let provenance = item.provenance();
                tracing::error!(%kernel, %provenance, error = %source, "lowering failed");
                EngineError::Lower {
                    kernel,
                    provenance,
                    source,
                }
            })?;
            ei.run(&mut self.pool, &self.registry, run, var_vals, self.wait)?;
        }
        Ok(())
    }

    /// Compile every kernel of `items` in parallel. Returns how many
    /// programs were looked up.
    pub fn precompile(&self, g: &Graph, items: &[ScheduleItem]) -> Result<usize, LowerError> {
        let kernels: Vec<&ScheduleItem> = items.iter().filter(|i| g.op(i.ast) == Op::Sink).collect();
        kernels
            .par_iter()
            .map(|item| {
                let out = item.bufs.first().ok_or_else(|| {
                    LowerError::UnsupportedAst("kernel without an output buffer".to_string())
                })?;
                let dev = self.device(&out.device)?;
                self.cache.get_library(&dev, g, item.ast, self.context).map(|_| ())
            })
            .collect::<Result<Vec<()>, LowerError>>()?;
        Ok(kernels.len())
    }

    // ─── Buffer access ─────────────────────────────────────────────

    pub fn copyin(&mut self, desc: &BufferDesc, bytes: &[u8]) -> Result<(), ExecError> {
        let raw = self.pool.ensure(&self.registry, desc)?;
        self.registry.get(&desc.device)?.allocator.copyin(&raw, bytes)
    }

    pub fn copyout(&mut self, desc: &BufferDesc) -> Result<Vec<u8>, ExecError> {
        let raw = self.pool.ensure(&self.registry, desc)?;
        let mut out = vec![0u8; raw.nbytes];
        self.registry.get(&desc.device)?.allocator.copyout(&mut out, &raw)?;
        Ok(out)
    }

    /// Fill a buffer from values, narrowed to its dtype.
    pub fn write(&mut self, desc: &BufferDesc, values: &[f64]) -> Result<(), ExecError> {
        if values.len() != desc.size {
            return Err(ExecError::Device(format!(
                "{} values for a buffer of {}",
                values.len(),
                desc.size
            )));
        }
        let bytes = host::encode(desc.dtype, values)?;
        self.copyin(desc, &bytes)
    }

    pub fn read(&mut self, desc: &BufferDesc) -> Result<Vec<f64>, ExecError> {
        let bytes = self.copyout(desc)?;
        host::decode(desc.dtype, &bytes)
    }

    /// Elements of an output of a kernelized graph, row-major. Outputs are
    /// views of buffers or constant expressions that never ran.
    pub fn readback(&mut self, g: &mut Graph, node: NodeId, vals: &VarVals) -> Result<Vec<f64>, Error> {
        let base = g.base(node);
        if matches!(g.op(base), Op::Buffer | Op::BufferView | Op::Store) {
            let desc = BufferDesc::from_node(g, base)?;
            let data = self.read(&desc)?;
            if node == base {
                return Ok(data);
            }
            if g.op(node) != Op::View || g.src(node)[0] != base {
                return Err(GraphError::malformed(g.op(node), "output is not a single view of a buffer").into());
            }
            let st = g
                .st(node)
                .ok_or_else(|| GraphError::malformed(Op::View, "view without a tracker"))?;
            let shape = eval_shape(st.shape(), vals).map_err(|e| GraphError::Symbolic(e.to_string()))?;
            let count: i64 = shape.iter().product();
            let mut out = Vec::with_capacity(count.max(0) as usize);
            for flat in 0..count {
                let idx = unravel(&shape, flat);
                let v = match st
                    .index(&idx, vals)
                    .map_err(|e| GraphError::Symbolic(e.to_string()))?
                {
                    Some(i) => data.get(i as usize).copied().ok_or_else(|| {
                        ExecError::Device(format!("index {} outside a buffer of {}", i, data.len()))
                    })?,
                    None => 0.0,
                };
                out.push(v);
            }
            return Ok(out);
        }
        if is_constexpr(g, node) {
            return Ok(host::evaluate(g, node)?);
        }
        Err(LowerError::UnsupportedAst(format!("reading back {}", g.op(node))).into())
    }

    /// Free every runtime buffer.
    pub fn release(&mut self) {
        self.pool.clear(&self.registry);
    }
}
