//! Runners and executable items.

use std::sync::Arc;
use std::time::Instant;

use crate::device::{launch_vals, Device, DeviceRegistry, LaunchArgs, RawBuffer};
use crate::error::{BufferAttrs, ExecError};
use crate::ir::Metadata;
use crate::schedule::BufferDesc;
use crate::shape::VarVals;

use super::cache::CompiledProgram;
use super::pool::BufferPool;
use super::stats::Stats;

/// How an item executes.
#[derive(Clone, Debug)]
pub enum Runner {
    /// A compiled kernel.
    Compiled(Arc<CompiledProgram>),
    /// Device-to-device move within a family.
    Transfer { dest: Arc<Device>, src: Arc<Device> },
    /// Move through host memory.
    Copy { dest: Arc<Device>, src: Arc<Device> },
}

fn attrs(desc: &BufferDesc) -> BufferAttrs {
    BufferAttrs {
        device: desc.device.clone(),
        size: desc.size,
        dtype: desc.dtype,
    }
}

/// Copies need two buffers of the same size and dtype.
fn check_copy(bufs: &[BufferDesc]) -> Result<(), ExecError> {
    let [dest, src] = bufs else {
        return Err(ExecError::Device(format!("copy takes 2 buffers, got {}", bufs.len())));
    };
    if dest.size != src.size || dest.dtype != src.dtype {
        return Err(ExecError::CopyMismatch {
            dest: attrs(dest),
            src: attrs(src),
        });
    }
    Ok(())
}

impl Runner {
    pub fn name(&self) -> String {
        match self {
            Runner::Compiled(p) => p.spec.name.clone(),
            Runner::Transfer { dest, src } => format!("xfer {} <- {}", dest.name, src.name),
            Runner::Copy { dest, src } => format!("copy {} <- {}", dest.name, src.name),
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Runner::Compiled(p) => &p.device,
            Runner::Transfer { dest, .. } | Runner::Copy { dest, .. } => &dest.name,
        }
    }

    /// `(ops, mem)` of one execution.
    fn estimates(&self, bufs: &[BufferDesc], vals: &VarVals) -> Result<(u64, u64), ExecError> {
        match self {
            Runner::Compiled(p) => {
                let (ops, _, mem) = p.spec.estimates.eval(vals)?;
                Ok((ops, mem))
            }
            _ => Ok((0, bufs.first().map_or(0, |b| (b.size * b.dtype.itemsize()) as u64))),
        }
    }

    /// Run once. `raw` holds the device windows of `bufs`, in the same
    /// order.
    pub fn execute(
        &self,
        raw: &[RawBuffer],
        bufs: &[BufferDesc],
        vals: &VarVals,
        wait: bool,
    ) -> Result<Option<f64>, ExecError> {
        match self {
            Runner::Compiled(p) => {
                let spec = &p.spec;
                let ordered = spec
                    .globals
                    .iter()
                    .map(|&i| {
                        raw.get(i).copied().ok_or_else(|| {
                            ExecError::Device(format!("{} needs buffer {}", spec.name, i))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let args = LaunchArgs {
                    global_size: spec.launch_dims(vals)?,
                    vals: launch_vals(&spec.vars, vals)?,
                };
                p.program().launch(&ordered, &args, wait)
            }
            Runner::Transfer { dest, src } => {
                check_copy(bufs)?;
                let start = Instant::now();
                dest.allocator.transfer(&raw[0], &raw[1], raw[0].nbytes)?;
                if wait {
                    dest.runtime.synchronize()?;
                    src.runtime.synchronize()?;
                }
                Ok(wait.then(|| start.elapsed().as_secs_f64()))
            }
            Runner::Copy { dest, src } => {
                check_copy(bufs)?;
                let start = Instant::now();
                let mut staging = vec![0u8; raw[1].nbytes];
                src.allocator.copyout(&mut staging, &raw[1])?;
                dest.allocator.copyin(&raw[0], &staging)?;
                Ok(wait.then(|| start.elapsed().as_secs_f64()))
            }
        }
    }
}

/// A lowered schedule item.
#[derive(Clone, Debug)]
pub struct ExecItem {
    pub runner: Runner,
    pub bufs: Vec<BufferDesc>,
    pub metadata: Vec<Metadata>,
    pub fixedvars: VarVals,
}

impl ExecItem {
    /// Execute with `var_vals` (overridden by the item's own bindings) and
    /// account for it in `stats`.
    pub fn run(
        &self,
        pool: &mut BufferPool,
        registry: &DeviceRegistry,
        stats: &mut Stats,
        var_vals: &VarVals,
        wait: bool,
    ) -> Result<Option<f64>, ExecError> {
        let mut vals = var_vals.clone();
        vals.extend(self.fixedvars.iter().map(|(k, v)| (k.clone(), *v)));
        if !matches!(self.runner, Runner::Compiled(_)) {
            check_copy(&self.bufs)?;
        }

        let raw = self
            .bufs
            .iter()
            .map(|b| pool.ensure(registry, b))
            .collect::<Result<Vec<_>, _>>()?;
        let et = self.runner.execute(&raw, &self.bufs, &vals, wait)?;

        let (ops, mem) = self.runner.estimates(&self.bufs, &vals)?;
        stats.kernel_count += 1;
        stats.global_ops += ops;
        stats.global_mem += mem;
        stats.time_sum_s += et.unwrap_or(0.0);

        let tm_us = et.map_or(0.0, |t| t * 1e6);
        let gflops = match et {
            Some(t) if t > 0.0 => ops as f64 / t * 1e-9,
            _ => 0.0,
        };
        tracing::debug!(
            "*** {:<7} {:>4} {:<24} arg {:>2} mem {:.2} GB tm {:>9.2}us/{:>8.2}ms ({:>8.2} GFLOPS) {}",
            self.runner.device(),
            stats.kernel_count,
            self.runner.name(),
            self.bufs.len(),
            mem as f64 * 1e-9,
            tm_us,
            stats.time_sum_s * 1e3,
            gflops,
            self.metadata
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(et)
    }
}
