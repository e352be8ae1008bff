//! Device backends.
//!
//! The engine never renders, compiles, or moves bytes itself. Everything
//! device-specific sits behind the traits in this module, bundled per
//! device into a `Device`. A `DeviceRegistry` creates devices lazily from
//! per-family factories: `HOST:0` and `HOST:1` are two devices of the
//! `HOST` family and share compiled programs.

pub mod host;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ExecError, LowerError};
use crate::ir::{Graph, NodeId};
use crate::shape::{VarVals, Variable};

/// Device family: the part of a device name before the first `:`.
pub fn device_family(name: &str) -> &str {
    name.split_once(':').map_or(name, |(family, _)| family)
}

// ─── Lowering ──────────────────────────────────────────────────────

/// Renderer options that change the produced program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RenderContext {
    /// Beam search width for kernel optimization; 0 disables the search.
    pub beam: u32,
    pub noopt: bool,
    pub devectorize: u32,
}

/// Everything a renderer sees of one kernel.
pub struct KernelSource<'a> {
    pub name: &'a str,
    pub graph: &'a Graph,
    /// The kernel's `Sink`.
    pub ast: NodeId,
    /// Placeholder indices in launch order.
    pub globals: &'a [usize],
    /// Free variables in launch order.
    pub vars: &'a [Variable],
    pub context: RenderContext,
}

pub trait Renderer: Send + Sync {
    fn render(&self, kernel: &KernelSource<'_>) -> Result<String, LowerError>;
}

pub trait Compiler: Send + Sync {
    fn compile(&self, src: &str) -> Result<Vec<u8>, LowerError>;
}

/// Launch parameters of one program invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchArgs {
    pub global_size: [usize; 3],
    /// Values of the program's variables, in its launch order.
    pub vals: Vec<i64>,
}

/// A loaded, launchable program.
pub trait Program: Send + Sync {
    /// Run over `bufs` (output first). Returns the elapsed seconds when
    /// `wait` is set.
    fn launch(
        &self,
        bufs: &[RawBuffer],
        args: &LaunchArgs,
        wait: bool,
    ) -> Result<Option<f64>, ExecError>;
}

pub trait Runtime: Send + Sync {
    fn load(&self, name: &str, lib: &[u8]) -> Result<Box<dyn Program>, LowerError>;
    fn synchronize(&self) -> Result<(), ExecError>;
}

// ─── Memory ────────────────────────────────────────────────────────

/// A device allocation, or a byte window into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawBuffer {
    pub handle: u64,
    pub offset: usize,
    pub nbytes: usize,
}

impl RawBuffer {
    /// The `nbytes` window starting `offset` bytes into this buffer.
    pub fn window(&self, offset: usize, nbytes: usize) -> RawBuffer {
        RawBuffer {
            handle: self.handle,
            offset: self.offset + offset,
            nbytes,
        }
    }
}

pub trait Allocator: Send + Sync {
    fn alloc(&self, nbytes: usize) -> Result<RawBuffer, ExecError>;
    fn free(&self, buf: RawBuffer);
    fn copyin(&self, dest: &RawBuffer, src: &[u8]) -> Result<(), ExecError>;
    fn copyout(&self, dest: &mut [u8], src: &RawBuffer) -> Result<(), ExecError>;
    /// Whether `transfer` can move bytes from another device of the same
    /// family without a host round trip.
    fn supports_transfer(&self) -> bool {
        false
    }
    fn transfer(&self, dest: &RawBuffer, src: &RawBuffer, nbytes: usize) -> Result<(), ExecError> {
        let _ = (dest, src, nbytes);
        Err(ExecError::Device("transfer not supported".to_string()))
    }
}

/// The collaborators of one device.
#[derive(Clone)]
pub struct Device {
    pub name: String,
    pub renderer: Arc<dyn Renderer>,
    pub compiler: Arc<dyn Compiler>,
    pub runtime: Arc<dyn Runtime>,
    pub allocator: Arc<dyn Allocator>,
}

impl Device {
    pub fn family(&self) -> &str {
        device_family(&self.name)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("name", &self.name).finish()
    }
}

// ─── Registry ──────────────────────────────────────────────────────

type Factory = Arc<dyn Fn(&str) -> Device + Send + Sync>;

/// Device name → device, created on first use.
#[derive(Default)]
pub struct DeviceRegistry {
    families: HashMap<String, Factory>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows the `HOST` family.
    pub fn with_host() -> Self {
        let mut reg = Self::new();
        reg.register_family("HOST", host::family(host::HostOptions::default()));
        reg
    }

    /// Create devices of `family` on demand with `factory`.
    pub fn register_family(
        &mut self,
        family: &str,
        factory: impl Fn(&str) -> Device + Send + Sync + 'static,
    ) {
        self.families.insert(family.to_string(), Arc::new(factory));
    }

    /// Register a fully built device, replacing any earlier one.
    pub fn register(&self, device: Device) {
        if let Ok(mut devices) = self.devices.write() {
            devices.insert(device.name.clone(), Arc::new(device));
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Device>, ExecError> {
        if let Some(dev) = self.devices.read().ok().and_then(|d| d.get(name).cloned()) {
            return Ok(dev);
        }
        let factory = self
            .families
            .get(device_family(name))
            .ok_or_else(|| ExecError::UnknownDevice(name.to_string()))?;
        let created = Arc::new(factory(name));
        let mut devices = self
            .devices
            .write()
            .map_err(|_| ExecError::Device("device registry poisoned".to_string()))?;
        Ok(devices.entry(name.to_string()).or_insert(created).clone())
    }

    /// Names of the devices created so far.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Wait for every created device.
    pub fn synchronize(&self) -> Result<(), ExecError> {
        for name in self.names() {
            self.get(&name)?.runtime.synchronize()?;
        }
        Ok(())
    }
}

/// Values of `vars` in order, failing on a missing one.
pub fn launch_vals(vars: &[Variable], vals: &VarVals) -> Result<Vec<i64>, ExecError> {
    vars.iter()
        .map(|v| {
            vals.get(v)
                .copied()
                .ok_or_else(|| ExecError::UnboundVariable(v.name.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests;
