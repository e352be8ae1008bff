//! The reference `HOST` device.
//!
//! Memory is a map of byte vectors shared by every device of the family.
//! The renderer flattens a kernel into a `HostProgram` and archives it with
//! rkyv; the hex text of the archive is the "source", the archive bytes are
//! the compiled library, and the runtime interprets the program.

mod interp;
mod program;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rkyv::rancor;
use rkyv::util::AlignedVec;

use crate::error::{ExecError, LowerError};
use crate::ir::{Graph, NodeId};
use crate::kernelize::merge_views;
use crate::rewrite::{Order, DEFAULT_MAX_STEPS};

use super::{
    Allocator, Compiler, Device, KernelSource, LaunchArgs, Program, RawBuffer, Renderer, Runtime,
};

pub use interp::{decode, encode, normalize, read_elem, write_elem, Machine};
pub use program::{lower, Alu, HostOp, HostProgram, HostReduce, HostStore, HostView, Instr, Sym, SymTerm};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostOptions {
    /// Allow direct transfers between devices of the family.
    pub transfer: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self { transfer: true }
    }
}

impl HostOptions {
    pub fn without_transfer() -> Self {
        Self { transfer: false }
    }
}

// ─── Memory ────────────────────────────────────────────────────────

/// Allocations of one device family.
#[derive(Default)]
pub struct HostMemory {
    next: AtomicU64,
    bufs: Mutex<HashMap<u64, Vec<u8>>>,
}

fn poisoned() -> ExecError {
    ExecError::Device("host memory poisoned".to_string())
}

fn window<'b>(bufs: &'b HashMap<u64, Vec<u8>>, raw: &RawBuffer) -> Result<&'b [u8], ExecError> {
    bufs.get(&raw.handle)
        .and_then(|b| b.get(raw.offset..raw.offset + raw.nbytes))
        .ok_or_else(|| ExecError::Device(format!("invalid host buffer {:?}", raw)))
}

fn window_mut<'b>(
    bufs: &'b mut HashMap<u64, Vec<u8>>,
    raw: &RawBuffer,
) -> Result<&'b mut [u8], ExecError> {
    bufs.get_mut(&raw.handle)
        .and_then(|b| b.get_mut(raw.offset..raw.offset + raw.nbytes))
        .ok_or_else(|| ExecError::Device(format!("invalid host buffer {:?}", raw)))
}

impl HostMemory {
    pub fn read(&self, raw: &RawBuffer) -> Result<Vec<u8>, ExecError> {
        let bufs = self.bufs.lock().map_err(|_| poisoned())?;
        Ok(window(&bufs, raw)?.to_vec())
    }

    pub fn write(&self, raw: &RawBuffer, bytes: &[u8]) -> Result<(), ExecError> {
        let mut bufs = self.bufs.lock().map_err(|_| poisoned())?;
        let dest = window_mut(&mut bufs, raw)?;
        if dest.len() != bytes.len() {
            return Err(ExecError::Device(format!(
                "write of {} bytes into a {} byte buffer",
                bytes.len(),
                dest.len()
            )));
        }
        dest.copy_from_slice(bytes);
        Ok(())
    }

    /// Number of live allocations.
    pub fn live(&self) -> usize {
        self.bufs.lock().map(|b| b.len()).unwrap_or(0)
    }
}

pub struct HostAllocator {
    mem: Arc<HostMemory>,
    opts: HostOptions,
}

impl Allocator for HostAllocator {
    fn alloc(&self, nbytes: usize) -> Result<RawBuffer, ExecError> {
        let handle = self.mem.next.fetch_add(1, Ordering::Relaxed);
        let mut bufs = self.mem.bufs.lock().map_err(|_| poisoned())?;
        bufs.insert(handle, vec![0u8; nbytes]);
        Ok(RawBuffer {
            handle,
            offset: 0,
            nbytes,
        })
    }

    fn free(&self, buf: RawBuffer) {
        if let Ok(mut bufs) = self.mem.bufs.lock() {
            bufs.remove(&buf.handle);
        }
    }

    fn copyin(&self, dest: &RawBuffer, src: &[u8]) -> Result<(), ExecError> {
        self.mem.write(dest, src)
    }

    fn copyout(&self, dest: &mut [u8], src: &RawBuffer) -> Result<(), ExecError> {
        let bytes = self.mem.read(src)?;
        if dest.len() != bytes.len() {
            return Err(ExecError::Device(format!(
                "copyout of {} bytes into {}",
                bytes.len(),
                dest.len()
            )));
        }
        dest.copy_from_slice(&bytes);
        Ok(())
    }

    fn supports_transfer(&self) -> bool {
        self.opts.transfer
    }

    fn transfer(&self, dest: &RawBuffer, src: &RawBuffer, nbytes: usize) -> Result<(), ExecError> {
        let bytes = self.mem.read(&RawBuffer { nbytes, ..*src })?;
        self.mem.write(&RawBuffer { nbytes, ..*dest }, &bytes)
    }
}

// ─── Lowering ──────────────────────────────────────────────────────

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(src: &str) -> Option<Vec<u8>> {
    let src = src.trim().as_bytes();
    if src.len() % 2 != 0 {
        return None;
    }
    src.chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

fn unarchive(lib: &[u8]) -> Result<HostProgram, rancor::Error> {
    let mut aligned: AlignedVec = AlignedVec::new();
    aligned.extend_from_slice(lib);
    rkyv::from_bytes::<HostProgram, rancor::Error>(&aligned)
}

pub struct HostRenderer;

impl Renderer for HostRenderer {
    fn render(&self, kernel: &KernelSource<'_>) -> Result<String, LowerError> {
        let prog = lower(kernel.graph, kernel.name, kernel.ast, kernel.globals, kernel.vars)?;
        let bytes = rkyv::to_bytes::<rancor::Error>(&prog)
            .map_err(|e| LowerError::Render(e.to_string()))?;
        Ok(to_hex(&bytes))
    }
}

pub struct HostCompiler;

impl Compiler for HostCompiler {
    fn compile(&self, src: &str) -> Result<Vec<u8>, LowerError> {
        let lib = from_hex(src).ok_or_else(|| LowerError::Compile("source is not hex".to_string()))?;
        unarchive(&lib).map_err(|e| LowerError::Compile(e.to_string()))?;
        Ok(lib)
    }
}

pub struct HostRuntime {
    mem: Arc<HostMemory>,
}

impl Runtime for HostRuntime {
    fn load(&self, name: &str, lib: &[u8]) -> Result<Box<dyn Program>, LowerError> {
        let program = unarchive(lib).map_err(|e| LowerError::Load(e.to_string()))?;
        if program.name != name {
            return Err(LowerError::Load(format!(
                "library holds '{}', not '{}'",
                program.name, name
            )));
        }
        Ok(Box::new(HostKernel {
            program,
            mem: self.mem.clone(),
        }))
    }

    fn synchronize(&self) -> Result<(), ExecError> {
        Ok(())
    }
}

pub struct HostKernel {
    program: HostProgram,
    mem: Arc<HostMemory>,
}

impl Program for HostKernel {
    fn launch(
        &self,
        bufs: &[RawBuffer],
        args: &LaunchArgs,
        wait: bool,
    ) -> Result<Option<f64>, ExecError> {
        let start = Instant::now();
        let inputs = bufs
            .iter()
            .map(|b| self.mem.read(b))
            .collect::<Result<Vec<_>, _>>()?;
        let store = self
            .program
            .store
            .as_ref()
            .ok_or_else(|| ExecError::Device(format!("{} has no store", self.program.name)))?;
        let target = bufs
            .get(store.global as usize)
            .ok_or_else(|| ExecError::Device(format!("{} needs an output buffer", self.program.name)))?;

        let machine = Machine::new(&self.program, &args.vals, &inputs)?;
        let mut out = inputs[store.global as usize].clone();
        machine.store_into(&mut out)?;
        self.mem.write(target, &out)?;
        Ok(wait.then(|| start.elapsed().as_secs_f64()))
    }
}

// ─── Devices ───────────────────────────────────────────────────────

/// A host device over `mem`.
pub fn device(name: &str, mem: Arc<HostMemory>, opts: HostOptions) -> Device {
    Device {
        name: name.to_string(),
        renderer: Arc::new(HostRenderer),
        compiler: Arc::new(HostCompiler),
        runtime: Arc::new(HostRuntime { mem: mem.clone() }),
        allocator: Arc::new(HostAllocator { mem, opts }),
    }
}

/// Factory for the `HOST` family: every device it creates shares one
/// memory.
pub fn family(opts: HostOptions) -> impl Fn(&str) -> Device + Send + Sync + 'static {
    let mem = Arc::new(HostMemory::default());
    move |name| device(name, mem.clone(), opts)
}

/// Every element of a constant expression, row-major. Movement ops are
/// folded into views first.
pub fn evaluate(g: &mut Graph, root: NodeId) -> Result<Vec<f64>, LowerError> {
    let root = merge_views::<()>()
        .rewrite(g, root, &mut (), Order::SourcesFirst, DEFAULT_MAX_STEPS)
        .map_err(|e| LowerError::UnsupportedAst(e.to_string()))?
        .root;
    let prog = lower(g, "constexpr", root, &[], &[])?;
    let machine =
        Machine::new(&prog, &[], &[]).map_err(|e| LowerError::UnsupportedAst(e.to_string()))?;
    machine
        .values()
        .map_err(|e| LowerError::UnsupportedAst(e.to_string()))
}

#[cfg(test)]
mod tests;
