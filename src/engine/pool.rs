use std::collections::HashMap;

use crate::device::{DeviceRegistry, RawBuffer};
use crate::error::ExecError;
use crate::schedule::BufferDesc;

struct Allocation {
    device: String,
    raw: RawBuffer,
}

/// Runtime allocations, keyed by buffer id. A buffer is allocated the
/// first time any descriptor of it is used; views share the allocation.
#[derive(Default)]
pub struct BufferPool {
    allocs: HashMap<u64, Allocation>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.allocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocs.is_empty()
    }

    pub fn is_allocated(&self, desc: &BufferDesc) -> bool {
        self.allocs.contains_key(&desc.id)
    }

    /// The device window `desc` names, allocating the buffer if needed.
    pub fn ensure(
        &mut self,
        registry: &DeviceRegistry,
        desc: &BufferDesc,
    ) -> Result<RawBuffer, ExecError> {
        let itemsize = desc.dtype.itemsize();
        let base = match self.allocs.get(&desc.id) {
            Some(a) => a.raw,
            None => {
                let dev = registry.get(&desc.device)?;
                let raw = dev.allocator.alloc(desc.base_size * itemsize)?;
                tracing::trace!(id = desc.id, device = %desc.device, bytes = raw.nbytes, "allocated");
                self.allocs.insert(
                    desc.id,
                    Allocation {
                        device: desc.device.clone(),
                        raw,
                    },
                );
                raw
            }
        };
        Ok(base.window(desc.offset * itemsize, desc.size * itemsize))
    }

    /// Release every allocation.
    pub fn clear(&mut self, registry: &DeviceRegistry) {
        for (_, a) in self.allocs.drain() {
            if let Ok(dev) = registry.get(&a.device) {
                dev.allocator.free(a.raw);
            }
        }
    }
}
