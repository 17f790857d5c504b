//! Shader-data buffers and export streams, i.e. what instrumentation asks the
//! host to allocate, referenced by id until compilation binds them to slots
//! of the synthetic export resource (see [`crate::dxil::function::compile`]).

use crate::il::{Format, Program};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Host-allocated shader-data buffer.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[display(fmt = "shader-data#{}", _0)]
pub struct ShaderDataId(u32);

impl ShaderDataId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Export stream, i.e. the `export_id` of [`crate::il::InstKind::Export`].
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[display(fmt = "export#{}", _0)]
pub struct ShaderExportId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderDataKind {
    /// Device buffer of `elements` texels of `format`.
    Buffer { elements: u32, format: Format },

    /// Per-event constants, pushed with every draw/dispatch.
    EventData,

    /// Per-descriptor data (e.g. initialization state per resource).
    DescriptorData { dwords: u32 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShaderDataInfo {
    pub id: ShaderDataId,
    pub kind: ShaderDataKind,
}

/// Allocator of shader-data buffers, shared by all compile jobs.
pub trait ShaderDataHost: Send + Sync {
    fn create(&self, kind: ShaderDataKind) -> ShaderDataId;
    fn destroy(&self, id: ShaderDataId);

    /// Live allocations, in id order.
    fn enumerate(&self) -> Vec<ShaderDataInfo>;
}

/// [`ShaderDataHost`] keeping only the bookkeeping, with ids reused after
/// being destroyed.
#[derive(Default)]
pub struct LocalShaderDataHost {
    inner: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Option<ShaderDataInfo>>,
    free: Vec<ShaderDataId>,
}

impl ShaderDataHost for LocalShaderDataHost {
    fn create(&self, kind: ShaderDataKind) -> ShaderDataId {
        let mut slots = self.inner.lock();
        let id = match slots.free.pop() {
            Some(id) => id,
            None => {
                slots.entries.push(None);
                ShaderDataId((slots.entries.len() - 1) as u32)
            }
        };
        slots.entries[id.index()] = Some(ShaderDataInfo { id, kind });
        id
    }

    fn destroy(&self, id: ShaderDataId) {
        let mut slots = self.inner.lock();
        if let Some(entry) = slots.entries.get_mut(id.index()) {
            if entry.take().is_some() {
                slots.free.push(id);
            }
        }
    }

    fn enumerate(&self) -> Vec<ShaderDataInfo> {
        self.inner.lock().entries.iter().flatten().copied().collect()
    }
}

/// Allocator of export streams, by message name.
#[derive(Default)]
pub struct ShaderExportHost {
    names: Mutex<Vec<String>>,
}

impl ShaderExportHost {
    /// Stream for messages named `name`, allocated on first request.
    pub fn allocate(&self, name: &str) -> ShaderExportId {
        let mut names = self.names.lock();
        let index = match names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        ShaderExportId(index as u32)
    }

    pub fn count(&self) -> u32 {
        self.names.lock().len() as u32
    }

    pub fn name(&self, id: ShaderExportId) -> Option<String> {
        self.names.lock().get(id.0 as usize).cloned()
    }
}

/// Make every buffer of `host` (and every export stream of `exports`)
/// available to `program`, so that slot assignment agrees across programs.
pub fn bind_all(program: &mut Program, host: &dyn ShaderDataHost, exports: &ShaderExportHost) {
    for info in host.enumerate() {
        if let ShaderDataKind::Buffer { .. } | ShaderDataKind::DescriptorData { .. } = info.kind {
            program.add_shader_data(info.id);
        }
    }
    program.export_streams = program.export_streams.max(exports.count());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_ids_are_reused() {
        let host = LocalShaderDataHost::default();
        let a = host.create(ShaderDataKind::EventData);
        let b = host.create(ShaderDataKind::Buffer {
            elements: 64,
            format: Format::R32UInt,
        });
        assert_ne!(a, b);

        host.destroy(a);
        host.destroy(a);
        assert_eq!(host.enumerate().len(), 1);
        let c = host.create(ShaderDataKind::DescriptorData { dwords: 1 });
        assert_eq!(c, a);
        assert_eq!(
            host.enumerate().iter().map(|info| info.id).collect::<Vec<_>>(),
            [a, b]
        );
    }

    #[test]
    fn export_streams_by_name() {
        let exports = ShaderExportHost::default();
        let bounds = exports.allocate("ResourceIndexOutOfBounds");
        let other = exports.allocate("UninitializedResource");
        assert_eq!(exports.allocate("ResourceIndexOutOfBounds"), bounds);
        assert_eq!(other, ShaderExportId(1));
        assert_eq!(exports.count(), 2);
        assert_eq!(exports.name(other).as_deref(), Some("UninitializedResource"));
    }
}
