//! Shader and pipeline states, and the registry tracking them (and which
//! pipelines depend on which shaders).

use crate::message::FeatureBitSet;
use crate::{FxIndexMap, FxIndexSet};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one instrumented variant of a shader or pipeline.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstrumentationKey {
    pub feature_bit_set: FeatureBitSet,

    /// Descriptor slots used by the pipeline layout itself.
    pub user_slots: u32,

    /// Offset of the first push constant not owned by the pipeline layout.
    pub user_pc_offset: u32,
}

impl std::fmt::Display for InstrumentationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#x}] with {} user slots",
            self.feature_bit_set, self.user_slots
        )
    }
}

/// Compiled byte code (or pipeline object), shared by everyone using it.
pub type Artifact = Arc<[u8]>;

/// Instrumented variants, by key.
///
/// Entries with no artifact are reservations, made right before compiling.
#[derive(Default)]
pub struct InstrumentMap {
    entries: Mutex<FxHashMap<InstrumentationKey, Option<Artifact>>>,
}

impl InstrumentMap {
    /// Claim `key` for compilation, `false` if reserved (or compiled) already.
    pub fn reserve(&self, key: InstrumentationKey) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, None);
        true
    }

    pub fn has_instrument(&self, key: &InstrumentationKey) -> bool {
        matches!(self.entries.lock().get(key), Some(Some(_)))
    }

    pub fn add_instrument(&self, key: InstrumentationKey, artifact: Artifact) {
        self.entries.lock().insert(key, Some(artifact));
    }

    pub fn get_instrument(&self, key: &InstrumentationKey) -> Option<Artifact> {
        self.entries.lock().get(key).cloned().flatten()
    }

    /// Keys with an artifact, in key order.
    pub fn keys(&self) -> Vec<InstrumentationKey> {
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, artifact)| artifact.is_some())
            .map(|(&key, _)| key)
            .collect();
        keys.sort();
        keys
    }
}

pub struct ShaderState {
    pub uid: u64,
    pub byte_code: Artifact,
    pub debug_name: Option<String>,

    /// Features requested for this shader alone.
    pub feature_bit_set: AtomicU64,

    pub instruments: InstrumentMap,
}

impl ShaderState {
    pub fn features(&self) -> FeatureBitSet {
        self.feature_bit_set.load(Ordering::Acquire)
    }

    pub fn set_features(&self, bits: FeatureBitSet) {
        self.feature_bit_set.store(bits, Ordering::Release);
    }

    pub fn reserve(&self, key: InstrumentationKey) -> bool {
        self.instruments.reserve(key)
    }

    pub fn has_instrument(&self, key: &InstrumentationKey) -> bool {
        self.instruments.has_instrument(key)
    }

    pub fn add_instrument(&self, key: InstrumentationKey, artifact: Artifact) {
        self.instruments.add_instrument(key, artifact);
    }

    pub fn get_instrument(&self, key: &InstrumentationKey) -> Option<Artifact> {
        self.instruments.get_instrument(key)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLayout {
    pub user_slots: u32,
    pub user_pc_offset: u32,
}

impl PipelineLayout {
    pub fn key(&self, feature_bit_set: FeatureBitSet) -> InstrumentationKey {
        InstrumentationKey {
            feature_bit_set,
            user_slots: self.user_slots,
            user_pc_offset: self.user_pc_offset,
        }
    }
}

/// Pipeline variant currently in use, swapped in without ever freeing older
/// variants (which in-flight work may still reference).
#[derive(Default)]
pub struct HotSwap {
    version: AtomicU64,
    artifacts: Mutex<Vec<(InstrumentationKey, Artifact)>>,
}

impl HotSwap {
    /// Make `artifact` current, returning its version.
    pub fn publish(&self, key: InstrumentationKey, artifact: Artifact) -> u64 {
        let mut artifacts = self.artifacts.lock();
        artifacts.push((key, artifact));
        let version = artifacts.len() as u64;
        self.version.store(version, Ordering::Release);
        version
    }

    /// Current version, 0 standing for the original (uninstrumented) object.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn get(&self, version: u64) -> Option<(InstrumentationKey, Artifact)> {
        let index = version.checked_sub(1)?;
        self.artifacts.lock().get(index as usize).cloned()
    }

    pub fn current(&self) -> Option<(InstrumentationKey, Artifact)> {
        self.get(self.version())
    }
}

pub struct PipelineState {
    pub uid: u64,
    pub shaders: Vec<Arc<ShaderState>>,
    pub layout: PipelineLayout,
    pub feature_bit_set: AtomicU64,
    pub instruments: InstrumentMap,
    pub hot_swap: HotSwap,
}

impl PipelineState {
    pub fn features(&self) -> FeatureBitSet {
        self.feature_bit_set.load(Ordering::Acquire)
    }

    pub fn set_features(&self, bits: FeatureBitSet) {
        self.feature_bit_set.store(bits, Ordering::Release);
    }
}

/// Which pipelines use which shaders, indexed both ways.
#[derive(Default)]
struct Dependencies {
    shader_pipelines: FxHashMap<u64, FxIndexSet<u64>>,
    pipeline_shaders: FxHashMap<u64, FxIndexSet<u64>>,
}

impl Dependencies {
    fn add(&mut self, shader: u64, pipeline: u64) {
        self.shader_pipelines
            .entry(shader)
            .or_default()
            .insert(pipeline);
        self.pipeline_shaders
            .entry(pipeline)
            .or_default()
            .insert(shader);
    }

    fn remove_shader(&mut self, shader: u64) {
        for pipeline in self.shader_pipelines.remove(&shader).unwrap_or_default() {
            if let Some(shaders) = self.pipeline_shaders.get_mut(&pipeline) {
                shaders.shift_remove(&shader);
            }
        }
    }

    fn remove_pipeline(&mut self, pipeline: u64) {
        for shader in self.pipeline_shaders.remove(&pipeline).unwrap_or_default() {
            if let Some(pipelines) = self.shader_pipelines.get_mut(&shader) {
                pipelines.shift_remove(&pipeline);
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    next_uid: u64,
    shaders: FxIndexMap<u64, Arc<ShaderState>>,
    pipelines: FxIndexMap<u64, Arc<PipelineState>>,
    dependencies: Dependencies,
}

impl Registry {
    fn alloc_uid(&mut self) -> u64 {
        self.next_uid += 1;
        self.next_uid
    }
}

/// Every live shader and pipeline, by uid.
#[derive(Default)]
pub struct StateRegistry {
    inner: RwLock<Registry>,
}

impl StateRegistry {
    pub fn create_shader(&self, byte_code: &[u8], debug_name: Option<String>) -> Arc<ShaderState> {
        let mut inner = self.inner.write();
        let state = Arc::new(ShaderState {
            uid: inner.alloc_uid(),
            byte_code: byte_code.into(),
            debug_name,
            feature_bit_set: AtomicU64::new(0),
            instruments: InstrumentMap::default(),
        });
        inner.shaders.insert(state.uid, state.clone());
        state
    }

    pub fn create_pipeline(
        &self,
        shaders: &[Arc<ShaderState>],
        layout: PipelineLayout,
    ) -> Arc<PipelineState> {
        let mut inner = self.inner.write();
        let state = Arc::new(PipelineState {
            uid: inner.alloc_uid(),
            shaders: shaders.to_vec(),
            layout,
            feature_bit_set: AtomicU64::new(0),
            instruments: InstrumentMap::default(),
            hot_swap: HotSwap::default(),
        });
        for shader in shaders {
            inner.dependencies.add(shader.uid, state.uid);
        }
        inner.pipelines.insert(state.uid, state.clone());
        state
    }

    /// Forget the shader `uid`, pipelines already using it keep it alive.
    pub fn release_shader(&self, uid: u64) -> Option<Arc<ShaderState>> {
        let mut inner = self.inner.write();
        inner.dependencies.remove_shader(uid);
        inner.shaders.shift_remove(&uid)
    }

    pub fn release_pipeline(&self, uid: u64) -> Option<Arc<PipelineState>> {
        let mut inner = self.inner.write();
        inner.dependencies.remove_pipeline(uid);
        inner.pipelines.shift_remove(&uid)
    }

    pub fn shader(&self, uid: u64) -> Option<Arc<ShaderState>> {
        self.inner.read().shaders.get(&uid).cloned()
    }

    pub fn pipeline(&self, uid: u64) -> Option<Arc<PipelineState>> {
        self.inner.read().pipelines.get(&uid).cloned()
    }

    /// All shaders, in creation order.
    pub fn shaders(&self) -> Vec<Arc<ShaderState>> {
        self.inner.read().shaders.values().cloned().collect()
    }

    /// All pipelines, in creation order.
    pub fn pipelines(&self) -> Vec<Arc<PipelineState>> {
        self.inner.read().pipelines.values().cloned().collect()
    }

    /// Live pipelines using the shader `uid`.
    pub fn dependent_pipelines(&self, uid: u64) -> Vec<Arc<PipelineState>> {
        let inner = self.inner.read();
        let Some(pipelines) = inner.dependencies.shader_pipelines.get(&uid) else {
            return vec![];
        };
        pipelines
            .iter()
            .filter_map(|p| inner.pipelines.get(p).cloned())
            .collect()
    }

    /// Live shaders used by the pipeline `uid`.
    pub fn pipeline_shaders(&self, uid: u64) -> Vec<u64> {
        self.inner
            .read()
            .dependencies
            .pipeline_shaders
            .get(&uid)
            .map(|shaders| shaders.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(bits: FeatureBitSet) -> InstrumentationKey {
        InstrumentationKey {
            feature_bit_set: bits,
            ..Default::default()
        }
    }

    #[test]
    fn reserve_then_fill() {
        let map = InstrumentMap::default();
        assert!(map.reserve(key(1)));
        assert!(!map.reserve(key(1)));
        assert!(!map.has_instrument(&key(1)));
        assert_eq!(map.get_instrument(&key(1)), None);

        map.add_instrument(key(1), Arc::from(&b"dxil"[..]));
        assert!(map.has_instrument(&key(1)));
        assert!(!map.reserve(key(1)));
        assert_eq!(map.keys(), [key(1)]);
    }

    #[test]
    fn concurrent_reservation_has_one_winner() {
        let map = Arc::new(InstrumentMap::default());
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let map = &map;
                    s.spawn(move || map.reserve(key(3)) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn hot_swap_versions() {
        let slot = HotSwap::default();
        assert_eq!(slot.version(), 0);
        assert!(slot.current().is_none());

        let v1 = slot.publish(key(1), Arc::from(&[1u8][..]));
        let v2 = slot.publish(key(2), Arc::from(&[2u8][..]));
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(slot.current().map(|(k, _)| k), Some(key(2)));
        assert_eq!(slot.get(v1).map(|(_, a)| a[0]), Some(1));
    }

    #[test]
    fn release_updates_both_indices() {
        let states = StateRegistry::default();
        let a = states.create_shader(b"a", None);
        let b = states.create_shader(b"b", Some("b.hlsl".into()));
        let p = states.create_pipeline(&[a.clone(), b.clone()], PipelineLayout::default());
        let q = states.create_pipeline(&[a.clone()], PipelineLayout::default());

        let uids = |pipelines: Vec<Arc<PipelineState>>| {
            pipelines.iter().map(|p| p.uid).collect::<Vec<_>>()
        };
        assert_eq!(uids(states.dependent_pipelines(a.uid)), [p.uid, q.uid]);
        assert_eq!(states.pipeline_shaders(p.uid), [a.uid, b.uid]);

        states.release_pipeline(p.uid);
        assert_eq!(uids(states.dependent_pipelines(a.uid)), [q.uid]);
        assert!(states.dependent_pipelines(b.uid).is_empty());

        states.release_shader(a.uid);
        assert!(states.pipeline_shaders(q.uid).is_empty());
        assert!(states.shader(a.uid).is_none());
        // Still alive through the pipeline.
        assert_eq!(q.shaders[0].uid, a.uid);
    }
}
