//! Instrumentation features, each owning one bit of a [`FeatureBitSet`].

use crate::dxil::{self, DxilModule};
use crate::message::{FeatureBitSet, ResourceIndexOutOfBounds, ShaderExportMessage};
use crate::passes::resource_bounds;
use crate::shader_data::{ShaderDataHost, ShaderExportHost, ShaderExportId};
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Hosts features allocate their shader data and export streams from.
#[derive(Clone)]
pub struct FeatureHosts {
    pub shader_data: Arc<dyn ShaderDataHost>,
    pub exports: Arc<ShaderExportHost>,
}

impl Default for FeatureHosts {
    fn default() -> Self {
        FeatureHosts {
            shader_data: Arc::new(crate::shader_data::LocalShaderDataHost::default()),
            exports: Arc::default(),
        }
    }
}

pub trait Feature: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Allocate everything needed from `hosts`, `false` if unavailable.
    fn install(&mut self, hosts: &FeatureHosts) -> bool;

    /// Inject instrumentation into (a copy of) a module.
    fn instrument(&self, module: &mut DxilModule) -> Result<(), dxil::Error>;
}

/// Installed features, in bit order.
#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<Box<dyn Feature>>,
}

impl FeatureRegistry {
    /// Registry with every built-in feature installed.
    pub fn with_builtin(hosts: &FeatureHosts) -> Self {
        let mut registry = FeatureRegistry::default();
        registry.register(ResourceBounds::default(), hosts);
        registry
    }

    /// Install `feature`, returning its bit (`None` if it failed to install).
    pub fn register(
        &mut self,
        mut feature: impl Feature + 'static,
        hosts: &FeatureHosts,
    ) -> Option<FeatureBitSet> {
        if self.features.len() >= FeatureBitSet::BITS as usize {
            tracing::warn!(feature = feature.name(), "out of feature bits");
            return None;
        }
        if !feature.install(hosts) {
            tracing::warn!(feature = feature.name(), "feature failed to install");
            return None;
        }
        let bit = 1 << self.features.len();
        tracing::debug!(feature = feature.name(), bit, "installed feature");
        self.features.push(Box::new(feature));
        Some(bit)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn all(&self) -> FeatureBitSet {
        match self.features.len() {
            0 => 0,
            n => FeatureBitSet::MAX >> (FeatureBitSet::BITS as usize - n),
        }
    }

    pub fn bit(&self, name: &str) -> Option<FeatureBitSet> {
        let i = self.features.iter().position(|f| f.name() == name)?;
        Some(1 << i)
    }

    /// Features enabled in `bits`, in bit order.
    pub fn enabled(&self, bits: FeatureBitSet) -> impl Iterator<Item = &dyn Feature> {
        self.features
            .iter()
            .enumerate()
            .filter(move |&(i, _)| bits & (1 << i) != 0)
            .map(|(_, f)| &**f)
    }

    /// Run every feature enabled in `bits` over `module`.
    pub fn instrument(&self, module: &mut DxilModule, bits: FeatureBitSet) -> Result<(), dxil::Error> {
        for feature in self.enabled(bits) {
            crate::timed_pass(feature.name(), || feature.instrument(module))?;
        }
        Ok(())
    }
}

/// Out of bounds buffer/texture access detection.
#[derive(Default)]
pub struct ResourceBounds {
    export: Option<ShaderExportId>,
}

impl Feature for ResourceBounds {
    fn name(&self) -> &'static str {
        "resource-bounds"
    }

    fn description(&self) -> &'static str {
        "Validation of buffer and texture coordinates against resource dimensions"
    }

    fn install(&mut self, hosts: &FeatureHosts) -> bool {
        self.export = Some(hosts.exports.allocate(ResourceIndexOutOfBounds::NAME));
        true
    }

    fn instrument(&self, module: &mut DxilModule) -> Result<(), dxil::Error> {
        let export = self
            .export
            .ok_or(dxil::Error::Unlowerable("resource bounds checks before install"))?;
        let handles: FxHashSet<_> = module.handles().map(|(value, _)| value).collect();
        resource_bounds::insert_bounds_checks(module.program_mut(), export, |value| {
            handles.contains(&value)
        });
        Ok(())
    }
}
