//! Compile jobs, and the compilers turning them into instrumented artifacts.

use crate::config::Config;
use crate::context::Context;
use crate::dxil::{self, DxilModule};
use crate::features::{FeatureHosts, FeatureRegistry};
use crate::message::FeatureBitSet;
use crate::shader_data;
use crate::state::{Artifact, InstrumentationKey, PipelineState, ShaderState};
use serde::Serialize;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Dxil(#[from] dxil::Error),

    #[error("shader {shader} has no {key} variant")]
    MissingShaderVariant {
        shader: u64,
        key: InstrumentationKey,
    },

    #[error("failed to serialize pipeline: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One shader variant to compile.
#[derive(Clone)]
pub struct ShaderJob {
    pub state: Arc<ShaderState>,
    pub key: InstrumentationKey,
}

/// One pipeline variant to compile, from the variants of its shaders.
#[derive(Clone)]
pub struct PipelineJob {
    pub state: Arc<PipelineState>,
    pub feature_bit_set: FeatureBitSet,

    /// Variant of each of `state.shaders`, in order.
    pub shader_keys: Vec<InstrumentationKey>,
}

impl PipelineJob {
    pub fn key(&self) -> InstrumentationKey {
        self.state.layout.key(self.feature_bit_set)
    }
}

pub trait ShaderCompiler: Send + Sync {
    fn compile_shader(&self, job: &ShaderJob) -> Result<Artifact, CompileError>;
}

pub trait PipelineCompiler: Send + Sync {
    fn compile_pipeline(&self, job: &PipelineJob) -> Result<Artifact, CompileError>;
}

/// Instruments DXIL shaders with every feature their key enables.
pub struct DxilShaderCompiler {
    pub features: Arc<FeatureRegistry>,
    pub hosts: FeatureHosts,

    /// Where to write every instrumented shader, if anywhere.
    pub dump_dir: Option<PathBuf>,
    pub log_instrumentation: bool,
}

impl DxilShaderCompiler {
    pub fn new(features: Arc<FeatureRegistry>, hosts: FeatureHosts, config: &Config) -> Self {
        DxilShaderCompiler {
            features,
            hosts,
            dump_dir: config.debug_dump_dir.clone(),
            log_instrumentation: config.log_instrumentation,
        }
    }

    /// Instrument `byte_code`, returning the instrumented module bytes.
    pub fn instrument(
        &self,
        byte_code: &[u8],
        feature_bit_set: FeatureBitSet,
    ) -> Result<Vec<u8>, CompileError> {
        // NOTE(eddyb) `Context: !Send`, so every job interns into its own.
        let cx = Rc::new(Context::new());
        let mut module =
            crate::timed_pass("DxilModule::parse", || DxilModule::parse(byte_code, cx))?;

        shader_data::bind_all(
            module.program_mut(),
            &*self.hosts.shader_data,
            &self.hosts.exports,
        );
        self.features.instrument(&mut module, feature_bit_set)?;

        Ok(crate::timed_pass("DxilModule::compile", || module.compile())?)
    }

    fn dump(&self, uid: u64, feature_bit_set: FeatureBitSet, bytes: &[u8]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("{uid}-{feature_bit_set:x}.dxil"));
        if let Err(e) = std::fs::write(&path, bytes) {
            tracing::warn!(path = %path.display(), "failed to dump instrumented shader: {e}");
        }
    }
}

impl ShaderCompiler for DxilShaderCompiler {
    fn compile_shader(&self, job: &ShaderJob) -> Result<Artifact, CompileError> {
        let bits = job.key.feature_bit_set;
        if bits == 0 {
            return Ok(job.state.byte_code.clone());
        }

        let bytes = self.instrument(&job.state.byte_code, bits)?;
        self.dump(job.state.uid, bits, &bytes);

        if self.log_instrumentation {
            tracing::info!(
                shader = job.state.uid,
                name = job.state.debug_name.as_deref().unwrap_or(""),
                key = %job.key,
                before = job.state.byte_code.len(),
                after = bytes.len(),
                "instrumented shader"
            );
        }
        Ok(bytes.into())
    }
}

/// Description of an instrumented pipeline: the shader variants it's made of.
///
/// Creating the actual pipeline object is up to the host.
#[derive(Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct PipelineManifest {
    pub pipeline: u64,
    pub key: InstrumentationKey,
    pub shaders: Vec<(u64, InstrumentationKey)>,
}

/// [`PipelineCompiler`] producing a serialized [`PipelineManifest`].
#[derive(Default)]
pub struct ManifestPipelineCompiler;

impl PipelineCompiler for ManifestPipelineCompiler {
    fn compile_pipeline(&self, job: &PipelineJob) -> Result<Artifact, CompileError> {
        let mut shaders = Vec::with_capacity(job.shader_keys.len());
        for (shader, &key) in job.state.shaders.iter().zip(&job.shader_keys) {
            if !shader.has_instrument(&key) {
                return Err(CompileError::MissingShaderVariant {
                    shader: shader.uid,
                    key,
                });
            }
            shaders.push((shader.uid, key));
        }
        let manifest = PipelineManifest {
            pipeline: job.state.uid,
            key: job.key(),
            shaders,
        };
        Ok(serde_json::to_vec(&manifest)?.into())
    }
}
