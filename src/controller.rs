//! Instrumentation controller: turns instrumentation requests into batches
//! of compile jobs, run in the background as three chained stages
//! (shaders, then pipelines, then committing the feature set).

use crate::compiler::{PipelineCompiler, PipelineJob, ShaderCompiler, ShaderJob};
use crate::config::Config;
use crate::message::{FeatureBitSet, Message, MessageStream};
use crate::state::{InstrumentationKey, PipelineState, ShaderState, StateRegistry};
use crate::FxIndexMap;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Head/counter pair: `head` counts committed batches, `counter` completed
/// ones, and waiting for a head value waits for that batch (and all before).
#[derive(Default)]
pub struct CompilationEvent {
    state: Mutex<(u64, u64)>,
    completed: Condvar,
}

impl CompilationEvent {
    pub fn increment_head(&self) -> u64 {
        let mut state = self.state.lock();
        state.0 += 1;
        state.0
    }

    pub fn increment_counter(&self) {
        let mut state = self.state.lock();
        state.1 += 1;
        self.completed.notify_all();
    }

    pub fn head(&self) -> u64 {
        self.state.lock().0
    }

    pub fn counter(&self) -> u64 {
        self.state.lock().1
    }

    pub fn wait(&self, head: u64) {
        let mut state = self.state.lock();
        while state.1 < head {
            self.completed.wait(&mut state);
        }
    }
}

/// Objects made dirty by messages since the last commit.
#[derive(Default)]
struct DirtySet {
    shaders: FxIndexMap<u64, Arc<ShaderState>>,
    pipelines: FxIndexMap<u64, Arc<PipelineState>>,
}

impl DirtySet {
    fn is_empty(&self) -> bool {
        self.shaders.is_empty() && self.pipelines.is_empty()
    }

    fn add_shader(&mut self, state: &Arc<ShaderState>) {
        self.shaders.entry(state.uid).or_insert_with(|| state.clone());
    }

    fn add_pipeline(&mut self, state: &Arc<PipelineState>) {
        self.pipelines
            .entry(state.uid)
            .or_insert_with(|| state.clone());
    }
}

struct Batch {
    dirty: DirtySet,

    /// Global features at commit time.
    global: FeatureBitSet,

    /// Every feature in use by anything, at commit time.
    feature_bit_set: FeatureBitSet,

    stamp_begin: Instant,
    stamp_shaders: Option<Instant>,
    stamp_pipelines: Option<Instant>,
}

/// State the background stages need.
struct Shared {
    config: Config,
    states: Arc<StateRegistry>,
    shader_compiler: Arc<dyn ShaderCompiler>,
    pipeline_compiler: Arc<dyn PipelineCompiler>,

    event: CompilationEvent,

    /// Outstanding batches and compile jobs.
    jobs: AtomicU32,

    /// Feature set of the last completed batch.
    committed_features: AtomicU64,
}

/// Message-thread state.
#[derive(Default)]
struct Immediate {
    global: FeatureBitSet,
    batch: DirtySet,
    output: MessageStream,
    last_job_count: u32,
}

pub struct InstrumentationController {
    shared: Arc<Shared>,
    pool: rayon::ThreadPool,
    immediate: Mutex<Immediate>,
    synchronous_recording: AtomicBool,
}

impl InstrumentationController {
    pub fn new(
        config: Config,
        states: Arc<StateRegistry>,
        shader_compiler: Arc<dyn ShaderCompiler>,
        pipeline_compiler: Arc<dyn PipelineCompiler>,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .thread_name(|i| format!("dxilt-compile-{i}"))
            .build()?;
        Ok(InstrumentationController {
            synchronous_recording: AtomicBool::new(config.synchronous_recording_default),
            shared: Arc::new(Shared {
                config,
                states,
                shader_compiler,
                pipeline_compiler,
                event: CompilationEvent::default(),
                jobs: AtomicU32::new(0),
                committed_features: AtomicU64::new(0),
            }),
            pool,
            immediate: Mutex::default(),
        })
    }

    pub fn states(&self) -> &Arc<StateRegistry> {
        &self.shared.states
    }

    /// Apply every message, then commit a batch if anything became dirty.
    pub fn handle(&self, streams: &[MessageStream]) {
        let mut immediate = self.immediate.lock();
        for message in streams.iter().flat_map(|s| &s.messages) {
            self.on_message(&mut immediate, message);
        }
        if !immediate.batch.is_empty() {
            self.commit_instrumentation(&mut immediate);
        }
    }

    fn on_message(&self, immediate: &mut Immediate, message: &Message) {
        let states = &self.shared.states;
        match *message {
            Message::SetInstrumentationConfig {
                synchronous_recording,
            } => {
                self.synchronous_recording
                    .store(synchronous_recording, Ordering::Release);
            }
            Message::SetGlobalInstrumentation { feature_bit_set } => {
                immediate.global = feature_bit_set;
                for state in states.shaders() {
                    immediate.batch.add_shader(&state);
                }
                for state in states.pipelines() {
                    immediate.batch.add_pipeline(&state);
                }
            }
            Message::SetShaderInstrumentation {
                shader_uid,
                feature_bit_set,
            } => {
                let Some(state) = states.shader(shader_uid) else {
                    tracing::warn!(
                        shader = shader_uid,
                        "instrumentation requested for unknown shader"
                    );
                    return;
                };
                state.set_features(feature_bit_set);
                immediate.batch.add_shader(&state);
                for dependent in states.dependent_pipelines(shader_uid) {
                    immediate.batch.add_pipeline(&dependent);
                }
            }
            Message::SetPipelineInstrumentation {
                pipeline_uid,
                feature_bit_set,
            } => {
                let Some(state) = states.pipeline(pipeline_uid) else {
                    tracing::warn!(
                        pipeline = pipeline_uid,
                        "instrumentation requested for unknown pipeline"
                    );
                    return;
                };
                state.set_features(feature_bit_set);
                immediate.batch.add_pipeline(&state);
                for shader in &state.shaders {
                    immediate.batch.add_shader(shader);
                }
            }
            Message::JobDiagnostic { .. } => {}
        }
    }

    /// Every feature in use, recomputed from scratch.
    fn summarize_feature_bit_set(&self, global: FeatureBitSet) -> FeatureBitSet {
        let states = &self.shared.states;
        let shaders = states.shaders().iter().fold(0, |acc, s| acc | s.features());
        let pipelines = states.pipelines().iter().fold(0, |acc, p| acc | p.features());
        global | shaders | pipelines
    }

    fn commit_instrumentation(&self, immediate: &mut Immediate) {
        let head = self.shared.event.increment_head();
        let dirty = std::mem::take(&mut immediate.batch);
        tracing::debug!(
            head,
            shaders = dirty.shaders.len(),
            pipelines = dirty.pipelines.len(),
            "committing instrumentation batch"
        );

        let batch = Batch {
            dirty,
            global: immediate.global,
            feature_bit_set: self.summarize_feature_bit_set(immediate.global),
            stamp_begin: Instant::now(),
            stamp_shaders: None,
            stamp_pipelines: None,
        };

        self.shared.jobs.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        self.pool.spawn(move || {
            let mut batch = batch;
            shared.commit_shaders(&mut batch);
            shared.commit_pipelines(&mut batch);
            shared.commit_table(batch);
        });
    }

    /// Outstanding batches and compile jobs.
    pub fn job_count(&self) -> u32 {
        self.shared.jobs.load(Ordering::Acquire)
    }

    /// Report the outstanding job count, if it changed since last time.
    pub fn commit(&self) {
        let count = self.job_count();
        let mut immediate = self.immediate.lock();
        if immediate.last_job_count == count {
            return;
        }
        immediate
            .output
            .push(Message::JobDiagnostic { remaining: count });
        immediate.last_job_count = count;
    }

    /// Take every message produced since the last call.
    pub fn take_output(&self) -> MessageStream {
        std::mem::take(&mut self.immediate.lock().output)
    }

    /// Features of the last completed batch.
    pub fn committed_features(&self) -> FeatureBitSet {
        self.shared.committed_features.load(Ordering::Acquire)
    }

    pub fn synchronous_recording(&self) -> bool {
        self.synchronous_recording.load(Ordering::Acquire)
    }

    /// Called before recording commands, waits for every committed batch
    /// when recording synchronously.
    pub fn begin_command_list(&self) {
        if self.synchronous_recording() {
            self.wait_idle();
        }
    }

    /// Wait for every batch committed so far.
    pub fn wait_idle(&self) {
        let event = &self.shared.event;
        event.wait(event.head());
    }
}

impl Shared {
    fn commit_shaders(&self, batch: &mut Batch) {
        batch.stamp_shaders = Some(Instant::now());
        tracing::debug!(
            elapsed_ms = batch.stamp_begin.elapsed().as_secs_f64() * 1000.0,
            "compiling shaders"
        );

        let mut jobs = vec![];
        for state in batch.dirty.shaders.values() {
            let shader_bits = batch.global | state.features();

            // One variant per dependent pipeline, as each may ask for more.
            for pipeline in self.states.dependent_pipelines(state.uid) {
                let key = pipeline.layout.key(shader_bits | pipeline.features());
                if !state.reserve(key) {
                    continue;
                }
                jobs.push(ShaderJob {
                    state: state.clone(),
                    key,
                });
            }
        }

        self.jobs.fetch_add(jobs.len() as u32, Ordering::AcqRel);
        jobs.par_iter().for_each(|job| {
            match self.shader_compiler.compile_shader(job) {
                Ok(artifact) => job.state.add_instrument(job.key, artifact),
                Err(e) => tracing::error!(
                    shader = job.state.uid,
                    key = %job.key,
                    "shader instrumentation failed: {e}"
                ),
            }
            self.jobs.fetch_sub(1, Ordering::AcqRel);
        });
    }

    fn commit_pipelines(&self, batch: &mut Batch) {
        batch.stamp_pipelines = Some(Instant::now());
        tracing::debug!(
            elapsed_ms = batch.stamp_begin.elapsed().as_secs_f64() * 1000.0,
            "compiling pipelines"
        );

        let mut rejected_keys: Vec<(u64, InstrumentationKey)> = vec![];
        let mut jobs = vec![];
        for state in batch.dirty.pipelines.values() {
            let feature_bit_set = batch.global | state.features();
            let shader_keys: Vec<_> = state
                .shaders
                .iter()
                .map(|shader| state.layout.key(feature_bit_set | shader.features()))
                .collect();

            // Shaders may have failed to compile (or not be ready yet), in
            // which case a later batch has to revisit this pipeline.
            let mut ready = true;
            for (shader, key) in state.shaders.iter().zip(&shader_keys) {
                if !shader.has_instrument(key) {
                    rejected_keys.push((shader.uid, *key));
                    ready = false;
                }
            }
            if !ready {
                continue;
            }

            let job = PipelineJob {
                state: state.clone(),
                feature_bit_set,
                shader_keys,
            };
            let key = job.key();
            if let Some(artifact) = state.instruments.get_instrument(&key) {
                if state.hot_swap.current().map(|(k, _)| k) != Some(key) {
                    state.hot_swap.publish(key, artifact);
                }
                continue;
            }
            if !state.instruments.reserve(key) {
                continue;
            }
            jobs.push(job);
        }

        self.jobs.fetch_add(jobs.len() as u32, Ordering::AcqRel);
        jobs.par_iter().for_each(|job| {
            let key = job.key();
            match self.pipeline_compiler.compile_pipeline(job) {
                Ok(artifact) => {
                    job.state.instruments.add_instrument(key, artifact.clone());
                    job.state.hot_swap.publish(key, artifact);
                }
                Err(e) => tracing::error!(
                    pipeline = job.state.uid,
                    key = %key,
                    "pipeline instrumentation failed: {e}"
                ),
            }
            self.jobs.fetch_sub(1, Ordering::AcqRel);
        });

        if !rejected_keys.is_empty() && self.config.log_rejected_keys {
            let mut summary = String::new();
            for (shader, key) in &rejected_keys {
                summary += &format!("\n\tshader {shader} {key}");
            }
            tracing::warn!("instrumentation failed for the following shaders and keys:{summary}");
        }
    }

    fn commit_table(&self, batch: Batch) {
        let now = Instant::now();
        let ms = |from: Instant, to: Instant| to.duration_since(from).as_secs_f64() * 1000.0;
        let stamp_shaders = batch.stamp_shaders.unwrap_or(batch.stamp_begin);
        let stamp_pipelines = batch.stamp_pipelines.unwrap_or(stamp_shaders);

        self.committed_features
            .store(batch.feature_bit_set, Ordering::Release);

        if self.config.log_instrumentation {
            tracing::info!(
                shaders = batch.dirty.shaders.len(),
                shaders_ms = ms(stamp_shaders, stamp_pipelines),
                pipelines = batch.dirty.pipelines.len(),
                pipelines_ms = ms(stamp_pipelines, now),
                total_ms = ms(batch.stamp_begin, now),
                "instrumented batch"
            );
        }

        self.jobs.fetch_sub(1, Ordering::AcqRel);
        self.event.increment_counter();
    }
}
