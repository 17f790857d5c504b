use dxilt::compiler::{
    CompileError, ManifestPipelineCompiler, PipelineManifest, ShaderCompiler, ShaderJob,
};
use dxilt::config::Config;
use dxilt::controller::InstrumentationController;
use dxilt::dxil;
use dxilt::message::{Message, MessageStream};
use dxilt::state::{Artifact, PipelineLayout, PipelineState, StateRegistry};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Feature bit the mock compiler refuses.
const BROKEN: u64 = 0x8;

/// Shader compiler tagging byte code with the key, counting compiles, and
/// blocking while `gate` is held.
#[derive(Default)]
struct MockShaderCompiler {
    compiles: AtomicUsize,
    gate: Mutex<()>,
}

impl ShaderCompiler for MockShaderCompiler {
    fn compile_shader(&self, job: &ShaderJob) -> Result<Artifact, CompileError> {
        drop(self.gate.lock());
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if job.key.feature_bit_set & BROKEN != 0 {
            return Err(dxil::Error::Unlowerable("broken feature").into());
        }
        Ok(format!("{}+{:x}", job.state.uid, job.key.feature_bit_set)
            .into_bytes()
            .into())
    }
}

struct Harness {
    controller: InstrumentationController,
    shaders: Arc<MockShaderCompiler>,
}

impl Harness {
    fn new(config: Config) -> Self {
        let shaders = Arc::new(MockShaderCompiler::default());
        let controller = InstrumentationController::new(
            Config {
                workers: 2,
                ..config
            },
            Arc::new(StateRegistry::default()),
            shaders.clone(),
            Arc::new(ManifestPipelineCompiler),
        )
        .unwrap();
        Harness {
            controller,
            shaders,
        }
    }

    fn states(&self) -> &StateRegistry {
        self.controller.states()
    }

    fn send(&self, messages: impl IntoIterator<Item = Message>) {
        self.controller.handle(&[MessageStream {
            messages: messages.into_iter().collect(),
        }]);
        self.controller.wait_idle();
    }

    fn compiles(&self) -> usize {
        self.shaders.compiles.load(Ordering::SeqCst)
    }
}

fn current_manifest(pipeline: &PipelineState) -> Option<PipelineManifest> {
    let (_, artifact) = pipeline.hot_swap.current()?;
    Some(serde_json::from_slice(&artifact).unwrap())
}

#[test]
fn shared_shader_gets_a_variant_per_pipeline() {
    let h = Harness::new(Config::default());
    let shader = h.states().create_shader(b"vs", None);
    let layout = PipelineLayout::default();
    let a = h.states().create_pipeline(&[shader.clone()], layout);
    let b = h.states().create_pipeline(&[shader.clone()], layout);

    h.send([
        Message::SetPipelineInstrumentation {
            pipeline_uid: a.uid,
            feature_bit_set: 0x1,
        },
        Message::SetPipelineInstrumentation {
            pipeline_uid: b.uid,
            feature_bit_set: 0x2,
        },
    ]);

    assert_eq!(h.compiles(), 2);
    assert_eq!(shader.instruments.keys(), [layout.key(0x1), layout.key(0x2)]);
    assert_eq!(
        &shader.get_instrument(&layout.key(0x2)).unwrap()[..],
        format!("{}+2", shader.uid).as_bytes()
    );

    for (pipeline, bits) in [(&a, 0x1), (&b, 0x2)] {
        assert_eq!(pipeline.hot_swap.version(), 1);
        assert_eq!(
            current_manifest(pipeline),
            Some(PipelineManifest {
                pipeline: pipeline.uid,
                key: layout.key(bits),
                shaders: vec![(shader.uid, layout.key(bits))],
            })
        );
    }
    assert_eq!(h.controller.committed_features(), 0x3);
    assert_eq!(h.controller.job_count(), 0);
}

#[test]
fn global_features_reuse_variants() {
    let h = Harness::new(Config::default());
    let shader = h.states().create_shader(b"cs", Some("main".into()));
    let layout = PipelineLayout {
        user_slots: 3,
        user_pc_offset: 8,
    };
    let pipeline = h.states().create_pipeline(&[shader.clone()], layout);

    h.send([Message::SetGlobalInstrumentation {
        feature_bit_set: 0x4,
    }]);
    assert_eq!(h.compiles(), 1);
    assert_eq!(pipeline.hot_swap.version(), 1);

    h.send([Message::SetGlobalInstrumentation { feature_bit_set: 0 }]);
    assert_eq!(h.compiles(), 2);
    assert_eq!(pipeline.hot_swap.current().unwrap().0, layout.key(0));
    assert_eq!(h.controller.committed_features(), 0);

    // Back to a known variant: republished, nothing compiled.
    h.send([Message::SetGlobalInstrumentation {
        feature_bit_set: 0x4,
    }]);
    assert_eq!(h.compiles(), 2);
    assert_eq!(pipeline.hot_swap.version(), 3);
    assert_eq!(pipeline.hot_swap.current().unwrap().0, layout.key(0x4));
    assert_eq!(pipeline.hot_swap.get(1), pipeline.hot_swap.current());
}

#[test]
fn shader_features_reach_dependent_pipelines() {
    let h = Harness::new(Config::default());
    let vs = h.states().create_shader(b"vs", None);
    let ps = h.states().create_shader(b"ps", None);
    let layout = PipelineLayout::default();
    let pipeline = h.states().create_pipeline(&[vs.clone(), ps.clone()], layout);

    h.send([Message::SetShaderInstrumentation {
        shader_uid: ps.uid,
        feature_bit_set: 0x10,
    }]);

    // Only the instrumented shader was dirty, but both keys must exist.
    assert_eq!(ps.instruments.keys(), [layout.key(0x10)]);
    assert!(vs.instruments.keys().is_empty());
    assert_eq!(pipeline.hot_swap.version(), 0);

    h.send([Message::SetPipelineInstrumentation {
        pipeline_uid: pipeline.uid,
        feature_bit_set: 0,
    }]);
    assert_eq!(vs.instruments.keys(), [layout.key(0)]);
    assert_eq!(
        current_manifest(&pipeline).unwrap().shaders,
        [(vs.uid, layout.key(0)), (ps.uid, layout.key(0x10))]
    );
}

#[test]
fn features_accumulate() {
    let h = Harness::new(Config::default());
    let shader = h.states().create_shader(b"vs", None);
    let layout = PipelineLayout::default();
    let pipeline = h.states().create_pipeline(&[shader.clone()], layout);

    h.send([
        Message::SetGlobalInstrumentation {
            feature_bit_set: 0x1,
        },
        Message::SetShaderInstrumentation {
            shader_uid: shader.uid,
            feature_bit_set: 0x2,
        },
        Message::SetPipelineInstrumentation {
            pipeline_uid: pipeline.uid,
            feature_bit_set: 0x4,
        },
    ]);

    assert_eq!(shader.instruments.keys(), [layout.key(0x7)]);
    assert_eq!(current_manifest(&pipeline).unwrap().key, layout.key(0x5));
}

#[test]
fn failed_shaders_reject_pipelines() {
    let h = Harness::new(Config {
        log_rejected_keys: true,
        ..Config::default()
    });
    let shader = h.states().create_shader(b"vs", None);
    let pipeline = h
        .states()
        .create_pipeline(&[shader.clone()], PipelineLayout::default());

    let broken = [Message::SetPipelineInstrumentation {
        pipeline_uid: pipeline.uid,
        feature_bit_set: BROKEN | 0x1,
    }];
    h.send(broken.clone());
    assert_eq!(h.compiles(), 1);
    assert_eq!(pipeline.hot_swap.version(), 0);
    assert!(pipeline.instruments.keys().is_empty());

    // The failure is remembered, not retried.
    h.send(broken);
    assert_eq!(h.compiles(), 1);
    assert_eq!(pipeline.hot_swap.version(), 0);
}

#[test]
fn unknown_objects_are_ignored() {
    let h = Harness::new(Config::default());
    h.send([
        Message::SetShaderInstrumentation {
            shader_uid: 42,
            feature_bit_set: 0x1,
        },
        Message::SetPipelineInstrumentation {
            pipeline_uid: 43,
            feature_bit_set: 0x1,
        },
    ]);
    assert_eq!(h.compiles(), 0);
    assert_eq!(h.controller.job_count(), 0);
}

#[test]
fn job_diagnostics() {
    let h = Harness::new(Config::default());
    let shader = h.states().create_shader(b"vs", None);
    let pipeline = h
        .states()
        .create_pipeline(&[shader], PipelineLayout::default());

    let gate = h.shaders.gate.lock();
    h.controller.handle(&[MessageStream {
        messages: vec![Message::SetPipelineInstrumentation {
            pipeline_uid: pipeline.uid,
            feature_bit_set: 0x1,
        }],
    }]);
    h.controller.commit();
    let output = h.controller.take_output();
    let [Message::JobDiagnostic { remaining }] = output.messages[..] else {
        panic!("expected a single job diagnostic, found {:?}", output.messages);
    };
    assert!(remaining > 0);

    drop(gate);
    h.controller.wait_idle();
    h.controller.commit();
    h.controller.commit();
    assert_eq!(
        h.controller.take_output().messages,
        [Message::JobDiagnostic { remaining: 0 }]
    );
}

#[test]
fn synchronous_recording() {
    let h = Harness::new(Config {
        synchronous_recording_default: true,
        ..Config::default()
    });
    assert!(h.controller.synchronous_recording());

    let shader = h.states().create_shader(b"vs", None);
    let pipeline = h
        .states()
        .create_pipeline(&[shader], PipelineLayout::default());
    h.controller.handle(&[MessageStream {
        messages: vec![Message::SetPipelineInstrumentation {
            pipeline_uid: pipeline.uid,
            feature_bit_set: 0x1,
        }],
    }]);
    h.controller.begin_command_list();
    assert_eq!(pipeline.hot_swap.version(), 1);

    h.send([Message::SetInstrumentationConfig {
        synchronous_recording: false,
    }]);
    assert!(!h.controller.synchronous_recording());
}
