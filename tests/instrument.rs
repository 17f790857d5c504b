mod fixture;

use dxilt::compiler::{DxilShaderCompiler, ShaderCompiler, ShaderJob};
use dxilt::config::Config;
use dxilt::dxil::metadata::ResourceClass;
use dxilt::dxil::DxilModule;
use dxilt::features::{FeatureHosts, FeatureRegistry};
use dxilt::il::InstKind;
use dxilt::state::{InstrumentationKey, StateRegistry};
use dxilt::Context;
use pretty_assertions::assert_eq;
use std::rc::Rc;
use std::sync::Arc;

fn compiler(config: &Config) -> (DxilShaderCompiler, u64) {
    let hosts = FeatureHosts::default();
    let features = FeatureRegistry::with_builtin(&hosts);
    let bit = features.bit("resource-bounds").unwrap();
    (
        DxilShaderCompiler::new(Arc::new(features), hosts, config),
        bit,
    )
}

fn reparse(bytes: &[u8]) -> DxilModule {
    DxilModule::parse(bytes, Rc::new(Context::new())).unwrap()
}

#[test]
fn resource_bounds() {
    let (compiler, bit) = compiler(&Config::default());
    let original = fixture::buffer_load_shader();
    let out = compiler.instrument(&original, bit).unwrap();
    assert_ne!(out, original);

    let module = reparse(&out);
    let main = &module.program().functions[0];

    // The access got split off, behind a check with a failure block.
    assert_eq!(main.blocks.len(), 3);
    let loads = main
        .blocks
        .iter()
        .flat_map(|(_, def)| &def.insts)
        .filter(|inst| matches!(inst.kind, InstKind::LoadBuffer { .. }))
        .count();
    assert_eq!(loads, 1);

    // Besides the source one, there are handles to the export UAVs.
    let mut ranges: Vec<_> = module
        .handles()
        .map(|(_, info)| (info.class, info.range_id))
        .collect();
    ranges.sort();
    ranges.dedup();
    assert_eq!(ranges, [(ResourceClass::Uav, 0), (ResourceClass::Uav, 1)]);

    // Instrumented output is itself instrumentable (and stable).
    assert_eq!(
        reparse(&out).compile().unwrap(),
        out,
        "instrumented module doesn't roundtrip"
    );
}

#[test]
fn resourceless_shader_keeps_its_body() {
    let (compiler, bit) = compiler(&Config::default());
    let out = compiler.instrument(&fixture::empty_shader(), bit).unwrap();

    // Export resources are bound regardless, but nothing uses them.
    let module = reparse(&out);
    assert_eq!(module.program().functions[0].blocks.len(), 1);
    assert_eq!(module.program().instruction_count(), 1);
    assert_eq!(module.handles().count(), 0);
}

#[test]
fn contained_shader_stays_contained() {
    let (compiler, bit) = compiler(&Config::default());
    let original = fixture::contained(&fixture::buffer_load_shader());
    let out = compiler.instrument(&original, bit).unwrap();
    assert!(dxilt::dxbc::Container::is_container(&out));
    assert_eq!(reparse(&out).program().functions[0].blocks.len(), 3);
}

#[test]
fn debug_dump() {
    let dir = std::env::temp_dir().join(format!("dxilt-dump-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = Config {
        debug_dump_dir: Some(dir.clone()),
        ..Config::default()
    };
    let (compiler, bit) = compiler(&config);

    let states = StateRegistry::default();
    let shader = states.create_shader(&fixture::buffer_load_shader(), Some("main".into()));
    let job = ShaderJob {
        state: shader.clone(),
        key: InstrumentationKey {
            feature_bit_set: bit,
            ..Default::default()
        },
    };
    let artifact = compiler.compile_shader(&job).unwrap();

    let dumped = std::fs::read(dir.join(format!("{}-{bit:x}.dxil", shader.uid))).unwrap();
    assert_eq!(&dumped[..], &artifact[..]);
    std::fs::remove_dir_all(&dir).unwrap();
}
