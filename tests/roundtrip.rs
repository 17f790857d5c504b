mod fixture;

use dxilt::dxil::DxilModule;
use dxilt::il::InstKind;
use dxilt::llvm::{codes, Bitstream, Record};
use dxilt::Context;
use pretty_assertions::assert_eq;
use std::rc::Rc;

fn roundtrip(bytes: &[u8]) -> Vec<u8> {
    DxilModule::parse(bytes, Rc::new(Context::new()))
        .unwrap()
        .compile()
        .unwrap()
}

#[test]
fn empty_shader() {
    let bytes = fixture::empty_shader();
    let module = DxilModule::parse(&bytes, Rc::new(Context::new())).unwrap();
    assert_eq!(module.program().functions.len(), 1);
    assert_eq!(module.program().instruction_count(), 1);
    assert_eq!(roundtrip(&bytes), bytes);
}

#[test]
fn buffer_load_shader() {
    let bytes = fixture::buffer_load_shader();
    let out = roundtrip(&bytes);
    assert_eq!(
        Bitstream::read_from_bytes(&out).unwrap(),
        Bitstream::read_from_bytes(&bytes).unwrap()
    );
    assert_eq!(out, bytes);
}

#[test]
fn two_functions() {
    let bytes = fixture::two_functions();
    let module = DxilModule::parse(&bytes, Rc::new(Context::new())).unwrap();
    let program = module.program();
    assert_eq!(program.functions.len(), 2);

    let adds = |f: usize| {
        program.functions[f]
            .blocks
            .iter()
            .flat_map(|(_, def)| &def.insts)
            .filter(|inst| matches!(inst.kind, InstKind::Binary { .. }))
            .count()
    };
    assert_eq!((adds(0), adds(1)), (1, 3));
    assert_eq!(module.global_name(program.functions[1].id), Some("main"));

    // Each body renumbers its values from the same (module-level) base.
    assert_eq!(roundtrip(&bytes), bytes);
}

#[test]
fn contained_shader() {
    let bytes = fixture::contained(&fixture::buffer_load_shader());
    assert!(dxilt::dxbc::Container::is_container(&bytes));
    assert_eq!(roundtrip(&bytes), bytes);
}

#[test]
fn intrinsics_are_recognized() {
    let bytes = fixture::buffer_load_shader();
    let module = DxilModule::parse(&bytes, Rc::new(Context::new())).unwrap();
    let program = module.program();

    let handles: Vec<_> = module.handles().collect();
    let [(handle, info)] = handles[..] else {
        panic!("expected one handle, found {}", handles.len());
    };
    assert_eq!(info.range_id, 0);
    assert_eq!(program.int_constant(info.index), Some(0));

    let main = &program.functions[0];
    let insts: Vec<_> = main
        .blocks
        .iter()
        .flat_map(|(_, def)| &def.insts)
        .collect();
    assert_eq!(insts.len(), 4);
    assert!(matches!(insts[0].kind, InstKind::Unexposed { .. }));
    match &insts[1].kind {
        &InstKind::LoadBuffer { buffer, index } => {
            assert_eq!(buffer, handle);
            assert_eq!(program.int_constant(index), Some(0));
        }
        kind => panic!("expected a buffer load, found {kind:?}"),
    }
    assert!(matches!(insts[2].kind, InstKind::Extract { index: 0, .. }));
    assert!(matches!(insts[3].kind, InstKind::Return { value: None }));

    assert_eq!(module.global_name(main.id), Some("main"));
}

#[test]
fn garbage_is_rejected() {
    assert!(DxilModule::parse(b"\x00\x01\x02\x03", Rc::new(Context::new())).is_err());
    assert!(DxilModule::parse(&[], Rc::new(Context::new())).is_err());
}

#[test]
fn far_forward_reference_is_rejected() {
    // `ret` of a value a million ids past the (single) instruction.
    let forward = 1u32.wrapping_sub(1_000_000);
    let bytes = fixture::main_with_body([
        Record::new(codes::function::DECLAREBLOCKS, [1]),
        Record::new(codes::function::INST_RET, [forward.into(), 0]),
    ]);
    assert!(DxilModule::parse(&bytes, Rc::new(Context::new())).is_err());
}
