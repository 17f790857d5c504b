//! Bounds checks for buffer/texture loads and stores.
//!
//! Every checked access gets its block split right before it, with the
//! coordinates compared against the resource dimensions at the end of the
//! first half. Out of bounds accesses branch to a side block exporting a
//! [`ResourceIndexOutOfBounds`] message, before rejoining the access.

use crate::il::visit::{visit_user_instructions, InstCursor};
use crate::il::{CompareOp, Emitter, InstKind, Program, TypeDef, ValueId};
use crate::message::{ResourceIndexOutOfBounds, ShaderExportMessage};
use crate::shader_data::ShaderExportId;
use smallvec::SmallVec;

/// Check every access to a resource for which `is_resource` holds, exporting
/// failures to `export` (expected to carry [`ResourceIndexOutOfBounds`]).
///
/// Returns the number of accesses checked.
pub fn insert_bounds_checks(
    program: &mut Program,
    export: ShaderExportId,
    is_resource: impl Fn(ValueId) -> bool,
) -> usize {
    let mut checked = 0;
    visit_user_instructions(program, |program, cursor| {
        let inst = cursor.inst(program);
        let (resource, coords): (ValueId, SmallVec<[ValueId; 3]>) = match &inst.kind {
            InstKind::LoadBuffer { buffer, index } | InstKind::StoreBuffer { buffer, index, .. } => {
                (*buffer, [*index].into_iter().collect())
            }
            InstKind::LoadTexture { texture, coords }
            | InstKind::StoreTexture {
                texture, coords, ..
            } => (*texture, coords.clone()),
            _ => return cursor,
        };
        let source = inst.source.map_or(u32::MAX, |s| s.record_index);

        let scalar_coords = coords.iter().all(|&c| {
            program
                .type_of(c)
                .map_or(false, |ty| matches!(program.cx()[ty], TypeDef::Int { .. }))
        });
        if !is_resource(resource) || coords.is_empty() || !scalar_coords {
            return cursor;
        }

        checked += 1;
        check_access(program, cursor, resource, &coords, source, export)
    });

    tracing::debug!(checked, "inserted resource bounds checks");
    checked
}

fn check_access(
    program: &mut Program,
    cursor: InstCursor,
    resource: ValueId,
    coords: &[ValueId],
    source: u32,
    export: ShaderExportId,
) -> InstCursor {
    let func = &mut program.functions[cursor.func];
    let resume = func.split_block(cursor.block, cursor.index);
    let fail = func.blocks.insert_after(cursor.block);
    func.blocks[fail].no_instrumentation = true;

    // NOTE(eddyb) this replaces the branch `split_block` left at the end.
    let mut pre = Emitter::append(program, cursor.func, cursor.block);
    let size = pre.resource_size(resource);
    let size_ty = pre.program().expect_type(size);
    let dims = match pre.program().cx()[size_ty] {
        TypeDef::Vector { dim, .. } => dim as usize,
        _ => 1,
    };

    let mut out_of_bounds = None;
    for (i, &coord) in coords.iter().take(dims).enumerate() {
        let bound = if dims == 1 {
            size
        } else {
            pre.extract(size, i as u32)
        };
        let cmp = pre.compare_unsigned(CompareOp::GreaterThanEqual, coord, bound);
        out_of_bounds = Some(match out_of_bounds {
            Some(acc) => pre.bit_or(acc, cmp),
            None => cmp,
        });
    }
    let out_of_bounds = match out_of_bounds {
        Some(cond) => cond,
        None => pre.program().bool_constant(false),
    };
    pre.branch_conditional(out_of_bounds, fail, resume);

    let mut on_fail = Emitter::append(program, cursor.func, fail);
    let token = on_fail.resource_token(resource);
    let source = on_fail.uint32(source);
    debug_assert_eq!(ResourceIndexOutOfBounds::DWORDS, 3);
    on_fail.export(export.0, [token, coords[0], source]);
    on_fail.branch(resume);

    InstCursor {
        block: resume,
        index: 0,
        ..cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::il::{Format, Function, InstDef, ResourceSamplerMode, Source, TextureDimension};
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn single_access(program: &mut Program, kind: impl FnOnce(&mut Program) -> InstKind) {
        let void = program.find_type_or_add(TypeDef::Void);
        let id = program.alloc_value();
        let mut func = Function::new(id, void);
        let entry = func.blocks.append();
        let kind = kind(program);
        let result = program.alloc_typed(program.uint_type(32));
        func.blocks[entry].insts.push(InstDef {
            source: Some(Source { record_index: 5 }),
            ..InstDef::new(Some(result), kind)
        });
        func.blocks[entry]
            .insts
            .push(InstDef::new(None, InstKind::Return { value: None }));
        program.functions.push(func);
    }

    #[test]
    fn buffer_load_is_guarded() {
        let mut program = Program::new(Rc::new(Context::new()));
        let buffer_ty = program.find_type_or_add(TypeDef::Buffer {
            element: Some(program.uint_type(32)),
            sampler_mode: ResourceSamplerMode::RuntimeOnly,
            texel: Format::R32UInt,
        });
        let buffer = program.alloc_typed(buffer_ty);
        single_access(&mut program, |program| InstKind::LoadBuffer {
            buffer,
            index: program.uint32(9),
        });

        let export = ShaderExportId(2);
        assert_eq!(insert_bounds_checks(&mut program, export, |_| true), 1);

        let blocks = &program.functions[0].blocks;
        let [entry, fail, resume] = blocks.order() else {
            panic!("expected 3 blocks, found {}", blocks.len());
        };
        let entry_insts = &blocks[*entry].insts;
        assert!(matches!(entry_insts[0].kind, InstKind::ResourceSize { resource } if resource == buffer));
        assert!(matches!(
            entry_insts[1].kind,
            InstKind::Compare {
                op: CompareOp::GreaterThanEqual,
                signed: false,
                ..
            }
        ));
        assert_eq!(
            entry_insts[2].kind,
            InstKind::BranchConditional {
                cond: entry_insts[1].result.unwrap(),
                pass: *fail,
                fail: *resume,
            }
        );

        assert!(blocks[*fail].no_instrumentation);
        let fail_insts = &blocks[*fail].insts;
        let token = fail_insts[0].result.unwrap();
        let InstKind::Export { export_id, values } = &fail_insts[1].kind else {
            panic!("expected an export, found {:?}", fail_insts[1].kind);
        };
        assert_eq!(*export_id, 2);
        assert_eq!(values.len(), ResourceIndexOutOfBounds::DWORDS);
        assert_eq!(values[0], token);
        assert_eq!(program.int_constant(values[1]), Some(9));
        assert_eq!(program.int_constant(values[2]), Some(5));
        assert_eq!(fail_insts[2].kind, InstKind::Branch { target: *resume });

        assert!(matches!(blocks[*resume].insts[0].kind, InstKind::LoadBuffer { .. }));
        assert_eq!(blocks[*resume].insts[0].source, Some(Source { record_index: 5 }));
    }

    #[test]
    fn texture_coordinates_are_combined() {
        let mut program = Program::new(Rc::new(Context::new()));
        let texture_ty = program.find_type_or_add(TypeDef::Texture {
            dimension: TextureDimension::Texture2D,
            sampled: Some(program.uint_type(32)),
            multisampled: false,
            sampler_mode: ResourceSamplerMode::Writable,
            format: Format::R32UInt,
        });
        let texture = program.alloc_typed(texture_ty);
        single_access(&mut program, |program| InstKind::LoadTexture {
            texture,
            coords: [program.uint32(1), program.uint32(2)].into_iter().collect(),
        });

        insert_bounds_checks(&mut program, ShaderExportId(0), |_| true);

        let entry = program.functions[0].blocks.order()[0];
        let kinds: Vec<_> = program.functions[0].blocks[entry]
            .insts
            .iter()
            .map(|inst| std::mem::discriminant(&inst.kind))
            .collect();
        let extract = std::mem::discriminant(&InstKind::Extract {
            composite: texture,
            index: 0,
        });
        let compare = std::mem::discriminant(&InstKind::Compare {
            op: CompareOp::Equal,
            lhs: texture,
            rhs: texture,
            signed: false,
        });
        // size, (extract, compare) x2, or, branch
        assert_eq!(kinds.len(), 7);
        assert_eq!(kinds[1], extract);
        assert_eq!(kinds[2], compare);
        assert_eq!(kinds[3], extract);
        assert_eq!(kinds[4], compare);
    }

    #[test]
    fn unknown_resources_are_skipped() {
        let mut program = Program::new(Rc::new(Context::new()));
        let buffer = program.alloc_typed(program.uint_type(32));
        single_access(&mut program, |program| InstKind::LoadBuffer {
            buffer,
            index: program.uint32(0),
        });

        assert_eq!(insert_bounds_checks(&mut program, ShaderExportId(0), |_| false), 0);
        assert_eq!(program.functions[0].blocks.len(), 1);
    }
}
