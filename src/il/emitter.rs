//! Builder-style instruction insertion, with result type inference.

use crate::context::Type;
use crate::il::types::{component_type, splat};
use crate::il::{
    AtomicOp, BasicBlock, BinaryOp, CompareOp, InstDef, InstKind, Program, TextureDimension,
    TypeDef, ValueId,
};
use smallvec::SmallVec;

/// Inserts instructions into one block of one function of a [`Program`].
///
/// An emitter either appends (keeping any existing terminator last) or
/// inserts at a fixed position, advancing past every inserted instruction.
pub struct Emitter<'a> {
    program: &'a mut Program,
    func: usize,
    block: BasicBlock,
    position: Option<usize>,
}

impl<'a> Emitter<'a> {
    /// Emit at the end of `block` (but before its terminator, if any).
    pub fn append(program: &'a mut Program, func: usize, block: BasicBlock) -> Self {
        Emitter {
            program,
            func,
            block,
            position: None,
        }
    }

    /// Emit before the instruction currently at `index` in `block`.
    pub fn at(program: &'a mut Program, func: usize, block: BasicBlock, index: usize) -> Self {
        Emitter {
            program,
            func,
            block,
            position: Some(index),
        }
    }

    pub fn program(&mut self) -> &mut Program {
        self.program
    }

    pub fn block(&self) -> BasicBlock {
        self.block
    }

    fn insts(&mut self) -> &mut Vec<InstDef> {
        &mut self.program.functions[self.func].blocks[self.block].insts
    }

    fn insert(&mut self, result_ty: Option<Type>, kind: InstKind) -> Option<ValueId> {
        let result = result_ty.map(|ty| self.program.alloc_typed(ty));
        let inst = InstDef::new(result, kind);
        let is_terminator = inst.is_terminator();

        let position = self.position;
        let insts = self.insts();
        match position {
            Some(i) => {
                insts.insert(i, inst);
                self.position = Some(i + 1);
            }
            None => {
                let has_terminator = insts.last().map_or(false, InstDef::is_terminator);
                if has_terminator {
                    let last = insts.len() - 1;
                    if is_terminator {
                        insts[last] = inst;
                    } else {
                        insts.insert(last, inst);
                    }
                } else {
                    insts.push(inst);
                }
            }
        }
        result
    }

    #[track_caller]
    fn emit(&mut self, result_ty: Type, kind: InstKind) -> ValueId {
        match self.insert(Some(result_ty), kind) {
            Some(value) => value,
            None => unreachable!(),
        }
    }

    fn type_of(&self, value: ValueId) -> Type {
        self.program.expect_type(value)
    }

    pub fn uint32(&mut self, value: u32) -> ValueId {
        self.program.uint32(value)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.type_of(lhs);
        self.emit(ty, InstKind::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn bit_or(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::BitOr, lhs, rhs)
    }

    pub fn bit_and(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::BitAnd, lhs, rhs)
    }

    pub fn shift_left(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.binary(BinaryOp::ShiftLeft, lhs, rhs)
    }

    fn compare_with(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId, signed: bool) -> ValueId {
        let cx = self.program.cx().clone();
        let bool_ty = self.program.bool_type();
        let ty = splat(&cx, self.type_of(lhs), bool_ty);
        self.emit(
            ty,
            InstKind::Compare {
                op,
                lhs,
                rhs,
                signed,
            },
        )
    }

    /// Compare, with signedness following the type of `lhs`.
    pub fn compare(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let signed = crate::il::types::is_signed(self.program.cx(), self.type_of(lhs));
        self.compare_with(op, lhs, rhs, signed)
    }

    pub fn compare_unsigned(&mut self, op: CompareOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.compare_with(op, lhs, rhs, false)
    }

    pub fn select(&mut self, cond: ValueId, pass: ValueId, fail: ValueId) -> ValueId {
        let ty = self.type_of(pass);
        self.emit(ty, InstKind::Select { cond, pass, fail })
    }

    pub fn extract(&mut self, composite: ValueId, index: u32) -> ValueId {
        let ty = component_type(self.program.cx(), self.type_of(composite));
        self.emit(ty, InstKind::Extract { composite, index })
    }

    pub fn load_buffer(&mut self, buffer: ValueId, index: ValueId) -> ValueId {
        let ty = match self.program.cx()[self.type_of(buffer)] {
            TypeDef::Buffer {
                element: Some(element),
                ..
            } => element,
            _ => self.program.uint_type(32),
        };
        self.emit(ty, InstKind::LoadBuffer { buffer, index })
    }

    pub fn store_buffer(&mut self, buffer: ValueId, index: ValueId, value: ValueId) {
        let mask = match self.program.cx()[self.type_of(value)] {
            TypeDef::Vector { dim, .. } => (1u8 << dim.min(4)) - 1,
            _ => 1,
        };
        self.insert(
            None,
            InstKind::StoreBuffer {
                buffer,
                index,
                value,
                mask,
            },
        );
    }

    /// Size of `resource`, one component per dimension (as `u32`s).
    pub fn resource_size(&mut self, resource: ValueId) -> ValueId {
        let u32_ty = self.program.uint_type(32);
        let dim = match self.program.cx()[self.type_of(resource)] {
            TypeDef::Texture { dimension, .. } => match dimension {
                TextureDimension::Texture1D | TextureDimension::Unexposed => 1,
                TextureDimension::Texture2D
                | TextureDimension::Texture1DArray
                | TextureDimension::Texture2DCube => 2,
                TextureDimension::Texture3D
                | TextureDimension::Texture2DArray
                | TextureDimension::Texture2DCubeArray => 3,
            },
            _ => 1,
        };
        let ty = if dim == 1 {
            u32_ty
        } else {
            self.program.find_type_or_add(TypeDef::Vector {
                contained: u32_ty,
                dim,
            })
        };
        self.emit(ty, InstKind::ResourceSize { resource })
    }

    pub fn resource_token(&mut self, resource: ValueId) -> ValueId {
        let ty = self.program.uint_type(32);
        self.emit(ty, InstKind::ResourceToken { resource })
    }

    pub fn atomic(&mut self, op: AtomicOp, buffer: ValueId, index: ValueId, value: ValueId) -> ValueId {
        let ty = self.type_of(value);
        self.emit(
            ty,
            InstKind::Atomic {
                op,
                buffer,
                index,
                value,
            },
        )
    }

    pub fn atomic_or(&mut self, buffer: ValueId, index: ValueId, value: ValueId) -> ValueId {
        self.atomic(AtomicOp::Or, buffer, index, value)
    }

    pub fn export(&mut self, export_id: u32, values: impl IntoIterator<Item = ValueId>) {
        let values: SmallVec<[ValueId; 4]> = values.into_iter().collect();
        self.insert(None, InstKind::Export { export_id, values });
    }

    pub fn branch(&mut self, target: BasicBlock) {
        self.insert(None, InstKind::Branch { target });
    }

    pub fn branch_conditional(&mut self, cond: ValueId, pass: BasicBlock, fail: BasicBlock) {
        self.insert(None, InstKind::BranchConditional { cond, pass, fail });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::il::{Function, ResourceSamplerMode};
    use std::rc::Rc;

    fn program_with_entry() -> (Program, BasicBlock) {
        let mut program = Program::new(Rc::new(Context::new()));
        let void = program.find_type_or_add(TypeDef::Void);
        let id = program.alloc_value();
        let mut func = Function::new(id, void);
        let entry = func.blocks.append();
        func.blocks[entry]
            .insts
            .push(InstDef::new(None, InstKind::Return { value: None }));
        program.functions.push(func);
        (program, entry)
    }

    #[test]
    fn append_keeps_terminator_last() {
        let (mut program, entry) = program_with_entry();
        let mut emitter = Emitter::append(&mut program, 0, entry);
        let a = emitter.uint32(2);
        let b = emitter.uint32(3);
        let sum = emitter.add(a, b);
        let cmp = emitter.compare(CompareOp::LessThan, sum, b);

        let insts = &program.functions[0].blocks[entry].insts;
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].result, Some(sum));
        assert_eq!(insts[1].result, Some(cmp));
        assert!(insts[2].is_terminator());
        assert_eq!(program.type_of(cmp), Some(program.bool_type()));
        assert!(matches!(
            insts[1].kind,
            InstKind::Compare { signed: false, .. }
        ));
    }

    #[test]
    fn terminator_replaces_terminator() {
        let (mut program, entry) = program_with_entry();
        let other = program.functions[0].blocks.append();
        Emitter::append(&mut program, 0, entry).branch(other);

        let insts = &program.functions[0].blocks[entry].insts;
        assert_eq!(insts.len(), 1);
        assert_eq!(insts[0].kind, InstKind::Branch { target: other });
    }

    #[test]
    fn positional_insertion_advances() {
        let (mut program, entry) = program_with_entry();
        let buffer_ty = program.find_type_or_add(TypeDef::Buffer {
            element: None,
            sampler_mode: ResourceSamplerMode::Writable,
            texel: crate::il::Format::R32UInt,
        });
        let buffer = program.alloc_typed(buffer_ty);

        let mut emitter = Emitter::at(&mut program, 0, entry, 0);
        let size = emitter.resource_size(buffer);
        let token = emitter.resource_token(buffer);

        let insts = &program.functions[0].blocks[entry].insts;
        assert_eq!(insts[0].result, Some(size));
        assert_eq!(insts[1].result, Some(token));
        assert_eq!(program.type_of(size), Some(program.uint_type(32)));
    }
}
