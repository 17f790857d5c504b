//! `dx.op.*` intrinsics: the subset instrumentation understands (recognized
//! by declaration name and opcode argument), and their signatures for
//! declaring them anew.

use crate::dxil::globals::Globals;
use crate::dxil::types::TypeTable;
use crate::dxil::{Error, ValueTypes};
use crate::il::{AddressSpace, Program, TypeDef, ValueId};
use smallvec::SmallVec;

pub const PREFIX: &str = "dx.op.";

/// Opcodes (first argument) of the intrinsics recognized while parsing.
pub mod opcode {
    pub const CREATE_HANDLE: u32 = 57;
    pub const TEXTURE_LOAD: u32 = 66;
    pub const TEXTURE_STORE: u32 = 67;
    pub const BUFFER_LOAD: u32 = 68;
    pub const BUFFER_STORE: u32 = 69;
    pub const GET_DIMENSIONS: u32 = 72;
    pub const ATOMIC_BINOP: u32 = 78;
}

pub mod type_name {
    pub const HANDLE: &str = "dx.types.Handle";
    pub const DIMENSIONS: &str = "dx.types.Dimensions";
    pub const RES_RET_I32: &str = "dx.types.ResRet.i32";
    pub const RES_RET_F32: &str = "dx.types.ResRet.f32";
}

/// Component type of the overloaded resource access intrinsics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Overload {
    I32,
    F32,
}

impl Overload {
    fn suffix(self) -> &'static str {
        match self {
            Overload::I32 => "i32",
            Overload::F32 => "f32",
        }
    }

    /// Overload to use for (components of) the IL type `ty`.
    pub fn for_component(program: &Program, ty: crate::context::Type) -> Self {
        match program.cx()[crate::il::types::component_type(program.cx(), ty)] {
            TypeDef::Fp { .. } => Overload::F32,
            _ => Overload::I32,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    CreateHandle,
    BufferLoad(Overload),
    BufferStore(Overload),
    TextureLoad(Overload),
    TextureStore(Overload),
    GetDimensions,
    AtomicBinOp,
}

/// A declared intrinsic, ready to be called.
#[derive(Copy, Clone, Debug)]
pub struct Declared {
    pub callee: ValueId,
    pub callee_type_index: u32,
    pub fn_type_index: u32,

    /// `None` for `void` returns.
    pub ret_type_index: Option<u32>,
}

impl Intrinsic {
    pub fn opcode(self) -> u32 {
        match self {
            Intrinsic::CreateHandle => opcode::CREATE_HANDLE,
            Intrinsic::BufferLoad(_) => opcode::BUFFER_LOAD,
            Intrinsic::BufferStore(_) => opcode::BUFFER_STORE,
            Intrinsic::TextureLoad(_) => opcode::TEXTURE_LOAD,
            Intrinsic::TextureStore(_) => opcode::TEXTURE_STORE,
            Intrinsic::GetDimensions => opcode::GET_DIMENSIONS,
            Intrinsic::AtomicBinOp => opcode::ATOMIC_BINOP,
        }
    }

    pub fn name(self) -> String {
        let (base, overload) = match self {
            Intrinsic::CreateHandle => ("createHandle", None),
            Intrinsic::BufferLoad(o) => ("bufferLoad", Some(o)),
            Intrinsic::BufferStore(o) => ("bufferStore", Some(o)),
            Intrinsic::TextureLoad(o) => ("textureLoad", Some(o)),
            Intrinsic::TextureStore(o) => ("textureStore", Some(o)),
            Intrinsic::GetDimensions => ("getDimensions", None),
            Intrinsic::AtomicBinOp => ("atomicBinOp", Some(Overload::I32)),
        };
        match overload {
            Some(o) => format!("{PREFIX}{base}.{}", o.suffix()),
            None => format!("{PREFIX}{base}"),
        }
    }

    /// Return and parameter types (as table indices).
    fn signature(
        self,
        program: &Program,
        types: &mut TypeTable,
    ) -> Result<(u32, SmallVec<[u32; 12]>), Error> {
        let cx = program.cx().clone();
        let i32_ = types.index_of(&cx, program.uint_type(32))?;
        let i8_ = types.index_of(&cx, program.uint_type(8))?;
        let i1 = types.index_of(&cx, program.bool_type())?;
        let void = types.index_of(&cx, program.find_type_or_add(TypeDef::Void))?;
        let handle = handle_type_index(program, types)?;

        let overload = |types: &mut TypeTable, o: Overload| -> Result<(u32, u32), Error> {
            let (component, name) = match o {
                Overload::I32 => (program.uint_type(32), type_name::RES_RET_I32),
                Overload::F32 => (
                    program.find_type_or_add(TypeDef::Fp { bit_width: 32 }),
                    type_name::RES_RET_F32,
                ),
            };
            let u32_ty = program.uint_type(32);
            let res_ret = types.index_of_named(
                &cx,
                name,
                &[component, component, component, component, u32_ty],
            )?;
            Ok((types.index_of(&cx, component)?, res_ret))
        };

        Ok(match self {
            Intrinsic::CreateHandle => (handle, [i32_, i8_, i32_, i32_, i1].into_iter().collect()),
            Intrinsic::BufferLoad(o) => {
                let (_, res_ret) = overload(types, o)?;
                (res_ret, [i32_, handle, i32_, i32_].into_iter().collect())
            }
            Intrinsic::BufferStore(o) => {
                let (t, _) = overload(types, o)?;
                (
                    void,
                    [i32_, handle, i32_, i32_, t, t, t, t, i8_]
                        .into_iter()
                        .collect(),
                )
            }
            Intrinsic::TextureLoad(o) => {
                let (_, res_ret) = overload(types, o)?;
                (
                    res_ret,
                    [i32_, handle, i32_, i32_, i32_, i32_, i32_, i32_, i32_]
                        .into_iter()
                        .collect(),
                )
            }
            Intrinsic::TextureStore(o) => {
                let (t, _) = overload(types, o)?;
                (
                    void,
                    [i32_, handle, i32_, i32_, i32_, t, t, t, t, i8_]
                        .into_iter()
                        .collect(),
                )
            }
            Intrinsic::GetDimensions => {
                let u32_ty = program.uint_type(32);
                let dims = types.index_of_named(
                    &cx,
                    type_name::DIMENSIONS,
                    &[u32_ty, u32_ty, u32_ty, u32_ty],
                )?;
                (dims, [i32_, handle, i32_].into_iter().collect())
            }
            Intrinsic::AtomicBinOp => (
                i32_,
                [i32_, handle, i32_, i32_, i32_, i32_, i32_]
                    .into_iter()
                    .collect(),
            ),
        })
    }

    /// Find or add the declaration of this intrinsic.
    pub fn declare(
        self,
        program: &mut Program,
        types: &mut TypeTable,
        globals: &mut Globals,
        value_types: &mut ValueTypes,
    ) -> Result<Declared, Error> {
        let (ret, params) = self.signature(program, types)?;
        let name = self.name();
        let fn_type_index = match globals.function_named(&name) {
            Some(decl) => decl.type_index,
            None => types.function_index(program.cx(), ret, &params)?,
        };
        let callee = globals.declare(program, types, value_types, &name, fn_type_index)?;
        let callee_type_index =
            types.pointer_index(program.cx(), fn_type_index, AddressSpace::Function)?;

        let is_void = matches!(program.cx()[types.get(ret.into())?], TypeDef::Void);
        Ok(Declared {
            callee,
            callee_type_index,
            fn_type_index,
            ret_type_index: (!is_void).then_some(ret),
        })
    }
}

/// Table index of `%dx.types.Handle = type { i8* }`.
pub fn handle_type_index(program: &Program, types: &mut TypeTable) -> Result<u32, Error> {
    let cx = program.cx().clone();
    let i8_ptr = program.find_type_or_add(TypeDef::Pointer {
        pointee: program.uint_type(8),
        address_space: AddressSpace::Function,
    });
    types.index_of_named(&cx, type_name::HANDLE, &[i8_ptr])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_overloads() {
        assert_eq!(Intrinsic::CreateHandle.name(), "dx.op.createHandle");
        assert_eq!(
            Intrinsic::BufferStore(Overload::F32).name(),
            "dx.op.bufferStore.f32"
        );
        assert_eq!(Intrinsic::AtomicBinOp.name(), "dx.op.atomicBinOp.i32");
        assert_eq!(Intrinsic::GetDimensions.opcode(), opcode::GET_DIMENSIONS);
    }
}
