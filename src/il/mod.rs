//! IL program model: typed values, instructions, basic blocks and functions.
//!
//! Everything refers to values by [`ValueId`] (never by pointer), so that
//! instrumentation can freely split blocks and insert instructions, while
//! the DXIL layer keeps a mapping between source value numbering and IL ids.

use crate::context::{Const, Context, Type};
use crate::shader_data::ShaderDataId;
use crate::FxIndexMap;
use rustc_hash::FxHashMap;
use std::rc::Rc;

pub mod constants;
pub mod emitter;
pub mod func;
pub mod inst;
pub mod types;
pub mod visit;

pub use constants::{ConstDef, ConstKind, FpBits};
pub use emitter::Emitter;
pub use func::{BasicBlock, BasicBlockDef, BasicBlockList, Function};
pub use inst::{AtomicOp, BinaryOp, CompareOp, InstDef, InstKind, Source};
pub use types::{AddressSpace, Format, ResourceSamplerMode, TextureDimension, TypeDef};

/// Program-wide unique value identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display(fmt = "%{}", _0)]
pub struct ValueId(u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A whole IL program, i.e. one shader module.
///
/// Cloning (see [`Program::copy`]) shares the [`Context`], so the copy can
/// intern new types/constants without affecting the original, while both
/// keep agreeing on everything interned so far.
#[derive(Clone)]
pub struct Program {
    cx: Rc<Context>,

    next_value: u32,
    value_types: FxHashMap<ValueId, Type>,

    /// Values bound to constants (both program-wide and function-local).
    value_consts: FxHashMap<ValueId, Const>,

    /// Program-wide constant values, reused by [`Program::find_constant_or_add`].
    const_values: FxIndexMap<Const, ValueId>,

    pub functions: Vec<Function>,

    /// Shader-data buffers bound to this program, and the IL value standing
    /// for each of them.
    pub shader_data: FxIndexMap<ShaderDataId, ValueId>,

    /// Export streams the host allocated (all of them get a slot, whether
    /// this program exports to them or not).
    pub export_streams: u32,
}

impl Program {
    pub fn new(cx: Rc<Context>) -> Self {
        Program {
            cx,
            next_value: 0,
            value_types: FxHashMap::default(),
            value_consts: FxHashMap::default(),
            const_values: FxIndexMap::default(),
            functions: vec![],
            shader_data: FxIndexMap::default(),
            export_streams: 0,
        }
    }

    pub fn cx(&self) -> &Rc<Context> {
        &self.cx
    }

    /// Independent copy of this program, for compiling one variant of it.
    pub fn copy(&self) -> Program {
        self.clone()
    }

    /// One past the largest allocated [`ValueId`].
    pub fn bound(&self) -> u32 {
        self.next_value
    }

    pub fn alloc_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value = self
            .next_value
            .checked_add(1)
            .unwrap_or_else(|| unreachable!("IL value ids overflowed u32"));
        id
    }

    pub fn alloc_typed(&mut self, ty: Type) -> ValueId {
        let id = self.alloc_value();
        self.value_types.insert(id, ty);
        id
    }

    pub fn set_type(&mut self, value: ValueId, ty: Type) {
        self.value_types.insert(value, ty);
    }

    pub fn type_of(&self, value: ValueId) -> Option<Type> {
        self.value_types.get(&value).copied()
    }

    /// Like [`Program::type_of`], for values that must have been typed.
    #[track_caller]
    pub fn expect_type(&self, value: ValueId) -> Type {
        match self.type_of(value) {
            Some(ty) => ty,
            None => panic!("IL value {value} has no type"),
        }
    }

    pub fn find_type_or_add(&self, def: TypeDef) -> Type {
        self.cx.intern(def)
    }

    pub fn uint_type(&self, bit_width: u8) -> Type {
        self.cx.intern(TypeDef::Int {
            bit_width,
            signed: false,
        })
    }

    pub fn bool_type(&self) -> Type {
        self.cx.intern(TypeDef::Bool)
    }

    /// Bind an existing value to a constant, `program_wide` constants are
    /// then reused by [`Program::find_constant_or_add`].
    pub fn bind_constant(&mut self, value: ValueId, def: ConstDef, program_wide: bool) -> Const {
        let c = self.cx.intern(def);
        self.value_types.insert(value, def.ty);
        self.value_consts.insert(value, c);
        if program_wide {
            self.const_values.entry(c).or_insert(value);
        }
        c
    }

    /// Value of an existing program-wide constant, or a fresh value bound to it.
    pub fn find_constant_or_add(&mut self, ty: Type, kind: ConstKind) -> ValueId {
        let def = ConstDef { ty, kind };
        let c = self.cx.intern(def);
        if let Some(&value) = self.const_values.get(&c) {
            return value;
        }
        let value = self.alloc_value();
        self.bind_constant(value, def, true);
        value
    }

    pub fn uint32(&mut self, value: u32) -> ValueId {
        let ty = self.uint_type(32);
        self.find_constant_or_add(ty, ConstKind::Int(value.into()))
    }

    pub fn bool_constant(&mut self, value: bool) -> ValueId {
        let ty = self.bool_type();
        self.find_constant_or_add(ty, ConstKind::Bool(value))
    }

    pub fn undef(&mut self, ty: Type) -> ValueId {
        self.find_constant_or_add(ty, ConstKind::Undef)
    }

    pub fn constant(&self, value: ValueId) -> Option<&ConstDef> {
        self.value_consts.get(&value).map(|&c| &self.cx[c])
    }

    pub fn int_constant(&self, value: ValueId) -> Option<i64> {
        self.constant(value)?.kind.as_int()
    }

    pub fn is_constant(&self, value: ValueId) -> bool {
        self.value_consts.contains_key(&value)
    }

    /// Program-wide constants, in the order they were first added.
    pub fn program_constants(&self) -> impl Iterator<Item = (Const, ValueId)> + '_ {
        self.const_values.iter().map(|(&c, &v)| (c, v))
    }

    pub fn function(&self, id: ValueId) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    pub fn function_mut(&mut self, id: ValueId) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.id == id)
    }

    /// Declare a value standing for the shader-data buffer `id`.
    pub fn add_shader_data(&mut self, id: ShaderDataId) -> ValueId {
        if let Some(&value) = self.shader_data.get(&id) {
            return value;
        }
        let ty = self.find_type_or_add(TypeDef::Buffer {
            element: Some(self.uint_type(32)),
            sampler_mode: ResourceSamplerMode::Writable,
            texel: Format::R32UInt,
        });
        let value = self.alloc_typed(ty);
        self.shader_data.insert(id, value);
        value
    }

    /// Total instruction count, over all functions.
    pub fn instruction_count(&self) -> usize {
        self.functions
            .iter()
            .flat_map(|f| f.blocks.iter())
            .map(|(_, def)| def.insts.len())
            .sum()
    }
}
