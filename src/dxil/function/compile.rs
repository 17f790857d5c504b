//! Encoding IL functions back into instruction records.
//!
//! Instructions still attached to their source record re-emit that record
//! (only its value/block references get relocated later, by stitching),
//! everything else is synthesized from its [`InstKind`], with the resource
//! intrinsics going through `dx.op.*` calls, on handles created (once per
//! function) in the entry block.

use super::operands::{InstRecord, Operand};
use super::FunctionBlock;
use crate::context::Type;
use crate::dxil::globals::Globals;
use crate::dxil::intrinsics::{Intrinsic, Overload};
use crate::dxil::metadata::{ExportBinding, ResourceClass};
use crate::dxil::types::TypeTable;
use crate::dxil::{Components, Error, HandleInfo, ValueTypes};
use crate::il::types::{component_count, component_type, is_signed};
use crate::il::{
    AtomicOp, BasicBlock, BinaryOp, CompareOp, ConstKind, InstDef, InstKind, Program, TypeDef,
    ValueId,
};
use crate::llvm::codes;
use crate::shader_data::ShaderDataId;
use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// What a handle created by instrumentation is for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Per-stream message counters.
    ExportCounter,
    ExportStream(u32),
    ShaderData(ShaderDataId),
}

/// Assignment of [`HandleKind`]s to slots of the synthetic export range:
/// the counter, then every export stream, then every shader-data buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandleLayout {
    export_count: u32,
    shader_data: Vec<ShaderDataId>,
}

impl HandleLayout {
    pub fn new(program: &Program) -> Self {
        let used = program
            .functions
            .iter()
            .flat_map(|f| f.blocks.iter())
            .flat_map(|(_, def)| &def.insts)
            .filter_map(|inst| match inst.kind {
                InstKind::Export { export_id, .. } => Some(export_id + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        HandleLayout {
            export_count: used.max(program.export_streams),
            shader_data: program.shader_data.keys().copied().collect(),
        }
    }

    /// Whether nothing needs binding, i.e. no export resources are needed.
    pub fn is_empty(&self) -> bool {
        self.export_count == 0 && self.shader_data.is_empty()
    }

    pub fn count(&self) -> u32 {
        1 + self.export_count + self.shader_data.len() as u32
    }

    pub fn slot(&self, kind: HandleKind) -> Option<u32> {
        match kind {
            HandleKind::ExportCounter => Some(0),
            HandleKind::ExportStream(id) => (id < self.export_count).then_some(1 + id),
            HandleKind::ShaderData(id) => {
                let i = self.shader_data.iter().position(|&d| d == id)?;
                Some(1 + self.export_count + i as u32)
            }
        }
    }
}

/// One output instruction record.
#[derive(Clone, Debug)]
pub struct CompiledInst {
    /// Source record ordinal, for re-emitted instructions.
    pub source: Option<u32>,
    pub record: InstRecord,
}

/// A compiled function body, ready for stitching.
#[derive(Clone, Debug, Default)]
pub struct Compiled {
    /// Records of each basic block, in layout order.
    pub blocks: Vec<(BasicBlock, Vec<CompiledInst>)>,

    /// Values with no record of their own, standing for another value.
    pub aliases: Vec<(ValueId, ValueId)>,

    unmodified: bool,
}

impl Compiled {
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|(_, records)| records.len()).sum()
    }

    /// Whether this is exactly the source function, record for record.
    pub fn is_unmodified(&self) -> bool {
        self.unmodified
    }
}

pub struct FunctionCompiler<'a> {
    pub program: &'a mut Program,
    pub types: &'a mut TypeTable,
    pub globals: &'a mut Globals,
    pub value_types: &'a mut ValueTypes,

    /// `createHandle` results of the source module.
    pub module_handles: &'a FxHashMap<ValueId, HandleInfo>,
    pub module_svox: &'a FxHashMap<ValueId, Components>,

    pub layout: &'a HandleLayout,

    /// The synthetic export range, if [`HandleLayout::is_empty`] is false.
    pub binding: Option<ExportBinding>,
}

impl FunctionCompiler<'_> {
    pub fn compile(&mut self, f: &FunctionBlock) -> Result<Compiled, Error> {
        // NOTE(eddyb) cloned so that lowering can keep mutating the program.
        let blocks: Vec<(BasicBlock, Vec<InstDef>)> = self.program.functions[f.func]
            .blocks
            .iter()
            .map(|(bb, def)| (bb, def.insts.clone()))
            .collect();

        let mut lowering = Lowering {
            compiler: self,
            source: f,
            handles: FxHashMap::default(),
            hoisted: vec![],
            svox: FxHashMap::default(),
            aliases: vec![],
            out: vec![],
        };

        let mut compiled = Compiled::default();
        let mut sourced = 0;
        for (bb, insts) in blocks {
            for inst in &insts {
                if inst.source.is_some() {
                    sourced += 1;
                }
                lowering.lower(inst)?;
            }
            compiled.blocks.push((bb, std::mem::take(&mut lowering.out)));
        }

        let hoisted = std::mem::take(&mut lowering.hoisted);
        compiled.unmodified = hoisted.is_empty()
            && sourced == f.source_inst_count()
            && compiled
                .blocks
                .iter()
                .flat_map(|(_, records)| records)
                .all(|inst| inst.source.is_some());
        if let Some((_, entry)) = compiled.blocks.first_mut() {
            entry.splice(0..0, hoisted);
        }
        compiled.aliases = lowering.aliases;
        Ok(compiled)
    }
}

/// Lowering state for one function.
struct Lowering<'c, 'a> {
    compiler: &'c mut FunctionCompiler<'a>,
    source: &'c FunctionBlock,

    /// Handles created so far, all placed at the start of the entry block.
    handles: FxHashMap<HandleKind, ValueId>,
    hoisted: Vec<CompiledInst>,

    /// Scalar components of vectors lowered component-wise.
    svox: FxHashMap<ValueId, Components>,
    aliases: Vec<(ValueId, ValueId)>,

    /// Records of the block being lowered.
    out: Vec<CompiledInst>,
}

fn binop_code(op: BinaryOp, float: bool, signed: bool) -> u64 {
    use codes::binop::*;

    let signed = float || signed;
    match op {
        BinaryOp::Add => ADD,
        BinaryOp::Sub => SUB,
        BinaryOp::Mul => MUL,
        BinaryOp::Div if signed => SDIV,
        BinaryOp::Div => UDIV,
        BinaryOp::Rem if signed => SREM,
        BinaryOp::Rem => UREM,
        BinaryOp::BitAnd => AND,
        BinaryOp::BitOr => OR,
        BinaryOp::BitXor => XOR,
        BinaryOp::ShiftLeft => SHL,
        BinaryOp::ShiftRight if signed => ASHR,
        BinaryOp::ShiftRight => LSHR,
    }
}

fn predicate(op: CompareOp, float: bool, signed: bool) -> u64 {
    use codes::predicate::*;
    use CompareOp::*;

    match (op, float, signed) {
        (Equal, true, _) => FCMP_OEQ,
        (NotEqual, true, _) => FCMP_UNE,
        (GreaterThan, true, _) => FCMP_OGT,
        (GreaterThanEqual, true, _) => FCMP_OGE,
        (LessThan, true, _) => FCMP_OLT,
        (LessThanEqual, true, _) => FCMP_OLE,
        (Equal, false, _) => ICMP_EQ,
        (NotEqual, false, _) => ICMP_NE,
        (GreaterThan, false, false) => ICMP_UGT,
        (GreaterThanEqual, false, false) => ICMP_UGE,
        (LessThan, false, false) => ICMP_ULT,
        (LessThanEqual, false, false) => ICMP_ULE,
        (GreaterThan, false, true) => ICMP_SGT,
        (GreaterThanEqual, false, true) => ICMP_SGE,
        (LessThan, false, true) => ICMP_SLT,
        (LessThanEqual, false, true) => ICMP_SLE,
    }
}

fn atomic_code(op: AtomicOp) -> u32 {
    use codes::atomic_binop::*;

    (match op {
        AtomicOp::Add => ADD,
        AtomicOp::And => AND,
        AtomicOp::Or => OR,
        AtomicOp::Xor => XOR,
        AtomicOp::Exchange => EXCHANGE,
    }) as u32
}

/// Alignment operand (`log2(bytes) + 1`) for loads/stores of `ty`.
fn align_operand(program: &Program, ty: Type) -> u64 {
    let cx = program.cx();
    let bytes: u32 = match cx[component_type(cx, ty)] {
        TypeDef::Int { bit_width, .. } | TypeDef::Fp { bit_width } => {
            (u32::from(bit_width) / 8).max(1)
        }
        TypeDef::Bool => 1,
        _ => 4,
    };
    u64::from(bytes.trailing_zeros()) + 1
}

/// `i`-th element of `values`, with single values broadcast.
fn broadcast(values: &[ValueId], i: usize) -> ValueId {
    values[i.min(values.len() - 1)]
}

impl Lowering<'_, '_> {
    fn program(&mut self) -> &mut Program {
        self.compiler.program
    }

    fn push(&mut self, record: InstRecord) {
        self.out.push(CompiledInst {
            source: None,
            record,
        });
    }

    fn ty(&self, value: ValueId) -> Result<Type, Error> {
        self.compiler
            .program
            .type_of(value)
            .ok_or(Error::UnresolvedValue(value))
    }

    /// Type table index of `value`, compiling its type if needed.
    fn type_index(&mut self, value: ValueId) -> Result<u32, Error> {
        if let Some(&index) = self.compiler.value_types.get(&value) {
            return Ok(index);
        }
        let ty = self.ty(value)?;
        let index = self.compiler.types.index_of(self.compiler.program.cx(), ty)?;
        self.compiler.value_types.insert(value, index);
        Ok(index)
    }

    fn typed(&mut self, value: ValueId) -> Result<Operand, Error> {
        Ok(Operand::RelTyped(value, Some(self.type_index(value)?.into())))
    }

    /// Fresh value of type `ty`, with its table index recorded.
    fn fresh(&mut self, ty: Type) -> Result<ValueId, Error> {
        let value = self.program().alloc_typed(ty);
        self.type_index(value)?;
        Ok(value)
    }

    fn is_float(&self, value: ValueId) -> Result<bool, Error> {
        let ty = self.ty(value)?;
        let cx = self.compiler.program.cx();
        Ok(matches!(cx[component_type(cx, ty)], TypeDef::Fp { .. }))
    }

    fn i8_constant(&mut self, value: u8) -> ValueId {
        let ty = self.program().uint_type(8);
        self.program()
            .find_constant_or_add(ty, ConstKind::Int(value.into()))
    }

    fn undef_i32(&mut self) -> ValueId {
        let ty = self.program().uint_type(32);
        self.program().undef(ty)
    }

    fn lower(&mut self, inst: &InstDef) -> Result<(), Error> {
        if let Some(source) = inst.source {
            return self.reemit(source.record_index);
        }

        let result = || inst.result.ok_or(Error::Unlowerable("instruction without a result"));
        match &inst.kind {
            InstKind::Unexposed { .. } => return Err(Error::Unlowerable("unexposed instruction")),
            &InstKind::Binary { op, lhs, rhs } => {
                let float = self.is_float(lhs)?;
                let signed = is_signed(self.compiler.program.cx(), self.ty(lhs)?);
                let code = binop_code(op, float, signed);
                self.componentwise(result()?, &[lhs, rhs], |this, args, r| {
                    let lhs = this.typed(args[0])?;
                    this.push(InstRecord::new(
                        codes::function::INST_BINOP,
                        [lhs, Operand::Rel(args[1]), Operand::Lit(code)],
                        Some(r),
                    ));
                    Ok(())
                })?;
            }
            &InstKind::Compare {
                op,
                lhs,
                rhs,
                signed,
            } => {
                let code = predicate(op, self.is_float(lhs)?, signed);
                self.componentwise(result()?, &[lhs, rhs], |this, args, r| {
                    let lhs = this.typed(args[0])?;
                    this.push(InstRecord::new(
                        codes::function::INST_CMP2,
                        [lhs, Operand::Rel(args[1]), Operand::Lit(code)],
                        Some(r),
                    ));
                    Ok(())
                })?;
            }
            &InstKind::Select { cond, pass, fail } => {
                self.componentwise(result()?, &[pass, fail, cond], |this, args, r| {
                    let pass = this.typed(args[0])?;
                    let cond = this.typed(args[2])?;
                    this.push(InstRecord::new(
                        codes::function::INST_VSELECT,
                        [pass, Operand::Rel(args[1]), cond],
                        Some(r),
                    ));
                    Ok(())
                })?;
            }
            &InstKind::Extract { composite, index } => {
                let r = result()?;
                if let Some(components) = self.known_components(composite) {
                    let target = *components
                        .get(index as usize)
                        .ok_or(Error::Unlowerable("extract out of range"))?;
                    self.aliases.push((r, target));
                    return Ok(());
                }
                self.type_index(r)?;
                let is_struct = matches!(
                    self.compiler.program.cx()[self.ty(composite)?],
                    TypeDef::Struct { .. }
                );
                let composite = self.typed(composite)?;
                let record = if is_struct {
                    InstRecord::new(
                        codes::function::INST_EXTRACTVAL,
                        [composite, Operand::Lit(index.into())],
                        Some(r),
                    )
                } else {
                    let index = self.program().uint32(index);
                    let index = self.typed(index)?;
                    InstRecord::new(
                        codes::function::INST_EXTRACTELT,
                        [composite, index],
                        Some(r),
                    )
                };
                self.push(record);
            }
            &InstKind::Load { address } => {
                let r = result()?;
                let ty = self.type_index(r)?;
                let align = align_operand(self.compiler.program, self.ty(r)?);
                let address = self.typed(address)?;
                self.push(InstRecord::new(
                    codes::function::INST_LOAD,
                    [
                        address,
                        Operand::Lit(ty.into()),
                        Operand::Lit(align),
                        Operand::Lit(0),
                    ],
                    Some(r),
                ));
            }
            &InstKind::Store { address, value } => {
                let align = align_operand(self.compiler.program, self.ty(value)?);
                let address = self.typed(address)?;
                let value = self.typed(value)?;
                self.push(InstRecord::new(
                    codes::function::INST_STORE,
                    [address, value, Operand::Lit(align), Operand::Lit(0)],
                    None,
                ));
            }
            &InstKind::Branch { target } => {
                self.push(InstRecord::new(
                    codes::function::INST_BR,
                    [Operand::Block(target)],
                    None,
                ));
            }
            &InstKind::BranchConditional { cond, pass, fail } => {
                self.push(InstRecord::new(
                    codes::function::INST_BR,
                    [
                        Operand::Block(pass),
                        Operand::Block(fail),
                        Operand::Rel(cond),
                    ],
                    None,
                ));
            }
            &InstKind::Return { value } => {
                let ops = match value {
                    Some(value) => Some(self.typed(value)?),
                    None => None,
                };
                self.push(InstRecord::new(codes::function::INST_RET, ops, None));
            }
            InstKind::Phi { incoming } => {
                let r = result()?;
                let ty = self.type_index(r)?;
                let ops = std::iter::once(Operand::Lit(ty.into())).chain(
                    incoming
                        .iter()
                        .flat_map(|&(v, bb)| [Operand::RelSigned(v), Operand::Block(bb)]),
                );
                self.push(InstRecord::new(codes::function::INST_PHI, ops, Some(r)));
            }
            &InstKind::LoadBuffer { buffer, index } => {
                let r = result()?;
                let overload = Overload::for_component(self.compiler.program, self.ty(r)?);
                let handle = self.resource_handle(buffer)?;
                let undef = self.undef_i32();
                self.load_result(r, Intrinsic::BufferLoad(overload), &[handle, index, undef])?;
            }
            InstKind::LoadTexture { texture, coords } => {
                let r = result()?;
                let overload = Overload::for_component(self.compiler.program, self.ty(r)?);
                let handle = self.resource_handle(*texture)?;
                let coords = self.padded_coords(coords)?;
                let undef = self.undef_i32();
                let args = [
                    handle, undef, coords[0], coords[1], coords[2], undef, undef, undef,
                ];
                self.load_result(r, Intrinsic::TextureLoad(overload), &args)?;
            }
            &InstKind::StoreBuffer {
                buffer,
                index,
                value,
                mask,
            } => {
                let overload = Overload::for_component(self.compiler.program, self.ty(value)?);
                let handle = self.resource_handle(buffer)?;
                let texel = self.padded_texel(value)?;
                let undef = self.undef_i32();
                let mask = self.i8_constant(mask);
                let args = [
                    handle, index, undef, texel[0], texel[1], texel[2], texel[3], mask,
                ];
                self.call(Intrinsic::BufferStore(overload), &args, None)?;
            }
            InstKind::StoreTexture {
                texture,
                coords,
                texel,
                mask,
            } => {
                let overload = Overload::for_component(self.compiler.program, self.ty(*texel)?);
                let handle = self.resource_handle(*texture)?;
                let coords = self.padded_coords(coords)?;
                let texel = self.padded_texel(*texel)?;
                let mask = self.i8_constant(*mask);
                let args = [
                    handle, coords[0], coords[1], coords[2], texel[0], texel[1], texel[2],
                    texel[3], mask,
                ];
                self.call(Intrinsic::TextureStore(overload), &args, None)?;
            }
            &InstKind::ResourceSize { resource } => {
                let r = result()?;
                let handle = self.resource_handle(resource)?;
                let mip = self.program().uint32(0);
                let dims = self.call_value(Intrinsic::GetDimensions, &[handle, mip], None)?;
                self.unpack(r, dims)?;
            }
            &InstKind::ResourceToken { resource } => {
                let r = result()?;
                let info = self
                    .compiler
                    .module_handles
                    .get(&resource)
                    .ok_or(Error::Unlowerable("token of a resource without a handle"))?;
                let token = ((info.class.to_dxil() as u32) << 16) | (info.range_id & 0xffff);
                let token = self.program().uint32(token);
                self.aliases.push((r, token));
            }
            &InstKind::Atomic {
                op,
                buffer,
                index,
                value,
            } => {
                let r = result()?;
                let handle = self.resource_handle(buffer)?;
                let op = self.program().uint32(atomic_code(op));
                let undef = self.undef_i32();
                self.call(
                    Intrinsic::AtomicBinOp,
                    &[handle, op, index, undef, undef, value],
                    Some(r),
                )?;
            }
            InstKind::Export { export_id, values } => self.export(*export_id, values)?,
        }
        Ok(())
    }

    /// Re-emit a source record, typing any operand that could now turn
    /// into a forward reference.
    fn reemit(&mut self, ordinal: u32) -> Result<(), Error> {
        let mut record = self
            .source
            .source_inst(ordinal)
            .ok_or(Error::UnresolvedInstruction(ordinal))?
            .clone();
        for op in &mut record.ops {
            if let Operand::RelTyped(value, ty @ None) = op {
                *ty = self.compiler.value_types.get(value).map(|&i| i.into());
            }
        }
        self.out.push(CompiledInst {
            source: Some(ordinal),
            record,
        });
        Ok(())
    }

    /// Scalar components of `value`, if it was decomposed already.
    fn known_components(&self, value: ValueId) -> Option<Components> {
        self.svox
            .get(&value)
            .or_else(|| self.compiler.module_svox.get(&value))
            .cloned()
    }

    /// Scalar components of `value`, extracting them if needed.
    fn components(&mut self, value: ValueId) -> Result<Components, Error> {
        if let Some(components) = self.known_components(value) {
            return Ok(components);
        }
        let ty = self.ty(value)?;
        let cx = self.compiler.program.cx().clone();
        let count = component_count(&cx, ty);
        if count == 1 {
            return Ok([value].into_iter().collect());
        }
        if count > 4 {
            return Err(Error::Unlowerable("vector wider than 4 components"));
        }

        let element = component_type(&cx, ty);
        let mut components = ArrayVec::new();
        for i in 0..count {
            let r = self.fresh(element)?;
            let vector = self.typed(value)?;
            let index = self.program().uint32(i);
            let index = self.typed(index)?;
            self.push(InstRecord::new(
                codes::function::INST_EXTRACTELT,
                [vector, index],
                Some(r),
            ));
            components.push(r);
        }
        self.svox.insert(value, components.clone());
        Ok(components)
    }

    /// Lower an operation on scalars-or-vectors one component at a time,
    /// `emit` being given the per-component arguments and result.
    fn componentwise(
        &mut self,
        result: ValueId,
        args: &[ValueId],
        mut emit: impl FnMut(&mut Self, &[ValueId], ValueId) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let args = args
            .iter()
            .map(|&arg| self.components(arg))
            .collect::<Result<SmallVec<[Components; 3]>, _>>()?;
        let ty = self.ty(result)?;
        let cx = self.compiler.program.cx().clone();
        let count = component_count(&cx, ty) as usize;

        if count == 1 {
            self.type_index(result)?;
            let scalars: SmallVec<[ValueId; 3]> = args.iter().map(|a| a[0]).collect();
            return emit(self, &scalars, result);
        }

        let element = component_type(&cx, ty);
        let mut components = Components::new();
        for i in 0..count {
            let scalars: SmallVec<[ValueId; 3]> = args.iter().map(|a| broadcast(a, i)).collect();
            let r = self.fresh(element)?;
            emit(self, &scalars, r)?;
            components.push(r);
        }
        self.recombine(result, components)
    }

    /// Rebuild the vector `result` out of its components, for any user that
    /// needs it whole, while keeping the components for those that don't.
    fn recombine(&mut self, result: ValueId, components: Components) -> Result<(), Error> {
        let ty = self.ty(result)?;
        let mut vector = self.program().undef(ty);
        for (i, &component) in components.iter().enumerate() {
            let r = if i + 1 == components.len() {
                result
            } else {
                self.program().alloc_typed(ty)
            };
            self.type_index(r)?;
            let base = self.typed(vector)?;
            let index = self.program().uint32(i as u32);
            let index = self.typed(index)?;
            self.push(InstRecord::new(
                codes::function::INST_INSERTELT,
                [base, Operand::Rel(component), index],
                Some(r),
            ));
            vector = r;
        }
        self.svox.insert(result, components);
        Ok(())
    }

    /// Spread the `ResRet`/`Dimensions` struct `value` over `result`.
    fn unpack(&mut self, result: ValueId, value: ValueId) -> Result<(), Error> {
        let ty = self.ty(result)?;
        let cx = self.compiler.program.cx().clone();
        let count = component_count(&cx, ty);
        let element = component_type(&cx, ty);

        let mut components = Components::new();
        for i in 0..count {
            let r = if count == 1 {
                self.type_index(result)?;
                result
            } else {
                self.fresh(element)?
            };
            let aggregate = self.typed(value)?;
            self.push(InstRecord::new(
                codes::function::INST_EXTRACTVAL,
                [aggregate, Operand::Lit(i.into())],
                Some(r),
            ));
            components.push(r);
        }
        if count > 1 {
            self.recombine(result, components)?;
        }
        Ok(())
    }

    fn load_result(
        &mut self,
        result: ValueId,
        intrinsic: Intrinsic,
        args: &[ValueId],
    ) -> Result<(), Error> {
        // Loads re-lowered from the source keep their `ResRet` result.
        if let TypeDef::Struct { .. } = self.compiler.program.cx()[self.ty(result)?] {
            self.call(intrinsic, args, Some(result))?;
            return Ok(());
        }
        let value = self.call_value(intrinsic, args, None)?;
        self.unpack(result, value)
    }

    fn padded_coords(&mut self, coords: &[ValueId]) -> Result<[ValueId; 3], Error> {
        let mut flat = SmallVec::<[ValueId; 4]>::new();
        for &c in coords {
            flat.extend(self.components(c)?);
        }
        if flat.len() > 3 {
            return Err(Error::Unlowerable("more than 3 coordinates"));
        }
        let undef = self.undef_i32();
        let at = |i: usize| flat.get(i).copied().unwrap_or(undef);
        Ok([at(0), at(1), at(2)])
    }

    fn padded_texel(&mut self, value: ValueId) -> Result<[ValueId; 4], Error> {
        let components = self.components(value)?;
        let cx = self.compiler.program.cx().clone();
        let element = component_type(&cx, self.ty(value)?);
        let undef = self.program().undef(element);
        let at = |i: usize| components.get(i).copied().unwrap_or(undef);
        Ok([at(0), at(1), at(2), at(3)])
    }

    /// Emit a call to `intrinsic`, returning its result (if not `void`),
    /// which is `result` if given, or a fresh value otherwise.
    fn call(
        &mut self,
        intrinsic: Intrinsic,
        args: &[ValueId],
        result: Option<ValueId>,
    ) -> Result<Option<ValueId>, Error> {
        let c = &mut *self.compiler;
        let declared = intrinsic.declare(c.program, c.types, c.globals, c.value_types)?;
        let opcode = c.program.uint32(intrinsic.opcode());

        let result = match declared.ret_type_index {
            Some(index) => {
                let r = match result {
                    Some(r) => r,
                    None => {
                        let ty = c.types.get(index.into())?;
                        c.program.alloc_typed(ty)
                    }
                };
                c.value_types.insert(r, index);
                Some(r)
            }
            None => None,
        };

        let ops = [
            Operand::Lit(0),
            Operand::Lit(codes::call::EXPLICIT_TYPE),
            Operand::Lit(declared.fn_type_index.into()),
            Operand::RelTyped(declared.callee, Some(declared.callee_type_index.into())),
            Operand::Rel(opcode),
        ]
        .into_iter()
        .chain(args.iter().map(|&arg| Operand::Rel(arg)));
        let record = InstRecord::new(codes::function::INST_CALL, ops, result);
        self.push(record);
        Ok(result)
    }

    fn call_value(
        &mut self,
        intrinsic: Intrinsic,
        args: &[ValueId],
        result: Option<ValueId>,
    ) -> Result<ValueId, Error> {
        self.call(intrinsic, args, result)?
            .ok_or(Error::Unlowerable("void intrinsic used as a value"))
    }

    /// Handle to access `resource` through: the value itself for source
    /// handles, or a (memoized) handle for shader-data buffers.
    fn resource_handle(&mut self, resource: ValueId) -> Result<ValueId, Error> {
        let shader_data = self
            .compiler
            .program
            .shader_data
            .iter()
            .find(|&(_, &v)| v == resource)
            .map(|(&id, _)| id);
        match shader_data {
            Some(id) => self.handle(HandleKind::ShaderData(id)),
            None => Ok(resource),
        }
    }

    /// The handle for `kind`, created at the start of the entry block the
    /// first time it's needed.
    fn handle(&mut self, kind: HandleKind) -> Result<ValueId, Error> {
        if let Some(&handle) = self.handles.get(&kind) {
            return Ok(handle);
        }
        let binding = self
            .compiler
            .binding
            .ok_or(Error::Unlowerable("handle without export resources"))?;
        let slot = self
            .compiler
            .layout
            .slot(kind)
            .ok_or(Error::Unlowerable("handle without a slot"))?;

        let class = self.i8_constant(ResourceClass::Uav.to_dxil() as u8);
        let range_id = self.program().uint32(binding.handle_id);
        let index = self.program().uint32(binding.register + slot);
        let non_uniform = self.program().bool_constant(false);

        // NOTE(eddyb) emitted into the current block, then moved over.
        let block_len = self.out.len();
        let handle =
            self.call_value(Intrinsic::CreateHandle, &[class, range_id, index, non_uniform], None)?;
        self.hoisted.extend(self.out.drain(block_len..));

        self.handles.insert(kind, handle);
        Ok(handle)
    }

    /// Append `values` (as dwords) to the export stream `export_id`:
    /// reserve space by bumping the stream counter, then store each dword.
    fn export(&mut self, export_id: u32, values: &[ValueId]) -> Result<(), Error> {
        let counter = self.handle(HandleKind::ExportCounter)?;
        let stream = self.handle(HandleKind::ExportStream(export_id))?;

        let mut dwords = SmallVec::<[ValueId; 8]>::new();
        for &value in values {
            dwords.extend(self.components(value)?);
        }

        let add = self.program().uint32(atomic_code(AtomicOp::Add));
        let counter_index = self.program().uint32(export_id);
        let count = self.program().uint32(dwords.len() as u32);
        let undef = self.undef_i32();
        let offset = self.call_value(
            Intrinsic::AtomicBinOp,
            &[counter, add, counter_index, undef, undef, count],
            None,
        )?;

        let u32_ty = self.program().uint_type(32);
        let mask = self.i8_constant(1);
        for (i, &dword) in dwords.iter().enumerate() {
            let address = if i == 0 {
                offset
            } else {
                let r = self.fresh(u32_ty)?;
                let base = self.typed(offset)?;
                let i = self.program().uint32(i as u32);
                self.push(InstRecord::new(
                    codes::function::INST_BINOP,
                    [base, Operand::Rel(i), Operand::Lit(codes::binop::ADD)],
                    Some(r),
                ));
                r
            };
            self.call(
                Intrinsic::BufferStore(Overload::I32),
                &[stream, address, undef, dword, undef, undef, undef, mask],
                None,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::il::{Emitter, Function};
    use crate::shader_data::{LocalShaderDataHost, ShaderDataHost, ShaderDataKind};
    use std::rc::Rc;

    #[test]
    fn handle_slots() {
        let host = LocalShaderDataHost::default();
        let a = host.create(ShaderDataKind::EventData);
        let b = host.create(ShaderDataKind::DescriptorData { dwords: 1 });

        let mut program = Program::new(Rc::new(Context::new()));
        assert!(HandleLayout::new(&program).is_empty());

        let void = program.find_type_or_add(TypeDef::Void);
        let id = program.alloc_value();
        let mut func = Function::new(id, void);
        let entry = func.blocks.append();
        program.functions.push(func);
        let value = program.uint32(7);
        Emitter::append(&mut program, 0, entry).export(1, [value]);
        program.add_shader_data(b);
        program.add_shader_data(a);

        let layout = HandleLayout::new(&program);
        assert_eq!(layout.count(), 1 + 2 + 2);
        assert_eq!(layout.slot(HandleKind::ExportCounter), Some(0));
        assert_eq!(layout.slot(HandleKind::ExportStream(1)), Some(2));
        assert_eq!(layout.slot(HandleKind::ExportStream(2)), None);
        assert_eq!(layout.slot(HandleKind::ShaderData(b)), Some(3));
        assert_eq!(layout.slot(HandleKind::ShaderData(a)), Some(4));

        // Streams the host allocated get slots, exported to or not.
        program.export_streams = 4;
        let layout = HandleLayout::new(&program);
        assert_eq!(layout.slot(HandleKind::ExportStream(3)), Some(4));
        assert_eq!(layout.slot(HandleKind::ShaderData(b)), Some(5));
    }

    #[test]
    fn opcodes_follow_signedness() {
        use codes::binop::*;
        use codes::predicate::*;

        assert_eq!(binop_code(BinaryOp::Div, false, false), UDIV);
        assert_eq!(binop_code(BinaryOp::Div, false, true), SDIV);
        assert_eq!(binop_code(BinaryOp::Div, true, false), SDIV);
        assert_eq!(binop_code(BinaryOp::ShiftRight, false, true), ASHR);
        assert_eq!(binop_code(BinaryOp::ShiftRight, false, false), LSHR);

        assert_eq!(predicate(CompareOp::LessThan, false, false), ICMP_ULT);
        assert_eq!(predicate(CompareOp::LessThan, false, true), ICMP_SLT);
        assert_eq!(predicate(CompareOp::NotEqual, true, false), FCMP_UNE);
        assert_eq!(predicate(CompareOp::GreaterThanEqual, true, true), FCMP_OGE);
    }

    #[test]
    fn alignment_operands() {
        let program = Program::new(Rc::new(Context::new()));
        let f32_ty = program.find_type_or_add(TypeDef::Fp { bit_width: 32 });
        let vec4 = program.find_type_or_add(TypeDef::Vector {
            contained: f32_ty,
            dim: 4,
        });
        assert_eq!(align_operand(&program, f32_ty), 3);
        assert_eq!(align_operand(&program, vec4), 3);
        assert_eq!(align_operand(&program, program.uint_type(8)), 1);
        assert_eq!(align_operand(&program, program.bool_type()), 1);
    }
}
