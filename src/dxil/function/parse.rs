//! Decoding function blocks into IL functions.
//!
//! Every instruction record becomes one IL instruction (with its source
//! record kept for re-emission), exposing what instrumentation understands
//! (arithmetic, memory, control flow and the resource `dx.op.*` intrinsics)
//! and keeping everything else [`InstKind::Unexposed`].

use super::operands::{InstRecord, Operand};
use super::{FunctionBlock, Part};
use crate::context::Type;
use crate::dxil::constants::ConstantTable;
use crate::dxil::globals::{FunctionDecl, Globals};
use crate::dxil::ids::{IdKind, Patch, PatchTarget, PatchedBlock};
use crate::dxil::intrinsics::{self, opcode};
use crate::dxil::metadata::{MetadataBlock, ResourceClass};
use crate::dxil::{Components, Error, HandleInfo, ParseCx};
use crate::il::types::{component_count, component_type, splat};
use crate::il::{
    AtomicOp, BasicBlock, BinaryOp, CompareOp, ConstKind, Function, InstDef, InstKind, Program,
    Source, TypeDef, ValueId,
};
use crate::llvm::{codes, signed, Block, Element, Record, RecordReader};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Module-level state function bodies are parsed against.
pub struct ModuleView<'a, 'b> {
    pub cx: &'a mut ParseCx<'b>,
    pub constants: &'a mut ConstantTable,
    pub globals: &'a Globals,
    pub metadata: &'a MetadataBlock,

    /// `createHandle` results, filled in while parsing.
    pub handles: &'a mut FxHashMap<ValueId, HandleInfo>,

    /// Synthesized vectors standing for scalar intrinsic operands.
    pub svox: &'a mut FxHashMap<ValueId, Components>,
}

pub fn parse(
    block: &Block,
    uid: u32,
    decl: &FunctionDecl,
    view: &mut ModuleView<'_, '_>,
) -> Result<FunctionBlock, Error> {
    let types = view.cx.types;
    let malformed = |code| Error::MalformedRecord {
        block: "function",
        code,
    };

    let (_, params) = types
        .signature(decl.type_index.into())
        .ok_or(malformed(codes::module::FUNCTION))?;
    let mut func = Function::new(decl.value, types.get(decl.type_index.into())?);
    for &param in params {
        let value = view.cx.define(IdKind::Argument, Some(param))?;
        func.params.push(value);
    }

    let mut out = FunctionBlock {
        uid,
        func: view.cx.program.functions.len(),
        abbrev_width: block.abbrev_width,
        abbrevs: vec![],
        head: vec![],
        tail: vec![],
        insts: vec![],
    };
    let mut blocks = vec![];
    let mut current = 0;

    for element in &block.elements {
        let part = match element {
            Element::DefineAbbrev(_) => {
                out.abbrevs.push(element.clone());
                continue;
            }
            Element::Block(b) => match b.id {
                codes::block::CONSTANTS => {
                    Part::Patched(view.constants.parse_block(b, view.cx, false)?)
                }
                codes::block::METADATA => Part::Patched(parse_local_metadata(b, view.cx)?),
                codes::block::VALUE_SYMTAB => {
                    Part::Patched(parse_symbol_table(b, view.cx, &blocks)?)
                }
                codes::block::METADATA_ATTACHMENT => Part::Patched(parse_attachments(b)),
                codes::block::USELIST => Part::UseList(b.clone()),
                _ => Part::Verbatim(element.clone()),
            },
            Element::Record(record) => match record.code {
                codes::function::DECLAREBLOCKS => {
                    // Every block needs at least a terminator record.
                    let count = record.op(0);
                    if count > block.elements.len() as u64 {
                        return Err(malformed(record.code));
                    }
                    blocks.extend((0..count).map(|_| func.blocks.append()));
                    Part::DeclareBlocks(record.clone())
                }
                codes::function::DEBUG_LOC | codes::function::DEBUG_LOC_AGAIN => {
                    match out.insts.last_mut() {
                        Some(inst) => {
                            inst.debug_locs.push(debug_loc(record));
                            continue;
                        }
                        None => Part::Verbatim(element.clone()),
                    }
                }
                _ => {
                    let bb = *blocks.get(current).ok_or(malformed(record.code))?;
                    let ordinal = out.insts.len() as u32;
                    let (inst, inst_record) = parse_inst(record, &blocks, view)?;
                    if inst.is_terminator() {
                        current += 1;
                    }
                    func.blocks[bb].insts.push(InstDef {
                        source: Some(Source {
                            record_index: ordinal,
                        }),
                        ..inst
                    });
                    out.insts.push(inst_record);
                    continue;
                }
            },
        };
        if out.insts.is_empty() {
            out.head.push(part);
        } else {
            out.tail.push(part);
        }
    }

    view.cx.program.functions.push(func);
    Ok(out)
}

fn debug_loc(record: &Record) -> InstRecord {
    // `[line, column, scope, inlined-at]`, the latter two metadata plus one.
    let ops = record.ops.iter().enumerate().map(|(i, &op)| match i {
        2 | 3 => Operand::MetadataPlusOne(op),
        _ => Operand::Lit(op),
    });
    InstRecord {
        abbrev: record.abbrev,
        source_len: record.ops.len(),
        ..InstRecord::new(record.code, ops, None)
    }
}

fn parse_local_metadata(block: &Block, cx: &mut ParseCx<'_>) -> Result<PatchedBlock, Error> {
    let mut parsed = PatchedBlock::new(block.clone());
    for (ordinal, record) in block.records().enumerate() {
        match record.code {
            codes::metadata::VALUE => {
                let value = cx.resolve(record.op(1))?;
                parsed.patches.push(Patch::value(ordinal, 1, value));
            }
            codes::metadata::NODE | codes::metadata::DISTINCT_NODE => {
                for (op, &id) in record.ops.iter().enumerate() {
                    parsed.patches.push(Patch {
                        record: ordinal,
                        op,
                        target: PatchTarget::MetadataPlusOne(id),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn parse_symbol_table(
    block: &Block,
    cx: &mut ParseCx<'_>,
    blocks: &[BasicBlock],
) -> Result<PatchedBlock, Error> {
    let mut parsed = PatchedBlock::new(block.clone());
    for (ordinal, record) in block.records().enumerate() {
        match record.code {
            codes::value_symtab::ENTRY => {
                let value = cx.resolve(record.op(0))?;
                parsed.patches.push(Patch::value(ordinal, 0, value));
            }
            codes::value_symtab::BBENTRY => {
                let bb = usize::try_from(record.op(0))
                    .ok()
                    .and_then(|i| blocks.get(i))
                    .ok_or(Error::MalformedRecord {
                        block: "value symbol table",
                        code: record.code,
                    })?;
                parsed.patches.push(Patch {
                    record: ordinal,
                    op: 0,
                    target: PatchTarget::BasicBlock(*bb),
                });
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn parse_attachments(block: &Block) -> PatchedBlock {
    let mut parsed = PatchedBlock::new(block.clone());
    for (ordinal, record) in block.records().enumerate() {
        if record.code != codes::metadata::ATTACHMENT {
            continue;
        }
        // `[instruction, (kind, node)*]`, or without the instruction for
        // attachments to the function itself.
        let n = record.ops.len();
        let start = if n % 2 == 1 {
            parsed.patches.push(Patch {
                record: ordinal,
                op: 0,
                target: PatchTarget::Inst(record.op(0) as u32),
            });
            1
        } else {
            0
        };
        for op in (start + 1..n).step_by(2) {
            parsed.patches.push(Patch {
                record: ordinal,
                op,
                target: PatchTarget::Metadata(record.ops[op]),
            });
        }
    }
    parsed
}

/// Whether (and how) an instruction defines a value.
enum Produces {
    Nothing,

    /// A value, of the given type table entry (if it could be determined).
    Value(Option<u64>),
}

/// Callee and arguments of a call, for intrinsic recognition.
struct Call {
    callee: ValueId,
    args: SmallVec<[ValueId; 12]>,
}

impl Call {
    fn arg(&self, i: usize) -> Option<ValueId> {
        self.args.get(i).copied()
    }

    fn int(&self, program: &Program, i: usize) -> Option<i64> {
        program.int_constant(self.arg(i)?)
    }
}

struct Decoded {
    kind: InstKind,
    produces: Produces,
    call: Option<Call>,
}

impl Decoded {
    fn new(kind: InstKind, produces: Produces) -> Self {
        Decoded {
            kind,
            produces,
            call: None,
        }
    }
}

/// Operand decoder for one instruction record, accumulating the symbolic
/// operands as it goes.
struct Decoder<'a, 'p> {
    record: &'a Record,
    reader: RecordReader<'a>,
    cx: &'a mut ParseCx<'p>,
    blocks: &'a [BasicBlock],
    inst_id: u32,
    ops: SmallVec<[Operand; 8]>,
}

impl Decoder<'_, '_> {
    fn malformed(&self) -> Error {
        Error::MalformedRecord {
            block: "function",
            code: self.record.code,
        }
    }

    fn next(&mut self) -> Result<u64, Error> {
        match self.reader.consume() {
            Some(op) => Ok(op),
            None => Err(self.malformed()),
        }
    }

    fn lit(&mut self) -> Result<u64, Error> {
        let op = self.next()?;
        self.ops.push(Operand::Lit(op));
        Ok(op)
    }

    fn source(&self, relative: u64) -> u32 {
        self.inst_id.wrapping_sub(relative as u32)
    }

    fn rel(&mut self) -> Result<ValueId, Error> {
        let relative = self.next()?;
        let source = self.source(relative);
        let value = self.cx.resolve(source.into())?;
        self.ops.push(Operand::Rel(value));
        Ok(value)
    }

    /// Relative value, with its type following if it's a forward reference.
    fn rel_typed(&mut self) -> Result<ValueId, Error> {
        let relative = self.next()?;
        let source = self.source(relative);
        let value = self.cx.resolve(source.into())?;
        let ty = if source >= self.inst_id {
            let ty = self.next()?;
            let il_ty = self.cx.types.get(ty)?;
            self.cx.program.set_type(value, il_ty);
            self.cx.value_types.insert(value, ty as u32);
            Some(ty)
        } else {
            None
        };
        self.ops.push(Operand::RelTyped(value, ty));
        Ok(value)
    }

    fn rel_signed(&mut self) -> Result<ValueId, Error> {
        let relative = signed::decode(self.next()?);
        let source = i64::from(self.inst_id) - relative;
        let source = u64::try_from(source).map_err(|_| Error::ValueOutOfRange(relative as u64))?;
        let value = self.cx.resolve(source)?;
        self.ops.push(Operand::RelSigned(value));
        Ok(value)
    }

    fn abs(&mut self) -> Result<ValueId, Error> {
        let op = self.next()?;
        let value = self.cx.resolve(op)?;
        self.ops.push(Operand::Abs(value));
        Ok(value)
    }

    fn block(&mut self) -> Result<BasicBlock, Error> {
        let op = self.next()?;
        let bb = usize::try_from(op)
            .ok()
            .and_then(|i| self.blocks.get(i))
            .copied()
            .ok_or_else(|| self.malformed())?;
        self.ops.push(Operand::Block(bb));
        Ok(bb)
    }

    fn rest(&mut self) {
        while let Some(op) = self.reader.consume() {
            self.ops.push(Operand::Lit(op));
        }
    }

    fn program(&self) -> &Program {
        self.cx.program
    }

    fn type_index(&self, value: ValueId) -> Option<u64> {
        self.cx.value_types.get(&value).map(|&i| i.into())
    }

    /// Table index of an IL type, if the table has it.
    fn find(&self, def: TypeDef) -> Option<u64> {
        self.find_type(self.program().find_type_or_add(def))
    }

    fn find_type(&self, ty: Type) -> Option<u64> {
        self.cx.types.find(self.program().cx(), ty).map(u64::from)
    }

    fn is_float(&self, value: ValueId) -> bool {
        let program = self.program();
        program.type_of(value).map_or(false, |ty| {
            let cx = program.cx();
            matches!(cx[component_type(cx, ty)], TypeDef::Fp { .. })
        })
    }

    fn pointee(&self, pointer: ValueId) -> Option<u64> {
        self.cx.types.pointee(self.type_index(pointer)?)
    }

    /// Result type of a `getelementptr`.
    fn gep_result(&self, source_element: Option<u64>, indices: &[ValueId]) -> Option<u64> {
        let (&base, indices) = indices.split_first()?;
        let base_index = self.type_index(base)?;
        let program = self.program();
        let TypeDef::Pointer { address_space, .. } =
            program.cx()[self.cx.types.get(base_index).ok()?]
        else {
            return None;
        };

        // NOTE(eddyb) the first index steps over the pointer itself.
        let mut ty = match source_element {
            Some(ty) => ty,
            None => self.cx.types.pointee(base_index)?,
        };
        for &index in indices.iter().skip(1) {
            let i = program.int_constant(index).unwrap_or(0);
            ty = self.cx.types.element(ty, i as u64)?;
        }
        let pointee = self.cx.types.get(ty).ok()?;
        self.find(TypeDef::Pointer {
            pointee,
            address_space,
        })
    }
}

fn binary_op(opcode: u64, is_float: bool) -> Option<BinaryOp> {
    use codes::binop::*;

    // NOTE(eddyb) `fdiv`/`frem` reuse the signed integer opcodes, and signed
    // integer division can't be told apart by the (signless) operand types.
    Some(match opcode {
        ADD => BinaryOp::Add,
        SUB => BinaryOp::Sub,
        MUL => BinaryOp::Mul,
        UDIV if !is_float => BinaryOp::Div,
        SDIV if is_float => BinaryOp::Div,
        UREM if !is_float => BinaryOp::Rem,
        SREM if is_float => BinaryOp::Rem,
        SHL if !is_float => BinaryOp::ShiftLeft,
        LSHR if !is_float => BinaryOp::ShiftRight,
        AND if !is_float => BinaryOp::BitAnd,
        OR if !is_float => BinaryOp::BitOr,
        XOR if !is_float => BinaryOp::BitXor,
        _ => return None,
    })
}

/// Comparison and signedness of a predicate (unordered float comparisons,
/// other than `une`, have no IL equivalent).
fn compare_op(predicate: u64) -> Option<(CompareOp, bool)> {
    use codes::predicate::*;
    use CompareOp::*;

    Some(match predicate {
        FCMP_OEQ | ICMP_EQ => (Equal, false),
        FCMP_UNE | ICMP_NE => (NotEqual, false),
        FCMP_OGT | ICMP_UGT => (GreaterThan, false),
        FCMP_OGE | ICMP_UGE => (GreaterThanEqual, false),
        FCMP_OLT | ICMP_ULT => (LessThan, false),
        FCMP_OLE | ICMP_ULE => (LessThanEqual, false),
        ICMP_SGT => (GreaterThan, true),
        ICMP_SGE => (GreaterThanEqual, true),
        ICMP_SLT => (LessThan, true),
        ICMP_SLE => (LessThanEqual, true),
        _ => return None,
    })
}

fn decode(d: &mut Decoder<'_, '_>) -> Result<Decoded, Error> {
    use codes::function::*;
    use Produces::{Nothing, Value};

    let code = d.record.code;
    let unexposed = |terminator| InstKind::Unexposed {
        opcode: code,
        terminator,
    };

    Ok(match code {
        INST_BINOP => {
            let lhs = d.rel_typed()?;
            let rhs = d.rel()?;
            let opcode = d.lit()?;
            d.rest();
            let kind = match binary_op(opcode, d.is_float(lhs)) {
                Some(op) => InstKind::Binary { op, lhs, rhs },
                None => unexposed(false),
            };
            Decoded::new(kind, Value(d.type_index(lhs)))
        }
        INST_CAST => {
            d.rel_typed()?;
            let ty = d.lit()?;
            d.lit()?;
            Decoded::new(unexposed(false), Value(Some(ty)))
        }
        INST_GEP | INST_GEP_OLD | INST_INBOUNDS_GEP_OLD => {
            let source_element = if code == INST_GEP {
                d.lit()?;
                Some(d.lit()?)
            } else {
                None
            };
            let mut indices = SmallVec::<[ValueId; 4]>::new();
            while d.reader.any() {
                indices.push(d.rel_typed()?);
            }
            let ty = d.gep_result(source_element, &indices);
            Decoded::new(unexposed(false), Value(ty))
        }
        INST_EXTRACTELT => {
            let vector = d.rel_typed()?;
            d.rel_typed()?;
            let ty = d.type_index(vector).and_then(|v| d.cx.types.element(v, 0));
            Decoded::new(unexposed(false), Value(ty))
        }
        INST_INSERTELT => {
            let vector = d.rel_typed()?;
            d.rel()?;
            d.rel_typed()?;
            Decoded::new(unexposed(false), Value(d.type_index(vector)))
        }
        INST_SHUFFLEVEC => {
            let vector = d.rel_typed()?;
            d.rel()?;
            let mask = d.rel()?;
            let program = d.program();
            let ty = match (program.type_of(vector), program.type_of(mask)) {
                (Some(vector), Some(mask)) => {
                    let cx = program.cx();
                    let dim = component_count(cx, mask) as u8;
                    d.find(TypeDef::Vector {
                        contained: component_type(cx, vector),
                        dim,
                    })
                }
                _ => None,
            };
            Decoded::new(unexposed(false), Value(ty))
        }
        INST_CMP | INST_CMP2 => {
            let lhs = d.rel_typed()?;
            let rhs = d.rel()?;
            let predicate = d.lit()?;
            d.rest();
            let kind = match compare_op(predicate) {
                Some((op, signed)) => InstKind::Compare {
                    op,
                    lhs,
                    rhs,
                    signed,
                },
                None => unexposed(false),
            };
            let program = d.program();
            let ty = program
                .type_of(lhs)
                .and_then(|ty| d.find_type(splat(program.cx(), ty, program.bool_type())));
            Decoded::new(kind, Value(ty))
        }
        INST_VSELECT => {
            let pass = d.rel_typed()?;
            let fail = d.rel()?;
            let cond = d.rel_typed()?;
            Decoded::new(
                InstKind::Select { cond, pass, fail },
                Value(d.type_index(pass)),
            )
        }
        INST_RET => {
            let value = if d.reader.any() {
                Some(d.rel_typed()?)
            } else {
                None
            };
            Decoded::new(InstKind::Return { value }, Nothing)
        }
        INST_BR => {
            let pass = d.block()?;
            let kind = if d.reader.any() {
                let fail = d.block()?;
                let cond = d.rel()?;
                InstKind::BranchConditional { cond, pass, fail }
            } else {
                InstKind::Branch { target: pass }
            };
            Decoded::new(kind, Nothing)
        }
        INST_SWITCH => {
            let ty = d.lit()?;
            // NOTE(eddyb) the "new" (case range) format is flagged by a magic
            // number in the upper half of the first operand.
            if ty >> 16 == 0x4B5 {
                return Err(Error::UnsupportedRecord(code));
            }
            d.rel()?;
            d.block()?;
            while d.reader.any() {
                d.abs()?;
                d.block()?;
            }
            Decoded::new(unexposed(true), Nothing)
        }
        INST_INDIRECTBR => {
            d.lit()?;
            d.rel()?;
            while d.reader.any() {
                d.block()?;
            }
            Decoded::new(unexposed(true), Nothing)
        }
        INST_UNREACHABLE => Decoded::new(unexposed(true), Nothing),
        INST_PHI => {
            let ty = d.lit()?;
            let mut incoming = SmallVec::new();
            while d.reader.remaining() >= 2 {
                let value = d.rel_signed()?;
                let bb = d.block()?;
                incoming.push((value, bb));
            }
            Decoded::new(InstKind::Phi { incoming }, Value(Some(ty)))
        }
        INST_ALLOCA => {
            let ty = d.lit()?;
            d.lit()?;
            d.abs()?;
            let align = d.lit()?;
            let ty = if align & (1 << 6) != 0 {
                let pointee = d.cx.types.get(ty)?;
                d.find(TypeDef::Pointer {
                    pointee,
                    address_space: crate::il::AddressSpace::Function,
                })
            } else {
                Some(ty)
            };
            Decoded::new(unexposed(false), Value(ty))
        }
        INST_LOAD | INST_LOADATOMIC => {
            let address = d.rel_typed()?;
            let explicit = if code == INST_LOAD { 3 } else { 5 };
            let ty = if d.reader.remaining() == explicit {
                Some(d.lit()?)
            } else {
                d.pointee(address)
            };
            d.rest();
            let kind = match code {
                INST_LOAD => InstKind::Load { address },
                _ => unexposed(false),
            };
            Decoded::new(kind, Value(ty))
        }
        INST_STORE | INST_STOREATOMIC => {
            let address = d.rel_typed()?;
            let value = d.rel_typed()?;
            d.rest();
            let kind = match code {
                INST_STORE => InstKind::Store { address, value },
                _ => unexposed(false),
            };
            Decoded::new(kind, Nothing)
        }
        INST_STORE_OLD | INST_STOREATOMIC_OLD => {
            d.rel_typed()?;
            d.rel()?;
            d.rest();
            Decoded::new(unexposed(false), Nothing)
        }
        INST_CMPXCHG => {
            d.rel_typed()?;
            let cmp = d.rel_typed()?;
            d.rel()?;
            d.rest();
            let program = d.program();
            let ty = program.type_of(cmp).and_then(|ty| {
                d.find(TypeDef::Struct {
                    members: [ty, program.bool_type()].into_iter().collect(),
                })
            });
            Decoded::new(unexposed(false), Value(ty))
        }
        INST_CMPXCHG_OLD => {
            let address = d.rel_typed()?;
            d.rel()?;
            d.rel()?;
            d.rest();
            Decoded::new(unexposed(false), Value(d.pointee(address)))
        }
        INST_ATOMICRMW => {
            let address = d.rel_typed()?;
            d.rel()?;
            d.rest();
            Decoded::new(unexposed(false), Value(d.pointee(address)))
        }
        INST_FENCE => {
            d.rest();
            Decoded::new(unexposed(false), Nothing)
        }
        INST_CALL => decode_call(d)?,
        INST_VAARG => {
            d.lit()?;
            d.rel()?;
            let ty = d.lit()?;
            Decoded::new(unexposed(false), Value(Some(ty)))
        }
        INST_EXTRACTVAL => {
            let aggregate = d.rel_typed()?;
            let mut ty = d.type_index(aggregate);
            let mut indices = SmallVec::<[u64; 2]>::new();
            while d.reader.any() {
                let index = d.lit()?;
                ty = ty.and_then(|ty| d.cx.types.element(ty, index));
                indices.push(index);
            }
            let kind = match indices[..] {
                [index] => InstKind::Extract {
                    composite: aggregate,
                    index: index as u32,
                },
                _ => unexposed(false),
            };
            Decoded::new(kind, Value(ty))
        }
        INST_INSERTVAL => {
            let aggregate = d.rel_typed()?;
            d.rel_typed()?;
            d.rest();
            Decoded::new(unexposed(false), Value(d.type_index(aggregate)))
        }
        _ => return Err(Error::UnsupportedRecord(code)),
    })
}

fn decode_call(d: &mut Decoder<'_, '_>) -> Result<Decoded, Error> {
    d.lit()?;
    let cc = d.lit()?;
    if cc & codes::call::FMF != 0 {
        d.lit()?;
    }
    let explicit = if cc & codes::call::EXPLICIT_TYPE != 0 {
        Some(d.lit()?)
    } else {
        None
    };
    let callee = d.rel_typed()?;
    let fn_type = match explicit {
        Some(ty) => ty,
        None => d.pointee(callee).ok_or_else(|| d.malformed())?,
    };

    let types = d.cx.types;
    let (ret, params) = types.signature(fn_type).ok_or_else(|| d.malformed())?;
    let mut args = SmallVec::new();
    for &param in params {
        let is_label = matches!(d.program().cx()[types.get(param)?], TypeDef::Label);
        if is_label {
            d.block()?;
        } else {
            args.push(d.rel()?);
        }
    }
    // Variadic arguments.
    while d.reader.any() {
        args.push(d.rel_typed()?);
    }

    let is_void = matches!(d.program().cx()[types.get(ret)?], TypeDef::Void);
    Ok(Decoded {
        kind: InstKind::Unexposed {
            opcode: codes::function::INST_CALL,
            terminator: false,
        },
        produces: if is_void {
            Produces::Nothing
        } else {
            Produces::Value(Some(ret))
        },
        call: Some(Call { callee, args }),
    })
}

fn parse_inst(
    record: &Record,
    blocks: &[BasicBlock],
    view: &mut ModuleView<'_, '_>,
) -> Result<(InstDef, InstRecord), Error> {
    let (decoded, ops) = {
        let inst_id = view.cx.ids.next_id();
        let mut d = Decoder {
            record,
            reader: record.reader(),
            cx: &mut *view.cx,
            blocks,
            inst_id,
            ops: SmallVec::new(),
        };
        let decoded = decode(&mut d)?;
        (decoded, d.ops)
    };

    let result = match decoded.produces {
        Produces::Nothing => None,
        Produces::Value(ty) => Some(view.cx.define(IdKind::Instruction, ty)?),
    };
    let kind = match &decoded.call {
        Some(call) => recognize_intrinsic(view, call, result).unwrap_or(decoded.kind),
        None => decoded.kind,
    };

    let inst_record = InstRecord {
        abbrev: record.abbrev,
        source_len: record.ops.len(),
        ..InstRecord::new(record.code, ops, result)
    };
    Ok((InstDef::new(result, kind), inst_record))
}

/// IL instruction for a recognized `dx.op.*` call.
///
/// `createHandle` stays unexposed, but its result gets recorded (and typed
/// as the resource it's a handle to).
fn recognize_intrinsic(
    view: &mut ModuleView<'_, '_>,
    call: &Call,
    result: Option<ValueId>,
) -> Option<InstKind> {
    let name = view.globals.name(call.callee)?;
    if !name.starts_with(intrinsics::PREFIX) {
        return None;
    }

    let program = &mut *view.cx.program;
    let arg = |i| call.arg(i);
    let op = u32::try_from(call.int(program, 0)?).ok()?;

    match op {
        opcode::CREATE_HANDLE => {
            let class = ResourceClass::from_dxil(call.int(program, 1)? as u64)?;
            let range_id = call.int(program, 2)? as u32;
            let result = result?;
            view.handles.insert(
                result,
                HandleInfo {
                    class,
                    range_id,
                    index: arg(3)?,
                },
            );
            if let Some(entry) = view.metadata.handle(class, range_id) {
                program.set_type(result, entry.ty);
            }
            None
        }
        opcode::BUFFER_LOAD => Some(InstKind::LoadBuffer {
            buffer: arg(1)?,
            index: arg(2)?,
        }),
        opcode::BUFFER_STORE => {
            let mask = call.int(program, 8)? as u8;
            let value = vectorize(program, view.svox, [arg(4)?, arg(5)?, arg(6)?, arg(7)?])?;
            Some(InstKind::StoreBuffer {
                buffer: arg(1)?,
                index: arg(2)?,
                value,
                mask,
            })
        }
        opcode::TEXTURE_LOAD => Some(InstKind::LoadTexture {
            texture: arg(1)?,
            coords: defined(program, [arg(3)?, arg(4)?, arg(5)?]),
        }),
        opcode::TEXTURE_STORE => {
            let mask = call.int(program, 9)? as u8;
            let coords = defined(program, [arg(2)?, arg(3)?, arg(4)?]);
            let texel = vectorize(program, view.svox, [arg(5)?, arg(6)?, arg(7)?, arg(8)?])?;
            Some(InstKind::StoreTexture {
                texture: arg(1)?,
                coords,
                texel,
                mask,
            })
        }
        opcode::GET_DIMENSIONS => Some(InstKind::ResourceSize { resource: arg(1)? }),
        opcode::ATOMIC_BINOP => {
            let op = match call.int(program, 2)? as u64 {
                codes::atomic_binop::ADD => AtomicOp::Add,
                codes::atomic_binop::AND => AtomicOp::And,
                codes::atomic_binop::OR => AtomicOp::Or,
                codes::atomic_binop::XOR => AtomicOp::Xor,
                codes::atomic_binop::EXCHANGE => AtomicOp::Exchange,
                _ => return None,
            };
            Some(InstKind::Atomic {
                op,
                buffer: arg(1)?,
                index: arg(3)?,
                value: arg(6)?,
            })
        }
        _ => None,
    }
}

/// Fresh vector value standing for scalar components.
fn vectorize(
    program: &mut Program,
    svox: &mut FxHashMap<ValueId, Components>,
    components: [ValueId; 4],
) -> Option<ValueId> {
    let contained = program.type_of(components[0])?;
    let ty = program.find_type_or_add(TypeDef::Vector { contained, dim: 4 });
    let value = program.alloc_typed(ty);
    svox.insert(value, components.into_iter().collect());
    Some(value)
}

/// Coordinates actually used, i.e. without the trailing `undef`s.
fn defined(program: &Program, coords: [ValueId; 3]) -> SmallVec<[ValueId; 3]> {
    coords
        .into_iter()
        .filter(|&c| !matches!(program.constant(c).map(|c| c.kind), Some(ConstKind::Undef)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_ops_by_type() {
        use codes::binop::*;

        assert_eq!(binary_op(ADD, false), Some(BinaryOp::Add));
        assert_eq!(binary_op(ADD, true), Some(BinaryOp::Add));
        assert_eq!(binary_op(UDIV, false), Some(BinaryOp::Div));
        assert_eq!(binary_op(SDIV, true), Some(BinaryOp::Div));
        assert_eq!(binary_op(SDIV, false), None);
        assert_eq!(binary_op(ASHR, false), None);
        assert_eq!(binary_op(XOR, true), None);
    }

    #[test]
    fn compare_predicates() {
        use codes::predicate::*;

        assert_eq!(compare_op(ICMP_SLT), Some((CompareOp::LessThan, true)));
        assert_eq!(compare_op(ICMP_ULT), Some((CompareOp::LessThan, false)));
        assert_eq!(compare_op(FCMP_UNE), Some((CompareOp::NotEqual, false)));
        assert_eq!(compare_op(FCMP_ONE), None);
    }

    #[test]
    fn attachments_patch_instructions_and_nodes() {
        let mut block = Block::new(codes::block::METADATA_ATTACHMENT, 0, 3);
        block.push_record(Record::new(codes::metadata::ATTACHMENT, [4, 0, 7, 1, 9]));
        block.push_record(Record::new(codes::metadata::ATTACHMENT, [2, 5]));

        let parsed = parse_attachments(&block);
        let targets: Vec<_> = parsed
            .patches
            .iter()
            .map(|p| (p.record, p.op, p.target))
            .collect();
        assert_eq!(
            targets,
            [
                (0, 0, PatchTarget::Inst(4)),
                (0, 2, PatchTarget::Metadata(7)),
                (0, 4, PatchTarget::Metadata(9)),
                (1, 1, PatchTarget::Metadata(5)),
            ]
        );
    }
}
