//! Instruction records with operands kept symbolic (IL values and blocks),
//! so that they can be re-encoded after values got renumbered.

use crate::dxil::ids::Relocation;
use crate::dxil::Error;
use crate::il::{BasicBlock, ValueId};
use crate::llvm::{signed, Record};
use smallvec::SmallVec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Literal operand (type index, opcode, flags, alignment, etc.).
    Lit(u64),

    /// Relative value (`InstID - ValID`, wrapping).
    Rel(ValueId),

    /// Relative value, followed by its type index if it's a forward
    /// reference (the type being needed then, and only then).
    RelTyped(ValueId, Option<u64>),

    /// Relative value, as a signed VBR (`phi` incoming values).
    RelSigned(ValueId),

    /// Absolute value id.
    Abs(ValueId),

    /// Basic block index.
    Block(BasicBlock),

    /// Metadata id plus one (`0` being none).
    MetadataPlusOne(u64),
}

/// One instruction record, along with its debug location records.
#[derive(Clone, Debug)]
pub struct InstRecord {
    pub code: u32,
    pub ops: SmallVec<[Operand; 8]>,
    pub result: Option<ValueId>,
    pub abbrev: Option<u32>,

    /// Operand count of the source record (`0` if synthesized).
    pub source_len: usize,

    /// `DEBUG_LOC`/`DEBUG_LOC_AGAIN` records following the instruction.
    pub debug_locs: Vec<InstRecord>,
}

impl InstRecord {
    pub fn new(code: u32, ops: impl IntoIterator<Item = Operand>, result: Option<ValueId>) -> Self {
        InstRecord {
            code,
            ops: ops.into_iter().collect(),
            result,
            abbrev: None,
            source_len: 0,
            debug_locs: vec![],
        }
    }

    /// Encode for an instruction whose (would-be) value id is `inst_id`.
    pub fn encode(&self, inst_id: u32, reloc: &Relocation<'_>) -> Result<Record, Error> {
        let mut ops = SmallVec::<[u64; 8]>::with_capacity(self.ops.len());
        for &op in &self.ops {
            match op {
                Operand::Lit(v) => ops.push(v),
                Operand::Rel(v) => ops.push(relative(inst_id, reloc.value(v)?)),
                Operand::RelTyped(v, ty) => {
                    let id = reloc.value(v)?;
                    ops.push(relative(inst_id, id));
                    if id >= inst_id {
                        let ty = ty.ok_or(Error::UnresolvedValue(v))?;
                        ops.push(ty);
                    }
                }
                Operand::RelSigned(v) => {
                    let id = reloc.value(v)?;
                    ops.push(signed::encode(i64::from(inst_id) - i64::from(id)));
                }
                Operand::Abs(v) => ops.push(reloc.value(v)?.into()),
                Operand::Block(bb) => ops.push(reloc.block(bb)?),
                Operand::MetadataPlusOne(id) => ops.push(reloc.metadata.map_plus_one(id)),
            }
        }

        // A forward reference gaining (or losing) its type operand changes
        // the layout, so the original abbreviation may no longer apply.
        let abbrev = self.abbrev.filter(|_| ops.len() == self.source_len);
        Ok(Record {
            code: self.code,
            ops,
            blob: None,
            abbrev,
        })
    }

    /// Every value this record refers to.
    pub fn values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.ops.iter().filter_map(|op| match *op {
            Operand::Rel(v) | Operand::RelTyped(v, _) | Operand::RelSigned(v) | Operand::Abs(v) => {
                Some(v)
            }
            _ => None,
        })
    }
}

fn relative(inst_id: u32, value_id: u32) -> u64 {
    u64::from(inst_id.wrapping_sub(value_id))
}
