//! IL instructions.

use crate::il::{BasicBlock, ValueId};
use smallvec::SmallVec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstDef {
    pub result: Option<ValueId>,
    pub kind: InstKind,

    /// Where this instruction came from in the source program, if anywhere.
    ///
    /// Instructions with a `source` are re-emitted from their source record
    /// (with operands remapped), so any modification of `kind` must clear it
    /// (see [`InstDef::kind_mut`]).
    pub source: Option<Source>,
}

/// Position of the source record of an instruction, in its function block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Source {
    pub record_index: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
    Exchange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstKind {
    /// Anything without an IL model, only kept around through its `source`.
    Unexposed { opcode: u32, terminator: bool },

    Phi {
        incoming: SmallVec<[(ValueId, BasicBlock); 4]>,
    },

    /// Signedness (for division, remainder and shifts) follows the type of `lhs`.
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    Compare {
        op: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
        signed: bool,
    },
    Select {
        cond: ValueId,
        pass: ValueId,
        fail: ValueId,
    },
    Extract {
        composite: ValueId,
        index: u32,
    },

    Load {
        address: ValueId,
    },
    Store {
        address: ValueId,
        value: ValueId,
    },

    Branch {
        target: BasicBlock,
    },
    BranchConditional {
        cond: ValueId,
        pass: BasicBlock,
        fail: BasicBlock,
    },
    Return {
        value: Option<ValueId>,
    },

    LoadBuffer {
        buffer: ValueId,
        index: ValueId,
    },
    StoreBuffer {
        buffer: ValueId,
        index: ValueId,
        value: ValueId,
        /// Component write mask.
        mask: u8,
    },
    LoadTexture {
        texture: ValueId,
        coords: SmallVec<[ValueId; 3]>,
    },
    StoreTexture {
        texture: ValueId,
        coords: SmallVec<[ValueId; 3]>,
        texel: ValueId,
        mask: u8,
    },
    ResourceSize {
        resource: ValueId,
    },
    ResourceToken {
        resource: ValueId,
    },
    Atomic {
        op: AtomicOp,
        buffer: ValueId,
        index: ValueId,
        value: ValueId,
    },

    /// Export `values` (one dword each) to the export stream `export_id`.
    Export {
        export_id: u32,
        values: SmallVec<[ValueId; 4]>,
    },
}

impl InstDef {
    pub fn new(result: Option<ValueId>, kind: InstKind) -> Self {
        InstDef {
            result,
            kind,
            source: None,
        }
    }

    /// Mutable access to `kind`, detaching the instruction from its source.
    pub fn kind_mut(&mut self) -> &mut InstKind {
        self.source = None;
        &mut self.kind
    }

    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Branch { .. }
                | InstKind::BranchConditional { .. }
                | InstKind::Return { .. }
                | InstKind::Unexposed {
                    terminator: true,
                    ..
                }
        )
    }

    /// Successor blocks, for (non-`Unexposed`) terminators.
    pub fn successors(&self) -> SmallVec<[BasicBlock; 2]> {
        match *self {
            InstKind::Branch { target } => [target].into_iter().collect(),
            InstKind::BranchConditional { pass, fail, .. } => [pass, fail].into_iter().collect(),
            _ => SmallVec::new(),
        }
    }

    /// Every value operand of this instruction, in operand order.
    pub fn operands(&self) -> SmallVec<[ValueId; 4]> {
        let mut out = SmallVec::new();
        match self {
            InstKind::Unexposed { .. } | InstKind::Branch { .. } => {}
            InstKind::Phi { incoming } => out.extend(incoming.iter().map(|&(v, _)| v)),
            InstKind::Binary { lhs, rhs, .. } | InstKind::Compare { lhs, rhs, .. } => {
                out.extend([*lhs, *rhs]);
            }
            InstKind::Select { cond, pass, fail } => out.extend([*cond, *pass, *fail]),
            InstKind::Extract { composite, .. } => out.push(*composite),
            InstKind::Load { address } => out.push(*address),
            InstKind::Store { address, value } => out.extend([*address, *value]),
            InstKind::BranchConditional { cond, .. } => out.push(*cond),
            InstKind::Return { value } => out.extend(*value),
            InstKind::LoadBuffer { buffer, index } => out.extend([*buffer, *index]),
            InstKind::StoreBuffer {
                buffer,
                index,
                value,
                ..
            } => out.extend([*buffer, *index, *value]),
            InstKind::LoadTexture { texture, coords } => {
                out.push(*texture);
                out.extend(coords.iter().copied());
            }
            InstKind::StoreTexture {
                texture,
                coords,
                texel,
                ..
            } => {
                out.push(*texture);
                out.extend(coords.iter().copied());
                out.push(*texel);
            }
            InstKind::ResourceSize { resource } | InstKind::ResourceToken { resource } => {
                out.push(*resource);
            }
            InstKind::Atomic {
                buffer,
                index,
                value,
                ..
            } => out.extend([*buffer, *index, *value]),
            InstKind::Export { values, .. } => out.extend(values.iter().copied()),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mut_detaches_source() {
        let mut inst = InstDef {
            source: Some(Source { record_index: 3 }),
            ..InstDef::new(
                None,
                InstKind::Unexposed {
                    opcode: 2,
                    terminator: false,
                },
            )
        };
        assert!(!inst.is_terminator());
        *inst.kind_mut() = InstKind::Return { value: None };
        assert_eq!(inst.source, None);
        assert!(inst.is_terminator());
    }
}
