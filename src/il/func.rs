//! Functions and their basic blocks.

use crate::context::Type;
use crate::il::{InstDef, InstKind, ValueId};
use smallvec::SmallVec;

/// Basic block handle, stable across insertion/splitting of other blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlock(u32);

#[derive(Clone, Debug, Default)]
pub struct BasicBlockDef {
    pub insts: Vec<InstDef>,

    /// Set on blocks made by instrumentation, so that visiting user
    /// instructions never sees them.
    pub no_instrumentation: bool,
}

/// Arena of basic blocks, plus their (layout) order.
///
/// Blocks are never removed, so a [`BasicBlock`] stays valid for the
/// lifetime of the list, regardless of where other blocks get inserted.
#[derive(Clone, Debug, Default)]
pub struct BasicBlockList {
    defs: Vec<BasicBlockDef>,
    order: Vec<BasicBlock>,
}

impl BasicBlockList {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn entry(&self) -> Option<BasicBlock> {
        self.order.first().copied()
    }

    /// Blocks, in layout order.
    pub fn order(&self) -> &[BasicBlock] {
        &self.order
    }

    pub fn position(&self, block: BasicBlock) -> Option<usize> {
        self.order.iter().position(|&b| b == block)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BasicBlock, &BasicBlockDef)> {
        self.order.iter().map(|&b| (b, &self.defs[b.0 as usize]))
    }

    fn alloc(&mut self) -> BasicBlock {
        let block = BasicBlock(self.defs.len() as u32);
        self.defs.push(BasicBlockDef::default());
        block
    }

    /// Append a new (empty) block at the end of the layout.
    pub fn append(&mut self) -> BasicBlock {
        let block = self.alloc();
        self.order.push(block);
        block
    }

    /// Insert a new (empty) block right after `after` in the layout.
    pub fn insert_after(&mut self, after: BasicBlock) -> BasicBlock {
        let block = self.alloc();
        let at = self.position(after).map_or(self.order.len(), |i| i + 1);
        self.order.insert(at, block);
        block
    }
}

impl std::ops::Index<BasicBlock> for BasicBlockList {
    type Output = BasicBlockDef;

    fn index(&self, block: BasicBlock) -> &BasicBlockDef {
        &self.defs[block.0 as usize]
    }
}

impl std::ops::IndexMut<BasicBlock> for BasicBlockList {
    fn index_mut(&mut self, block: BasicBlock) -> &mut BasicBlockDef {
        &mut self.defs[block.0 as usize]
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    /// Value of the function itself (i.e. its declaration).
    pub id: ValueId,
    pub ty: Type,
    pub params: SmallVec<[ValueId; 4]>,
    pub blocks: BasicBlockList,
}

impl Function {
    pub fn new(id: ValueId, ty: Type) -> Self {
        Function {
            id,
            ty,
            params: SmallVec::new(),
            blocks: BasicBlockList::default(),
        }
    }

    /// Split `block` before the instruction at `index`, moving that
    /// instruction and everything after it into a new block placed right
    /// after `block`, which then branches to it.
    ///
    /// Phis elsewhere that flowed in from `block` now flow in from the new
    /// block, as it inherits all of `block`'s outgoing edges.
    pub fn split_block(&mut self, block: BasicBlock, index: usize) -> BasicBlock {
        let tail = self.blocks.insert_after(block);

        let moved = self.blocks[block].insts.split_off(index);
        self.blocks[tail].insts = moved;
        self.blocks[block]
            .insts
            .push(InstDef::new(None, InstKind::Branch { target: tail }));

        for def in &mut self.blocks.defs {
            for inst in &mut def.insts {
                let InstKind::Phi { incoming } = &inst.kind else {
                    continue;
                };
                if !incoming.iter().any(|&(_, from)| from == block) {
                    continue;
                }
                if let InstKind::Phi { incoming } = inst.kind_mut() {
                    for (_, from) in incoming {
                        if *from == block {
                            *from = tail;
                        }
                    }
                }
            }
        }

        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::il::{BinaryOp, Program, TypeDef};
    use std::rc::Rc;

    fn add_chain(program: &mut Program, count: usize) -> Function {
        let void = program.find_type_or_add(TypeDef::Void);
        let id = program.alloc_value();
        let mut func = Function::new(id, void);
        let entry = func.blocks.append();

        let one = program.uint32(1);
        let mut acc = one;
        for _ in 0..count - 1 {
            let result = program.alloc_typed(program.uint_type(32));
            func.blocks[entry].insts.push(InstDef::new(
                Some(result),
                InstKind::Binary {
                    op: BinaryOp::Add,
                    lhs: acc,
                    rhs: one,
                },
            ));
            acc = result;
        }
        func.blocks[entry]
            .insts
            .push(InstDef::new(None, InstKind::Return { value: Some(acc) }));
        func
    }

    #[test]
    fn split_falls_through() {
        let mut program = Program::new(Rc::new(Context::new()));
        let mut func = add_chain(&mut program, 5);
        let entry = func.blocks.entry().unwrap();
        let original = func.blocks[entry].insts.clone();

        let tail = func.split_block(entry, 3);
        assert_eq!(func.blocks.order(), &[entry, tail]);
        assert_eq!(func.blocks[entry].insts.len(), 4);
        assert_eq!(
            func.blocks[entry].insts[3].kind,
            InstKind::Branch { target: tail }
        );

        // Executing both halves in order sees the original instructions.
        let rejoined: Vec<_> = func.blocks[entry].insts[..3]
            .iter()
            .chain(&func.blocks[tail].insts)
            .cloned()
            .collect();
        assert_eq!(rejoined, original);
    }

    #[test]
    fn split_retargets_phis() {
        let mut program = Program::new(Rc::new(Context::new()));
        let mut func = add_chain(&mut program, 2);
        let entry = func.blocks.entry().unwrap();

        let exit = func.blocks.append();
        let value = program.uint32(3);
        let phi = program.alloc_typed(program.uint_type(32));
        func.blocks[exit].insts.push(InstDef::new(
            Some(phi),
            InstKind::Phi {
                incoming: [(value, entry)].into_iter().collect(),
            },
        ));
        *func.blocks[entry].insts.last_mut().unwrap() =
            InstDef::new(None, InstKind::Branch { target: exit });

        let tail = func.split_block(entry, 1);
        assert_eq!(func.blocks.order(), &[entry, tail, exit]);
        let InstKind::Phi { incoming } = &func.blocks[exit].insts[0].kind else {
            unreachable!()
        };
        assert_eq!(&incoming[..], &[(value, tail)]);
    }
}
