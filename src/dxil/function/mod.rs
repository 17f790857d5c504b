//! Function bodies (`FUNCTION_BLOCK`s): instruction records decoded into IL
//! instructions (see [`parse`]), IL instructions encoded back into records
//! (see [`compile`]), and the records re-linearized around whatever got
//! inserted, with every value, block and instruction reference relocated.

use crate::dxil::ids::{IdRemapper, MetadataRemap, PatchedBlock, Relocation};
use crate::dxil::Error;
use crate::il::{BasicBlock, Program};
use crate::llvm::{codes, Block, Element, Record};
use rustc_hash::FxHashMap;

pub mod compile;
pub mod operands;
pub mod parse;

use compile::Compiled;
use operands::InstRecord;

/// Non-instruction contents of a function block.
#[derive(Clone, Debug)]
enum Part {
    /// Regenerated from the final block count.
    DeclareBlocks(Record),

    /// Local constants, local metadata, the symbol table and attachments.
    Patched(PatchedBlock),

    /// Only valid for the exact source numbering, dropped otherwise.
    UseList(Block),

    Verbatim(Element),
}

#[derive(Clone, Debug)]
pub struct FunctionBlock {
    pub uid: u32,

    /// Index of the function in [`Program::functions`].
    pub func: usize,

    abbrev_width: u32,

    /// `DEFINE_ABBREV`s, hoisted to the start of the block.
    abbrevs: Vec<Element>,

    /// Parts before and after the instructions.
    head: Vec<Part>,
    tail: Vec<Part>,

    /// Source instruction records, by ordinal (see [`crate::il::Source`]).
    insts: Vec<InstRecord>,
}

impl FunctionBlock {
    pub fn source_inst(&self, ordinal: u32) -> Option<&InstRecord> {
        self.insts.get(ordinal as usize)
    }

    pub fn source_inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Number the function-local values of this function (after the module
    /// values), and encode everything back into a block.
    pub fn stitch(
        &self,
        program: &Program,
        compiled: Compiled,
        remapper: &mut IdRemapper,
        metadata: &MetadataRemap,
        segmented: bool,
        keep_use_lists: bool,
    ) -> Result<Block, Error> {
        if segmented {
            remapper.begin_segment();
        }

        for &param in &program.functions[self.func].params {
            remapper.allocate(param);
        }
        for part in &self.head {
            if let Part::Patched(patched) = part {
                for &value in &patched.defines {
                    remapper.allocate(value);
                }
            }
        }

        // `InstID` of every record is the id its result would get, whether
        // it has one or not.
        let mut inst_ids = Vec::with_capacity(compiled.inst_count());
        let mut blocks = FxHashMap::<BasicBlock, u64>::default();
        let mut insts = FxHashMap::<u32, u64>::default();
        let mut ordinal = 0;
        for (i, (block, records)) in compiled.blocks.iter().enumerate() {
            blocks.insert(*block, i as u64);
            for inst in records {
                inst_ids.push(remapper.next_id());
                if let Some(result) = inst.record.result {
                    remapper.allocate(result);
                }
                if let Some(source) = inst.source {
                    insts.insert(source, ordinal);
                }
                ordinal += 1;
            }
        }
        for &(value, target) in &compiled.aliases {
            remapper.alias(value, target);
        }

        let mut out = Block::new(codes::block::FUNCTION, self.uid, self.abbrev_width);
        out.elements.extend(self.abbrevs.iter().cloned());
        {
            let reloc = Relocation {
                remapper: &*remapper,
                metadata,
                blocks: Some(&blocks),
                insts: Some(&insts),
            };

            self.emit_parts(&self.head, &mut out, &reloc, blocks.len(), keep_use_lists)?;
            let records = compiled.blocks.iter().flat_map(|(_, records)| records);
            for (inst, &inst_id) in records.zip(&inst_ids) {
                out.push_record(inst.record.encode(inst_id, &reloc)?);
                for loc in &inst.record.debug_locs {
                    out.push_record(loc.encode(inst_id, &reloc)?);
                }
            }
            self.emit_parts(&self.tail, &mut out, &reloc, blocks.len(), keep_use_lists)?;
        }

        if segmented {
            remapper.end_segment();
        }
        Ok(out)
    }

    fn emit_parts(
        &self,
        parts: &[Part],
        out: &mut Block,
        reloc: &Relocation<'_>,
        block_count: usize,
        keep_use_lists: bool,
    ) -> Result<(), Error> {
        for part in parts {
            match part {
                Part::DeclareBlocks(record) => out.push_record(Record {
                    ops: [block_count as u64].into_iter().collect(),
                    ..record.clone()
                }),
                Part::Patched(patched) => out.elements.push(Element::Block(patched.apply(reloc)?)),
                Part::UseList(block) => {
                    if keep_use_lists {
                        out.elements.push(Element::Block(block.clone()));
                    }
                }
                Part::Verbatim(element) => out.elements.push(element.clone()),
            }
        }
        Ok(())
    }
}
