//! Value numbering: source value ids to IL values (while parsing), and IL
//! values to destination value ids (while stitching).
//!
//! LLVM numbers values module-wide first (globals, then module constants),
//! then restarts after those for each function body (arguments, function
//! constants, instructions), which both maps mirror.

use crate::dxil::Error;
use crate::il::{BasicBlock, Program, ValueId};
use crate::llvm::{Block, Element};
use rustc_hash::FxHashMap;

/// What defined a source value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Global,
    Constant,
    Argument,
    Instruction,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappedValue {
    pub value: ValueId,

    /// `None` for values only referenced so far (i.e. forward references).
    pub kind: Option<IdKind>,
}

/// Source value id to IL value map.
#[derive(Clone, Debug, Default)]
pub struct IdMap {
    values: Vec<Option<MappedValue>>,
    next: u32,
    module_bound: u32,

    /// Records left to define values with, in the block being parsed, which
    /// bounds how far ahead forward references can point.
    forward_records: u32,
}

impl IdMap {
    /// Source id the next defined value will get (`InstNum` in relative
    /// operand encodings).
    pub fn next_id(&self) -> u32 {
        self.next
    }

    pub fn define(&mut self, program: &mut Program, kind: IdKind) -> ValueId {
        let id = self.next as usize;
        self.next += 1;
        if self.values.len() <= id {
            self.values.resize(id + 1, None);
        }
        let mapped = self.values[id].get_or_insert_with(|| MappedValue {
            value: program.alloc_value(),
            kind: None,
        });
        mapped.kind = Some(kind);
        mapped.value
    }

    pub fn get(&self, source: u32) -> Option<MappedValue> {
        self.values.get(source as usize).copied().flatten()
    }

    /// IL value for `source`, reserving one if `source` is not defined yet.
    pub fn resolve(&mut self, program: &mut Program, source: u32) -> Result<ValueId, Error> {
        if let Some(mapped) = self.get(source) {
            return Ok(mapped.value);
        }
        if source >= self.next.saturating_add(self.forward_records) {
            return Err(Error::ValueOutOfRange(source.into()));
        }
        let index = source as usize;
        if self.values.len() <= index {
            self.values.resize(index + 1, None);
        }
        let value = program.alloc_value();
        self.values[index] = Some(MappedValue { value, kind: None });
        Ok(value)
    }

    /// Resolve an "absolute plus one" operand (`0` being none).
    pub fn resolve_plus_one(
        &mut self,
        program: &mut Program,
        op: u64,
    ) -> Result<Option<ValueId>, Error> {
        match op {
            0 => Ok(None),
            _ => self.resolve(program, source_id(op - 1)?).map(Some),
        }
    }

    /// Start parsing the module, defining values with (at most) `records`.
    pub fn begin_module(&mut self, records: usize) {
        self.forward_records = records.try_into().unwrap_or(u32::MAX);
    }

    /// Mark the end of module-level values, everything after is function-local.
    pub fn end_module(&mut self) {
        self.module_bound = self.next;
    }

    /// Start parsing a function body, defining values with (at most) `records`
    /// (besides its arguments).
    pub fn begin_function(&mut self, records: usize) {
        self.values.truncate(self.module_bound as usize);
        self.next = self.module_bound;
        self.forward_records = records.try_into().unwrap_or(u32::MAX);
    }
}

pub fn source_id(op: u64) -> Result<u32, Error> {
    u32::try_from(op).map_err(|_| Error::ValueOutOfRange(op))
}

/// IL value to destination value id map.
#[derive(Clone, Debug, Default)]
pub struct IdRemapper {
    dest: FxHashMap<ValueId, u32>,

    /// Values without a definition of their own, standing for another value.
    aliases: FxHashMap<ValueId, ValueId>,

    next: u32,
    segment: Option<Segment>,
}

#[derive(Clone, Debug)]
struct Segment {
    start: u32,
    values: Vec<ValueId>,
    aliases: Vec<ValueId>,
}

impl IdRemapper {
    pub fn next_id(&self) -> u32 {
        self.next
    }

    pub fn allocate(&mut self, value: ValueId) -> u32 {
        let id = self.next;
        self.next += 1;
        self.dest.insert(value, id);
        if let Some(segment) = &mut self.segment {
            segment.values.push(value);
        }
        id
    }

    pub fn alias(&mut self, value: ValueId, target: ValueId) {
        self.aliases.insert(value, target);
        if let Some(segment) = &mut self.segment {
            segment.aliases.push(value);
        }
    }

    pub fn get(&self, mut value: ValueId) -> Option<u32> {
        // NOTE(eddyb) alias chains are short (at most shader data -> handle).
        for _ in 0..8 {
            match self.aliases.get(&value) {
                Some(&target) => value = target,
                None => break,
            }
        }
        self.dest.get(&value).copied()
    }

    pub fn resolve(&self, value: ValueId) -> Result<u32, Error> {
        self.get(value).ok_or(Error::UnresolvedValue(value))
    }

    /// Start a function-local value segment, undone by `end_segment`.
    pub fn begin_segment(&mut self) {
        self.segment = Some(Segment {
            start: self.next,
            values: vec![],
            aliases: vec![],
        });
    }

    pub fn end_segment(&mut self) {
        if let Some(segment) = self.segment.take() {
            for value in segment.values {
                self.dest.remove(&value);
            }
            for value in segment.aliases {
                self.aliases.remove(&value);
            }
            self.next = segment.start;
        }
    }
}

/// Metadata id remapping, after the module metadata block got reshaped
/// (ids past the module's own metadata, i.e. function-local ones, shift).
#[derive(Clone, Debug, Default)]
pub struct MetadataRemap {
    /// New id of each old module metadata id, empty for the identity.
    table: Vec<u32>,
    old_count: u32,
    new_count: u32,
}

impl MetadataRemap {
    pub fn new(table: Vec<u32>, old_count: u32, new_count: u32) -> Self {
        MetadataRemap {
            table,
            old_count,
            new_count,
        }
    }

    /// Remap a (0-based) metadata id.
    pub fn map(&self, id: u64) -> u64 {
        if self.table.is_empty() {
            return id;
        }
        match usize::try_from(id).ok().and_then(|i| self.table.get(i)) {
            Some(&new) => new.into(),
            None => id - u64::from(self.old_count) + u64::from(self.new_count),
        }
    }

    /// Remap a 1-based metadata id, with `0` meaning none.
    pub fn map_plus_one(&self, id: u64) -> u64 {
        match id {
            0 => 0,
            _ => self.map(id - 1) + 1,
        }
    }
}

/// Everything needed to turn IL references back into record operands.
pub struct Relocation<'a> {
    pub remapper: &'a IdRemapper,
    pub metadata: &'a MetadataRemap,

    /// Position of each basic block, in the function being stitched.
    pub blocks: Option<&'a FxHashMap<BasicBlock, u64>>,

    /// Destination ordinal of each source instruction ordinal.
    pub insts: Option<&'a FxHashMap<u32, u64>>,
}

impl Relocation<'_> {
    pub fn value(&self, value: ValueId) -> Result<u32, Error> {
        self.remapper.resolve(value)
    }

    pub fn block(&self, block: BasicBlock) -> Result<u64, Error> {
        self.blocks
            .and_then(|blocks| blocks.get(&block))
            .copied()
            .ok_or(Error::UnresolvedBlock)
    }

    pub fn inst(&self, ordinal: u32) -> Result<u64, Error> {
        self.insts
            .and_then(|insts| insts.get(&ordinal))
            .copied()
            .ok_or(Error::UnresolvedInstruction(ordinal))
    }
}

/// What a patched record operand refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PatchTarget {
    /// Absolute value id.
    Value(ValueId),

    /// Absolute value id plus one.
    ValuePlusOne(ValueId),

    BasicBlock(BasicBlock),

    /// Instruction ordinal (in its function), as used by attachments.
    Inst(u32),

    /// Metadata id (0-based).
    Metadata(u64),

    /// Metadata id plus one (`0` being none).
    MetadataPlusOne(u64),
}

/// One record operand to rewrite while stitching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Ordinal of the record, among the records of its block.
    pub record: usize,
    pub op: usize,
    pub target: PatchTarget,
}

impl Patch {
    pub fn value(record: usize, op: usize, value: ValueId) -> Self {
        Patch {
            record,
            op,
            target: PatchTarget::Value(value),
        }
    }
}

/// Rewrite every patched operand of the records (directly) in `block`.
pub fn apply_patches(
    block: &mut Block,
    patches: &[Patch],
    reloc: &Relocation<'_>,
) -> Result<(), Error> {
    if patches.is_empty() {
        return Ok(());
    }

    let mut records: Vec<_> = block
        .elements
        .iter_mut()
        .filter_map(|e| match e {
            Element::Record(r) => Some(r),
            _ => None,
        })
        .collect();

    for patch in patches {
        let value = match patch.target {
            PatchTarget::Value(v) => reloc.value(v)?.into(),
            PatchTarget::ValuePlusOne(v) => u64::from(reloc.value(v)?) + 1,
            PatchTarget::BasicBlock(bb) => reloc.block(bb)?,
            PatchTarget::Inst(i) => reloc.inst(i)?,
            PatchTarget::Metadata(id) => reloc.metadata.map(id),
            PatchTarget::MetadataPlusOne(id) => reloc.metadata.map_plus_one(id),
        };
        let op = records
            .get_mut(patch.record)
            .and_then(|r| r.ops.get_mut(patch.op))
            .ok_or(Error::MalformedRecord {
                block: "patched",
                code: 0,
            })?;
        *op = value;
    }
    Ok(())
}

/// A block kept mostly verbatim, but with value-referencing operands
/// tracked, and the values it defines (in order), if any.
#[derive(Clone, Debug)]
pub struct PatchedBlock {
    pub block: Block,
    pub patches: Vec<Patch>,
    pub defines: Vec<ValueId>,
}

impl PatchedBlock {
    pub fn new(block: Block) -> Self {
        PatchedBlock {
            block,
            patches: vec![],
            defines: vec![],
        }
    }

    pub fn apply(&self, reloc: &Relocation<'_>) -> Result<Block, Error> {
        let mut block = self.block.clone();
        apply_patches(&mut block, &self.patches, reloc)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::rc::Rc;

    #[test]
    fn forward_references_are_reserved() {
        let mut program = Program::new(Rc::new(Context::new()));
        let mut map = IdMap::default();
        map.begin_module(3);

        let global = map.define(&mut program, IdKind::Global);
        let forward = map.resolve(&mut program, 2).unwrap();
        let constant = map.define(&mut program, IdKind::Constant);
        let defined = map.define(&mut program, IdKind::Constant);
        assert_eq!(forward, defined);
        assert_ne!(constant, defined);
        assert_eq!(map.get(0).unwrap().value, global);
        assert_eq!(map.get(2).unwrap().kind, Some(IdKind::Constant));
        assert!(map.resolve(&mut program, u32::MAX).is_err());

        map.end_module();
        map.begin_function(1);
        let arg = map.define(&mut program, IdKind::Argument);
        assert_eq!(map.next_id(), 4);
        map.begin_function(1);
        let other_arg = map.define(&mut program, IdKind::Argument);
        assert_ne!(arg, other_arg);
        assert_eq!(map.get(3).unwrap().value, other_arg);
    }

    #[test]
    fn forward_references_are_bounded_by_records() {
        let mut program = Program::new(Rc::new(Context::new()));
        let mut map = IdMap::default();
        map.begin_module(2);
        map.define(&mut program, IdKind::Global);

        assert!(map.resolve(&mut program, 2).is_ok());
        assert!(matches!(
            map.resolve(&mut program, 3),
            Err(Error::ValueOutOfRange(3))
        ));
        assert!(map.resolve(&mut program, 1 << 23).is_err());
        assert!(map.get(3).is_none());

        map.end_module();
        map.begin_function(0);
        assert!(map.resolve(&mut program, 1).is_err());
        assert!(map.resolve(&mut program, 0).is_ok());
    }

    #[test]
    fn segments_roll_back() {
        let mut program = Program::new(Rc::new(Context::new()));
        let global = program.alloc_value();
        let local = program.alloc_value();
        let alias = program.alloc_value();

        let mut remapper = IdRemapper::default();
        assert_eq!(remapper.allocate(global), 0);

        remapper.begin_segment();
        assert_eq!(remapper.allocate(local), 1);
        remapper.alias(alias, local);
        assert_eq!(remapper.get(alias), Some(1));
        remapper.end_segment();

        assert_eq!(remapper.get(local), None);
        assert_eq!(remapper.get(alias), None);
        assert_eq!(remapper.next_id(), 1);
        assert_eq!(remapper.resolve(global).unwrap(), 0);
    }

    #[test]
    fn metadata_remap_shifts_function_ids() {
        assert_eq!(MetadataRemap::default().map(7), 7);

        // Module metadata `0 1 2` got reordered to `2 0 1`, and grew by 2.
        let remap = MetadataRemap::new(vec![2, 0, 1], 3, 5);
        assert_eq!(remap.map(0), 2);
        assert_eq!(remap.map_plus_one(2), 1);
        assert_eq!(remap.map_plus_one(0), 0);
        assert_eq!(remap.map(3), 5);
    }
}
