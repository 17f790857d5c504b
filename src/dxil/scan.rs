//! Physical block scanner: classifies the blocks of the LLVM module, so that
//! each can be parsed, compiled and stitched independently.

use crate::dxil::Error;
use crate::llvm::{codes, Bitstream, Block, Element, Record, WriteError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PhysicalBlockKind {
    Identification,
    Module,
    ParameterAttributes,
    ParameterAttributeGroups,
    Types,
    Constants,
    Metadata,
    MetadataKinds,
    Function,
    ValueSymbolTable,
    OperandBundleTags,
    UseList,
    StringTable,
    SymbolTable,
    Unknown,
}

impl PhysicalBlockKind {
    pub fn from_block_id(id: u32) -> Self {
        use PhysicalBlockKind::*;
        match id {
            codes::block::IDENTIFICATION => Identification,
            codes::block::MODULE => Module,
            codes::block::PARAMATTR => ParameterAttributes,
            codes::block::PARAMATTR_GROUP => ParameterAttributeGroups,
            codes::block::TYPE_NEW => Types,
            codes::block::CONSTANTS => Constants,
            codes::block::METADATA => Metadata,
            codes::block::METADATA_KIND => MetadataKinds,
            codes::block::FUNCTION => Function,
            codes::block::VALUE_SYMTAB => ValueSymbolTable,
            codes::block::OPERAND_BUNDLE_TAGS => OperandBundleTags,
            codes::block::USELIST => UseList,
            codes::block::STRTAB => StringTable,
            codes::block::SYMTAB => SymbolTable,
            _ => Unknown,
        }
    }
}

/// Location of one classified block: index of the top-level block, and
/// index of the element inside the `MODULE` block (for second-level ones).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhysicalBlock {
    pub kind: PhysicalBlockKind,
    pub uid: u32,
    pub element: usize,
}

/// The scanned bitstream, owning it until it's written back out.
#[derive(Clone, Debug)]
pub struct PhysicalBlockScan {
    pub bitstream: Bitstream,

    /// Index of the `MODULE` block among the top-level blocks.
    module: usize,

    /// Second-level blocks (i.e. direct children of `MODULE`), in order.
    blocks: Vec<PhysicalBlock>,
}

impl PhysicalBlockScan {
    pub fn scan(bitstream: Bitstream) -> Result<Self, Error> {
        let module = bitstream
            .blocks
            .iter()
            .position(|b| b.id == codes::block::MODULE)
            .ok_or(Error::MissingModule)?;

        let blocks = bitstream.blocks[module]
            .elements
            .iter()
            .enumerate()
            .filter_map(|(element, e)| match e {
                Element::Block(b) => Some(PhysicalBlock {
                    kind: PhysicalBlockKind::from_block_id(b.id),
                    uid: b.uid,
                    element,
                }),
                _ => None,
            })
            .collect();

        Ok(PhysicalBlockScan {
            bitstream,
            module,
            blocks,
        })
    }

    pub fn module(&self) -> &Block {
        &self.bitstream.blocks[self.module]
    }

    pub fn module_mut(&mut self) -> &mut Block {
        &mut self.bitstream.blocks[self.module]
    }

    pub fn blocks(&self) -> &[PhysicalBlock] {
        &self.blocks
    }

    fn block_at(&self, element: usize) -> Option<&Block> {
        match self.module().elements.get(element)? {
            Element::Block(b) => Some(b),
            _ => None,
        }
    }

    /// First physical block of `kind`, if any.
    pub fn get(&self, kind: PhysicalBlockKind) -> Option<&Block> {
        let found = self.blocks.iter().find(|b| b.kind == kind)?;
        self.block_at(found.element)
    }

    /// All physical blocks of `kind`, in order (e.g. function bodies).
    pub fn all(&self, kind: PhysicalBlockKind) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(move |b| b.kind == kind)
            .filter_map(|b| self.block_at(b.element))
    }

    /// Replace the contents of the physical block `uid`.
    pub fn replace(&mut self, uid: u32, block: Block) -> Result<(), Error> {
        let element = self
            .blocks
            .iter()
            .find(|b| b.uid == uid)
            .ok_or(Error::MissingBlock(uid))?
            .element;
        match self.module_mut().elements.get_mut(element) {
            Some(Element::Block(b)) => {
                *b = block;
                Ok(())
            }
            _ => Err(Error::MissingBlock(uid)),
        }
    }

    /// Insert a new second-level block, before the first block of any of
    /// `before` kinds (or at the end), returning its uid.
    pub fn insert(&mut self, mut block: Block, before: &[PhysicalBlockKind]) -> u32 {
        let uid = self.max_uid() + 1;
        block.uid = uid;
        let kind = PhysicalBlockKind::from_block_id(block.id);

        let module_len = self.module().elements.len();
        let element = self
            .blocks
            .iter()
            .find(|b| before.contains(&b.kind))
            .map_or(module_len, |b| b.element);
        self.module_mut()
            .elements
            .insert(element, Element::Block(block));

        for b in &mut self.blocks {
            if b.element >= element {
                b.element += 1;
            }
        }
        let at = self
            .blocks
            .iter()
            .position(|b| b.element > element)
            .unwrap_or(self.blocks.len());
        self.blocks.insert(at, PhysicalBlock { kind, uid, element });
        uid
    }

    /// Insert a record directly into the `MODULE` block, at `element`.
    pub fn insert_module_record(&mut self, element: usize, record: Record) {
        self.module_mut()
            .elements
            .insert(element, Element::Record(record));
        for b in &mut self.blocks {
            if b.element >= element {
                b.element += 1;
            }
        }
    }

    /// Remove every second-level block of `kind`.
    pub fn remove_all(&mut self, kind: PhysicalBlockKind) {
        let mut removed = 0;
        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.retain_mut(|b| {
            b.element -= removed;
            if b.kind != kind {
                return true;
            }
            self.bitstream.blocks[self.module].elements.remove(b.element);
            removed += 1;
            false
        });
        self.blocks = blocks;
    }

    fn max_uid(&self) -> u32 {
        self.bitstream
            .blocks
            .iter()
            .map(Block::max_uid)
            .max()
            .unwrap_or(0)
    }

    pub fn write(&self) -> Result<Vec<u8>, WriteError> {
        self.bitstream.write_to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llvm::BITCODE_MAGIC;

    fn stream() -> Bitstream {
        let mut module = Block::new(codes::block::MODULE, 1, 3);
        module.push_record(Record::new(codes::module::VERSION, [1]));
        module
            .elements
            .push(Element::Block(Block::new(codes::block::TYPE_NEW, 2, 4)));
        module
            .elements
            .push(Element::Block(Block::new(codes::block::FUNCTION, 3, 4)));
        module
            .elements
            .push(Element::Block(Block::new(codes::block::FUNCTION, 4, 4)));
        Bitstream {
            magic: BITCODE_MAGIC,
            blocks: vec![
                Block::new(codes::block::IDENTIFICATION, 0, 5),
                module,
            ],
        }
    }

    #[test]
    fn classifies_and_inserts() {
        let mut scan = PhysicalBlockScan::scan(stream()).unwrap();
        assert_eq!(scan.all(PhysicalBlockKind::Function).count(), 2);
        assert_eq!(scan.get(PhysicalBlockKind::Types).unwrap().uid, 2);
        assert!(scan.get(PhysicalBlockKind::Constants).is_none());

        let uid = scan.insert(
            Block::new(codes::block::CONSTANTS, 0, 4),
            &[PhysicalBlockKind::Metadata, PhysicalBlockKind::Function],
        );
        assert_eq!(uid, 5);
        let kinds: Vec<_> = scan.blocks().iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            [
                PhysicalBlockKind::Types,
                PhysicalBlockKind::Constants,
                PhysicalBlockKind::Function,
                PhysicalBlockKind::Function,
            ]
        );
        assert_eq!(scan.get(PhysicalBlockKind::Constants).unwrap().uid, 5);
        assert_eq!(scan.all(PhysicalBlockKind::Function).count(), 2);

        scan.insert_module_record(1, Record::new(codes::module::FUNCTION, [0, 0, 1]));
        assert_eq!(scan.get(PhysicalBlockKind::Types).unwrap().uid, 2);
        assert_eq!(scan.module().records().count(), 2);

        scan.remove_all(PhysicalBlockKind::Constants);
        assert!(scan.get(PhysicalBlockKind::Constants).is_none());
        assert_eq!(scan.all(PhysicalBlockKind::Function).count(), 2);
        assert_eq!(scan.module().blocks().count(), 3);
    }

    #[test]
    fn missing_module_is_an_error() {
        let stream = Bitstream {
            magic: BITCODE_MAGIC,
            blocks: vec![],
        };
        assert!(matches!(
            PhysicalBlockScan::scan(stream),
            Err(Error::MissingModule)
        ));
    }
}
