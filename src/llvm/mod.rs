//! LLVM bitstream container: blocks, records and abbreviations.
//!
//! This is the generic layer underneath DXIL: it knows nothing about what
//! the records *mean*, only how they are encoded, so that [`read`] and
//! [`write`] can round-trip a stream bit-exactly (as long as nothing changes).

use smallvec::SmallVec;
use std::rc::Rc;

pub mod codes;
pub mod read;
pub mod write;

pub use read::ReadError;
pub use write::WriteError;

/// Magic number at the start of every LLVM bitcode stream (`BC` `0xC0DE`).
pub const BITCODE_MAGIC: u32 = 0xdec0_4342;

/// Abbreviation ID width used outside of any block.
pub const TOP_LEVEL_ABBREV_WIDTH: u32 = 2;

/// Builtin abbreviation IDs, valid in every block.
pub mod abbrev_id {
    pub const END_BLOCK: u32 = 0;
    pub const ENTER_SUBBLOCK: u32 = 1;
    pub const DEFINE_ABBREV: u32 = 2;
    pub const UNABBREV_RECORD: u32 = 3;

    /// First abbreviation ID assigned to `DEFINE_ABBREV`s (BLOCKINFO ones first).
    pub const FIRST_APPLICATION: u32 = 4;
}

/// Whole decoded bitstream (everything after the magic number).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitstream {
    pub magic: u32,
    pub blocks: Vec<Block>,
}

impl Bitstream {
    pub fn find_block(&self, id: u32) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn find_block_mut(&mut self, id: u32) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }
}

/// A block, with its contents kept in encoding order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Block ID, as encoded in `ENTER_SUBBLOCK` (see [`codes::block`]).
    pub id: u32,

    /// Unique (per stream) identifier, assigned in reading order, used to
    /// find the same block again after the stream has been reshaped.
    pub uid: u32,

    /// Width of abbreviation IDs inside this block.
    pub abbrev_width: u32,

    pub elements: Vec<Element>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Element {
    Block(Block),
    Record(Record),

    /// `DEFINE_ABBREV`, kept in place so that abbreviation IDs of later
    /// records keep their meaning.
    DefineAbbrev(Rc<Abbreviation>),
}

impl Block {
    pub fn new(id: u32, uid: u32, abbrev_width: u32) -> Self {
        Block {
            id,
            uid,
            abbrev_width,
            elements: vec![],
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.elements.iter().filter_map(|e| match e {
            Element::Record(r) => Some(r),
            _ => None,
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.elements.iter().filter_map(|e| match e {
            Element::Block(b) => Some(b),
            _ => None,
        })
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.elements.iter_mut().filter_map(|e| match e {
            Element::Block(b) => Some(b),
            _ => None,
        })
    }

    pub fn find_block(&self, id: u32) -> Option<&Block> {
        self.blocks().find(|b| b.id == id)
    }

    pub fn find_block_mut(&mut self, id: u32) -> Option<&mut Block> {
        self.blocks_mut().find(|b| b.id == id)
    }

    /// Find a (possibly nested) block by its `uid`.
    pub fn find_uid_mut(&mut self, uid: u32) -> Option<&mut Block> {
        if self.uid == uid {
            return Some(self);
        }
        self.blocks_mut().find_map(|b| b.find_uid_mut(uid))
    }

    pub fn push_record(&mut self, record: Record) {
        self.elements.push(Element::Record(record));
    }

    /// Number of records in this block and all nested blocks.
    pub fn record_count(&self) -> usize {
        self.records().count() + self.blocks().map(Block::record_count).sum::<usize>()
    }

    /// Largest `uid` used by this block or any nested block.
    pub fn max_uid(&self) -> u32 {
        self.blocks().map(Block::max_uid).fold(self.uid, u32::max)
    }
}

/// A record, with all of its scalar/array operands flattened into `ops`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub code: u32,
    pub ops: SmallVec<[u64; 8]>,
    pub blob: Option<Vec<u8>>,

    /// Abbreviation this record was read with, if any; the writer tries to
    /// reuse it, and falls back to `UNABBREV_RECORD` if the record no longer
    /// fits (see [`Abbreviation::fits`]), or to any other fitting
    /// abbreviation for records with a blob.
    pub abbrev: Option<u32>,
}

impl Record {
    pub fn new(code: u32, ops: impl IntoIterator<Item = u64>) -> Self {
        Record {
            code,
            ops: ops.into_iter().collect(),
            blob: None,
            abbrev: None,
        }
    }

    /// Operand `i`, or `0` if there aren't that many operands.
    pub fn op(&self, i: usize) -> u64 {
        self.ops.get(i).copied().unwrap_or(0)
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Interpret operands `start..` as a (byte) string, as used by name records.
    pub fn ops_as_string(&self, start: usize) -> String {
        self.ops
            .get(start..)
            .unwrap_or(&[])
            .iter()
            .map(|&c| c as u8 as char)
            .collect()
    }

    /// Cursor-style reader over the operands of this record.
    pub fn reader(&self) -> RecordReader<'_> {
        RecordReader {
            record: self,
            offset: 0,
        }
    }
}

/// Sequential operand reader, for records whose layout depends on
/// previously read operands.
pub struct RecordReader<'a> {
    record: &'a Record,
    offset: usize,
}

impl RecordReader<'_> {
    pub fn any(&self) -> bool {
        self.offset < self.record.ops.len()
    }

    pub fn remaining(&self) -> usize {
        self.record.ops.len().saturating_sub(self.offset)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn consume(&mut self) -> Option<u64> {
        let op = self.record.ops.get(self.offset).copied()?;
        self.offset += 1;
        Some(op)
    }

    /// Like `consume`, but yields `default` for a missing (trailing) operand.
    pub fn consume_or(&mut self, default: u64) -> u64 {
        self.consume().unwrap_or(default)
    }
}

/// Operand encoding in an abbreviation definition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AbbrevOp {
    Literal(u64),
    Fixed(u32),
    Vbr(u32),

    /// Array of the element encoding following it (always the second-to-last op).
    Array,

    Char6,
    Blob,
}

impl AbbrevOp {
    pub const ENCODING_FIXED: u64 = 1;
    pub const ENCODING_VBR: u64 = 2;
    pub const ENCODING_ARRAY: u64 = 3;
    pub const ENCODING_CHAR6: u64 = 4;
    pub const ENCODING_BLOB: u64 = 5;

    /// Whether `value` can be encoded by this (scalar) operand encoding.
    pub fn accepts(self, value: u64) -> bool {
        match self {
            AbbrevOp::Literal(lit) => lit == value,
            AbbrevOp::Fixed(0) | AbbrevOp::Vbr(0) => value == 0,
            AbbrevOp::Fixed(width) => width >= 64 || value >> width == 0,
            AbbrevOp::Vbr(_) => true,
            AbbrevOp::Char6 => char6::encode(value).is_some(),
            AbbrevOp::Array | AbbrevOp::Blob => false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Abbreviation {
    pub ops: SmallVec<[AbbrevOp; 8]>,
}

impl Abbreviation {
    /// Whether `record` can be encoded with this abbreviation, i.e. every
    /// literal matches, every fixed-width field is wide enough, and the
    /// operand count agrees with the (possibly array/blob-terminated) layout.
    pub fn fits(&self, record: &Record) -> bool {
        let Some((&code_op, rest)) = self.ops.split_first() else {
            return false;
        };
        if !code_op.accepts(u64::from(record.code)) {
            return false;
        }

        let mut ops = record.ops.iter().copied();
        let mut rest = rest.iter().copied();
        while let Some(op) = rest.next() {
            match op {
                AbbrevOp::Array => {
                    let Some(elem) = rest.next() else {
                        return false;
                    };
                    return record.blob.is_none() && ops.all(|v| elem.accepts(v));
                }
                AbbrevOp::Blob => {
                    return record.blob.is_some() && ops.next().is_none();
                }
                _ => match ops.next() {
                    Some(v) if op.accepts(v) => {}
                    _ => return false,
                },
            }
        }
        record.blob.is_none() && ops.next().is_none()
    }
}

/// 6-bit character encoding (`[a-zA-Z0-9._]`).
pub mod char6 {
    pub fn encode(c: u64) -> Option<u64> {
        let c = u8::try_from(c).ok()?;
        Some(match c {
            b'a'..=b'z' => c - b'a',
            b'A'..=b'Z' => c - b'A' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'.' => 62,
            b'_' => 63,
            _ => return None,
        } as u64)
    }

    pub fn decode(v: u64) -> u64 {
        (match v & 63 {
            v @ 0..=25 => b'a' + v as u8,
            v @ 26..=51 => b'A' + (v as u8 - 26),
            v @ 52..=61 => b'0' + (v as u8 - 52),
            62 => b'.',
            _ => b'_',
        }) as u64
    }
}

/// Sign-rotated integers (sign in the lowest bit), as used by constants
/// and `phi` operands.
pub mod signed {
    pub fn encode(v: i64) -> u64 {
        if v >= 0 {
            (v as u64) << 1
        } else {
            (v.unsigned_abs() << 1) | 1
        }
    }

    pub fn decode(v: u64) -> i64 {
        match v {
            // NOTE(eddyb) `-0` is how `i64::MIN` is written.
            1 => i64::MIN,
            _ if v & 1 == 0 => (v >> 1) as i64,
            _ => -((v >> 1) as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn signed_rotation() {
        assert_eq!(signed::encode(0), 0);
        assert_eq!(signed::encode(3), 6);
        assert_eq!(signed::encode(-3), 7);
        assert_eq!(signed::decode(7), -3);
        assert_eq!(signed::decode(1), i64::MIN);
        assert_eq!(signed::encode(i64::MIN), 1);
    }

    #[test]
    fn char6_table() {
        for c in b"azAZ09._".iter().copied() {
            let e = char6::encode(c as u64).unwrap();
            assert_eq!(char6::decode(e), c as u64);
        }
        assert_eq!(char6::encode(b'-' as u64), None);
    }

    #[test]
    fn abbreviation_fit() {
        let abbrev = Abbreviation {
            ops: smallvec![
                AbbrevOp::Literal(7),
                AbbrevOp::Fixed(3),
                AbbrevOp::Array,
                AbbrevOp::Char6
            ],
        };

        let mut record = Record::new(7, [5, b'a' as u64, b'Z' as u64]);
        assert!(abbrev.fits(&record));

        // Fixed field too narrow.
        record.ops[0] = 8;
        assert!(!abbrev.fits(&record));

        // Wrong code.
        record.ops[0] = 1;
        record.code = 6;
        assert!(!abbrev.fits(&record));

        // Non-char6 character in the array.
        let record = Record::new(7, [1, b'-' as u64]);
        assert!(!abbrev.fits(&record));
    }
}
