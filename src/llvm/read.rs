//! Low-level parsing of LLVM bitstream form.

use crate::llvm::{abbrev_id, char6, codes, AbbrevOp, Abbreviation, Bitstream, Block, Element};
use crate::llvm::{Record, BITCODE_MAGIC, TOP_LEVEL_ABBREV_WIDTH};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("bitcode has invalid size, expected at least 8 bytes, got {0}")]
    InvalidSize(usize),
    #[error("bitcode is not 32-bit aligned")]
    Misaligned,
    #[error("missing bitcode magic header")]
    MissingMagicHeader,
    #[error("unexpected end of bitcode")]
    UnexpectedEnd,
    #[error("unsupported abbreviation encoding: {0}")]
    UnsupportedAbbreviationEncoding(u64),
    #[error("malformed abbreviation definition ({0})")]
    MalformedAbbreviation(&'static str),
    #[error("unknown abbreviation ID {abbrev} in block {block}")]
    UnknownAbbreviation { block: u32, abbrev: u32 },
    #[error("block {block} length mismatch: header says {expected} words, found {found}")]
    BlockLengthMismatch {
        block: u32,
        expected: usize,
        found: usize,
    },
    #[error("`DEFINE_ABBREV` in BLOCKINFO before any `SETBID`")]
    MissingBlockInfoTarget,
    #[error("unexpected abbreviation ID {0} outside of any block")]
    UnexpectedTopLevel(u32),
}

// VBR widths of the fixed parts of the format.
const BLOCK_ID_VBR_WIDTH: u32 = 8;
const BLOCK_ABBREV_WIDTH_VBR_WIDTH: u32 = 4;
const RECORD_CODE_VBR_WIDTH: u32 = 6;
const RECORD_NUM_OPERANDS_VBR_WIDTH: u32 = 6;
const RECORD_OPERAND_VBR_WIDTH: u32 = 6;
const ABBREV_NUM_OPERANDS_VBR_WIDTH: u32 = 5;
const ABBREV_LITERAL_VBR_WIDTH: u32 = 8;
const ABBREV_ENCODING_DATA_VBR_WIDTH: u32 = 5;
const ARRAY_LENGTH_VBR_WIDTH: u32 = 6;

/// Widest `Fixed`/`Vbr` abbreviation operand (values are at most 64-bit).
const MAX_CHUNK_WIDTH: u64 = 64;

/// Bit-level reader over 32-bit words.
struct BitCursor {
    words: Vec<u32>,
    bit_len: usize,
    bit_pos: usize,
}

impl BitCursor {
    fn is_eof(&self) -> bool {
        self.bit_pos >= self.bit_len
    }

    fn read_bits(&mut self, n: u32) -> Result<u64, ReadError> {
        if n == 0 {
            return Ok(0);
        }
        if self.bit_pos + n as usize > self.bit_len {
            return Err(ReadError::UnexpectedEnd);
        }

        let mut result = 0u64;
        let mut read = 0;
        while read < n {
            let word = self.words[self.bit_pos >> 5];
            let bit_index = (self.bit_pos & 31) as u32;
            let take = (32 - bit_index).min(n - read);
            let mask = if take == 32 {
                u64::from(u32::MAX)
            } else {
                (1u64 << take) - 1
            };
            result |= ((u64::from(word) >> bit_index) & mask) << read;
            self.bit_pos += take as usize;
            read += take;
        }
        Ok(result)
    }

    fn read_vbr(&mut self, width: u32) -> Result<u64, ReadError> {
        if width == 0 {
            return Ok(0);
        }
        let continue_bit = 1u64 << (width - 1);
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let piece = self.read_bits(width)?;
            if shift < 64 {
                result |= (piece & (continue_bit - 1)) << shift;
            }
            if piece & continue_bit == 0 {
                return Ok(result);
            }
            shift += width - 1;
        }
    }

    fn align32(&mut self) -> Result<(), ReadError> {
        let remainder = self.bit_pos & 31;
        if remainder != 0 {
            self.read_bits(32 - remainder as u32)?;
        }
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, ReadError> {
        (0..len).map(|_| self.read_bits(8).map(|b| b as u8)).collect()
    }
}

struct Reader {
    cursor: BitCursor,

    /// Abbreviations registered through BLOCKINFO, per target block ID.
    block_info: FxHashMap<u32, Vec<Rc<Abbreviation>>>,

    next_uid: u32,
}

impl Reader {
    /// Read the rest of an `ENTER_SUBBLOCK` (after its abbreviation ID),
    /// and the whole block that follows it.
    fn read_subblock(&mut self) -> Result<Block, ReadError> {
        let id = self.cursor.read_vbr(BLOCK_ID_VBR_WIDTH)? as u32;
        let abbrev_width = self.cursor.read_vbr(BLOCK_ABBREV_WIDTH_VBR_WIDTH)? as u32;
        self.cursor.align32()?;
        let len_words = self.cursor.read_bits(32)? as usize;
        let start = self.cursor.bit_pos;
        if start + len_words * 32 > self.cursor.bit_len {
            return Err(ReadError::UnexpectedEnd);
        }

        let uid = self.next_uid;
        self.next_uid += 1;
        let mut block = Block::new(id, uid, abbrev_width);

        let mut abbrevs = self.block_info.get(&id).cloned().unwrap_or_default();
        let mut block_info_target = None;

        loop {
            let abbrev = self.cursor.read_bits(abbrev_width)? as u32;
            match abbrev {
                abbrev_id::END_BLOCK => {
                    self.cursor.align32()?;
                    let found = (self.cursor.bit_pos - start) / 32;
                    if found != len_words {
                        return Err(ReadError::BlockLengthMismatch {
                            block: id,
                            expected: len_words,
                            found,
                        });
                    }
                    return Ok(block);
                }
                abbrev_id::ENTER_SUBBLOCK => {
                    let sub = self.read_subblock()?;
                    block.elements.push(Element::Block(sub));
                }
                abbrev_id::DEFINE_ABBREV => {
                    let def = Rc::new(self.read_abbrev_def()?);
                    if id == codes::block::BLOCKINFO {
                        let target = block_info_target.ok_or(ReadError::MissingBlockInfoTarget)?;
                        self.block_info.entry(target).or_default().push(def.clone());
                    } else {
                        abbrevs.push(def.clone());
                    }
                    block.elements.push(Element::DefineAbbrev(def));
                }
                abbrev_id::UNABBREV_RECORD => {
                    let record = self.read_unabbrev_record()?;
                    if id == codes::block::BLOCKINFO && record.code == codes::blockinfo::SETBID {
                        block_info_target = Some(record.op(0) as u32);
                    }
                    block.push_record(record);
                }
                _ => {
                    let def = abbrevs
                        .get((abbrev - abbrev_id::FIRST_APPLICATION) as usize)
                        .cloned()
                        .ok_or(ReadError::UnknownAbbreviation { block: id, abbrev })?;
                    let mut record = self.read_abbreviated_record(&def)?;
                    record.abbrev = Some(abbrev);
                    block.push_record(record);
                }
            }
        }
    }

    fn read_abbrev_width(&mut self) -> Result<u32, ReadError> {
        match self.cursor.read_vbr(ABBREV_ENCODING_DATA_VBR_WIDTH)? {
            width if width > MAX_CHUNK_WIDTH => Err(ReadError::MalformedAbbreviation(
                "fixed/VBR width exceeds 64 bits",
            )),
            width => Ok(width as u32),
        }
    }

    fn read_abbrev_def(&mut self) -> Result<Abbreviation, ReadError> {
        let num_ops = self.cursor.read_vbr(ABBREV_NUM_OPERANDS_VBR_WIDTH)? as usize;
        let mut ops = SmallVec::with_capacity(num_ops);
        for _ in 0..num_ops {
            let is_literal = self.cursor.read_bits(1)? != 0;
            if is_literal {
                ops.push(AbbrevOp::Literal(
                    self.cursor.read_vbr(ABBREV_LITERAL_VBR_WIDTH)?,
                ));
                continue;
            }
            let op = match self.cursor.read_bits(3)? {
                AbbrevOp::ENCODING_FIXED => AbbrevOp::Fixed(self.read_abbrev_width()?),
                AbbrevOp::ENCODING_VBR => match self.read_abbrev_width()? {
                    1 => return Err(ReadError::MalformedAbbreviation("1-bit VBR")),
                    width => AbbrevOp::Vbr(width),
                },
                AbbrevOp::ENCODING_ARRAY => AbbrevOp::Array,
                AbbrevOp::ENCODING_CHAR6 => AbbrevOp::Char6,
                AbbrevOp::ENCODING_BLOB => AbbrevOp::Blob,
                other => return Err(ReadError::UnsupportedAbbreviationEncoding(other)),
            };
            ops.push(op);
        }

        // Array must be followed by exactly one (scalar) element encoding.
        if let Some(i) = ops.iter().position(|&op| op == AbbrevOp::Array) {
            if i + 2 != ops.len() {
                return Err(ReadError::MalformedAbbreviation("array not second-to-last"));
            }
            if matches!(ops[i + 1], AbbrevOp::Array | AbbrevOp::Blob) {
                return Err(ReadError::MalformedAbbreviation("non-scalar array element"));
            }
        }
        Ok(Abbreviation { ops })
    }

    fn read_unabbrev_record(&mut self) -> Result<Record, ReadError> {
        let code = self.cursor.read_vbr(RECORD_CODE_VBR_WIDTH)? as u32;
        let num_ops = self.cursor.read_vbr(RECORD_NUM_OPERANDS_VBR_WIDTH)? as usize;
        let mut record = Record::new(code, []);
        for _ in 0..num_ops {
            record
                .ops
                .push(self.cursor.read_vbr(RECORD_OPERAND_VBR_WIDTH)?);
        }
        Ok(record)
    }

    fn read_scalar(&mut self, op: AbbrevOp) -> Result<u64, ReadError> {
        match op {
            AbbrevOp::Literal(v) => Ok(v),
            AbbrevOp::Fixed(width) => self.cursor.read_bits(width),
            AbbrevOp::Vbr(width) => self.cursor.read_vbr(width),
            AbbrevOp::Char6 => Ok(char6::decode(self.cursor.read_bits(6)?)),
            AbbrevOp::Array | AbbrevOp::Blob => {
                Err(ReadError::MalformedAbbreviation("non-scalar operand"))
            }
        }
    }

    fn read_abbreviated_record(&mut self, def: &Abbreviation) -> Result<Record, ReadError> {
        let mut values: SmallVec<[u64; 8]> = SmallVec::new();
        let mut blob = None;

        let mut ops = def.ops.iter().copied();
        while let Some(op) = ops.next() {
            match op {
                AbbrevOp::Array => {
                    let elem = ops
                        .next()
                        .ok_or(ReadError::MalformedAbbreviation("array without element"))?;
                    let len = self.cursor.read_vbr(ARRAY_LENGTH_VBR_WIDTH)?;
                    for _ in 0..len {
                        values.push(self.read_scalar(elem)?);
                    }
                }
                AbbrevOp::Blob => {
                    let len = self.cursor.read_vbr(ARRAY_LENGTH_VBR_WIDTH)? as usize;
                    self.cursor.align32()?;
                    blob = Some(self.cursor.read_bytes(len)?);
                    self.cursor.align32()?;
                }
                _ => values.push(self.read_scalar(op)?),
            }
        }

        if values.is_empty() {
            return Err(ReadError::MalformedAbbreviation("no record code"));
        }
        let code = values.remove(0) as u32;
        Ok(Record {
            code,
            ops: values,
            blob,
            abbrev: None,
        })
    }
}

impl Bitstream {
    pub fn read_from_bytes(bytes: &[u8]) -> Result<Self, ReadError> {
        if bytes.len() < 8 {
            return Err(ReadError::InvalidSize(bytes.len()));
        }
        if bytes.len() % 4 != 0 {
            return Err(ReadError::Misaligned);
        }

        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words[0] != BITCODE_MAGIC {
            return Err(ReadError::MissingMagicHeader);
        }

        let bit_len = words.len() * 32;
        let mut reader = Reader {
            cursor: BitCursor {
                words,
                bit_len,
                bit_pos: 32,
            },
            block_info: FxHashMap::default(),
            next_uid: 0,
        };

        let mut blocks = vec![];
        while !reader.cursor.is_eof() {
            match reader.cursor.read_bits(TOP_LEVEL_ABBREV_WIDTH)? as u32 {
                abbrev_id::ENTER_SUBBLOCK => blocks.push(reader.read_subblock()?),
                other => return Err(ReadError::UnexpectedTopLevel(other)),
            }
        }

        Ok(Bitstream {
            magic: BITCODE_MAGIC,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(
            Bitstream::read_from_bytes(&[0; 4]),
            Err(ReadError::InvalidSize(4))
        ));
        assert!(matches!(
            Bitstream::read_from_bytes(&[0; 9]),
            Err(ReadError::Misaligned)
        ));
        assert!(matches!(
            Bitstream::read_from_bytes(&[0; 8]),
            Err(ReadError::MissingMagicHeader)
        ));
    }

    #[test]
    fn vbr_across_words() {
        // 6-bit VBR chunks: 0b1_00101 (5, continue), 0b0_00011 (3) => 5 | 3 << 5.
        let mut cursor = BitCursor {
            words: vec![0b100101 << 26, 0b000011],
            bit_len: 64,
            bit_pos: 26,
        };
        assert_eq!(cursor.read_vbr(6).unwrap(), 5 | (3 << 5));
        assert_eq!(cursor.bit_pos, 38);
    }

    #[test]
    fn truncated_block() {
        // Magic, then `ENTER_SUBBLOCK` (2 bits) for block 8 with a length
        // pointing past the end of the stream.
        let mut bytes = BITCODE_MAGIC.to_le_bytes().to_vec();
        // abbrev=1 (2 bits), id=8 (vbr8), width=3 (vbr4), aligned, then length.
        let header: u32 = 1 | (8 << 2) | (3 << 10);
        bytes.extend(header.to_le_bytes());
        bytes.extend(100u32.to_le_bytes());
        assert!(matches!(
            Bitstream::read_from_bytes(&bytes),
            Err(ReadError::UnexpectedEnd)
        ));
    }

    #[test]
    fn rejects_oversized_widths() {
        use smallvec::smallvec;

        for op in [AbbrevOp::Fixed(65), AbbrevOp::Vbr(70)] {
            let mut block = Block::new(codes::block::MODULE, 0, 3);
            block.elements.push(Element::DefineAbbrev(Rc::new(Abbreviation {
                ops: smallvec![AbbrevOp::Literal(4), op],
            })));
            let bytes = Bitstream {
                magic: BITCODE_MAGIC,
                blocks: vec![block],
            }
            .write_to_bytes()
            .unwrap();
            assert!(
                matches!(
                    Bitstream::read_from_bytes(&bytes),
                    Err(ReadError::MalformedAbbreviation(_))
                ),
                "{op:?} was accepted"
            );
        }
    }
}
