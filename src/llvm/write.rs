//! Low-level emission of LLVM bitstream form.

use crate::llvm::{abbrev_id, char6, codes, AbbrevOp, Abbreviation, Bitstream, Block, Element};
use crate::llvm::{Record, TOP_LEVEL_ABBREV_WIDTH};
use rustc_hash::FxHashMap;
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("record (code {code}) in block {block} has a blob, but no abbreviation fits it")]
    UnencodableBlob { block: u32, code: u32 },
}

/// Bit-level emitter producing 32-bit (little-endian) words.
#[derive(Default)]
struct BitWriter {
    words: Vec<u32>,
    cur: u64,
    cur_bits: u32,
}

impl BitWriter {
    fn emit(&mut self, value: u64, width: u32) {
        if width > 32 {
            self.emit(value & u64::from(u32::MAX), 32);
            self.emit(value >> 32, width - 32);
            return;
        }
        if width == 0 {
            return;
        }

        let value = value & ((1u64 << width) - 1);
        self.cur |= value << self.cur_bits;
        self.cur_bits += width;
        if self.cur_bits >= 32 {
            self.words.push(self.cur as u32);
            self.cur >>= 32;
            self.cur_bits -= 32;
        }
    }

    fn emit_vbr(&mut self, mut value: u64, width: u32) {
        if width == 0 {
            return;
        }
        let threshold = 1u64 << (width - 1);
        while value >= threshold {
            self.emit((value & (threshold - 1)) | threshold, width);
            value >>= width - 1;
        }
        self.emit(value, width);
    }

    fn align32(&mut self) {
        if self.cur_bits > 0 {
            self.words.push(self.cur as u32);
            self.cur = 0;
            self.cur_bits = 0;
        }
    }
}

struct Writer {
    out: BitWriter,

    /// Abbreviations registered through BLOCKINFO, per target block ID.
    block_info: FxHashMap<u32, Vec<Rc<Abbreviation>>>,
}

impl Writer {
    fn write_block(&mut self, block: &Block, outer_width: u32) -> Result<(), WriteError> {
        let width = block.abbrev_width;

        self.out.emit(abbrev_id::ENTER_SUBBLOCK.into(), outer_width);
        self.out.emit_vbr(block.id.into(), 8);
        self.out.emit_vbr(width.into(), 4);
        self.out.align32();
        let len_index = self.out.words.len();
        self.out.emit(0, 32);

        let mut abbrevs = self
            .block_info
            .get(&block.id)
            .cloned()
            .unwrap_or_default();
        let mut block_info_target = None;

        for element in &block.elements {
            match element {
                Element::Block(sub) => self.write_block(sub, width)?,
                Element::DefineAbbrev(def) => {
                    self.out.emit(abbrev_id::DEFINE_ABBREV.into(), width);
                    self.write_abbrev_def(def);
                    if block.id == codes::block::BLOCKINFO {
                        // NOTE(eddyb) a missing `SETBID` was already rejected
                        // by the reader, so there is nothing to register to.
                        if let Some(target) = block_info_target {
                            self.block_info
                                .entry(target)
                                .or_default()
                                .push(def.clone());
                        }
                    } else {
                        abbrevs.push(def.clone());
                    }
                }
                Element::Record(record) => {
                    if block.id == codes::block::BLOCKINFO
                        && record.code == codes::blockinfo::SETBID
                    {
                        block_info_target = Some(record.op(0) as u32);
                    }
                    self.write_record(block.id, record, &abbrevs, width)?;
                }
            }
        }

        self.out.emit(abbrev_id::END_BLOCK.into(), width);
        self.out.align32();
        self.out.words[len_index] = (self.out.words.len() - len_index - 1) as u32;
        Ok(())
    }

    fn write_abbrev_def(&mut self, def: &Abbreviation) {
        self.out.emit_vbr(def.ops.len() as u64, 5);
        for &op in &def.ops {
            match op {
                AbbrevOp::Literal(value) => {
                    self.out.emit(1, 1);
                    self.out.emit_vbr(value, 8);
                }
                AbbrevOp::Fixed(width) => {
                    self.out.emit(0, 1);
                    self.out.emit(AbbrevOp::ENCODING_FIXED, 3);
                    self.out.emit_vbr(width.into(), 5);
                }
                AbbrevOp::Vbr(width) => {
                    self.out.emit(0, 1);
                    self.out.emit(AbbrevOp::ENCODING_VBR, 3);
                    self.out.emit_vbr(width.into(), 5);
                }
                AbbrevOp::Array => {
                    self.out.emit(0, 1);
                    self.out.emit(AbbrevOp::ENCODING_ARRAY, 3);
                }
                AbbrevOp::Char6 => {
                    self.out.emit(0, 1);
                    self.out.emit(AbbrevOp::ENCODING_CHAR6, 3);
                }
                AbbrevOp::Blob => {
                    self.out.emit(0, 1);
                    self.out.emit(AbbrevOp::ENCODING_BLOB, 3);
                }
            }
        }
    }

    fn write_record(
        &mut self,
        block_id: u32,
        record: &Record,
        abbrevs: &[Rc<Abbreviation>],
        width: u32,
    ) -> Result<(), WriteError> {
        if let Some(id) = record.abbrev {
            let def = id
                .checked_sub(abbrev_id::FIRST_APPLICATION)
                .and_then(|i| abbrevs.get(i as usize));
            if let Some(def) = def.filter(|def| def.fits(record)) {
                self.out.emit(id.into(), width);
                self.write_abbreviated_record(def, record);
                return Ok(());
            }
        }

        // NOTE(eddyb) unabbreviated records have no blob encoding, so blobs
        // need some other abbreviation (with an ID representable in `width`).
        if record.blob.is_some() {
            let max_id = if width >= 32 {
                u32::MAX
            } else {
                (1 << width) - 1
            };
            let (def, id) = abbrevs
                .iter()
                .zip(abbrev_id::FIRST_APPLICATION..)
                .find(|&(def, id)| id <= max_id && def.fits(record))
                .ok_or(WriteError::UnencodableBlob {
                    block: block_id,
                    code: record.code,
                })?;
            self.out.emit(id.into(), width);
            self.write_abbreviated_record(def, record);
            return Ok(());
        }

        self.out.emit(abbrev_id::UNABBREV_RECORD.into(), width);
        self.out.emit_vbr(record.code.into(), 6);
        self.out.emit_vbr(record.ops.len() as u64, 6);
        for &op in &record.ops {
            self.out.emit_vbr(op, 6);
        }
        Ok(())
    }

    fn write_scalar(&mut self, op: AbbrevOp, value: u64) {
        match op {
            AbbrevOp::Literal(_) => {}
            AbbrevOp::Fixed(width) => self.out.emit(value, width),
            AbbrevOp::Vbr(width) => self.out.emit_vbr(value, width),
            AbbrevOp::Char6 => self.out.emit(char6::encode(value).unwrap_or(0), 6),
            AbbrevOp::Array | AbbrevOp::Blob => unreachable!("non-scalar abbreviation operand"),
        }
    }

    /// Emit `record` with `def`, which must `fit` it.
    fn write_abbreviated_record(&mut self, def: &Abbreviation, record: &Record) {
        let mut abbrev_ops = def.ops.iter().copied();
        if let Some(code_op) = abbrev_ops.next() {
            self.write_scalar(code_op, record.code.into());
        }

        let mut values = record.ops.iter().copied();
        while let Some(op) = abbrev_ops.next() {
            match op {
                AbbrevOp::Array => {
                    let elem = abbrev_ops.next().unwrap_or(AbbrevOp::Vbr(6));
                    let rest: Vec<u64> = values.by_ref().collect();
                    self.out.emit_vbr(rest.len() as u64, 6);
                    for value in rest {
                        self.write_scalar(elem, value);
                    }
                }
                AbbrevOp::Blob => {
                    let blob = record.blob.as_deref().unwrap_or(&[]);
                    self.out.emit_vbr(blob.len() as u64, 6);
                    self.out.align32();
                    for &byte in blob {
                        self.out.emit(byte.into(), 8);
                    }
                    self.out.align32();
                }
                _ => {
                    let value = values.next().unwrap_or(0);
                    self.write_scalar(op, value);
                }
            }
        }
    }
}

impl Bitstream {
    pub fn write_to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut writer = Writer {
            out: BitWriter::default(),
            block_info: FxHashMap::default(),
        };
        writer.out.emit(self.magic.into(), 32);
        for block in &self.blocks {
            writer.write_block(block, TOP_LEVEL_ABBREV_WIDTH)?;
        }
        writer.out.align32();

        Ok(writer
            .out
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llvm::BITCODE_MAGIC;
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    fn sample() -> Bitstream {
        let info_abbrev = Rc::new(Abbreviation {
            ops: smallvec![AbbrevOp::Literal(4), AbbrevOp::Vbr(6), AbbrevOp::Fixed(3)],
        });
        let name_abbrev = Rc::new(Abbreviation {
            ops: smallvec![AbbrevOp::Fixed(4), AbbrevOp::Array, AbbrevOp::Char6],
        });
        let blob_abbrev = Rc::new(Abbreviation {
            ops: smallvec![AbbrevOp::Literal(9), AbbrevOp::Blob],
        });

        let mut block_info = Block::new(codes::block::BLOCKINFO, 1, 2);
        block_info.push_record(Record::new(codes::blockinfo::SETBID, [codes::block::TYPE_NEW as u64]));
        block_info.elements.push(Element::DefineAbbrev(info_abbrev));

        let mut types = Block::new(codes::block::TYPE_NEW, 2, 4);
        types.elements.push(Element::DefineAbbrev(name_abbrev));
        types.elements.push(Element::DefineAbbrev(blob_abbrev));
        types.push_record(Record {
            abbrev: Some(4),
            ..Record::new(4, [1000, 5])
        });
        types.push_record(Record {
            abbrev: Some(5),
            ..Record::new(3, b"dx.op_Foo".iter().map(|&c| c as u64))
        });
        types.push_record(Record {
            abbrev: Some(6),
            blob: Some(b"hello".to_vec()),
            ..Record::new(9, [])
        });
        types.push_record(Record::new(1, [0, u64::MAX, 1 << 40]));

        let mut module = Block::new(codes::block::MODULE, 0, 3);
        module.elements.push(Element::Block(block_info));
        module.elements.push(Element::Block(types));
        module.push_record(Record::new(codes::module::VERSION, [1]));

        Bitstream {
            magic: BITCODE_MAGIC,
            blocks: vec![module],
        }
    }

    #[test]
    fn roundtrip_blocks_abbrevs_and_blobs() {
        let stream = sample();
        let bytes = stream.write_to_bytes().unwrap();
        let reread = Bitstream::read_from_bytes(&bytes).unwrap();
        assert_eq!(reread, stream);
        assert_eq!(reread.write_to_bytes().unwrap(), bytes);
    }

    #[test]
    fn unfit_record_falls_back_to_unabbreviated() {
        let mut stream = sample();
        let Element::Block(types) = &mut stream.blocks[0].elements[1] else {
            unreachable!()
        };
        let Element::Record(record) = &mut types.elements[2] else {
            unreachable!()
        };
        // Doesn't fit the `Fixed(3)` field anymore.
        record.ops[1] = 8;

        let reread = Bitstream::read_from_bytes(&stream.write_to_bytes().unwrap()).unwrap();
        let types = reread.blocks[0].find_block(codes::block::TYPE_NEW).unwrap();
        let record = types.records().next().unwrap();
        assert_eq!(record.abbrev, None);
        assert_eq!(&record.ops[..], &[1000, 8]);
    }

    #[test]
    fn blobs_stay_abbreviated() {
        let mut stream = sample();
        let Element::Block(types) = &mut stream.blocks[0].elements[1] else {
            unreachable!()
        };
        let Element::Record(record) = &mut types.elements[4] else {
            unreachable!()
        };
        record.abbrev = None;

        let reread = Bitstream::read_from_bytes(&stream.write_to_bytes().unwrap()).unwrap();
        let types = reread.blocks[0].find_block(codes::block::TYPE_NEW).unwrap();
        let record = types.records().nth(2).unwrap();
        assert_eq!(record.abbrev, Some(6));
        assert_eq!(record.blob.as_deref(), Some(&b"hello"[..]));
        assert!(record.ops.is_empty());
    }

    #[test]
    fn unencodable_blob() {
        let mut stream = sample();
        let Element::Block(types) = &mut stream.blocks[0].elements[1] else {
            unreachable!()
        };
        let Element::Record(record) = &mut types.elements[4] else {
            unreachable!()
        };
        // No abbreviation has a blob for this code.
        record.code = 10;

        assert!(matches!(
            stream.write_to_bytes(),
            Err(WriteError::UnencodableBlob {
                block: codes::block::TYPE_NEW,
                code: 10,
            })
        ));
    }
}
