//! Constant blocks (`CONSTANTS_BLOCK`), both the module-level one and those
//! local to function bodies.

use crate::dxil::ids::{IdKind, IdRemapper, Patch, PatchedBlock, Relocation};
use crate::dxil::scan::{PhysicalBlockKind, PhysicalBlockScan};
use crate::dxil::types::TypeTable;
use crate::dxil::{Error, ParseCx, ValueTypes};
use crate::il::{ConstDef, ConstKind, FpBits, Program, TypeDef, ValueId};
use crate::llvm::{codes, signed, Block, Record};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

#[derive(Clone, Debug, Default)]
pub struct ConstantTable {
    /// The module-level block (with its uid), if the module has one.
    module: Option<(u32, PatchedBlock)>,

    /// Every constant value defined by the source, module-level or not.
    source: FxHashSet<ValueId>,

    /// Program-wide constants added since parsing, and their type index.
    new: Vec<(ValueId, u32)>,
}

/// Operand positions (of a constant record) holding absolute value ids.
fn value_operands(record: &Record) -> SmallVec<[usize; 8]> {
    use codes::constants::*;

    let n = record.ops.len();
    match record.code {
        AGGREGATE => (0..n).collect(),
        CE_BINOP | CE_CMP => [1, 2].into_iter().filter(|&i| i < n).collect(),
        CE_CAST => [2].into_iter().filter(|&i| i < n).collect(),
        CE_GEP | CE_INBOUNDS_GEP => {
            // `[pointee type]? (type, value)*`
            let start = n % 2;
            (start..n).skip(1).step_by(2).collect()
        }
        CE_SELECT | CE_SHUFFLEVEC => (0..n.min(3)).collect(),
        // `[vector type, vector, (index type)?, index]`
        CE_EXTRACTELT => match n {
            4 => [1, 3].into_iter().collect(),
            _ => [1, 2].into_iter().filter(|&i| i < n).collect(),
        },
        // `[vector, element, (index type)?, index]`
        CE_INSERTELT => match n {
            4 => [0, 1, 3].into_iter().collect(),
            _ => (0..n.min(3)).collect(),
        },
        CE_SHUFVEC_EX => [1, 2, 3].into_iter().filter(|&i| i < n).collect(),
        BLOCKADDRESS => [1].into_iter().filter(|&i| i < n).collect(),
        _ => SmallVec::new(),
    }
}

impl ConstantTable {
    /// Parse the module-level constants (if any), defining their values.
    pub fn parse_module(scan: &PhysicalBlockScan, cx: &mut ParseCx<'_>) -> Result<Self, Error> {
        let mut table = ConstantTable::default();
        let module_block = scan
            .blocks()
            .iter()
            .find(|b| b.kind == PhysicalBlockKind::Constants)
            .map(|b| b.uid);
        if let (Some(uid), Some(block)) = (module_block, scan.get(PhysicalBlockKind::Constants)) {
            let parsed = table.parse_block(block, cx, true)?;
            table.module = Some((uid, parsed));
        }
        Ok(table)
    }

    /// Parse one constant block, binding each defined value to an IL constant
    /// (`program_wide` ones become reusable by instrumentation).
    pub fn parse_block(
        &mut self,
        block: &Block,
        cx: &mut ParseCx<'_>,
        program_wide: bool,
    ) -> Result<PatchedBlock, Error> {
        let mut parsed = PatchedBlock::new(block.clone());
        let mut current_type = None;

        for (ordinal, record) in block.records().enumerate() {
            if record.code == codes::constants::SETTYPE {
                current_type = Some(record.op(0));
                continue;
            }
            let type_index = current_type.ok_or(Error::MalformedRecord {
                block: "constants",
                code: record.code,
            })?;
            let ty = cx.types.get(type_index)?;

            let kind = match record.code {
                codes::constants::NULL => ConstKind::Null,
                codes::constants::UNDEF => ConstKind::Undef,
                codes::constants::INTEGER => {
                    let v = signed::decode(record.op(0));
                    match cx.program.cx()[ty] {
                        TypeDef::Bool => ConstKind::Bool(v != 0),
                        _ => ConstKind::Int(v),
                    }
                }
                codes::constants::FLOAT => ConstKind::Fp(FpBits(record.op(0))),
                _ => ConstKind::Unexposed {
                    tag: cx.unexposed_tag(),
                },
            };

            for op in value_operands(record) {
                let value = cx.resolve(record.ops[op])?;
                parsed.patches.push(Patch::value(ordinal, op, value));
            }

            let value = cx.define(IdKind::Constant, Some(type_index))?;
            cx.program
                .bind_constant(value, ConstDef { ty, kind }, program_wide);
            self.source.insert(value);
            parsed.defines.push(value);
        }
        Ok(parsed)
    }

    /// Collect the program-wide constants instrumentation added, compiling
    /// their types into the table.
    pub fn compile(
        &mut self,
        program: &Program,
        types: &mut TypeTable,
        value_types: &mut ValueTypes,
    ) -> Result<(), Error> {
        self.new.clear();
        for (c, value) in program.program_constants() {
            if self.source.contains(&value) {
                continue;
            }
            let def = &program.cx()[c];
            if let ConstKind::Unexposed { .. } = def.kind {
                return Err(Error::UnsupportedConstant(value));
            }
            let type_index = match value_types.get(&value) {
                Some(&index) => index,
                None => types.index_of(program.cx(), def.ty)?,
            };
            value_types.insert(value, type_index);
            self.new.push((value, type_index));
        }
        Ok(())
    }

    /// Assign destination ids to module-level constants, existing then new.
    pub fn allocate(&self, remapper: &mut IdRemapper) {
        if let Some((_, parsed)) = &self.module {
            for &value in &parsed.defines {
                remapper.allocate(value);
            }
        }
        for &(value, _) in &self.new {
            remapper.allocate(value);
        }
    }

    fn new_records(&self, program: &Program) -> Result<Vec<Record>, Error> {
        let mut records = vec![];
        let mut current_type = None;
        for &(value, type_index) in &self.new {
            if current_type != Some(type_index) {
                records.push(Record::new(
                    codes::constants::SETTYPE,
                    [type_index.into()],
                ));
                current_type = Some(type_index);
            }
            let def = program
                .constant(value)
                .ok_or(Error::UnsupportedConstant(value))?;
            records.push(match def.kind {
                ConstKind::Null => Record::new(codes::constants::NULL, []),
                ConstKind::Undef => Record::new(codes::constants::UNDEF, []),
                ConstKind::Bool(b) => {
                    Record::new(codes::constants::INTEGER, [signed::encode(b.into())])
                }
                ConstKind::Int(v) => Record::new(codes::constants::INTEGER, [signed::encode(v)]),
                ConstKind::Fp(bits) => Record::new(codes::constants::FLOAT, [bits.0]),
                ConstKind::Unexposed { .. } => return Err(Error::UnsupportedConstant(value)),
            });
        }
        Ok(records)
    }

    /// Rewrite the module-level block (creating it if needed), with value
    /// operands remapped and new constants appended.
    pub fn stitch(
        &self,
        scan: &mut PhysicalBlockScan,
        program: &Program,
        reloc: &Relocation<'_>,
    ) -> Result<(), Error> {
        let new_records = self.new_records(program)?;
        match &self.module {
            Some((uid, parsed)) => {
                let mut block = parsed.apply(reloc)?;
                for record in new_records {
                    block.push_record(record);
                }
                scan.replace(*uid, block)?;
            }
            None if !new_records.is_empty() => {
                let mut block = Block::new(codes::block::CONSTANTS, 0, 4);
                for record in new_records {
                    block.push_record(record);
                }
                scan.insert(
                    block,
                    &[
                        PhysicalBlockKind::Metadata,
                        PhysicalBlockKind::ValueSymbolTable,
                        PhysicalBlockKind::Function,
                    ],
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Whether any constants were added since parsing.
    pub fn has_new(&self) -> bool {
        !self.new.is_empty()
    }

    pub fn is_source_constant(&self, value: ValueId) -> bool {
        self.source.contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: u32, ops: &[u64]) -> Record {
        Record::new(code, ops.iter().copied())
    }

    #[test]
    fn expression_value_operands() {
        use codes::constants::*;

        assert_eq!(&value_operands(&record(CE_BINOP, &[0, 4, 5]))[..], &[1, 2]);
        assert_eq!(&value_operands(&record(CE_CAST, &[9, 2, 7]))[..], &[2]);
        // With and without the leading pointee type.
        assert_eq!(
            &value_operands(&record(CE_INBOUNDS_GEP, &[3, 1, 10, 0, 11]))[..],
            &[2, 4]
        );
        assert_eq!(&value_operands(&record(CE_GEP, &[1, 10, 0, 11]))[..], &[1, 3]);
        assert_eq!(&value_operands(&record(CE_EXTRACTELT, &[2, 8, 0, 9]))[..], &[1, 3]);
        assert_eq!(&value_operands(&record(AGGREGATE, &[4, 5, 6]))[..], &[0, 1, 2]);
        assert!(value_operands(&record(INTEGER, &[4])).is_empty());
    }
}
