//! Module-level global values (`GLOBALVAR`, `FUNCTION` and `ALIAS` records),
//! and the module value symbol table naming them.

use crate::context::Type;
use crate::dxil::ids::{apply_patches, IdKind, IdRemapper, Patch, PatchTarget, Relocation};
use crate::dxil::scan::{PhysicalBlockKind, PhysicalBlockScan};
use crate::dxil::types::TypeTable;
use crate::dxil::{Error, ParseCx, ValueTypes};
use crate::il::{AddressSpace, Program, TypeDef, ValueId};
use crate::llvm::{codes, Block, Element, Record};
use rustc_hash::FxHashMap;

/// A function, declared (`FUNCTION` record) and possibly defined (by one of
/// the `FUNCTION_BLOCK`s, in declaration order).
#[derive(Clone, Debug)]
pub struct FunctionDecl {
    pub value: ValueId,

    /// Table index of the function type.
    pub type_index: u32,
    pub is_declaration: bool,
    pub linkage: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Globals {
    /// Values defined by module records, in order.
    defines: Vec<ValueId>,

    /// Patches against the records of the `MODULE` block.
    patches: Vec<Patch>,

    pub functions: Vec<FunctionDecl>,
    names: FxHashMap<ValueId, String>,

    /// Operand count of `FUNCTION` records, for new declarations to match.
    function_record_len: usize,

    symbol_table: Option<SymbolTable>,

    /// Declarations added while compiling, and their names.
    new_functions: Vec<(FunctionDecl, String)>,
}

#[derive(Clone, Debug)]
struct SymbolTable {
    uid: u32,
    patches: Vec<Patch>,
}

impl Globals {
    pub fn parse(scan: &PhysicalBlockScan, cx: &mut ParseCx<'_>) -> Result<Self, Error> {
        let mut globals = Globals::default();
        let module = scan.module();

        for (ordinal, record) in module.records().enumerate() {
            let malformed = || Error::MalformedRecord {
                block: "module",
                code: record.code,
            };
            match record.code {
                codes::module::GLOBALVAR => {
                    // NOTE(eddyb) bit 1 of `isconst` signals an explicit
                    // (pointee) type, with the address space above it.
                    let flags = record.op(1);
                    let (ty, type_index) = if flags & 2 != 0 {
                        let pointee = cx.types.get(record.op(0))?;
                        let ty = cx.program.find_type_or_add(TypeDef::Pointer {
                            pointee,
                            address_space: AddressSpace::from_dxil(flags >> 2),
                        });
                        (ty, cx.types.find(cx.program.cx(), ty).map(u64::from))
                    } else {
                        (cx.types.get(record.op(0))?, Some(record.op(0)))
                    };
                    let value = cx.define(IdKind::Global, type_index)?;
                    cx.program.set_type(value, ty);

                    // Initializer.
                    if record.op(2) != 0 {
                        globals.patch_plus_one(cx, ordinal, 2, record.op(2))?;
                    }
                    globals.defines.push(value);
                }
                codes::module::FUNCTION => {
                    let mut fn_type = record.ops.first().copied().ok_or_else(malformed)?;
                    if let Some(pointee) = cx.types.pointee(fn_type) {
                        fn_type = pointee;
                    }
                    if cx.types.signature(fn_type).is_none() {
                        return Err(malformed());
                    }
                    let fn_ty = cx.types.get(fn_type)?;
                    let ptr_ty = cx.program.find_type_or_add(TypeDef::Pointer {
                        pointee: fn_ty,
                        address_space: AddressSpace::Function,
                    });
                    let ptr_index = cx.types.find(cx.program.cx(), ptr_ty).map(u64::from);
                    let value = cx.define(IdKind::Global, ptr_index)?;
                    cx.program.set_type(value, ptr_ty);

                    // Prologue data, prefix data and personality function.
                    for op in [10, 13, 14] {
                        if record.op(op) != 0 {
                            globals.patch_plus_one(cx, ordinal, op, record.op(op))?;
                        }
                    }

                    globals.function_record_len = record.ops.len();
                    globals.functions.push(FunctionDecl {
                        value,
                        type_index: fn_type as u32,
                        is_declaration: record.op(2) != 0,
                        linkage: record.op(3),
                    });
                    globals.defines.push(value);
                }
                codes::module::ALIAS | codes::module::ALIAS_OLD => {
                    let (type_index, aliasee_op) = if record.code == codes::module::ALIAS {
                        let pointee = cx.types.get(record.op(0))?;
                        let ty = cx.program.find_type_or_add(TypeDef::Pointer {
                            pointee,
                            address_space: AddressSpace::from_dxil(record.op(1)),
                        });
                        (cx.types.find(cx.program.cx(), ty).map(u64::from), 2)
                    } else {
                        (Some(record.op(0)), 1)
                    };
                    let value = cx.define(IdKind::Global, type_index)?;
                    let aliasee = cx.resolve(record.op(aliasee_op))?;
                    globals
                        .patches
                        .push(Patch::value(ordinal, aliasee_op, aliasee));
                    globals.defines.push(value);
                }
                _ => {}
            }
        }

        globals.parse_symbol_table(scan, cx)?;
        Ok(globals)
    }

    fn patch_plus_one(
        &mut self,
        cx: &mut ParseCx<'_>,
        record: usize,
        op: usize,
        value: u64,
    ) -> Result<(), Error> {
        if let Some(value) = cx.resolve_plus_one(value)? {
            self.patches.push(Patch {
                record,
                op,
                target: PatchTarget::ValuePlusOne(value),
            });
        }
        Ok(())
    }

    fn parse_symbol_table(
        &mut self,
        scan: &PhysicalBlockScan,
        cx: &mut ParseCx<'_>,
    ) -> Result<(), Error> {
        let Some(found) = scan
            .blocks()
            .iter()
            .find(|b| b.kind == PhysicalBlockKind::ValueSymbolTable)
        else {
            return Ok(());
        };
        let Some(block) = scan.get(PhysicalBlockKind::ValueSymbolTable) else {
            return Ok(());
        };

        let mut patches = vec![];
        for (ordinal, record) in block.records().enumerate() {
            let name_start = match record.code {
                codes::value_symtab::ENTRY => 1,
                codes::value_symtab::FNENTRY => 2,
                _ => continue,
            };
            let value = cx.resolve(record.op(0))?;
            self.names.insert(value, record.ops_as_string(name_start));
            patches.push(Patch::value(ordinal, 0, value));
        }
        self.symbol_table = Some(SymbolTable {
            uid: found.uid,
            patches,
        });
        Ok(())
    }

    pub fn name(&self, value: ValueId) -> Option<&str> {
        self.names.get(&value).map(|s| &s[..])
    }

    /// Function value for `name`, whether declared by the source or not.
    pub fn function_named(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions
            .iter()
            .find(|f| self.name(f.value) == Some(name))
            .or_else(|| {
                self.new_functions
                    .iter()
                    .find(|(_, n)| n == name)
                    .map(|(f, _)| f)
            })
    }

    /// Declare (external) function `name`, of the table function type
    /// `type_index`, unless it's already declared.
    pub fn declare(
        &mut self,
        program: &mut Program,
        types: &mut TypeTable,
        value_types: &mut ValueTypes,
        name: &str,
        type_index: u32,
    ) -> Result<ValueId, Error> {
        if let Some(decl) = self.function_named(name) {
            return Ok(decl.value);
        }

        let ptr_index = types.pointer_index(program.cx(), type_index, AddressSpace::Function)?;
        let ptr_ty: Type = types.get(ptr_index.into())?;
        let value = program.alloc_typed(ptr_ty);
        value_types.insert(value, ptr_index);

        self.names.insert(value, name.to_string());
        self.new_functions.push((
            FunctionDecl {
                value,
                type_index,
                is_declaration: true,
                linkage: codes::linkage::EXTERNAL,
            },
            name.to_string(),
        ));
        Ok(value)
    }

    pub fn has_new_functions(&self) -> bool {
        !self.new_functions.is_empty()
    }

    /// Assign destination ids to globals, existing then new.
    pub fn allocate(&self, remapper: &mut IdRemapper) {
        for &value in &self.defines {
            remapper.allocate(value);
        }
        for (decl, _) in &self.new_functions {
            remapper.allocate(decl.value);
        }
    }

    /// Remap global records in the `MODULE` block, appending new function
    /// declarations after the existing globals, and name them.
    pub fn stitch(&self, scan: &mut PhysicalBlockScan, reloc: &Relocation<'_>) -> Result<(), Error> {
        apply_patches(scan.module_mut(), &self.patches, reloc)?;

        if !self.new_functions.is_empty() {
            let module = scan.module();
            let last_global = module.elements.iter().rposition(|e| {
                matches!(e, Element::Record(r) if matches!(
                    r.code,
                    codes::module::GLOBALVAR
                        | codes::module::FUNCTION
                        | codes::module::ALIAS
                        | codes::module::ALIAS_OLD
                ))
            });
            let mut at = last_global.map_or(module.elements.len(), |i| i + 1);
            let len = self.function_record_len.max(10);
            for (decl, _) in &self.new_functions {
                // `[type, callingconv, isproto, linkage, ...]`, rest zeroed.
                let mut ops = vec![0; len];
                ops[0] = decl.type_index.into();
                ops[2] = 1;
                ops[3] = decl.linkage;
                scan.insert_module_record(at, Record::new(codes::module::FUNCTION, ops));
                at += 1;
            }
        }

        let mut names = vec![];
        for (decl, name) in &self.new_functions {
            let id = reloc.value(decl.value)?;
            names.push(Record::new(
                codes::value_symtab::ENTRY,
                std::iter::once(id.into()).chain(name.bytes().map(u64::from)),
            ));
        }

        match &self.symbol_table {
            Some(table) => {
                let mut block = scan
                    .get(PhysicalBlockKind::ValueSymbolTable)
                    .ok_or(Error::MissingBlock(table.uid))?
                    .clone();
                apply_patches(&mut block, &table.patches, reloc)?;
                for record in names {
                    block.push_record(record);
                }
                scan.replace(table.uid, block)?;
            }
            None if !names.is_empty() => {
                let mut block = Block::new(codes::block::VALUE_SYMTAB, 0, 4);
                for record in names {
                    block.push_record(record);
                }
                scan.insert(block, &[PhysicalBlockKind::Function]);
            }
            None => {}
        }
        Ok(())
    }
}
