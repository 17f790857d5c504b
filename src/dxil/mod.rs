//! DXIL modules: the LLVM module inside a DXBC container, split into its
//! physical blocks, with everything instrumentation cares about lifted into
//! an IL [`Program`], and everything else carried along for stitching.

use crate::context::Context;
use crate::dxbc::{Container, DxbcError};
use crate::il::{Program, ValueId};
use crate::llvm::{Bitstream, ReadError, WriteError};
use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;
use std::rc::Rc;

pub mod constants;
pub mod function;
pub mod globals;
pub mod ids;
pub mod intrinsics;
pub mod metadata;
pub mod scan;
pub mod types;

use constants::ConstantTable;
use function::compile::{FunctionCompiler, HandleLayout};
use function::FunctionBlock;
use globals::Globals;
use ids::{IdKind, IdMap, IdRemapper, MetadataRemap, Relocation};
use metadata::{MetadataBlock, ResourceClass};
use scan::{PhysicalBlockKind, PhysicalBlockScan};
use types::TypeTable;

/// Type table index of every (typed) value, as the source (or compiled)
/// records refer to it.
///
/// This is separate from IL types, as e.g. `dx.types.Handle` values are
/// typed as the resource they stand for in the IL.
pub type ValueTypes = FxHashMap<ValueId, u32>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Container(#[from] DxbcError),

    #[error("no MODULE block")]
    MissingModule,
    #[error("no block with uid {0}")]
    MissingBlock(u32),
    #[error("malformed record (code {code}) in {block} block")]
    MalformedRecord { block: &'static str, code: u32 },
    #[error("unsupported record (code {0})")]
    UnsupportedRecord(u32),

    #[error("type index {0} out of range")]
    UnresolvedTypeIndex(u64),
    #[error("type has no DXIL form: {0}")]
    UnsupportedType(String),
    #[error("value id {0} out of range")]
    ValueOutOfRange(u64),
    #[error("value {0} was never assigned an id")]
    UnresolvedValue(ValueId),
    #[error("basic block was never assigned an index")]
    UnresolvedBlock,
    #[error("instruction #{0} has no destination")]
    UnresolvedInstruction(u32),
    #[error("constant {0} has no DXIL form")]
    UnsupportedConstant(ValueId),

    #[error("metadata stitching stalled with {pending} records left")]
    MetadataCycle { pending: usize },
    #[error("function block #{0} has no matching declaration")]
    MissingFunctionDecl(usize),
    #[error("cannot lower {0}")]
    Unlowerable(&'static str),
}

/// State shared by all parsers of one module.
pub struct ParseCx<'a> {
    pub program: &'a mut Program,
    pub types: &'a TypeTable,
    pub ids: IdMap,
    pub value_types: ValueTypes,
    next_unexposed: u32,
}

impl<'a> ParseCx<'a> {
    pub fn new(program: &'a mut Program, types: &'a TypeTable) -> Self {
        ParseCx {
            program,
            types,
            ids: IdMap::default(),
            value_types: ValueTypes::default(),
            // NOTE(eddyb) type table entries use tags below the table length.
            next_unexposed: types.len() as u32,
        }
    }

    /// Fresh tag, to keep unrelated unexposed things distinct.
    pub fn unexposed_tag(&mut self) -> u32 {
        let tag = self.next_unexposed;
        self.next_unexposed += 1;
        tag
    }

    /// IL value for an absolute value id operand.
    pub fn resolve(&mut self, op: u64) -> Result<ValueId, Error> {
        let source = ids::source_id(op)?;
        self.ids.resolve(self.program, source)
    }

    pub fn resolve_plus_one(&mut self, op: u64) -> Result<Option<ValueId>, Error> {
        self.ids.resolve_plus_one(self.program, op)
    }

    /// Define the next source value, typed by the table entry `type_index`.
    pub fn define(&mut self, kind: IdKind, type_index: Option<u64>) -> Result<ValueId, Error> {
        let value = self.ids.define(self.program, kind);
        if let Some(index) = type_index {
            let ty = self.types.get(index)?;
            self.program.set_type(value, ty);
            self.value_types.insert(value, index as u32);
        }
        Ok(value)
    }
}

/// A `createHandle` result, and what it was created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    pub class: ResourceClass,
    pub range_id: u32,
    pub index: ValueId,
}

/// Scalar components standing behind an IL vector value.
pub type Components = ArrayVec<ValueId, 4>;

#[derive(Clone)]
pub struct DxilModule {
    program: Program,
    container: Option<Container>,
    scan: PhysicalBlockScan,
    types: TypeTable,
    value_types: ValueTypes,
    globals: Globals,
    constants: ConstantTable,
    pub metadata: MetadataBlock,
    functions: Vec<FunctionBlock>,
    handles: FxHashMap<ValueId, HandleInfo>,
    svox: FxHashMap<ValueId, Components>,
}

impl DxilModule {
    /// Parse a DXBC container (or bare LLVM bitcode).
    pub fn parse(bytes: &[u8], cx: Rc<Context>) -> Result<Self, Error> {
        let (container, bitstream) = if Container::is_container(bytes) {
            let container = Container::parse(bytes)?;
            let bitstream = {
                let (_, bitcode) = container.program()?;
                Bitstream::read_from_bytes(bitcode)?
            };
            (Some(container), bitstream)
        } else {
            (None, Bitstream::read_from_bytes(bytes)?)
        };
        let scan = PhysicalBlockScan::scan(bitstream)?;

        let mut program = Program::new(cx);
        let types = match scan.get(PhysicalBlockKind::Types) {
            Some(block) => TypeTable::parse(block, &program)?,
            None => TypeTable::default(),
        };

        let mut handles = FxHashMap::default();
        let mut svox = FxHashMap::default();
        let mut functions = vec![];
        let (globals, constants, metadata, value_types) = {
            let mut cx = ParseCx::new(&mut program, &types);
            cx.ids.begin_module(scan.module().record_count());
            let globals = Globals::parse(&scan, &mut cx)?;
            let mut constants = ConstantTable::parse_module(&scan, &mut cx)?;
            cx.ids.end_module();
            let metadata = MetadataBlock::parse(&scan, &mut cx)?;

            let mut bodies = globals.functions.iter().filter(|f| !f.is_declaration);
            let blocks = scan
                .blocks()
                .iter()
                .filter(|b| b.kind == PhysicalBlockKind::Function)
                .zip(scan.all(PhysicalBlockKind::Function));
            for (i, (found, block)) in blocks.enumerate() {
                let decl = bodies.next().ok_or(Error::MissingFunctionDecl(i))?;
                cx.ids.begin_function(block.record_count());
                functions.push(function::parse::parse(
                    block,
                    found.uid,
                    decl,
                    &mut function::parse::ModuleView {
                        cx: &mut cx,
                        constants: &mut constants,
                        globals: &globals,
                        metadata: &metadata,
                        handles: &mut handles,
                        svox: &mut svox,
                    },
                )?);
            }
            (globals, constants, metadata, cx.value_types)
        };

        tracing::debug!(
            functions = functions.len(),
            instructions = program.instruction_count(),
            types = types.len(),
            "parsed DXIL module"
        );

        Ok(DxilModule {
            program,
            container,
            scan,
            types,
            value_types,
            globals,
            constants,
            metadata,
            functions,
            handles,
            svox,
        })
    }

    /// Independent copy, for instrumenting (and compiling) one variant.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    pub fn handle_info(&self, value: ValueId) -> Option<&HandleInfo> {
        self.handles.get(&value)
    }

    /// Every `createHandle` result, and the resource it was created for.
    pub fn handles(&self) -> impl Iterator<Item = (ValueId, &HandleInfo)> {
        self.handles.iter().map(|(&value, info)| (value, info))
    }

    /// Name of a global value (e.g. a function), from the symbol table.
    pub fn global_name(&self, value: ValueId) -> Option<&str> {
        self.globals.name(value)
    }

    /// Compile the IL program back into records, stitch every block, and
    /// write out the module (in its container, if it came in one).
    pub fn compile(mut self) -> Result<Vec<u8>, Error> {
        let layout = HandleLayout::new(&self.program);
        let binding = if layout.is_empty() {
            None
        } else {
            Some(self.metadata.compile_export_resources(
                layout.count(),
                &mut self.program,
                &mut self.types,
                &mut self.value_types,
            )?)
        };

        let mut compiled = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            let mut compiler = FunctionCompiler {
                program: &mut self.program,
                types: &mut self.types,
                globals: &mut self.globals,
                value_types: &mut self.value_types,
                module_handles: &self.handles,
                module_svox: &self.svox,
                layout: &layout,
                binding,
            };
            compiled.push(compiler.compile(f)?);
        }

        self.constants
            .compile(&self.program, &mut self.types, &mut self.value_types)?;

        if let Some(found) = self
            .scan
            .blocks()
            .iter()
            .find(|b| b.kind == PhysicalBlockKind::Types)
        {
            let uid = found.uid;
            if let Some(block) = self.scan.get(PhysicalBlockKind::Types) {
                let mut block = block.clone();
                self.types.stitch(&mut block);
                self.scan.replace(uid, block)?;
            }
        }

        let mut remapper = IdRemapper::default();
        self.globals.allocate(&mut remapper);
        self.constants.allocate(&mut remapper);

        let metadata_remap = {
            let identity = MetadataRemap::default();
            let reloc = Relocation {
                remapper: &remapper,
                metadata: &identity,
                blocks: None,
                insts: None,
            };
            self.globals.stitch(&mut self.scan, &reloc)?;
            self.constants.stitch(&mut self.scan, &self.program, &reloc)?;
            self.metadata.stitch(&mut self.scan, &reloc)?
        };

        // Use lists are only meaningful for the exact value numbering
        // they were written against.
        let keep_use_lists = !self.globals.has_new_functions()
            && !self.constants.has_new()
            && compiled.iter().all(|c| c.is_unmodified());
        if !keep_use_lists {
            self.scan.remove_all(PhysicalBlockKind::UseList);
        }

        // NOTE(eddyb) function-local values are numbered past the module
        // values, separately for each function.
        let segmented = self.functions.len() > 1;
        for (f, compiled) in self.functions.iter().zip(compiled) {
            let block = f.stitch(
                &self.program,
                compiled,
                &mut remapper,
                &metadata_remap,
                segmented,
                keep_use_lists,
            )?;
            self.scan.replace(f.uid, block)?;
        }

        let bitcode = self.scan.write()?;
        Ok(match &mut self.container {
            Some(container) => {
                container.replace_program(&bitcode)?;
                container.write()
            }
            None => bitcode,
        })
    }
}
