//! Module metadata block: a shadow row per metadata id, reflection of the
//! `dx.resources` list into register spaces, synthesis of the export UAV,
//! and the fixpoint that re-linearizes everything on stitch.

use crate::context::Type;
use crate::dxil::ids::{MetadataRemap, Relocation};
use crate::dxil::scan::{PhysicalBlockKind, PhysicalBlockScan};
use crate::dxil::types::TypeTable;
use crate::dxil::{Error, ParseCx, ValueTypes};
use crate::il::{
    AddressSpace, ConstKind, Format, Program, ResourceSamplerMode, TextureDimension, TypeDef,
    ValueId,
};
use crate::llvm::{codes, Block, Element, Record};
use smallvec::SmallVec;

/// Name of the named node listing all resources.
const RESOURCES: &str = "dx.resources";

/// Type name DXC gives the (element) type of `RWBuffer<uint>`.
const EXPORT_BUFFER_TYPE_NAME: &str = "class.RWBuffer<unsigned int>";

const EXPORT_BUFFER_NAME: &str = "ShaderExportBuffers";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
    Srv,
    Uav,
    Cbv,
    Sampler,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [
        ResourceClass::Srv,
        ResourceClass::Uav,
        ResourceClass::Cbv,
        ResourceClass::Sampler,
    ];

    pub fn from_dxil(class: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(class).ok()?).copied()
    }

    pub fn to_dxil(self) -> u64 {
        self as u64
    }
}

/// `DXIL::ResourceKind`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceShape {
    Texture1D,
    Texture2D,
    Texture2DMS,
    Texture3D,
    TextureCube,
    Texture1DArray,
    Texture2DArray,
    Texture2DMSArray,
    TextureCubeArray,
    TypedBuffer,
    RawBuffer,
    StructuredBuffer,
    CBuffer,
    Sampler,
    TBuffer,
    Other(u64),
}

impl ResourceShape {
    pub fn from_dxil(kind: u64) -> Self {
        use ResourceShape::*;
        match kind {
            1 => Texture1D,
            2 => Texture2D,
            3 => Texture2DMS,
            4 => Texture3D,
            5 => TextureCube,
            6 => Texture1DArray,
            7 => Texture2DArray,
            8 => Texture2DMSArray,
            9 => TextureCubeArray,
            10 => TypedBuffer,
            11 => RawBuffer,
            12 => StructuredBuffer,
            13 => CBuffer,
            14 => Sampler,
            15 => TBuffer,
            other => Other(other),
        }
    }

    pub fn to_dxil(self) -> u64 {
        use ResourceShape::*;
        match self {
            Texture1D => 1,
            Texture2D => 2,
            Texture2DMS => 3,
            Texture3D => 4,
            TextureCube => 5,
            Texture1DArray => 6,
            Texture2DArray => 7,
            Texture2DMSArray => 8,
            TextureCubeArray => 9,
            TypedBuffer => 10,
            RawBuffer => 11,
            StructuredBuffer => 12,
            CBuffer => 13,
            Sampler => 14,
            TBuffer => 15,
            Other(other) => other,
        }
    }

    fn texture_dimension(self) -> Option<(TextureDimension, bool)> {
        use ResourceShape::*;
        Some(match self {
            Texture1D => (TextureDimension::Texture1D, false),
            Texture2D => (TextureDimension::Texture2D, false),
            Texture2DMS => (TextureDimension::Texture2D, true),
            Texture3D => (TextureDimension::Texture3D, false),
            TextureCube => (TextureDimension::Texture2DCube, false),
            Texture1DArray => (TextureDimension::Texture1DArray, false),
            Texture2DArray => (TextureDimension::Texture2DArray, false),
            Texture2DMSArray => (TextureDimension::Texture2DArray, true),
            TextureCubeArray => (TextureDimension::Texture2DCubeArray, false),
            _ => return None,
        })
    }
}

/// `DXIL::ComponentType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ComponentType {
    Invalid,
    I1,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F16,
    F32,
    F64,
    Other(u64),
}

impl ComponentType {
    pub fn from_dxil(ty: u64) -> Self {
        use ComponentType::*;
        match ty {
            0 => Invalid,
            1 => I1,
            2 => I16,
            3 => U16,
            4 => I32,
            5 => U32,
            6 => I64,
            7 => U64,
            8 => F16,
            9 => F32,
            10 => F64,
            other => Other(other),
        }
    }

    pub fn to_dxil(self) -> u64 {
        use ComponentType::*;
        match self {
            Invalid => 0,
            I1 => 1,
            I16 => 2,
            U16 => 3,
            I32 => 4,
            U32 => 5,
            I64 => 6,
            U64 => 7,
            F16 => 8,
            F32 => 9,
            F64 => 10,
            Other(other) => other,
        }
    }

    fn il_type(self, program: &Program) -> Option<Type> {
        use ComponentType::*;
        let int = |bit_width, signed| program.find_type_or_add(TypeDef::Int { bit_width, signed });
        Some(match self {
            I1 => program.bool_type(),
            I16 => int(16, true),
            U16 => int(16, false),
            I32 => int(32, true),
            U32 => int(32, false),
            I64 => int(64, true),
            U64 => int(64, false),
            F16 => program.find_type_or_add(TypeDef::Fp { bit_width: 16 }),
            F32 => program.find_type_or_add(TypeDef::Fp { bit_width: 32 }),
            F64 => program.find_type_or_add(TypeDef::Fp { bit_width: 64 }),
            Invalid | Other(_) => return None,
        })
    }

    fn format(self) -> Format {
        use ComponentType::*;
        match self {
            I16 => Format::R16Int,
            U16 => Format::R16UInt,
            I32 => Format::R32Int,
            U32 => Format::R32UInt,
            F16 => Format::R16Float,
            F32 => Format::R32Float,
            Invalid => Format::None,
            _ => Format::Unexposed,
        }
    }
}

/// Tags of the extended (key/value) properties of SRVs/UAVs.
mod extended_tag {
    pub const ELEMENT_TYPE: u64 = 0;
    pub const BYTE_STRIDE: u64 = 1;
}

/// One reflected resource (range).
#[derive(Clone, Debug)]
pub struct HandleEntry {
    pub class: ResourceClass,
    pub handle_id: u32,
    pub name: Option<String>,
    pub space: u32,
    pub base_register: u32,
    pub range: u32,
    pub shape: ResourceShape,
    pub component: ComponentType,
    pub byte_stride: Option<u32>,
    pub globally_coherent: bool,

    /// IL type standing for the resource.
    pub ty: Type,

    /// Metadata id of the resource node.
    pub node: u32,
}

#[derive(Clone, Debug)]
pub struct RegisterSpace {
    pub class: ResourceClass,
    pub bind_space: u32,

    /// Running maximum of `base + range`, over all entries ever inserted.
    pub register_bound: u32,

    /// Entries by handle id (sparse).
    pub handles: Vec<Option<HandleEntry>>,
}

impl RegisterSpace {
    fn insert(&mut self, entry: HandleEntry) {
        self.register_bound = self
            .register_bound
            .max(entry.base_register.saturating_add(entry.range));
        let i = entry.handle_id as usize;
        if self.handles.len() <= i {
            self.handles.resize(i + 1, None);
        }
        self.handles[i] = Some(entry);
    }
}

/// Binding of the synthesized export UAV range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExportBinding {
    pub handle_id: u32,
    pub space: u32,
    pub register: u32,
    pub count: u32,
}

/// Interpretation of one metadata id.
#[derive(Clone, Debug)]
enum Row {
    Value { type_index: u64, value: ValueId },
    String(String),
    Node,
    Other,
}

#[derive(Clone, Debug, Default)]
pub struct MetadataBlock {
    uid: Option<u32>,
    source: Option<Block>,

    /// Source records, followed by any compiled ones.
    records: Vec<Record>,

    /// Metadata id defined by each record, if any.
    record_ids: Vec<Option<u32>>,

    /// Defining record (index into `records`) and interpretation, per id.
    rows: Vec<(usize, Row)>,

    /// Number of metadata ids defined by the source.
    source_count: u32,

    /// The (list) node `dx.resources` names.
    resource_list: Option<u32>,

    pub spaces: Vec<RegisterSpace>,
    export: Option<ExportBinding>,
}

fn defines_id(code: u32) -> bool {
    !matches!(
        code,
        codes::metadata::NAME
            | codes::metadata::KIND
            | codes::metadata::NAMED_NODE
            | codes::metadata::ATTACHMENT
    )
}

impl MetadataBlock {
    pub fn parse(scan: &PhysicalBlockScan, cx: &mut ParseCx<'_>) -> Result<Self, Error> {
        let mut md = MetadataBlock::default();
        let Some(found) = scan
            .blocks()
            .iter()
            .find(|b| b.kind == PhysicalBlockKind::Metadata)
        else {
            return Ok(md);
        };
        let Some(block) = scan.get(PhysicalBlockKind::Metadata) else {
            return Ok(md);
        };
        md.uid = Some(found.uid);
        md.source = Some(block.clone());

        let mut pending_name = None;
        for record in block.records() {
            match record.code {
                codes::metadata::NAME => pending_name = Some(record.ops_as_string(0)),
                codes::metadata::NAMED_NODE => {
                    if pending_name.take().as_deref() == Some(RESOURCES) {
                        md.resource_list = Some(record.op(0) as u32);
                    }
                }
                _ => {}
            }

            let row = match record.code {
                codes::metadata::STRING_OLD => Row::String(record.ops_as_string(0)),
                codes::metadata::VALUE => Row::Value {
                    type_index: record.op(0),
                    value: cx.resolve(record.op(1))?,
                },
                codes::metadata::NODE | codes::metadata::DISTINCT_NODE => Row::Node,
                _ => Row::Other,
            };
            md.push(record.clone(), row);
        }
        md.source_count = md.rows.len() as u32;

        md.parse_resources(cx.program)?;
        Ok(md)
    }

    /// Append a record, returning the metadata id it defines (if any).
    fn push(&mut self, record: Record, row: Row) -> Option<u32> {
        let id = if defines_id(record.code) {
            let id = self.rows.len() as u32;
            self.rows.push((self.records.len(), row));
            Some(id)
        } else {
            None
        };
        self.records.push(record);
        self.record_ids.push(id);
        id
    }

    fn row(&self, id: u32) -> Option<&(usize, Row)> {
        self.rows.get(id as usize)
    }

    /// Operands of node `id`.
    fn node(&self, id: u32) -> Option<&[u64]> {
        match self.row(id)? {
            &(record, Row::Node) => Some(&self.records[record].ops),
            _ => None,
        }
    }

    /// Integer constant referenced by a (1-based) node operand.
    fn operand_int(&self, program: &Program, op: u64) -> Option<i64> {
        let id = u32::try_from(op.checked_sub(1)?).ok()?;
        match self.row(id)? {
            &(_, Row::Value { value, .. }) => program.int_constant(value),
            _ => None,
        }
    }

    fn operand_u32(&self, program: &Program, op: u64) -> Option<u32> {
        // NOTE(eddyb) unbounded ranges are written as `-1`.
        self.operand_int(program, op).map(|v| v as u32)
    }

    fn operand_string(&self, op: u64) -> Option<&str> {
        let id = u32::try_from(op.checked_sub(1)?).ok()?;
        match self.row(id)? {
            (_, Row::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Key/value pairs of an extended properties node operand.
    fn extended_tags(&self, program: &Program, op: u64) -> SmallVec<[(u64, i64); 4]> {
        let Some(ops) = op.checked_sub(1).and_then(|id| self.node(id as u32)) else {
            return SmallVec::new();
        };
        ops.chunks_exact(2)
            .filter_map(|pair| {
                let tag = self.operand_int(program, pair[0])?;
                let value = self.operand_int(program, pair[1])?;
                Some((tag as u64, value))
            })
            .collect()
    }

    fn parse_resources(&mut self, program: &Program) -> Result<(), Error> {
        let Some(list) = self.resource_list.and_then(|id| self.node(id)) else {
            return Ok(());
        };
        let list: SmallVec<[u64; 4]> = list.iter().copied().collect();

        for (class, &class_list) in ResourceClass::ALL.iter().zip(&list) {
            let Some(resources) = class_list.checked_sub(1).and_then(|id| self.node(id as u32))
            else {
                continue;
            };
            let resources: SmallVec<[u64; 8]> = resources.iter().copied().collect();
            for op in resources {
                if let Some(entry) = op
                    .checked_sub(1)
                    .and_then(|id| self.parse_resource(program, *class, id as u32))
                {
                    self.find_or_add_space(entry.class).insert(entry);
                }
            }
        }
        Ok(())
    }

    fn parse_resource(&self, program: &Program, class: ResourceClass, id: u32) -> Option<HandleEntry> {
        let ops = self.node(id)?;
        let op = |i: usize| ops.get(i).copied().unwrap_or(0);

        let mut entry = HandleEntry {
            class,
            handle_id: self.operand_u32(program, op(0))?,
            name: self.operand_string(op(2)).map(str::to_string),
            space: self.operand_u32(program, op(3)).unwrap_or(0),
            base_register: self.operand_u32(program, op(4)).unwrap_or(0),
            range: self.operand_u32(program, op(5)).unwrap_or(1),
            shape: ResourceShape::CBuffer,
            component: ComponentType::Invalid,
            byte_stride: None,
            globally_coherent: false,
            ty: program.find_type_or_add(TypeDef::Sampler),
            node: id,
        };

        match class {
            ResourceClass::Srv | ResourceClass::Uav => {
                entry.shape = ResourceShape::from_dxil(self.operand_int(program, op(6))? as u64);
                let extended = match class {
                    ResourceClass::Srv => op(8),
                    _ => {
                        entry.globally_coherent =
                            self.operand_int(program, op(7)).unwrap_or(0) != 0;
                        op(10)
                    }
                };
                for (tag, value) in self.extended_tags(program, extended) {
                    match tag {
                        extended_tag::ELEMENT_TYPE => {
                            entry.component = ComponentType::from_dxil(value as u64);
                        }
                        extended_tag::BYTE_STRIDE => entry.byte_stride = Some(value as u32),
                        _ => {}
                    }
                }

                let sampler_mode = match class {
                    ResourceClass::Srv => ResourceSamplerMode::Compatible,
                    _ => ResourceSamplerMode::Writable,
                };
                let element = entry.component.il_type(program);
                let format = entry.component.format();
                entry.ty = program.find_type_or_add(match entry.shape.texture_dimension() {
                    Some((dimension, multisampled)) => TypeDef::Texture {
                        dimension,
                        sampled: element,
                        multisampled,
                        sampler_mode,
                        format,
                    },
                    None => TypeDef::Buffer {
                        element,
                        sampler_mode,
                        texel: format,
                    },
                });
            }
            ResourceClass::Cbv | ResourceClass::Sampler => {
                // NOTE(eddyb) extended tags of CBVs and samplers are decoded,
                // but nothing in them is reflected (yet).
                let _ = self.extended_tags(program, op(7));

                if class == ResourceClass::Cbv {
                    entry.ty = program.find_type_or_add(TypeDef::Buffer {
                        element: None,
                        sampler_mode: ResourceSamplerMode::RuntimeOnly,
                        texel: Format::None,
                    });
                } else {
                    entry.shape = ResourceShape::Sampler;
                }
            }
        }
        Some(entry)
    }

    fn find_or_add_space(&mut self, class: ResourceClass) -> &mut RegisterSpace {
        let i = match self.spaces.iter().position(|s| s.class == class) {
            Some(i) => i,
            None => {
                self.spaces.push(RegisterSpace {
                    class,
                    bind_space: self.spaces.len() as u32,
                    register_bound: 0,
                    handles: vec![],
                });
                self.spaces.len() - 1
            }
        };
        &mut self.spaces[i]
    }

    pub fn space(&self, class: ResourceClass) -> Option<&RegisterSpace> {
        self.spaces.iter().find(|s| s.class == class)
    }

    /// Reflected resource of `class` with the (range) id `handle_id`.
    pub fn handle(&self, class: ResourceClass, handle_id: u32) -> Option<&HandleEntry> {
        self.space(class)?
            .handles
            .get(handle_id as usize)?
            .as_ref()
    }

    pub fn export_binding(&self) -> Option<ExportBinding> {
        self.export
    }

    /// Metadata id (plus one) of an `i32` constant, reusing an existing one.
    fn value_u32(
        &mut self,
        program: &mut Program,
        value_types: &mut ValueTypes,
        (i32_index, i32_ty): (u32, Type),
        v: u32,
    ) -> u64 {
        let existing = self.rows.iter().position(|(_, row)| {
            matches!(row, &Row::Value { type_index, value }
                if type_index == u64::from(i32_index)
                    && program.int_constant(value) == Some(v.into()))
        });
        if let Some(id) = existing {
            return id as u64 + 1;
        }

        let value = program.find_constant_or_add(i32_ty, ConstKind::Int(v.into()));
        value_types.entry(value).or_insert(i32_index);
        self.push_value(i32_index.into(), value)
    }

    fn push_value(&mut self, type_index: u64, value: ValueId) -> u64 {
        let record = Record::new(codes::metadata::VALUE, [type_index, 0]);
        match self.push(record, Row::Value { type_index, value }) {
            Some(id) => u64::from(id) + 1,
            None => unreachable!(),
        }
    }

    fn push_node(&mut self, ops: impl IntoIterator<Item = u64>) -> u64 {
        match self.push(Record::new(codes::metadata::NODE, ops), Row::Node) {
            Some(id) => u64::from(id) + 1,
            None => unreachable!(),
        }
    }

    fn string(&mut self, s: &str) -> u64 {
        let existing = self
            .rows
            .iter()
            .position(|(_, row)| matches!(row, Row::String(existing) if existing == s));
        if let Some(id) = existing {
            return id as u64 + 1;
        }
        let record = Record::new(codes::metadata::STRING_OLD, s.bytes().map(u64::from));
        match self.push(record, Row::String(s.to_string())) {
            Some(id) => u64::from(id) + 1,
            None => unreachable!(),
        }
    }

    /// Synthesize the export UAV range (`count` `RWBuffer<uint>`s), appended
    /// to the UAVs, past every register any existing UAV uses.
    pub fn compile_export_resources(
        &mut self,
        count: u32,
        program: &mut Program,
        types: &mut TypeTable,
        value_types: &mut ValueTypes,
    ) -> Result<ExportBinding, Error> {
        let cx = program.cx().clone();

        let space = self.find_or_add_space(ResourceClass::Uav);
        let binding = ExportBinding {
            handle_id: space.handles.len() as u32,
            space: space.bind_space,
            register: space.register_bound,
            count,
        };

        let u32_ty = program.uint_type(32);
        let i32_index = types.index_of(&cx, u32_ty)?;
        let bool_index = types.index_of(&cx, program.bool_type())?;
        let element_index = types.index_of_named(&cx, EXPORT_BUFFER_TYPE_NAME, &[u32_ty])?;
        let array_index = types.array_index(&cx, element_index, count.into())?;
        let ptr_index = types.pointer_index(&cx, array_index, AddressSpace::Function)?;
        let ptr_ty = types.get(ptr_index.into())?;

        let undef = program.undef(ptr_ty);
        value_types.insert(undef, ptr_index);
        let bool_false = program.bool_constant(false);
        value_types.entry(bool_false).or_insert(bool_index);

        let i32_ = (i32_index, types.get(i32_index.into())?);
        let element_type_tag =
            self.value_u32(program, value_types, i32_, extended_tag::ELEMENT_TYPE as u32);
        let element_type =
            self.value_u32(program, value_types, i32_, ComponentType::U32.to_dxil() as u32);
        let handle_id = self.value_u32(program, value_types, i32_, binding.handle_id);
        let space_md = self.value_u32(program, value_types, i32_, binding.space);
        let register = self.value_u32(program, value_types, i32_, binding.register);
        let range = self.value_u32(program, value_types, i32_, count);
        let shape = self.value_u32(
            program,
            value_types,
            i32_,
            ResourceShape::TypedBuffer.to_dxil() as u32,
        );
        let undef_md = self.push_value(ptr_index.into(), undef);
        let false_md = self.push_value(bool_index.into(), bool_false);
        let name = self.string(EXPORT_BUFFER_NAME);

        let extended = self.push_node([element_type_tag, element_type]);
        let resource = self.push_node([
            handle_id, undef_md, name, space_md, register, range, shape,
            // Globally coherent, counter, rasterizer ordered.
            false_md, false_md, false_md, extended,
        ]);
        self.append_uav(resource);

        self.find_or_add_space(ResourceClass::Uav).insert(HandleEntry {
            class: ResourceClass::Uav,
            handle_id: binding.handle_id,
            name: Some(EXPORT_BUFFER_NAME.to_string()),
            space: binding.space,
            base_register: binding.register,
            range: count,
            shape: ResourceShape::TypedBuffer,
            component: ComponentType::U32,
            byte_stride: None,
            globally_coherent: false,
            ty: program.find_type_or_add(TypeDef::Buffer {
                element: Some(u32_ty),
                sampler_mode: ResourceSamplerMode::Writable,
                texel: Format::R32UInt,
            }),
            node: (resource - 1) as u32,
        });
        self.export = Some(binding);
        Ok(binding)
    }

    /// Add the resource node (plus one) to the UAV list, creating the list
    /// (and `dx.resources` itself) if needed.
    fn append_uav(&mut self, resource: u64) {
        let uav_slot = ResourceClass::Uav as usize;
        let list = self
            .resource_list
            .and_then(|id| self.row(id))
            .map(|&(record, _)| record);

        let Some(list_record) = list else {
            let uavs = self.push_node([resource]);
            let list = self.push_node([0, uavs, 0, 0]);
            self.resource_list = Some((list - 1) as u32);
            self.push(
                Record::new(codes::metadata::NAME, RESOURCES.bytes().map(u64::from)),
                Row::Other,
            );
            self.push(
                Record::new(codes::metadata::NAMED_NODE, [list - 1]),
                Row::Other,
            );
            return;
        };

        let uavs = self.records[list_record].op(uav_slot);
        let existing = uavs
            .checked_sub(1)
            .and_then(|id| self.row(id as u32))
            .map(|&(record, _)| record);
        match existing {
            Some(uav_record) => self.records[uav_record].ops.push(resource),
            None => {
                let uavs = self.push_node([resource]);
                let ops = &mut self.records[list_record].ops;
                if ops.len() <= uav_slot {
                    ops.resize(uav_slot + 1, 0);
                }
                ops[uav_slot] = uavs;
            }
        }
    }

    /// Re-linearize all records, emitting each node only once everything it
    /// refers to has been emitted, and named nodes last.
    pub fn stitch(
        &self,
        scan: &mut PhysicalBlockScan,
        reloc: &Relocation<'_>,
    ) -> Result<MetadataRemap, Error> {
        if self.records.is_empty() {
            return Ok(MetadataRemap::default());
        }

        let mut new_ids: Vec<Option<u32>> = vec![None; self.rows.len()];
        let mut next_id = 0;
        let mut emitted = vec![false; self.records.len()];
        let mut out = Vec::with_capacity(self.records.len());
        let is_named = |code| matches!(code, codes::metadata::NAME | codes::metadata::NAMED_NODE);

        loop {
            let mut progress = false;
            for (i, record) in self.records.iter().enumerate() {
                if emitted[i] || is_named(record.code) {
                    continue;
                }

                let mut record = record.clone();
                match record.code {
                    codes::metadata::NODE | codes::metadata::DISTINCT_NODE => {
                        let resolved = record
                            .ops
                            .iter()
                            .map(|&op| match op {
                                0 => Some(0),
                                _ => new_ids
                                    .get(usize::try_from(op - 1).ok()?)
                                    .copied()
                                    .flatten()
                                    .map(|id| u64::from(id) + 1),
                            })
                            .collect::<Option<SmallVec<[u64; 8]>>>();
                        match resolved {
                            Some(ops) => record.ops = ops,
                            None => continue,
                        }
                    }
                    codes::metadata::VALUE => {
                        if let Some(&(_, Row::Value { value, .. })) =
                            self.record_ids[i].and_then(|id| self.row(id))
                        {
                            if record.ops.len() < 2 {
                                record.ops.resize(2, 0);
                            }
                            record.ops[1] = reloc.value(value)?.into();
                        }
                    }
                    _ => {}
                }

                emitted[i] = true;
                progress = true;
                if let Some(id) = self.record_ids[i] {
                    new_ids[id as usize] = Some(next_id);
                    next_id += 1;
                }
                out.push(record);
            }
            if !progress {
                break;
            }
        }

        for (i, record) in self.records.iter().enumerate() {
            match record.code {
                codes::metadata::NAME => {
                    emitted[i] = true;
                    out.push(record.clone());
                }
                codes::metadata::NAMED_NODE => {
                    let ops = record
                        .ops
                        .iter()
                        .map(|&op| {
                            new_ids
                                .get(op as usize)
                                .copied()
                                .flatten()
                                .map(u64::from)
                        })
                        .collect::<Option<SmallVec<[u64; 8]>>>();
                    let Some(ops) = ops else {
                        continue;
                    };
                    emitted[i] = true;
                    out.push(Record {
                        ops,
                        ..record.clone()
                    });
                }
                _ => {}
            }
        }

        let pending = emitted.iter().filter(|&&e| !e).count();
        if pending > 0 {
            return Err(Error::MetadataCycle { pending });
        }

        let table = new_ids
            .iter()
            .take(self.source_count as usize)
            .map(|id| id.unwrap_or(0))
            .collect();
        let remap = MetadataRemap::new(table, self.source_count, self.rows.len() as u32);

        // Thread the records back through the source layout (keeping any
        // abbreviation definitions in place), appending the rest.
        let mut block = match &self.source {
            Some(source) => source.clone(),
            None => Block::new(codes::block::METADATA, 0, 3),
        };
        let mut out = out.into_iter();
        for element in &mut block.elements {
            if let Element::Record(slot) = element {
                if let Some(record) = out.next() {
                    *slot = record;
                }
            }
        }
        for record in out {
            block.push_record(record);
        }

        match self.uid {
            Some(uid) => scan.replace(uid, block)?,
            None => {
                scan.insert(
                    block,
                    &[
                        PhysicalBlockKind::ValueSymbolTable,
                        PhysicalBlockKind::Function,
                    ],
                );
            }
        }
        Ok(remap)
    }

    /// Number of metadata ids defined at module level (before compiling).
    pub fn source_count(&self) -> u32 {
        self.source_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::dxil::ids::{IdKind, IdRemapper};
    use crate::il::ConstDef;
    use crate::llvm::{Bitstream, BITCODE_MAGIC};
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn scan_with(types: Block, metadata: Block) -> PhysicalBlockScan {
        let mut module = Block::new(codes::block::MODULE, 1, 3);
        module.push_record(Record::new(codes::module::VERSION, [1]));
        module.elements.push(Element::Block(types));
        module.elements.push(Element::Block(metadata));
        PhysicalBlockScan::scan(Bitstream {
            magic: BITCODE_MAGIC,
            blocks: vec![module],
        })
        .unwrap()
    }

    fn i32_types() -> Block {
        let mut types = Block::new(codes::block::TYPE_NEW, 2, 4);
        types.push_record(Record::new(codes::types::NUMENTRY, [1]));
        types.push_record(Record::new(codes::types::INTEGER, [32]));
        types
    }

    fn string(s: &str) -> Record {
        Record::new(codes::metadata::STRING_OLD, s.bytes().map(u64::from))
    }

    #[test]
    fn forward_references_emit_in_dependency_order() {
        // A -> B -> C, each referring to the next (not yet defined) node.
        let mut block = Block::new(codes::block::METADATA, 3, 3);
        block.push_record(Record::new(codes::metadata::NODE, [2]));
        block.push_record(Record::new(codes::metadata::NODE, [3]));
        block.push_record(Record::new(codes::metadata::NODE, []));
        block.push_record(string("root"));
        block.push_record(Record::new(codes::metadata::NAME, "a".bytes().map(u64::from)));
        block.push_record(Record::new(codes::metadata::NAMED_NODE, [0]));

        let mut scan = scan_with(i32_types(), block);
        let mut program = Program::new(Rc::new(Context::new()));
        let types = TypeTable::parse(scan.get(PhysicalBlockKind::Types).unwrap(), &program).unwrap();
        let md = {
            let mut cx = ParseCx::new(&mut program, &types);
            MetadataBlock::parse(&scan, &mut cx).unwrap()
        };

        let remapper = IdRemapper::default();
        let identity = MetadataRemap::default();
        let reloc = Relocation {
            remapper: &remapper,
            metadata: &identity,
            blocks: None,
            insts: None,
        };
        let remap = md.stitch(&mut scan, &reloc).unwrap();

        let stitched: Vec<_> = scan
            .get(PhysicalBlockKind::Metadata)
            .unwrap()
            .records()
            .map(|r| (r.code, r.ops.to_vec()))
            .collect();
        assert_eq!(
            stitched,
            [
                (codes::metadata::NODE, vec![]),
                (codes::metadata::STRING_OLD, "root".bytes().map(u64::from).collect()),
                (codes::metadata::NODE, vec![1]),
                (codes::metadata::NODE, vec![3]),
                (codes::metadata::NAME, vec![u64::from(b'a')]),
                (codes::metadata::NAMED_NODE, vec![3]),
            ]
        );

        // A ended up last, after C, the string and B.
        assert_eq!(remap.map(0), 3);
        assert_eq!(remap.map(1), 2);
        assert_eq!(remap.map(2), 0);
        assert_eq!(remap.map(3), 1);
        assert_eq!(remap.map_plus_one(0), 0);
    }

    #[test]
    fn unresolvable_cycle_is_an_error() {
        let mut block = Block::new(codes::block::METADATA, 3, 3);
        block.push_record(Record::new(codes::metadata::NODE, [2]));
        block.push_record(Record::new(codes::metadata::NODE, [1]));

        let mut scan = scan_with(i32_types(), block);
        let mut program = Program::new(Rc::new(Context::new()));
        let types = TypeTable::parse(scan.get(PhysicalBlockKind::Types).unwrap(), &program).unwrap();
        let md = {
            let mut cx = ParseCx::new(&mut program, &types);
            MetadataBlock::parse(&scan, &mut cx).unwrap()
        };

        let remapper = IdRemapper::default();
        let identity = MetadataRemap::default();
        let reloc = Relocation {
            remapper: &remapper,
            metadata: &identity,
            blocks: None,
            insts: None,
        };
        assert!(matches!(
            md.stitch(&mut scan, &reloc),
            Err(Error::MetadataCycle { pending: 2 })
        ));
    }

    /// One `RWBuffer<uint>` at `u2`, range 1.
    fn one_uav(cx: &mut ParseCx<'_>) -> Block {
        let mut block = Block::new(codes::block::METADATA, 3, 3);
        let i32_ty = cx.types.get(0).unwrap();
        for v in [0, 1, 2, 10] {
            let id = cx.ids.next_id();
            let value = cx.define(IdKind::Constant, Some(0)).unwrap();
            cx.program.bind_constant(
                value,
                ConstDef {
                    ty: i32_ty,
                    kind: ConstKind::Int(v),
                },
                true,
            );
            block.push_record(Record::new(codes::metadata::VALUE, [0, id.into()]));
        }
        // md0..md3 are the constants 0, 1, 2 and 10.
        block.push_record(string("u"));
        block.push_record(Record::new(
            codes::metadata::NODE,
            [1, 0, 5, 1, 3, 2, 4, 0, 0, 0, 0],
        ));
        block.push_record(Record::new(codes::metadata::NODE, [6]));
        block.push_record(Record::new(codes::metadata::NODE, [0, 7, 0, 0]));
        block.push_record(Record::new(
            codes::metadata::NAME,
            RESOURCES.bytes().map(u64::from),
        ));
        block.push_record(Record::new(codes::metadata::NAMED_NODE, [7]));
        block
    }

    #[test]
    fn reflects_resources() {
        let mut program = Program::new(Rc::new(Context::new()));
        let types = TypeTable::parse(&i32_types(), &program).unwrap();
        let mut cx = ParseCx::new(&mut program, &types);
        let scan = scan_with(i32_types(), one_uav(&mut cx));
        let md = MetadataBlock::parse(&scan, &mut cx).unwrap();

        let entry = md.handle(ResourceClass::Uav, 0).unwrap();
        assert_eq!(entry.name.as_deref(), Some("u"));
        assert_eq!((entry.space, entry.base_register, entry.range), (0, 2, 1));
        assert_eq!(entry.shape, ResourceShape::TypedBuffer);
        assert_eq!(md.space(ResourceClass::Uav).unwrap().register_bound, 3);
        assert!(md.space(ResourceClass::Srv).is_none());
    }

    #[test]
    fn export_resources_are_append_only() {
        let mut program = Program::new(Rc::new(Context::new()));
        let mut types = TypeTable::parse(&i32_types(), &program).unwrap();
        let (mut md, mut value_types) = {
            let mut cx = ParseCx::new(&mut program, &types);
            let scan = scan_with(i32_types(), one_uav(&mut cx));
            let md = MetadataBlock::parse(&scan, &mut cx).unwrap();
            (md, cx.value_types)
        };
        let before = md.handle(ResourceClass::Uav, 0).cloned().unwrap();

        let binding = md
            .compile_export_resources(3, &mut program, &mut types, &mut value_types)
            .unwrap();
        assert_eq!(binding.handle_id, 1);
        assert_eq!(binding.register, 3);
        assert_eq!(binding.count, 3);
        assert_eq!(md.export_binding(), Some(binding));

        let after = md.handle(ResourceClass::Uav, 0).unwrap();
        assert_eq!(
            (after.handle_id, after.space, after.base_register, after.range),
            (before.handle_id, before.space, before.base_register, before.range)
        );
        let export = md.handle(ResourceClass::Uav, 1).unwrap();
        assert_eq!((export.base_register, export.range), (3, 3));
        assert_eq!(md.space(ResourceClass::Uav).unwrap().register_bound, 6);

        // The UAV list gained the new resource, after the existing one.
        let list = md.resource_list.and_then(|id| md.node(id)).unwrap().to_vec();
        let uavs = md.node((list[1] - 1) as u32).unwrap();
        assert_eq!(uavs.len(), 2);
        assert_eq!(uavs[0], 6);
    }
}
