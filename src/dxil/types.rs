//! Type table (`TYPE_BLOCK_NEW`): parsed into interned IL types, with new
//! types appended on demand while compiling.

use crate::context::{Context, Type};
use crate::dxil::Error;
use crate::il::{AddressSpace, Program, TypeDef};
use crate::llvm::{codes, Block, Element, Record};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[derive(Clone, Debug, Default)]
pub struct TypeTable {
    /// IL type of each table entry.
    types: Vec<Type>,

    /// Table entries in terms of other table indices.
    raw: Vec<RawType>,

    /// Names of named struct entries.
    names: FxHashMap<String, u32>,

    /// Table entry for (normalized) IL types, first entry wins.
    indices: FxHashMap<Type, u32>,

    /// Records to append to the table while stitching.
    pending: Vec<Record>,
}

/// Raw, unresolved type table entry.
#[derive(Clone, Debug)]
enum RawType {
    Leaf(TypeDef),
    Pointer { pointee: u64, address_space: u64 },
    Vector { element: u64, dim: u64 },
    Array { element: u64, count: u64 },
    Struct { members: SmallVec<[u64; 4]> },
    Function { ret: u64, params: SmallVec<[u64; 4]>, variadic: bool },
    Opaque,
}

impl RawType {
    fn from_record(record: &Record, index: usize) -> Result<Self, Error> {
        let malformed = || Error::MalformedRecord {
            block: "type table",
            code: record.code,
        };
        let op = |i: usize| record.ops.get(i).copied().ok_or_else(malformed);

        Ok(match record.code {
            codes::types::VOID => RawType::Leaf(TypeDef::Void),
            codes::types::HALF => RawType::Leaf(TypeDef::Fp { bit_width: 16 }),
            codes::types::FLOAT => RawType::Leaf(TypeDef::Fp { bit_width: 32 }),
            codes::types::DOUBLE => RawType::Leaf(TypeDef::Fp { bit_width: 64 }),
            codes::types::LABEL => RawType::Leaf(TypeDef::Label),
            codes::types::METADATA => RawType::Leaf(TypeDef::Metadata),
            codes::types::INTEGER => match op(0)? {
                1 => RawType::Leaf(TypeDef::Bool),
                width => RawType::Leaf(TypeDef::Int {
                    bit_width: u8::try_from(width).map_err(|_| malformed())?,
                    signed: false,
                }),
            },
            codes::types::POINTER => RawType::Pointer {
                pointee: op(0)?,
                address_space: record.op(1),
            },
            codes::types::VECTOR => RawType::Vector {
                dim: op(0)?,
                element: op(1)?,
            },
            codes::types::ARRAY => RawType::Array {
                count: op(0)?,
                element: op(1)?,
            },
            codes::types::STRUCT_ANON | codes::types::STRUCT_NAMED => RawType::Struct {
                members: record.ops.iter().skip(1).copied().collect(),
            },
            codes::types::OPAQUE => RawType::Opaque,
            codes::types::FUNCTION => RawType::Function {
                variadic: record.op(0) != 0,
                ret: op(1)?,
                params: record.ops.iter().skip(2).copied().collect(),
            },
            codes::types::FUNCTION_OLD => RawType::Function {
                variadic: record.op(0) != 0,
                ret: op(2)?,
                params: record.ops.iter().skip(3).copied().collect(),
            },
            _ => RawType::Leaf(TypeDef::Unexposed { tag: index as u32 }),
        })
    }
}

impl TypeTable {
    pub fn parse(block: &Block, program: &Program) -> Result<Self, Error> {
        let mut raw = vec![];
        let mut names = FxHashMap::default();
        let mut pending_name = None;
        for record in block.records() {
            match record.code {
                codes::types::NUMENTRY => continue,
                codes::types::STRUCT_NAME => {
                    pending_name = Some(record.ops_as_string(0));
                    continue;
                }
                codes::types::STRUCT_NAMED | codes::types::OPAQUE => {
                    if let Some(name) = pending_name.take() {
                        names.insert(name, raw.len() as u32);
                    }
                }
                _ => {}
            }
            raw.push(RawType::from_record(record, raw.len())?);
        }

        let mut resolver = Resolver {
            cx: program.cx(),
            raw: &raw,
            resolved: vec![None; raw.len()],
            visiting: vec![false; raw.len()],
        };
        let types = (0..raw.len())
            .map(|i| resolver.resolve(i as u64))
            .collect::<Result<Vec<_>, _>>()?;

        let mut indices = FxHashMap::default();
        for (i, &ty) in types.iter().enumerate() {
            indices.entry(normalize(program.cx(), ty)).or_insert(i as u32);
        }

        Ok(TypeTable {
            types,
            raw,
            names,
            indices,
            pending: vec![],
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, index: u64) -> Result<Type, Error> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.types.get(i))
            .copied()
            .ok_or(Error::UnresolvedTypeIndex(index))
    }

    pub fn named(&self, name: &str) -> Option<u32> {
        self.names.get(name).copied()
    }

    fn raw(&self, index: u64) -> Option<&RawType> {
        self.raw.get(usize::try_from(index).ok()?)
    }

    /// Table index of `ty`, if it's already in the table.
    pub fn find(&self, cx: &Context, ty: Type) -> Option<u32> {
        self.indices.get(&normalize(cx, ty)).copied()
    }

    pub fn pointee(&self, index: u64) -> Option<u64> {
        match self.raw(index)? {
            &RawType::Pointer { pointee, .. } => Some(pointee),
            _ => None,
        }
    }

    /// Return type and parameter types of a function type entry.
    pub fn signature(&self, index: u64) -> Option<(u64, &[u64])> {
        match self.raw(index)? {
            RawType::Function { ret, params, .. } => Some((*ret, params)),
            _ => None,
        }
    }

    pub fn is_struct(&self, index: u64) -> bool {
        matches!(self.raw(index), Some(RawType::Struct { .. }))
    }

    /// Type of the `i`-th element of an aggregate (or vector) entry.
    pub fn element(&self, index: u64, i: u64) -> Option<u64> {
        match self.raw(index)? {
            RawType::Struct { members } => members.get(usize::try_from(i).ok()?).copied(),
            &RawType::Array { element, .. } | &RawType::Vector { element, .. } => Some(element),
            _ => None,
        }
    }

    /// Table index of the function type `ret (params...)`, in terms of
    /// table indices (which keeps named struct identity intact).
    pub fn function_index(&mut self, cx: &Context, ret: u32, params: &[u32]) -> Result<u32, Error> {
        let existing = self.raw.iter().position(|raw| match raw {
            RawType::Function {
                ret: r,
                params: p,
                variadic: false,
            } => {
                *r == u64::from(ret)
                    && p.iter().copied().eq(params.iter().map(|&p| u64::from(p)))
            }
            _ => false,
        });
        if let Some(index) = existing {
            return Ok(index as u32);
        }

        let ty = cx.intern(TypeDef::Function {
            return_type: self.get(ret.into())?,
            params: params
                .iter()
                .map(|&p| self.get(p.into()))
                .collect::<Result<_, _>>()?,
            variadic: false,
        });
        let record = Record::new(
            codes::types::FUNCTION,
            [0, ret.into()]
                .into_iter()
                .chain(params.iter().map(|&p| u64::from(p))),
        );
        Ok(self.push(cx, ty, record))
    }

    /// Table index of a pointer to the table entry `pointee`.
    pub fn pointer_index(
        &mut self,
        cx: &Context,
        pointee: u32,
        address_space: AddressSpace,
    ) -> Result<u32, Error> {
        let address_space_op = address_space.to_dxil();
        let existing = self.raw.iter().position(|raw| {
            matches!(raw, &RawType::Pointer { pointee: p, address_space: a }
                if p == u64::from(pointee) && a == address_space_op)
        });
        if let Some(index) = existing {
            return Ok(index as u32);
        }

        let ty = cx.intern(TypeDef::Pointer {
            pointee: self.get(pointee.into())?,
            address_space,
        });
        let record = Record::new(codes::types::POINTER, [pointee.into(), address_space_op]);
        Ok(self.push(cx, ty, record))
    }

    /// Table index of an array of `count` table entries `element`.
    pub fn array_index(&mut self, cx: &Context, element: u32, count: u64) -> Result<u32, Error> {
        let existing = self.raw.iter().position(|raw| {
            matches!(raw, &RawType::Array { element: e, count: c }
                if e == u64::from(element) && c == count)
        });
        if let Some(index) = existing {
            return Ok(index as u32);
        }

        let ty = cx.intern(TypeDef::Array {
            element: self.get(element.into())?,
            count,
        });
        Ok(self.push(cx, ty, Record::new(codes::types::ARRAY, [count, element.into()])))
    }

    /// Table index of `ty`, compiling it (and its components) into the
    /// table if there's no such entry yet.
    ///
    /// Integer signedness is irrelevant, as DXIL integers are signless.
    pub fn index_of(&mut self, cx: &Context, ty: Type) -> Result<u32, Error> {
        let ty = normalize(cx, ty);
        if let Some(&index) = self.indices.get(&ty) {
            return Ok(index);
        }

        let record = match &cx[ty] {
            TypeDef::Void => Record::new(codes::types::VOID, []),
            TypeDef::Bool => Record::new(codes::types::INTEGER, [1]),
            &TypeDef::Int { bit_width, .. } => {
                Record::new(codes::types::INTEGER, [bit_width.into()])
            }
            TypeDef::Fp { bit_width: 16 } => Record::new(codes::types::HALF, []),
            TypeDef::Fp { bit_width: 32 } => Record::new(codes::types::FLOAT, []),
            TypeDef::Fp { bit_width: 64 } => Record::new(codes::types::DOUBLE, []),
            TypeDef::Label => Record::new(codes::types::LABEL, []),
            TypeDef::Metadata => Record::new(codes::types::METADATA, []),
            &TypeDef::Pointer {
                pointee,
                address_space,
            } => {
                let pointee = self.index_of(cx, pointee)?;
                Record::new(
                    codes::types::POINTER,
                    [pointee.into(), address_space.to_dxil()],
                )
            }
            &TypeDef::Vector { contained, dim } => {
                let element = self.index_of(cx, contained)?;
                Record::new(codes::types::VECTOR, [dim.into(), element.into()])
            }
            &TypeDef::Array { element, count } => {
                let element = self.index_of(cx, element)?;
                Record::new(codes::types::ARRAY, [count, element.into()])
            }
            TypeDef::Struct { members } => {
                let members = members
                    .iter()
                    .map(|&m| self.index_of(cx, m).map(u64::from))
                    .collect::<Result<SmallVec<[u64; 8]>, _>>()?;
                Record::new(
                    codes::types::STRUCT_ANON,
                    std::iter::once(0).chain(members),
                )
            }
            TypeDef::Function {
                return_type,
                params,
                variadic,
            } => {
                let ret = self.index_of(cx, *return_type)?;
                let params = params
                    .iter()
                    .map(|&p| self.index_of(cx, p).map(u64::from))
                    .collect::<Result<SmallVec<[u64; 8]>, _>>()?;
                Record::new(
                    codes::types::FUNCTION,
                    [u64::from(*variadic), ret.into()].into_iter().chain(params),
                )
            }
            other => return Err(Error::UnsupportedType(format!("{other:?}"))),
        };
        Ok(self.push(cx, ty, record))
    }

    /// Table index of the named struct `name`, compiling it with `members`
    /// if there's no such entry yet.
    pub fn index_of_named(
        &mut self,
        cx: &Context,
        name: &str,
        members: &[Type],
    ) -> Result<u32, Error> {
        if let Some(index) = self.named(name) {
            return Ok(index);
        }
        let member_indices = members
            .iter()
            .map(|&m| self.index_of(cx, m).map(u64::from))
            .collect::<Result<SmallVec<[u64; 8]>, _>>()?;

        self.pending.push(Record::new(
            codes::types::STRUCT_NAME,
            name.bytes().map(u64::from),
        ));
        let ty = cx.intern(TypeDef::Struct {
            members: members.iter().copied().collect(),
        });
        let index = self.push(
            cx,
            ty,
            Record::new(
                codes::types::STRUCT_NAMED,
                std::iter::once(0).chain(member_indices),
            ),
        );
        self.names.insert(name.to_string(), index);
        Ok(index)
    }

    fn push(&mut self, cx: &Context, ty: Type, record: Record) -> u32 {
        let index = self.types.len() as u32;
        // NOTE(eddyb) only ever called with records built right here.
        let raw = match RawType::from_record(&record, index as usize) {
            Ok(raw) => raw,
            Err(_) => RawType::Opaque,
        };
        self.raw.push(raw);
        self.types.push(ty);
        self.indices.entry(normalize(cx, ty)).or_insert(index);
        self.pending.push(record);
        index
    }

    /// Append compiled types to the table block, keeping `NUMENTRY` in sync.
    pub fn stitch(&self, block: &mut Block) {
        if self.pending.is_empty() {
            return;
        }
        for element in &mut block.elements {
            if let Element::Record(record) = element {
                if record.code == codes::types::NUMENTRY {
                    record.ops = [self.types.len() as u64].into_iter().collect();
                    break;
                }
            }
        }
        for record in &self.pending {
            block.push_record(record.clone());
        }
    }
}

/// Map every integer type inside `ty` to its (signed) table form.
fn normalize(cx: &Context, ty: Type) -> Type {
    let def = match &cx[ty] {
        &TypeDef::Int { bit_width, .. } => TypeDef::Int {
            bit_width,
            signed: true,
        },
        &TypeDef::Vector { contained, dim } => TypeDef::Vector {
            contained: normalize(cx, contained),
            dim,
        },
        &TypeDef::Matrix {
            contained,
            rows,
            columns,
        } => TypeDef::Matrix {
            contained: normalize(cx, contained),
            rows,
            columns,
        },
        &TypeDef::Pointer {
            pointee,
            address_space,
        } => TypeDef::Pointer {
            pointee: normalize(cx, pointee),
            address_space,
        },
        &TypeDef::Array { element, count } => TypeDef::Array {
            element: normalize(cx, element),
            count,
        },
        TypeDef::Struct { members } => TypeDef::Struct {
            members: members.iter().map(|&m| normalize(cx, m)).collect(),
        },
        TypeDef::Function {
            return_type,
            params,
            variadic,
        } => TypeDef::Function {
            return_type: normalize(cx, *return_type),
            params: params.iter().map(|&p| normalize(cx, p)).collect(),
            variadic: *variadic,
        },
        _ => return ty,
    };
    cx.intern(def)
}

struct Resolver<'a> {
    cx: &'a Context,
    raw: &'a [RawType],
    resolved: Vec<Option<Type>>,
    visiting: Vec<bool>,
}

impl Resolver<'_> {
    fn resolve(&mut self, index: u64) -> Result<Type, Error> {
        let i = usize::try_from(index)
            .ok()
            .filter(|&i| i < self.raw.len())
            .ok_or(Error::UnresolvedTypeIndex(index))?;
        if let Some(ty) = self.resolved[i] {
            return Ok(ty);
        }

        // NOTE(eddyb) recursive (named) types can't be interned structurally,
        // so the back-edge of the cycle becomes an opaque type.
        if self.visiting[i] {
            return Ok(self.cx.intern(TypeDef::Unexposed { tag: i as u32 }));
        }
        self.visiting[i] = true;

        let raw = self.raw;
        let def = match &raw[i] {
            RawType::Leaf(def) => def.clone(),
            RawType::Opaque => TypeDef::Unexposed { tag: i as u32 },
            &RawType::Pointer {
                pointee,
                address_space,
            } => TypeDef::Pointer {
                pointee: self.resolve(pointee)?,
                address_space: AddressSpace::from_dxil(address_space),
            },
            &RawType::Vector { element, dim } => TypeDef::Vector {
                contained: self.resolve(element)?,
                dim: dim as u8,
            },
            &RawType::Array { element, count } => TypeDef::Array {
                element: self.resolve(element)?,
                count,
            },
            RawType::Struct { members } => TypeDef::Struct {
                members: members
                    .iter()
                    .map(|&m| self.resolve(m))
                    .collect::<Result<_, _>>()?,
            },
            RawType::Function {
                ret,
                params,
                variadic,
            } => TypeDef::Function {
                return_type: self.resolve(*ret)?,
                params: params
                    .iter()
                    .map(|&p| self.resolve(p))
                    .collect::<Result<_, _>>()?,
                variadic: *variadic,
            },
        };

        let ty = self.cx.intern(def);
        self.visiting[i] = false;
        self.resolved[i] = Some(ty);
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn table_block() -> Block {
        let mut block = Block::new(codes::block::TYPE_NEW, 1, 4);
        block.push_record(Record::new(codes::types::NUMENTRY, [5]));
        // 0: i32
        block.push_record(Record::new(codes::types::INTEGER, [32]));
        // 1: %node = type { i32, %node* }
        block.push_record(Record::new(
            codes::types::STRUCT_NAME,
            b"node".iter().map(|&c| c.into()),
        ));
        block.push_record(Record::new(codes::types::STRUCT_NAMED, [0, 0, 2]));
        // 2: %node*
        block.push_record(Record::new(codes::types::POINTER, [1, 0]));
        // 3: <4 x i32>
        block.push_record(Record::new(codes::types::VECTOR, [4, 0]));
        // 4: void
        block.push_record(Record::new(codes::types::VOID, []));
        block
    }

    #[test]
    fn parse_with_forward_references() {
        let program = Program::new(Rc::new(Context::new()));
        let cx = program.cx().clone();
        let table = TypeTable::parse(&table_block(), &program).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.named("node"), Some(1));

        let i32_ty = table.get(0).unwrap();
        assert_eq!(
            cx[i32_ty],
            TypeDef::Int {
                bit_width: 32,
                signed: false
            }
        );
        let TypeDef::Struct { members } = &cx[table.get(1).unwrap()] else {
            panic!("expected a struct")
        };
        assert_eq!(members[0], i32_ty);
        assert!(matches!(cx[members[1]], TypeDef::Pointer { .. }));
        assert!(table.get(5).is_err());
    }

    #[test]
    fn compile_is_signedness_insensitive() {
        let program = Program::new(Rc::new(Context::new()));
        let cx = program.cx().clone();
        let mut table = TypeTable::parse(&table_block(), &program).unwrap();

        let u32_ty = program.uint_type(32);
        assert_eq!(table.index_of(&cx, u32_ty).unwrap(), 0);
        let uvec4 = cx.intern(TypeDef::Vector {
            contained: u32_ty,
            dim: 4,
        });
        assert_eq!(table.index_of(&cx, uvec4).unwrap(), 3);

        let u8_ptr = cx.intern(TypeDef::Pointer {
            pointee: program.uint_type(8),
            address_space: AddressSpace::Function,
        });
        assert_eq!(table.index_of(&cx, u8_ptr).unwrap(), 6);
        assert_eq!(table.index_of_named(&cx, "node", &[]).unwrap(), 1);

        let mut block = table_block();
        table.stitch(&mut block);
        let records: Vec<_> = block.records().collect();
        assert_eq!(&records[0].ops[..], &[7]);
        assert_eq!(records[records.len() - 2].code, codes::types::INTEGER);
        assert_eq!(&records[records.len() - 1].ops[..], &[5, 0]);
    }

    #[test]
    fn index_level_construction_keeps_names() {
        let program = Program::new(Rc::new(Context::new()));
        let cx = program.cx().clone();
        let mut table = TypeTable::parse(&table_block(), &program).unwrap();

        // `void (%node, i32)` must refer to `%node` itself.
        let fn_index = table.function_index(&cx, 4, &[1, 0]).unwrap();
        assert_eq!(fn_index, 5);
        assert_eq!(table.function_index(&cx, 4, &[1, 0]).unwrap(), 5);
        assert_eq!(table.signature(5), Some((4, &[1, 0][..])));

        assert_eq!(table.pointer_index(&cx, 1, AddressSpace::Function).unwrap(), 2);
        let array = table.array_index(&cx, 1, 3).unwrap();
        assert_eq!(table.element(array.into(), 2), Some(1));
        assert_eq!(table.element(1, 1), Some(2));
        assert!(table.is_struct(1));
        assert_eq!(table.pointee(2), Some(1));
        assert_eq!(table.find(&cx, program.uint_type(32)), Some(0));
    }
}
