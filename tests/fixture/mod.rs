//! Minimal DXIL modules, built record by record.

#![allow(dead_code)]

use dxilt::llvm::codes::{self, block};
use dxilt::llvm::{signed, Bitstream, Block, Element, Record, BITCODE_MAGIC};

fn chars(s: &str) -> impl Iterator<Item = u64> + '_ {
    s.bytes().map(u64::from)
}

fn named(name: &str, code: u32, ops: impl IntoIterator<Item = u64>) -> [Record; 2] {
    [
        Record::new(codes::types::STRUCT_NAME, chars(name)),
        Record::new(code, ops),
    ]
}

fn function_record(type_index: u64, is_declaration: bool) -> Record {
    // `[type, callingconv, isproto, linkage, paramattr, alignment, section,
    //   visibility, gc, unnamed_addr]`
    let mut ops = [0; 10];
    ops[0] = type_index;
    ops[2] = is_declaration as u64;
    Record::new(codes::module::FUNCTION, ops)
}

fn module(elements: impl IntoIterator<Item = Element>) -> Vec<u8> {
    let mut module = Block::new(block::MODULE, 0, 3);
    module.push_record(Record::new(codes::module::VERSION, [1]));
    module.elements.extend(elements);
    Bitstream {
        magic: BITCODE_MAGIC,
        blocks: vec![module],
    }
    .write_to_bytes()
    .unwrap()
}

fn block_of(id: u32, records: impl IntoIterator<Item = Record>) -> Element {
    let mut b = Block::new(id, 0, 4);
    for record in records {
        b.push_record(record);
    }
    Element::Block(b)
}

fn symbol(value: u32, name: &str) -> Record {
    Record::new(
        codes::value_symtab::ENTRY,
        std::iter::once(value.into()).chain(chars(name)),
    )
}

/// `void main()`, with `body` (starting at value id 1), and no constants.
pub fn main_with_body(body: impl IntoIterator<Item = Record>) -> Vec<u8> {
    let types = [
        Record::new(codes::types::NUMENTRY, [3]),
        Record::new(codes::types::VOID, []),
        Record::new(codes::types::FUNCTION, [0, 0]),
        Record::new(codes::types::POINTER, [1, 0]),
    ];
    module([
        block_of(block::TYPE_NEW, types),
        Element::Record(function_record(1, false)),
        block_of(block::VALUE_SYMTAB, [symbol(0, "main")]),
        block_of(block::FUNCTION, body),
    ])
}

/// `void main() { ret void; }`, and nothing else.
pub fn empty_shader() -> Vec<u8> {
    main_with_body([
        Record::new(codes::function::DECLAREBLOCKS, [1]),
        Record::new(codes::function::INST_RET, []),
    ])
}

/// Two function bodies, both adding up the module constant `i32 7`:
///
/// ```text
/// void helper() { %a = add 7, 7; ret void; }
/// void main() { %a = add 7, 7; %b = add %a, 7; %c = add %b, %a; ret void; }
/// ```
pub fn two_functions() -> Vec<u8> {
    let types = [
        Record::new(codes::types::NUMENTRY, [4]),
        Record::new(codes::types::INTEGER, [32]),
        Record::new(codes::types::VOID, []),
        Record::new(codes::types::FUNCTION, [0, 1]),
        Record::new(codes::types::POINTER, [2, 0]),
    ];
    // Value 2.
    let constants = [
        Record::new(codes::constants::SETTYPE, [0]),
        Record::new(codes::constants::INTEGER, [signed::encode(7)]),
    ];

    // Both bodies start at value id 3.
    let add = |lhs, rhs| Record::new(codes::function::INST_BINOP, [lhs, rhs, codes::binop::ADD]);
    let helper = [
        Record::new(codes::function::DECLAREBLOCKS, [1]),
        add(1, 1),
        Record::new(codes::function::INST_RET, []),
    ];
    let main = [
        Record::new(codes::function::DECLAREBLOCKS, [1]),
        add(1, 1),
        add(1, 2),
        add(1, 2),
        Record::new(codes::function::INST_RET, []),
    ];

    module([
        block_of(block::TYPE_NEW, types),
        Element::Record(function_record(2, false)),
        Element::Record(function_record(2, false)),
        block_of(block::CONSTANTS, constants),
        block_of(block::VALUE_SYMTAB, [symbol(0, "helper"), symbol(1, "main")]),
        block_of(block::FUNCTION, helper),
        block_of(block::FUNCTION, main),
    ])
}

/// Value ids of [`buffer_load_shader`].
pub mod ids {
    pub const CREATE_HANDLE: u32 = 0;
    pub const BUFFER_LOAD: u32 = 1;
    pub const MAIN: u32 = 2;

    /// `createHandle` result (the first instruction of `main`).
    pub const HANDLE: u32 = 12;
}

/// `main` loading element 0 of a `RWBuffer<uint>` (UAV range 0, at `u2`):
///
/// ```text
/// %h = call @dx.op.createHandle(i32 57, i8 1, i32 0, i32 0, i1 false)
/// %r = call @dx.op.bufferLoad.i32(i32 68, %h, i32 0, i32 undef)
/// %x = extractvalue %r, 0
/// ret void
/// ```
pub fn buffer_load_shader() -> Vec<u8> {
    let mut types = vec![
        Record::new(codes::types::NUMENTRY, [13]),
        // 0..=4: i32, void, i8, i1, i8*
        Record::new(codes::types::INTEGER, [32]),
        Record::new(codes::types::VOID, []),
        Record::new(codes::types::INTEGER, [8]),
        Record::new(codes::types::INTEGER, [1]),
        Record::new(codes::types::POINTER, [2, 0]),
    ];
    // 5: %dx.types.Handle = { i8* }
    types.extend(named("dx.types.Handle", codes::types::STRUCT_NAMED, [0, 4]));
    // 6: void(), 7: createHandle
    types.push(Record::new(codes::types::FUNCTION, [0, 1]));
    types.push(Record::new(codes::types::FUNCTION, [0, 5, 0, 2, 0, 0, 3]));
    // 8: %dx.types.ResRet.i32 = { i32, i32, i32, i32, i32 }
    types.extend(named(
        "dx.types.ResRet.i32",
        codes::types::STRUCT_NAMED,
        [0, 0, 0, 0, 0, 0],
    ));
    // 9: bufferLoad, 10..=12: pointers to the function types
    types.push(Record::new(codes::types::FUNCTION, [0, 8, 0, 5, 0, 0]));
    for fn_type in [6, 7, 9] {
        types.push(Record::new(codes::types::POINTER, [fn_type, 0]));
    }

    // Values 3..=11.
    let int = |v: i64| Record::new(codes::constants::INTEGER, [signed::encode(v)]);
    let constants = [
        Record::new(codes::constants::SETTYPE, [0]),
        int(57),
        int(68),
        int(0),
        int(1),
        int(2),
        int(10),
        Record::new(codes::constants::UNDEF, []),
        Record::new(codes::constants::SETTYPE, [2]),
        int(1),
        Record::new(codes::constants::SETTYPE, [3]),
        int(0),
    ];

    // md0..md3: the constants 0, 1, 2 and 10, md4: "u", md5: the UAV,
    // md6: the UAV list, md7: the resource lists.
    let metadata = [
        Record::new(codes::metadata::VALUE, [0, 5]),
        Record::new(codes::metadata::VALUE, [0, 6]),
        Record::new(codes::metadata::VALUE, [0, 7]),
        Record::new(codes::metadata::VALUE, [0, 8]),
        Record::new(codes::metadata::STRING_OLD, chars("u")),
        Record::new(codes::metadata::NODE, [1, 0, 5, 1, 3, 2, 4, 0, 0, 0, 0]),
        Record::new(codes::metadata::NODE, [6]),
        Record::new(codes::metadata::NODE, [0, 7, 0, 0]),
        Record::new(codes::metadata::NAME, chars("dx.resources")),
        Record::new(codes::metadata::NAMED_NODE, [7]),
    ];

    let symbols = [
        symbol(ids::CREATE_HANDLE, "dx.op.createHandle"),
        symbol(ids::BUFFER_LOAD, "dx.op.bufferLoad.i32"),
        symbol(ids::MAIN, "main"),
    ];

    // Operands are relative to the id of the instruction (12 onwards).
    let call = codes::call::EXPLICIT_TYPE;
    let body = [
        Record::new(codes::function::DECLAREBLOCKS, [1]),
        Record::new(codes::function::INST_CALL, [0, call, 7, 12, 9, 2, 7, 7, 1]),
        Record::new(codes::function::INST_CALL, [0, call, 9, 12, 9, 1, 8, 4]),
        Record::new(codes::function::INST_EXTRACTVAL, [1, 0]),
        Record::new(codes::function::INST_RET, []),
    ];

    module([
        block_of(block::TYPE_NEW, types),
        Element::Record(function_record(7, true)),
        Element::Record(function_record(9, true)),
        Element::Record(function_record(6, false)),
        block_of(block::CONSTANTS, constants),
        block_of(block::METADATA, metadata),
        block_of(block::VALUE_SYMTAB, symbols),
        block_of(block::FUNCTION, body),
    ])
}

/// `bitcode` inside a DXBC container.
pub fn contained(bitcode: &[u8]) -> Vec<u8> {
    // Pixel shader, model 6.0.
    dxilt::dxbc::wrap_bitcode(0x60, bitcode).write()
}
