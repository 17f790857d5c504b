//! Linear traversal over user instructions, tolerating block splits.

use crate::il::{BasicBlock, InstDef, Program};

/// Position of an instruction: function index, block, instruction index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstCursor {
    pub func: usize,
    pub block: BasicBlock,
    pub index: usize,
}

impl InstCursor {
    pub fn inst<'a>(&self, program: &'a Program) -> &'a InstDef {
        &program.functions[self.func].blocks[self.block].insts[self.index]
    }
}

/// Call `f` on every instruction of every function, skipping blocks marked
/// `no_instrumentation`.
///
/// `f` may restructure the function freely (split blocks, insert blocks and
/// instructions) as long as it returns where the visited instruction ended
/// up: the traversal resumes right after that position, so neither the
/// visited instruction nor anything inserted before it is visited again.
pub fn visit_user_instructions(
    program: &mut Program,
    mut f: impl FnMut(&mut Program, InstCursor) -> InstCursor,
) {
    for func in 0..program.functions.len() {
        let mut position = 0;
        while let Some(&block) = program.functions[func].blocks.order().get(position) {
            if program.functions[func].blocks[block].no_instrumentation {
                position += 1;
                continue;
            }

            let mut cursor = InstCursor {
                func,
                block,
                index: 0,
            };
            while cursor.index < program.functions[func].blocks[cursor.block].insts.len() {
                cursor = f(program, cursor);
                cursor.index += 1;
            }

            let blocks = &program.functions[func].blocks;
            position = blocks.position(cursor.block).unwrap_or(position) + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::il::{Emitter, Function, InstKind, TypeDef};
    use std::rc::Rc;

    #[test]
    fn visits_each_user_instruction_once() {
        let mut program = Program::new(Rc::new(Context::new()));
        let void = program.find_type_or_add(TypeDef::Void);
        let id = program.alloc_value();
        let mut func = Function::new(id, void);
        let entry = func.blocks.append();
        let buffer_ty = program.uint_type(32);
        for _ in 0..3 {
            let buffer = program.alloc_typed(buffer_ty);
            let index = program.uint32(0);
            let result = program.alloc_typed(buffer_ty);
            func.blocks[entry].insts.push(InstDef::new(
                Some(result),
                InstKind::LoadBuffer { buffer, index },
            ));
        }
        func.blocks[entry]
            .insts
            .push(InstDef::new(None, InstKind::Return { value: None }));
        program.functions.push(func);

        let mut visited = 0;
        visit_user_instructions(&mut program, |program, cursor| {
            visited += 1;
            if !matches!(cursor.inst(program).kind, InstKind::LoadBuffer { .. }) {
                return cursor;
            }

            // Guard every load with a (never taken) branch to a side block.
            let func = &mut program.functions[cursor.func];
            let resume = func.split_block(cursor.block, cursor.index);
            let side = func.blocks.insert_after(cursor.block);
            func.blocks[side].no_instrumentation = true;

            let cond = program.bool_constant(false);
            Emitter::append(program, cursor.func, cursor.block).branch_conditional(
                cond, side, resume,
            );
            Emitter::append(program, cursor.func, side).branch(resume);

            InstCursor {
                block: resume,
                index: 0,
                ..cursor
            }
        });

        // 3 loads and the return, but no instrumentation.
        assert_eq!(visited, 4);
        assert_eq!(program.functions[0].blocks.len(), 1 + 3 * 2);
    }
}
