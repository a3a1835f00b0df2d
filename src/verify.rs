//! Structural verification of rewritten classes
//!
//! This is not a type-checking verifier. It catches the mistakes a bytecode
//! rewriter can actually make: broken offsets, locals outside `max_locals`,
//! operand stack depth exceeding `max_stack`, and operands that point at the
//! wrong kind of constant.

use crate::classfile::code::{
    decode, CodeAttribute, Instruction, Op, CODE_ATTRIBUTE, STACK_MAP_TABLE,
};
use crate::classfile::constant_pool::MemberKind;
use crate::classfile::descriptor::{field_slots, MethodDescriptor};
use crate::classfile::opcodes::*;
use crate::classfile::stack_map::{decode_frames, VerificationType};
use crate::classfile::{
    find_attribute, ClassFile, ClassFileError, Constant, ConstantPool, Member, ACC_ABSTRACT,
    ACC_NATIVE, ACC_STATIC,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed class: {0}")]
    Malformed(#[from] ClassFileError),

    #[error("{method}: {problem}")]
    Method { method: String, problem: Problem },
}

/// What is wrong with a method body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Problem {
    #[error("abstract or native method has a Code attribute")]
    UnexpectedCode,

    #[error("missing Code attribute")]
    MissingCode,

    #[error("more than one Code attribute")]
    DuplicateCode,

    #[error(transparent)]
    Decode(ClassFileError),

    #[error("exception handler {0} has an invalid range")]
    HandlerRange(usize),

    #[error("local {index} used at offset {offset} is outside max_locals {max_locals}")]
    LocalOutOfRange { offset: u32, index: u16, max_locals: u16 },

    #[error("operand of the instruction at offset {offset} is not a {expected}")]
    BadOperand { offset: u32, expected: &'static str },

    #[error("stack map frame at offset {0} does not start an instruction")]
    FrameOffset(u32),

    #[error("stack depth {depth} at offset {offset} exceeds max_stack {max_stack}")]
    StackOverflow { offset: u32, depth: u16, max_stack: u16 },

    #[error("operand stack underflow at offset {0}")]
    StackUnderflow(u32),

    #[error("offset {offset} reached with stack depths {first} and {second}")]
    InconsistentDepth { offset: u32, first: u16, second: u16 },

    #[error("execution falls off the end of the code")]
    FallsOffEnd,
}

pub type Result<T> = std::result::Result<T, VerifyError>;

/// Parse and verify class bytes
pub fn verify_bytes(bytes: &[u8]) -> Result<()> {
    verify_class(&ClassFile::parse(bytes)?)
}

/// Verify an already parsed class
pub fn verify_class(class: &ClassFile) -> Result<()> {
    let pool = &class.constant_pool;
    let class_name = class.name()?;
    if class.super_name()?.is_none() && class_name != "java/lang/Object" {
        return Err(ClassFileError::BadConstantIndex(class.super_class).into());
    }
    for interface in &class.interfaces {
        pool.class_name(*interface)?;
    }
    for field in &class.fields {
        field_slots(class.member_descriptor(field)?)?;
    }
    for method in &class.methods {
        let name = class.member_name(method)?;
        let descriptor = class.member_descriptor(method)?;
        let parsed = MethodDescriptor::parse(descriptor)?;
        verify_method(class, method, &parsed).map_err(|problem| VerifyError::Method {
            method: format!("{}.{}{}", class_name, name, descriptor),
            problem,
        })?;
    }
    Ok(())
}

fn verify_method(
    class: &ClassFile,
    method: &Member,
    descriptor: &MethodDescriptor,
) -> std::result::Result<(), Problem> {
    let pool = &class.constant_pool;
    let code_attributes: Vec<_> = method
        .attributes
        .iter()
        .filter(|a| pool.utf8(a.name_index).map(|n| n == CODE_ATTRIBUTE).unwrap_or(false))
        .collect();

    let bodyless = method.access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0;
    let code = match (bodyless, code_attributes.as_slice()) {
        (true, []) => return Ok(()),
        (true, _) => return Err(Problem::UnexpectedCode),
        (false, []) => return Err(Problem::MissingCode),
        (false, [code]) => CodeAttribute::parse(&code.info).map_err(Problem::Decode)?,
        (false, _) => return Err(Problem::DuplicateCode),
    };

    let instructions = decode(&code.code).map_err(Problem::Decode)?;
    let index_of: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, insn)| (insn.offset, i))
        .collect();
    let code_len = code.code.len() as u32;

    for (i, handler) in code.exception_table.iter().enumerate() {
        let start = handler.start_pc as u32;
        let end = handler.end_pc as u32;
        let target = handler.handler_pc as u32;
        let start_ok = index_of.contains_key(&start);
        let end_ok = end == code_len || index_of.contains_key(&end);
        let catch_ok = handler.catch_type == 0 || pool.class_name(handler.catch_type).is_ok();
        if !(start_ok && end_ok && start < end && index_of.contains_key(&target) && catch_ok) {
            return Err(Problem::HandlerRange(i));
        }
    }

    for insn in &instructions {
        check_locals(insn, code.max_locals)?;
        check_operand(insn, pool)?;
    }

    if let Some(smt) = find_attribute(&code.attributes, pool, STACK_MAP_TABLE) {
        let receiver = usize::from(method.access_flags & ACC_STATIC == 0);
        let initial = vec![VerificationType::Top; receiver + descriptor.params.len()];
        let frames = decode_frames(&code.attributes[smt].info, &initial).map_err(Problem::Decode)?;
        if let Some(frame) = frames.iter().find(|f| !index_of.contains_key(&f.offset)) {
            return Err(Problem::FrameOffset(frame.offset));
        }
    }

    let has_subroutines = instructions
        .iter()
        .any(|i| matches!(i.op.opcode(), JSR | JSR_W | RET));
    if !has_subroutines {
        check_stack_depth(&instructions, &index_of, &code, pool)?;
    }
    Ok(())
}

fn check_locals(insn: &Instruction, max_locals: u16) -> std::result::Result<(), Problem> {
    let (index, width) = match &insn.op {
        Op::Local { opcode, index } => (*index, local_width(*opcode)),
        Op::Iinc { index, .. } => (*index, 1),
        Op::Plain(opcode) => match implicit_local(*opcode) {
            Some(index) => (index, local_width(*opcode)),
            None => return Ok(()),
        },
        _ => return Ok(()),
    };
    if index as u32 + width as u32 > max_locals as u32 {
        return Err(Problem::LocalOutOfRange {
            offset: insn.offset,
            index,
            max_locals,
        });
    }
    Ok(())
}

fn check_operand(insn: &Instruction, pool: &ConstantPool) -> std::result::Result<(), Problem> {
    let bad = |expected| Problem::BadOperand {
        offset: insn.offset,
        expected,
    };
    match &insn.op {
        Op::Ref { opcode, index } => match *opcode {
            GETSTATIC..=PUTFIELD => match pool.member_ref(*index) {
                Ok(m) if m.kind == MemberKind::Field => Ok(()),
                _ => Err(bad("field reference")),
            },
            INVOKEVIRTUAL => match pool.member_ref(*index) {
                Ok(m) if m.kind == MemberKind::Method => Ok(()),
                _ => Err(bad("method reference")),
            },
            INVOKESPECIAL | INVOKESTATIC => match pool.member_ref(*index) {
                Ok(m) if m.kind != MemberKind::Field => Ok(()),
                _ => Err(bad("method reference")),
            },
            _ => pool.class_name(*index).map(|_| ()).map_err(|_| bad("class")),
        },
        Op::InvokeInterface { index, .. } => match pool.member_ref(*index) {
            Ok(m) if m.kind == MemberKind::InterfaceMethod => Ok(()),
            _ => Err(bad("interface method reference")),
        },
        Op::InvokeDynamic { index } => pool
            .invoke_dynamic_descriptor(*index)
            .map(|_| ())
            .map_err(|_| bad("invokedynamic call site")),
        Op::MultiANewArray { index, .. } => {
            pool.class_name(*index).map(|_| ()).map_err(|_| bad("class"))
        }
        Op::Const { opcode, index } => {
            let constant = pool.get(*index).map_err(|_| bad("loadable constant"))?;
            let wide = matches!(constant, Constant::Long(_) | Constant::Double(_));
            match (*opcode == LDC2_W, wide, constant.is_loadable()) {
                (true, true, _) => Ok(()),
                (false, false, true) => Ok(()),
                (true, _, _) => Err(bad("long or double constant")),
                _ => Err(bad("single-word loadable constant")),
            }
        }
        _ => Ok(()),
    }
}

/// Stack slots popped and pushed by one instruction
fn stack_effect(op: &Op, pool: &ConstantPool) -> std::result::Result<(u16, u16), ClassFileError> {
    let invoke = |index: u16, receiver: u16| -> std::result::Result<(u16, u16), ClassFileError> {
        let member = pool.member_ref(index)?;
        let descriptor = MethodDescriptor::parse(member.descriptor)?;
        Ok((descriptor.param_slots() + receiver, descriptor.return_slots()))
    };
    Ok(match op {
        Op::Plain(opcode) => plain_effect(*opcode),
        Op::Push { .. } => (0, 1),
        Op::NewArray(_) => (1, 1),
        Op::Const { opcode, .. } => (0, if *opcode == LDC2_W { 2 } else { 1 }),
        Op::Local { opcode, .. } => match *opcode {
            LLOAD | DLOAD => (0, 2),
            ILOAD | FLOAD | ALOAD => (0, 1),
            LSTORE | DSTORE => (2, 0),
            ISTORE | FSTORE | ASTORE => (1, 0),
            _ => (0, 0),
        },
        Op::Iinc { .. } => (0, 0),
        Op::Ref { opcode, index } => match *opcode {
            GETSTATIC => (0, field_slots(pool.member_ref(*index)?.descriptor)?),
            PUTSTATIC => (field_slots(pool.member_ref(*index)?.descriptor)?, 0),
            GETFIELD => (1, field_slots(pool.member_ref(*index)?.descriptor)?),
            PUTFIELD => (1 + field_slots(pool.member_ref(*index)?.descriptor)?, 0),
            INVOKEVIRTUAL | INVOKESPECIAL => invoke(*index, 1)?,
            INVOKESTATIC => invoke(*index, 0)?,
            NEW => (0, 1),
            _ => (1, 1), // anewarray, checkcast, instanceof
        },
        Op::InvokeInterface { index, .. } => invoke(*index, 1)?,
        Op::InvokeDynamic { index } => {
            let descriptor = MethodDescriptor::parse(pool.invoke_dynamic_descriptor(*index)?)?;
            (descriptor.param_slots(), descriptor.return_slots())
        }
        Op::MultiANewArray { dimensions, .. } => (*dimensions as u16, 1),
        Op::Branch { opcode, .. } => match *opcode {
            IFEQ..=IFLE | IFNULL | IFNONNULL => (1, 0),
            IF_ICMPEQ..=IF_ACMPNE => (2, 0),
            JSR | JSR_W => (0, 1),
            _ => (0, 0),
        },
        Op::TableSwitch { .. } | Op::LookupSwitch { .. } => (1, 0),
    })
}

fn plain_effect(opcode: u8) -> (u16, u16) {
    match opcode {
        NOP => (0, 0),
        ACONST_NULL..=ICONST_5 => (0, 1),
        LCONST_0 | LCONST_1 => (0, 2),
        FCONST_0..=FCONST_2 => (0, 1),
        DCONST_0 | DCONST_1 => (0, 2),
        ILOAD_0..=ILOAD_3 | FLOAD_0..=FLOAD_3 | ALOAD_0..=ALOAD_3 => (0, 1),
        LLOAD_0..=LLOAD_3 | DLOAD_0..=DLOAD_3 => (0, 2),
        // laload, daload
        0x2f | 0x31 => (2, 2),
        IALOAD..=SALOAD => (2, 1),
        ISTORE_0..=ISTORE_3 | FSTORE_0..=FSTORE_3 | ASTORE_0..=ASTORE_3 => (1, 0),
        LSTORE_0..=LSTORE_3 | DSTORE_0..=DSTORE_3 => (2, 0),
        // lastore, dastore
        0x50 | 0x52 => (4, 0),
        IASTORE..=SASTORE => (3, 0),
        POP => (1, 0),
        POP2 => (2, 0),
        DUP => (1, 2),
        DUP_X1 => (2, 3),
        DUP_X2 => (3, 4),
        DUP2 => (2, 4),
        DUP2_X1 => (3, 5),
        DUP2_X2 => (4, 6),
        SWAP => (2, 2),
        // add, sub, mul, div, rem cycle through int, long, float, double
        IADD..=DREM => match (opcode - IADD) % 4 {
            1 | 3 => (4, 2),
            _ => (2, 1),
        },
        INEG | FNEG => (1, 1),
        LNEG | DNEG => (2, 2),
        // shifts take an int count
        ISHL..=LUSHR => {
            if (opcode - ISHL) % 2 == 1 {
                (3, 2)
            } else {
                (2, 1)
            }
        }
        IAND..=LXOR => {
            if (opcode - IAND) % 2 == 1 {
                (4, 2)
            } else {
                (2, 1)
            }
        }
        // i2l, i2f, i2d, l2i, l2f, l2d, f2i, f2l, f2d, d2i, d2l, d2f
        I2L => (1, 2),
        0x86 => (1, 1),
        0x87 => (1, 2),
        0x88 | 0x89 => (2, 1),
        0x8a => (2, 2),
        0x8b => (1, 1),
        0x8c | 0x8d => (1, 2),
        0x8e | 0x90 => (2, 1),
        0x8f => (2, 2),
        0x91..=I2S => (1, 1),
        LCMP | DCMPL | DCMPG => (4, 1),
        FCMPL | FCMPG => (2, 1),
        IRETURN | FRETURN | ARETURN => (1, 0),
        LRETURN | DRETURN => (2, 0),
        RETURN => (0, 0),
        ARRAYLENGTH => (1, 1),
        ATHROW | MONITORENTER | MONITOREXIT => (1, 0),
        _ => (0, 0),
    }
}

fn check_stack_depth(
    instructions: &[Instruction],
    index_of: &HashMap<u32, usize>,
    code: &CodeAttribute,
    pool: &ConstantPool,
) -> std::result::Result<(), Problem> {
    let mut depth: Vec<Option<u16>> = vec![None; instructions.len()];
    let mut worklist: Vec<usize> = Vec::new();

    let enter = |at: usize, d: u16, depth: &mut Vec<Option<u16>>, worklist: &mut Vec<usize>| {
        match depth[at] {
            None => {
                depth[at] = Some(d);
                worklist.push(at);
                Ok(())
            }
            Some(existing) if existing == d => Ok(()),
            Some(existing) => Err(Problem::InconsistentDepth {
                offset: instructions[at].offset,
                first: existing,
                second: d,
            }),
        }
    };

    enter(0, 0, &mut depth, &mut worklist)?;
    for handler in &code.exception_table {
        if code.max_stack < 1 {
            return Err(Problem::StackOverflow {
                offset: handler.handler_pc as u32,
                depth: 1,
                max_stack: code.max_stack,
            });
        }
        enter(index_of[&(handler.handler_pc as u32)], 1, &mut depth, &mut worklist)?;
    }

    while let Some(at) = worklist.pop() {
        let insn = &instructions[at];
        let before = depth[at].unwrap_or(0);
        let (pop, push) = stack_effect(&insn.op, pool).map_err(Problem::Decode)?;
        let remaining = before
            .checked_sub(pop)
            .ok_or(Problem::StackUnderflow(insn.offset))?;
        let after = remaining + push;
        if after > code.max_stack {
            return Err(Problem::StackOverflow {
                offset: insn.offset,
                depth: after,
                max_stack: code.max_stack,
            });
        }

        for target in insn.op.targets() {
            enter(index_of[&target], after, &mut depth, &mut worklist)?;
        }
        if !ends_block(insn.op.opcode()) {
            if at + 1 >= instructions.len() {
                return Err(Problem::FallsOffEnd);
            }
            enter(at + 1, after, &mut depth, &mut worklist)?;
        }
    }
    Ok(())
}
