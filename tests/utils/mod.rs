// Integration test utilities
//
// Class fixtures built through the crate's own class-file codec, plus a tiny
// interpreter for the handful of opcodes the fixtures and probes use.

#![allow(dead_code)]

use cronometro::classfile::code::{decode, CodeAttribute, ExceptionHandler, Op};
use cronometro::classfile::opcodes::*;
use cronometro::classfile::{ClassFile, ACC_PUBLIC, ACC_STATIC};
use cronometro::config::{DenyRule, InstrumentConfig, MatchKind};
use std::collections::HashMap;

/// JVMS §6.5 `iload_1`; not exported by the crate's opcode table
const ILOAD_1: u8 = 0x1b;

pub const SINK: &str = "t/Sink.record(J)V";
pub const SINK_OWNER: &str = "t/Sink";

/// Configuration used by the end-to-end fixtures
pub fn test_config(denied: &[&str]) -> InstrumentConfig {
    let mut config = InstrumentConfig::default();
    config.probe.sink = SINK.to_string();
    config.eligibility.denylist = denied
        .iter()
        .map(|name| DenyRule::new(MatchKind::Exact, *name))
        .collect();
    config
}

pub struct ClassBuilder {
    class: ClassFile,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            class: ClassFile::new(52, name, Some("java/lang/Object")).unwrap(),
        }
    }

    pub fn class_ref(&mut self, name: &str) -> u16 {
        self.class.constant_pool.intern_class(name).unwrap()
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        self.class
            .constant_pool
            .intern_method_ref(owner, name, descriptor)
            .unwrap()
    }

    pub fn method(
        mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.add(access_flags, name, descriptor, max_stack, max_locals, code, Vec::new());
        self
    }

    pub fn static_method(
        self,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Self {
        self.method(ACC_PUBLIC | ACC_STATIC, name, descriptor, max_stack, max_locals, code)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
        exception_table: Vec<ExceptionHandler>,
    ) {
        let code = CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes: Vec::new(),
        };
        self.class
            .add_method(access_flags, name, descriptor, Some(&code))
            .unwrap();
    }

    pub fn build(self) -> Vec<u8> {
        self.class.to_bytes()
    }
}

/// `static int pick(int)`: returns 1 when the argument is non-zero, else 2
///
/// Two `ireturn` exits.
pub fn pick_class(name: &str) -> Vec<u8> {
    ClassBuilder::new(name)
        .static_method(
            "pick",
            "(I)I",
            1,
            1,
            vec![
                ILOAD_0, // 0
                IFEQ, 0, 5, // 1 -> 6
                ICONST_1, // 4
                IRETURN,  // 5
                ICONST_2, // 6
                IRETURN,  // 7
            ],
        )
        .build()
}

/// Class with a constructor that does some work before `super()`
pub fn constructor_class(name: &str) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name);
    let init = builder.method_ref("java/lang/Object", "<init>", "()V");
    let [hi, lo] = init.to_be_bytes();
    builder.add(
        ACC_PUBLIC,
        "<init>",
        "()V",
        2,
        1,
        vec![
            ICONST_1,
            POP,
            ALOAD_0,
            INVOKESPECIAL,
            hi,
            lo,
            RETURN,
        ],
        Vec::new(),
    );
    builder.build()
}

/// `<init>(I)V` that returns early when its argument is non-zero and
/// otherwise allocates a second object before returning
pub fn branching_constructor_class(name: &str) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name);
    let object = builder.class_ref("java/lang/Object");
    let init = builder.method_ref("java/lang/Object", "<init>", "()V");
    let [c_hi, c_lo] = object.to_be_bytes();
    let [i_hi, i_lo] = init.to_be_bytes();
    builder.add(
        ACC_PUBLIC,
        "<init>",
        "(I)V",
        2,
        2,
        vec![
            ALOAD_0,       // 0
            INVOKESPECIAL, // 1
            i_hi,
            i_lo,
            ILOAD_1, // 4
            IFEQ,    // 5 -> 9
            0,
            4,
            RETURN, // 8
            NEW,    // 9
            c_hi,
            c_lo,
            DUP,           // 12
            INVOKESPECIAL, // 13
            i_hi,
            i_lo,
            POP,    // 16
            RETURN, // 17
        ],
        Vec::new(),
    );
    builder.build()
}

pub fn method_code(class_bytes: &[u8], name: &str) -> CodeAttribute {
    let class = ClassFile::parse(class_bytes).unwrap();
    let method = class
        .methods
        .iter()
        .find(|m| class.member_name(m).unwrap() == name)
        .unwrap_or_else(|| panic!("no method {name}"));
    let index = class.code_index(method).unwrap();
    CodeAttribute::parse(&method.attributes[index].info).unwrap()
}

/// Count `invokestatic` instructions calling `owner.name`
pub fn count_invokestatic(class_bytes: &[u8], method: &str, owner: &str, name: &str) -> usize {
    let class = ClassFile::parse(class_bytes).unwrap();
    let code = method_code(class_bytes, method);
    decode(&code.code)
        .unwrap()
        .iter()
        .filter(|insn| match insn.op {
            Op::Ref {
                opcode: INVOKESTATIC,
                index,
            } => {
                let target = class.constant_pool.member_ref(index).unwrap();
                target.owner == owner && target.name == name
            }
            _ => false,
        })
        .count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Ref,
    Top,
}

/// Result of running one method
#[derive(Debug, Default)]
pub struct Execution {
    pub result: Option<i32>,
    /// Durations passed to the sink, in call order
    pub sink_calls: Vec<i64>,
}

/// Run a static method taking int arguments
pub fn execute(class_bytes: &[u8], method: &str, args: &[i32]) -> Execution {
    let args: Vec<Value> = args.iter().map(|arg| Value::Int(*arg)).collect();
    execute_with(class_bytes, method, &args)
}

/// Run a method whose first locals are `args`
///
/// The clock is `java/lang/System.nanoTime` and advances by 10 on each read;
/// calls to [`SINK`] are recorded and `<init>()V` calls consume their
/// receiver. Anything else panics.
pub fn execute_with(class_bytes: &[u8], method: &str, args: &[Value]) -> Execution {
    let class = ClassFile::parse(class_bytes).unwrap();
    let pool = &class.constant_pool;
    let code = method_code(class_bytes, method);
    let insns = decode(&code.code).unwrap();
    let by_offset: HashMap<u32, usize> = insns
        .iter()
        .enumerate()
        .map(|(i, insn)| (insn.offset, i))
        .collect();

    let mut locals = vec![Value::Top; code.max_locals as usize];
    locals[..args.len()].copy_from_slice(args);
    let mut stack: Vec<Value> = Vec::new();
    let mut clock = 0i64;
    let mut execution = Execution::default();
    let mut pc = 0usize;

    let pop_int = |stack: &mut Vec<Value>| match stack.pop() {
        Some(Value::Int(v)) => v,
        other => panic!("expected int, got {other:?}"),
    };
    let pop_long = |stack: &mut Vec<Value>| match stack.pop() {
        Some(Value::Long(v)) => v,
        other => panic!("expected long, got {other:?}"),
    };

    for _ in 0..10_000 {
        let insn = &insns[pc];
        let mut next = pc + 1;
        match &insn.op {
            Op::Plain(NOP) => {}
            Op::Plain(op @ ICONST_M1..=ICONST_5) => {
                stack.push(Value::Int(*op as i32 - ICONST_0 as i32))
            }
            Op::Push { value, .. } => stack.push(Value::Int(*value as i32)),
            Op::Plain(op @ ILOAD_0..=ILOAD_3) => stack.push(locals[(op - ILOAD_0) as usize]),
            Op::Plain(op @ ISTORE_0..=ISTORE_3) => {
                locals[(op - ISTORE_0) as usize] = Value::Int(pop_int(&mut stack))
            }
            Op::Plain(op @ ALOAD_0..=ALOAD_3) => stack.push(locals[(op - ALOAD_0) as usize]),
            Op::Local { opcode: ILOAD, index } => stack.push(locals[*index as usize]),
            Op::Local { opcode: ISTORE, index } => {
                locals[*index as usize] = Value::Int(pop_int(&mut stack))
            }
            Op::Local { opcode: LLOAD, index } => stack.push(locals[*index as usize]),
            Op::Local { opcode: LSTORE, index } => {
                locals[*index as usize] = Value::Long(pop_long(&mut stack));
                locals[*index as usize + 1] = Value::Top;
            }
            Op::Plain(POP) => {
                stack.pop();
            }
            Op::Plain(DUP) => {
                let top = *stack.last().unwrap();
                stack.push(top);
            }
            Op::Ref { opcode: NEW, .. } => stack.push(Value::Ref),
            Op::Ref {
                opcode: INVOKESPECIAL,
                index,
            } => {
                let target = pool.member_ref(*index).unwrap();
                assert_eq!((target.name, target.descriptor), ("<init>", "()V"));
                assert_eq!(stack.pop(), Some(Value::Ref));
            }
            Op::Plain(IADD) => {
                let b = pop_int(&mut stack);
                let a = pop_int(&mut stack);
                stack.push(Value::Int(a.wrapping_add(b)));
            }
            Op::Plain(LSUB) => {
                let b = pop_long(&mut stack);
                let a = pop_long(&mut stack);
                stack.push(Value::Long(a - b));
            }
            Op::Branch { opcode, target } => {
                let taken = match *opcode {
                    GOTO => true,
                    IFEQ..=IFLE => {
                        let v = pop_int(&mut stack);
                        match *opcode - IFEQ {
                            0 => v == 0,
                            1 => v != 0,
                            2 => v < 0,
                            3 => v >= 0,
                            4 => v > 0,
                            _ => v <= 0,
                        }
                    }
                    other => panic!("unsupported branch {other:#x}"),
                };
                if taken {
                    next = by_offset[target];
                }
            }
            Op::Ref {
                opcode: INVOKESTATIC,
                index,
            } => {
                let target = pool.member_ref(*index).unwrap();
                match (target.owner, target.name) {
                    ("java/lang/System", "nanoTime") => {
                        clock += 10;
                        stack.push(Value::Long(clock));
                    }
                    (SINK_OWNER, "record") => execution.sink_calls.push(pop_long(&mut stack)),
                    other => panic!("unexpected call {other:?}"),
                }
            }
            Op::Plain(IRETURN) => {
                execution.result = Some(pop_int(&mut stack));
                return execution;
            }
            Op::Plain(RETURN) => return execution,
            other => panic!("unsupported instruction {other:?}"),
        }
        pc = next;
    }
    panic!("{method} did not return");
}
