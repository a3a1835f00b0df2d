//! Per-method timing probe injection
//!
//! One [`MethodRewriter`] walks a method's instructions once and drives a small
//! state machine:
//!
//! ```text
//! NotStarted --begin--> EntryEmitted                (ordinary method)
//! NotStarted --begin--> EntryPending --super()--> EntryEmitted   (constructor)
//! EntryEmitted --exit--> EntryEmitted                (one emission per exit)
//! EntryEmitted --finish--> Finalized
//! ```
//!
//! The entry probe stores `clock()` into a fresh 64-bit local. Every return and
//! `athrow` reached after that is preceded by `clock() - start` handed to the
//! sink. Constructors defer the entry probe until `this` has been initialized
//! by the superclass (or a delegating `this(...)`) constructor call.

use crate::classfile::code::{
    assemble, decode, relocate_handlers, relocate_line_numbers, relocate_local_variables, Item,
    LINE_NUMBER_TABLE, LOCAL_VARIABLE_TABLE, LOCAL_VARIABLE_TYPE_TABLE, STACK_MAP_TABLE,
};
use crate::classfile::opcodes::{is_exit, INVOKESPECIAL, INVOKESTATIC, LLOAD, LSTORE, LSUB, NEW};
use crate::classfile::stack_map::{decode_frames, encode_frames, initial_locals, VerificationType};
use crate::classfile::{Attribute, ClassFileError, CodeAttribute, ConstantPool, Op};
use crate::config::MethodTarget;
use thiserror::Error;

/// Operand stack headroom needed by the exit sequence (`long`, `long`)
pub const PROBE_STACK: u16 = 4;

/// Local slots taken by the start timestamp
pub const PROBE_LOCALS: u16 = 2;

const TYPE_ANNOTATION_ATTRIBUTES: [&str; 2] = [
    "RuntimeVisibleTypeAnnotations",
    "RuntimeInvisibleTypeAnnotations",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),

    #[error("no local variable slot left for the timing probe (max_locals = {0})")]
    LocalsExhausted(u16),
}

pub type Result<T> = std::result::Result<T, RewriteError>;

/// Constant pool indexes of the clock and sink `Methodref`s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRefs {
    pub clock: u16,
    pub sink: u16,
}

impl ProbeRefs {
    pub fn intern(
        pool: &mut ConstantPool,
        clock: &MethodTarget,
        sink: &MethodTarget,
    ) -> Result<Self> {
        Ok(Self {
            clock: pool.intern_method_ref(&clock.owner, &clock.name, &clock.descriptor)?,
            sink: pool.intern_method_ref(&sink.owner, &sink.name, &sink.descriptor)?,
        })
    }
}

/// Hands out local variable slots above every existing local
#[derive(Debug, Clone, Copy)]
pub struct LocalAllocator {
    next: u16,
}

impl LocalAllocator {
    /// Start allocating at the method's original `max_locals`
    pub fn new(max_locals: u16) -> Self {
        Self { next: max_locals }
    }

    pub fn allocate(&mut self, width: u16) -> Result<u16> {
        let slot = self.next;
        self.next = slot
            .checked_add(width)
            .ok_or(RewriteError::LocalsExhausted(slot))?;
        Ok(slot)
    }

    /// `max_locals` covering every slot handed out so far
    pub fn max_locals(&self) -> u16 {
        self.next
    }
}

/// The local holding the start timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProbe {
    pub slot: u16,
}

impl TimingProbe {
    fn entry(&self, refs: ProbeRefs) -> [Op; 2] {
        [
            Op::Ref {
                opcode: INVOKESTATIC,
                index: refs.clock,
            },
            Op::Local {
                opcode: LSTORE,
                index: self.slot,
            },
        ]
    }

    fn exit(&self, refs: ProbeRefs) -> [Op; 4] {
        [
            Op::Ref {
                opcode: INVOKESTATIC,
                index: refs.clock,
            },
            Op::Local {
                opcode: LLOAD,
                index: self.slot,
            },
            Op::Plain(LSUB),
            Op::Ref {
                opcode: INVOKESTATIC,
                index: refs.sink,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    NotStarted,
    /// Constructor waiting for `this` to be initialized
    EntryPending,
    EntryEmitted,
    Finalized,
}

/// Identity of the method being rewritten
#[derive(Debug, Clone, Copy)]
pub struct MethodContext<'a> {
    pub class_name: &'a str,
    pub super_name: Option<&'a str>,
    pub access_flags: u16,
    pub name: &'a str,
    pub descriptor: &'a str,
}

impl MethodContext<'_> {
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }
}

/// Result of rewriting one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodOutcome {
    Instrumented {
        code: CodeAttribute,
        /// Exit sites that received an emission
        exits: usize,
    },
    /// Constructor without an initializing `invokespecial <init>`; left as is
    Unanchored,
}

/// Single-pass probe injector for one method body
pub struct MethodRewriter<'a> {
    cx: MethodContext<'a>,
    refs: ProbeRefs,
    probe: TimingProbe,
    state: ProbeState,
    /// `new` instructions whose `<init>` has not been seen yet
    pending_new: usize,
    items: Vec<Item>,
    /// Index of the first item after the entry probe
    capture_item: Option<usize>,
    exits: usize,
}

impl<'a> MethodRewriter<'a> {
    pub fn new(cx: MethodContext<'a>, refs: ProbeRefs, probe: TimingProbe) -> Self {
        Self {
            cx,
            refs,
            probe,
            state: ProbeState::NotStarted,
            pending_new: 0,
            items: Vec::new(),
            capture_item: None,
            exits: 0,
        }
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    fn emit_entry(&mut self) {
        self.items
            .extend(self.probe.entry(self.refs).into_iter().map(Item::synthetic));
        self.capture_item = Some(self.items.len());
        self.state = ProbeState::EntryEmitted;
    }

    /// Method body start
    pub fn begin(&mut self) {
        debug_assert_eq!(self.state, ProbeState::NotStarted);
        if self.cx.is_constructor() {
            self.state = ProbeState::EntryPending;
        } else {
            self.emit_entry();
        }
    }

    /// Feed one original instruction
    pub fn visit(&mut self, offset: u32, op: Op, pool: &ConstantPool) -> Result<()> {
        if self.state == ProbeState::EntryEmitted && is_exit(op.opcode()) {
            let [first, rest @ ..] = self.probe.exit(self.refs);
            // Branches to the exit now land on the emission
            self.items.push(Item::anchored(offset, first));
            self.items.extend(rest.into_iter().map(Item::synthetic));
            self.items.push(Item::synthetic(op));
            self.exits += 1;
            return Ok(());
        }

        let initializes_this =
            self.state == ProbeState::EntryPending && self.track_constructor(&op, pool)?;
        self.items.push(Item::anchored(offset, op));
        if initializes_this {
            self.emit_entry();
        }
        Ok(())
    }

    /// Whether `op` is the `invokespecial <init>` that initializes `this`
    fn track_constructor(&mut self, op: &Op, pool: &ConstantPool) -> Result<bool> {
        match op {
            Op::Ref { opcode: NEW, .. } => {
                self.pending_new += 1;
                Ok(false)
            }
            Op::Ref {
                opcode: INVOKESPECIAL,
                index,
            } => {
                let target = pool.member_ref(*index)?;
                if target.name != "<init>" {
                    return Ok(false);
                }
                if self.pending_new > 0 {
                    self.pending_new -= 1;
                    return Ok(false);
                }
                Ok(Some(target.owner) == self.cx.super_name || target.owner == self.cx.class_name)
            }
            _ => Ok(false),
        }
    }

    /// Close the method and build the new `Code` attribute
    pub fn finish(
        mut self,
        original: &CodeAttribute,
        pool: &mut ConstantPool,
        max_locals: u16,
    ) -> Result<MethodOutcome> {
        if self.state != ProbeState::EntryEmitted {
            return Ok(MethodOutcome::Unanchored);
        }
        self.state = ProbeState::Finalized;

        let assembled = assemble(
            &self.items,
            original.code.len() as u32,
            &original.exception_table,
        )?;
        let capture_offset = self
            .capture_item
            .and_then(|i| assembled.item_offsets.get(i).copied())
            .unwrap_or(assembled.offsets.new_len());

        let mut attributes = Vec::with_capacity(original.attributes.len());
        for attribute in &original.attributes {
            let name = pool.utf8(attribute.name_index)?.to_string();
            let info = match name.as_str() {
                STACK_MAP_TABLE => {
                    let initial = initial_locals(
                        pool,
                        self.cx.class_name,
                        self.cx.access_flags,
                        self.cx.name,
                        self.cx.descriptor,
                    )?;
                    let mut frames = decode_frames(&attribute.info, &initial)?;
                    for frame in &mut frames {
                        frame.relocate(&assembled.offsets)?;
                        if frame.offset >= capture_offset {
                            frame.set_local(self.probe.slot, VerificationType::Long);
                        }
                    }
                    for trampoline in &assembled.trampolines {
                        let target = assembled.offsets.get(trampoline.target)?;
                        let mut frame = frames
                            .iter()
                            .find(|f| f.offset == target)
                            .cloned()
                            .ok_or(ClassFileError::MissingFrame(trampoline.target))?;
                        frame.offset = trampoline.offset;
                        frames.push(frame);
                    }
                    frames.sort_by_key(|f| f.offset);
                    encode_frames(&frames)
                }
                LINE_NUMBER_TABLE => relocate_line_numbers(&attribute.info, &assembled.offsets)?,
                LOCAL_VARIABLE_TABLE | LOCAL_VARIABLE_TYPE_TABLE => {
                    relocate_local_variables(&attribute.info, &assembled.offsets)?
                }
                other if TYPE_ANNOTATION_ATTRIBUTES.contains(&other) => continue,
                _ => attribute.info.clone(),
            };
            attributes.push(Attribute {
                name_index: attribute.name_index,
                info,
            });
        }

        Ok(MethodOutcome::Instrumented {
            code: CodeAttribute {
                max_stack: original.max_stack.saturating_add(PROBE_STACK),
                max_locals,
                code: assembled.code,
                exception_table: relocate_handlers(&original.exception_table, &assembled.offsets)?,
                attributes,
            },
            exits: self.exits,
        })
    }
}

/// Inject timing probes into one method body
pub fn rewrite_method(
    cx: MethodContext<'_>,
    code: &CodeAttribute,
    pool: &mut ConstantPool,
    refs: ProbeRefs,
) -> Result<MethodOutcome> {
    let instructions = decode(&code.code)?;

    let mut locals = LocalAllocator::new(code.max_locals);
    let probe = TimingProbe {
        slot: locals.allocate(PROBE_LOCALS)?,
    };

    let mut rewriter = MethodRewriter::new(cx, refs, probe);
    rewriter.begin();
    for insn in instructions {
        rewriter.visit(insn.offset, insn.op, pool)?;
    }

    if rewriter.state() == ProbeState::EntryPending {
        tracing::warn!(
            "{}.{}{}: no superclass constructor call found, leaving constructor unmodified",
            cx.class_name,
            cx.name,
            cx.descriptor
        );
    }

    let outcome = rewriter.finish(code, pool, locals.max_locals())?;
    if let MethodOutcome::Instrumented { exits, .. } = &outcome {
        tracing::debug!(
            "{}.{}{}: probe in slot {}, {} exit emissions",
            cx.class_name,
            cx.name,
            cx.descriptor,
            probe.slot,
            exits
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::opcodes::*;
    use crate::classfile::{ByteSink, ExceptionHandler, Instruction, ACC_STATIC};

    struct Fixture {
        pool: ConstantPool,
        refs: ProbeRefs,
        object_init: u16,
    }

    fn fixture() -> Fixture {
        let mut pool = ConstantPool::new();
        let clock = MethodTarget::parse("java/lang/System.nanoTime()J").unwrap();
        let sink = MethodTarget::parse("t/Sink.record(J)V").unwrap();
        let refs = ProbeRefs::intern(&mut pool, &clock, &sink).unwrap();
        let object_init = pool.intern_method_ref("java/lang/Object", "<init>", "()V").unwrap();
        Fixture {
            pool,
            refs,
            object_init,
        }
    }

    fn cx<'a>(name: &'a str, descriptor: &'a str, access_flags: u16) -> MethodContext<'a> {
        MethodContext {
            class_name: "t/Sample",
            super_name: Some("java/lang/Object"),
            access_flags,
            name,
            descriptor,
        }
    }

    fn body(max_stack: u16, max_locals: u16, code: Vec<u8>) -> CodeAttribute {
        CodeAttribute {
            max_stack,
            max_locals,
            code,
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    fn instrumented(outcome: MethodOutcome) -> (CodeAttribute, usize) {
        match outcome {
            MethodOutcome::Instrumented { code, exits } => (code, exits),
            MethodOutcome::Unanchored => panic!("expected instrumented method"),
        }
    }

    fn ops(code: &CodeAttribute) -> Vec<Instruction> {
        decode(&code.code).unwrap()
    }

    fn count_calls(insns: &[Instruction], index: u16) -> usize {
        insns
            .iter()
            .filter(|i| {
                i.op == Op::Ref {
                    opcode: INVOKESTATIC,
                    index,
                }
            })
            .count()
    }

    #[test]
    fn test_static_method_two_exits() {
        let mut f = fixture();
        // iload_0; ifeq L; iconst_1; ireturn; L: iconst_2; ireturn
        let bytes = vec![
            ILOAD_0, IFEQ, 0x00, 0x05, ICONST_1, IRETURN, ICONST_2, IRETURN,
        ];
        let code = body(1, 1, bytes);
        let cx = cx("pick", "(Z)I", ACC_STATIC);
        let (out, exits) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());

        assert_eq!(exits, 2);
        assert_eq!(out.max_locals, 3);
        assert_eq!(out.max_stack, 5);

        let insns = ops(&out);
        assert_eq!(
            insns[1].op,
            Op::Local {
                opcode: LSTORE,
                index: 1
            }
        );
        let stores = insns
            .iter()
            .filter(|i| matches!(i.op, Op::Local { opcode: LSTORE, .. }))
            .count();
        assert_eq!(stores, 1);
        assert_eq!(count_calls(&insns, f.refs.sink), 2);
        assert_eq!(count_calls(&insns, f.refs.clock), 3);
        let loads: Vec<_> = insns
            .iter()
            .filter_map(|i| match i.op {
                Op::Local { opcode: LLOAD, index } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(loads, vec![1, 1]);

        // the ifeq now targets the clock call of the second exit emission
        let Op::Branch { target, .. } = insns[3].op else {
            panic!("expected branch");
        };
        let landing = insns.iter().position(|i| i.offset == target).unwrap();
        assert_eq!(
            insns[landing].op,
            Op::Plain(ICONST_2),
            "branch keeps its original target instruction"
        );
    }

    #[test]
    fn test_jump_to_return_hits_emission() {
        let mut f = fixture();
        // iload_0; ifeq L; iinc 0 1; L: return
        let code = body(1, 1, vec![ILOAD_0, IFEQ, 0x00, 0x06, IINC, 0x00, 0x01, RETURN]);
        let cx = cx("run", "(I)V", ACC_STATIC);
        let (out, exits) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        assert_eq!(exits, 1);
        let insns = ops(&out);
        let Op::Branch { target, .. } = insns[3].op else {
            panic!("expected branch");
        };
        let landing = insns.iter().position(|i| i.offset == target).unwrap();
        assert_eq!(
            insns[landing].op,
            Op::Ref {
                opcode: INVOKESTATIC,
                index: f.refs.clock
            }
        );
        assert_eq!(
            insns[landing + 3].op,
            Op::Ref {
                opcode: INVOKESTATIC,
                index: f.refs.sink
            }
        );
        assert_eq!(insns[landing + 4].op, Op::Plain(RETURN));
    }

    #[test]
    fn test_constructor_entry_after_super_call() {
        let mut f = fixture();
        let [hi, lo] = f.object_init.to_be_bytes();
        let code = body(1, 1, vec![ALOAD_0, INVOKESPECIAL, hi, lo, RETURN]);
        let cx = cx("<init>", "()V", 0);
        let (out, exits) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        assert_eq!(exits, 1);
        let insns = ops(&out);
        assert_eq!(insns[0].op, Op::Plain(ALOAD_0));
        assert_eq!(
            insns[1].op,
            Op::Ref {
                opcode: INVOKESPECIAL,
                index: f.object_init
            }
        );
        assert_eq!(
            insns[2].op,
            Op::Ref {
                opcode: INVOKESTATIC,
                index: f.refs.clock
            }
        );
        assert_eq!(
            insns[3].op,
            Op::Local {
                opcode: LSTORE,
                index: 1
            }
        );
        assert_eq!(count_calls(&insns, f.refs.clock), 2);
    }

    #[test]
    fn test_constructor_skips_argument_allocations() {
        let mut f = fixture();
        let sb = f.pool.intern_class("java/lang/StringBuilder").unwrap();
        let sb_init = f
            .pool
            .intern_method_ref("java/lang/StringBuilder", "<init>", "()V")
            .unwrap();
        let super_init = f
            .pool
            .intern_method_ref("java/lang/Object", "<init>", "(Ljava/lang/Object;)V")
            .unwrap();
        let [sb_hi, sb_lo] = sb.to_be_bytes();
        let [i_hi, i_lo] = sb_init.to_be_bytes();
        let [s_hi, s_lo] = super_init.to_be_bytes();
        // aload_0; new SB; dup; invokespecial SB.<init>; invokespecial super.<init>; return
        let code = body(
            3,
            1,
            vec![
                ALOAD_0, NEW, sb_hi, sb_lo, DUP, INVOKESPECIAL, i_hi, i_lo, INVOKESPECIAL, s_hi,
                s_lo, RETURN,
            ],
        );
        let cx = cx("<init>", "()V", 0);
        let (out, _) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        let insns = ops(&out);
        let clock_at = insns
            .iter()
            .position(|i| {
                i.op == Op::Ref {
                    opcode: INVOKESTATIC,
                    index: f.refs.clock,
                }
            })
            .unwrap();
        assert_eq!(
            insns[clock_at - 1].op,
            Op::Ref {
                opcode: INVOKESPECIAL,
                index: super_init
            }
        );
    }

    #[test]
    fn test_delegating_constructor_accepted() {
        let mut f = fixture();
        let this_init = f.pool.intern_method_ref("t/Sample", "<init>", "(I)V").unwrap();
        let [hi, lo] = this_init.to_be_bytes();
        let code = body(2, 1, vec![ALOAD_0, ICONST_0, INVOKESPECIAL, hi, lo, RETURN]);
        let cx = cx("<init>", "()V", 0);
        let (out, _) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        assert_eq!(count_calls(&ops(&out), f.refs.clock), 2);
    }

    #[test]
    fn test_constructor_without_super_call_unanchored() {
        let mut f = fixture();
        let code = body(1, 1, vec![ACONST_NULL, ATHROW]);
        let outcome = rewrite_method(cx("<init>", "()V", 0), &code, &mut f.pool, f.refs).unwrap();
        assert_eq!(outcome, MethodOutcome::Unanchored);
    }

    #[test]
    fn test_exception_table_relocated() {
        let mut f = fixture();
        // 0: aload_0; 1: athrow; 2: astore_1; 3: return
        let mut code = body(1, 2, vec![ALOAD_0, ATHROW, ASTORE_0 + 1, RETURN]);
        code.exception_table.push(ExceptionHandler {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: 0,
        });
        let cx = cx("run", "(Ljava/lang/Throwable;)V", ACC_STATIC);
        let (out, exits) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        assert_eq!(exits, 2);
        let handler = out.exception_table[0];
        // invokestatic + lstore prelude
        assert_eq!(handler.start_pc, 5);
        let insns = ops(&out);
        let at_handler = insns.iter().find(|i| i.offset == handler.handler_pc as u32).unwrap();
        assert_eq!(at_handler.op, Op::Plain(ASTORE_0 + 1));
    }

    #[test]
    fn test_stack_map_frames_gain_probe_local() {
        let mut f = fixture();
        let smt = f.pool.intern_utf8(STACK_MAP_TABLE).unwrap();
        let bytes = vec![
            ILOAD_0, IFEQ, 0x00, 0x05, ICONST_1, IRETURN, ICONST_2, IRETURN,
        ];
        let mut code = body(1, 1, bytes);
        // one same_frame at offset 6
        let mut info = Vec::new();
        info.put_u16(1);
        info.put_u8(6);
        code.attributes.push(Attribute { name_index: smt, info });

        let cx = cx("pick", "(I)I", ACC_STATIC);
        let (out, _) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        let frames = decode_frames(&out.attributes[0].info, &[]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].locals,
            vec![VerificationType::Integer, VerificationType::Long]
        );
        let insns = ops(&out);
        let at_frame = insns.iter().find(|i| i.offset == frames[0].offset).unwrap();
        assert_eq!(at_frame.op, Op::Plain(ICONST_2));
    }

    #[test]
    fn test_far_branch_gets_trampoline_frame() {
        let mut f = fixture();
        let smt = f.pool.intern_utf8(STACK_MAP_TABLE).unwrap();
        // 0: iload_0; 1: ifeq 32768; 4: iconst_1; 5: ireturn; nops; 32768: iconst_2; ireturn
        let mut bytes = vec![ILOAD_0, IFEQ, 0x7F, 0xFF, ICONST_1, IRETURN];
        bytes.resize(32_768, NOP);
        bytes.extend_from_slice(&[ICONST_2, IRETURN]);
        let mut code = body(1, 1, bytes);
        // one same_frame_extended at 32768
        let mut info = Vec::new();
        info.put_u16(1);
        info.put_u8(251);
        info.put_u16(32_768);
        code.attributes.push(Attribute { name_index: smt, info });

        let cx = cx("pick", "(I)I", ACC_STATIC);
        let (out, exits) = instrumented(rewrite_method(cx, &code, &mut f.pool, f.refs).unwrap());
        assert_eq!(exits, 2);

        let insns = ops(&out);
        let frames = decode_frames(&out.attributes[0].info, &[]).unwrap();
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(
                frame.locals,
                vec![VerificationType::Integer, VerificationType::Long]
            );
        }

        let Op::Branch { opcode, target } = insns[3].op else {
            panic!("expected branch");
        };
        assert_eq!(opcode, IFEQ);
        assert_eq!(target, frames[0].offset);
        let trampoline = insns.iter().find(|i| i.offset == target).unwrap();
        assert_eq!(
            trampoline.op,
            Op::Branch {
                opcode: GOTO_W,
                target: frames[1].offset
            }
        );
        let landing = insns.iter().find(|i| i.offset == frames[1].offset).unwrap();
        assert_eq!(landing.op, Op::Plain(ICONST_2));
    }

    #[test]
    fn test_allocator_never_reuses_slots() {
        let mut locals = LocalAllocator::new(3);
        assert_eq!(locals.allocate(2).unwrap(), 3);
        assert_eq!(locals.allocate(1).unwrap(), 5);
        assert_eq!(locals.max_locals(), 6);
        let mut full = LocalAllocator::new(u16::MAX - 1);
        assert!(full.allocate(2).is_err());
    }
}
