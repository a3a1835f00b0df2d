//! `Code` attribute and the tagged instruction model
//!
//! Bytecode is decoded into [`Instruction`]s whose branch targets are absolute
//! offsets into the original method. Rewriting builds a list of [`Item`]s that
//! mixes original instructions with synthetic ones; [`assemble`] lays the list
//! out again, recomputes switch padding, and relocates every branch through
//! the resulting [`OffsetMap`]. The same map relocates exception ranges, line
//! numbers, local variable scopes and stack map frames.

use super::opcodes::*;
use super::{
    parse_attributes, write_attributes, Attribute, ByteReader, ByteSink, ClassFileError, Result,
};

pub const CODE_ATTRIBUTE: &str = "Code";
pub const STACK_MAP_TABLE: &str = "StackMapTable";
pub const LINE_NUMBER_TABLE: &str = "LineNumberTable";
pub const LOCAL_VARIABLE_TABLE: &str = "LocalVariableTable";
pub const LOCAL_VARIABLE_TYPE_TABLE: &str = "LocalVariableTypeTable";

const MAX_CODE_LENGTH: usize = u16::MAX as usize;

/// One `exception_table` row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

/// Decoded `Code` attribute; nested attributes stay raw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub attributes: Vec<Attribute>,
}

impl CodeAttribute {
    pub fn parse(info: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(info);
        let max_stack = r.u16()?;
        let max_locals = r.u16()?;
        let code_length = r.u32()? as usize;
        if code_length == 0 || code_length > MAX_CODE_LENGTH {
            return Err(ClassFileError::CodeLength(code_length));
        }
        let code = r.bytes(code_length)?.to_vec();
        let handler_count = r.u16()?;
        let exception_table = (0..handler_count)
            .map(|_| {
                Ok(ExceptionHandler {
                    start_pc: r.u16()?,
                    end_pc: r.u16()?,
                    handler_pc: r.u16()?,
                    catch_type: r.u16()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        out.put_u16(self.max_stack);
        out.put_u16(self.max_locals);
        out.put_u32(self.code.len() as u32);
        out.extend_from_slice(&self.code);
        out.put_u16(self.exception_table.len() as u16);
        for h in &self.exception_table {
            out.put_u16(h.start_pc);
            out.put_u16(h.end_pc);
            out.put_u16(h.handler_pc);
            out.put_u16(h.catch_type);
        }
        write_attributes(&self.attributes, &mut out);
        out
    }
}

/// Instruction operands, tagged by shape
///
/// Branch targets are absolute offsets in the method the instruction was
/// decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// No operands (arithmetic, returns, `xload_n`, ...)
    Plain(u8),
    /// `bipush` / `sipush`
    Push { opcode: u8, value: i16 },
    /// `newarray` with its primitive type code
    NewArray(u8),
    /// `ldc` / `ldc_w` / `ldc2_w`
    Const { opcode: u8, index: u16 },
    /// Loads, stores and `ret` with an explicit local index
    Local { opcode: u8, index: u16 },
    Iinc { index: u16, delta: i16 },
    /// Field access, `invokevirtual/special/static`, `new`, `anewarray`,
    /// `checkcast`, `instanceof`
    Ref { opcode: u8, index: u16 },
    InvokeInterface { index: u16, count: u8 },
    InvokeDynamic { index: u16 },
    MultiANewArray { index: u16, dimensions: u8 },
    Branch { opcode: u8, target: u32 },
    TableSwitch { default: u32, low: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

impl Op {
    pub fn opcode(&self) -> u8 {
        match self {
            Op::Plain(op) => *op,
            Op::Push { opcode, .. }
            | Op::Const { opcode, .. }
            | Op::Local { opcode, .. }
            | Op::Ref { opcode, .. }
            | Op::Branch { opcode, .. } => *opcode,
            Op::NewArray(_) => NEWARRAY,
            Op::Iinc { .. } => IINC,
            Op::InvokeInterface { .. } => INVOKEINTERFACE,
            Op::InvokeDynamic { .. } => INVOKEDYNAMIC,
            Op::MultiANewArray { .. } => MULTIANEWARRAY,
            Op::TableSwitch { .. } => TABLESWITCH,
            Op::LookupSwitch { .. } => LOOKUPSWITCH,
        }
    }

    /// Every offset this instruction may transfer control to
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Op::Branch { target, .. } => vec![*target],
            Op::TableSwitch {
                default, targets, ..
            } => std::iter::once(*default).chain(targets.iter().copied()).collect(),
            Op::LookupSwitch { default, pairs } => std::iter::once(*default)
                .chain(pairs.iter().map(|(_, t)| *t))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Encoded size when placed at offset `at`
    pub fn encoded_len(&self, at: u32) -> u32 {
        match self {
            Op::Plain(_) => 1,
            Op::Push { opcode, .. } => {
                if *opcode == BIPUSH {
                    2
                } else {
                    3
                }
            }
            Op::NewArray(_) => 2,
            Op::Const { opcode, .. } => {
                if *opcode == LDC {
                    2
                } else {
                    3
                }
            }
            Op::Local { index, .. } => {
                if *index <= u8::MAX as u16 {
                    2
                } else {
                    4
                }
            }
            Op::Iinc { index, delta } => {
                if *index <= u8::MAX as u16 && i8::try_from(*delta).is_ok() {
                    3
                } else {
                    6
                }
            }
            Op::Ref { .. } => 3,
            Op::InvokeInterface { .. } | Op::InvokeDynamic { .. } => 5,
            Op::MultiANewArray { .. } => 4,
            Op::Branch { opcode, .. } => {
                if matches!(*opcode, GOTO_W | JSR_W) {
                    5
                } else {
                    3
                }
            }
            Op::TableSwitch { targets, .. } => {
                1 + switch_padding(at) + 12 + 4 * targets.len() as u32
            }
            Op::LookupSwitch { pairs, .. } => 1 + switch_padding(at) + 8 + 8 * pairs.len() as u32,
        }
    }

    fn encode(
        &self,
        at: u32,
        out: &mut Vec<u8>,
        relocate: &dyn Fn(u32) -> Result<u32>,
    ) -> Result<()> {
        let rel = |target: u32| -> Result<i64> { Ok(relocate(target)? as i64 - at as i64) };
        match self {
            Op::Plain(op) => out.put_u8(*op),
            Op::Push { opcode, value } => {
                out.put_u8(*opcode);
                if *opcode == BIPUSH {
                    out.put_u8(*value as i8 as u8);
                } else {
                    out.put_u16(*value as u16);
                }
            }
            Op::NewArray(atype) => {
                out.put_u8(NEWARRAY);
                out.put_u8(*atype);
            }
            Op::Const { opcode, index } => {
                out.put_u8(*opcode);
                if *opcode == LDC {
                    out.put_u8(*index as u8);
                } else {
                    out.put_u16(*index);
                }
            }
            Op::Local { opcode, index } => {
                if *index <= u8::MAX as u16 {
                    out.put_u8(*opcode);
                    out.put_u8(*index as u8);
                } else {
                    out.put_u8(WIDE);
                    out.put_u8(*opcode);
                    out.put_u16(*index);
                }
            }
            Op::Iinc { index, delta } => match i8::try_from(*delta) {
                Ok(small) if *index <= u8::MAX as u16 => {
                    out.put_u8(IINC);
                    out.put_u8(*index as u8);
                    out.put_u8(small as u8);
                }
                _ => {
                    out.put_u8(WIDE);
                    out.put_u8(IINC);
                    out.put_u16(*index);
                    out.put_u16(*delta as u16);
                }
            },
            Op::Ref { opcode, index } => {
                out.put_u8(*opcode);
                out.put_u16(*index);
            }
            Op::InvokeInterface { index, count } => {
                out.put_u8(INVOKEINTERFACE);
                out.put_u16(*index);
                out.put_u8(*count);
                out.put_u8(0);
            }
            Op::InvokeDynamic { index } => {
                out.put_u8(INVOKEDYNAMIC);
                out.put_u16(*index);
                out.put_u16(0);
            }
            Op::MultiANewArray { index, dimensions } => {
                out.put_u8(MULTIANEWARRAY);
                out.put_u16(*index);
                out.put_u8(*dimensions);
            }
            Op::Branch { opcode, target } => {
                let delta = rel(*target)?;
                out.put_u8(*opcode);
                if matches!(*opcode, GOTO_W | JSR_W) {
                    out.put_u32(delta as i32 as u32);
                } else {
                    let short = i16::try_from(delta)
                        .map_err(|_| ClassFileError::BranchOverflow { offset: at })?;
                    out.put_u16(short as u16);
                }
            }
            Op::TableSwitch {
                default,
                low,
                targets,
            } => {
                out.put_u8(TABLESWITCH);
                out.resize(out.len() + switch_padding(at) as usize, 0);
                out.put_u32(rel(*default)? as i32 as u32);
                out.put_u32(*low as u32);
                out.put_u32((*low + targets.len() as i32 - 1) as u32);
                for target in targets {
                    out.put_u32(rel(*target)? as i32 as u32);
                }
            }
            Op::LookupSwitch { default, pairs } => {
                out.put_u8(LOOKUPSWITCH);
                out.resize(out.len() + switch_padding(at) as usize, 0);
                out.put_u32(rel(*default)? as i32 as u32);
                out.put_u32(pairs.len() as u32);
                for (key, target) in pairs {
                    out.put_u32(*key as u32);
                    out.put_u32(rel(*target)? as i32 as u32);
                }
            }
        }
        Ok(())
    }
}

/// Zero bytes between a switch opcode and its 4-byte aligned operands
fn switch_padding(at: u32) -> u32 {
    (4 - (at + 1) % 4) % 4
}

/// A decoded instruction and the offset it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: u32,
    pub op: Op,
}

/// Decode a method body into instructions
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>> {
    let len = code.len() as i64;
    let mut r = ByteReader::new(code);
    let mut out = Vec::new();

    while r.remaining() > 0 {
        let offset = r.position() as u32;
        let target = |rel: i64| -> Result<u32> {
            let abs = offset as i64 + rel;
            if abs < 0 || abs >= len {
                return Err(ClassFileError::InvalidBranchTarget { offset, target: abs });
            }
            Ok(abs as u32)
        };
        let opcode = r.u8()?;
        let op = match opcode {
            BIPUSH => Op::Push {
                opcode,
                value: r.i8()? as i16,
            },
            SIPUSH => Op::Push {
                opcode,
                value: r.i16()?,
            },
            LDC => Op::Const {
                opcode,
                index: r.u8()? as u16,
            },
            LDC_W | LDC2_W => Op::Const {
                opcode,
                index: r.u16()?,
            },
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Op::Local {
                opcode,
                index: r.u8()? as u16,
            },
            IINC => Op::Iinc {
                index: r.u8()? as u16,
                delta: r.i8()? as i16,
            },
            IFEQ..=JSR | IFNULL | IFNONNULL => Op::Branch {
                opcode,
                target: target(r.i16()? as i64)?,
            },
            GOTO_W | JSR_W => Op::Branch {
                opcode,
                target: target(r.i32()? as i64)?,
            },
            TABLESWITCH => {
                r.skip(switch_padding(offset) as usize)?;
                let default = target(r.i32()? as i64)?;
                let low = r.i32()?;
                let high = r.i32()?;
                if high < low {
                    return Err(ClassFileError::InvalidOpcode { opcode, offset });
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                if count > r.remaining() / 4 {
                    return Err(ClassFileError::UnexpectedEof { offset: r.position() });
                }
                let targets = (0..count)
                    .map(|_| target(r.i32()? as i64))
                    .collect::<Result<Vec<_>>>()?;
                Op::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            LOOKUPSWITCH => {
                r.skip(switch_padding(offset) as usize)?;
                let default = target(r.i32()? as i64)?;
                let count = r.i32()?;
                if count < 0 || count as usize > r.remaining() / 8 {
                    return Err(ClassFileError::UnexpectedEof { offset: r.position() });
                }
                let pairs = (0..count)
                    .map(|_| Ok((r.i32()?, target(r.i32()? as i64)?)))
                    .collect::<Result<Vec<_>>>()?;
                Op::LookupSwitch { default, pairs }
            }
            GETSTATIC..=INVOKESTATIC | NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => Op::Ref {
                opcode,
                index: r.u16()?,
            },
            INVOKEINTERFACE => {
                let index = r.u16()?;
                let count = r.u8()?;
                r.skip(1)?;
                Op::InvokeInterface { index, count }
            }
            INVOKEDYNAMIC => {
                let index = r.u16()?;
                r.skip(2)?;
                Op::InvokeDynamic { index }
            }
            NEWARRAY => Op::NewArray(r.u8()?),
            MULTIANEWARRAY => Op::MultiANewArray {
                index: r.u16()?,
                dimensions: r.u8()?,
            },
            WIDE => {
                let inner = r.u8()?;
                match inner {
                    IINC => Op::Iinc {
                        index: r.u16()?,
                        delta: r.i16()?,
                    },
                    ILOAD..=ALOAD | ISTORE..=ASTORE | RET => Op::Local {
                        opcode: inner,
                        index: r.u16()?,
                    },
                    _ => return Err(ClassFileError::InvalidOpcode { opcode: inner, offset }),
                }
            }
            NOP..=JSR_W => Op::Plain(opcode),
            _ => return Err(ClassFileError::InvalidOpcode { opcode, offset }),
        };
        out.push(Instruction { offset, op });
    }

    // Targets must land on instruction boundaries
    let starts: std::collections::HashSet<u32> = out.iter().map(|i| i.offset).collect();
    for insn in &out {
        for t in insn.op.targets() {
            if !starts.contains(&t) {
                return Err(ClassFileError::InvalidBranchTarget {
                    offset: insn.offset,
                    target: t as i64,
                });
            }
        }
    }
    Ok(out)
}

/// An element of an instruction list being assembled
///
/// `anchor` names the original offset this item now stands for: branches,
/// handlers and frames that referred to that offset will point here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub anchor: Option<u32>,
    pub op: Op,
}

impl Item {
    pub fn anchored(offset: u32, op: Op) -> Self {
        Self {
            anchor: Some(offset),
            op,
        }
    }

    pub fn synthetic(op: Op) -> Self {
        Self { anchor: None, op }
    }
}

/// Mapping from original code offsets to their new positions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetMap {
    slots: Vec<Option<u32>>,
    new_len: u32,
}

impl OffsetMap {
    /// New position of `original`; the old code length maps to the new one
    pub fn get(&self, original: u32) -> Result<u32> {
        if original as usize == self.slots.len() {
            return Ok(self.new_len);
        }
        self.slots
            .get(original as usize)
            .copied()
            .flatten()
            .ok_or(ClassFileError::UnanchoredOffset(original))
    }

    pub fn new_len(&self) -> u32 {
        self.new_len
    }
}

/// Encoded size of `goto_w` / `jsr_w`
const WIDE_BRANCH_LEN: u32 = 5;

/// Furthest a conditional branch is sent to reach its trampoline; the slack
/// absorbs code that later widening inserts between the two
const TRAMPOLINE_REACH: i64 = i16::MAX as i64 - 4096;

/// `goto_w` inserted so an out-of-range conditional branch reaches its target
///
/// The conditional jumps to the trampoline instead. Trampolines only follow
/// instructions that never fall through, so no existing path runs into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    /// New offset of the `goto_w`
    pub offset: u32,
    /// Original offset it jumps to
    pub target: u32,
}

/// Output of [`assemble`]
#[derive(Debug, Clone)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub offsets: OffsetMap,
    /// New offset of every item, parallel to the input list
    pub item_offsets: Vec<u32>,
    /// Each one needs a stack map frame equal to the frame at its target
    pub trampolines: Vec<Trampoline>,
}

/// Encoding chosen for a short branch item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Form {
    Short,
    /// `goto` / `jsr` promoted to `goto_w` / `jsr_w`
    Wide,
    /// Conditional sent to the trampoline with this index
    Trampoline(usize),
}

/// Trampoline placed right after the item at `after`
#[derive(Debug, Clone, Copy)]
struct Stub {
    after: usize,
    target: u32,
}

/// Offsets of one layout attempt
struct Layout {
    slots: Vec<Option<u32>>,
    item_offsets: Vec<u32>,
    stub_offsets: Vec<u32>,
    len: u32,
}

impl Layout {
    fn compute(items: &[Item], forms: &[Form], stubs: &[Stub], original_len: u32) -> Result<Self> {
        let mut slots = vec![None; original_len as usize];
        let mut item_offsets = Vec::with_capacity(items.len());
        let mut stub_offsets = vec![0; stubs.len()];
        let mut at: u32 = 0;
        for (index, (item, form)) in items.iter().zip(forms).enumerate() {
            if let Some(anchor) = item.anchor {
                let slot = slots
                    .get_mut(anchor as usize)
                    .ok_or(ClassFileError::UnanchoredOffset(anchor))?;
                slot.get_or_insert(at);
            }
            item_offsets.push(at);
            at += match form {
                Form::Wide => WIDE_BRANCH_LEN,
                _ => item.op.encoded_len(at),
            };
            for (stub, offset) in stubs.iter().zip(stub_offsets.iter_mut()) {
                if stub.after == index {
                    *offset = at;
                    at += WIDE_BRANCH_LEN;
                }
            }
        }
        Ok(Self {
            slots,
            item_offsets,
            stub_offsets,
            len: at,
        })
    }

    /// New offset of an original branch target
    fn relocate(&self, target: u32) -> Result<u32> {
        self.slots
            .get(target as usize)
            .copied()
            .flatten()
            .ok_or(ClassFileError::UnanchoredOffset(target))
    }

    /// Offset right after item `index` and the trampolines placed behind it
    fn after(&self, index: usize) -> u32 {
        self.item_offsets.get(index + 1).copied().unwrap_or(self.len)
    }
}

fn short_reach(from: u32, to: u32) -> bool {
    i16::try_from(to as i64 - from as i64).is_ok()
}

/// Whether code inserted just before original offset `next` would sit inside
/// a protected range
fn protected(handlers: &[ExceptionHandler], next: u32) -> bool {
    handlers
        .iter()
        .any(|h| (h.start_pc as u32) < next && next <= h.end_pc as u32)
}

/// Reuse or place a trampoline to `target` near the branch item `branch`
fn place_trampoline(
    items: &[Item],
    layout: &Layout,
    stubs: &mut Vec<Stub>,
    handlers: &[ExceptionHandler],
    branch: usize,
    target: u32,
    original_len: u32,
) -> Option<usize> {
    let from = layout.item_offsets[branch] as i64;
    let distance = |offset: u32| (offset as i64 - from).abs();

    let existing = stubs
        .iter()
        .zip(&layout.stub_offsets)
        .position(|(stub, &offset)| stub.target == target && distance(offset) <= TRAMPOLINE_REACH);
    if existing.is_some() {
        return existing;
    }

    let mut next_anchor = original_len;
    let mut best: Option<(i64, usize)> = None;
    for index in (0..items.len()).rev() {
        if ends_block(items[index].op.opcode()) && !protected(handlers, next_anchor) {
            let d = distance(layout.after(index));
            if d <= TRAMPOLINE_REACH && best.map_or(true, |(closest, _)| d < closest) {
                best = Some((d, index));
            }
        }
        if let Some(anchor) = items[index].anchor {
            next_anchor = anchor;
        }
    }

    let (_, after) = best?;
    stubs.push(Stub { after, target });
    Some(stubs.len() - 1)
}

/// Lay out and encode `items`, relocating branches through their anchors
///
/// Short branches pushed out of range are widened: `goto`/`jsr` become
/// `goto_w`/`jsr_w`, conditionals jump to a [`Trampoline`]. Trampolines are
/// kept out of the ranges covered by `handlers`.
pub fn assemble(
    items: &[Item],
    original_len: u32,
    handlers: &[ExceptionHandler],
) -> Result<Assembled> {
    let mut forms = vec![Form::Short; items.len()];
    let mut stubs: Vec<Stub> = Vec::new();

    let layout = loop {
        let layout = Layout::compute(items, &forms, &stubs, original_len)?;
        let mut widened = false;
        for (index, item) in items.iter().enumerate() {
            let Op::Branch { opcode, target } = item.op else {
                continue;
            };
            if matches!(opcode, GOTO_W | JSR_W) {
                continue;
            }
            let at = layout.item_offsets[index];
            let destination = match forms[index] {
                Form::Short => layout.relocate(target)?,
                Form::Trampoline(stub) => layout.stub_offsets[stub],
                Form::Wide => continue,
            };
            if short_reach(at, destination) {
                continue;
            }
            forms[index] = match (forms[index], opcode) {
                (Form::Short, GOTO | JSR) => Form::Wide,
                (Form::Short, _) => place_trampoline(
                    items,
                    &layout,
                    &mut stubs,
                    handlers,
                    index,
                    target,
                    original_len,
                )
                .map(Form::Trampoline)
                .ok_or(ClassFileError::BranchOverflow { offset: at })?,
                _ => return Err(ClassFileError::BranchOverflow { offset: at }),
            };
            widened = true;
        }
        if !widened {
            break layout;
        }
    };
    if layout.len as usize > MAX_CODE_LENGTH {
        return Err(ClassFileError::CodeLength(layout.len as usize));
    }

    let Layout {
        slots,
        item_offsets,
        stub_offsets,
        len,
    } = layout;
    let offsets = OffsetMap { slots, new_len: len };
    let relocate = |target: u32| -> Result<u32> {
        if target as usize >= offsets.slots.len() {
            return Err(ClassFileError::UnanchoredOffset(target));
        }
        offsets.get(target)
    };

    let mut code = Vec::with_capacity(len as usize);
    for (index, (item, start)) in items.iter().zip(&item_offsets).enumerate() {
        match (&item.op, forms[index]) {
            (Op::Branch { opcode, target }, Form::Wide) => {
                let opcode = if *opcode == JSR { JSR_W } else { GOTO_W };
                let wide = Op::Branch {
                    opcode,
                    target: *target,
                };
                wide.encode(*start, &mut code, &relocate)?;
            }
            (op, Form::Trampoline(stub)) => {
                let landing = stub_offsets[stub];
                op.encode(*start, &mut code, &|_: u32| Ok(landing))?;
            }
            (op, _) => op.encode(*start, &mut code, &relocate)?,
        }
        for (stub, offset) in stubs.iter().zip(&stub_offsets) {
            if stub.after == index {
                let jump = Op::Branch {
                    opcode: GOTO_W,
                    target: stub.target,
                };
                jump.encode(*offset, &mut code, &relocate)?;
            }
        }
    }
    debug_assert_eq!(code.len() as u32, len);

    let trampolines = stubs
        .iter()
        .zip(&stub_offsets)
        .map(|(stub, &offset)| Trampoline {
            offset,
            target: stub.target,
        })
        .collect();
    Ok(Assembled {
        code,
        offsets,
        item_offsets,
        trampolines,
    })
}

/// Relocate exception handler ranges
pub fn relocate_handlers(
    handlers: &[ExceptionHandler],
    map: &OffsetMap,
) -> Result<Vec<ExceptionHandler>> {
    handlers
        .iter()
        .map(|h| {
            Ok(ExceptionHandler {
                start_pc: map.get(h.start_pc as u32)? as u16,
                end_pc: map.get(h.end_pc as u32)? as u16,
                handler_pc: map.get(h.handler_pc as u32)? as u16,
                catch_type: h.catch_type,
            })
        })
        .collect()
}

/// Relocate a `LineNumberTable` payload
pub fn relocate_line_numbers(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = r.u16()?;
        let line = r.u16()?;
        out.put_u16(map.get(start_pc as u32)? as u16);
        out.put_u16(line);
    }
    Ok(out)
}

/// Relocate a `LocalVariableTable` or `LocalVariableTypeTable` payload
pub fn relocate_local_variables(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut out = Vec::with_capacity(info.len());
    out.put_u16(count);
    for _ in 0..count {
        let start_pc = r.u16()? as u32;
        let length = r.u16()? as u32;
        let name = r.u16()?;
        let descriptor = r.u16()?;
        let index = r.u16()?;
        let new_start = map.get(start_pc)?;
        let new_end = map.get(start_pc + length)?;
        out.put_u16(new_start as u16);
        out.put_u16(new_end.saturating_sub(new_start) as u16);
        out.put_u16(name);
        out.put_u16(descriptor);
        out.put_u16(index);
    }
    Ok(out)
}
