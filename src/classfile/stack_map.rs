//! `StackMapTable` frames (JVMS §4.7.4)
//!
//! Frames are expanded to absolute offsets with full local and stack lists so
//! they can be edited independently, then written back as `full_frame`s.

use super::code::OffsetMap;
use super::descriptor::{FieldType, MethodDescriptor};
use super::{ByteReader, ByteSink, ClassFileError, ConstantPool, Result, ACC_STATIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    /// Class constant index
    Object(u16),
    /// Offset of the `new` instruction that created the value
    Uninitialized(u32),
}

impl VerificationType {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        Ok(match tag {
            0 => VerificationType::Top,
            1 => VerificationType::Integer,
            2 => VerificationType::Float,
            3 => VerificationType::Double,
            4 => VerificationType::Long,
            5 => VerificationType::Null,
            6 => VerificationType::UninitializedThis,
            7 => VerificationType::Object(r.u16()?),
            8 => VerificationType::Uninitialized(r.u16()? as u32),
            _ => return Err(ClassFileError::BadVerificationType(tag)),
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            VerificationType::Top => out.put_u8(0),
            VerificationType::Integer => out.put_u8(1),
            VerificationType::Float => out.put_u8(2),
            VerificationType::Double => out.put_u8(3),
            VerificationType::Long => out.put_u8(4),
            VerificationType::Null => out.put_u8(5),
            VerificationType::UninitializedThis => out.put_u8(6),
            VerificationType::Object(index) => {
                out.put_u8(7);
                out.put_u16(*index);
            }
            VerificationType::Uninitialized(offset) => {
                out.put_u8(8);
                out.put_u16(*offset as u16);
            }
        }
    }

    /// Local variable slots covered by one entry of this type
    pub fn slots(&self) -> u16 {
        match self {
            VerificationType::Long | VerificationType::Double => 2,
            _ => 1,
        }
    }
}

/// One frame at an absolute code offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub offset: u32,
    pub locals: Vec<VerificationType>,
    pub stack: Vec<VerificationType>,
}

impl Frame {
    /// Number of local slots the frame describes
    pub fn local_slots(&self) -> u16 {
        self.locals.iter().map(VerificationType::slots).sum()
    }

    /// Declare `ty` at local `slot`, padding any gap with `Top`
    pub fn set_local(&mut self, slot: u16, ty: VerificationType) {
        while self.local_slots() > slot {
            self.locals.pop();
        }
        while self.local_slots() < slot {
            self.locals.push(VerificationType::Top);
        }
        self.locals.push(ty);
    }

    /// Move the frame and any `Uninitialized` offsets through `map`
    pub fn relocate(&mut self, map: &OffsetMap) -> Result<()> {
        self.offset = map.get(self.offset)?;
        for ty in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if let VerificationType::Uninitialized(offset) = ty {
                *offset = map.get(*offset)?;
            }
        }
        Ok(())
    }
}

/// Locals on method entry, derived from the receiver and the descriptor
///
/// Class constants for reference parameters are interned into `pool`.
pub fn initial_locals(
    pool: &mut ConstantPool,
    class_name: &str,
    access_flags: u16,
    method_name: &str,
    descriptor: &str,
) -> Result<Vec<VerificationType>> {
    let parsed = MethodDescriptor::parse(descriptor)?;
    let mut locals = Vec::with_capacity(parsed.params.len() + 1);
    if access_flags & ACC_STATIC == 0 {
        if method_name == "<init>" && class_name != "java/lang/Object" {
            locals.push(VerificationType::UninitializedThis);
        } else {
            locals.push(VerificationType::Object(pool.intern_class(class_name)?));
        }
    }
    for param in &parsed.params {
        locals.push(match param {
            FieldType::Base('J') => VerificationType::Long,
            FieldType::Base('D') => VerificationType::Double,
            FieldType::Base('F') => VerificationType::Float,
            FieldType::Base(_) => VerificationType::Integer,
            FieldType::Object(name) | FieldType::Array(name) => {
                VerificationType::Object(pool.intern_class(name)?)
            }
        });
    }
    Ok(locals)
}

/// Expand a `StackMapTable` payload into absolute frames
pub fn decode_frames(info: &[u8], initial: &[VerificationType]) -> Result<Vec<Frame>> {
    let mut r = ByteReader::new(info);
    let count = r.u16()?;
    let mut frames: Vec<Frame> = Vec::with_capacity(count as usize);
    let mut locals = initial.to_vec();

    for _ in 0..count {
        let frame_type = r.u8()?;
        let (delta, stack) = match frame_type {
            0..=63 => (frame_type as u32, Vec::new()),
            64..=127 => ((frame_type - 64) as u32, vec![VerificationType::parse(&mut r)?]),
            247 => {
                let delta = r.u16()? as u32;
                (delta, vec![VerificationType::parse(&mut r)?])
            }
            248..=250 => {
                let delta = r.u16()? as u32;
                let chop = (251 - frame_type) as usize;
                if chop > locals.len() {
                    return Err(ClassFileError::FrameUnderflow);
                }
                locals.truncate(locals.len() - chop);
                (delta, Vec::new())
            }
            251 => (r.u16()? as u32, Vec::new()),
            252..=254 => {
                let delta = r.u16()? as u32;
                for _ in 0..(frame_type - 251) {
                    locals.push(VerificationType::parse(&mut r)?);
                }
                (delta, Vec::new())
            }
            255 => {
                let delta = r.u16()? as u32;
                let local_count = r.u16()?;
                locals = (0..local_count)
                    .map(|_| VerificationType::parse(&mut r))
                    .collect::<Result<Vec<_>>>()?;
                let stack_count = r.u16()?;
                let stack = (0..stack_count)
                    .map(|_| VerificationType::parse(&mut r))
                    .collect::<Result<Vec<_>>>()?;
                (delta, stack)
            }
            _ => return Err(ClassFileError::BadFrameType(frame_type)),
        };
        let offset = match frames.last() {
            Some(prev) => prev.offset + delta + 1,
            None => delta,
        };
        frames.push(Frame {
            offset,
            locals: locals.clone(),
            stack,
        });
    }
    if r.remaining() != 0 {
        return Err(ClassFileError::TrailingBytes(r.remaining()));
    }
    Ok(frames)
}

/// Write frames back as a `StackMapTable` payload of `full_frame` entries
///
/// Frames must be sorted by offset with no duplicates.
pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    out.put_u16(frames.len() as u16);
    let mut previous: Option<u32> = None;
    for frame in frames {
        let delta = match previous {
            None => frame.offset,
            Some(prev) => frame.offset - prev - 1,
        };
        previous = Some(frame.offset);
        out.put_u8(255);
        out.put_u16(delta as u16);
        out.put_u16(frame.locals.len() as u16);
        for ty in &frame.locals {
            ty.write(&mut out);
        }
        out.put_u16(frame.stack.len() as u16);
        for ty in &frame.stack {
            ty.write(&mut out);
        }
    }
    out
}
