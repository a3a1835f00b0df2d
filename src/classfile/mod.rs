//! Minimal JVM class-file codec
//!
//! Parses a class file into a structure that keeps every attribute as raw bytes,
//! so anything the rewriter does not touch serializes back byte-for-byte.
//! Only the pieces the instrumentation needs are decoded further:
//!
//! - [`constant_pool`]: the pool itself plus find-or-add helpers
//! - [`code`]: the `Code` attribute, the tagged instruction model and assembly
//! - [`stack_map`]: `StackMapTable` frames
//! - [`descriptor`]: method and field descriptors
//!
//! Layout follows JVMS §4 ("The class File Format").

pub mod code;
pub mod constant_pool;
pub mod descriptor;
pub mod opcodes;
pub mod stack_map;

pub use code::{CodeAttribute, ExceptionHandler, Instruction, Op};
pub use constant_pool::{Constant, ConstantPool, MemberRef};

use thiserror::Error;

/// Magic number opening every class file
pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;

/// First class-file major version that requires `StackMapTable` frames (Java 6)
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

/// Errors raised while decoding or re-encoding class files
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("unexpected end of data at byte {offset}")]
    UnexpectedEof { offset: usize },

    #[error("bad magic number 0x{0:08X}")]
    BadMagic(u32),

    #[error("unknown constant pool tag {tag} at index {index}")]
    BadConstantTag { tag: u8, index: u16 },

    #[error("constant pool index {0} is out of range")]
    BadConstantIndex(u16),

    #[error("constant pool entry {index} is not a {expected}")]
    WrongConstantKind { index: u16, expected: &'static str },

    #[error("constant pool entry {0} is not valid UTF-8")]
    InvalidUtf8(u16),

    #[error("constant pool is full")]
    ConstantPoolOverflow,

    #[error("{0} trailing bytes after the class body")]
    TrailingBytes(usize),

    #[error("invalid opcode 0x{opcode:02X} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: u32 },

    #[error("instruction at offset {offset} branches to {target}, outside this method's code")]
    InvalidBranchTarget { offset: u32, target: i64 },

    #[error("branch at offset {offset} no longer fits its encoding after rewriting")]
    BranchOverflow { offset: u32 },

    #[error("code length {0} is outside 1..=65535")]
    CodeLength(usize),

    #[error("offset {0} recorded in a code attribute does not start an instruction")]
    UnanchoredOffset(u32),

    #[error("invalid stack map frame type {0}")]
    BadFrameType(u8),

    #[error("invalid verification type tag {0}")]
    BadVerificationType(u8),

    #[error("no stack map frame at offset {0} to copy onto a branch trampoline")]
    MissingFrame(u32),

    #[error("stack map frame chops more locals than are live")]
    FrameUnderflow,

    #[error("malformed descriptor `{0}`")]
    BadDescriptor(String),
}

pub type Result<T> = std::result::Result<T, ClassFileError>;

/// Big-endian cursor over a byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ClassFileError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let hi = self.u32()? as u64;
        let lo = self.u32()? as u64;
        Ok((hi << 32) | lo)
    }
}

/// Big-endian append helpers for `Vec<u8>`
pub trait ByteSink {
    fn put_u8(&mut self, value: u8);
    fn put_u16(&mut self, value: u16);
    fn put_u32(&mut self, value: u32);
}

impl ByteSink for Vec<u8> {
    fn put_u8(&mut self, value: u8) {
        self.push(value);
    }

    fn put_u16(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}

/// A raw attribute: name index plus undecoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl Attribute {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let name_index = r.u16()?;
        let len = r.u32()? as usize;
        let info = r.bytes(len)?.to_vec();
        Ok(Self { name_index, info })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.name_index);
        out.put_u32(self.info.len() as u32);
        out.extend_from_slice(&self.info);
    }
}

pub(crate) fn parse_attributes(r: &mut ByteReader<'_>) -> Result<Vec<Attribute>> {
    let count = r.u16()?;
    (0..count).map(|_| Attribute::parse(r)).collect()
}

pub(crate) fn write_attributes(attributes: &[Attribute], out: &mut Vec<u8>) {
    out.put_u16(attributes.len() as u16);
    for attribute in attributes {
        attribute.write(out);
    }
}

/// Position of the first attribute called `name`, if any
pub fn find_attribute(attributes: &[Attribute], pool: &ConstantPool, name: &str) -> Option<usize> {
    attributes
        .iter()
        .position(|a| pool.utf8(a.name_index).map(|n| n == name).unwrap_or(false))
}

/// A field or method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

impl Member {
    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            access_flags: r.u16()?,
            name_index: r.u16()?,
            descriptor_index: r.u16()?,
            attributes: parse_attributes(r)?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.access_flags);
        out.put_u16(self.name_index);
        out.put_u16(self.descriptor_index);
        write_attributes(&self.attributes, out);
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// One parsed class file
#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<Member>,
    pub methods: Vec<Member>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Start an empty class `name` extending `super_name`
    ///
    /// Used by transforms and test fixtures that synthesize classes.
    pub fn new(major_version: u16, name: &str, super_name: Option<&str>) -> Result<Self> {
        let mut constant_pool = ConstantPool::new();
        let this_class = constant_pool.intern_class(name)?;
        let super_class = match super_name {
            Some(super_name) => constant_pool.intern_class(super_name)?,
            None => 0,
        };
        Ok(Self {
            minor_version: 0,
            major_version,
            constant_pool,
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let magic = r.u32()?;
        if magic != MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = r.u16()?;
        let major_version = r.u16()?;
        let constant_pool = ConstantPool::parse(&mut r)?;
        let access_flags = r.u16()?;
        let this_class = r.u16()?;
        let super_class = r.u16()?;
        let interface_count = r.u16()?;
        let interfaces = (0..interface_count)
            .map(|_| r.u16())
            .collect::<Result<Vec<_>>>()?;
        let field_count = r.u16()?;
        let fields = (0..field_count)
            .map(|_| Member::parse(&mut r))
            .collect::<Result<Vec<_>>>()?;
        let method_count = r.u16()?;
        let methods = (0..method_count)
            .map(|_| Member::parse(&mut r))
            .collect::<Result<Vec<_>>>()?;
        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        out.put_u32(MAGIC);
        out.put_u16(self.minor_version);
        out.put_u16(self.major_version);
        self.constant_pool.write(&mut out);
        out.put_u16(self.access_flags);
        out.put_u16(self.this_class);
        out.put_u16(self.super_class);
        out.put_u16(self.interfaces.len() as u16);
        for interface in &self.interfaces {
            out.put_u16(*interface);
        }
        out.put_u16(self.fields.len() as u16);
        for field in &self.fields {
            field.write(&mut out);
        }
        out.put_u16(self.methods.len() as u16);
        for method in &self.methods {
            method.write(&mut out);
        }
        write_attributes(&self.attributes, &mut out);
        out
    }

    /// Internal name of this class, e.g. `com/example/Foo`
    pub fn name(&self) -> Result<&str> {
        self.constant_pool.class_name(self.this_class)
    }

    /// Internal name of the superclass; `None` only for `java/lang/Object`
    pub fn super_name(&self) -> Result<Option<&str>> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn member_name(&self, member: &Member) -> Result<&str> {
        self.constant_pool.utf8(member.name_index)
    }

    pub fn member_descriptor(&self, member: &Member) -> Result<&str> {
        self.constant_pool.utf8(member.descriptor_index)
    }

    /// Index into `member.attributes` of the `Code` attribute
    pub fn code_index(&self, member: &Member) -> Option<usize> {
        find_attribute(&member.attributes, &self.constant_pool, code::CODE_ATTRIBUTE)
    }

    /// Append a method with the given body
    pub fn add_method(
        &mut self,
        access_flags: u16,
        name: &str,
        descriptor: &str,
        code: Option<&CodeAttribute>,
    ) -> Result<()> {
        let name_index = self.constant_pool.intern_utf8(name)?;
        let descriptor_index = self.constant_pool.intern_utf8(descriptor)?;
        let mut attributes = Vec::new();
        if let Some(code) = code {
            attributes.push(Attribute {
                name_index: self.constant_pool.intern_utf8(code::CODE_ATTRIBUTE)?,
                info: code.to_bytes(),
            });
        }
        self.methods.push(Member {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_class() -> ClassFile {
        let mut class = ClassFile::new(52, "com/example/Sample", Some("java/lang/Object")).unwrap();
        let code = CodeAttribute {
            max_stack: 1,
            max_locals: 1,
            code: vec![opcodes::ICONST_1, opcodes::IRETURN],
            exception_table: Vec::new(),
            attributes: Vec::new(),
        };
        class
            .add_method(ACC_PUBLIC | ACC_STATIC, "one", "()I", Some(&code))
            .unwrap();
        class
    }

    #[test]
    fn test_reader_reads_big_endian() {
        let mut r = ByteReader::new(&[0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.i32().unwrap(), -2);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_reader_reports_eof_offset() {
        let mut r = ByteReader::new(&[0x01]);
        assert_eq!(r.u16(), Err(ClassFileError::UnexpectedEof { offset: 0 }));
    }

    #[test]
    fn test_parse_then_write_is_identity() {
        let bytes = sample_class().to_bytes();
        let parsed = ClassFile::parse(&bytes).unwrap();
        assert_eq!(parsed.to_bytes(), bytes);
        assert_eq!(parsed.name().unwrap(), "com/example/Sample");
        assert_eq!(parsed.super_name().unwrap(), Some("java/lang/Object"));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample_class().to_bytes();
        bytes[0] = 0x00;
        assert!(matches!(
            ClassFile::parse(&bytes),
            Err(ClassFileError::BadMagic(_))
        ));
    }

    #[test]
    fn test_truncated_class_rejected() {
        let bytes = sample_class().to_bytes();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(
            ClassFile::parse(truncated),
            Err(ClassFileError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_class().to_bytes();
        bytes.push(0);
        assert_eq!(
            ClassFile::parse(&bytes),
            Err(ClassFileError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_code_index_found() {
        let class = sample_class();
        let method = &class.methods[0];
        assert_eq!(class.code_index(method), Some(0));
        assert_eq!(class.member_name(method).unwrap(), "one");
        assert_eq!(class.member_descriptor(method).unwrap(), "()I");
    }
}
