//! Constant pool decoding and find-or-add interning

use super::{ByteReader, ByteSink, ClassFileError, Result};

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_INTERFACE_METHODREF: u8 = 11;
const TAG_NAME_AND_TYPE: u8 = 12;
const TAG_METHOD_HANDLE: u8 = 15;
const TAG_METHOD_TYPE: u8 = 16;
const TAG_DYNAMIC: u8 = 17;
const TAG_INVOKE_DYNAMIC: u8 = 18;
const TAG_MODULE: u8 = 19;
const TAG_PACKAGE: u8 = 20;

/// Largest `constant_pool_count` a class file can declare
const MAX_POOL_COUNT: usize = u16::MAX as usize;

/// A constant pool entry
///
/// `Utf8` keeps the raw modified-UTF-8 bytes so entries round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Utf8(Vec<u8>),
    Integer(u32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref { class: u16, name_and_type: u16 },
    Methodref { class: u16, name_and_type: u16 },
    InterfaceMethodref { class: u16, name_and_type: u16 },
    NameAndType { name: u16, descriptor: u16 },
    MethodHandle { kind: u8, reference: u16 },
    MethodType(u16),
    Dynamic { bootstrap: u16, name_and_type: u16 },
    InvokeDynamic { bootstrap: u16, name_and_type: u16 },
    Module(u16),
    Package(u16),
    /// Slot 0 and the slot shadowed by a preceding `Long`/`Double`
    Unusable,
}

impl Constant {
    fn is_wide(&self) -> bool {
        matches!(self, Constant::Long(_) | Constant::Double(_))
    }

    /// Whether `ldc`/`ldc_w`/`ldc2_w` may load this entry
    pub fn is_loadable(&self) -> bool {
        matches!(
            self,
            Constant::Integer(_)
                | Constant::Float(_)
                | Constant::Long(_)
                | Constant::Double(_)
                | Constant::Class(_)
                | Constant::String(_)
                | Constant::MethodHandle { .. }
                | Constant::MethodType(_)
                | Constant::Dynamic { .. }
        )
    }
}

/// Kind of symbolic reference resolved by [`ConstantPool::member_ref`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
    InterfaceMethod,
}

/// A resolved field or method reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef<'a> {
    pub kind: MemberKind,
    pub owner: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

/// The constant pool of one class, indexed from 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Unusable],
        }
    }

    /// `constant_pool_count` as written in the class file
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub(crate) fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let index = entries.len() as u16;
            let tag = r.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = r.u16()? as usize;
                    Constant::Utf8(r.bytes(len)?.to_vec())
                }
                TAG_INTEGER => Constant::Integer(r.u32()?),
                TAG_FLOAT => Constant::Float(r.u32()?),
                TAG_LONG => Constant::Long(r.u64()?),
                TAG_DOUBLE => Constant::Double(r.u64()?),
                TAG_CLASS => Constant::Class(r.u16()?),
                TAG_STRING => Constant::String(r.u16()?),
                TAG_FIELDREF => Constant::Fieldref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_METHODREF => Constant::Methodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INTERFACE_METHODREF => Constant::InterfaceMethodref {
                    class: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_NAME_AND_TYPE => Constant::NameAndType {
                    name: r.u16()?,
                    descriptor: r.u16()?,
                },
                TAG_METHOD_HANDLE => Constant::MethodHandle {
                    kind: r.u8()?,
                    reference: r.u16()?,
                },
                TAG_METHOD_TYPE => Constant::MethodType(r.u16()?),
                TAG_DYNAMIC => Constant::Dynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_INVOKE_DYNAMIC => Constant::InvokeDynamic {
                    bootstrap: r.u16()?,
                    name_and_type: r.u16()?,
                },
                TAG_MODULE => Constant::Module(r.u16()?),
                TAG_PACKAGE => Constant::Package(r.u16()?),
                _ => return Err(ClassFileError::BadConstantTag { tag, index }),
            };
            let wide = constant.is_wide();
            entries.push(constant);
            if wide {
                entries.push(Constant::Unusable);
            }
        }
        // A trailing Long/Double may overshoot the declared count by one slot
        if entries.len() != count as usize {
            return Err(ClassFileError::BadConstantIndex(count));
        }
        Ok(Self { entries })
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.put_u16(self.count());
        for constant in &self.entries {
            match constant {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    out.put_u8(TAG_UTF8);
                    out.put_u16(bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(v) => {
                    out.put_u8(TAG_INTEGER);
                    out.put_u32(*v);
                }
                Constant::Float(v) => {
                    out.put_u8(TAG_FLOAT);
                    out.put_u32(*v);
                }
                Constant::Long(v) => {
                    out.put_u8(TAG_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Double(v) => {
                    out.put_u8(TAG_DOUBLE);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Class(i) => {
                    out.put_u8(TAG_CLASS);
                    out.put_u16(*i);
                }
                Constant::String(i) => {
                    out.put_u8(TAG_STRING);
                    out.put_u16(*i);
                }
                Constant::Fieldref {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_FIELDREF, *class, *name_and_type),
                Constant::Methodref {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_METHODREF, *class, *name_and_type),
                Constant::InterfaceMethodref {
                    class,
                    name_and_type,
                } => write_pair(out, TAG_INTERFACE_METHODREF, *class, *name_and_type),
                Constant::NameAndType { name, descriptor } => {
                    write_pair(out, TAG_NAME_AND_TYPE, *name, *descriptor)
                }
                Constant::MethodHandle { kind, reference } => {
                    out.put_u8(TAG_METHOD_HANDLE);
                    out.put_u8(*kind);
                    out.put_u16(*reference);
                }
                Constant::MethodType(i) => {
                    out.put_u8(TAG_METHOD_TYPE);
                    out.put_u16(*i);
                }
                Constant::Dynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, TAG_DYNAMIC, *bootstrap, *name_and_type),
                Constant::InvokeDynamic {
                    bootstrap,
                    name_and_type,
                } => write_pair(out, TAG_INVOKE_DYNAMIC, *bootstrap, *name_and_type),
                Constant::Module(i) => {
                    out.put_u8(TAG_MODULE);
                    out.put_u16(*i);
                }
                Constant::Package(i) => {
                    out.put_u8(TAG_PACKAGE);
                    out.put_u16(*i);
                }
            }
        }
    }

    pub fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            Some(Constant::Unusable) | None => Err(ClassFileError::BadConstantIndex(index)),
            Some(constant) => Ok(constant),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Utf8(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| ClassFileError::InvalidUtf8(index))
            }
            _ => Err(ClassFileError::WrongConstantKind {
                index,
                expected: "Utf8",
            }),
        }
    }

    pub fn class_name(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::Class(name) => self.utf8(*name),
            _ => Err(ClassFileError::WrongConstantKind {
                index,
                expected: "Class",
            }),
        }
    }

    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(*name)?, self.utf8(*descriptor)?))
            }
            _ => Err(ClassFileError::WrongConstantKind {
                index,
                expected: "NameAndType",
            }),
        }
    }

    /// Resolve a `Fieldref`, `Methodref` or `InterfaceMethodref`
    pub fn member_ref(&self, index: u16) -> Result<MemberRef<'_>> {
        let (kind, class, name_and_type) = match self.get(index)? {
            Constant::Fieldref {
                class,
                name_and_type,
            } => (MemberKind::Field, *class, *name_and_type),
            Constant::Methodref {
                class,
                name_and_type,
            } => (MemberKind::Method, *class, *name_and_type),
            Constant::InterfaceMethodref {
                class,
                name_and_type,
            } => (MemberKind::InterfaceMethod, *class, *name_and_type),
            _ => {
                return Err(ClassFileError::WrongConstantKind {
                    index,
                    expected: "member reference",
                })
            }
        };
        let (name, descriptor) = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            kind,
            owner: self.class_name(class)?,
            name,
            descriptor,
        })
    }

    /// Descriptor of the `NameAndType` behind an `InvokeDynamic` entry
    pub fn invoke_dynamic_descriptor(&self, index: u16) -> Result<&str> {
        match self.get(index)? {
            Constant::InvokeDynamic { name_and_type, .. } => {
                Ok(self.name_and_type(*name_and_type)?.1)
            }
            _ => Err(ClassFileError::WrongConstantKind {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }

    fn find(&self, wanted: &Constant) -> Option<u16> {
        self.entries
            .iter()
            .position(|c| c == wanted)
            .map(|i| i as u16)
    }

    fn push(&mut self, constant: Constant) -> Result<u16> {
        let width = if constant.is_wide() { 2 } else { 1 };
        if self.entries.len() + width > MAX_POOL_COUNT {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        let index = self.entries.len() as u16;
        let wide = constant.is_wide();
        self.entries.push(constant);
        if wide {
            self.entries.push(Constant::Unusable);
        }
        Ok(index)
    }

    fn intern(&mut self, constant: Constant) -> Result<u16> {
        match self.find(&constant) {
            Some(index) => Ok(index),
            None => self.push(constant),
        }
    }

    pub fn intern_utf8(&mut self, value: &str) -> Result<u16> {
        self.intern(Constant::Utf8(encode_modified_utf8(value)))
    }

    pub fn intern_class(&mut self, name: &str) -> Result<u16> {
        let name = self.intern_utf8(name)?;
        self.intern(Constant::Class(name))
    }

    pub fn intern_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name = self.intern_utf8(name)?;
        let descriptor = self.intern_utf8(descriptor)?;
        self.intern(Constant::NameAndType { name, descriptor })
    }

    pub fn intern_method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.intern_class(owner)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        self.intern(Constant::Methodref {
            class,
            name_and_type,
        })
    }

    pub fn intern_field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16> {
        let class = self.intern_class(owner)?;
        let name_and_type = self.intern_name_and_type(name, descriptor)?;
        self.intern(Constant::Fieldref {
            class,
            name_and_type,
        })
    }
}

fn write_pair(out: &mut Vec<u8>, tag: u8, first: u16, second: u16) {
    out.put_u8(tag);
    out.put_u16(first);
    out.put_u16(second);
}

/// Encode a string in the JVM's modified UTF-8 (JVMS §4.4.7)
pub fn encode_modified_utf8(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for unit in value.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_find_or_add() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_method_ref("java/lang/System", "nanoTime", "()J").unwrap();
        let b = pool.intern_method_ref("java/lang/System", "nanoTime", "()J").unwrap();
        assert_eq!(a, b);
        let count = pool.count();
        pool.intern_class("java/lang/System").unwrap();
        assert_eq!(pool.count(), count);
    }

    #[test]
    fn test_member_ref_resolves_names() {
        let mut pool = ConstantPool::new();
        let index = pool.intern_method_ref("a/B", "run", "(J)V").unwrap();
        let member = pool.member_ref(index).unwrap();
        assert_eq!(member.kind, MemberKind::Method);
        assert_eq!(member.owner, "a/B");
        assert_eq!(member.name, "run");
        assert_eq!(member.descriptor, "(J)V");
    }

    #[test]
    fn test_wide_constants_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long = pool.push(Constant::Long(7)).unwrap();
        let next = pool.intern_utf8("x").unwrap();
        assert_eq!(next, long + 2);
        assert_eq!(pool.get(long + 1), Err(ClassFileError::BadConstantIndex(long + 1)));
    }

    #[test]
    fn test_round_trip_through_bytes() {
        let mut pool = ConstantPool::new();
        pool.push(Constant::Double(1)).unwrap();
        pool.intern_method_ref("a/B", "c", "()V").unwrap();
        let mut out = Vec::new();
        pool.write(&mut out);
        let parsed = ConstantPool::parse(&mut ByteReader::new(&out)).unwrap();
        assert_eq!(parsed, pool);
    }

    #[test]
    fn test_wrong_kind_reported() {
        let mut pool = ConstantPool::new();
        let utf8 = pool.intern_utf8("plain").unwrap();
        assert!(matches!(
            pool.class_name(utf8),
            Err(ClassFileError::WrongConstantKind { .. })
        ));
    }

    #[test]
    fn test_modified_utf8_encodes_nul_as_two_bytes() {
        assert_eq!(encode_modified_utf8("a\0"), vec![b'a', 0xC0, 0x80]);
        assert_eq!(encode_modified_utf8("ascii"), b"ascii".to_vec());
    }
}
