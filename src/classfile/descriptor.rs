//! Field and method descriptor parsing (JVMS §4.3)

use super::{ClassFileError, Result};

/// One parsed field type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// `B C I S Z F J D`
    Base(char),
    /// `Lpkg/Name;`, holding the internal name
    Object(String),
    /// An array, holding its full descriptor (which is also its class name)
    Array(String),
}

impl FieldType {
    /// Local/stack slots occupied by a value of this type
    pub fn slots(&self) -> u16 {
        match self {
            FieldType::Base('J') | FieldType::Base('D') => 2,
            _ => 1,
        }
    }
}

/// A parsed method descriptor; `ret` is `None` for `V`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub params: Vec<FieldType>,
    pub ret: Option<FieldType>,
}

impl MethodDescriptor {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let bad = || ClassFileError::BadDescriptor(descriptor.to_string());
        let rest = descriptor.strip_prefix('(').ok_or_else(bad)?;
        let close = rest.find(')').ok_or_else(bad)?;
        let (mut params_src, ret_src) = (&rest[..close], &rest[close + 1..]);

        let mut params = Vec::new();
        while !params_src.is_empty() {
            let (ty, tail) = parse_field_type(params_src).ok_or_else(bad)?;
            params.push(ty);
            params_src = tail;
        }

        let ret = if ret_src == "V" {
            None
        } else {
            match parse_field_type(ret_src) {
                Some((ty, "")) => Some(ty),
                _ => return Err(bad()),
            }
        };
        Ok(Self { params, ret })
    }

    /// Slots taken by the arguments, excluding any receiver
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(FieldType::slots).sum()
    }

    pub fn return_slots(&self) -> u16 {
        self.ret.as_ref().map(FieldType::slots).unwrap_or(0)
    }
}

/// Slots taken by a field of descriptor `descriptor`
pub fn field_slots(descriptor: &str) -> Result<u16> {
    match parse_field_type(descriptor) {
        Some((ty, "")) => Ok(ty.slots()),
        _ => Err(ClassFileError::BadDescriptor(descriptor.to_string())),
    }
}

fn parse_field_type(src: &str) -> Option<(FieldType, &str)> {
    let first = src.chars().next()?;
    match first {
        'B' | 'C' | 'I' | 'S' | 'Z' | 'F' | 'J' | 'D' => Some((FieldType::Base(first), &src[1..])),
        'L' => {
            let end = src.find(';')?;
            if end < 2 {
                return None;
            }
            Some((FieldType::Object(src[1..end].to_string()), &src[end + 1..]))
        }
        '[' => {
            let dims = src.chars().take_while(|c| *c == '[').count();
            let (_, tail) = parse_field_type(&src[dims..])?;
            let consumed = src.len() - tail.len();
            Some((FieldType::Array(src[..consumed].to_string()), tail))
        }
        _ => None,
    }
}
