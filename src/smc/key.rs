//! Four-character codes: SMC keys and data type tags.
//!
//! Both are carried on the wire as big-endian `u32` values, with the first character in the
//! most significant byte.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::SmcError;

/// A 4-character SMC key such as `TC0P` or `F0Ac`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SmcKey([u8; 4]);

impl SmcKey {
    /// Number of keys reported by the SMC.
    pub const KEY_COUNT: SmcKey = SmcKey(*b"#KEY");
    pub const FAN_COUNT: SmcKey = SmcKey(*b"FNum");

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_be_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Builds a per-fan key like `F1Mx` from a fan index and a two-character field.
    pub fn fan(index: u8, field: FanField) -> Result<Self, SmcError> {
        let [a, b] = field.suffix();
        if index > 9 {
            return Err(SmcError::InvalidKey(format!(
                "F{}{}{}",
                index, a as char, b as char
            )));
        }
        Ok(Self([b'F', b'0' + index, a, b]))
    }

    /// True when every byte is a printable ASCII character, which is how keys returned by
    /// index enumeration are filtered.
    pub fn is_printable(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_graphic() || *b == b' ')
    }
}

impl FromStr for SmcKey {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        four_ascii_bytes(s)
            .map(Self)
            .ok_or_else(|| SmcError::InvalidKey(s.to_string()))
    }
}

impl TryFrom<&str> for SmcKey {
    type Error = SmcError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_four_cc(f, &self.0)
    }
}

impl fmt::Debug for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmcKey(\"{}\")", self)
    }
}

impl Serialize for SmcKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The per-fan values this crate reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FanField {
    /// Actual speed (`F{n}Ac`).
    Actual,
    /// Minimum speed (`F{n}Mn`).
    Minimum,
    /// Maximum speed (`F{n}Mx`).
    Maximum,
}

impl FanField {
    const fn suffix(self) -> [u8; 2] {
        match self {
            Self::Actual => *b"Ac",
            Self::Minimum => *b"Mn",
            Self::Maximum => *b"Mx",
        }
    }
}

/// A 4-character data type code such as `flt ` or `sp78`, as returned by "read key info".
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TypeTag([u8; 4]);

impl TypeTag {
    pub const SP78: TypeTag = TypeTag(*b"sp78");
    pub const FLT: TypeTag = TypeTag(*b"flt ");
    pub const FPE2: TypeTag = TypeTag(*b"fpe2");
    pub const UI8: TypeTag = TypeTag(*b"ui8 ");
    pub const UI16: TypeTag = TypeTag(*b"ui16");
    pub const UI32: TypeTag = TypeTag(*b"ui32");

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn from_u32(code: u32) -> Self {
        Self(code.to_be_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl FromStr for TypeTag {
    type Err = SmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        four_ascii_bytes(s)
            .map(Self)
            .ok_or_else(|| SmcError::InvalidKey(s.to_string()))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_four_cc(f, &self.0)
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag(\"{}\")", self)
    }
}

impl Serialize for TypeTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn four_ascii_bytes(s: &str) -> Option<[u8; 4]> {
    if !s.is_ascii() {
        return None;
    }
    s.as_bytes().try_into().ok()
}

// Non-ASCII bytes can come back from index enumeration; render them as '?'.
fn write_four_cc(f: &mut fmt::Formatter<'_>, bytes: &[u8; 4]) -> fmt::Result {
    for &b in bytes {
        let c = if b.is_ascii() && !b.is_ascii_control() {
            b as char
        } else {
            '?'
        };
        fmt::Write::write_char(f, c)?;
    }
    Ok(())
}
