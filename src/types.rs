//! Element types for distributed arrays.
//!
//! Public entry points are generic over [`Element`]; internally every
//! operation works on raw bytes parameterized by a [`PioType`] tag and its
//! byte size, so the rearrangers and the file backend are written once.

use bytemuck::Pod;

/// Tag for the element type of a variable or decomposition.
///
/// Matches the numeric type set of the netCDF data model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum PioType {
    /// Signed 1-byte integer.
    Byte,
    /// Text character (stored as one byte).
    Char,
    /// Signed 2-byte integer.
    Short,
    /// Signed 4-byte integer.
    Int,
    /// IEEE-754 single precision.
    Float,
    /// IEEE-754 double precision.
    Double,
    /// Unsigned 1-byte integer.
    UByte,
    /// Unsigned 2-byte integer.
    UShort,
    /// Unsigned 4-byte integer.
    UInt,
    /// Signed 8-byte integer.
    Int64,
    /// Unsigned 8-byte integer.
    UInt64,
}

impl PioType {
    /// Size in bytes of one element.
    pub fn size(self) -> usize {
        match self {
            PioType::Byte | PioType::Char | PioType::UByte => 1,
            PioType::Short | PioType::UShort => 2,
            PioType::Int | PioType::UInt | PioType::Float => 4,
            PioType::Double | PioType::Int64 | PioType::UInt64 => 8,
        }
    }

    /// Default fill value, little-endian bytes. These are the classic
    /// netCDF defaults for each type.
    pub fn default_fill(self) -> Vec<u8> {
        match self {
            PioType::Byte => (-127i8).to_le_bytes().to_vec(),
            PioType::Char => vec![0],
            PioType::Short => (-32767i16).to_le_bytes().to_vec(),
            PioType::Int => (-2147483647i32).to_le_bytes().to_vec(),
            PioType::Float => 9.969_21e36_f32.to_le_bytes().to_vec(),
            PioType::Double => 9.969209968386869e36_f64.to_le_bytes().to_vec(),
            PioType::UByte => vec![255],
            PioType::UShort => 65535u16.to_le_bytes().to_vec(),
            PioType::UInt => 4294967295u32.to_le_bytes().to_vec(),
            PioType::Int64 => (-9223372036854775806i64).to_le_bytes().to_vec(),
            PioType::UInt64 => 18446744073709551614u64.to_le_bytes().to_vec(),
        }
    }

    /// Stable one-byte tag for headers and the async wire format.
    pub(crate) fn tag(self) -> u8 {
        match self {
            PioType::Byte => 1,
            PioType::Char => 2,
            PioType::Short => 3,
            PioType::Int => 4,
            PioType::Float => 5,
            PioType::Double => 6,
            PioType::UByte => 7,
            PioType::UShort => 8,
            PioType::UInt => 9,
            PioType::Int64 => 10,
            PioType::UInt64 => 11,
        }
    }

    pub(crate) fn from_tag(t: u8) -> Option<Self> {
        Some(match t {
            1 => PioType::Byte,
            2 => PioType::Char,
            3 => PioType::Short,
            4 => PioType::Int,
            5 => PioType::Float,
            6 => PioType::Double,
            7 => PioType::UByte,
            8 => PioType::UShort,
            9 => PioType::UInt,
            10 => PioType::Int64,
            11 => PioType::UInt64,
            _ => return None,
        })
    }
}

/// Rust element types that may appear in distributed arrays.
///
/// `Pod` gives safe byte-level views for packing into exchange buffers and
/// backend writes; the associated tag ties the Rust type to the on-file
/// type system.
pub trait Element: Pod {
    /// The on-file type this Rust type maps to.
    const PIO_TYPE: PioType;
}

impl Element for i8 {
    const PIO_TYPE: PioType = PioType::Byte;
}
impl Element for u8 {
    const PIO_TYPE: PioType = PioType::UByte;
}
impl Element for i16 {
    const PIO_TYPE: PioType = PioType::Short;
}
impl Element for u16 {
    const PIO_TYPE: PioType = PioType::UShort;
}
impl Element for i32 {
    const PIO_TYPE: PioType = PioType::Int;
}
impl Element for u32 {
    const PIO_TYPE: PioType = PioType::UInt;
}
impl Element for i64 {
    const PIO_TYPE: PioType = PioType::Int64;
}
impl Element for u64 {
    const PIO_TYPE: PioType = PioType::UInt64;
}
impl Element for f32 {
    const PIO_TYPE: PioType = PioType::Float;
}
impl Element for f64 {
    const PIO_TYPE: PioType = PioType::Double;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_fill_lengths() {
        for ty in [
            PioType::Byte,
            PioType::Char,
            PioType::Short,
            PioType::Int,
            PioType::Float,
            PioType::Double,
            PioType::UByte,
            PioType::UShort,
            PioType::UInt,
            PioType::Int64,
            PioType::UInt64,
        ] {
            assert_eq!(ty.size(), ty.default_fill().len());
            assert_eq!(PioType::from_tag(ty.tag()), Some(ty));
        }
    }

    #[test]
    fn element_tags() {
        assert_eq!(<i32 as Element>::PIO_TYPE, PioType::Int);
        assert_eq!(<f64 as Element>::PIO_TYPE, PioType::Double);
    }
}
