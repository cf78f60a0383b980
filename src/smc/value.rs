use std::fmt;

use serde::Serialize;

use super::key::{SmcKey, TypeTag};
use crate::error::{DecodeError, SmcError};

/// Size of the data buffer carried in every SMC response.
pub const MAX_DATA_SIZE: usize = 32;

// fpe2: unsigned fixed point with 2 fractional bits
const FPE2_FRACTION_BITS: u32 = 2;

/// A value exactly as the SMC returned it: key, declared type and the first `size` bytes of
/// the response buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct RawValue {
    key: SmcKey,
    data_type: TypeTag,
    size: u32,
    bytes: [u8; MAX_DATA_SIZE],
}

impl RawValue {
    pub fn new(key: SmcKey, data_type: TypeTag, data: &[u8]) -> Result<Self, SmcError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(SmcError::DataSizeOverflow {
                key,
                size: data.len() as u32,
            });
        }

        let mut bytes = [0u8; MAX_DATA_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            key,
            data_type,
            size: data.len() as u32,
            bytes,
        })
    }

    pub fn key(&self) -> SmcKey {
        self.key
    }

    pub fn data_type(&self) -> TypeTag {
        self.data_type
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Decodes the value by its declared type alone, with no unit conversion.
    pub fn decode(&self) -> Result<f64, DecodeError> {
        DataType::from(self.data_type).decode(self.bytes())
    }

    /// Decodes the value as a reading of `quantity`, rejecting encodings the quantity is not
    /// expected to use and applying its unit conversion.
    pub fn decode_as(&self, quantity: Quantity) -> Result<f64, DecodeError> {
        let data_type = DataType::from(self.data_type);
        if let DataType::Unsupported(tag) = data_type {
            return Err(DecodeError::UnsupportedType(tag));
        }
        if !quantity.accepts(data_type) {
            return Err(DecodeError::TypeMismatch {
                quantity,
                found: self.data_type,
            });
        }

        let value = data_type.decode(self.bytes())?;
        Ok(quantity.to_unit(data_type, value))
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawValue")
            .field("key", &self.key)
            .field("data_type", &self.data_type)
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// The SMC data types this crate knows how to decode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Signed 7.8 fixed point, big-endian.
    Sp78,
    /// IEEE-754 single, little-endian. This is the one little-endian type on the SMC.
    Flt,
    /// Unsigned fixed point with 2 fractional bits, 1 to 4 bytes.
    Fpe2,
    Ui8,
    Ui16,
    Ui32,
    Unsupported(TypeTag),
}

impl From<TypeTag> for DataType {
    fn from(tag: TypeTag) -> Self {
        match tag {
            TypeTag::SP78 => Self::Sp78,
            TypeTag::FLT => Self::Flt,
            TypeTag::FPE2 => Self::Fpe2,
            TypeTag::UI8 => Self::Ui8,
            TypeTag::UI16 => Self::Ui16,
            TypeTag::UI32 => Self::Ui32,
            other => Self::Unsupported(other),
        }
    }
}

impl DataType {
    pub fn tag(self) -> TypeTag {
        match self {
            Self::Sp78 => TypeTag::SP78,
            Self::Flt => TypeTag::FLT,
            Self::Fpe2 => TypeTag::FPE2,
            Self::Ui8 => TypeTag::UI8,
            Self::Ui16 => TypeTag::UI16,
            Self::Ui32 => TypeTag::UI32,
            Self::Unsupported(tag) => tag,
        }
    }

    pub fn decode(self, data: &[u8]) -> Result<f64, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }

        match self {
            Self::Sp78 => {
                let [hi, lo] = self.exact::<2>(data)?;
                Ok((i16::from(hi as i8) * 256 + i16::from(lo)) as f64 / 256.0)
            }
            Self::Flt => Ok(f32::from_le_bytes(self.exact::<4>(data)?) as f64),
            Self::Fpe2 => {
                if data.len() > 4 {
                    return Err(self.length_error(data));
                }
                Ok(decode_fpe(data, FPE2_FRACTION_BITS) as f64)
            }
            Self::Ui8 => Ok(self.exact::<1>(data)?[0] as f64),
            Self::Ui16 => Ok(u16::from_be_bytes(self.exact::<2>(data)?) as f64),
            Self::Ui32 => Ok(u32::from_be_bytes(self.exact::<4>(data)?) as f64),
            Self::Unsupported(tag) => Err(DecodeError::UnsupportedType(tag)),
        }
    }

    fn exact<const N: usize>(self, data: &[u8]) -> Result<[u8; N], DecodeError> {
        data.try_into().map_err(|_| self.length_error(data))
    }

    fn length_error(self, data: &[u8]) -> DecodeError {
        DecodeError::Length {
            data_type: self.tag(),
            actual: data.len(),
        }
    }
}

// Every byte but the last contributes 8 - e integer bits; the last byte holds the e
// fractional bits, which are dropped.
fn decode_fpe(data: &[u8], e: u32) -> u64 {
    let n = data.len();
    data.iter().enumerate().fold(0u64, |acc, (i, &b)| {
        if i + 1 == n {
            acc + u64::from(b >> e)
        } else {
            acc + (u64::from(b) << ((n - 1 - i) as u32 * (8 - e)))
        }
    })
}

/// What a reading measures. Each quantity accepts a fixed set of encodings and owns its unit
/// conversion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Degrees Celsius.
    Temperature,
    /// Revolutions per minute.
    FanSpeed,
    /// Watts.
    Power,
    /// Volts.
    Voltage,
    Count,
}

impl Quantity {
    pub fn accepts(self, data_type: DataType) -> bool {
        use DataType::*;
        match self {
            Self::Temperature => matches!(data_type, Sp78 | Flt),
            Self::FanSpeed | Self::Power | Self::Voltage => matches!(data_type, Fpe2 | Flt),
            Self::Count => matches!(data_type, Ui8 | Ui16 | Ui32),
        }
    }

    fn to_unit(self, data_type: DataType, value: f64) -> f64 {
        match (self, data_type) {
            // fpe2 voltages are reported in millivolts
            (Self::Voltage, DataType::Fpe2) => value / 1000.0,
            _ => value,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Temperature => "temperature",
            Self::FanSpeed => "fan speed",
            Self::Power => "power",
            Self::Voltage => "voltage",
            Self::Count => "count",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn raw(tag: TypeTag, data: &[u8]) -> RawValue {
        RawValue::new("TEST".parse().unwrap(), tag, data).unwrap()
    }

    #[test]
    fn sp78_decodes_signed_fixed_point() {
        assert_eq!(DataType::Sp78.decode(&[0x19, 0x80]), Ok(25.5));
        assert_eq!(DataType::Sp78.decode(&[0xFF, 0x80]), Ok(-0.5));
    }

    #[test]
    fn fpe2_sums_shifted_bytes() {
        assert_eq!(DataType::Fpe2.decode(&[0x0C, 0x00]), Ok(768.0));
        assert_eq!(DataType::Fpe2.decode(&[0x1F, 0x40]), Ok(2000.0));
        assert_eq!(DataType::Fpe2.decode(&[0x10]), Ok(4.0));
    }

    #[test]
    fn flt_is_little_endian() {
        let bytes = 45.0f32.to_le_bytes();
        assert_eq!(DataType::Flt.decode(&bytes), Ok(45.0));

        let bytes = 61.37f32.to_le_bytes();
        assert_relative_eq!(DataType::Flt.decode(&bytes).unwrap(), 61.37, epsilon = 1e-5);
    }

    #[test]
    fn unsigned_integers_are_big_endian() {
        assert_eq!(DataType::Ui8.decode(&[2]), Ok(2.0));
        assert_eq!(DataType::Ui16.decode(&[0x01, 0x00]), Ok(256.0));
        assert_eq!(DataType::Ui32.decode(&[0x00, 0x00, 0x04, 0xD2]), Ok(1234.0));
    }

    #[test]
    fn empty_and_misfit_lengths_are_rejected() {
        assert_eq!(DataType::Sp78.decode(&[]), Err(DecodeError::Empty));
        assert_eq!(
            DataType::Flt.decode(&[0, 0]),
            Err(DecodeError::Length {
                data_type: TypeTag::FLT,
                actual: 2
            })
        );
        assert!(DataType::Fpe2.decode(&[1, 2, 3, 4, 5]).is_err());
        assert!(DataType::Sp78.decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn unknown_tags_are_unsupported() {
        let tag: TypeTag = "ch8*".parse().unwrap();
        assert_eq!(DataType::from(tag), DataType::Unsupported(tag));
        assert_eq!(
            raw(tag, b"abc").decode(),
            Err(DecodeError::UnsupportedType(tag))
        );
    }

    #[test]
    fn voltage_in_millivolts_is_scaled() {
        // (0x12 << 6) + (0xC0 >> 2) = 1200 mV
        let fpe = raw(TypeTag::FPE2, &[0x12, 0xC0]);
        assert_relative_eq!(fpe.decode_as(Quantity::Voltage).unwrap(), 1.2);

        let flt = raw(TypeTag::FLT, &0.85f32.to_le_bytes());
        assert_relative_eq!(
            flt.decode_as(Quantity::Voltage).unwrap(),
            0.85,
            epsilon = 1e-6
        );
    }

    #[test]
    fn quantity_rejects_unexpected_encoding() {
        let count = raw(TypeTag::UI8, &[2]);
        assert_eq!(
            count.decode_as(Quantity::Temperature),
            Err(DecodeError::TypeMismatch {
                quantity: Quantity::Temperature,
                found: TypeTag::UI8
            })
        );
        assert_eq!(count.decode_as(Quantity::Count), Ok(2.0));
    }

    #[test]
    fn raw_value_rejects_oversized_payload() {
        let key: SmcKey = "TEST".parse().unwrap();
        assert!(matches!(
            RawValue::new(key, TypeTag::FLT, &[0u8; 33]),
            Err(SmcError::DataSizeOverflow { size: 33, .. })
        ));
        assert_eq!(raw(TypeTag::FLT, &[1, 2, 3, 4]).bytes(), &[1, 2, 3, 4]);
    }
}
