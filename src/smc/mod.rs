//! SMC key/value protocol.
//!
//! Every request and response is the same fixed 80-byte [`KeyData`] structure exchanged over
//! IOKit selector 2. Reading a key takes two round trips: "read key info" to learn the value's
//! type and size, then "read bytes".

mod discovery;
mod key;
mod value;

#[cfg(target_os = "macos")]
mod iokit;

use std::mem;

pub use discovery::{Bounds, DiscoveryPlan, HexPass, KeyCache, SensorFamily, is_float_sensor};
pub use key::{FanField, SmcKey, TypeTag};
pub use value::{DataType, MAX_DATA_SIZE, Quantity, RawValue};

#[cfg(target_os = "macos")]
pub use iokit::{IoKitConnection, IoKitConnector};

pub(crate) use discovery::{discover, mean_within};

use crate::error::SmcError;

// SMC commands
pub const SMC_CMD_READ_BYTES: u8 = 5;
pub const SMC_CMD_READ_INDEX: u8 = 8;
pub const SMC_CMD_READ_KEYINFO: u8 = 9;

/// IOKit selector for the SMC's struct method (kSMCHandleYPCEvent).
pub const KERNEL_INDEX_SMC: u32 = 2;

// SMC result byte for an unknown key
const SMC_RESULT_KEY_NOT_FOUND: u8 = 132;

// SMC data structures
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KeyVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
    pub reserved: u8,
    pub release: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PLimitData {
    pub version: u16,
    pub length: u16,
    pub cpu_p_limit: u32,
    pub gpu_p_limit: u32,
    pub mem_p_limit: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub data_size: u32,
    pub data_type: u32,
    pub data_attributes: u8,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct KeyData {
    pub key: u32,
    pub vers: KeyVersion,
    pub p_limit_data: PLimitData,
    pub key_info: KeyInfo,
    pub result: u8,
    pub status: u8,
    pub data8: u8,
    pub data32: u32,
    pub bytes: [u8; MAX_DATA_SIZE],
}

pub const KEY_DATA_SIZE: usize = mem::size_of::<KeyData>();

/// An open channel to the SMC.
///
/// Implementors provide the raw struct exchange; key-level reads are built on top of it.
/// Calls take `&mut self`, so a channel is never used from two places at once.
pub trait SmcChannel {
    /// Sends one request and returns the response, or the IOKit status on failure.
    fn call(&mut self, input: &KeyData) -> Result<KeyData, i32>;

    fn read_key_info(&mut self, key: SmcKey) -> Result<KeyInfo, SmcError> {
        let input = KeyData {
            key: key.to_u32(),
            data8: SMC_CMD_READ_KEYINFO,
            ..Default::default()
        };
        exchange(self, key, &input).map(|output| output.key_info)
    }

    /// Reads a key's type and size, then its bytes. Any failure aborts the whole read.
    fn read_key(&mut self, key: SmcKey) -> Result<RawValue, SmcError> {
        let info = self.read_key_info(key)?;
        if info.data_size as usize > MAX_DATA_SIZE {
            return Err(SmcError::DataSizeOverflow {
                key,
                size: info.data_size,
            });
        }

        let input = KeyData {
            key: key.to_u32(),
            data8: SMC_CMD_READ_BYTES,
            key_info: info,
            ..Default::default()
        };
        let output = exchange(self, key, &input)?;

        RawValue::new(
            key,
            TypeTag::from_u32(info.data_type),
            &output.bytes[..info.data_size as usize],
        )
    }

    fn key_at_index(&mut self, index: u32) -> Result<SmcKey, SmcError> {
        let input = KeyData {
            data8: SMC_CMD_READ_INDEX,
            data32: index,
            ..Default::default()
        };

        let output = self
            .call(&input)
            .map_err(|status| SmcError::Enumeration { index, status })?;
        if output.result != 0 {
            return Err(SmcError::Enumeration {
                index,
                status: i32::from(output.result),
            });
        }

        Ok(SmcKey::from_u32(output.key))
    }

    /// Number of keys the SMC exposes, from `#KEY`.
    fn key_count(&mut self) -> Result<u32, SmcError> {
        let key = SmcKey::KEY_COUNT;
        let value = self.read_key(key)?;
        value
            .decode_as(Quantity::Count)
            .map(|count| count as u32)
            .map_err(|source| SmcError::Decode { key, source })
    }
}

/// Opens SMC channels. A fresh channel is opened for every logical operation and closed when
/// it is dropped.
pub trait Connector {
    type Channel: SmcChannel;

    fn open(&self) -> Result<Self::Channel, SmcError>;
}

fn exchange<C: SmcChannel + ?Sized>(
    channel: &mut C,
    key: SmcKey,
    input: &KeyData,
) -> Result<KeyData, SmcError> {
    let output = channel
        .call(input)
        .map_err(|status| SmcError::TransportFailure { key, status })?;

    match output.result {
        0 => Ok(output),
        SMC_RESULT_KEY_NOT_FOUND => Err(SmcError::KeyNotFound(key)),
        code => Err(SmcError::SmcStatus { key, code }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeSmc;

    #[test]
    fn key_data_matches_kernel_layout() {
        assert_eq!(KEY_DATA_SIZE, 80);
        assert_eq!(mem::offset_of!(KeyData, key_info), 28);
        assert_eq!(mem::offset_of!(KeyData, data8), 42);
        assert_eq!(mem::offset_of!(KeyData, bytes), 48);
    }

    #[test]
    fn read_key_uses_info_then_bytes() {
        let smc = FakeSmc::new();
        smc.insert_sp78("TC0D", 52.25);
        let mut channel = smc.open().unwrap();

        let value = channel.read_key("TC0D".parse().unwrap()).unwrap();
        assert_eq!(value.data_type(), TypeTag::SP78);
        assert_eq!(value.size(), 2);
        assert_eq!(value.decode(), Ok(52.25));
        assert_eq!(
            smc.requests(),
            vec![
                (SMC_CMD_READ_KEYINFO, "TC0D".to_string()),
                (SMC_CMD_READ_BYTES, "TC0D".to_string())
            ]
        );
    }

    #[test]
    fn missing_key_is_reported_without_reading_bytes() {
        let smc = FakeSmc::new();
        let mut channel = smc.open().unwrap();

        let key: SmcKey = "Tp01".parse().unwrap();
        assert!(matches!(
            channel.read_key(key),
            Err(SmcError::KeyNotFound(k)) if k == key
        ));
        assert_eq!(smc.total_calls(), 1);
    }

    #[test]
    fn transport_failure_carries_status() {
        let smc = FakeSmc::new();
        smc.insert_flt("Tp01", 40.0);
        smc.fail_key("Tp01", -536_870_212);
        let mut channel = smc.open().unwrap();

        assert!(matches!(
            channel.read_key("Tp01".parse().unwrap()),
            Err(SmcError::TransportFailure {
                status: -536_870_212,
                ..
            })
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let smc = FakeSmc::new();
        smc.insert_raw("BIGK", TypeTag::from_bytes(*b"ch8*"), &[0u8; 8]);
        smc.declare_size("BIGK", 64);
        let mut channel = smc.open().unwrap();

        assert!(matches!(
            channel.read_key("BIGK".parse().unwrap()),
            Err(SmcError::DataSizeOverflow { size: 64, .. })
        ));
    }

    #[test]
    fn enumerates_keys_by_index() {
        let smc = FakeSmc::new();
        smc.insert_flt("Tp01", 40.0);
        smc.insert_ui8("FNum", 1);
        let mut channel = smc.open().unwrap();

        // #KEY itself is one of the enumerated keys
        assert_eq!(channel.key_count().unwrap(), 3);
        let keys: Vec<String> = (0..3)
            .map(|i| channel.key_at_index(i).unwrap().to_string())
            .collect();
        assert_eq!(keys, vec!["#KEY", "FNum", "Tp01"]);
        assert!(channel.key_at_index(3).is_err());
    }
}
