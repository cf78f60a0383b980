//! The sensor session: every public reading, built from SMC keys, discovered key lists and the
//! auxiliary OS telemetry.
//!
//! Each reading opens its own SMC connection and closes it before returning. Chip
//! classification and discovered key lists are kept for the life of the session.

use std::sync::OnceLock;

use log::{debug, trace, warn};
use serde::Serialize;

use crate::chip::{ChipGeneration, Classification, CpuIdentity, classify};
use crate::config::Config;
use crate::error::SmcError;
use crate::smc::{
    Connector, FanField, KeyCache, Quantity, RawValue, SensorFamily, SmcChannel, SmcKey, TypeTag,
    discover, is_float_sensor, mean_within,
};
use crate::telemetry::{
    EnergyChannel, HID_CPU_TEMPERATURE_SENSORS, HID_GPU_TEMPERATURE_SENSOR, HidSensor,
    HidSensorKind, Telemetry, mean_positive,
};

#[cfg(target_os = "macos")]
use crate::chip::SysctlIdentity;
#[cfg(target_os = "macos")]
use crate::iokit::SystemTelemetry;
#[cfg(target_os = "macos")]
use crate::smc::IoKitConnector;

// Temperature keys used on Intel Macs
const KEY_CPU_PROXIMITY: SmcKey = SmcKey::from_bytes(*b"TC0P");
const KEY_GPU_DIE_INTEL: SmcKey = SmcKey::from_bytes(*b"TG0D");

// Power keys, in watts
const KEY_CPU_POWER: SmcKey = SmcKey::from_bytes(*b"PCTR");
const KEY_GPU_POWER: SmcKey = SmcKey::from_bytes(*b"PGTR");
const KEY_SYSTEM_POWER: SmcKey = SmcKey::from_bytes(*b"PSTR");

// Voltage keys
const KEY_CPU_VOLTAGE: SmcKey = SmcKey::from_bytes(*b"VC0C");
const KEY_GPU_VOLTAGE: SmcKey = SmcKey::from_bytes(*b"VG0C");
const KEY_MEMORY_VOLTAGE: SmcKey = SmcKey::from_bytes(*b"VM0R");

/// Fan indices addressable through `F{n}..` keys.
pub const MAX_FANS: u8 = 10;

/// A reading that could not be taken is `Ok(None)`. `Err` is reserved for failing to open the
/// SMC connection.
pub type Reading = Result<Option<f64>, SmcError>;

pub struct Session<C: Connector> {
    connector: C,
    identity: Box<dyn CpuIdentity + Send + Sync>,
    telemetry: Box<dyn Telemetry + Send + Sync>,
    config: Config,
    chip: OnceLock<Classification>,
    keys: KeyCache,
}

#[cfg(target_os = "macos")]
impl Session<IoKitConnector> {
    /// A session over the real SMC, sysctl and IOKit telemetry services.
    pub fn system(config: Config) -> Self {
        let telemetry = SystemTelemetry::new(config.energy_sample_interval());
        Self::with_parts(IoKitConnector, SysctlIdentity, telemetry, config)
    }
}

impl<C: Connector> Session<C> {
    pub fn with_parts(
        connector: C,
        identity: impl CpuIdentity + Send + Sync + 'static,
        telemetry: impl Telemetry + Send + Sync + 'static,
        config: Config,
    ) -> Self {
        Self {
            connector,
            identity: Box::new(identity),
            telemetry: Box::new(telemetry),
            config,
            chip: OnceLock::new(),
            keys: KeyCache::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Classifies the chip on first use. Later calls return the same classification.
    pub fn classification(&self) -> &Classification {
        self.chip.get_or_init(|| {
            let brand = self.identity.brand_string();
            let classification = classify(brand.as_deref());
            debug!(
                "classified {:?} as {} ({:?}, {:?})",
                brand, classification.generation, classification.tier, classification.confidence
            );
            classification
        })
    }

    pub fn chip_generation(&self) -> ChipGeneration {
        self.classification().generation
    }

    pub fn model_name(&self) -> String {
        self.classification().model_name()
    }

    // ============================================================================
    // Temperature
    // ============================================================================

    /// CPU temperature in °C.
    ///
    /// Intel reads `TC0P`. Apple silicon averages the discovered CPU keys, then falls back to
    /// the `pACC`/`eACC` HID sensors, which are also used when the SMC cannot be opened.
    pub fn temperature(&self) -> Reading {
        if self.chip_generation() == ChipGeneration::Intel {
            return self.read_one(KEY_CPU_PROXIMITY, Quantity::Temperature);
        }

        match self.discovered_mean(SensorFamily::Cpu) {
            Ok(Some(mean)) => Ok(Some(mean)),
            Ok(None) => Ok(self.cpu_hid_mean()),
            Err(err) if err.is_connection_error() => match self.cpu_hid_mean() {
                Some(mean) => {
                    debug!("CPU temperature from HID sensors, SMC unavailable: {}", err);
                    Ok(Some(mean))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    fn cpu_hid_mean(&self) -> Option<f64> {
        self.hid_mean(|name| {
            HID_CPU_TEMPERATURE_SENSORS
                .iter()
                .any(|pattern| name.contains(pattern))
        })
    }

    /// CPU die temperature in °C, from the one key the chip generation uses for it.
    pub fn cpu_die_temperature(&self) -> Reading {
        let key = self.chip_generation().cpu_die_key();
        self.read_one(key, Quantity::Temperature)
    }

    /// GPU temperature in °C: HID GPU sensors first, then `TG0D` on Intel or the discovered
    /// GPU keys on Apple silicon.
    pub fn gpu_temperature(&self) -> Reading {
        if let Some(mean) = self.hid_mean(|name| name.starts_with(HID_GPU_TEMPERATURE_SENSOR)) {
            return Ok(Some(mean));
        }

        if self.chip_generation() == ChipGeneration::Intel {
            return self.read_one(KEY_GPU_DIE_INTEL, Quantity::Temperature);
        }
        self.discovered_mean(SensorFamily::Gpu)
    }

    // ============================================================================
    // Fans
    // ============================================================================

    pub fn fan_count(&self) -> Reading {
        self.read_one(SmcKey::FAN_COUNT, Quantity::Count)
    }

    /// Current speed of fan `index` in RPM.
    pub fn fan_rpm(&self, index: u8) -> Reading {
        self.read_fan(index, FanField::Actual)
    }

    pub fn fan_min(&self, index: u8) -> Reading {
        self.read_fan(index, FanField::Minimum)
    }

    pub fn fan_max(&self, index: u8) -> Reading {
        self.read_fan(index, FanField::Maximum)
    }

    fn read_fan(&self, index: u8, field: FanField) -> Reading {
        match SmcKey::fan(index, field) {
            Ok(key) => self.read_one(key, Quantity::FanSpeed),
            Err(err) => {
                trace!("fan {}: {}", index, err);
                Ok(None)
            }
        }
    }

    // ============================================================================
    // Power and voltage
    // ============================================================================

    /// CPU power in watts, sampled from IOReport energy counters when available.
    pub fn cpu_power(&self) -> Reading {
        self.energy_or_key(EnergyChannel::Cpu, KEY_CPU_POWER)
    }

    pub fn gpu_power(&self) -> Reading {
        self.energy_or_key(EnergyChannel::Gpu, KEY_GPU_POWER)
    }

    pub fn system_power(&self) -> Reading {
        self.read_one(KEY_SYSTEM_POWER, Quantity::Power)
    }

    pub fn cpu_voltage(&self) -> Reading {
        self.read_one(KEY_CPU_VOLTAGE, Quantity::Voltage)
    }

    pub fn gpu_voltage(&self) -> Reading {
        self.read_one(KEY_GPU_VOLTAGE, Quantity::Voltage)
    }

    pub fn memory_voltage(&self) -> Reading {
        self.read_one(KEY_MEMORY_VOLTAGE, Quantity::Voltage)
    }

    fn energy_or_key(&self, channel: EnergyChannel, key: SmcKey) -> Reading {
        match self.telemetry.energy_power(channel) {
            Some(watts) => Ok(Some(watts)),
            None => self.read_one(key, Quantity::Power),
        }
    }

    /// GPU utilization as a fraction in `[0, 1]`, from the GPU accelerator's statistics.
    pub fn gpu_usage(&self) -> Option<f64> {
        self.telemetry.gpu_usage()
    }

    // ============================================================================
    // HID sensor lists
    // ============================================================================

    pub fn temperature_sensors(&self) -> Vec<HidSensor> {
        self.hid_sensors(HidSensorKind::Temperature)
    }

    pub fn voltage_sensors(&self) -> Vec<HidSensor> {
        self.hid_sensors(HidSensorKind::Voltage)
    }

    pub fn current_sensors(&self) -> Vec<HidSensor> {
        self.hid_sensors(HidSensorKind::Current)
    }

    fn hid_sensors(&self, kind: HidSensorKind) -> Vec<HidSensor> {
        if !self.config.hid_sensors {
            return Vec::new();
        }
        self.telemetry.hid_sensors(kind)
    }

    fn hid_mean(&self, matches: impl Fn(&str) -> bool) -> Option<f64> {
        mean_positive(&self.hid_sensors(HidSensorKind::Temperature), matches)
    }

    // ============================================================================
    // Raw access
    // ============================================================================

    /// Every key the SMC reports, in index order. Keys with unprintable names are skipped.
    pub fn keys(&self) -> Result<Vec<SmcKey>, SmcError> {
        let mut channel = self.open()?;
        enumerate(&mut channel)
    }

    /// One key's raw value, with per-key failures reported as errors.
    pub fn read(&self, key: SmcKey) -> Result<RawValue, SmcError> {
        let mut channel = self.open()?;
        channel.read_key(key)
    }

    /// Reads every key the SMC reports, sorted by key name.
    pub fn dump(&self) -> Result<Vec<KeyDump>, SmcError> {
        let mut channel = self.open()?;
        let mut dump: Vec<KeyDump> = enumerate(&mut channel)?
            .into_iter()
            .map(|key| KeyDump::from_read(key, channel.read_key(key)))
            .collect();
        dump.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(dump)
    }

    /// Takes every reading once.
    ///
    /// A failure to open the SMC does not stop the snapshot: the affected readings are `None`,
    /// the first such error is kept in [`Snapshot::smc_error`], and the HID and IOReport readings
    /// are still taken.
    pub fn snapshot(&self) -> Snapshot {
        let mut smc_error: Option<SmcError> = None;
        let mut settle = |reading: Reading| match reading {
            Ok(value) => value,
            Err(err) => {
                if smc_error.is_none() {
                    smc_error = Some(err);
                }
                None
            }
        };

        let fan_count = settle(self.fan_count()).map_or(0, |n| n as u8).min(MAX_FANS);
        let fans = (0..fan_count)
            .map(|index| FanReading {
                index,
                actual_rpm: settle(self.fan_rpm(index)),
                minimum_rpm: settle(self.fan_min(index)),
                maximum_rpm: settle(self.fan_max(index)),
            })
            .collect();

        let temperature = TemperatureReadings {
            cpu: settle(self.temperature()),
            cpu_die: settle(self.cpu_die_temperature()),
            gpu: settle(self.gpu_temperature()),
        };
        let power = PowerReadings {
            cpu: settle(self.cpu_power()),
            gpu: settle(self.gpu_power()),
            system: settle(self.system_power()),
        };
        let voltage = VoltageReadings {
            cpu: settle(self.cpu_voltage()),
            gpu: settle(self.gpu_voltage()),
            memory: settle(self.memory_voltage()),
        };

        Snapshot {
            chip: self.classification().clone(),
            model_name: self.model_name(),
            temperature,
            fans,
            power,
            voltage,
            gpu_usage: self.gpu_usage(),
            hid: HidReadings {
                temperature: self.temperature_sensors(),
                voltage: self.voltage_sensors(),
                current: self.current_sensors(),
            },
            smc_error: smc_error.map(|err| err.to_string()),
        }
    }

    // ============================================================================
    // SMC plumbing
    // ============================================================================

    fn open(&self) -> Result<C::Channel, SmcError> {
        self.connector.open().inspect_err(|err| {
            warn!("cannot open SMC connection: {}", err);
        })
    }

    fn read_one(&self, key: SmcKey, quantity: Quantity) -> Reading {
        let mut channel = self.open()?;
        Ok(read_quantity(&mut channel, key, quantity))
    }

    /// Mean over the discovered keys of `family`, running discovery first if this session has
    /// not yet done so.
    fn discovered_mean(&self, family: SensorFamily) -> Reading {
        let (plan, bounds) = match family {
            SensorFamily::Cpu => (self.config.cpu_discovery(), self.config.cpu_bounds()),
            SensorFamily::Gpu => (self.config.gpu_discovery(), self.config.gpu_bounds()),
        };

        let mut channel = self.open()?;
        let keys = self
            .keys
            .get_or_discover(family, || discover(&mut channel, &plan));

        let readings: Vec<f64> = keys
            .iter()
            .filter_map(|&key| read_float_sensor(&mut channel, key))
            .collect();
        Ok(mean_within(readings, bounds))
    }
}

fn read_quantity<Ch: SmcChannel>(channel: &mut Ch, key: SmcKey, quantity: Quantity) -> Option<f64> {
    let value = channel
        .read_key(key)
        .inspect_err(|err| trace!("read {}: {}", key, err))
        .ok()?;
    value
        .decode_as(quantity)
        .inspect_err(|err| trace!("decode {} as {}: {}", key, quantity, err))
        .ok()
}

fn read_float_sensor<Ch: SmcChannel>(channel: &mut Ch, key: SmcKey) -> Option<f64> {
    match channel.read_key(key) {
        Ok(value) if is_float_sensor(&value) => value.decode().ok(),
        Ok(value) => {
            trace!("{} is no longer a float sensor ({})", key, value.data_type());
            None
        }
        Err(err) => {
            trace!("read {}: {}", key, err);
            None
        }
    }
}

fn enumerate<Ch: SmcChannel>(channel: &mut Ch) -> Result<Vec<SmcKey>, SmcError> {
    let count = channel.key_count()?;
    debug!("SMC reports {} keys", count);

    let keys = (0..count)
        .filter_map(|index| match channel.key_at_index(index) {
            Ok(key) if key.is_printable() => Some(key),
            Ok(key) => {
                trace!("skipping unprintable key {:?} at index {}", key, index);
                None
            }
            Err(err) => {
                trace!("{}", err);
                None
            }
        })
        .collect();
    Ok(keys)
}

/// One entry of [`Session::dump`].
#[derive(Debug, Clone, Serialize)]
pub struct KeyDump {
    pub key: SmcKey,
    pub data_type: Option<TypeTag>,
    pub size: u32,
    pub bytes: Vec<u8>,
    /// The value decoded by its declared type, if the type is supported.
    pub value: Option<f64>,
    pub error: Option<String>,
}

impl KeyDump {
    fn from_read(key: SmcKey, read: Result<RawValue, SmcError>) -> Self {
        match read {
            Ok(raw) => {
                let decoded = raw.decode();
                Self {
                    key,
                    data_type: Some(raw.data_type()),
                    size: raw.size(),
                    bytes: raw.bytes().to_vec(),
                    value: decoded.as_ref().ok().copied(),
                    error: decoded.err().map(|e| e.to_string()),
                }
            }
            Err(err) => Self {
                key,
                data_type: None,
                size: 0,
                bytes: Vec::new(),
                value: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub chip: Classification,
    pub model_name: String,
    pub temperature: TemperatureReadings,
    pub fans: Vec<FanReading>,
    pub power: PowerReadings,
    pub voltage: VoltageReadings,
    pub gpu_usage: Option<f64>,
    pub hid: HidReadings,
    /// Why the SMC readings are missing, if the connection could not be opened.
    pub smc_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureReadings {
    pub cpu: Option<f64>,
    pub cpu_die: Option<f64>,
    pub gpu: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FanReading {
    pub index: u8,
    pub actual_rpm: Option<f64>,
    pub minimum_rpm: Option<f64>,
    pub maximum_rpm: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerReadings {
    pub cpu: Option<f64>,
    pub gpu: Option<f64>,
    pub system: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoltageReadings {
    pub cpu: Option<f64>,
    pub gpu: Option<f64>,
    pub memory: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HidReadings {
    pub temperature: Vec<HidSensor>,
    pub voltage: Vec<HidSensor>,
    pub current: Vec<HidSensor>,
}
