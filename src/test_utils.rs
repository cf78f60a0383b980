//! In-memory stand-ins for the SMC, the CPU identity source and the OS telemetry services.
//!
//! `FakeSmc` answers the same struct requests the kernel driver does and records every request
//! so tests can assert on how many round trips an operation made.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::chip::CpuIdentity;
use crate::error::SmcError;
use crate::smc::{
    Connector, KeyData, KeyInfo, MAX_DATA_SIZE, SMC_CMD_READ_BYTES, SMC_CMD_READ_INDEX,
    SMC_CMD_READ_KEYINFO, SmcChannel, SmcKey, TypeTag,
};
use crate::telemetry::{EnergyChannel, HidSensor, HidSensorKind, Telemetry};

const RESULT_KEY_NOT_FOUND: u8 = 132;
const KIORETURN_BAD_ARGUMENT: i32 = -536_870_206;

struct FakeEntry {
    data_type: TypeTag,
    bytes: Vec<u8>,
    declared_size: Option<u32>,
}

#[derive(Default)]
struct FakeState {
    keys: BTreeMap<SmcKey, FakeEntry>,
    failing: HashMap<SmcKey, i32>,
    requests: Vec<(u8, String)>,
    opens: usize,
    fail_open: bool,
}

impl FakeState {
    fn refresh_key_count(&mut self) {
        let count = self.keys.len() as u32 + u32::from(!self.keys.contains_key(&SmcKey::KEY_COUNT));
        self.keys.insert(
            SmcKey::KEY_COUNT,
            FakeEntry {
                data_type: TypeTag::UI32,
                bytes: count.to_be_bytes().to_vec(),
                declared_size: None,
            },
        );
    }
}

/// A scripted SMC. Clones share state, so a test can keep a handle while a session owns
/// another.
#[derive(Clone, Default)]
pub struct FakeSmc {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSmc {
    pub fn new() -> Self {
        let smc = Self::default();
        smc.lock().refresh_key_count();
        smc
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn insert_raw(&self, key: &str, data_type: TypeTag, bytes: &[u8]) {
        let mut state = self.lock();
        state.keys.insert(
            key.parse().unwrap(),
            FakeEntry {
                data_type,
                bytes: bytes.to_vec(),
                declared_size: None,
            },
        );
        state.refresh_key_count();
    }

    pub fn insert_flt(&self, key: &str, value: f32) {
        self.insert_raw(key, TypeTag::FLT, &value.to_le_bytes());
    }

    pub fn insert_sp78(&self, key: &str, value: f64) {
        let raw = (value * 256.0).round() as i16;
        self.insert_raw(key, TypeTag::SP78, &raw.to_be_bytes());
    }

    pub fn insert_fpe2(&self, key: &str, value: f64) {
        let raw = (value * 4.0).round() as u16;
        self.insert_raw(key, TypeTag::FPE2, &raw.to_be_bytes());
    }

    pub fn insert_ui8(&self, key: &str, value: u8) {
        self.insert_raw(key, TypeTag::UI8, &[value]);
    }

    /// Makes "read key info" report `size` regardless of the stored bytes.
    pub fn declare_size(&self, key: &str, size: u32) {
        let key: SmcKey = key.parse().unwrap();
        if let Some(entry) = self.lock().keys.get_mut(&key) {
            entry.declared_size = Some(size);
        }
    }

    /// Every request naming `key` fails with the IOKit `status`.
    pub fn fail_key(&self, key: &str, status: i32) {
        self.lock().failing.insert(key.parse().unwrap(), status);
    }

    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn requests(&self) -> Vec<(u8, String)> {
        self.lock().requests.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Number of "read bytes" requests for `key`.
    pub fn reads_of(&self, key: &str) -> usize {
        self.count(SMC_CMD_READ_BYTES, key)
    }

    pub fn info_requests_for(&self, key: &str) -> usize {
        self.count(SMC_CMD_READ_KEYINFO, key)
    }

    fn count(&self, command: u8, key: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|(c, k)| *c == command && k == key)
            .count()
    }
}

impl Connector for FakeSmc {
    type Channel = FakeChannel;

    fn open(&self) -> Result<FakeChannel, SmcError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(SmcError::NotPrivileged);
        }
        state.opens += 1;
        Ok(FakeChannel {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
}

impl SmcChannel for FakeChannel {
    fn call(&mut self, input: &KeyData) -> Result<KeyData, i32> {
        let mut state = self.state.lock().unwrap();
        let mut output = *input;

        if input.data8 == SMC_CMD_READ_INDEX {
            state
                .requests
                .push((SMC_CMD_READ_INDEX, format!("#{}", input.data32)));
            match state.keys.keys().nth(input.data32 as usize) {
                Some(key) => output.key = key.to_u32(),
                None => output.result = RESULT_KEY_NOT_FOUND,
            }
            return Ok(output);
        }

        let key = SmcKey::from_u32(input.key);
        state.requests.push((input.data8, key.to_string()));
        if let Some(&status) = state.failing.get(&key) {
            return Err(status);
        }

        let Some(entry) = state.keys.get(&key) else {
            output.result = RESULT_KEY_NOT_FOUND;
            return Ok(output);
        };

        match input.data8 {
            SMC_CMD_READ_KEYINFO => {
                output.key_info = KeyInfo {
                    data_size: entry.declared_size.unwrap_or(entry.bytes.len() as u32),
                    data_type: entry.data_type.to_u32(),
                    data_attributes: 0,
                };
            }
            SMC_CMD_READ_BYTES => {
                let len = entry.bytes.len().min(MAX_DATA_SIZE);
                output.bytes = [0; MAX_DATA_SIZE];
                output.bytes[..len].copy_from_slice(&entry.bytes[..len]);
            }
            _ => return Err(KIORETURN_BAD_ARGUMENT),
        }

        Ok(output)
    }
}

/// Answers brand string queries from a script, repeating the last answer once it runs out.
pub struct ScriptedIdentity {
    answers: Mutex<VecDeque<Option<String>>>,
    last: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl ScriptedIdentity {
    pub fn new(answers: &[Option<&str>]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CpuIdentity for ScriptedIdentity {
    fn brand_string(&self) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.answers.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

impl CpuIdentity for Arc<ScriptedIdentity> {
    fn brand_string(&self) -> Option<String> {
        self.as_ref().brand_string()
    }
}

/// Fixed HID sensor lists and energy readings.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry {
    pub temperature: Vec<HidSensor>,
    pub voltage: Vec<HidSensor>,
    pub current: Vec<HidSensor>,
    pub cpu_power: Option<f64>,
    pub gpu_power: Option<f64>,
    pub gpu_usage: Option<f64>,
}

impl StaticTelemetry {
    pub fn with_temperatures(sensors: &[(&str, f64)]) -> Self {
        Self {
            temperature: sensors
                .iter()
                .map(|&(name, value)| HidSensor::new(name, value))
                .collect(),
            ..Self::default()
        }
    }
}

impl Telemetry for StaticTelemetry {
    fn hid_sensors(&self, kind: HidSensorKind) -> Vec<HidSensor> {
        match kind {
            HidSensorKind::Temperature => self.temperature.clone(),
            HidSensorKind::Voltage => self.voltage.clone(),
            HidSensorKind::Current => self.current.clone(),
        }
    }

    fn energy_power(&self, channel: EnergyChannel) -> Option<f64> {
        match channel {
            EnergyChannel::Cpu => self.cpu_power,
            EnergyChannel::Gpu => self.gpu_power,
        }
    }

    fn gpu_usage(&self) -> Option<f64> {
        self.gpu_usage
    }
}
