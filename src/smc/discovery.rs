//! Runtime discovery of temperature keys on Apple silicon.
//!
//! Apple silicon does not publish which `Tp**`/`Te**`/`Tg**` keys exist on a given chip, so the
//! key space is probed once per sensor family and the keys that answer with a 4-byte `flt `
//! value are remembered for the rest of the session.

use std::fmt;
use std::sync::OnceLock;

use log::{debug, trace};
use serde::Serialize;

use super::value::{DataType, RawValue};
use super::{SmcChannel, SmcKey};
use crate::error::DecodeError;

const DIGITS: &[u8] = b"0123456789";
const HEX_LETTERS: &[u8] = b"abcdef";

const CPU_PREFIXES: [[u8; 2]; 2] = [*b"Tp", *b"Te"];
const GPU_PREFIXES: [[u8; 2]; 1] = [*b"Tg"];

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorFamily {
    Cpu,
    Gpu,
}

impl SensorFamily {
    pub const fn prefixes(self) -> &'static [[u8; 2]] {
        match self {
            Self::Cpu => &CPU_PREFIXES,
            Self::Gpu => &GPU_PREFIXES,
        }
    }
}

impl fmt::Display for SensorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Gpu => f.write_str("GPU"),
        }
    }
}

/// When to probe the `[0-9][a-f]` suffixes after the numeric pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HexPass {
    Always,
    /// Only if the numeric pass found fewer keys than this.
    Below(usize),
}

impl HexPass {
    fn should_run(self, found: usize) -> bool {
        match self {
            Self::Always => true,
            Self::Below(threshold) => found < threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPlan {
    pub family: SensorFamily,
    pub hex_pass: HexPass,
}

impl DiscoveryPlan {
    pub fn cpu(hex_pass_below: usize) -> Self {
        Self {
            family: SensorFamily::Cpu,
            hex_pass: HexPass::Below(hex_pass_below),
        }
    }

    pub fn gpu() -> Self {
        Self {
            family: SensorFamily::Gpu,
            hex_pass: HexPass::Always,
        }
    }

    /// `Tp00`..`Tp99`, then `Te00`..`Te99` for the CPU.
    pub fn numeric_candidates(&self) -> impl Iterator<Item = SmcKey> + '_ {
        candidates(self.family.prefixes(), DIGITS)
    }

    /// `Tp0a`..`Tp9f`, then `Te0a`..`Te9f` for the CPU.
    pub fn hex_candidates(&self) -> impl Iterator<Item = SmcKey> + '_ {
        candidates(self.family.prefixes(), HEX_LETTERS)
    }
}

fn candidates(
    prefixes: &'static [[u8; 2]],
    last: &'static [u8],
) -> impl Iterator<Item = SmcKey> {
    prefixes.iter().flat_map(move |&[a, b]| {
        DIGITS
            .iter()
            .flat_map(move |&i| last.iter().map(move |&j| SmcKey::from_bytes([a, b, i, j])))
    })
}

/// True for the values discovery keeps: a 4-byte `flt `.
pub fn is_float_sensor(value: &RawValue) -> bool {
    value.size() == 4 && DataType::from(value.data_type()) == DataType::Flt
}

/// Probes every candidate of `plan` and returns the keys that hold float sensors, in probe
/// order. Failed probes are skipped.
pub(crate) fn discover<C: SmcChannel + ?Sized>(
    channel: &mut C,
    plan: &DiscoveryPlan,
) -> Vec<SmcKey> {
    let mut found = probe(channel, plan.numeric_candidates());
    let numeric = found.len();

    if plan.hex_pass.should_run(numeric) {
        found.extend(probe(channel, plan.hex_candidates()));
    }

    debug!(
        "discovered {} {} temperature keys ({} numeric, {} hex)",
        found.len(),
        plan.family,
        numeric,
        found.len() - numeric
    );
    found
}

fn probe<C: SmcChannel + ?Sized>(
    channel: &mut C,
    candidates: impl Iterator<Item = SmcKey>,
) -> Vec<SmcKey> {
    candidates
        .filter(|&key| match channel.read_key(key) {
            Ok(value) => is_float_sensor(&value),
            Err(err) => {
                trace!("probe {}: {}", key, err);
                false
            }
        })
        .collect()
}

/// Discovered keys per sensor family. Each list is written once and never invalidated.
#[derive(Debug, Default)]
pub struct KeyCache {
    cpu: OnceLock<Vec<SmcKey>>,
    gpu: OnceLock<Vec<SmcKey>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, family: SensorFamily) -> Option<&[SmcKey]> {
        self.slot(family).get().map(Vec::as_slice)
    }

    /// Returns the cached list, running `discover` only if the family has never been probed.
    /// Concurrent callers wait for the single discovery in progress.
    pub fn get_or_discover(
        &self,
        family: SensorFamily,
        discover: impl FnOnce() -> Vec<SmcKey>,
    ) -> &[SmcKey] {
        self.slot(family).get_or_init(discover)
    }

    fn slot(&self, family: SensorFamily) -> &OnceLock<Vec<SmcKey>> {
        match family {
            SensorFamily::Cpu => &self.cpu,
            SensorFamily::Gpu => &self.gpu,
        }
    }
}

/// Exclusive range of plausible readings.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    /// `(0, ceiling)`.
    pub const fn below(ceiling: f64) -> Self {
        Self {
            min: 0.0,
            max: ceiling,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }

    pub fn check(&self, value: f64) -> Result<f64, DecodeError> {
        if self.contains(value) {
            Ok(value)
        } else {
            Err(DecodeError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            })
        }
    }
}

/// Mean of the values inside `bounds`, or `None` if there are none.
pub(crate) fn mean_within(values: impl IntoIterator<Item = f64>, bounds: Bounds) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .filter_map(|v| {
            bounds
                .check(v)
                .inspect_err(|err| trace!("excluded from mean: {}", err))
                .ok()
        })
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

    (count > 0).then(|| sum / count as f64)
}
