//! OS telemetry sources that sit beside the SMC: IOHID sensor services and IOReport energy
//! counters.

use serde::Serialize;

// HID usage pages and usages for Apple vendor sensors
pub const HID_PAGE_APPLE_VENDOR: i32 = 0xff00;
pub const HID_PAGE_APPLE_VENDOR_POWER: i32 = 0xff08;
pub const HID_USAGE_TEMPERATURE_SENSOR: i32 = 0x0005;
pub const HID_USAGE_POWER_VOLTAGE: i32 = 0x0003;
pub const HID_USAGE_POWER_CURRENT: i32 = 0x0002;

// IOHIDEvent types
pub const HID_EVENT_TYPE_TEMPERATURE: i64 = 15;
pub const HID_EVENT_TYPE_POWER: i64 = 25;

// Sensor name patterns used to pick CPU and GPU readings out of the HID lists
pub const HID_CPU_TEMPERATURE_SENSORS: [&str; 2] = ["pACC MTR Temp Sensor", "eACC MTR Temp Sensor"];
pub const HID_GPU_TEMPERATURE_SENSOR: &str = "GPU MTR Temp Sensor";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HidSensorKind {
    Temperature,
    Voltage,
    Current,
}

impl HidSensorKind {
    pub const fn usage_page(self) -> i32 {
        match self {
            Self::Temperature => HID_PAGE_APPLE_VENDOR,
            Self::Voltage | Self::Current => HID_PAGE_APPLE_VENDOR_POWER,
        }
    }

    pub const fn usage(self) -> i32 {
        match self {
            Self::Temperature => HID_USAGE_TEMPERATURE_SENSOR,
            Self::Voltage => HID_USAGE_POWER_VOLTAGE,
            Self::Current => HID_USAGE_POWER_CURRENT,
        }
    }

    pub const fn event_type(self) -> i64 {
        match self {
            Self::Temperature => HID_EVENT_TYPE_TEMPERATURE,
            Self::Voltage | Self::Current => HID_EVENT_TYPE_POWER,
        }
    }

    /// Converts a raw event value to the sensor's unit. Power-type events report milli-units.
    pub fn to_unit(self, raw: f64) -> f64 {
        match self.event_type() {
            HID_EVENT_TYPE_POWER => raw / 1000.0,
            _ => raw,
        }
    }
}

/// One named reading from an IOHID sensor service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HidSensor {
    pub name: String,
    pub value: f64,
}

impl HidSensor {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Mean of the positive readings whose name satisfies `matches`.
pub fn mean_positive<'a>(
    sensors: impl IntoIterator<Item = &'a HidSensor>,
    matches: impl Fn(&str) -> bool,
) -> Option<f64> {
    let (sum, count) = sensors
        .into_iter()
        .filter(|s| s.value > 0.0 && matches(&s.name))
        .fold((0.0, 0usize), |(sum, count), s| (sum + s.value, count + 1));

    (count > 0).then(|| sum / count as f64)
}

/// IOReport "Energy Model" channels summed into a power figure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyChannel {
    Cpu,
    Gpu,
}

impl EnergyChannel {
    pub const GROUP: &'static str = "Energy Model";

    pub fn matches(self, channel: &str) -> bool {
        match self {
            // "CPU Energy" on base chips, "PACC0_CPU Energy" etc. on larger dies
            Self::Cpu => channel.ends_with("CPU Energy"),
            Self::Gpu => channel == "GPU Energy",
        }
    }
}

/// Converts an energy delta accumulated over `duration_ms` to watts.
/// Returns `None` for a unit other than mJ, µJ or nJ.
pub fn energy_to_watts(energy: f64, unit: &str, duration_ms: u64) -> Option<f64> {
    if duration_ms == 0 {
        return None;
    }
    let per_second = energy / (duration_ms as f64 / 1000.0);

    match unit.trim() {
        "mJ" => Some(per_second / 1e3),
        "uJ" | "µJ" | "μJ" => Some(per_second / 1e6),
        "nJ" => Some(per_second / 1e9),
        _ => None,
    }
}

/// Registry class of GPU accelerator services.
pub const GPU_ACCELERATOR_SERVICE: &str = "IOAccelerator";
/// Accelerator property holding the GPU's performance counters.
pub const GPU_STATISTICS_PROPERTY: &str = "PerformanceStatistics";
/// Utilization entries of the statistics dictionary, in order of preference.
pub const GPU_UTILIZATION_KEYS: [&str; 2] = ["Device Utilization %", "GPU Activity(%)"];

/// A utilization percentage as a fraction in `[0, 1]`.
pub fn utilization_fraction(percent: i64) -> f64 {
    (percent as f64 / 100.0).clamp(0.0, 1.0)
}

/// Auxiliary telemetry the sensor session falls back on or prefers over raw SMC keys.
pub trait Telemetry {
    fn hid_sensors(&self, kind: HidSensorKind) -> Vec<HidSensor>;

    /// Average power of `channel` over a short sampling window, in watts.
    fn energy_power(&self, channel: EnergyChannel) -> Option<f64>;

    /// GPU utilization as a fraction in `[0, 1]`.
    fn gpu_usage(&self) -> Option<f64>;
}

/// Telemetry source that never has anything to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTelemetry;

impl Telemetry for NoTelemetry {
    fn hid_sensors(&self, _kind: HidSensorKind) -> Vec<HidSensor> {
        Vec::new()
    }

    fn energy_power(&self, _channel: EnergyChannel) -> Option<f64> {
        None
    }

    fn gpu_usage(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn utilization_is_clamped_to_a_fraction() {
        assert_relative_eq!(utilization_fraction(37), 0.37);
        assert_eq!(utilization_fraction(0), 0.0);
        assert_eq!(utilization_fraction(140), 1.0);
        assert_eq!(utilization_fraction(-3), 0.0);
    }

    #[test]
    fn energy_units_convert_to_watts() {
        assert_relative_eq!(energy_to_watts(500.0, "mJ", 100).unwrap(), 5.0);
        assert_relative_eq!(energy_to_watts(1_500_000.0, "uJ", 1000).unwrap(), 1.5);
        assert_relative_eq!(energy_to_watts(2e8, "nJ ", 100).unwrap(), 2.0);
        assert_eq!(energy_to_watts(1.0, "J", 100), None);
        assert_eq!(energy_to_watts(1.0, "mJ", 0), None);
    }

    #[test]
    fn channel_names_select_cpu_and_gpu() {
        assert!(EnergyChannel::Cpu.matches("CPU Energy"));
        assert!(EnergyChannel::Cpu.matches("PACC0_CPU Energy"));
        assert!(!EnergyChannel::Cpu.matches("GPU Energy"));
        assert!(EnergyChannel::Gpu.matches("GPU Energy"));
        assert!(!EnergyChannel::Gpu.matches("GPU SRAM Energy"));
    }

    #[test]
    fn power_events_are_scaled_from_milli_units() {
        assert_eq!(HidSensorKind::Voltage.to_unit(1200.0), 1.2);
        assert_eq!(HidSensorKind::Current.to_unit(500.0), 0.5);
        assert_eq!(HidSensorKind::Temperature.to_unit(41.5), 41.5);
    }

    #[test]
    fn mean_positive_filters_by_name_and_sign() {
        let sensors = [
            HidSensor::new("pACC MTR Temp Sensor0", 50.0),
            HidSensor::new("eACC MTR Temp Sensor1", 40.0),
            HidSensor::new("pACC MTR Temp Sensor2", 0.0),
            HidSensor::new("NAND CH0 temp", 30.0),
        ];
        let cpu = mean_positive(&sensors, |name| {
            HID_CPU_TEMPERATURE_SENSORS
                .iter()
                .any(|pattern| name.contains(pattern))
        });
        assert_eq!(cpu, Some(45.0));
        assert_eq!(mean_positive(&sensors, |name| name.starts_with("GPU")), None);
    }
}
