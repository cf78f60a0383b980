use core_foundation::array::{CFArrayGetCount, CFArrayGetValueAtIndex, CFArrayRef};
use core_foundation::base::{
    CFAllocatorRef, CFGetTypeID, CFRelease, CFTypeRef, TCFType, kCFAllocatorDefault,
};
use core_foundation::dictionary::{
    CFDictionary, CFDictionaryCreateMutableCopy, CFDictionaryGetCount, CFDictionaryGetTypeID,
    CFDictionaryGetValue, CFDictionaryRef, CFMutableDictionaryRef,
};
use core_foundation::number::{CFNumber, CFNumberGetTypeID, CFNumberRef};
use core_foundation::string::{CFString, CFStringRef};
use log::debug;
use mach2::kern_return::KERN_SUCCESS;
use std::ffi::{CString, c_void};
use std::marker::{PhantomData, PhantomPinned};
use std::mem::MaybeUninit;
use std::ptr::null;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::TelemetryError;
use crate::telemetry::{
    EnergyChannel, GPU_ACCELERATOR_SERVICE, GPU_STATISTICS_PROPERTY, GPU_UTILIZATION_KEYS,
    HidSensor, HidSensorKind, Telemetry, energy_to_watts, utilization_fraction,
};
use crate::utils::{cf_dict_get_array, cf_string_to_rust};

// IOReport framework bindings
#[repr(C)]
struct IOReportSubscription {
    _data: [u8; 0],
    _phantom: PhantomData<(*mut u8, PhantomPinned)>,
}

type IOReportSubscriptionRef = *const IOReportSubscription;

#[link(name = "IOReport", kind = "dylib")]
unsafe extern "C" {
    fn IOReportCopyChannelsInGroup(
        group: CFStringRef,
        subgroup: CFStringRef,
        a: u64,
        b: u64,
        c: u64,
    ) -> CFDictionaryRef;
    fn IOReportMergeChannels(a: CFDictionaryRef, b: CFDictionaryRef, nil: CFTypeRef);
    fn IOReportCreateSubscription(
        a: *const c_void,
        b: CFMutableDictionaryRef,
        c: *mut CFMutableDictionaryRef,
        d: u64,
        e: CFTypeRef,
    ) -> IOReportSubscriptionRef;
    fn IOReportCreateSamples(
        a: IOReportSubscriptionRef,
        b: CFMutableDictionaryRef,
        c: CFTypeRef,
    ) -> CFDictionaryRef;
    fn IOReportCreateSamplesDelta(
        a: CFDictionaryRef,
        b: CFDictionaryRef,
        c: CFTypeRef,
    ) -> CFDictionaryRef;
    fn IOReportChannelGetGroup(a: CFDictionaryRef) -> CFStringRef;
    fn IOReportChannelGetChannelName(a: CFDictionaryRef) -> CFStringRef;
    fn IOReportSimpleGetIntegerValue(a: CFDictionaryRef, b: i32) -> i64;
    fn IOReportChannelGetUnitLabel(a: CFDictionaryRef) -> CFStringRef;
}

// IOHID bindings
#[repr(C)]
struct IOHIDServiceClient(c_void);

#[repr(C)]
struct IOHIDEventSystemClient(c_void);

#[repr(C)]
struct IOHIDEvent(c_void);

type IOHIDServiceClientRef = *const IOHIDServiceClient;
type IOHIDEventSystemClientRef = *const IOHIDEventSystemClient;
type IOHIDEventRef = *const IOHIDEvent;

#[link(name = "IOKit", kind = "framework")]
unsafe extern "C" {
    fn IOHIDEventSystemClientCreate(allocator: CFAllocatorRef) -> IOHIDEventSystemClientRef;
    fn IOHIDEventSystemClientSetMatching(a: IOHIDEventSystemClientRef, b: CFDictionaryRef) -> i32;
    fn IOHIDEventSystemClientCopyServices(a: IOHIDEventSystemClientRef) -> CFArrayRef;
    fn IOHIDServiceClientCopyProperty(a: IOHIDServiceClientRef, b: CFStringRef) -> CFStringRef;
    fn IOHIDServiceClientCopyEvent(
        a: IOHIDServiceClientRef,
        event_type: i64,
        options: i32,
        timestamp: i64,
    ) -> IOHIDEventRef;
    fn IOHIDEventGetFloatValue(event: IOHIDEventRef, field: i64) -> f64;

    fn IOServiceMatching(name: *const i8) -> CFMutableDictionaryRef;
    fn IOServiceGetMatchingServices(
        main_port: u32,
        matching: CFDictionaryRef,
        existing: *mut u32,
    ) -> i32;
    fn IOIteratorNext(iterator: u32) -> u32;
    fn IOObjectRelease(object: u32) -> u32;
    fn IORegistryEntryCreateCFProperty(
        entry: u32,
        key: CFStringRef,
        allocator: CFAllocatorRef,
        options: u32,
    ) -> CFTypeRef;
}

// Get channel group name
fn get_channel_group(item: CFDictionaryRef) -> String {
    cf_string_to_rust(unsafe { IOReportChannelGetGroup(item) })
}

// Get channel name
fn get_channel_name(item: CFDictionaryRef) -> String {
    cf_string_to_rust(unsafe { IOReportChannelGetChannelName(item) })
}

// Get channel unit label
fn get_unit_label(item: CFDictionaryRef) -> String {
    cf_string_to_rust(unsafe { IOReportChannelGetUnitLabel(item) })
        .trim()
        .to_string()
}

// IOReport channel iterator over one sample delta
struct IOReportIterator {
    sample: CFDictionaryRef,
    index: isize,
    items: CFArrayRef,
    items_size: isize,
}

impl IOReportIterator {
    // Takes ownership of `sample`
    fn new(sample: CFDictionaryRef) -> Option<Self> {
        let Some(items) = cf_dict_get_array(sample, "IOReportChannels") else {
            unsafe { CFRelease(sample as _) };
            return None;
        };
        let items_size = unsafe { CFArrayGetCount(items) };
        Some(Self {
            sample,
            index: 0,
            items,
            items_size,
        })
    }
}

impl Drop for IOReportIterator {
    fn drop(&mut self) {
        unsafe {
            CFRelease(self.sample as _);
        }
    }
}

struct IOReportChannel {
    group: String,
    channel: String,
    unit: String,
    item: CFDictionaryRef,
}

impl IOReportChannel {
    fn integer_value(&self) -> i64 {
        unsafe { IOReportSimpleGetIntegerValue(self.item, 0) }
    }
}

impl Iterator for IOReportIterator {
    type Item = IOReportChannel;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.items_size {
            return None;
        }

        let item = unsafe { CFArrayGetValueAtIndex(self.items, self.index) } as CFDictionaryRef;
        self.index += 1;

        Some(IOReportChannel {
            group: get_channel_group(item),
            channel: get_channel_name(item),
            unit: get_unit_label(item),
            item,
        })
    }
}

// IOReport subscription to a set of channel groups
struct IOReport {
    subscription: IOReportSubscriptionRef,
    channels: CFMutableDictionaryRef,
}

impl IOReport {
    fn new(groups: &[(&str, Option<&str>)]) -> Result<Self, TelemetryError> {
        let missing = || {
            TelemetryError::MissingChannels(
                groups
                    .iter()
                    .map(|(group, _)| *group)
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };

        let mut channel_dicts = Vec::new();
        for (group, subgroup) in groups {
            let group_str = CFString::new(group);
            let subgroup_str = subgroup.map(CFString::new);
            let subgroup_ref = subgroup_str
                .as_ref()
                .map_or(null(), |s| s.as_concrete_TypeRef());

            let channels = unsafe {
                IOReportCopyChannelsInGroup(group_str.as_concrete_TypeRef(), subgroup_ref, 0, 0, 0)
            };
            if !channels.is_null() {
                channel_dicts.push(channels);
            }
        }

        let Some((&first, rest)) = channel_dicts.split_first() else {
            return Err(missing());
        };

        // Merge all channel dictionaries into a mutable copy of the first
        let merged = unsafe {
            for &channels in rest {
                IOReportMergeChannels(first, channels, null());
            }
            let merged =
                CFDictionaryCreateMutableCopy(kCFAllocatorDefault, CFDictionaryGetCount(first), first);
            for channels in channel_dicts {
                CFRelease(channels as _);
            }
            merged
        };

        if cf_dict_get_array(merged as CFDictionaryRef, "IOReportChannels").is_none() {
            if !merged.is_null() {
                unsafe { CFRelease(merged as _) };
            }
            return Err(missing());
        }

        let mut subscription_dict: MaybeUninit<CFMutableDictionaryRef> = MaybeUninit::uninit();
        let subscription = unsafe {
            IOReportCreateSubscription(null(), merged, subscription_dict.as_mut_ptr(), 0, null())
        };
        if subscription.is_null() {
            unsafe { CFRelease(merged as _) };
            return Err(TelemetryError::SubscriptionFailed);
        }

        Ok(Self {
            subscription,
            channels: merged,
        })
    }

    // Two samples `duration` apart, returned as their delta
    fn sample(&self, duration: Duration) -> Result<IOReportIterator, TelemetryError> {
        unsafe {
            let first = IOReportCreateSamples(self.subscription, self.channels, null());
            if first.is_null() {
                return Err(TelemetryError::SampleFailed);
            }

            std::thread::sleep(duration);

            let second = IOReportCreateSamples(self.subscription, self.channels, null());
            if second.is_null() {
                CFRelease(first as _);
                return Err(TelemetryError::SampleFailed);
            }

            let delta = IOReportCreateSamplesDelta(first, second, null());
            CFRelease(first as _);
            CFRelease(second as _);

            if delta.is_null() {
                return Err(TelemetryError::SampleFailed);
            }
            IOReportIterator::new(delta).ok_or(TelemetryError::SampleFailed)
        }
    }
}

// The subscription and channel dictionary are immutable CF objects; sampling goes through a
// Mutex in `SystemTelemetry`.
unsafe impl Send for IOReport {}

impl Drop for IOReport {
    fn drop(&mut self) {
        unsafe {
            CFRelease(self.channels as _);
            CFRelease(self.subscription as _);
        }
    }
}

// Sum of the energy channels matching `channel`, as watts over the sample window
fn sample_energy(
    report: &IOReport,
    channel: EnergyChannel,
    duration: Duration,
) -> Result<Option<f64>, TelemetryError> {
    let duration_ms = duration.as_millis() as u64;

    let mut total = None;
    for item in report.sample(duration)? {
        if item.group != EnergyChannel::GROUP || !channel.matches(&item.channel) {
            continue;
        }
        match energy_to_watts(item.integer_value() as f64, &item.unit, duration_ms) {
            Some(watts) => *total.get_or_insert(0.0) += watts,
            None => debug!("skipping {} with unit {:?}", item.channel, item.unit),
        }
    }

    Ok(total)
}

// Utilization percentage of the first GPU accelerator
fn read_gpu_utilization() -> Option<i64> {
    let class = CString::new(GPU_ACCELERATOR_SERVICE).ok()?;
    let property = CFString::new(GPU_STATISTICS_PROPERTY);

    unsafe {
        let matching = IOServiceMatching(class.as_ptr());
        if matching.is_null() {
            return None;
        }
        let mut iterator = 0u32;
        // consumes the matching dictionary
        if IOServiceGetMatchingServices(0, matching as CFDictionaryRef, &mut iterator)
            != KERN_SUCCESS
        {
            return None;
        }

        let service = IOIteratorNext(iterator);
        IOObjectRelease(iterator);
        if service == 0 {
            return None;
        }

        let stats = IORegistryEntryCreateCFProperty(
            service,
            property.as_concrete_TypeRef(),
            kCFAllocatorDefault,
            0,
        );
        IOObjectRelease(service);
        if stats.is_null() {
            return None;
        }
        if CFGetTypeID(stats) != CFDictionaryGetTypeID() {
            CFRelease(stats);
            return None;
        }

        let percent = GPU_UTILIZATION_KEYS.iter().find_map(|name| {
            let key = CFString::new(name);
            let value = CFDictionaryGetValue(stats as CFDictionaryRef, key.as_CFTypeRef());
            if value.is_null() || CFGetTypeID(value) != CFNumberGetTypeID() {
                return None;
            }
            CFNumber::wrap_under_get_rule(value as CFNumberRef).to_i64()
        });
        CFRelease(stats);
        percent
    }
}

// Every IOHID service on the sensor's usage page, with its current value
fn read_hid_sensors(kind: HidSensorKind) -> Vec<HidSensor> {
    let matching = CFDictionary::from_CFType_pairs(&[
        (
            CFString::new("PrimaryUsagePage"),
            CFNumber::from(kind.usage_page()),
        ),
        (CFString::new("PrimaryUsage"), CFNumber::from(kind.usage())),
    ]);
    let product = CFString::new("Product");
    let event_type = kind.event_type();

    let mut items = Vec::new();
    unsafe {
        let system = IOHIDEventSystemClientCreate(kCFAllocatorDefault);
        if system.is_null() {
            return items;
        }

        IOHIDEventSystemClientSetMatching(system, matching.as_concrete_TypeRef());

        let services = IOHIDEventSystemClientCopyServices(system);
        if services.is_null() {
            CFRelease(system as _);
            return items;
        }

        for i in 0..CFArrayGetCount(services) {
            let service = CFArrayGetValueAtIndex(services, i) as IOHIDServiceClientRef;
            if service.is_null() {
                continue;
            }

            let name = IOHIDServiceClientCopyProperty(service, product.as_concrete_TypeRef());
            if name.is_null() {
                continue;
            }
            let name = CFString::wrap_under_create_rule(name).to_string();

            let event = IOHIDServiceClientCopyEvent(service, event_type, 0, 0);
            if event.is_null() {
                continue;
            }
            let raw = IOHIDEventGetFloatValue(event, event_type << 16);
            CFRelease(event as _);

            items.push(HidSensor::new(name, kind.to_unit(raw)));
        }

        CFRelease(services as _);
        CFRelease(system as _);
    }

    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

/// IOHID sensors, IOReport energy counters and GPU statistics of the running machine.
///
/// The IOReport subscription is created on the first power reading and reused afterwards. If it
/// cannot be created, energy readings stay unavailable for the life of this value.
pub struct SystemTelemetry {
    energy_sample: Duration,
    energy: OnceLock<Option<Mutex<IOReport>>>,
}

impl SystemTelemetry {
    pub fn new(energy_sample: Duration) -> Self {
        Self {
            energy_sample,
            energy: OnceLock::new(),
        }
    }

    fn energy_report(&self) -> Option<&Mutex<IOReport>> {
        self.energy
            .get_or_init(|| match IOReport::new(&[(EnergyChannel::GROUP, None)]) {
                Ok(report) => Some(Mutex::new(report)),
                Err(err) => {
                    debug!("energy counters unavailable: {}", err);
                    None
                }
            })
            .as_ref()
    }
}

impl Telemetry for SystemTelemetry {
    fn hid_sensors(&self, kind: HidSensorKind) -> Vec<HidSensor> {
        let sensors = read_hid_sensors(kind);
        debug!("{} {:?} HID sensors", sensors.len(), kind);
        sensors
    }

    fn energy_power(&self, channel: EnergyChannel) -> Option<f64> {
        let report = self.energy_report()?;
        let report = report.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match sample_energy(&report, channel, self.energy_sample) {
            Ok(watts) => watts,
            Err(err) => {
                debug!("{:?} energy unavailable: {}", channel, err);
                None
            }
        }
    }

    fn gpu_usage(&self) -> Option<f64> {
        let percent = read_gpu_utilization();
        if percent.is_none() {
            debug!("no GPU utilization in {}", GPU_ACCELERATOR_SERVICE);
        }
        percent.map(utilization_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn cached_subscription_can_be_shared_between_threads() {
        assert_send_sync::<SystemTelemetry>();

        let telemetry = SystemTelemetry::new(Duration::from_millis(1));
        assert!(telemetry.energy.get().is_none());
        let first = telemetry.energy_report().map(|r| r as *const _);
        let second = telemetry.energy_report().map(|r| r as *const _);
        assert_eq!(first, second);
        assert!(telemetry.energy.get().is_some());
    }
}
