use std::ffi::{CStr, CString, c_void};
use std::mem;

use core_foundation::dictionary::{CFDictionaryRef, CFMutableDictionaryRef};
use log::debug;
use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;

use super::{Connector, KERNEL_INDEX_SMC, KEY_DATA_SIZE, KeyData, SmcChannel};
use crate::error::SmcError;

// IOKit error codes
const KIORETURN_NOT_PRIVILEGED: i32 = -536_870_174;

const SMC_SERVICE: &str = "AppleSMC";
// On Apple silicon the key interface is a separate AppleSMC entry
const SMC_KEYS_ENDPOINT: &str = "AppleSMCKeysEndpoint";

// IOKit bindings
#[link(name = "IOKit", kind = "framework")]
unsafe extern "C" {
    fn IOServiceMatching(name: *const i8) -> CFMutableDictionaryRef;
    fn IOServiceGetMatchingServices(
        main_port: u32,
        matching: CFDictionaryRef,
        existing: *mut u32,
    ) -> i32;
    fn IOIteratorNext(iterator: u32) -> u32;
    fn IORegistryEntryGetName(entry: u32, name: *mut i8) -> i32;
    fn IOServiceOpen(
        service: u32,
        owning_task: mach_port_t,
        conn_type: u32,
        connection: *mut u32,
    ) -> i32;
    fn IOServiceClose(connection: u32) -> i32;
    fn IOObjectRelease(object: u32) -> u32;
    fn IOConnectCallStructMethod(
        connection: u32,
        selector: u32,
        input: *const c_void,
        input_size: usize,
        output: *mut c_void,
        output_size: *mut usize,
    ) -> i32;
}

// Registry entries matching a service class, with their names
struct IOServiceIterator {
    iterator: u32,
}

impl IOServiceIterator {
    fn new(service_name: &str) -> Option<Self> {
        let c_name = CString::new(service_name).ok()?;
        let mut iterator = 0u32;

        unsafe {
            let matching = IOServiceMatching(c_name.as_ptr());
            if matching.is_null() {
                return None;
            }
            // consumes the matching dictionary
            if IOServiceGetMatchingServices(0, matching as CFDictionaryRef, &mut iterator)
                != KERN_SUCCESS
            {
                return None;
            }
        }

        Some(Self { iterator })
    }
}

impl Iterator for IOServiceIterator {
    type Item = (u32, String);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = unsafe { IOIteratorNext(self.iterator) };
        if entry == 0 {
            return None;
        }

        let mut name_buf = [0i8; 128];
        let name = if unsafe { IORegistryEntryGetName(entry, name_buf.as_mut_ptr()) } == 0 {
            unsafe { CStr::from_ptr(name_buf.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };

        Some((entry, name))
    }
}

impl Drop for IOServiceIterator {
    fn drop(&mut self) {
        if self.iterator != 0 {
            unsafe {
                IOObjectRelease(self.iterator);
            }
        }
    }
}

/// Opens connections to the `AppleSMC` kernel service.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoKitConnector;

impl IoKitConnector {
    // The keys endpoint if there is one, else the first AppleSMC entry. The caller releases
    // the returned entry.
    fn find_device() -> Option<(u32, String)> {
        let mut chosen: Option<(u32, String)> = None;

        for (entry, name) in IOServiceIterator::new(SMC_SERVICE)? {
            if name == SMC_KEYS_ENDPOINT {
                if let Some((previous, _)) = chosen.replace((entry, name)) {
                    unsafe { IOObjectRelease(previous) };
                }
                break;
            }
            if chosen.is_none() {
                chosen = Some((entry, name));
            } else {
                unsafe { IOObjectRelease(entry) };
            }
        }

        chosen
    }
}

impl Connector for IoKitConnector {
    type Channel = IoKitConnection;

    fn open(&self) -> Result<IoKitConnection, SmcError> {
        let (device, name) = Self::find_device().ok_or(SmcError::NoDeviceFound)?;

        let mut connection = 0u32;
        let result = unsafe {
            let result = IOServiceOpen(device, mach_task_self(), 0, &mut connection);
            IOObjectRelease(device);
            result
        };

        match result {
            KERN_SUCCESS if connection != 0 => {
                debug!("opened SMC service {}", name);
                Ok(IoKitConnection { connection })
            }
            KIORETURN_NOT_PRIVILEGED => Err(SmcError::NotPrivileged),
            status => Err(SmcError::OpenFailed(status)),
        }
    }
}

/// An open SMC connection. Closed on drop.
#[derive(Debug)]
pub struct IoKitConnection {
    connection: u32,
}

impl SmcChannel for IoKitConnection {
    fn call(&mut self, input: &KeyData) -> Result<KeyData, i32> {
        let mut output = KeyData::default();
        let mut output_size = KEY_DATA_SIZE;

        let result = unsafe {
            IOConnectCallStructMethod(
                self.connection,
                KERNEL_INDEX_SMC,
                input as *const KeyData as *const c_void,
                mem::size_of::<KeyData>(),
                &mut output as *mut KeyData as *mut c_void,
                &mut output_size,
            )
        };

        if result != KERN_SUCCESS {
            return Err(result);
        }
        Ok(output)
    }
}

impl Drop for IoKitConnection {
    fn drop(&mut self) {
        if self.connection != 0 {
            unsafe {
                IOServiceClose(self.connection);
            }
        }
    }
}
