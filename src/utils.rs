// Utilities: CoreFoundation and sysctl helpers for the macOS backends

// ===== CoreFoundation helpers =====
use core_foundation::array::CFArrayRef;
use core_foundation::base::TCFType;
use core_foundation::dictionary::CFDictionaryRef;
use core_foundation::string::{CFString, CFStringGetCString, CFStringRef, kCFStringEncodingUTF8};
use core_foundation_sys::dictionary::CFDictionaryGetValue;

/// Convert CFStringRef to Rust String (lossy). Returns empty string on null or failure.
pub fn cf_string_to_rust(cf_str: CFStringRef) -> String {
    if cf_str.is_null() {
        return String::new();
    }
    unsafe {
        let mut buffer = [0u8; 256];
        let success = CFStringGetCString(
            cf_str,
            buffer.as_mut_ptr() as *mut i8,
            buffer.len() as isize,
            kCFStringEncodingUTF8,
        );
        if success != 0 {
            std::ffi::CStr::from_ptr(buffer.as_ptr() as *const i8)
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        }
    }
}

/// Get a CFArray value from a CFDictionary by key. The array is borrowed from the dictionary.
pub fn cf_dict_get_array(dict: CFDictionaryRef, key: &str) -> Option<CFArrayRef> {
    if dict.is_null() {
        return None;
    }
    unsafe {
        let k = CFString::new(key);
        let val = CFDictionaryGetValue(dict, k.as_CFTypeRef());
        if val.is_null() {
            None
        } else {
            Some(val as CFArrayRef)
        }
    }
}

// ===== sysctl helpers =====
use std::ffi::CString;
use std::io;

/// Read a sysctl value as raw bytes using sysctlbyname
pub fn sysctl_bytes(name: &str) -> io::Result<Vec<u8>> {
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    unsafe {
        let mut size: libc::size_t = 0;
        let ret = libc::sysctlbyname(
            cname.as_ptr(),
            std::ptr::null_mut(),
            &mut size,
            std::ptr::null_mut(),
            0,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("sysctl {} is empty", name),
            ));
        }

        let mut buf = vec![0u8; size];
        let ret = libc::sysctlbyname(
            cname.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(size);
        Ok(buf)
    }
}

/// Read a sysctl value as UTF-8 string (strips trailing NUL if present)
pub fn sysctl_string(name: &str) -> io::Result<String> {
    let mut bytes = sysctl_bytes(name)?;
    if let Some(pos) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(pos);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
