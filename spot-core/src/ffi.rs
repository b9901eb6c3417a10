//! C ABI for linking spot-core as a static library from the mobile apps (NDK / Xcode).
//! The app owns the socket; it hands RefreshData payloads in and reads the cache back.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use crate::cache::Congestion;
use crate::navigation::Platform;
use crate::protocol::LotSnapshot;
use crate::SpotCore;

fn platform_from_code(code: u8) -> Option<Platform> {
    match code {
        0 => Some(Platform::Web),
        1 => Some(Platform::Ios),
        2 => Some(Platform::Android),
        _ => None,
    }
}

/// Create a new core instance. Returns opaque handle.
#[no_mangle]
pub extern "C" fn spot_core_create() -> *mut c_void {
    let core = SpotCore::new();
    Box::into_raw(Box::new(core)) as *mut c_void
}

/// Destroy core instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn spot_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut SpotCore) };
}

/// Set the platform used for deep links: 0 = web, 1 = iOS, 2 = Android. Returns 0, or -1 on bad input.
#[no_mangle]
pub extern "C" fn spot_core_set_platform(h: *mut c_void, platform: u8) -> c_int {
    if h.is_null() {
        return -1;
    }
    let Some(platform) = platform_from_code(platform) else {
        return -1;
    };
    let core = unsafe { &mut *(h as *mut SpotCore) };
    core.set_platform(platform);
    0
}

/// Apply the `data` of a RefreshData response (UTF-8 JSON list of lots).
/// Returns the number of cached spots, or -1 if the payload does not parse (cache unchanged).
#[no_mangle]
pub extern "C" fn spot_core_apply_refresh(h: *mut c_void, json: *const u8, json_len: usize) -> c_int {
    if h.is_null() || json.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut SpotCore) };
    let bytes = unsafe { slice::from_raw_parts(json, json_len) };
    let lots: Vec<LotSnapshot> = match serde_json::from_slice(bytes) {
        Ok(lots) => lots,
        Err(e) => {
            tracing::warn!(error = %e, "rejected refresh payload");
            return -1;
        }
    };
    core.apply_refresh(lots).spots as c_int
}

/// Cache version; 0 before the first refresh.
#[no_mangle]
pub extern "C" fn spot_core_cache_version(h: *mut c_void) -> u64 {
    if h.is_null() {
        return 0;
    }
    let core = unsafe { &*(h as *const SpotCore) };
    core.cache().version()
}

/// Status code of a spot: 0 = available, 1 = occupied, 2 = reserved. -1 if unknown spot.
#[no_mangle]
pub extern "C" fn spot_core_spot_status(h: *mut c_void, spot_id: u32) -> c_int {
    if h.is_null() {
        return -1;
    }
    let core = unsafe { &*(h as *const SpotCore) };
    match core.effective_status(spot_id) {
        Some(status) => c_int::from(status.code()),
        None => -1,
    }
}

/// Congestion of a lot into out_fraction. Returns 1 if known, 0 if unknown (render gray), -1 on error.
#[no_mangle]
pub extern "C" fn spot_core_lot_congestion(
    h: *mut c_void,
    lot_id: *const u8,
    lot_id_len: usize,
    out_fraction: *mut f64,
) -> c_int {
    if h.is_null() || lot_id.is_null() || out_fraction.is_null() {
        return -1;
    }
    let core = unsafe { &*(h as *const SpotCore) };
    let raw = unsafe { slice::from_raw_parts(lot_id, lot_id_len) };
    let Ok(lot_id) = std::str::from_utf8(raw) else {
        return -1;
    };
    match core.snapshot().lot_congestion(lot_id) {
        Congestion::Known(fraction) => {
            unsafe {
                *out_fraction = fraction;
            }
            1
        }
        Congestion::Unknown => 0,
    }
}

/// Write the navigation deep link for a spot (UTF-8, not NUL-terminated) to out_buf.
/// Returns bytes written, or -1 if the spot has no destination or out_buf is too small.
#[no_mangle]
pub extern "C" fn spot_core_deep_link(
    h: *mut c_void,
    spot_id: u32,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let core = unsafe { &*(h as *const SpotCore) };
    let link = match core.navigation_request(spot_id) {
        Ok(request) => request.deep_link(),
        Err(_) => return -1,
    };
    if link.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(link.as_ptr(), link.len());
    }
    link.len() as c_int
}
