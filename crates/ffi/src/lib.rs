//! tunebridge FFI - C ABI for host-language integration
//!
//! Design principles:
//! - All extern "C" functions use catch_unwind
//! - No panic across FFI boundary
//! - Strings returned to the caller are owned by Rust and released with
//!   `tunebridge_string_free`

use serde_json::Value;
use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tunebridge_compiler::{call_json, error_mapping};
use tunebridge_ir::Error;

thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = msg;
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| e.borrow_mut().clear());
}

/// Copy the last error message of this thread into `buf`, NUL terminated.
/// Returns the number of bytes copied, or -1 when `buf` is unusable.
///
/// # Safety
/// `buf` must be a valid pointer to a buffer of at least `len` bytes
#[no_mangle]
pub unsafe extern "C" fn tunebridge_last_error(buf: *mut u8, len: usize) -> i32 {
    if buf.is_null() || len == 0 {
        return -1;
    }

    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        let bytes = msg.as_bytes();
        let copy_len = bytes.len().min(len - 1);
        ptr::copy_nonoverlapping(bytes.as_ptr(), buf, copy_len);
        *buf.add(copy_len) = 0;
        copy_len as i32
    })
}

/// Run operation `op` with JSON parameters `params_json` (may be null for no
/// parameters). Always returns a JSON object with a `status` field; release
/// it with `tunebridge_string_free`.
///
/// # Safety
/// `op` must be null or a valid NUL-terminated string; the same holds for
/// `params_json`.
#[no_mangle]
pub unsafe extern "C" fn tunebridge_call(op: *const c_char, params_json: *const c_char) -> *mut c_char {
    into_c_string(guarded("tunebridge_call", || call_impl(op, params_json)))
}

/// Run `body` behind `catch_unwind`. A panic becomes an `EngineError`
/// response; either way the response's error message becomes the thread's
/// last error.
fn guarded<F: FnOnce() -> String>(entry: &str, body: F) -> String {
    let response = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(entry, %detail, "panic caught at the C boundary");
        error_mapping(&Error::Engine(format!("panic in {entry}: {detail}"))).to_string()
    });
    record_status(&response);
    response
}

unsafe fn call_impl(op: *const c_char, params_json: *const c_char) -> String {
    let op = match read_str(op, "op") {
        Ok(Some(op)) => op,
        Ok(None) => return invalid("operation name is null"),
        Err(response) => return response,
    };
    let params = match read_str(params_json, "params_json") {
        Ok(params) => params.unwrap_or(""),
        Err(response) => return response,
    };
    tracing::debug!(op, "ffi call");
    call_json(op, params)
}

unsafe fn read_str<'a>(raw: *const c_char, name: &str) -> Result<Option<&'a str>, String> {
    if raw.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(raw)
        .to_str()
        .map(Some)
        .map_err(|_| invalid(&format!("{name} is not valid UTF-8")))
}

fn invalid(message: &str) -> String {
    error_mapping(&Error::InvalidArgument(message.to_string())).to_string()
}

fn record_status(response: &str) {
    let parsed: Option<Value> = serde_json::from_str(response).ok();
    match parsed.as_ref().and_then(|value| value.get("error_message")) {
        Some(message) => set_last_error(message.as_str().unwrap_or_default().to_string()),
        None => clear_last_error(),
    }
}

fn into_c_string(text: String) -> *mut c_char {
    // serde_json escapes control characters, so interior NULs cannot occur.
    CString::new(text)
        .unwrap_or_else(|_| CString::from(c"{\"status\":\"error\",\"error_kind\":\"EngineError\"}"))
        .into_raw()
}

/// Release a string returned by this library. Null is ignored.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this library that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn tunebridge_string_free(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    let _ = panic::catch_unwind(AssertUnwindSafe(|| drop(CString::from_raw(ptr))));
}

/// Library version as a caller-freed string.
#[no_mangle]
pub extern "C" fn tunebridge_version() -> *mut c_char {
    panic::catch_unwind(|| into_c_string(env!("CARGO_PKG_VERSION").to_string()))
        .unwrap_or(ptr::null_mut())
}

/// Install a `RUST_LOG`-filtered fmt subscriber. Returns 0 when installed,
/// 1 when a subscriber was already set.
#[no_mangle]
pub extern "C" fn tunebridge_init_logging() -> i32 {
    let result = panic::catch_unwind(|| {
        tracing_subscriber::fmt::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init()
            .is_ok()
    });
    match result {
        Ok(true) => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn call(op: Option<&CStr>, params: Option<&CStr>) -> Value {
        let raw = tunebridge_call(
            op.map_or(ptr::null(), CStr::as_ptr),
            params.map_or(ptr::null(), CStr::as_ptr),
        );
        assert!(!raw.is_null());
        let text = CStr::from_ptr(raw).to_str().expect("utf-8").to_string();
        tunebridge_string_free(raw);
        serde_json::from_str(&text).expect("json")
    }

    fn last_error() -> String {
        let mut buf = [0u8; 256];
        let len = unsafe { tunebridge_last_error(buf.as_mut_ptr(), buf.len()) };
        assert!(len >= 0);
        String::from_utf8_lossy(&buf[..len as usize]).into_owned()
    }

    #[test]
    fn version_call_succeeds() {
        let response = unsafe { call(Some(c"version"), None) };
        assert_eq!(response["status"], "success");
        assert_eq!(last_error(), "");

        let raw = tunebridge_version();
        let version = unsafe { CStr::from_ptr(raw) }.to_str().expect("utf-8").to_string();
        unsafe { tunebridge_string_free(raw) };
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn null_operation_is_an_invalid_argument() {
        let response = unsafe { call(None, None) };
        assert_eq!(response["status"], "error");
        assert_eq!(response["error_kind"], "InvalidArgumentError");
        assert!(last_error().contains("null"));
    }

    #[test]
    fn invalid_utf8_is_an_invalid_argument() {
        let bytes = CString::new(vec![0xffu8, 0xfe]).expect("cstring");
        let response = unsafe { call(Some(c"target_info"), Some(bytes.as_c_str())) };
        assert_eq!(response["error_kind"], "InvalidArgumentError");
    }

    #[test]
    fn compile_through_the_c_abi() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sample = unsafe { call(Some(c"sample_module"), Some(c"{\"kind\":\"two_task\"}")) };
        let params = serde_json::json!({
            "module": sample["module"],
            "target": "llvm",
            "work_dir": dir.path(),
            "use_auto_tuning": false,
            "opt_level": 1,
        })
        .to_string();
        let params = CString::new(params).expect("cstring");
        let response = unsafe { call(Some(c"compile_module"), Some(params.as_c_str())) };
        assert_eq!(response["status"], "success", "{response}");
        assert_eq!(response["num_trials"], 0);
        assert!(std::path::Path::new(response["lib_path"].as_str().expect("path")).is_file());
    }

    #[test]
    fn panics_become_engine_errors() {
        let response = guarded("tunebridge_call", || panic!("schedule table exploded"));
        let value: Value = serde_json::from_str(&response).expect("json");
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_kind"], "EngineError");
        assert!(last_error().contains("schedule table exploded"), "{}", last_error());

        let response = guarded("tunebridge_call", || call_json("version", ""));
        assert!(response.contains("success"));
        assert_eq!(last_error(), "");
    }

    #[test]
    fn freeing_null_is_a_no_op() {
        unsafe { tunebridge_string_free(ptr::null_mut()) };
    }
}
