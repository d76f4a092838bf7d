//! FFI bindings for the experiment engine
//!
//! This module provides C-compatible functions for calling the engine from other
//! languages. All functions use C strings (null-terminated) and return allocated
//! memory that must be freed by the caller using `xp_free_string`.
//!
//! On failure a function returns NULL (or a negative status) and records the
//! error as a JSON object `{code, message, retryable, conditions}`, readable
//! with `xp_last_error`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::config::EngineConfig;
use crate::error::ComputeError;
use crate::pipeline::{
    calculate_experiment_results, exposure_timeseries_json, ExperimentProcessor,
    ExperimentRequest,
};
use crate::schema::{EventRowAdapter, InMemoryEventSource};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Record a compute error in its user-facing JSON form
fn set_compute_error(err: &ComputeError) {
    let user = err.user_facing();
    match serde_json::to_string(&user) {
        Ok(json) => set_last_error(&json),
        Err(_) => set_last_error(&user.message),
    }
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Read the two JSON inputs every entry point takes
unsafe fn read_inputs(
    request: *const c_char,
    events: *const c_char,
) -> Option<(String, String)> {
    let Some(request) = cstr_to_string(request) else {
        set_last_error("Invalid request string pointer");
        return None;
    };
    let Some(events) = cstr_to_string(events) else {
        set_last_error("Invalid events string pointer");
        return None;
    };
    Some((request, events))
}

fn finish(result: Result<String, ComputeError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_compute_error(&e);
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Stateless API
// ============================================================================

/// Compute experiment metric results.
///
/// # Safety
/// - `request` (an experiment request JSON) and `events` (JSON array or NDJSON)
///   must be valid null-terminated C strings.
/// - Returns a newly allocated string that must be freed with `xp_free_string`.
/// - Returns NULL on error; call `xp_last_error` to get the error.
#[no_mangle]
pub unsafe extern "C" fn xp_calculate_results(
    request: *const c_char,
    events: *const c_char,
) -> *mut c_char {
    clear_last_error();
    match read_inputs(request, events) {
        Some((request, events)) => finish(calculate_experiment_results(&request, &events)),
        None => ptr::null_mut(),
    }
}

/// Compute the cumulative exposure timeseries.
///
/// # Safety
/// Same contract as [`xp_calculate_results`].
#[no_mangle]
pub unsafe extern "C" fn xp_exposure_timeseries(
    request: *const c_char,
    events: *const c_char,
) -> *mut c_char {
    clear_last_error();
    match read_inputs(request, events) {
        Some((request, events)) => finish(exposure_timeseries_json(&request, &events)),
        None => ptr::null_mut(),
    }
}

// ============================================================================
// Processor API
// ============================================================================

/// Opaque handle holding one team's configuration
pub struct ExperimentProcessorHandle {
    processor: ExperimentProcessor,
}

/// Create a processor from an engine configuration JSON (NULL for defaults).
///
/// # Safety
/// - `config` must be NULL or a valid null-terminated C string.
/// - Returns NULL on error. Free with `xp_processor_free`.
#[no_mangle]
pub unsafe extern "C" fn xp_processor_new(config: *const c_char) -> *mut ExperimentProcessorHandle {
    clear_last_error();

    let config = if config.is_null() {
        EngineConfig::default()
    } else {
        let Some(json) = cstr_to_string(config) else {
            set_last_error("Invalid config string pointer");
            return ptr::null_mut();
        };
        match EngineConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_compute_error(&e);
                return ptr::null_mut();
            }
        }
    };

    Box::into_raw(Box::new(ExperimentProcessorHandle {
        processor: ExperimentProcessor::new(config),
    }))
}

/// Free a processor.
///
/// # Safety
/// - `processor` must be a pointer returned by `xp_processor_new`, or NULL.
#[no_mangle]
pub unsafe extern "C" fn xp_processor_free(processor: *mut ExperimentProcessorHandle) {
    if !processor.is_null() {
        drop(Box::from_raw(processor));
    }
}

/// Compute metric results with the processor's configuration.
///
/// Any `config` inside the request is ignored.
///
/// # Safety
/// - `processor` must be a valid pointer from `xp_processor_new`.
/// - Same string contract as [`xp_calculate_results`].
#[no_mangle]
pub unsafe extern "C" fn xp_processor_calculate(
    processor: *mut ExperimentProcessorHandle,
    request: *const c_char,
    events: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if processor.is_null() {
        set_last_error("Null processor pointer");
        return ptr::null_mut();
    }
    let handle = &*processor;
    let Some((request, events)) = read_inputs(request, events) else {
        return ptr::null_mut();
    };

    let run = || -> Result<String, ComputeError> {
        let request = ExperimentRequest::from_json(&request)?;
        let source = InMemoryEventSource::new(EventRowAdapter::parse_any(&events)?);
        let as_of = request.as_of();
        let result =
            handle
                .processor
                .calculate(&request.experiment, request.metric()?, &source, as_of)?;
        handle.processor.encoder().encode_result_to_json(&result, as_of)
    };
    finish(run())
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by engine functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by an engine function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn xp_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next engine call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn xp_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the engine version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn xp_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CString {
        CString::new(
            r#"{
                "experiment": {
                    "flag_key": "f",
                    "variants": ["control", "test"],
                    "start_date": "2020-01-01T00:00:00Z",
                    "end_date": "2020-01-31T00:00:00Z"
                },
                "metric": { "kind": "mean", "source": { "kind": "event", "event": "purchase" } }
            }"#,
        )
        .unwrap()
    }

    fn events() -> CString {
        let mut lines = Vec::new();
        for (subject, variant) in [("a", "control"), ("b", "test")] {
            lines.push(format!(
                r#"{{"subject_id":"{subject}","event":"$feature_flag_called","timestamp":"2020-01-02T00:00:00Z","properties":{{"$feature_flag":"f","$feature_flag_response":"{variant}"}}}}"#
            ));
        }
        lines.push(
            r#"{"subject_id":"b","event":"purchase","timestamp":"2020-01-03T00:00:00Z"}"#
                .to_string(),
        );
        CString::new(lines.join("\n")).unwrap()
    }

    #[test]
    fn test_ffi_calculate_results() {
        let request = request();
        let events = events();

        unsafe {
            let result = xp_calculate_results(request.as_ptr(), events.as_ptr());
            assert!(!result.is_null());

            let result_str = CStr::from_ptr(result).to_str().unwrap();
            let payload: serde_json::Value = serde_json::from_str(result_str).unwrap();
            assert_eq!(payload["result"]["variants"][0]["sum"], 1.0);

            xp_free_string(result);
        }
    }

    #[test]
    fn test_ffi_processor_lifecycle() {
        let request = request();
        let events = events();

        unsafe {
            let processor = xp_processor_new(ptr::null());
            assert!(!processor.is_null());

            let result = xp_processor_calculate(processor, request.as_ptr(), events.as_ptr());
            assert!(!result.is_null());
            xp_free_string(result);

            let timeseries = xp_exposure_timeseries(request.as_ptr(), events.as_ptr());
            assert!(!timeseries.is_null());
            xp_free_string(timeseries);

            xp_processor_free(processor);
        }
    }

    #[test]
    fn test_ffi_validation_error_is_structured() {
        let request = request();
        let empty = CString::new("[]").unwrap();

        unsafe {
            let result = xp_calculate_results(request.as_ptr(), empty.as_ptr());
            assert!(result.is_null());

            let error = xp_last_error();
            assert!(!error.is_null());
            let error: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(error).to_str().unwrap()).unwrap();
            assert_eq!(error["code"], "EXPERIMENT_VALIDATION");
            assert_eq!(error["conditions"].as_array().unwrap().len(), 3);
        }
    }

    #[test]
    fn test_ffi_out_of_range_window_is_an_error() {
        let request = CString::new(
            r#"{
                "experiment": {
                    "flag_key": "f",
                    "variants": ["control", "test"],
                    "start_date": "2020-01-01T00:00:00Z",
                    "end_date": "2020-01-31T00:00:00Z"
                },
                "metric": {
                    "kind": "mean",
                    "source": { "kind": "event", "event": "purchase" },
                    "conversion_window": { "value": 4611686018427387903, "unit": "week" }
                }
            }"#,
        )
        .unwrap();
        let events = events();

        unsafe {
            let result = xp_calculate_results(request.as_ptr(), events.as_ptr());
            assert!(result.is_null());

            let error: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(xp_last_error()).to_str().unwrap()).unwrap();
            assert_eq!(error["code"], "INVALID_REQUEST");
        }
    }

    #[test]
    fn test_ffi_bad_config() {
        let config = CString::new(r#"{"batch_size": 0}"#).unwrap();
        unsafe {
            assert!(xp_processor_new(config.as_ptr()).is_null());
            assert!(!xp_last_error().is_null());
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = xp_version();
            assert!(!version.is_null());
            assert!(!CStr::from_ptr(version).to_str().unwrap().is_empty());
        }
    }
}
