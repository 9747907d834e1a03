//! FFI layer for persisters and synchronizers written in other languages.
//!
//! This module provides C-compatible functions over a [`MergeableStore`].
//! All data crosses the boundary as JSON strings.
//!
//! # Memory Management
//!
//! - Strings returned by `cellar_*` functions are allocated by Rust
//! - Caller must free them with `cellar_string_free`
//! - Store pointers must be freed with `cellar_store_free`
//!
//! # Threading
//!
//! A store is not thread-safe. Every call on one store pointer must come
//! from the thread that created it.
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure

use crate::{
    sync, Changes, MergeableChanges, MergeableContent, MergeableStore, StoreConfig, TablesSchema,
    ValuesSchema,
};
use serde::de::DeserializeOwned;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// Result wrapper for FFI responses.
#[derive(serde::Serialize)]
#[serde(untagged)]
enum FfiResult<T: serde::Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: serde::Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn err(message: impl Into<String>) -> Self {
        FfiResult::Err {
            error: message.into(),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e))
    }
}

fn error_string(message: impl Into<String>) -> *mut c_char {
    to_c_string(FfiResult::<()>::err(message).to_json())
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `cellar_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => CString::new(r#"{"error":"string contained null bytes"}"#)
            .unwrap_or_default()
            .into_raw(),
    }
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Parse a JSON argument, describing what was wrong with it on failure.
unsafe fn json_arg<T: DeserializeOwned>(ptr: *const c_char, what: &str) -> Result<T, String> {
    let json = from_c_string(ptr).ok_or_else(|| format!("invalid {what}"))?;
    serde_json::from_str(&json).map_err(|e| format!("parse error in {what}: {e}"))
}

// ============================================================================
// Store Lifecycle
// ============================================================================

/// Create a new mergeable store.
///
/// # Arguments
/// - `config_json`: JSON string of StoreConfig, or null for defaults
///
/// # Returns
/// Pointer to the store, or null if the config does not parse.
///
/// # Safety
/// - `config_json` must be a valid null-terminated C string or null
/// - Caller must free the returned pointer with `cellar_store_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_new(config_json: *const c_char) -> *mut MergeableStore {
    let config = if config_json.is_null() {
        StoreConfig::default()
    } else {
        let Some(json) = from_c_string(config_json) else {
            return ptr::null_mut();
        };
        match StoreConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "rejected store config");
                return ptr::null_mut();
            }
        }
    };

    Box::into_raw(Box::new(MergeableStore::with_config(config)))
}

/// Free a store.
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new`
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn cellar_store_free(store: *mut MergeableStore) {
    if !store.is_null() {
        drop(Box::from_raw(store));
    }
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `cellar_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn cellar_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Content
// ============================================================================

/// Get the store's content.
///
/// # Returns
/// JSON string: `{"ok": [tables, values]}` or `{"error": "message"}`
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_get_json(store: *const MergeableStore) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    to_c_string(FfiResult::ok(store.get_content()).to_json())
}

/// Replace the store's content with `[tables, values]` JSON.
///
/// # Returns
/// JSON string: `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_set_json(
    store: *const MergeableStore,
    json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let Some(json) = from_c_string(json) else {
        return error_string("invalid content JSON");
    };

    match store.set_json(&json) {
        Ok(_) => to_c_string(FfiResult::ok(()).to_json()),
        Err(e) => error_string(e.to_string()),
    }
}

/// Set both schemas from `[tablesSchema, valuesSchema]` JSON.
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `schema_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_set_schema(
    store: *const MergeableStore,
    schema_json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let (tables, values): (TablesSchema, ValuesSchema) = match json_arg(schema_json, "schema") {
        Ok(schema) => schema,
        Err(e) => return error_string(e),
    };

    match store.set_schema(tables, values) {
        Ok(_) => to_c_string(FfiResult::ok(()).to_json()),
        Err(e) => error_string(e.to_string()),
    }
}

/// Apply `[tables, values, 1]` changes JSON.
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `changes_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_apply_changes(
    store: *const MergeableStore,
    changes_json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let changes: Changes = match json_arg(changes_json, "changes") {
        Ok(changes) => changes,
        Err(e) => return error_string(e),
    };

    store.apply_changes(changes);
    to_c_string(FfiResult::ok(()).to_json())
}

// ============================================================================
// Mergeable Content
// ============================================================================

/// Get the full stamped content, for a persister to save.
///
/// # Returns
/// JSON string: `{"ok": [tablesStamp, valuesStamp]}` or `{"error": "message"}`
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_get_mergeable_content(
    store: *const MergeableStore,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    to_c_string(FfiResult::ok(store.get_mergeable_content()).to_json())
}

/// Replace the stamped content, for a persister to load.
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `content_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_set_mergeable_content(
    store: *const MergeableStore,
    content_json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let content: MergeableContent = match json_arg(content_json, "mergeable content") {
        Ok(content) => content,
        Err(e) => return error_string(e),
    };

    store.set_mergeable_content(content);
    to_c_string(FfiResult::ok(()).to_json())
}

/// Merge stamped changes from another replica.
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `changes_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_apply_mergeable_changes(
    store: *const MergeableStore,
    changes_json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let changes: MergeableChanges = match json_arg(changes_json, "mergeable changes") {
        Ok(changes) => changes,
        Err(e) => return error_string(e),
    };

    store.apply_mergeable_changes(&changes);
    to_c_string(FfiResult::ok(()).to_json())
}

/// Get the top-level hashes.
///
/// # Returns
/// JSON string: `{"ok": [tablesHash, valuesHash]}` or `{"error": "message"}`
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_store_get_content_hashes(
    store: *const MergeableStore,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    to_c_string(FfiResult::ok(store.get_mergeable_content_hashes()).to_json())
}

// ============================================================================
// Sync
// ============================================================================

/// Answer one sync message from local state.
///
/// # Returns
/// JSON string: `{"ok": <message or null>}` or `{"error": "message"}`
///
/// # Safety
/// - `store` must be a valid pointer from `cellar_store_new` or null
/// - `message_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `cellar_string_free`
#[no_mangle]
pub unsafe extern "C" fn cellar_sync_respond(
    store: *const MergeableStore,
    message_json: *const c_char,
) -> *mut c_char {
    let Some(store) = store.as_ref() else {
        return error_string("null store pointer");
    };
    let message: sync::Message = match json_arg(message_json, "sync message") {
        Ok(message) => message,
        Err(e) => return error_string(e),
    };

    match sync::respond(store, message) {
        Ok(reply) => to_c_string(FfiResult::ok(reply).to_json()),
        Err(e) => error_string(e.to_string()),
    }
}

// ============================================================================
// Utility
// ============================================================================

/// Get the engine version.
///
/// # Returns
/// Static string pointer (do not free)
#[no_mangle]
pub extern "C" fn cellar_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn take(result: *mut c_char) -> serde_json::Value {
        let json = CStr::from_ptr(result).to_str().unwrap().to_string();
        cellar_string_free(result);
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn ffi_store_lifecycle() {
        unsafe {
            let store = cellar_store_new(ptr::null());
            assert!(!store.is_null());
            cellar_store_free(store);

            let config = CString::new(r#"{"uniqueId":"a","checkpointSize":10}"#).unwrap();
            let store = cellar_store_new(config.as_ptr());
            assert!(!store.is_null());
            cellar_store_free(store);

            let config = CString::new(r#"{"checkpointSize":"many"}"#).unwrap();
            assert!(cellar_store_new(config.as_ptr()).is_null());
        }
    }

    #[test]
    fn ffi_content_roundtrip() {
        unsafe {
            let store = cellar_store_new(ptr::null());

            let content = CString::new(r#"[{"pets":{"fido":{"legs":4}}},{"open":true}]"#).unwrap();
            let result = take(cellar_store_set_json(store, content.as_ptr()));
            assert_eq!(result, serde_json::json!({"ok": null}));

            let changes = CString::new(r#"[{"pets":{"felix":{"legs":4}}},{"open":null},1]"#).unwrap();
            take(cellar_store_apply_changes(store, changes.as_ptr()));

            let result = take(cellar_store_get_json(store));
            assert_eq!(
                result,
                serde_json::json!({"ok": [{"pets": {"felix": {"legs": 4}, "fido": {"legs": 4}}}, {}]})
            );
            cellar_store_free(store);
        }
    }

    #[test]
    fn ffi_schema() {
        unsafe {
            let store = cellar_store_new(ptr::null());
            let schema =
                CString::new(r#"[{"pets":{"legs":{"type":"number","default":4}}},{}]"#).unwrap();
            take(cellar_store_set_schema(store, schema.as_ptr()));

            let changes = CString::new(r#"[{"pets":{"fido":{"legs":"four"}}},{},1]"#).unwrap();
            take(cellar_store_apply_changes(store, changes.as_ptr()));
            assert_eq!(
                (*store).get_cell("pets", "fido", "legs"),
                Some(crate::Cell::Number(4.0))
            );
            cellar_store_free(store);
        }
    }

    #[test]
    fn ffi_mergeable_content_between_stores() {
        unsafe {
            let a = cellar_store_new(ptr::null());
            let b = cellar_store_new(ptr::null());
            (*a).set_cell("pets", "fido", "species", "dog");

            let content = cellar_store_get_mergeable_content(a);
            let content_json = take(content);
            let saved = CString::new(content_json["ok"].to_string()).unwrap();
            let result = take(cellar_store_set_mergeable_content(b, saved.as_ptr()));
            assert_eq!(result, serde_json::json!({"ok": null}));

            assert_eq!(
                take(cellar_store_get_content_hashes(a)),
                take(cellar_store_get_content_hashes(b))
            );
            cellar_store_free(a);
            cellar_store_free(b);
        }
    }

    #[test]
    fn ffi_sync_respond() {
        unsafe {
            let store = cellar_store_new(ptr::null());
            let request = CString::new(r#"{"type":"get_content_hashes"}"#).unwrap();
            let reply = take(cellar_sync_respond(store, request.as_ptr()));
            assert_eq!(reply["ok"]["type"], "response");
            assert_eq!(reply["ok"]["payload"]["kind"], "content_hashes");

            let announcement = CString::new(r#"{"type":"content_hashes","payload":[0,0]}"#).unwrap();
            let reply = take(cellar_sync_respond(store, announcement.as_ptr()));
            assert_eq!(reply, serde_json::json!({"ok": null}));
            cellar_store_free(store);
        }
    }

    #[test]
    fn ffi_version() {
        unsafe {
            let version = cellar_version();
            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert_eq!(version_str, env!("CARGO_PKG_VERSION"));
        }
    }

    #[test]
    fn ffi_error_handling() {
        unsafe {
            let result = take(cellar_store_get_json(ptr::null()));
            assert!(result.get("error").is_some());

            let store = cellar_store_new(ptr::null());
            let invalid = CString::new("not valid json").unwrap();
            let result = take(cellar_store_apply_mergeable_changes(store, invalid.as_ptr()));
            assert!(result["error"].as_str().unwrap().contains("mergeable changes"));

            let result = take(cellar_store_set_json(store, invalid.as_ptr()));
            assert!(result.get("error").is_some());

            let result = take(cellar_store_apply_changes(store, ptr::null()));
            assert_eq!(result, serde_json::json!({"error": "invalid changes"}));
            cellar_store_free(store);
        }
    }
}
