//! Guest-side plumbing used by `#[plugin_entry]` generated code.
//!
//! Replies are leaked boxed slices; the kernel hands them back through
//! `dealloc` once it has copied them out of linear memory.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::{self, ErrorReply};
use crate::types::PluginEvent;

/// A reply produced by an entry point, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Nothing to return (drops the event for `process_event`).
    Empty,
    /// Serialized JSON value.
    Json(String),
    /// Raised error.
    Error(ErrorReply),
}

/// Error raised by plugin code.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginFailure {
    pub message: String,
    pub retriable: bool,
}

impl PluginFailure {
    /// A failure that must not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }

    /// A transient failure the kernel may retry.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }
}

impl From<String> for PluginFailure {
    fn from(message: String) -> Self {
        Self::fatal(message)
    }
}

impl From<&str> for PluginFailure {
    fn from(message: &str) -> Self {
        Self::fatal(message)
    }
}

/// Conversion of entry point return values into a [`Reply`].
pub trait EntryReply {
    fn into_reply(self) -> Reply;
}

fn json_reply<T: Serialize>(value: &T) -> Reply {
    match serde_json::to_string(value) {
        Ok(json) => Reply::Json(json),
        Err(e) => Reply::Error(ErrorReply {
            error: format!("serialize: {e}"),
            retriable: false,
        }),
    }
}

impl EntryReply for () {
    fn into_reply(self) -> Reply {
        Reply::Empty
    }
}

impl EntryReply for PluginEvent {
    fn into_reply(self) -> Reply {
        json_reply(&self)
    }
}

impl EntryReply for Value {
    fn into_reply(self) -> Reply {
        json_reply(&self)
    }
}

impl<T: EntryReply> EntryReply for Option<T> {
    fn into_reply(self) -> Reply {
        match self {
            Some(value) => value.into_reply(),
            None => Reply::Empty,
        }
    }
}

impl<T: EntryReply, E: Into<PluginFailure>> EntryReply for Result<T, E> {
    fn into_reply(self) -> Reply {
        match self {
            Ok(value) => value.into_reply(),
            Err(e) => {
                let failure = e.into();
                Reply::Error(ErrorReply {
                    error: failure.message,
                    retriable: failure.retriable,
                })
            }
        }
    }
}

/// Read the JSON input the kernel placed in linear memory.
///
/// # Safety
///
/// `ptr` and `len` must describe a region previously returned by `alloc`
/// and filled by the kernel.
pub unsafe fn read_input<'a>(ptr: i32, len: i32) -> &'a [u8] {
    if len <= 0 {
        return &[];
    }
    unsafe { core::slice::from_raw_parts(ptr as usize as *const u8, len as usize) }
}

/// Encode a reply into linear memory and return the packed location.
pub fn write_reply(reply: Reply) -> i64 {
    let (bytes, is_error) = match reply {
        Reply::Empty => return protocol::pack(0, 0),
        Reply::Json(json) => (json.into_bytes(), false),
        Reply::Error(error) => {
            let json = serde_json::to_string(&error)
                .unwrap_or_else(|_| r#"{"error":"unencodable error"}"#.to_string());
            (json.into_bytes(), true)
        }
    };

    let len = bytes.len().min(i32::MAX as usize) as i32;
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8 as usize as u32;
    protocol::pack(ptr, if is_error { -len } else { len })
}

/// Decode a deserialization failure into an error reply.
pub fn input_error(e: &serde_json::Error) -> i64 {
    write_reply(Reply::Error(ErrorReply {
        error: format!("deserialize: {e}"),
        retriable: false,
    }))
}

#[cfg(target_arch = "wasm32")]
#[unsafe(no_mangle)]
pub extern "C" fn alloc(len: i32) -> i32 {
    let buf = vec![0u8; len.max(0) as usize].into_boxed_slice();
    Box::into_raw(buf) as *mut u8 as usize as i32
}

/// # Safety
///
/// Must only be called by the kernel with a region from `alloc` or a reply.
#[cfg(target_arch = "wasm32")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dealloc(ptr: i32, len: i32) {
    if ptr == 0 || len <= 0 {
        return;
    }
    let slice = core::ptr::slice_from_raw_parts_mut(ptr as usize as *mut u8, len as usize);
    drop(unsafe { Box::from_raw(slice) });
}
