//! Wire protocol between the kernel and WASM plugins.
//!
//! # Calling convention
//!
//! | Step | Who | What |
//! |------|-----|------|
//! | 1 | kernel | `alloc(len) → ptr`, then writes the JSON input at `ptr` |
//! | 2 | kernel | calls the entry point `fn(ptr: i32, len: i32) → i64` |
//! | 3 | plugin | returns `ptr << 32 \| len` describing its reply |
//! | 4 | kernel | reads the reply, then `dealloc(ptr, len)` |
//!
//! The low 32 bits of the return value are a signed length:
//!
//! | Length | Meaning |
//! |--------|---------|
//! | `0` | empty result (for `process_event`: drop the event) |
//! | `> 0` | JSON reply of that many bytes |
//! | `< 0` | JSON [`ErrorReply`] of `-len` bytes |

use serde::{Deserialize, Serialize};

/// Linear memory export.
pub const EXPORT_MEMORY: &str = "memory";
/// Guest allocator used by the kernel to place inputs.
pub const EXPORT_ALLOC: &str = "alloc";
/// Guest deallocator for replies and inputs.
pub const EXPORT_DEALLOC: &str = "dealloc";

/// Called once after instantiation with a `PluginSetup`.
pub const SETUP_PLUGIN: &str = "setup_plugin";
/// Called once before the instance is dropped.
pub const TEARDOWN_PLUGIN: &str = "teardown_plugin";
/// Transform entry point.
pub const PROCESS_EVENT: &str = "process_event";
/// Side-effect entry point.
pub const ON_EVENT: &str = "on_event";
/// Prefix of on-demand job exports (`job_<name>`).
pub const JOB_PREFIX: &str = "job_";

/// Scheduled task names and their export names.
pub const SCHEDULED_TASKS: &[(&str, &str)] = &[
    ("runEveryMinute", "run_every_minute"),
    ("runEveryHour", "run_every_hour"),
    ("runEveryDay", "run_every_day"),
];

/// Host import module for logging.
pub const LOGGING_MODULE: &str = "ingestion:kernel/logging";

/// Event property listing plugins whose `process_event` succeeded.
pub const PLUGINS_SUCCEEDED: &str = "$plugins_succeeded";
/// Event property listing plugins whose `process_event` failed.
pub const PLUGINS_FAILED: &str = "$plugins_failed";
/// Event property listing plugins left for the side-effect stage.
pub const PLUGINS_DEFERRED: &str = "$plugins_deferred";

/// Error payload returned by a plugin entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable error message.
    pub error: String,

    /// Whether the kernel may retry the call (transient failure).
    #[serde(default)]
    pub retriable: bool,
}

/// Pack a reply location into an entry point return value.
pub fn pack(ptr: u32, len: i32) -> i64 {
    (i64::from(ptr) << 32) | i64::from(len as u32)
}

/// Unpack an entry point return value into `(ptr, len)`.
pub fn unpack(value: i64) -> (u32, i32) {
    ((value >> 32) as u32, (value & 0xFFFF_FFFF) as u32 as i32)
}

/// Export name for an on-demand job.
pub fn job_export(name: &str) -> String {
    format!("{JOB_PREFIX}{name}")
}
