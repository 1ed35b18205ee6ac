//! Ingestion Plugin SDK
//!
//! Types, wire protocol, and host function bindings shared by the kernel and
//! WASM plugins. Plugins depend on this crate and use `#[plugin_entry]` to
//! export `process_event`, `on_event`, scheduled tasks and jobs.

pub mod guest;
pub mod host;
pub mod protocol;
pub mod types;

// Re-export proc macros
pub use ingestion_sdk_macros::plugin_entry;

// Re-export serde_json for use in macro-generated code
#[doc(hidden)]
pub use serde_json;

pub mod prelude {
    pub use crate::guest::{EntryReply, PluginFailure};
    pub use crate::host::log;
    pub use crate::plugin_entry;
    pub use crate::types::*;
}
