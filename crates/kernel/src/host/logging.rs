//! The `log` host import.
//!
//! Guest log lines are re-emitted through `tracing` with the plugin name
//! attached, so they land in the worker's own log stream.

use std::str::FromStr;

use anyhow::Result;
use ingestion_sdk::protocol::{EXPORT_MEMORY, LOGGING_MODULE};
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Extern, Linker};

use super::read_string_from_memory;
use crate::plugin::PluginState;

/// Longest log line accepted from a guest, in bytes. Longer lines are cut.
pub const MAX_LOG_LINE: usize = 8 * 1024;

/// Level a guest asked to log at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for GuestLogLevel {
    type Err = ();

    fn from_str(level: &str) -> Result<Self, Self::Err> {
        match level.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "log" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

fn truncate(message: &mut String) {
    if message.len() > MAX_LOG_LINE {
        let mut end = MAX_LOG_LINE;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
        message.push_str("...");
    }
}

fn emit(plugin: &str, level: GuestLogLevel, message: &str) {
    match level {
        GuestLogLevel::Trace => trace!(target: "plugin", plugin, "{message}"),
        GuestLogLevel::Debug => debug!(target: "plugin", plugin, "{message}"),
        GuestLogLevel::Info => info!(target: "plugin", plugin, "{message}"),
        GuestLogLevel::Warn => warn!(target: "plugin", plugin, "{message}"),
        GuestLogLevel::Error => error!(target: "plugin", plugin, "{message}"),
    }
}

/// Register `ingestion:kernel/logging.log(level_ptr, level_len, msg_ptr, msg_len)`.
///
/// Unknown levels log at info. Unreadable ranges are reported instead of
/// trapping the guest.
pub fn register_logging_functions(linker: &mut Linker<PluginState>) -> Result<()> {
    linker.func_wrap(
        LOGGING_MODULE,
        "log",
        |mut caller: Caller<'_, PluginState>,
         level_ptr: i32,
         level_len: i32,
         message_ptr: i32,
         message_len: i32| {
            let plugin = caller.data().plugin.clone();
            let Some(Extern::Memory(memory)) = caller.get_export(EXPORT_MEMORY) else {
                warn!(plugin = %plugin, "log called by a plugin without exported memory");
                return;
            };

            let level = read_string_from_memory(&memory, &caller, level_ptr, level_len)
                .ok()
                .and_then(|l| l.parse().ok())
                .unwrap_or(GuestLogLevel::Info);

            match read_string_from_memory(&memory, &caller, message_ptr, message_len) {
                Ok(mut message) => {
                    truncate(&mut message);
                    emit(&plugin, level, &message);
                }
                Err(e) => warn!(plugin = %plugin, error = %e, "unreadable plugin log line"),
            }
        },
    )?;

    Ok(())
}
