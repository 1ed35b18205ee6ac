//! Host function bindings for calling kernel services from WASM plugins.
//!
//! These functions are only usable when compiled for `wasm32` targets.
//! On native targets, stub implementations are provided for testing.

// --------------------------------------------------------------------------
// WASM extern declarations, available only when compiling for wasm32
// --------------------------------------------------------------------------

#[cfg(target_arch = "wasm32")]
#[link(wasm_import_module = "ingestion:kernel/logging")]
unsafe extern "C" {
    #[link_name = "log"]
    fn __log(level_ptr: i32, level_len: i32, msg_ptr: i32, msg_len: i32);
}

/// Log a message through the kernel's tracing subscriber.
///
/// `level` is one of `trace`, `debug`, `info`, `warn`, `error`; anything
/// else is logged at `info`.
#[cfg(target_arch = "wasm32")]
pub fn log(level: &str, message: &str) {
    unsafe {
        __log(
            level.as_ptr() as i32,
            level.len() as i32,
            message.as_ptr() as i32,
            message.len() as i32,
        );
    }
}

// --------------------------------------------------------------------------
// Native stubs for testing
// --------------------------------------------------------------------------

/// Log a message (stub for native testing, discards the message).
#[cfg(not(target_arch = "wasm32"))]
pub fn log(_level: &str, _message: &str) {}

/// Log at `debug`.
pub fn debug(message: &str) {
    log("debug", message);
}

/// Log at `info`.
pub fn info(message: &str) {
    log("info", message);
}

/// Log at `warn`.
pub fn warn(message: &str) {
    log("warn", message);
}

/// Log at `error`.
pub fn error(message: &str) {
    log("error", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_stub_is_callable() {
        log("info", "hello");
        log("bogus", "still fine");
        warn("careful");
    }
}
