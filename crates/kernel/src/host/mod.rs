//! Host side of the guest ABI.
//!
//! Guests pass strings as `(ptr, len)` pairs into their own linear memory.
//! The helpers here bounds-check those ranges before copying in or out.

mod logging;

use anyhow::{Context, Result, bail};
use wasmtime::{AsContext, AsContextMut, Linker, Memory};

use crate::plugin::PluginState;

pub use logging::{GuestLogLevel, MAX_LOG_LINE, register_logging_functions};

/// Register every host import on the linker.
pub fn register_all(linker: &mut Linker<PluginState>) -> Result<()> {
    register_logging_functions(linker)?;
    Ok(())
}

/// Byte range `[ptr, ptr + len)` of guest memory of size `size`.
fn guest_range(ptr: i32, len: i32, size: usize) -> Result<std::ops::Range<usize>> {
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        bail!("negative guest range: ptr={ptr}, len={len}");
    };
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start..end),
        _ => bail!("guest range out of bounds: ptr={ptr}, len={len}, memory={size}"),
    }
}

/// Copy a UTF-8 string out of guest memory.
pub fn read_string_from_memory(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> Result<String> {
    let data = memory.data(&store);
    let range = guest_range(ptr, len, data.len())?;
    String::from_utf8(data[range].to_vec()).context("guest string is not valid UTF-8")
}

/// Copy `value` into guest memory at `ptr`, writing at most `max_len` bytes.
///
/// Returns the number of bytes written.
pub fn write_string_to_memory(
    memory: &Memory,
    mut store: impl AsContextMut,
    ptr: i32,
    max_len: i32,
    value: &str,
) -> Result<i32> {
    let bytes = value.as_bytes();
    let len = i32::try_from(bytes.len()).unwrap_or(i32::MAX).min(max_len.max(0));

    let data = memory.data_mut(&mut store);
    let range = guest_range(ptr, len, data.len())?;
    let written = range.len();
    data[range].copy_from_slice(&bytes[..written]);
    Ok(len)
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    fn memory() -> (Store<()>, Memory) {
        let mut store = Store::new(&Engine::default(), ());
        let memory = Memory::new(&mut store, MemoryType::new(1, Some(1))).unwrap();
        (store, memory)
    }

    #[test]
    fn ranges_are_bounds_checked() {
        assert_eq!(guest_range(10, 5, 100).unwrap(), 10..15);
        assert!(guest_range(-1, 5, 100).is_err());
        assert!(guest_range(98, 5, 100).is_err());
        assert!(guest_range(i32::MAX, i32::MAX, 100).is_err());
    }

    #[test]
    fn strings_round_trip_through_guest_memory() {
        let (mut store, memory) = memory();
        let written = write_string_to_memory(&memory, &mut store, 32, 64, "héllo").unwrap();
        assert_eq!(written, 6);

        let read = read_string_from_memory(&memory, &store, 32, written).unwrap();
        assert_eq!(read, "héllo");
    }

    #[test]
    fn writes_are_truncated_to_max_len() {
        let (mut store, memory) = memory();
        let written = write_string_to_memory(&memory, &mut store, 0, 3, "abcdef").unwrap();
        assert_eq!(written, 3);
        assert_eq!(read_string_from_memory(&memory, &store, 0, 3).unwrap(), "abc");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let (mut store, memory) = memory();
        memory.data_mut(&mut store)[0] = 0xff;
        assert!(read_string_from_memory(&memory, &store, 0, 1).is_err());
    }
}
