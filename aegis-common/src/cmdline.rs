//! Best-effort `argv` reconstruction for exec events.
//!
//! The argument block lives in memory owned by the exec'ing task, so any read
//! may fault or race. A failed read ends the capture; whatever was gathered so
//! far is kept.

use crate::{
    PathKey, ARGV0_READ_LEN, CMD_LINE_SAFETY_MARGIN, COMMAND_LINE_LEN, MAX_ARGC_FOR_CMD,
    MAX_ARGS_TO_READ, PATH_MAX_LEN,
};

/// Fault-tolerant reads of caller memory.
pub trait ArgMemory {
    fn read_u32(&self, addr: u64) -> Option<u32>;
    fn read_u64(&self, addr: u64) -> Option<u64>;
    /// Reads a NUL-terminated string into `dst`, truncating to
    /// `dst.len() - 1` bytes and always terminating. Returns the length
    /// without the NUL.
    fn read_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize>;
}

/// Where the argument count and pointer array start: `argc: u32` followed by
/// `argv: [u64; argc]`.
pub struct ArgBlock<M> {
    pub memory: M,
    pub addr: u64,
    /// Argument count known independently of the block. When set, a block
    /// whose own count differs is not trusted.
    pub expected_argc: Option<u32>,
}

/// Fills `out` with `argv[0] argv[1] ...`, at most [`MAX_ARGS_TO_READ`]
/// arguments. Starts from `fallback` (the resolved path), which stays in place
/// when the argument block cannot be read. Returns the resulting length.
pub fn capture<M: ArgMemory>(
    block: &ArgBlock<M>,
    fallback: &PathKey,
    out: &mut [u8; COMMAND_LINE_LEN],
) -> usize {
    let fallback_len = write_fallback(out, fallback);
    let memory = &block.memory;

    let argc = match memory.read_u32(block.addr) {
        Some(n) if n > 0 && n <= MAX_ARGC_FOR_CMD => n,
        _ => return fallback_len,
    };
    if block.expected_argc.is_some_and(|expected| expected != argc) {
        return fallback_len;
    }
    let argv = block.addr.wrapping_add(4);
    let argv0 = match memory.read_u64(argv) {
        Some(ptr) if ptr != 0 => ptr,
        _ => return fallback_len,
    };

    let mut pos = match memory.read_str(argv0, &mut out[..ARGV0_READ_LEN]) {
        Some(n) if n > 0 && n < ARGV0_READ_LEN => n,
        _ => return write_fallback(out, fallback),
    };

    // argv[0] filled its whole window: keep it truncated, read nothing more.
    if pos < ARGV0_READ_LEN - 1 {
        let max_args = if argc < MAX_ARGS_TO_READ { argc } else { MAX_ARGS_TO_READ };
        for i in 1..max_args {
            if pos >= COMMAND_LINE_LEN - CMD_LINE_SAFETY_MARGIN {
                break;
            }
            let ptr = match memory.read_u64(argv.wrapping_add(u64::from(i) * 8)) {
                Some(ptr) if ptr != 0 => ptr,
                _ => break,
            };

            out[pos] = b' ';
            let start = pos + 1;
            let remaining = COMMAND_LINE_LEN - start;
            let window = if remaining > CMD_LINE_SAFETY_MARGIN {
                CMD_LINE_SAFETY_MARGIN
            } else {
                remaining
            };
            if window == 0 {
                out[pos] = 0;
                break;
            }
            match memory.read_str(ptr, &mut out[start..start + window]) {
                Some(len) if len < window => pos = start + len,
                _ => {
                    out[pos] = 0;
                    break;
                }
            }
        }
    }

    terminate(out, pos)
}

/// Writes the NUL-terminated `fallback` path and zeroes the rest of `out`.
pub fn write_fallback(out: &mut [u8; COMMAND_LINE_LEN], fallback: &PathKey) -> usize {
    let mut len = PATH_MAX_LEN;
    for i in 0..COMMAND_LINE_LEN {
        let b = if i < PATH_MAX_LEN { fallback[i] } else { 0 };
        if b == 0 && len == PATH_MAX_LEN {
            len = i;
        }
        out[i] = if i < len { b } else { 0 };
    }
    if len >= PATH_MAX_LEN {
        len = PATH_MAX_LEN - 1;
        out[len] = 0;
    }
    len
}

fn terminate(out: &mut [u8; COMMAND_LINE_LEN], pos: usize) -> usize {
    let pos = if pos >= COMMAND_LINE_LEN { COMMAND_LINE_LEN - 1 } else { pos };
    for i in 0..COMMAND_LINE_LEN {
        if i >= pos {
            out[i] = 0;
        }
    }
    pos
}
