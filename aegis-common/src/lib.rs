#![cfg_attr(not(test), no_std)]
//! Shared between the LSM programs and the userspace loader.
//!
//! Everything here runs inside the BPF verifier's rules: no allocation, no
//! recursion, every loop bounded by a constant. The kernel crate plugs its
//! helpers in through the traits in [`engine`], [`path`], [`cmdline`] and
//! [`channel`]; the unit tests plug in in-memory fakes.

pub mod channel;
pub mod cmdline;
pub mod context;
pub mod engine;
pub mod event;
pub mod path;
pub mod policy;

#[cfg(test)]
mod testing;

pub use channel::{EventChannel, EventSlot};
pub use context::{AncestryTracker, Identity, TaskContext};
pub use engine::{Engine, ExecImage, InodeId, OpenedFile, SocketTarget, Verdict};
pub use event::{ConnectEvent, Event, EventHeader, EventType, ExecEvent, FileOpenEvent};
pub use path::{PathNode, PathScratch};
pub use policy::{Action, PolicyStore};

pub const TASK_COMM_LEN: usize = 16;
pub const PATH_MAX_LEN: usize = 256;
pub const COMMAND_LINE_LEN: usize = 512;
/// Longest dentry name (exclusive) that is recorded during a path walk.
pub const NAME_MAX: usize = 128;
pub const MAX_PATH_DEPTH: usize = 16;

pub const MAX_ARGC_FOR_CMD: u32 = 16;
pub const MAX_ARGS_TO_READ: u32 = 4;
pub const ARGV0_READ_LEN: usize = 256;
pub const CMD_LINE_SAFETY_MARGIN: usize = 64;

pub const MAX_POLICY_ENTRIES: u32 = 1024;
pub const ANCESTRY_CAPACITY: u32 = 32768;
pub const EVENT_RINGBUF_BYTES: u32 = 2 * 1024 * 1024;

pub const EPERM: i32 = 1;
pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

/// A zero-padded path map key.
pub type PathKey = [u8; PATH_MAX_LEN];

/// Bytes of `buf` before the first NUL.
pub fn until_nul(buf: &[u8]) -> &[u8] {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..len]
}
