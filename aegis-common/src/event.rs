use core::fmt::Display;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::context::TaskContext;
use crate::{COMMAND_LINE_LEN, PATH_MAX_LEN, TASK_COMM_LEN};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, derive_more::Display)]
pub enum EventType {
    #[display("exec")]
    Exec = 1,
    #[display("file_open")]
    FileOpen = 2,
    #[display("connect")]
    Connect = 3,
}

/// Prefix of every record pushed through the ring buffer.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct EventHeader {
    /// Monotonic nanoseconds since boot.
    pub timestamp_ns: u64,
    pub cgroup_id: u64,
    pub pid: u32,
    pub tid: u32,
    pub uid: u32,
    pub gid: u32,
    /// [`EventType`] tag.
    pub kind: u8,
    pub blocked: u8,
    pub _pad: [u8; 6],
    pub comm: [u8; TASK_COMM_LEN],
}

impl EventHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(kind: EventType, ctx: &TaskContext, blocked: bool) -> Self {
        Self {
            timestamp_ns: ctx.timestamp_ns,
            cgroup_id: ctx.cgroup_id,
            pid: ctx.pid(),
            tid: ctx.tid(),
            uid: ctx.uid(),
            gid: ctx.gid(),
            kind: kind.into(),
            blocked: blocked as u8,
            _pad: [0; 6],
            comm: ctx.comm,
        }
    }

    pub fn event_type(&self) -> Option<EventType> {
        EventType::try_from_primitive(self.kind).ok()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked != 0
    }
}

impl Display for EventHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.pid, self.tid)
    }
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ExecEvent {
    pub header: EventHeader,
    pub ppid: u32,
    pub _pad: [u8; 4],
    pub pcomm: [u8; TASK_COMM_LEN],
    pub filename: [u8; PATH_MAX_LEN],
    pub command_line: [u8; COMMAND_LINE_LEN],
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct FileOpenEvent {
    pub header: EventHeader,
    pub ino: u64,
    pub dev: u64,
    pub flags: u32,
    pub _pad: [u8; 4],
    pub filename: [u8; PATH_MAX_LEN],
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ConnectEvent {
    pub header: EventHeader,
    /// Network byte order.
    pub addr_v4: [u8; 4],
    pub family: u16,
    /// Host byte order.
    pub port: u16,
    pub addr_v6: [u8; 16],
}

/// A fixed-layout record that can be reserved on the event channel.
pub trait Event: Copy + 'static {
    const TYPE: EventType;
    const SIZE: usize = core::mem::size_of::<Self>();
}

impl Event for ExecEvent {
    const TYPE: EventType = EventType::Exec;
}

impl Event for FileOpenEvent {
    const TYPE: EventType = EventType::FileOpen;
}

impl Event for ConnectEvent {
    const TYPE: EventType = EventType::Connect;
}

// The padding fields make these layouts identical to their packed form.
const _: () = {
    assert!(EventHeader::SIZE == 56);
    assert!(<ExecEvent as Event>::SIZE == 848);
    assert!(<FileOpenEvent as Event>::SIZE == 336);
    assert!(<ConnectEvent as Event>::SIZE == 80);
};

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn header_fields_are_byte_stable() {
        assert_eq!(offset_of!(EventHeader, cgroup_id), 8);
        assert_eq!(offset_of!(EventHeader, pid), 16);
        assert_eq!(offset_of!(EventHeader, gid), 28);
        assert_eq!(offset_of!(EventHeader, kind), 32);
        assert_eq!(offset_of!(EventHeader, blocked), 33);
        assert_eq!(offset_of!(EventHeader, comm), 40);
    }

    #[test]
    fn payload_offsets() {
        assert_eq!(offset_of!(ExecEvent, ppid), 56);
        assert_eq!(offset_of!(ExecEvent, pcomm), 64);
        assert_eq!(offset_of!(ExecEvent, filename), 80);
        assert_eq!(offset_of!(ExecEvent, command_line), 336);
        assert_eq!(offset_of!(FileOpenEvent, ino), 56);
        assert_eq!(offset_of!(FileOpenEvent, flags), 72);
        assert_eq!(offset_of!(FileOpenEvent, filename), 80);
        assert_eq!(offset_of!(ConnectEvent, addr_v4), 56);
        assert_eq!(offset_of!(ConnectEvent, family), 60);
        assert_eq!(offset_of!(ConnectEvent, port), 62);
        assert_eq!(offset_of!(ConnectEvent, addr_v6), 64);
    }

    #[test]
    fn header_splits_context() {
        let ctx = TaskContext {
            timestamp_ns: 7,
            pid_tgid: (100u64 << 32) | 101,
            uid_gid: (20u64 << 32) | 10,
            cgroup_id: 55,
            comm: *b"bash\0\0\0\0\0\0\0\0\0\0\0\0",
        };
        let header = EventHeader::new(EventType::FileOpen, &ctx, true);
        assert_eq!((header.pid, header.tid), (100, 101));
        assert_eq!((header.uid, header.gid), (10, 20));
        assert_eq!(header.event_type(), Some(EventType::FileOpen));
        assert!(header.is_blocked());
        assert_eq!(header.to_string(), "100/101");
    }
}
