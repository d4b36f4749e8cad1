use crate::TASK_COMM_LEN;

/// Identity of the thread a checkpoint fired on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub timestamp_ns: u64,
    /// `tgid << 32 | pid` as returned by `bpf_get_current_pid_tgid`.
    pub pid_tgid: u64,
    /// `gid << 32 | uid` as returned by `bpf_get_current_uid_gid`.
    pub uid_gid: u64,
    pub cgroup_id: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl TaskContext {
    pub fn pid(&self) -> u32 {
        (self.pid_tgid >> 32) as u32
    }

    pub fn tid(&self) -> u32 {
        self.pid_tgid as u32
    }

    pub fn uid(&self) -> u32 {
        self.uid_gid as u32
    }

    pub fn gid(&self) -> u32 {
        (self.uid_gid >> 32) as u32
    }
}

/// Snapshot of the current task. Must not fail; missing values are zero.
pub trait Identity {
    fn current(&self) -> TaskContext;
}

/// pid -> parent pid bookkeeping. Best effort: a full table silently drops.
pub trait AncestryTracker {
    fn record(&self, pid: u32, ppid: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_combined_identifiers() {
        let ctx = TaskContext {
            pid_tgid: (4242u64 << 32) | 4243,
            uid_gid: (1000u64 << 32) | 1001,
            ..Default::default()
        };
        assert_eq!(ctx.pid(), 4242);
        assert_eq!(ctx.tid(), 4243);
        assert_eq!(ctx.uid(), 1001);
        assert_eq!(ctx.gid(), 1000);
    }

    #[test]
    fn default_is_zeroed() {
        let ctx = TaskContext::default();
        assert_eq!((ctx.pid(), ctx.tid(), ctx.uid(), ctx.gid()), (0, 0, 0, 0));
        assert_eq!(ctx.comm, [0; TASK_COMM_LEN]);
    }
}
