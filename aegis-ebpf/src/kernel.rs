//! The engine traits backed by BPF maps and helpers.

use aegis_common::{
    Action, AncestryTracker, Event, EventChannel, EventSlot, Identity, PathKey, PathNode,
    PolicyStore, TaskContext, TASK_COMM_LEN,
};
use aya_ebpf::helpers;
use aya_ebpf::maps::ring_buf::RingBufEntry;
use aya_ebpf::memset;

use crate::tools::{read_d_name, read_d_parent};
use crate::vmlinux::dentry;
use crate::{EVENTS, MONITORED_PATHS, MONITORED_PORTS, PID_TO_PPID, SELF_TGID};

pub struct KernelPolicy;

impl PolicyStore for KernelPolicy {
    fn path_action(&self, key: &PathKey) -> Option<Action> {
        unsafe { MONITORED_PATHS.get(key) }.and_then(|raw| Action::from_raw(*raw))
    }

    fn port_action(&self, port: u16) -> Option<Action> {
        unsafe { MONITORED_PORTS.get(&port) }.and_then(|raw| Action::from_raw(*raw))
    }

    fn is_exempt(&self, tgid: u32) -> bool {
        unsafe { SELF_TGID.get(&tgid) }.is_some()
    }
}

pub struct KernelChannel;

pub struct Reserved<T: 'static>(RingBufEntry<T>);

impl<T: Event> EventSlot<T> for Reserved<T> {
    fn zeroed(&mut self) -> &mut T {
        let ptr = self.0.as_mut_ptr();
        unsafe {
            memset(ptr as *mut u8, 0, T::SIZE);
            &mut *ptr
        }
    }

    fn commit(self) {
        self.0.submit(0)
    }

    fn discard(self) {
        self.0.discard(0)
    }
}

impl EventChannel for KernelChannel {
    type Slot<T: Event> = Reserved<T>;

    fn reserve<T: Event>(&self) -> Option<Self::Slot<T>> {
        EVENTS.reserve::<T>(0).map(Reserved)
    }
}

pub struct KernelAncestry;

impl AncestryTracker for KernelAncestry {
    fn record(&self, pid: u32, ppid: u32) {
        // LRU eviction makes room; a failed update only loses history.
        let _ = PID_TO_PPID.insert(&pid, &ppid, 0);
    }
}

pub struct CurrentTask;

impl Identity for CurrentTask {
    fn current(&self) -> TaskContext {
        TaskContext {
            timestamp_ns: unsafe { helpers::bpf_ktime_get_ns() },
            pid_tgid: helpers::bpf_get_current_pid_tgid(),
            uid_gid: helpers::bpf_get_current_uid_gid(),
            cgroup_id: unsafe { helpers::bpf_get_current_cgroup_id() },
            comm: helpers::bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN]),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
pub struct Dentry(pub *const dentry);

impl PathNode for Dentry {
    fn read_name(&self, dst: &mut [u8]) -> Option<usize> {
        read_d_name(self.0, dst).ok()
    }

    fn parent(&self) -> Option<Self> {
        read_d_parent(self.0).ok().map(Dentry)
    }
}
