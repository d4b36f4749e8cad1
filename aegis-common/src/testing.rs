//! In-memory stand-ins for the kernel side of the engine traits.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::channel::{EventChannel, EventSlot};
use crate::cmdline::ArgMemory;
use crate::context::{AncestryTracker, Identity, TaskContext};
use crate::engine::{ExecImage, InodeId, OpenedFile, SocketTarget};
use crate::event::{ConnectEvent, Event, ExecEvent, FileOpenEvent};
use crate::path::PathNode;
use crate::policy::{encode_path_key, Action, PolicyStore};
use crate::{cmdline::ArgBlock, until_nul, PathKey, TASK_COMM_LEN};

struct Entry {
    name: String,
    parent: usize,
    poisoned: bool,
    detached: bool,
}

/// A dentry tree. Node 0 is the root and is its own parent.
pub struct FakeTree {
    nodes: Vec<Entry>,
}

impl FakeTree {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![Entry {
                name: "/".into(),
                parent: Self::ROOT,
                poisoned: false,
                detached: false,
            }],
        }
    }

    pub fn child(&mut self, parent: usize, name: &str) -> usize {
        self.nodes.push(Entry {
            name: name.into(),
            parent,
            poisoned: false,
            detached: false,
        });
        self.nodes.len() - 1
    }

    /// Creates a fresh chain for an absolute path and returns its leaf.
    pub fn path(&mut self, path: &str) -> usize {
        path.split('/')
            .filter(|part| !part.is_empty())
            .fold(Self::ROOT, |parent, part| self.child(parent, part))
    }

    pub fn parent_of(&self, id: usize) -> usize {
        self.nodes[id].parent
    }

    /// Makes the node's name unreadable.
    pub fn poison(&mut self, id: usize) {
        self.nodes[id].poisoned = true;
    }

    /// Makes the node's parent pointer unreadable.
    pub fn detach(&mut self, id: usize) {
        self.nodes[id].detached = true;
    }

    pub fn node(&self, id: usize) -> FakeNode<'_> {
        FakeNode { tree: self, id }
    }
}

#[derive(Clone, Copy)]
pub struct FakeNode<'a> {
    tree: &'a FakeTree,
    id: usize,
}

impl PartialEq for FakeNode<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tree, other.tree) && self.id == other.id
    }
}

impl PathNode for FakeNode<'_> {
    fn read_name(&self, dst: &mut [u8]) -> Option<usize> {
        let entry = &self.tree.nodes[self.id];
        if entry.poisoned {
            return None;
        }
        let name = entry.name.as_bytes();
        if name.len() <= dst.len() {
            dst[..name.len()].copy_from_slice(name);
        }
        Some(name.len())
    }

    fn parent(&self) -> Option<Self> {
        let entry = &self.tree.nodes[self.id];
        if entry.detached {
            return None;
        }
        Some(self.tree.node(entry.parent))
    }
}

/// Policy maps that log every path probe.
#[derive(Default)]
pub struct MapPolicy {
    paths: HashMap<PathKey, Action>,
    ports: HashMap<u16, Action>,
    exempt: Option<u32>,
    queries: RefCell<Vec<String>>,
}

impl MapPolicy {
    pub fn path(mut self, key: &str, action: Action) -> Self {
        self.paths.insert(encode_path_key(key.as_bytes()).unwrap(), action);
        self
    }

    pub fn port(mut self, port: u16, action: Action) -> Self {
        self.ports.insert(port, action);
        self
    }

    pub fn exempt(mut self, tgid: u32) -> Self {
        self.exempt = Some(tgid);
        self
    }

    pub fn path_queries(&self) -> Vec<String> {
        self.queries.borrow().clone()
    }
}

impl PolicyStore for MapPolicy {
    fn path_action(&self, key: &PathKey) -> Option<Action> {
        self.queries
            .borrow_mut()
            .push(String::from_utf8_lossy(until_nul(key)).into_owned());
        self.paths.get(key).copied()
    }

    fn port_action(&self, port: u16) -> Option<Action> {
        self.ports.get(&port).copied()
    }

    fn is_exempt(&self, tgid: u32) -> bool {
        self.exempt == Some(tgid)
    }
}

/// Sparse byte-addressed memory; anything not written is unmapped.
#[derive(Default)]
pub struct FakeMemory {
    bytes: HashMap<u64, u8>,
}

impl FakeMemory {
    const STRINGS: u64 = 0x5500_0000;

    /// Lays out `argc`, the pointer array and the strings at `block`.
    pub fn with_args(block: u64, args: &[&str]) -> Self {
        let mut memory = Self::default();
        memory.write_u32(block, args.len() as u32);
        let mut cursor = Self::STRINGS;
        for (i, arg) in args.iter().enumerate() {
            memory.write_u64(block + 4 + 8 * i as u64, cursor);
            memory.write(cursor, arg.as_bytes());
            memory.write(cursor + arg.len() as u64, &[0]);
            cursor += arg.len() as u64 + 1;
        }
        memory
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    fn read<const N: usize>(&self, addr: u64) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = *self.bytes.get(&addr.checked_add(i as u64)?)?;
        }
        Some(out)
    }
}

impl ArgMemory for FakeMemory {
    fn read_u32(&self, addr: u64) -> Option<u32> {
        self.read::<4>(addr).map(u32::from_le_bytes)
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        self.read::<8>(addr).map(u64::from_le_bytes)
    }

    fn read_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        if dst.is_empty() {
            return None;
        }
        for i in 0..dst.len() - 1 {
            let b = *self.bytes.get(&addr.checked_add(i as u64)?)?;
            dst[i] = b;
            if b == 0 {
                return Some(i);
            }
        }
        let last = dst.len() - 1;
        dst[last] = 0;
        Some(last)
    }
}

#[derive(Default)]
struct ChannelState {
    outstanding: Cell<usize>,
    committed: RefCell<Vec<Vec<u8>>>,
}

/// Ring buffer stand-in that counts slots rather than bytes. Event kinds are
/// told apart by record size.
pub struct RecordingChannel {
    capacity: usize,
    state: Rc<ChannelState>,
}

impl RecordingChannel {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            state: Rc::default(),
        }
    }

    pub fn committed_len(&self) -> usize {
        self.state.committed.borrow().len()
    }

    fn decoded<T: Event>(&self) -> Vec<T> {
        self.state
            .committed
            .borrow()
            .iter()
            .filter(|raw| raw.len() == T::SIZE)
            .map(|raw| unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const T) })
            .collect()
    }

    pub fn execs(&self) -> Vec<ExecEvent> {
        self.decoded()
    }

    pub fn files(&self) -> Vec<FileOpenEvent> {
        self.decoded()
    }

    pub fn connects(&self) -> Vec<ConnectEvent> {
        self.decoded()
    }
}

pub struct RecordingSlot<T> {
    value: Box<T>,
    state: Rc<ChannelState>,
}

impl<T: Event> EventSlot<T> for RecordingSlot<T> {
    fn zeroed(&mut self) -> &mut T {
        unsafe { std::ptr::write_bytes(&mut *self.value as *mut T, 0, 1) };
        &mut self.value
    }

    fn commit(self) {
        let raw = unsafe {
            std::slice::from_raw_parts(&*self.value as *const T as *const u8, T::SIZE)
        };
        self.state.committed.borrow_mut().push(raw.to_vec());
        self.state.outstanding.set(self.state.outstanding.get() - 1);
    }

    fn discard(self) {
        self.state.outstanding.set(self.state.outstanding.get() - 1);
    }
}

impl EventChannel for RecordingChannel {
    type Slot<T: Event> = RecordingSlot<T>;

    fn reserve<T: Event>(&self) -> Option<Self::Slot<T>> {
        let used = self.state.outstanding.get() + self.state.committed.borrow().len();
        if used >= self.capacity {
            return None;
        }
        self.state.outstanding.set(self.state.outstanding.get() + 1);
        // Stale bytes stand in for a reused ring buffer region.
        let value: Box<T> = unsafe {
            let mut stale = Box::<T>::new_uninit();
            std::ptr::write_bytes(stale.as_mut_ptr() as *mut u8, 0x5a, T::SIZE);
            stale.assume_init()
        };
        Some(RecordingSlot {
            value,
            state: self.state.clone(),
        })
    }
}

#[derive(Default)]
pub struct RecordingAncestry {
    pub records: RefCell<Vec<(u32, u32)>>,
}

impl AncestryTracker for RecordingAncestry {
    fn record(&self, pid: u32, ppid: u32) {
        self.records.borrow_mut().push((pid, ppid));
    }
}

pub struct FixedIdentity(pub TaskContext);

impl FixedIdentity {
    pub fn new(pid: u32, tid: u32, comm: &str) -> Self {
        let mut name = [0u8; TASK_COMM_LEN];
        name[..comm.len()].copy_from_slice(comm.as_bytes());
        Self(TaskContext {
            timestamp_ns: 1_000,
            pid_tgid: (u64::from(pid) << 32) | u64::from(tid),
            uid_gid: (1000u64 << 32) | 1000,
            cgroup_id: 77,
            comm: name,
        })
    }
}

impl Identity for FixedIdentity {
    fn current(&self) -> TaskContext {
        self.0
    }
}

pub struct FakeExec<'a> {
    pub file: Option<FakeNode<'a>>,
    pub ppid: u32,
    pub pcomm: &'static str,
    pub args: Option<&'a FakeMemory>,
    pub block: u64,
    pub argc: Option<u32>,
}

impl<'a> ExecImage for FakeExec<'a> {
    type Node = FakeNode<'a>;
    type Memory = &'a FakeMemory;

    fn executable(&self) -> Option<Self::Node> {
        self.file
    }

    fn parent_pid(&self) -> u32 {
        self.ppid
    }

    fn parent_comm(&self, dst: &mut [u8; TASK_COMM_LEN]) {
        dst[..self.pcomm.len()].copy_from_slice(self.pcomm.as_bytes());
    }

    fn arguments(&self) -> Option<ArgBlock<Self::Memory>> {
        self.args.map(|memory| ArgBlock {
            memory,
            addr: self.block,
            expected_argc: self.argc,
        })
    }
}

impl ArgMemory for &FakeMemory {
    fn read_u32(&self, addr: u64) -> Option<u32> {
        (**self).read_u32(addr)
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        (**self).read_u64(addr)
    }

    fn read_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        (**self).read_str(addr, dst)
    }
}

pub struct FakeFile<'a> {
    pub node: Option<FakeNode<'a>>,
    pub flags: u32,
    pub inode: Option<InodeId>,
}

impl<'a> OpenedFile for FakeFile<'a> {
    type Node = FakeNode<'a>;

    fn dentry(&self) -> Option<Self::Node> {
        self.node
    }

    fn flags(&self) -> u32 {
        self.flags
    }

    fn inode(&self) -> Option<InodeId> {
        self.inode
    }
}

pub struct FakeSocket {
    pub family: Option<u16>,
    pub port: Option<u16>,
    pub v4: [u8; 4],
    pub v6: [u8; 16],
}

impl SocketTarget for FakeSocket {
    fn family(&self) -> Option<u16> {
        self.family
    }

    fn port(&self, _family: u16) -> Option<u16> {
        self.port
    }

    fn ipv4(&self) -> [u8; 4] {
        self.v4
    }

    fn ipv6(&self) -> [u8; 16] {
        self.v6
    }
}
