//! The three checkpoint handlers.
//!
//! Each call runs context capture, policy resolution, the decision, then
//! event reservation and population. The decision never depends on whether
//! the event could be emitted.

use crate::channel::{EventChannel, EventSlot};
use crate::cmdline::{self, ArgBlock, ArgMemory};
use crate::context::{AncestryTracker, Identity};
use crate::event::{ConnectEvent, EventHeader, EventType, ExecEvent, FileOpenEvent};
use crate::path::{resolve, PathNode, PathScratch};
use crate::policy::{Action, PolicyStore};
use crate::{AF_INET, AF_INET6, EPERM, TASK_COMM_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn for_action(action: Option<Action>) -> Self {
        match action {
            Some(Action::Block) => Verdict::Deny,
            _ => Verdict::Allow,
        }
    }

    /// LSM return value.
    pub fn into_retval(self) -> i32 {
        match self {
            Verdict::Allow => 0,
            Verdict::Deny => -EPERM,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InodeId {
    pub ino: u64,
    /// `makedev(major, minor)` of the owning superblock.
    pub dev: u64,
}

/// The binary being executed.
pub trait ExecImage {
    type Node: PathNode;
    type Memory: ArgMemory;

    fn executable(&self) -> Option<Self::Node>;
    /// 0 when unknown.
    fn parent_pid(&self) -> u32;
    /// Leaves `dst` zeroed when the parent is unknown.
    fn parent_comm(&self, dst: &mut [u8; TASK_COMM_LEN]);
    fn arguments(&self) -> Option<ArgBlock<Self::Memory>>;
}

/// The file being opened.
pub trait OpenedFile {
    type Node: PathNode;

    fn dentry(&self) -> Option<Self::Node>;
    fn flags(&self) -> u32;
    fn inode(&self) -> Option<InodeId>;
}

/// The destination of an outbound connection.
pub trait SocketTarget {
    fn family(&self) -> Option<u16>;
    /// Destination port in host byte order.
    fn port(&self, family: u16) -> Option<u16>;
    /// Zeroed when unreadable.
    fn ipv4(&self) -> [u8; 4];
    fn ipv6(&self) -> [u8; 16];
}

pub struct Engine<'a, P, C, A, I> {
    pub policy: &'a P,
    pub channel: &'a C,
    pub ancestry: &'a A,
    pub identity: &'a I,
}

impl<'a, P, C, A, I> Engine<'a, P, C, A, I>
where
    P: PolicyStore,
    C: EventChannel,
    A: AncestryTracker,
    I: Identity,
{
    pub const fn new(policy: &'a P, channel: &'a C, ancestry: &'a A, identity: &'a I) -> Self {
        Self {
            policy,
            channel,
            ancestry,
            identity,
        }
    }

    /// Every exec is reported, matched or not.
    pub fn exec<X: ExecImage>(&self, image: &X, scratch: &mut PathScratch) -> Verdict {
        let ctx = self.identity.current();
        let action = resolve(image.executable(), self.policy, scratch);
        let verdict = Verdict::for_action(action);

        let ppid = image.parent_pid();
        self.ancestry.record(ctx.pid(), ppid);

        let Some(mut slot) = self.channel.reserve::<ExecEvent>() else {
            return verdict;
        };
        let event = slot.zeroed();
        event.header = EventHeader::new(EventType::Exec, &ctx, verdict == Verdict::Deny);
        event.ppid = ppid;
        image.parent_comm(&mut event.pcomm);
        event.filename = scratch.path;
        match image.arguments() {
            Some(block) => cmdline::capture(&block, &scratch.path, &mut event.command_line),
            None => cmdline::write_fallback(&mut event.command_line, &scratch.path),
        };
        slot.commit();
        verdict
    }

    /// Only files with a policy entry are reported.
    pub fn file_open<F: OpenedFile>(&self, file: &F, scratch: &mut PathScratch) -> Verdict {
        let ctx = self.identity.current();
        if self.policy.is_exempt(ctx.pid()) {
            return Verdict::Allow;
        }
        let action = resolve(file.dentry(), self.policy, scratch);
        if action.is_none() {
            return Verdict::Allow;
        }
        let verdict = Verdict::for_action(action);

        let Some(mut slot) = self.channel.reserve::<FileOpenEvent>() else {
            return verdict;
        };
        let event = slot.zeroed();
        event.header = EventHeader::new(EventType::FileOpen, &ctx, verdict == Verdict::Deny);
        event.flags = file.flags();
        let id = file.inode().unwrap_or_default();
        event.ino = id.ino;
        event.dev = id.dev;
        event.filename = scratch.path;
        slot.commit();
        verdict
    }

    /// Only IPv4/IPv6 connections to a port with a policy entry are
    /// reported.
    pub fn connect<S: SocketTarget>(&self, target: &S) -> Verdict {
        let ctx = self.identity.current();
        if self.policy.is_exempt(ctx.pid()) {
            return Verdict::Allow;
        }
        let family = match target.family() {
            Some(family) if family == AF_INET || family == AF_INET6 => family,
            _ => return Verdict::Allow,
        };
        let Some(port) = target.port(family) else {
            return Verdict::Allow;
        };
        let action = self.policy.port_action(port);
        if action.is_none() {
            return Verdict::Allow;
        }
        let verdict = Verdict::for_action(action);

        let Some(mut slot) = self.channel.reserve::<ConnectEvent>() else {
            return verdict;
        };
        let event = slot.zeroed();
        event.header = EventHeader::new(EventType::Connect, &ctx, verdict == Verdict::Deny);
        event.family = family;
        event.port = port;
        if family == AF_INET {
            event.addr_v4 = target.ipv4();
        } else {
            event.addr_v6 = target.ipv6();
        }
        slot.commit();
        verdict
    }
}
