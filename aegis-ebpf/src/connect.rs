use core::ptr::addr_of;

use aegis_common::{SocketTarget, Verdict, AF_INET, AF_INET6};
use aya_ebpf::helpers::bpf_probe_read_kernel;
use aya_ebpf::programs::LsmContext;
use aya_log_ebpf::debug;

use crate::vmlinux::{sockaddr, sockaddr_in, sockaddr_in6};
use crate::ENGINE;

struct SockAddr(*const sockaddr);

impl SockAddr {
    fn v4(&self) -> *const sockaddr_in {
        self.0 as *const sockaddr_in
    }

    fn v6(&self) -> *const sockaddr_in6 {
        self.0 as *const sockaddr_in6
    }
}

impl SocketTarget for SockAddr {
    fn family(&self) -> Option<u16> {
        unsafe { bpf_probe_read_kernel(addr_of!((*self.0).sa_family)) }.ok()
    }

    fn port(&self, family: u16) -> Option<u16> {
        let raw = match family {
            AF_INET => unsafe { bpf_probe_read_kernel(addr_of!((*self.v4()).sin_port)) },
            AF_INET6 => unsafe { bpf_probe_read_kernel(addr_of!((*self.v6()).sin6_port)) },
            _ => return None,
        };
        raw.ok().map(u16::from_be)
    }

    fn ipv4(&self) -> [u8; 4] {
        unsafe { bpf_probe_read_kernel(addr_of!((*self.v4()).sin_addr.s_addr)) }
            .map(u32::to_ne_bytes)
            .unwrap_or([0; 4])
    }

    fn ipv6(&self) -> [u8; 16] {
        unsafe { bpf_probe_read_kernel(addr_of!((*self.v6()).sin6_addr)) }
            .map(|addr| unsafe { addr.in6_u.u6_addr8 })
            .unwrap_or([0; 16])
    }
}

pub fn try_socket_connect(ctx: &LsmContext) -> Result<i32, i32> {
    let target = SockAddr(unsafe { ctx.arg::<*const sockaddr>(1) });
    if target.0.is_null() {
        return Ok(0);
    }
    let verdict = ENGINE.connect(&target);
    if verdict == Verdict::Deny {
        debug!(ctx, "socket_connect denied");
    }
    Ok(verdict.into_retval())
}
