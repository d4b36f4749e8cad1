#![no_std]
#![no_main]
#![allow(non_upper_case_globals)]
#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(dead_code)]
#![allow(unnecessary_transmutes)]
#![allow(improper_ctypes_definitions)]
use aya_ebpf::macros::{lsm, map};
use aya_ebpf::maps::{HashMap, LruHashMap, PerCpuArray, RingBuf};
use aya_ebpf::programs::LsmContext;

use aegis_common::{
    Engine, PathKey, PathScratch, ANCESTRY_CAPACITY, EVENT_RINGBUF_BYTES, MAX_POLICY_ENTRIES,
};

use crate::kernel::{CurrentTask, KernelAncestry, KernelChannel, KernelPolicy};

mod connect;
mod exec;
mod file;
mod kernel;
mod tools;
mod vmlinux;

#[map]
static MONITORED_PATHS: HashMap<PathKey, u8> = HashMap::with_max_entries(MAX_POLICY_ENTRIES, 0);
#[map]
static MONITORED_PORTS: HashMap<u16, u8> = HashMap::with_max_entries(MAX_POLICY_ENTRIES, 0);
/// The loader's own tgid.
#[map]
static SELF_TGID: HashMap<u32, u8> = HashMap::with_max_entries(1, 0);
#[map]
static PID_TO_PPID: LruHashMap<u32, u32> = LruHashMap::with_max_entries(ANCESTRY_CAPACITY, 0);
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_RINGBUF_BYTES, 0);
#[map]
static SCRATCH: PerCpuArray<PathScratch> = PerCpuArray::with_max_entries(1, 0);

const ENGINE: Engine<'static, KernelPolicy, KernelChannel, KernelAncestry, CurrentTask> =
    Engine::new(&KernelPolicy, &KernelChannel, &KernelAncestry, &CurrentTask);

//lsm types
//include/linux/lsm_hook_defs.h
#[lsm(hook = "bprm_check_security")]
pub fn aegis_exec(ctx: LsmContext) -> i32 {
    exec::try_bprm_check_security(&ctx).unwrap_or(0)
}

#[lsm(hook = "file_open")]
pub fn aegis_file_open(ctx: LsmContext) -> i32 {
    file::try_file_open(&ctx).unwrap_or(0)
}

#[lsm(hook = "socket_connect")]
pub fn aegis_socket_connect(ctx: LsmContext) -> i32 {
    connect::try_socket_connect(&ctx).unwrap_or(0)
}

#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
