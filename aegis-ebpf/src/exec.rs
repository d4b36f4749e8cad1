use aegis_common::cmdline::{ArgBlock, ArgMemory};
use aegis_common::{ExecImage, Verdict, TASK_COMM_LEN};
use aya_ebpf::helpers::{self, bpf_probe_read_user, bpf_probe_read_user_str_bytes};
use aya_ebpf::programs::LsmContext;
use aya_log_ebpf::debug;

use crate::kernel::Dentry;
use crate::tools::file_dentry;
use crate::vmlinux::{linux_binprm, task_struct};
use crate::{array_get_mut, read_struct_field, ENGINE, SCRATCH};

struct Binprm {
    bprm: *const linux_binprm,
    task: *const task_struct,
}

impl Binprm {
    fn parent(&self) -> Result<*const task_struct, i32> {
        let task = self.task;
        let parent = read_struct_field!(task, real_parent)?;
        match parent.is_null() {
            true => Err(crate::tools::ERROR_FAULT),
            false => Ok(parent as *const task_struct),
        }
    }
}

impl ExecImage for Binprm {
    type Node = Dentry;
    type Memory = UserArgs;

    fn executable(&self) -> Option<Dentry> {
        let bprm = self.bprm;
        let file = read_struct_field!(bprm, file).ok()?;
        file_dentry(file).ok().map(Dentry)
    }

    fn parent_pid(&self) -> u32 {
        match self.parent() {
            Ok(parent) => read_struct_field!(parent, tgid).unwrap_or(0) as u32,
            Err(_) => 0,
        }
    }

    fn parent_comm(&self, dst: &mut [u8; TASK_COMM_LEN]) {
        let Ok(parent) = self.parent() else {
            return;
        };
        if let Ok(comm) = read_struct_field!(parent, comm) {
            for i in 0..TASK_COMM_LEN {
                dst[i] = comm[i] as u8;
            }
        }
    }

    fn arguments(&self) -> Option<ArgBlock<UserArgs>> {
        let bprm = self.bprm;
        let p = read_struct_field!(bprm, p).ok()?;
        // `p` points into the new mm, which is not current yet.
        let argc = read_struct_field!(bprm, argc).ok()?;
        Some(ArgBlock {
            memory: UserArgs,
            addr: p as u64,
            expected_argc: Some(argc as u32),
        })
    }
}

/// The argument block of the image being exec'd.
struct UserArgs;

impl ArgMemory for UserArgs {
    fn read_u32(&self, addr: u64) -> Option<u32> {
        unsafe { bpf_probe_read_user(addr as *const u32) }.ok()
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_user(addr as *const u64) }.ok()
    }

    fn read_str(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        unsafe { bpf_probe_read_user_str_bytes(addr as *const u8, dst) }
            .ok()
            .map(|s| s.len())
    }
}

pub fn try_bprm_check_security(ctx: &LsmContext) -> Result<i32, i32> {
    let image = Binprm {
        bprm: unsafe { ctx.arg::<*const linux_binprm>(0) },
        task: unsafe { helpers::bpf_get_current_task_btf() as *const task_struct },
    };
    let scratch = array_get_mut!(SCRATCH, 0);
    let verdict = ENGINE.exec(&image, scratch);
    debug!(
        ctx,
        "finished bprm_check_security: {}",
        match verdict {
            Verdict::Deny => "Denied",
            Verdict::Allow => "Allowed",
        }
    );
    Ok(verdict.into_retval())
}
