use aegis_common::{InodeId, OpenedFile, Verdict};
use aya_ebpf::programs::LsmContext;
use aya_log_ebpf::debug;

use crate::kernel::Dentry;
use crate::tools::{file_dentry, read_inode};
use crate::vmlinux::file;
use crate::{array_get_mut, read_struct_field, ENGINE, SCRATCH};

struct OpenFile(*const file);

impl OpenedFile for OpenFile {
    type Node = Dentry;

    fn dentry(&self) -> Option<Dentry> {
        file_dentry(self.0).ok().map(Dentry)
    }

    fn flags(&self) -> u32 {
        let f = self.0;
        read_struct_field!(f, f_flags).unwrap_or(0)
    }

    fn inode(&self) -> Option<InodeId> {
        read_inode(self.0).ok()
    }
}

pub fn try_file_open(ctx: &LsmContext) -> Result<i32, i32> {
    let opened = OpenFile(unsafe { ctx.arg::<*const file>(0) });
    if opened.0.is_null() {
        return Ok(0);
    }
    let scratch = array_get_mut!(SCRATCH, 0);
    let verdict = ENGINE.file_open(&opened, scratch);
    if verdict == Verdict::Deny {
        debug!(ctx, "file_open denied");
    }
    Ok(verdict.into_retval())
}
