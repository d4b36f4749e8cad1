use aegis_common::InodeId;

use crate::vmlinux::{dentry, file};

pub const ERROR_FAULT: i32 = -1;

#[macro_export]
macro_rules! array_get_mut {
    ($name: expr, $index: expr) => {
        unsafe { &mut *($name.get_ptr_mut($index).ok_or($crate::tools::ERROR_FAULT)?) }
    };
}

#[macro_export]
macro_rules! read_bytes {
    ($src: expr, $dest: expr) => {{
        unsafe {
            aya_ebpf::helpers::bpf_probe_read_kernel_buf($src, $dest)
                .map_err(|_| $crate::tools::ERROR_FAULT)?
        }
    }};
}

#[macro_export]
macro_rules! read_struct_field {
    ($obj: ident, $field: ident $(.$subfield:ident)*) => {
        unsafe {aya_ebpf::helpers::bpf_probe_read_kernel(&(*$obj).$field $(.$subfield)*)
            .map_err(|_e| $crate::tools::ERROR_FAULT)}
    };
}

//sys/sysmacros.h
#[macro_export]
macro_rules! MINOR {
    ($dev: expr) => {
        ((($dev) & ((1 << 20) - 1)) as u32)
    };
}
#[macro_export]
macro_rules! MAJOR {
    ($dev: expr) => {
        ((($dev) >> 20) as u32)
    };
}
#[macro_export]
macro_rules! makedev {
    ($major: expr, $minor: expr) => {
        ((((($major as u64) & 0xfffff000) << 32)
            | ((($major as u64) & 0x00000fff) << 8)
            | ((($minor as u64) & 0xffffff00) << 12)
            | (($minor as u64) & 0x000000ff)) as u64)
    };
}

/// Inode number and userspace device number of an open file.
pub fn read_inode(file_addr: *const file) -> Result<InodeId, i32> {
    let inode = read_struct_field!(file_addr, f_inode)?;
    if inode.is_null() {
        return Err(ERROR_FAULT);
    }
    let ino = read_struct_field!(inode, i_ino)?;
    let i_sb = read_struct_field!(inode, i_sb)?;
    let dev = if i_sb.is_null() {
        0
    } else {
        let s_dev = read_struct_field!(i_sb, s_dev)?;
        makedev!(MAJOR!(s_dev), MINOR!(s_dev))
    };
    Ok(InodeId { ino, dev })
}

pub fn file_dentry(file_addr: *const file) -> Result<*const dentry, i32> {
    if file_addr.is_null() {
        return Err(ERROR_FAULT);
    }
    let d = read_struct_field!(file_addr, __bindgen_anon_1.f_path.dentry)?;
    match d.is_null() {
        true => Err(ERROR_FAULT),
        false => Ok(d as *const dentry),
    }
}

/// Copies a dentry name into `buf` when it fits. Returns the name length.
pub fn read_d_name(d: *const dentry, buf: &mut [u8]) -> Result<usize, i32> {
    let qstr = read_struct_field!(d, __bindgen_anon_1.d_name)?;
    let len = unsafe { qstr.__bindgen_anon_1.__bindgen_anon_1.len } as usize;
    if len == 0 || len > buf.len() || qstr.name.is_null() {
        return Ok(len);
    }
    read_bytes!(qstr.name, &mut buf[..len]);
    Ok(len)
}

pub fn read_d_parent(d: *const dentry) -> Result<*const dentry, i32> {
    let parent = read_struct_field!(d, d_parent)?;
    match parent.is_null() {
        true => Err(ERROR_FAULT),
        false => Ok(parent as *const dentry),
    }
}
