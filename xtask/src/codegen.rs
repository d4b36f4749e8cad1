use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context};
use clap::Parser;

/// Kernel types the LSM programs dereference.
const TYPES: &[&str] = &[
    "linux_binprm",
    "task_struct",
    "file",
    "dentry",
    "inode",
    "super_block",
    "qstr",
    "sockaddr",
    "sockaddr_in",
    "sockaddr_in6",
];

const BINDINGS: &str = "aegis-ebpf/src/vmlinux.rs";
const VERSION_FILE: &str = "aegis/src/version.rs";

#[derive(Debug, Parser)]
pub struct Options {
    /// Regenerate even when the recorded kernel version matches
    #[clap(long)]
    pub force: bool,
}

pub fn running_kernel() -> anyhow::Result<String> {
    let version = fs::read_to_string("/proc/version").context("failed to read /proc/version")?;
    Ok(version.trim_end().to_string())
}

pub fn generate(opts: Options) -> anyhow::Result<()> {
    let version = running_kernel()?;
    if !opts.force && version == crate::build_ebpf::kernel_version::KERNEL_VERSION_STR {
        println!("bindings are up to date");
        return Ok(());
    }

    println!("regenerate {}", BINDINGS);
    let output = Command::new("aya-tool")
        .arg("generate")
        .args(TYPES)
        .output()
        .context("failed to run aya-tool, install it with `cargo install bindgen-cli aya-tool`")?;
    if !output.status.success() {
        bail!("aya-tool failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    fs::write(PathBuf::from(BINDINGS), &output.stdout)
        .with_context(|| format!("failed to write {}", BINDINGS))?;

    let version_buf = format!("pub const KERNEL_VERSION_STR: &str = {:?};\n", version);
    fs::write(VERSION_FILE, version_buf).with_context(|| format!("failed to write {}", VERSION_FILE))?;
    Ok(())
}
