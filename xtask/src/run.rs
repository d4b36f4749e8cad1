use std::process::Command;

use anyhow::{bail, Context};
use clap::Parser;

use crate::build_ebpf::{build_ebpf, Architecture, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Set the endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long)]
    pub bpf_target: Architecture,
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// The command used to wrap your application
    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

pub fn run(opts: Options) -> anyhow::Result<()> {
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })?;

    let mut args = vec!["build", "--package", "aegis"];
    if opts.release {
        args.push("--release")
    }
    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("failed to build userspace")?;
    if !status.success() {
        bail!("userspace build failed: {}", status);
    }

    let profile = if opts.release { "release" } else { "debug" };
    let bin_path = format!("target/{}/aegis", profile);
    let object = format!("target/{}/{}/aegis-ebpf", opts.bpf_target, profile);
    let mut run_args: Vec<_> = opts.run_args.iter().map(String::as_str).collect();
    if !run_args.iter().any(|a| *a == "--bpf-object") {
        run_args.extend(["--bpf-object", object.as_str()]);
    }

    let mut runner = opts.runner.split_whitespace();
    let program = runner.next().context("empty runner")?;
    let status = Command::new(program)
        .args(runner)
        .arg(&bin_path)
        .args(&run_args)
        .status()
        .with_context(|| format!("failed to run `{} {}`", opts.runner, bin_path))?;
    if !status.success() {
        bail!("aegis exited with {}", status);
    }
    Ok(())
}
