use std::path::PathBuf;
use std::process;

use aegis_common::policy::encode_path_key;
use aegis_common::{Action, PathKey};
use anyhow::Context;
use aya::maps::{HashMap, MapData};
use aya::programs::Lsm;
use aya::{Btf, Ebpf};
use clap::Parser;
use log::{debug, info, warn};

use crate::policy::{CompiledPolicy, PolicyFile, RuleAction};
use crate::version::KERNEL_VERSION_STR;

#[cfg(debug_assertions)]
const DEFAULT_OBJECT: &str = "target/bpfel-unknown-none/debug/aegis-ebpf";
#[cfg(not(debug_assertions))]
const DEFAULT_OBJECT: &str = "target/bpfel-unknown-none/release/aegis-ebpf";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML policy file with [[path]], [[port]], [[exec]] and [[connect]] rules
    #[arg(short, long)]
    pub policy: Option<PathBuf>,
    /// path, directory prefix (ending in `/`) or basename to block
    #[arg(long)]
    pub block_path: Vec<String>,
    /// path, directory prefix (ending in `/`) or basename to monitor
    #[arg(long)]
    pub monitor_path: Vec<String>,
    /// destination port to block
    #[arg(long)]
    pub block_port: Vec<u16>,
    /// destination port to monitor
    #[arg(long)]
    pub monitor_port: Vec<u16>,
    /// compiled BPF object to load
    #[arg(long, default_value = DEFAULT_OBJECT)]
    pub bpf_object: PathBuf,
    /// do not attach the exec hook
    #[arg(long, default_value_t = false)]
    pub no_exec: bool,
    /// do not attach the file open hook
    #[arg(long, default_value_t = false)]
    pub no_file: bool,
    /// do not attach the connect hook
    #[arg(long, default_value_t = false)]
    pub no_connect: bool,
    /// linux kernel version the kernel bindings were generated for
    #[arg(short, long, default_value_t = false)]
    pub kernel_version: bool,
}

impl Args {
    /// The policy file merged with the rules given on the command line.
    pub fn policy(&self) -> anyhow::Result<CompiledPolicy> {
        let mut file = match &self.policy {
            Some(path) => PolicyFile::load(path)?,
            None => PolicyFile::default(),
        };
        for path in &self.block_path {
            file.add_path(path, RuleAction::Block);
        }
        for path in &self.monitor_path {
            file.add_path(path, RuleAction::Monitor);
        }
        for port in &self.block_port {
            file.add_port(*port, RuleAction::Block);
        }
        for port in &self.monitor_port {
            file.add_port(*port, RuleAction::Monitor);
        }
        file.compile()
    }

    /// `(program, hook)` pairs to attach.
    pub fn hooks(&self) -> Vec<(&'static str, &'static str)> {
        let mut hooks = Vec::new();
        if !self.no_exec {
            hooks.push(("aegis_exec", "bprm_check_security"));
        }
        if !self.no_file {
            hooks.push(("aegis_file_open", "file_open"));
        }
        if !self.no_connect {
            hooks.push(("aegis_socket_connect", "socket_connect"));
        }
        hooks
    }
}

pub fn version_check(args: &Args) -> anyhow::Result<()> {
    if args.kernel_version {
        println!("{}", KERNEL_VERSION_STR);
        process::exit(0)
    }
    if KERNEL_VERSION_STR.is_empty() {
        warn!("kernel bindings carry no version, run `cargo xtask codegen`");
        return Ok(());
    }
    let version = std::fs::read_to_string("/proc/version").context("failed to read /proc/version")?;
    let version = version.trim_end();
    if KERNEL_VERSION_STR != version {
        warn!("program kernel version: {}", KERNEL_VERSION_STR);
        warn!("current kernel version: {}", version);
        warn!("Please recompile otherwise errors may occur");
    }
    Ok(())
}

pub fn install_policy(bpf: &mut Ebpf, policy: &CompiledPolicy) -> anyhow::Result<()> {
    let mut paths: HashMap<&mut MapData, PathKey, u8> = HashMap::try_from(
        bpf.map_mut("MONITORED_PATHS").context("MONITORED_PATHS map not found")?,
    )?;
    for (path, action) in &policy.paths {
        let key = encode_path_key(path.as_bytes())
            .with_context(|| format!("path rule `{}` does not fit a map key", path))?;
        paths
            .insert(key, u8::from(*action), 0)
            .with_context(|| format!("failed to install path rule `{}`", path))?;
        debug!("add path {} {}", action, path);
    }

    let mut ports: HashMap<&mut MapData, u16, u8> = HashMap::try_from(
        bpf.map_mut("MONITORED_PORTS").context("MONITORED_PORTS map not found")?,
    )?;
    for (port, action) in &policy.ports {
        ports
            .insert(*port, u8::from(*action), 0)
            .with_context(|| format!("failed to install port rule {}", port))?;
        debug!("add port {} {}", action, port);
    }
    info!(
        "{} path and {} port rule(s) installed ({} block, {} monitor), {} match rule(s)",
        policy.paths.len(),
        policy.ports.len(),
        policy.count(Action::Block),
        policy.count(Action::Monitor),
        policy.rules.rule_count()
    );
    Ok(())
}

/// Keeps the hooks from checking this process, whose own name lookups and
/// log writes would otherwise feed back into the event stream.
pub fn exempt_self(bpf: &mut Ebpf) -> anyhow::Result<()> {
    let mut exempt: HashMap<&mut MapData, u32, u8> =
        HashMap::try_from(bpf.map_mut("SELF_TGID").context("SELF_TGID map not found")?)?;
    let tgid = process::id();
    exempt.insert(tgid, 1, 0).context("failed to exempt the loader")?;
    debug!("exempt tgid {}", tgid);
    Ok(())
}

pub fn attach(bpf: &mut Ebpf, hooks: &[(&str, &str)]) -> anyhow::Result<()> {
    let btf = Btf::from_sys_fs().context("failed to read kernel BTF")?;
    for (name, hook) in hooks {
        let program: &mut Lsm = bpf
            .program_mut(name)
            .with_context(|| format!("program {} not found", name))?
            .try_into()?;
        program.load(hook, &btf).with_context(|| format!("failed to load {}", name))?;
        program.attach().with_context(|| format!("failed to attach {} to {}", name, hook))?;
        info!("attached {} to lsm/{}", name, hook);
    }
    Ok(())
}

pub fn check_permission() {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("currently only supports running as the root user.");
        process::exit(1);
    }
}

pub fn raise_memlock() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }
}
