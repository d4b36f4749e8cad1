use anyhow::Context;
use aya::Ebpf;
use aya_log::EbpfLogger;
use clap::Parser;
use log::{info, warn};
use tokio::signal;

use crate::event::wait_events;
use crate::setup::{
    attach, check_permission, exempt_self, install_policy, raise_memlock, version_check, Args,
};

mod event;
mod policy;
mod record;
mod rules;
mod setup;
mod version;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    check_permission();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    version_check(&args)?;
    let policy = args.policy()?;
    raise_memlock();

    let mut bpf = Ebpf::load_file(&args.bpf_object)
        .with_context(|| format!("failed to load {}", args.bpf_object.display()))?;
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        // This can happen if you remove all log statements from your eBPF program.
        warn!("failed to initialize eBPF logger: {}", e);
    }
    install_policy(&mut bpf, &policy)?;
    exempt_self(&mut bpf)?;
    attach(&mut bpf, &args.hooks())?;
    wait_events(&mut bpf, policy)?;
    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");
    Ok(())
}
