//! Lockdown command - lock a machine down and harden its global object.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use xsnap_core::{Value, harden, lockdown};

use crate::config::Config;

#[derive(Args)]
pub struct LockdownCommand {
    /// Snapshot to lock down
    pub snapshot: PathBuf,

    /// Write to this file instead of replacing the snapshot
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl LockdownCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let mut machine = super::read_machine(&self.snapshot, config)?;
        lockdown(&mut machine).context("Lockdown failed")?;
        let global = machine.global()?;
        harden(&mut machine, Value::Reference(global)).context("Hardening globalThis failed")?;
        let output = self.output.as_ref().unwrap_or(&self.snapshot);
        super::write_machine(&machine, output, config)?;
        Ok(())
    }
}
