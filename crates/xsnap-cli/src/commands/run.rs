//! Run command - resume a machine and drain its jobs and timers.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Args)]
pub struct RunCommand {
    /// Snapshot to resume
    pub snapshot: PathBuf,

    /// Write the machine back to this file once idle
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Abort after this many host calls
    #[arg(long)]
    pub meter_limit: Option<u64>,
}

impl RunCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let mut machine = super::read_machine(&self.snapshot, config)?;
        machine.set_meter_limit(self.meter_limit);
        machine
            .run_loop()
            .with_context(|| format!("Machine {} failed", self.snapshot.display()))?;
        tracing::info!(meter = machine.meter().index, "machine idle");

        if let Some(output) = &self.output {
            super::write_machine(&machine, output, config)?;
        }
        Ok(())
    }
}
