//! New command - create a machine with the host globals.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use xsnap_core::{Creation, Machine};

use crate::config::Config;
use crate::host;

#[derive(Args)]
pub struct NewCommand {
    /// Snapshot file to write
    pub output: PathBuf,

    /// Use small creation parameters instead of the configured ones
    #[arg(long)]
    pub small: bool,
}

impl NewCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let creation = if self.small {
            Creation::small()
        } else {
            config.creation
        };
        let mut machine = Machine::new(creation)?;
        host::install(&mut machine)?;
        let written = super::write_machine(&machine, &self.output, config)?;
        println!("{}: {} bytes", self.output.display(), written);
        Ok(())
    }
}
