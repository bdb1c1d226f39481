//! Check command - audit what a machine shares by reference.

use anyhow::{Result, bail};
use clap::Args;
use std::path::PathBuf;
use xsnap_core::check_aliases;

use crate::config::Config;

#[derive(Args)]
pub struct CheckCommand {
    /// Snapshot to check
    pub snapshot: PathBuf,
}

impl CheckCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let machine = super::read_machine(&self.snapshot, config)?;
        let report = check_aliases(&machine);
        for diagnostic in &report.diagnostics {
            println!("{}", diagnostic);
        }
        let errors = report.error_count();
        println!("{} error(s), {} warning(s)", errors, report.warning_count());
        if errors > 0 {
            bail!("{}: {} alias error(s)", self.snapshot.display(), errors);
        }
        Ok(())
    }
}
