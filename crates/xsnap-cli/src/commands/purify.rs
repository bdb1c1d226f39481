//! Purify command - report what keeps a value from being pure.

use anyhow::{Result, anyhow};
use clap::Args;
use std::path::PathBuf;
use xsnap_core::{Machine, Value, purify};

use crate::config::Config;

#[derive(Args)]
pub struct PurifyCommand {
    /// Snapshot to audit
    pub snapshot: PathBuf,

    /// Audit this global instead of globalThis
    #[arg(long, value_name = "NAME")]
    pub global: Option<String>,
}

impl PurifyCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let machine = super::read_machine(&self.snapshot, config)?;
        let value = self.target(&machine)?;
        let report = purify(&machine, value)?;
        print!("{}", report);
        tracing::info!(violations = report.lines().count(), "purify");
        Ok(())
    }

    fn target(&self, machine: &Machine) -> Result<Value> {
        let global = machine.global()?;
        let Some(name) = &self.global else {
            return Ok(Value::Reference(global));
        };
        let key = machine
            .find_key(name)
            .ok_or_else(|| anyhow!("No global named {}", name))?;
        machine
            .get_own_value(global, key)
            .ok_or_else(|| anyhow!("No global named {}", name))
    }
}
