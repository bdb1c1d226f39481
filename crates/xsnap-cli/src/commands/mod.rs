//! CLI command implementations.

pub mod check;
pub mod dump;
pub mod lockdown;
pub mod new;
pub mod purify;
pub mod run;

use anyhow::{Context, Result};
use std::path::Path;
use xsnap_core::Machine;
use xsnap_snapshot::{read_snapshot_file, write_snapshot_file};

use crate::config::Config;

/// Read a machine, naming the file on failure
pub fn read_machine(path: &Path, config: &Config) -> Result<Machine> {
    read_snapshot_file(path, &config.snapshot_options())
        .with_context(|| format!("Failed to read snapshot {}", path.display()))
}

/// Write a machine, naming the file on failure
pub fn write_machine(machine: &Machine, path: &Path, config: &Config) -> Result<u64> {
    write_snapshot_file(machine, path, &config.snapshot_options())
        .with_context(|| format!("Failed to write snapshot {}", path.display()))
}
