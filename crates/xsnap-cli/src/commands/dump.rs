//! Dump command - print a snapshot without loading it.

use anyhow::{Context, Result};
use clap::Args;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use xsnap_snapshot::dump_snapshot;

#[derive(Args)]
pub struct DumpCommand {
    /// Snapshot to print
    pub snapshot: PathBuf,
}

impl DumpCommand {
    pub fn run(&self) -> Result<()> {
        let file = File::open(&self.snapshot)
            .with_context(|| format!("Failed to open {}", self.snapshot.display()))?;
        let mut source = BufReader::new(file);
        let mut sink = BufWriter::new(std::io::stdout().lock());
        dump_snapshot(&mut source, &mut sink)
            .with_context(|| format!("Corrupt snapshot {}", self.snapshot.display()))
    }
}
