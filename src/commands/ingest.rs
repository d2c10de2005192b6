//! `ingest` subcommand: register files from tape-only filesets

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;

use nla_core::{acquire, move_files_to_nla};

/// `ingest` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct IngestCmd {}

impl Runnable for IngestCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl IngestCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let _guard = acquire(&config.retrieval.lock_dir(), "ingest")?;
        let store = config.open_store()?;

        let outcome = move_files_to_nla(&store, &config.ingest_settings()?)?;
        println!(
            "added {} file(s) ({} link(s) and {} small file(s) ignored)",
            outcome.added, outcome.skipped_links, outcome.skipped_small
        );
        Ok(())
    }
}
