//! `tidy` subcommand: evict expired requests back to tape

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;
use chrono::Utc;

use nla_core::{acquire, tidy_requests};

/// `tidy` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct TidyCmd {}

impl Runnable for TidyCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl TidyCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let _guard = acquire(&config.retrieval.lock_dir(), "tidy")?;
        let store = config.open_store()?;
        let index = config.index_updater();

        println!("starting tidy of expired requests");
        let outcome = tidy_requests(&store, index.as_ref(), &config.tidy_settings(), Utc::now())?;
        println!(
            "removed {} request(s): {} file(s) evicted, {} vanished row(s) dropped, \
             {} modified file(s) back to unverified",
            outcome.requests_removed,
            outcome.files_evicted,
            outcome.rows_dropped,
            outcome.reset_unverified
        );
        Ok(())
    }
}
