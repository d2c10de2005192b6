//! `retrieve` subcommand: drive one retrieval slot

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;
use log::debug;

use nla_core::{acquire_pool, run_tick, LogNotifier};

/// `retrieve` subcommand
///
/// Each invocation processes at most one eligible slot and then exits; the
/// pool lock bounds how many retrieval processes run in parallel. Meant to
/// be started from cron at the desired frequency.
#[derive(clap::Parser, Command, Debug)]
pub(super) struct RetrieveCmd {}

impl Runnable for RetrieveCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl RetrieveCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let (seat, _guard) = acquire_pool(
            &config.retrieval.lock_dir(),
            "retrieve",
            config.retrieval.slots(),
        )?;
        debug!("holding retrieval pool seat {seat}");

        let store = config.open_store()?;
        let settings = config.retrieve_settings()?;
        let index = config.index_updater();

        println!("start retrieval run for a slot");
        run_tick(&store, &settings, &LogNotifier, index.as_ref(), &|| {
            config.load_resolver()
        })?;
        println!("end retrieval run");
        Ok(())
    }
}
