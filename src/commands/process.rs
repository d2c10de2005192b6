//! `process` subcommand: the request manager and slot scheduler tick

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;

use nla_core::{acquire, adjust_slots, load_slots, update_requests};

/// `process` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct ProcessCmd {}

impl Runnable for ProcessCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl ProcessCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let _guard = acquire(&config.retrieval.lock_dir(), "process")?;
        let store = config.open_store()?;

        let outcome = update_requests(&store)?;
        println!(
            "updated {} request(s): {} active, {} inactive, {} completed",
            outcome.examined, outcome.activated, outcome.deactivated, outcome.completed
        );

        adjust_slots(&store, config.retrieval.slots())?;

        let assigned = load_slots(&store, config.retrieval.max_slots_per_user())?;
        for (slot, request) in &assigned {
            println!("assigned request {request} to slot {slot}");
        }
        println!("{} slot(s) newly loaded", assigned.len());
        Ok(())
    }
}
