//! `verify` subcommand: promote UNVERIFIED files to ONDISK

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;

use nla_core::{acquire, quick_verify, verify, VerifyReport};

/// `verify` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct VerifyCmd {
    /// Give the verified files a retention of "now" instead of the usual
    /// 20 days, so the next tidy moves them straight to tape
    #[clap(long)]
    now: bool,

    /// Skip the checksum comparison and only confirm presence on tape;
    /// applies to the configured quick-verify prefixes only
    #[clap(long)]
    quick: bool,
}

impl Runnable for VerifyCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl VerifyCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let _guard = acquire(&config.retrieval.lock_dir(), "verify")?;
        let store = config.open_store()?;
        let settings = config.verify_settings()?;
        let resolver = config.load_resolver()?;

        let report = if self.quick {
            let client = config.tape_client()?;
            quick_verify(&store, &resolver, &settings, &client, self.now)?
        } else {
            verify(&store, &resolver, &settings, self.now)?
        };
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &VerifyReport) {
    println!(
        "{} file(s) verified, {} not found",
        report.verified, report.not_found
    );
    if !report.missing_log_spots.is_empty() {
        println!("missing checksum logs:");
        for spot in &report.missing_log_spots {
            println!("    {spot}");
        }
    }
    if !report.malformed_logs.is_empty() {
        println!("errors in checksum logs:");
        for log in &report.malformed_logs {
            println!("    {}", log.display());
        }
    }
    if let Some(request_id) = report.request_id {
        println!("verified files attached to request {request_id}");
    }
}
