//! `fix` subcommand: reconciliation repairs

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::{anyhow, Result};

use nla_core::{acquire, assign_missing_restore_disk, fix, recompute_all};

/// `fix` subcommand
///
/// Each named repair is idempotent and independently runnable; several can
/// be given in one invocation and run in order.
#[derive(clap::Parser, Command, Debug)]
pub(super) struct FixCmd {
    /// Repairs to run, any of: clear-slots, reset-restoring,
    /// reset-requests, deactivate-requests, repair-links, clean-orphans,
    /// delete-not-in-request, remove-duplicates, readd-missing,
    /// remap-misregistered, request-ondisk, assign-restore-disk,
    /// recompute-disks
    #[clap(value_name = "FIX", required = true)]
    fixes: Vec<String>,

    /// Only clear this slot (with `clear-slots`)
    #[clap(long, value_name = "SLOT")]
    slot: Option<i64>,
}

impl Runnable for FixCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl FixCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let _guard = acquire(&config.retrieval.lock_dir(), "fix")?;
        let store = config.open_store()?;

        for name in &self.fixes {
            match name.as_str() {
                "clear-slots" => {
                    let cleared = fix::clear_slots(&store, self.slot)?;
                    println!("clear-slots: {cleared} slot(s) cleared");
                }
                "reset-restoring" => {
                    let reset = fix::reset_stuck_restoring(&store)?;
                    println!("reset-restoring: {reset} file(s) back to ONTAPE");
                }
                "reset-requests" => {
                    let reset = fix::reset_stuck_requests(&store)?;
                    println!("reset-requests: {reset} request(s) parked");
                }
                "deactivate-requests" => {
                    let count = fix::deactivate_requests(&store)?;
                    println!("deactivate-requests: {count} request(s) deactivated");
                }
                "repair-links" => {
                    let resolver = config.load_resolver()?;
                    let outcome = fix::repair_links(&store, &resolver)?;
                    println!(
                        "repair-links: {} relinked, {} lost, {} ONDISK missing, \
                         {} back to verification, {} dangling link(s) removed",
                        outcome.relinked,
                        outcome.lost,
                        outcome.ondisk_missing,
                        outcome.reverify,
                        outcome.dangling_removed
                    );
                }
                "clean-orphans" => {
                    let resolver = config.load_resolver()?;
                    let removed = fix::clean_orphans(&store, &resolver)?;
                    println!("clean-orphans: {removed} orphaned payload(s) removed");
                }
                "delete-not-in-request" => {
                    let index = config.index_updater();
                    let removed = fix::delete_not_in_request(&store, index.as_ref())?;
                    println!("delete-not-in-request: {removed} file(s) evicted");
                }
                "remove-duplicates" => {
                    let removed = fix::remove_duplicates(&store)?;
                    println!("remove-duplicates: {removed} duplicate row(s) removed");
                }
                "readd-missing" => {
                    let resolver = config.load_resolver()?;
                    let client = config.tape_client()?;
                    let added = fix::readd_missing_on_tape(
                        &store,
                        &resolver,
                        &client,
                        config.on_tape_url()?,
                        config.archive.min_file_size(),
                    )?;
                    println!("readd-missing: {added} file(s) re-added at ONTAPE");
                }
                "remap-misregistered" => {
                    let resolver = config.load_resolver()?;
                    let client = config.tape_client()?;
                    let remapped = fix::remap_misregistered(&store, &resolver, &client)?;
                    println!("remap-misregistered: {remapped} path(s) re-mapped");
                }
                "request-ondisk" => match fix::request_on_disk_files(&store)? {
                    Some(request_id) => {
                        println!("request-ondisk: stranded files swept into request {request_id}");
                    }
                    None => println!("request-ondisk: nothing stranded"),
                },
                "assign-restore-disk" => {
                    let assigned = assign_missing_restore_disk(&store)?;
                    println!("assign-restore-disk: {assigned} file(s) backfilled");
                }
                "recompute-disks" => {
                    recompute_all(&store)?;
                    println!("recompute-disks: done");
                }
                other => {
                    return Err(anyhow!(
                        "unknown fix `{other}`; see `nla fix --help` for the available repairs"
                    ));
                }
            }
        }
        Ok(())
    }
}
