//! `disks` subcommand: list or register restore disks

use crate::{
    helpers::{bytes_size_to_string, table_right_from},
    status_err, Application, NLA_APP,
};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;
use bytesize::ByteSize;

use nla_core::recompute_used;

/// `disks` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct DisksCmd {
    /// Register a new restore disk at this mountpoint
    #[clap(long, value_name = "MOUNTPOINT", requires = "size")]
    add: Option<String>,

    /// Allocated size of the new restore disk (e.g. "500GiB")
    #[clap(long, value_name = "SIZE")]
    size: Option<ByteSize>,

    /// Recompute the used bytes of every disk from the restored files
    #[clap(long)]
    recompute: bool,
}

impl Runnable for DisksCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl DisksCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;

        if let Some(mountpoint) = self.add.as_deref() {
            let size = self.size.unwrap_or_default();
            let disk = store.add_disk(mountpoint, size.as_u64())?;
            println!("added restore disk {} ({})", disk.mountpoint, size);
        }

        let mut table = table_right_from(1, ["Mountpoint", "Allocated", "Used", "Free"]);
        for disk in store.disks()? {
            let used = if self.recompute {
                recompute_used(&store, disk.id)?
            } else {
                disk.used_bytes
            };
            _ = table.add_row([
                disk.mountpoint.clone(),
                bytes_size_to_string(disk.allocated_bytes),
                bytes_size_to_string(used),
                bytes_size_to_string(disk.allocated_bytes.saturating_sub(used)),
            ]);
        }
        println!("{table}");
        Ok(())
    }
}
