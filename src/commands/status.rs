//! `status` subcommand: per-stage file counts and sizes

use crate::{
    helpers::{bytes_size_to_string, table_right_from},
    status_err, Application, NLA_APP,
};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;

use nla_core::api;

/// `status` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct StatusCmd {}

impl Runnable for StatusCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl StatusCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;

        let status = api::archive_status(&store)?;
        let mut table = table_right_from(1, ["Stage", "Files", "Size"]);
        let mut total_count = 0;
        let mut total_bytes = 0;
        for stage in &status {
            _ = table.add_row([
                stage.stage.clone(),
                stage.count.to_string(),
                bytes_size_to_string(stage.bytes),
            ]);
            total_count += stage.count;
            total_bytes += stage.bytes;
        }
        _ = table.add_row([
            "total".to_string(),
            total_count.to_string(),
            bytes_size_to_string(total_bytes),
        ]);
        println!("{table}");
        Ok(())
    }
}
