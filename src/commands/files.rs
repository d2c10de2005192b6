//! `files` subcommand: query files by substring and stage

use crate::{
    helpers::{bytes_size_to_string, table_right_from},
    status_err, Application, NLA_APP,
};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;

use nla_core::api;

/// `files` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct FilesCmd {
    /// Substring to match against logical paths
    #[clap(long = "match", value_name = "SUBSTRING", default_value = "")]
    matching: String,

    /// Stages to include, any subset of UDTARX
    #[clap(long, value_name = "STAGES", default_value = "UDTAR")]
    stages: String,

    /// Resolve and show each file's spot name
    #[clap(long)]
    spot: bool,

    /// Output as JSON (the control-plane API representation)
    #[clap(long)]
    json: bool,
}

impl Runnable for FilesCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl FilesCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;
        let resolver = if self.spot {
            Some(config.load_resolver()?)
        } else {
            None
        };

        let query = api::find_files(&store, &self.matching, &self.stages, resolver.as_ref())?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&query)?);
            return Ok(());
        }

        let mut table = if self.spot {
            table_right_from(3, ["Path", "Stage", "Spot", "Size"])
        } else {
            table_right_from(2, ["Path", "Stage", "Size"])
        };
        for file in &query.files {
            if self.spot {
                _ = table.add_row([
                    file.path.clone(),
                    file.stage.to_string(),
                    file.spot_name.clone().unwrap_or_default(),
                    bytes_size_to_string(file.size),
                ]);
            } else {
                _ = table.add_row([
                    file.path.clone(),
                    file.stage.to_string(),
                    bytes_size_to_string(file.size),
                ]);
            }
        }
        println!("{table}");
        println!("{} file(s)", query.count);
        Ok(())
    }
}
