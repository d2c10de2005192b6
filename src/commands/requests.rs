//! `requests` subcommand: list requests or show one in full

use crate::{helpers::table_with_titles, status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::{anyhow, Result};

use nla_core::api;

/// `requests` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct RequestsCmd {
    /// Show this request in full instead of listing all requests
    #[clap(value_name = "ID")]
    id: Option<i64>,

    /// Output as JSON (the control-plane API representation)
    #[clap(long)]
    json: bool,
}

impl Runnable for RequestsCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

/// How many files of a request the detail view prints.
const MAX_LISTED_FILES: usize = 100;

impl RequestsCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;

        match self.id {
            Some(id) => {
                let detail = api::get_request(&store, id)?
                    .ok_or_else(|| anyhow!("no request with id {id}"))?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&detail)?);
                    return Ok(());
                }
                println!("request {}", detail.id);
                println!("  user:          {}", detail.quota);
                println!("  label:         {}", detail.label.as_deref().unwrap_or("-"));
                println!("  request date:  {}", detail.request_date);
                println!("  retention:     {}", detail.retention);
                if let Some(pattern) = detail.request_patterns.as_deref() {
                    println!("  pattern:       {pattern}");
                }
                if let Some(start) = detail.storaged_request_start {
                    println!("  storaged from: {start}");
                }
                if let Some(end) = detail.storaged_request_end {
                    println!("  storaged to:   {end}");
                }
                println!("  files ({}):", detail.files.len());
                for file in detail.files.iter().take(MAX_LISTED_FILES) {
                    println!("    {file}");
                }
                if detail.files.len() > MAX_LISTED_FILES {
                    println!("    ... and {} more", detail.files.len() - MAX_LISTED_FILES);
                }
            }
            None => {
                let requests = api::list_requests(&store)?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&requests)?);
                    return Ok(());
                }
                let mut table = table_with_titles(["ID", "User", "Label", "Request date", "Retention"]);
                for request in &requests {
                    _ = table.add_row([
                        request.id.to_string(),
                        request.quota.clone(),
                        request.label.clone().unwrap_or_default(),
                        request.request_date.format("%Y-%m-%d %H:%M:%S").to_string(),
                        request.retention.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ]);
                }
                println!("{table}");
                println!("{} request(s)", requests.len());
            }
        }
        Ok(())
    }
}
