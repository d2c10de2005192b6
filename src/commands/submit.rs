//! `submit` subcommand: create a tape staging request

use crate::{status_err, Application, NLA_APP};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::Result;
use chrono::Utc;

use nla_core::api::{self, SubmitRequest};

/// `submit` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct SubmitCmd {
    /// User (quota) the request is made under
    #[clap(long, value_name = "USER")]
    quota: String,

    /// Logical path to stage (can be given multiple times)
    #[clap(long = "file", value_name = "PATH", conflicts_with = "pattern")]
    files: Vec<String>,

    /// Substring pattern selecting the files to stage
    #[clap(long, value_name = "PATTERN")]
    pattern: Option<String>,

    /// Retention date (YYYY-MM-DD) [default: five days from now]
    #[clap(long, value_name = "DATE")]
    retention: Option<String>,

    /// Human readable label for the request
    #[clap(long, value_name = "LABEL")]
    label: Option<String>,

    /// Email address notified when the first file arrives on disk
    #[clap(long, value_name = "EMAIL")]
    notify_first: Option<String>,

    /// Email address notified when the request completes
    #[clap(long, value_name = "EMAIL")]
    notify_last: Option<String>,
}

impl Runnable for SubmitCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl SubmitCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;

        let submit = SubmitRequest {
            quota: self.quota.clone(),
            patterns: self.pattern.clone(),
            files: (!self.files.is_empty()).then(|| self.files.clone()),
            retention: self.retention.clone(),
            label: self.label.clone(),
            notify_on_first_file: self.notify_first.clone(),
            notify_on_last_file: self.notify_last.clone(),
        };
        let request_id = api::submit_request(&store, &submit, Utc::now())?;
        println!("created request {request_id}");
        Ok(())
    }
}
