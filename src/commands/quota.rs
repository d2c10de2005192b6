//! `quota` subcommand: show a user's quota and requests

use crate::{
    helpers::{bytes_size_to_string, table_with_titles},
    status_err, Application, NLA_APP,
};

use abscissa_core::{Command, Runnable, Shutdown};
use anyhow::{anyhow, Result};
use chrono::Utc;

use nla_core::api;

/// `quota` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct QuotaCmd {
    /// User to show
    #[clap(value_name = "USER")]
    user: String,

    /// Create a quota for the user instead of showing it
    #[clap(long, requires = "size")]
    create: bool,

    /// Quota size for --create (e.g. "1TiB")
    #[clap(long, value_name = "SIZE")]
    size: Option<bytesize::ByteSize>,

    /// Email address for --create, used for notifications
    #[clap(long, value_name = "EMAIL")]
    email: Option<String>,

    /// Notes for --create (affiliation, project, ...)
    #[clap(long, value_name = "NOTES")]
    notes: Option<String>,

    /// Output as JSON (the control-plane API representation)
    #[clap(long)]
    json: bool,
}

impl Runnable for QuotaCmd {
    fn run(&self) {
        if let Err(err) = self.inner_run() {
            status_err!("{}", err);
            NLA_APP.shutdown(Shutdown::Crash);
        };
    }
}

impl QuotaCmd {
    fn inner_run(&self) -> Result<()> {
        let config = NLA_APP.config();
        let store = config.open_store()?;

        if self.create {
            let size = self.size.unwrap_or_default();
            let quota = store.add_quota(
                &self.user,
                size.as_u64(),
                self.email.as_deref(),
                self.notes.as_deref(),
            )?;
            println!("created quota for {} ({size})", quota.user);
            return Ok(());
        }

        let detail = api::quota_detail(&store, &self.user, Utc::now())?
            .ok_or_else(|| anyhow!("no quota for user {}", self.user))?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&detail)?);
            return Ok(());
        }

        println!("quota for {}", detail.user);
        println!("  size:  {}", bytes_size_to_string(detail.size));
        println!("  used:  {}", bytes_size_to_string(detail.used));
        println!("  email: {}", detail.email.as_deref().unwrap_or("-"));
        if let Some(notes) = detail.notes.as_deref() {
            println!("  notes: {notes}");
        }

        let mut table = table_with_titles(["ID", "Label", "Request date", "Retention"]);
        for request in &detail.requests {
            _ = table.add_row([
                request.id.to_string(),
                request.label.clone().unwrap_or_default(),
                request.request_date.format("%Y-%m-%d %H:%M:%S").to_string(),
                request.retention.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
        }
        println!("{table}");
        Ok(())
    }
}
