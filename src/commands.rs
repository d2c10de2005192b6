//! NLA Subcommands

pub(crate) mod disks;
pub(crate) mod files;
pub(crate) mod fix;
pub(crate) mod ingest;
pub(crate) mod process;
pub(crate) mod quota;
pub(crate) mod requests;
pub(crate) mod retrieve;
pub(crate) mod show_config;
pub(crate) mod status;
pub(crate) mod submit;
pub(crate) mod tidy;
pub(crate) mod verify;

use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{
    commands::{
        disks::DisksCmd, files::FilesCmd, fix::FixCmd, ingest::IngestCmd, process::ProcessCmd,
        quota::QuotaCmd, requests::RequestsCmd, retrieve::RetrieveCmd,
        show_config::ShowConfigCmd, status::StatusCmd, submit::SubmitCmd, tidy::TidyCmd,
        verify::VerifyCmd,
    },
    config::NlaConfig,
    Application, NLA_APP,
};

use abscissa_core::{
    terminal::ColorChoice, Command, Configurable, FrameworkError, FrameworkErrorKind, Runnable,
    Shutdown,
};
use log::log;
use simplelog::{CombinedLogger, LevelFilter, TermLogger, TerminalMode, WriteLogger};

/// NLA Subcommands
/// Subcommands need to be listed in an enum.
#[derive(clap::Parser, Command, Debug, Runnable)]
enum NlaCmd {
    /// Update requests against the tape inventory and load the retrieval slots
    Process(Box<ProcessCmd>),

    /// Run one retrieval tick: start or check one slot's tape retrieval
    Retrieve(Box<RetrieveCmd>),

    /// Evict expired requests back to tape
    Tidy(Box<TidyCmd>),

    /// Verify newly ingested files against the checksum logs
    Verify(Box<VerifyCmd>),

    /// Register files from tape-only filesets with the archive
    Ingest(Box<IngestCmd>),

    /// Run reconciliation repairs against database/disk drift
    Fix(Box<FixCmd>),

    /// Submit a tape staging request
    Submit(Box<SubmitCmd>),

    /// List requests or show one request in full
    Requests(Box<RequestsCmd>),

    /// Show a user's quota and requests, or create a quota
    Quota(Box<QuotaCmd>),

    /// List or register restore disks
    Disks(Box<DisksCmd>),

    /// Query files by substring and stage
    Files(Box<FilesCmd>),

    /// Show per-stage file counts and sizes
    Status(Box<StatusCmd>),

    /// Show the configuration which has been read from the config file(s)
    ShowConfig(Box<ShowConfigCmd>),
}

/// Entry point for the application. It needs to be a struct to allow using subcommands!
#[derive(clap::Parser, Command, Debug)]
#[command(author, about, name = "nla", version)]
pub struct EntryPoint {
    #[command(flatten)]
    pub config: NlaConfig,

    #[command(subcommand)]
    commands: NlaCmd,
}

impl Runnable for EntryPoint {
    fn run(&self) {
        // Run the subcommand
        self.commands.run();
        NLA_APP.shutdown(Shutdown::Graceful)
    }
}

/// This trait allows you to define how application configuration is loaded.
impl Configurable<NlaConfig> for EntryPoint {
    /// Location of the configuration file
    fn config_path(&self) -> Option<PathBuf> {
        // The config is not read here but in `process_config()`, merged with
        // the CLI options.
        None
    }

    /// Apply changes to the config after it's been loaded, e.g. overriding
    /// values in a config file using command-line options.
    fn process_config(&self, _config: NlaConfig) -> Result<NlaConfig, FrameworkError> {
        let mut config = self.config.clone();

        // collect logs during merging as we start the logger *after* merging
        let mut merge_logs = Vec::new();

        let profile = config
            .global
            .use_profile
            .clone()
            .unwrap_or_else(|| "nla".to_string());
        config.merge_profile(&profile, &mut merge_logs)?;

        // start logger
        let level_filter = match &config.global.log_level {
            Some(level) => LevelFilter::from_str(level)
                .map_err(|e| FrameworkErrorKind::ConfigError.context(e))?,
            None => LevelFilter::Info,
        };
        let term_config = simplelog::ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build();
        match &config.global.log_file {
            None => TermLogger::init(
                level_filter,
                term_config,
                TerminalMode::Stderr,
                ColorChoice::Auto,
            )
            .map_err(|e| FrameworkErrorKind::ConfigError.context(e))?,

            Some(file) => {
                let file_config = simplelog::ConfigBuilder::new()
                    .set_time_format_rfc3339()
                    .build();
                let file = File::options()
                    .create(true)
                    .append(true)
                    .open(file)
                    .map_err(|e| {
                        FrameworkErrorKind::PathError {
                            name: Some(file.clone()),
                        }
                        .context(e)
                    })?;
                let term_logger = TermLogger::new(
                    level_filter.min(LevelFilter::Warn),
                    term_config,
                    TerminalMode::Stderr,
                    ColorChoice::Auto,
                );
                CombinedLogger::init(vec![
                    term_logger,
                    WriteLogger::new(level_filter, file_config, file),
                ])
                .map_err(|e| FrameworkErrorKind::ConfigError.context(e))?;
            }
        }

        // display logs from merging
        for (level, merge_log) in merge_logs {
            log!(level, "{}", merge_log);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::EntryPoint;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        EntryPoint::command().debug_assert();
    }
}
