//! NLA Config
//!
//! Command-line options and the `nla.toml` profile merged into one
//! configuration value. See instructions in `commands.rs` to specify the
//! path to your application's configuration file.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    path::PathBuf,
    time::Duration,
};

use abscissa_core::{config::Config, FrameworkError};
use clap::Parser;
use directories::ProjectDirs;
use itertools::Itertools;
use log::Level;
use merge::Merge;
use serde::{Deserialize, Serialize};

use nla_core::{
    ConfigErrorKind, HttpIndexUpdater, IndexUpdater, IngestSettings, NlaResult, NoopIndexUpdater,
    PathResolver, RetrieveSettings, Store, TapeClient, TidySettings, VerifySettings,
};

/// Where the signpost links point unless configured otherwise.
const DEFAULT_SIGNPOST_TARGET: &str = "/badc/ARCHIVE_INFO/FILES_ON_TAPE.txt";

/// Ingestion threshold: smaller files are not worth a tape round-trip.
const DEFAULT_MIN_FILE_SIZE: u64 = 30 * 1024 * 1024;

/// NLA Configuration
#[derive(Clone, Default, Debug, Parser, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct NlaConfig {
    /// Global options
    #[clap(flatten, next_help_heading = "Global options")]
    pub global: GlobalOptions,

    /// State store options
    #[clap(flatten, next_help_heading = "Store options")]
    pub store: StoreOptions,

    /// Archive endpoints and layout
    #[clap(flatten, next_help_heading = "Archive options")]
    pub archive: ArchiveOptions,

    /// Retrieval options
    #[clap(flatten, next_help_heading = "Retrieval options")]
    pub retrieval: RetrievalOptions,

    /// Verification options
    #[clap(flatten, next_help_heading = "Verification options")]
    pub verify: VerifyOptions,
}

impl Display for NlaConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let config = toml::to_string_pretty(self)
            .unwrap_or_else(|_| "<Error serializing config>".to_string());

        write!(f, "{config}")
    }
}

/// Global options
///
/// These options are available for all commands.
#[derive(Default, Debug, Parser, Clone, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct GlobalOptions {
    /// Config profile to use. This parses the file `<PROFILE>.toml` in the config directory.
    /// [default: "nla"]
    #[clap(
        short = 'P',
        long = "use-profile",
        global = true,
        value_name = "PROFILE",
        env = "NLA_USE_PROFILE"
    )]
    pub use_profile: Option<String>,

    /// Use this log level [default: info]
    #[clap(long, global = true, env = "NLA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Write log messages to the given file instead of printing them.
    ///
    /// # Note
    ///
    /// Warnings and errors are still additionally printed unless they are ignored by `--log-level`
    #[clap(long, global = true, env = "NLA_LOG_FILE", value_name = "LOGFILE")]
    pub log_file: Option<PathBuf>,

    /// List of environment variables to set (only in config file)
    #[clap(skip)]
    #[merge(strategy = extend_btreemap)]
    pub env: BTreeMap<String, String>,
}

fn extend_btreemap(left: &mut BTreeMap<String, String>, right: BTreeMap<String, String>) {
    for (key, value) in right {
        _ = left.entry(key).or_insert(value);
    }
}

/// State store options
#[derive(Default, Debug, Parser, Clone, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreOptions {
    /// Path of the SQLite state store [default: /var/lib/nla/nla.db]
    #[clap(long, global = true, value_name = "PATH", env = "NLA_DB_PATH")]
    pub db_path: Option<PathBuf>,
}

impl StoreOptions {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/lib/nla/nla.db"))
    }
}

/// Archive endpoints and layout
#[derive(Default, Debug, Parser, Clone, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ArchiveOptions {
    /// Endpoint mapping spot names to fileset logical paths
    #[clap(long, global = true, value_name = "URL", env = "NLA_DOWNLOAD_CONF")]
    pub download_conf_url: Option<String>,

    /// Endpoint mapping storage paths to spot names
    #[clap(long, global = true, value_name = "URL", env = "NLA_STORAGE_PATHS_URL")]
    pub spotlist_url: Option<String>,

    /// Endpoint listing the filesets whose primary copy is tape
    #[clap(long, global = true, value_name = "URL", env = "NLA_ON_TAPE_URL")]
    pub on_tape_url: Option<String>,

    /// Search index endpoint notified about file location changes
    #[clap(long, global = true, value_name = "URL", env = "NLA_INDEX_URL")]
    pub index_url: Option<String>,

    /// Smallest file worth ingesting, in bytes [default: 30 MiB]
    #[clap(long, global = true, value_name = "BYTES", env = "NLA_MIN_FILE_SIZE")]
    pub min_file_size: Option<u64>,

    /// What the `00FILES_ON_TAPE` signpost links point at
    #[clap(long, global = true, value_name = "PATH", env = "NLA_SIGNPOST_TARGET")]
    pub signpost_target: Option<PathBuf>,
}

impl ArchiveOptions {
    pub fn min_file_size(&self) -> u64 {
        self.min_file_size.unwrap_or(DEFAULT_MIN_FILE_SIZE)
    }
}

/// Retrieval options
#[derive(Default, Debug, Parser, Clone, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RetrievalOptions {
    /// Size of the retrieval slot pool [default: 5]
    #[clap(long, global = true, value_name = "N", env = "NLA_STORAGED_SLOTS")]
    pub slots: Option<usize>,

    /// How many slots one user may occupy at a time [default: 2]
    #[clap(long, global = true, value_name = "N", env = "NLA_MAX_SLOTS_PER_USER")]
    pub max_slots_per_user: Option<u64>,

    /// Host of the tape retrieval service, passed to `sd_get -h`
    #[clap(long, global = true, value_name = "HOST", env = "NLA_SD_HOST")]
    pub sd_host: Option<String>,

    /// The `sd_get` executable [default: sd_get]
    #[clap(long, global = true, value_name = "COMMAND", env = "NLA_SD_GET")]
    pub sd_get_command: Option<PathBuf>,

    /// The `sd_ls` executable [default: sd_ls]
    #[clap(long, global = true, value_name = "COMMAND", env = "NLA_SD_LS")]
    pub sd_ls_command: Option<PathBuf>,

    /// Directory holding the task lock files [default: a per-host temp dir]
    #[clap(long, global = true, value_name = "PATH", env = "NLA_LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Seconds between retrieval log polls [default: 10]
    #[clap(long, global = true, value_name = "SECS", env = "NLA_POLL_SECS")]
    pub poll_secs: Option<u64>,

    /// Run against the tape emulator: logical paths are used verbatim on
    /// the tape side and the test log format is expected
    #[clap(long, global = true, env = "NLA_TEST_VERSION")]
    #[merge(strategy = merge::bool::overwrite_false)]
    pub test_mode: bool,
}

impl RetrievalOptions {
    pub fn slots(&self) -> usize {
        self.slots.unwrap_or(5)
    }

    pub fn max_slots_per_user(&self) -> u64 {
        self.max_slots_per_user.unwrap_or(2)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nla-locks"))
    }
}

/// Verification options
#[derive(Default, Debug, Parser, Clone, Deserialize, Serialize, Merge)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct VerifyOptions {
    /// Directory holding the `<spot>.chksums.*` log files
    #[clap(long, global = true, value_name = "PATH", env = "NLA_CHKSUMSDIR")]
    pub chksums_dir: Option<PathBuf>,

    /// Restore-cache root the checksum logs address files under
    /// [default: /datacentre/restorecache/archive]
    #[clap(long, global = true, value_name = "PATH", env = "NLA_VERIFY_CACHE_PREFIX")]
    pub cache_prefix: Option<String>,

    /// Logical-path prefix eligible for quick verification (can be given
    /// multiple times)
    #[clap(long = "quick-prefix", global = true, value_name = "PREFIX")]
    #[merge(strategy = merge::vec::overwrite_empty)]
    pub quick_prefixes: Vec<String>,
}

impl NlaConfig {
    /// Merge the profile's config file into this config, if one exists.
    pub fn merge_profile(
        &mut self,
        profile: &str,
        merge_logs: &mut Vec<(Level, String)>,
    ) -> Result<(), FrameworkError> {
        let profile_filename = profile.to_string() + ".toml";
        let paths = get_config_paths(&profile_filename);

        if let Some(path) = paths.iter().find(|path| path.exists()) {
            merge_logs.push((Level::Info, format!("using config {}", path.display())));
            let config_content = std::fs::read_to_string(path)?;
            let config = Self::load_toml(config_content)?;
            self.merge(config);
        } else {
            let paths_string = paths.iter().map(|path| path.display()).join(", ");
            merge_logs.push((
                Level::Info,
                format!("using no config file, none of these exist: {paths_string}"),
            ));
        }
        Ok(())
    }

    /// Open the state store, creating its directory on first use.
    pub fn open_store(&self) -> NlaResult<Store> {
        let path = self.store.db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Store::open(path)
    }

    /// Fetch the resolver tables and build a [`PathResolver`].
    pub fn load_resolver(&self) -> NlaResult<PathResolver> {
        let download_conf = self
            .archive
            .download_conf_url
            .as_deref()
            .ok_or(ConfigErrorKind::MissingSetting("download-conf-url"))?;
        let spotlist = self
            .archive
            .spotlist_url
            .as_deref()
            .ok_or(ConfigErrorKind::MissingSetting("spotlist-url"))?;
        PathResolver::load(download_conf, spotlist)
    }

    /// How to reach the tape tools.
    pub fn tape_client(&self) -> NlaResult<TapeClient> {
        let sd_host = match self.retrieval.sd_host.clone() {
            Some(host) => host,
            None if self.retrieval.test_mode => "sd-test".to_string(),
            None => return Err(ConfigErrorKind::MissingSetting("sd-host").into()),
        };
        Ok(TapeClient {
            sd_get: self
                .retrieval
                .sd_get_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("sd_get")),
            sd_ls: self
                .retrieval
                .sd_ls_command
                .clone()
                .unwrap_or_else(|| PathBuf::from("sd_ls")),
            sd_host,
            test_mode: self.retrieval.test_mode,
        })
    }

    pub fn retrieve_settings(&self) -> NlaResult<RetrieveSettings> {
        Ok(RetrieveSettings {
            client: self.tape_client()?,
            poll: Duration::from_secs(self.retrieval.poll_secs.unwrap_or(10)),
        })
    }

    pub fn verify_settings(&self) -> NlaResult<VerifySettings> {
        let chksums_dir = self
            .verify
            .chksums_dir
            .clone()
            .ok_or(ConfigErrorKind::MissingSetting("chksums-dir"))?;
        Ok(VerifySettings {
            chksums_dir,
            cache_prefix: self
                .verify
                .cache_prefix
                .clone()
                .unwrap_or_else(|| "/datacentre/restorecache/archive".to_string()),
            quick_prefixes: self.verify.quick_prefixes.clone(),
            test_mode: self.retrieval.test_mode,
        })
    }

    pub fn tidy_settings(&self) -> TidySettings {
        TidySettings {
            signpost_target: if self.retrieval.test_mode {
                None
            } else {
                Some(
                    self.archive
                        .signpost_target
                        .clone()
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_SIGNPOST_TARGET)),
                )
            },
        }
    }

    pub fn ingest_settings(&self) -> NlaResult<IngestSettings> {
        let on_tape_url = self
            .archive
            .on_tape_url
            .clone()
            .ok_or(ConfigErrorKind::MissingSetting("on-tape-url"))?;
        Ok(IngestSettings {
            on_tape_url,
            min_file_size: self.archive.min_file_size(),
        })
    }

    pub fn on_tape_url(&self) -> NlaResult<&str> {
        self.archive
            .on_tape_url
            .as_deref()
            .ok_or_else(|| ConfigErrorKind::MissingSetting("on-tape-url").into())
    }

    /// The search index updater, or a no-op when no endpoint is configured.
    pub fn index_updater(&self) -> Box<dyn IndexUpdater> {
        match self.archive.index_url.as_deref() {
            Some(url) => Box::new(HttpIndexUpdater::new(url)),
            None => Box::new(NoopIndexUpdater),
        }
    }
}

/// Get the paths to the config file
///
/// # Arguments
///
/// * `filename` - name of the config file
fn get_config_paths(filename: &str) -> Vec<PathBuf> {
    [
        ProjectDirs::from("", "", "nla").map(|project_dirs| project_dirs.config_dir().to_path_buf()),
        get_global_config_path(),
        Some(PathBuf::from(".")),
    ]
    .into_iter()
    .filter_map(|path| {
        path.map(|mut p| {
            p.push(filename);
            p
        })
    })
    .collect()
}

/// Get the path to the global config directory.
fn get_global_config_path() -> Option<PathBuf> {
    Some(PathBuf::from("/etc/nla"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn profile_fills_gaps_but_never_overrides_cli() {
        let mut config = NlaConfig::default();
        config.retrieval.slots = Some(7);
        let profile: NlaConfig = toml::from_str(
            "[retrieval]\nslots = 3\nsd-host = \"sd-retrieval.example.ac.uk\"\n\
             [store]\ndb-path = \"/var/lib/nla/nla.db\"\n",
        )
        .unwrap();
        config.merge(profile);
        // CLI value wins, profile fills the rest
        assert_eq!(config.retrieval.slots(), 7);
        assert_eq!(
            config.retrieval.sd_host.as_deref(),
            Some("sd-retrieval.example.ac.uk")
        );
        assert_eq!(config.store.db_path(), PathBuf::from("/var/lib/nla/nla.db"));
    }

    #[test]
    fn defaults_match_the_documented_config_surface() {
        let config = NlaConfig::default();
        assert_eq!(config.retrieval.slots(), 5);
        assert_eq!(config.retrieval.max_slots_per_user(), 2);
        assert_eq!(config.archive.min_file_size(), 30 * 1024 * 1024);
    }

    #[test]
    fn config_display_roundtrips_through_toml() {
        let config = NlaConfig::default();
        let rendered = config.to_string();
        let reparsed: NlaConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.retrieval.slots(), config.retrieval.slots());
    }
}
