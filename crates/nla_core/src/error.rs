//! Error types and Result module.

use std::{num::TryFromIntError, path::PathBuf};

use displaydoc::Display;
use thiserror::Error;

/// Result type that is being returned from methods that can fail and thus have [`NlaError`]s.
pub type NlaResult<T> = Result<T, NlaError>;

// [`Error`] is public, but opaque and easy to keep compatible.
#[derive(Error, Debug)]
#[error(transparent)]
/// Errors that can result from nla.
pub struct NlaError(#[from] NlaErrorKind);

// Accessors for anything we do want to expose publicly.
impl NlaError {
    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    pub fn into_inner(self) -> NlaErrorKind {
        self.0
    }

    /// Borrow the inner error kind.
    pub fn kind(&self) -> &NlaErrorKind {
        &self.0
    }
}

/// [`NlaErrorKind`] describes the errors that can happen while executing a high-level task.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NlaErrorKind {
    /// [`ConfigErrorKind`] describes the errors that can happen while assembling the task configuration
    #[error(transparent)]
    Config(#[from] ConfigErrorKind),

    /// [`ResolverErrorKind`] describes the errors that can be returned by the path resolver
    #[error(transparent)]
    Resolver(#[from] ResolverErrorKind),

    /// [`StoreErrorKind`] describes the errors that can be returned by the state store
    #[error(transparent)]
    Store(#[from] StoreErrorKind),

    /// [`TapeErrorKind`] describes the errors that can be returned by the tape client adapter
    #[error(transparent)]
    Tape(#[from] TapeErrorKind),

    /// [`RequestErrorKind`] describes the errors that can be returned while handling user requests
    #[error(transparent)]
    Request(#[from] RequestErrorKind),

    /// [`RetrieveErrorKind`] describes the errors that can be returned by the retrieval executor
    #[error(transparent)]
    Retrieve(#[from] RetrieveErrorKind),

    /// [`GuardErrorKind`] describes the errors that can be returned by the task re-entry guard
    #[error(transparent)]
    Guard(#[from] GuardErrorKind),

    /// [`std::io::Error`]
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// [`ConfigErrorKind`] describes the errors that can happen while assembling the task configuration
#[derive(Error, Debug, Display)]
pub enum ConfigErrorKind {
    /// missing required setting `{0}`
    MissingSetting(&'static str),
    /// invalid value for `{0}`: {1}
    InvalidValue(&'static str, String),
}

/// [`ResolverErrorKind`] describes the errors that can be returned by the path resolver
#[derive(Error, Debug, Display)]
pub enum ResolverErrorKind {
    /// file {0} has no associated fileset
    NoFilesetForPath(String),
    /// no storage path known for spot `{0}`
    UnknownSpot(String),
    /// cannot fetch url {url}: status {status}
    FetchFailed {
        /// url of the table
        url: String,
        /// HTTP status returned
        status: u16,
    },
    /// malformed table line: `{0}`
    MalformedLine(String),
    /// reqwest error: {0:?}
    FromReqwestError(#[from] reqwest::Error),
}

/// [`StoreErrorKind`] describes the errors that can be returned by the state store
#[derive(Error, Debug, Display)]
pub enum StoreErrorKind {
    /// no quota for user {0}
    NoQuotaForUser(String),
    /// no request with id {0}
    NoSuchRequest(i64),
    /// no slot with id {0}
    NoSuchSlot(i64),
    /// no restore disk with id {0}
    NoSuchDisk(i64),
    /// timestamp {0} out of range
    TimestampOutOfRange(i64),
    /// unknown stage code {0}
    UnknownStage(i64),
    /// sqlite error: {0:?}
    FromSqlite(#[from] rusqlite::Error),
    /// conversion error: {0:?}
    FromTryFromIntError(#[from] TryFromIntError),
}

/// [`TapeErrorKind`] describes the errors that can be returned by the tape client adapter
#[derive(Error, Debug, Display)]
pub enum TapeErrorKind {
    /// spot `{0}` is not known to the tape system
    SpotUnknown(String),
    /// cannot spawn tape client `{command}`: {source:?}
    SpawnFailed {
        /// the command that failed to start
        command: String,
        /// the underlying io error
        source: std::io::Error,
    },
    /// tape client output is not utf-8
    OutputNotUtf8,
    /// cannot fetch url {url}: status {status}
    FetchFailed {
        /// url of the listing
        url: String,
        /// HTTP status returned
        status: u16,
    },
    /// reqwest error: {0:?}
    FromReqwestError(#[from] reqwest::Error),
}

/// [`RequestErrorKind`] describes the errors that can be returned while handling user requests
#[derive(Error, Debug, Display)]
pub enum RequestErrorKind {
    /// Requested file(s) exceed user's quota
    QuotaExceeded,
    /// No quota for user {0}
    NoQuotaForUser(String),
    /// request needs either files or a pattern
    EmptyRequest,
    /// invalid retention date `{0}`
    InvalidRetention(String),
    /// invalid stage code `{0}`
    InvalidStageCode(char),
}

/// [`RetrieveErrorKind`] describes the errors that can be returned by the retrieval executor
#[derive(Error, Debug, Display)]
pub enum RetrieveErrorKind {
    /// target {0} exists and is not a link
    LinkConflict(PathBuf),
    /// slot {0} has no request loaded
    SlotEmpty(i64),
    /// retrieval log {0} never appeared
    LogMissing(PathBuf),
}

/// [`GuardErrorKind`] describes the errors that can be returned by the task re-entry guard
#[derive(Error, Debug, Display)]
pub enum GuardErrorKind {
    /// task `{0}` is already running
    Busy(String),
    /// cannot create lock file {path:?}: {source:?}
    LockFile {
        /// path of the lock file
        path: PathBuf,
        /// the underlying io error
        source: std::io::Error,
    },
}

trait NlaErrorMarker: std::error::Error {}

impl NlaErrorMarker for ConfigErrorKind {}
impl NlaErrorMarker for ResolverErrorKind {}
impl NlaErrorMarker for StoreErrorKind {}
impl NlaErrorMarker for TapeErrorKind {}
impl NlaErrorMarker for RequestErrorKind {}
impl NlaErrorMarker for RetrieveErrorKind {}
impl NlaErrorMarker for GuardErrorKind {}
impl NlaErrorMarker for std::io::Error {}

impl<E> From<E> for NlaError
where
    E: NlaErrorMarker,
    NlaErrorKind: From<E>,
{
    fn from(value: E) -> Self {
        Self(NlaErrorKind::from(value))
    }
}
