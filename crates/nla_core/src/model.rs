//! Entities managed by the state store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RequestErrorKind, StoreErrorKind};

/// User reserved for internal requests created by the verifier and repairs.
pub const VERIFY_USER: &str = "_VERIFY";

/// The lifecycle stage of a [`TapeFile`].
///
/// The numeric codes are stored in the database; the one-letter codes are
/// used by the files query API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// registered by ingestion, checksum not yet confirmed
    Unverified,
    /// only the tape copy exists
    OnTape,
    /// part of a running retrieval
    Restoring,
    /// verified disk copy still present (pre-eviction)
    OnDisk,
    /// removed by explicit admin action
    Deleted,
    /// staged back to a restore disk, link published
    Restored,
}

/// All stages, in database-code order.
pub const ALL_STAGES: [Stage; 6] = [
    Stage::Unverified,
    Stage::OnTape,
    Stage::Restoring,
    Stage::OnDisk,
    Stage::Deleted,
    Stage::Restored,
];

impl Stage {
    /// The numeric code used in the database.
    pub fn code(self) -> i64 {
        match self {
            Self::Unverified => 0,
            Self::OnTape => 1,
            Self::Restoring => 2,
            Self::OnDisk => 3,
            Self::Deleted => 4,
            Self::Restored => 5,
        }
    }

    /// Convert a database code back into a stage.
    pub fn from_code(code: i64) -> Result<Self, StoreErrorKind> {
        Ok(match code {
            0 => Self::Unverified,
            1 => Self::OnTape,
            2 => Self::Restoring,
            3 => Self::OnDisk,
            4 => Self::Deleted,
            5 => Self::Restored,
            _ => return Err(StoreErrorKind::UnknownStage(code)),
        })
    }

    /// The one-letter code used by the files query API.
    pub fn letter(self) -> char {
        match self {
            Self::Unverified => 'U',
            Self::OnTape => 'T',
            Self::Restoring => 'A',
            Self::OnDisk => 'D',
            Self::Deleted => 'X',
            Self::Restored => 'R',
        }
    }

    /// Parse a one-letter API code.
    pub fn from_letter(letter: char) -> Result<Self, RequestErrorKind> {
        Ok(match letter {
            'U' => Self::Unverified,
            'T' => Self::OnTape,
            'A' => Self::Restoring,
            'D' => Self::OnDisk,
            'X' => Self::Deleted,
            'R' => Self::Restored,
            _ => return Err(RequestErrorKind::InvalidStageCode(letter)),
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unverified => "UNVERIFIED",
            Self::OnTape => "ONTAPE",
            Self::Restoring => "RESTORING",
            Self::OnDisk => "ONDISK",
            Self::Deleted => "DELETED",
            Self::Restored => "RESTORED",
        };
        f.write_str(name)
    }
}

/// A file whose primary copy lives on tape.
///
/// `logical_path` is the user-visible archive path and the unique identifier
/// of the file. `restore_disk` is set while the file is RESTORING or RESTORED.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapeFile {
    pub id: i64,
    pub logical_path: String,
    pub size: u64,
    pub verified: Option<DateTime<Utc>>,
    pub stage: Stage,
    pub restore_disk: Option<i64>,
}

impl fmt::Display for TapeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.logical_path, self.stage)
    }
}

/// An allocated area of disk holding restored files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreDisk {
    pub id: i64,
    /// e.g. `/badc/restore_1`
    pub mountpoint: String,
    pub allocated_bytes: u64,
    /// maintained by [`crate::allocator::recompute_used`]
    pub used_bytes: u64,
}

impl RestoreDisk {
    /// Free capacity left on this disk.
    pub fn free_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.used_bytes)
    }
}

/// A user's staging quota.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quota {
    pub id: i64,
    pub user: String,
    pub size: u64,
    pub email: Option<String>,
    pub notes: Option<String>,
}

/// A retention-bounded request to stage files from tape.
///
/// `request_files` and `request_patterns` record what the user asked for;
/// the resolved set of [`TapeFile`]s currently known to the system is kept
/// in the `request_file` mapping table and only ever grows (eviction is the
/// tidy task's job).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TapeRequest {
    pub id: i64,
    pub label: Option<String>,
    pub quota_id: i64,
    pub retention: DateTime<Utc>,
    pub request_date: DateTime<Utc>,
    pub active: bool,
    /// requested logical paths, parsed from the newline-delimited payload
    pub request_files: Vec<String>,
    /// substring pattern to match against logical paths
    pub request_patterns: Option<String>,
    pub notify_first: Option<String>,
    pub notify_last: Option<String>,
    pub storaged_start: Option<DateTime<Utc>>,
    pub storaged_end: Option<DateTime<Utc>>,
    pub first_on_disk: Option<DateTime<Utc>>,
    pub last_on_disk: Option<DateTime<Utc>>,
}

impl TapeRequest {
    /// A request is a pattern request when it carries a non-empty pattern.
    pub fn is_pattern_request(&self) -> bool {
        self.request_patterns.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// The label shown in listings: the user label, else the pattern, else
    /// the first requested file.
    pub fn display_label(&self) -> &str {
        if let Some(label) = self.label.as_deref() {
            if !label.is_empty() {
                return label;
            }
        }
        if let Some(pattern) = self.request_patterns.as_deref() {
            if !pattern.is_empty() {
                return pattern;
            }
        }
        self.request_files
            .first()
            .map_or("<no files requested>", String::as_str)
    }

    /// Render the requested paths back into the newline-delimited wire form.
    pub fn request_files_blob(&self) -> String {
        let mut blob = self.request_files.join("\n");
        if !blob.is_empty() {
            blob.push('\n');
        }
        blob
    }
}

/// Parse the newline-delimited request payload into a list of paths.
pub fn parse_request_files(blob: &str) -> Vec<String> {
    blob.split_whitespace().map(str::to_string).collect()
}

/// A seat in the retrieval pool.
///
/// `pid`, `host` and `request_dir` are set together once a retrieval has
/// been started for the loaded request, and cleared together when the slot
/// is freed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub id: i64,
    pub tape_request: Option<i64>,
    pub pid: Option<u32>,
    pub host: Option<String>,
    pub request_dir: Option<String>,
}

impl Slot {
    /// A slot is free when no request is loaded into it.
    pub fn is_free(&self) -> bool {
        self.tape_request.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stage_codes_roundtrip() {
        for stage in ALL_STAGES {
            assert_eq!(Stage::from_code(stage.code()).unwrap(), stage);
            assert_eq!(Stage::from_letter(stage.letter()).unwrap(), stage);
        }
        assert!(Stage::from_code(42).is_err());
        assert!(Stage::from_letter('Z').is_err());
    }

    #[test]
    fn request_files_blob_roundtrip() {
        let files = parse_request_files("/badc/a/x.dat\n/badc/a/y.dat\n");
        assert_eq!(files, vec!["/badc/a/x.dat", "/badc/a/y.dat"]);
        let req = TapeRequest {
            id: 1,
            label: None,
            quota_id: 1,
            retention: Utc::now(),
            request_date: Utc::now(),
            active: false,
            request_files: files,
            request_patterns: None,
            notify_first: None,
            notify_last: None,
            storaged_start: None,
            storaged_end: None,
            first_on_disk: None,
            last_on_disk: None,
        };
        assert_eq!(req.request_files_blob(), "/badc/a/x.dat\n/badc/a/y.dat\n");
        assert_eq!(req.display_label(), "/badc/a/x.dat");
    }
}
