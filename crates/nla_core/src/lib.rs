/*!
A library implementing the Near-Line Archive (NLA) control plane: a
tape-backed caching system for a large scientific archive.

Files whose primary storage is tape are registered here; users submit
retention-bounded requests, the scheduler stages matching files from tape
to a restore disk area and publishes them through symbolic links at their
original archive paths, and the tidy loop evicts them back to tape when
retention expires.

# Overview

The primary types and entry points:

* [`Store`] — the SQLite-backed state store holding [`TapeFile`]s,
  [`TapeRequest`]s, [`Quota`]s, [`Slot`]s and [`RestoreDisk`]s.
* [`PathResolver`] — logical path ↔ spot ↔ storage path mapping.
* [`update_requests`], [`adjust_slots`], [`load_slots`] — the request
  manager and slot scheduler.
* [`run_tick`] — the retrieval executor, driving `sd_get` via one slot.
* [`tidy_requests`] — retention-based eviction back to tape.
* [`verify`] / [`quick_verify`] — UNVERIFIED → ONDISK promotion.
* [`fix`] — idempotent reconciliation repairs.
* [`api`] — the model operations wrapped by the external HTTP layer.
*/

#![forbid(unsafe_code)]
#![warn(
    // unreachable_pub, // frequently check
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications,
    bad_style,
    dead_code,
    improper_ctypes,
    missing_copy_implementations,
    missing_debug_implementations,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    trivial_numeric_casts,
    unused_results,
    unused_extern_crates,
    unused_import_braces,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    clippy::cast_lossless,
    clippy::default_trait_access,
    clippy::doc_markdown,
    clippy::manual_string_new,
    clippy::match_same_arms,
    clippy::semicolon_if_nothing_returned,
    clippy::trivially_copy_pass_by_ref
)]
#![allow(clippy::module_name_repetitions, clippy::redundant_pub_crate)]

pub mod api;
pub(crate) mod allocator;
pub(crate) mod error;
pub mod fix;
pub(crate) mod guard;
pub(crate) mod ingest;
pub(crate) mod model;
pub(crate) mod notify;
pub(crate) mod requests;
pub(crate) mod resolver;
pub(crate) mod retrieve;
pub(crate) mod slots;
pub(crate) mod store;
pub(crate) mod tape;
pub(crate) mod tidy;
pub(crate) mod verify;

// nla_core Public API
pub use crate::{
    allocator::{assign_missing_restore_disk, choose_disk, recompute_all, recompute_used},
    error::{ConfigErrorKind, GuardErrorKind, NlaError, NlaErrorKind, NlaResult},
    guard::{acquire, acquire_pool, try_exclusive, TaskGuard},
    ingest::{ingest_fileset, move_files_to_nla, IngestOutcome, IngestSettings},
    model::{
        parse_request_files, Quota, RestoreDisk, Slot, Stage, TapeFile, TapeRequest, ALL_STAGES,
        VERIFY_USER,
    },
    notify::{HttpIndexUpdater, IndexUpdater, LogNotifier, NoopIndexUpdater, Notifier},
    requests::{update_requests, UpdateOutcome},
    resolver::PathResolver,
    retrieve::{check_happy, local_host, redo_request, run_tick, RetrieveSettings},
    slots::{adjust_slots, load_slots},
    store::{NewRequest, Store},
    tape::{parse_listing, parse_saved_line, LogTail, SavedFile, SpotCache, SpotEntry, TapeClient},
    tidy::{tidy_requests, TidyOutcome, TidySettings, SIGNPOST_NAME},
    verify::{quick_verify, verify, VerifyReport, VerifySettings},
};
