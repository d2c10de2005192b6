/*!
nla

The Near-Line Archive control plane CLI, based on the [Abscissa] framework.
The model itself lives in the [`nla_core`] crate; every subcommand here is
one operational task (or operator view) over that model.

[Abscissa]: https://github.com/iqlusioninc/abscissa
*/

#![forbid(unsafe_code)]
#![warn(
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

pub mod application;
pub(crate) mod commands;
pub(crate) mod config;
pub(crate) mod helpers;

// nla CLI Public API

/// Abscissa core prelude
pub use abscissa_core::prelude::*;

/// Application state
pub use crate::application::NLA_APP;

/// NLA config
pub use crate::config::NlaConfig;
