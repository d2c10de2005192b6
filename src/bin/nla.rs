//! Main entry point for the NLA control plane CLI

#![deny(warnings, missing_docs, trivial_casts, unused_qualifications)]
#![forbid(unsafe_code)]

use nla::application::NLA_APP;

/// Boot the NLA application
fn main() {
    abscissa_core::boot(&NLA_APP);
}
