//! `show-config` subcommand

use crate::{Application, NLA_APP};

use abscissa_core::{Command, Runnable};

/// `show-config` subcommand
#[derive(clap::Parser, Command, Debug)]
pub(super) struct ShowConfigCmd {}

impl Runnable for ShowConfigCmd {
    fn run(&self) {
        let config = NLA_APP.config();
        println!("{}", *config);
    }
}
