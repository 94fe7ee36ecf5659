//! CLI entrypoint for termrelay.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use clap::Parser;
use termrelay::Cli;

fn main() {
    let exit_code = termrelay::run(Cli::parse());
    std::process::exit(exit_code);
}
