// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, sync::Mutex};

use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod config;
mod consts;
mod daemon;
mod duration;
mod errors;
mod keys;
mod provider;
mod registry;
mod session_table;
mod tty;

/// Command line arguments lobbyboy expects. Unlike the cli this was
/// modeled on, there's only one thing to do: run the gateway daemon in
/// the foreground, so there are no subcommands.
#[derive(Parser, Debug)]
#[clap(author, about, version)]
pub struct Args {
    #[clap(short, long, action, help = "A toml file containing configuration")]
    pub config_file: String,

    #[clap(short, long, action, long_help = "The file to write logs to

Defaults to stderr.")]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,
}

/// Runs lobbyboy with the given arguments: sets up logging then hands
/// off to the daemon's accept loop. Does not return unless the daemon
/// exits with an error.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(&log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    if let Err(err) = daemon::run(args.config_file) {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
