// Copyright 2025 The tdb-replay Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tdb_replay_lib::replay::ReplayError;
use tdb_replay_lib::replay::ReplayOptions;
use tdb_replay_lib::replay::Replayer;
use tracing_subscriber::EnvFilter;

/// Replays captured tdb traces against a fresh store and measures
/// wall-clock time, preserving the inter-process ordering the traces
/// imply.
#[derive(Parser)]
#[command(name = "tdb-replay", version)]
struct Args {
    /// Suppress progress chatter; print bare timings only.
    #[arg(long)]
    quiet: bool,

    /// Number of times to repeat the replay.
    #[arg(short = 'n', default_value_t = 1, value_name = "RUNS")]
    runs: u32,

    /// The store file to replay against. Created (and re-seeded before
    /// every run) by the replayer.
    store: PathBuf,

    /// One trace file per original process.
    #[arg(required = true)]
    traces: Vec<PathBuf>,
}

fn run(args: &Args) -> Result<(), ReplayError> {
    let options = ReplayOptions {
        quiet: args.quiet,
        runs: args.runs,
        ..ReplayOptions::default()
    };
    let mut replayer = Replayer::load(&args.store, &args.traces, options)?;
    tracing::debug!(
        traces = args.traces.len(),
        edges = replayer.graph().live_edges().len(),
        seeds = replayer.seeds().len(),
        "analysis complete"
    );
    for elapsed in replayer.run()? {
        if args.quiet {
            println!("{} usec", elapsed.as_micros());
        } else {
            println!("Time replaying: {} usec", elapsed.as_micros());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
