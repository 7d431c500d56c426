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

//! The replayer: load, analyze, seed, run.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use bstr::ByteSlice as _;
use thiserror::Error;

use crate::dep_graph::DepGraph;
use crate::file_store::FileStore;
use crate::key_index::KeyIndex;
use crate::runtime::RunError;
use crate::runtime::handle_backoff;
use crate::runtime::run_fleet;
use crate::runtime::run_single;
use crate::solver::SeedStore;
use crate::solver::SolveError;
use crate::solver::sort_ops;
use crate::store::Store as _;
use crate::store::StoreError;
use crate::trace::ParseError;
use crate::trace::StoreFlag;
use crate::trace::TraceFile;
use crate::trace::load_trace_file;

/// Tunables for a replay. The timeouts are generous for real workloads;
/// tests shrink them.
#[derive(Clone, Debug)]
pub struct ReplayOptions {
    /// Suppress diagnostic chatter (the dependency dump on deadlock).
    pub quiet: bool,
    /// How many times to repeat the seeded run.
    pub runs: u32,
    /// Pipe-read timeout outside traversals; expiring is a fatal
    /// deadlock.
    pub deadlock_timeout: Duration,
    /// Pipe-read timeout inside traversals; expiring triggers a backoff.
    pub backoff_timeout: Duration,
    /// Grace period for forked workers to open the store before the
    /// start gate opens.
    pub settle_delay: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            quiet: false,
            runs: 1,
            deadlock_timeout: Duration::from_secs(10),
            backoff_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Any failure between loading the traces and finishing the last run.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("cannot seed store: {0}")]
    Seed(StoreError),
    #[error("one or more workers failed")]
    WorkersFailed,
}

/// A loaded and analyzed fleet of traces, ready to run.
pub struct Replayer {
    traces: Vec<TraceFile>,
    graph: DepGraph,
    seeds: SeedStore,
    store_path: PathBuf,
    options: ReplayOptions,
}

impl Replayer {
    /// Loads every trace, infers the cross-process ordering and the
    /// pre-existing records it implies.
    pub fn load(
        store_path: &Path,
        trace_paths: &[PathBuf],
        options: ReplayOptions,
    ) -> Result<Self, ReplayError> {
        let traces = trace_paths
            .iter()
            .map(|path| {
                tracing::info!(file = %path.display(), "loading tracefile");
                load_trace_file(path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!("calculating inter-dependencies");
        let mut index = KeyIndex::build(&traces);
        let mut seeds = SeedStore::new();
        sort_ops(&traces, &mut index, &mut seeds)?;
        let graph = DepGraph::derive(&traces, &index);

        Ok(Self {
            traces,
            graph,
            seeds,
            store_path: store_path.to_path_buf(),
            options,
        })
    }

    pub fn traces(&self) -> &[TraceFile] {
        &self.traces
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }

    /// The pre-existing records the solver decided to seed.
    pub fn seeds(&self) -> &SeedStore {
        &self.seeds
    }

    /// (Re)creates the store image and copies the master seed records in.
    fn init_store(&self) -> Result<(), ReplayError> {
        let hash_size = self.traces.first().map_or(1, |trace| trace.hash_size);
        let mut store =
            FileStore::create(&self.store_path, hash_size).map_err(ReplayError::Seed)?;
        for (key, data) in &self.seeds {
            store
                .store(key.as_bstr(), data.as_bstr(), StoreFlag::Insert)
                .map_err(ReplayError::Seed)?;
        }
        Ok(())
    }

    /// Runs the whole schedule `options.runs` times, re-seeding the store
    /// before each run and repeating any run whose traversals backed off.
    /// Returns the wall-clock time of each completed run.
    pub fn run(&mut self) -> Result<Vec<Duration>, ReplayError> {
        let mut times = Vec::with_capacity(self.options.runs as usize);
        for run in 0..self.options.runs {
            loop {
                self.init_store()?;

                // Don't fork for the single-trace case: simple debugging.
                if self.traces.len() == 1 {
                    let elapsed =
                        run_single(&self.traces, &self.graph, &self.store_path, &self.options)?;
                    times.push(elapsed);
                    break;
                }

                let outcome =
                    run_fleet(&self.traces, &self.graph, &self.store_path, &self.options)?;
                if handle_backoff(&mut self.traces, &outcome.backoff_r)? {
                    tracing::info!(run, "backoff events; rewriting schedule and re-running");
                    continue;
                }
                if outcome.failed {
                    return Err(ReplayError::WorkersFailed);
                }
                times.push(outcome.elapsed);
                break;
            }
        }
        Ok(times)
    }
}
