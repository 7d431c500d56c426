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

//! Deterministic multi-process replayer for tdb operation traces.
//!
//! Given one trace file per original process, the library reconstructs a
//! single execution that preserves the observable inter-process ordering
//! the traces imply, then replays it against a fresh store with one
//! worker process per trace. The pipeline:
//!
//! 1. [`trace`] parses each file into an annotated op vector.
//! 2. [`key_index`] maps every key to its users across all traces.
//! 3. [`solver`] orders each key's users consistently with the recorded
//!    return values, seeding pre-existing records where necessary.
//! 4. [`dep_graph`] turns the orders into cross-process happens-before
//!    edges.
//! 5. [`runtime`] executes the schedule over pipes-coordinated worker
//!    processes, with backoff on traversal deadlocks.
//!
//! [`replay::Replayer`] ties the stages together.

pub mod dep_graph;
pub mod file_store;
pub mod key_index;
pub mod replay;
pub mod runtime;
pub mod solver;
pub mod store;
pub mod trace;
