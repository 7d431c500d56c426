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

//! Helpers for building traces and inspecting stores in tests.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use bstr::BString;
use tdb_replay_lib::file_store::FileStore;
use tdb_replay_lib::replay::ReplayOptions;
use tdb_replay_lib::store::Store as _;
use tempfile::TempDir;

/// A scratch directory holding a store file and trace files.
pub struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    /// Path of the store file workers will share.
    pub fn store_path(&self) -> PathBuf {
        self.temp_dir.path().join("replay.tdb")
    }

    /// Writes a trace file from raw lines, appending the `tdb_close`
    /// terminator.
    pub fn trace(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut text = String::new();
        for line in lines {
            writeln!(text, "{line}").unwrap();
        }
        text.push_str("tdb_close\n");
        fs::write(&path, text).unwrap();
        path
    }

    /// Writes a trace file without the `tdb_close` terminator.
    pub fn unterminated_trace(&self, name: &str, lines: &[&str]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut text = String::new();
        for line in lines {
            writeln!(text, "{line}").unwrap();
        }
        fs::write(&path, text).unwrap();
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a byte string the way traces carry records: `<dsize>:<hex>`.
pub fn rec(data: &[u8]) -> String {
    let mut encoded = format!("{}:", data.len());
    for byte in data {
        write!(encoded, "{byte:02x}").unwrap();
    }
    encoded
}

/// Replay options with timeouts small enough for tests.
pub fn fast_options() -> ReplayOptions {
    ReplayOptions {
        deadlock_timeout: Duration::from_secs(5),
        backoff_timeout: Duration::from_millis(500),
        settle_delay: Duration::from_millis(50),
        ..ReplayOptions::default()
    }
}

/// Reads all records out of a store file.
pub fn store_records(path: &Path) -> Vec<(BString, BString)> {
    let mut store = FileStore::open(path, 16).unwrap();
    let records = store.traverse_begin(false).unwrap();
    store.traverse_end().unwrap();
    records
}
