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

use std::fs;
use std::path::PathBuf;

use assert_matches::assert_matches;
use bstr::BString;
use tdb_replay_lib::replay::ReplayError;
use tdb_replay_lib::replay::ReplayOptions;
use tdb_replay_lib::replay::Replayer;
use testutils::TestEnv;
use testutils::fast_options;
use testutils::rec;
use testutils::store_records;

fn replay(env: &TestEnv, traces: &[PathBuf], options: ReplayOptions) -> Replayer {
    let mut replayer = Replayer::load(&env.store_path(), traces, options).unwrap();
    let times = replayer.run().unwrap();
    assert_eq!(times.len(), 1);
    replayer
}

#[test]
fn test_trivial_store() {
    let env = TestEnv::new();
    let trace = env.trace(
        "t1",
        &["tdb_open 1024 0 2", "1 tdb_store 1:41 1:42 1 = 0"],
    );
    replay(&env, &[trace], fast_options());
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("A"), BString::from("B"))]
    );
}

#[test]
fn test_cross_file_order_reproduced() {
    let env = TestEnv::new();
    let t1 = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            &format!("5 tdb_store {} {} 0 = 0", rec(b"K"), rec(b"V1")),
        ],
    );
    let t2 = env.trace(
        "t2",
        &[
            "tdb_open 16 0 2",
            &format!("6 tdb_fetch {} = {}", rec(b"K"), rec(b"V1")),
        ],
    );
    // Two traces: this forks real workers coordinated over pipes. The
    // fetch only passes if it observes the store's value.
    replay(&env, &[t1, t2], fast_options());
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("V1"))]
    );
}

#[test]
fn test_preexisting_record_seeded() {
    let env = TestEnv::new();
    let trace = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            &format!("1 tdb_fetch {} = {}", rec(b"K"), rec(b"V")),
        ],
    );
    let replayer = replay(&env, &[trace], fast_options());
    assert_eq!(
        replayer.seeds().get(b"K".as_slice()),
        Some(&BString::from("V"))
    );
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("V"))]
    );
}

#[test]
fn test_transaction_replay_keeps_committed_value() {
    let env = TestEnv::new();
    let k = rec(b"K");
    let trace = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            "1 tdb_transaction_start",
            &format!("2 tdb_store {k} {} 0 = 0", rec(b"X")),
            "3 tdb_transaction_commit",
            "4 tdb_transaction_start",
            &format!("5 tdb_store {k} {} 0 = 0", rec(b"Y")),
            "6 tdb_transaction_cancel",
        ],
    );
    let replayer = replay(&env, &[trace], fast_options());
    // Both transactions closed over two ops each.
    assert_eq!(replayer.traces()[0].ops[1].group_len, 2);
    assert_eq!(replayer.traces()[0].ops[4].group_len, 2);
    // The cancelled transaction leaves no mark.
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("X"))]
    );
}

#[test]
fn test_traversal_contention_backs_off_and_completes() {
    let env = TestEnv::new();
    let k = rec(b"K");
    // t1 traverses while holding the read lock and, mid-traversal, needs
    // a value only t2's store can produce; t2's store blocks on the
    // traversal lock. The initial schedule deadlocks, a backoff rewrites
    // t1's traversal, and the rerun completes.
    let t1 = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            "1 tdb_traverse_read_start",
            "1 traversefn",
            &format!("10 tdb_fetch {k} = {}", rec(b"V2")),
            "11 tdb_traverse_end",
        ],
    );
    let t2 = env.trace(
        "t2",
        &[
            "tdb_open 16 0 2",
            &format!("2 tdb_fetch {k} = {}", rec(b"V1")),
            &format!("5 tdb_store {k} {} 0 = 0", rec(b"V2")),
        ],
    );
    let replayer = replay(&env, &[t1, t2], fast_options());
    // The solver had to seed the record t2 first observes.
    assert_eq!(
        replayer.seeds().get(b"K".as_slice()),
        Some(&BString::from("V1"))
    );
    // Final state is t2's post-state.
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("V2"))]
    );
}

#[test]
fn test_nonblocking_lock_divergence_compensated() {
    let env = TestEnv::new();
    let k = rec(b"K");
    // The trace recorded a failed non-blocking chain-lock, but replaying
    // uncontended it succeeds; the worker must release the lock it
    // wasn't supposed to get and carry on.
    let trace = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            &format!("1 tdb_chainlock_nonblock {k} = -1"),
            &format!("2 tdb_store {k} {} 0 = 0", rec(b"V")),
        ],
    );
    replay(&env, &[trace], fast_options());
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("V"))]
    );
}

#[test]
fn test_repeated_runs_are_idempotent() {
    let env = TestEnv::new();
    let k = rec(b"K");
    let l = rec(b"L");
    let lines = [
        "tdb_open 16 0 2".to_string(),
        format!("1 tdb_store {k} {} 2 = 0", rec(b"V")),
        format!("2 tdb_append {k} {} = {}", rec(b"W"), rec(b"VW")),
        "3 tdb_transaction_start".to_string(),
        format!("4 tdb_store {l} {} 0 = 0", rec(b"2")),
        "5 tdb_transaction_commit".to_string(),
        format!("6 tdb_delete {l} = 0"),
    ];
    let lines = lines.iter().map(String::as_str).collect::<Vec<_>>();

    let trace = env.trace("t1", &lines);
    let mut replayer = Replayer::load(
        &env.store_path(),
        std::slice::from_ref(&trace),
        ReplayOptions {
            runs: 3,
            ..fast_options()
        },
    )
    .unwrap();
    let times = replayer.run().unwrap();
    assert_eq!(times.len(), 3);
    let repeated_image = fs::read(env.store_path()).unwrap();

    let single_env = TestEnv::new();
    let trace = single_env.trace("t1", &lines);
    let mut replayer =
        Replayer::load(&single_env.store_path(), &[trace], fast_options()).unwrap();
    assert_eq!(replayer.run().unwrap().len(), 1);
    let single_image = fs::read(single_env.store_path()).unwrap();

    // Every run starts from the seeded image, so the final store is
    // bit-equal no matter how many runs happened.
    assert_eq!(repeated_image, single_image);
}

#[test]
fn test_reordered_history_replays_cleanly() {
    let env = TestEnv::new();
    let t1 = env.trace(
        "t1",
        &[
            "tdb_open 16 0 2",
            &format!("1 tdb_store {} {} 0 = 0", rec(b"K"), rec(b"V")),
        ],
    );
    let t2 = env.trace(
        "t2",
        &[
            "tdb_open 16 0 2",
            &format!("2 tdb_exists {} = 0", rec(b"K")),
            &format!("3 tdb_fetch {} = {}", rec(b"K"), rec(b"V")),
        ],
    );
    // The seqnums suggest the store ran first, but t2's exists=0 can
    // only precede it: the solver needs a little fuzz to untangle that
    // order, and the derived edges force it at replay time.
    let mut replayer = Replayer::load(&env.store_path(), &[t1, t2], fast_options()).unwrap();
    replayer.run().unwrap();
    assert_eq!(
        store_records(&env.store_path()),
        vec![(BString::from("K"), BString::from("V"))]
    );
}

#[test]
fn test_divergent_recording_fails() {
    let env = TestEnv::new();
    // The recorded sequence number can never come back out of a fresh
    // store.
    let trace = env.trace("t1", &["tdb_open 16 0 2", "1 tdb_get_seqnum = 42"]);
    let mut replayer =
        Replayer::load(&env.store_path(), std::slice::from_ref(&trace), fast_options()).unwrap();
    assert_matches!(replayer.run(), Err(ReplayError::Run(_)));
}
