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

//! Ordering of the operations touching one key.
//!
//! All ops on the same key must be arranged into a total order consistent
//! with their recorded return values. Reads and failed writes don't bump
//! the sequence counter, and the counter is sampled without locking, so
//! the recorded seqnums only suggest an order; the truth is recovered by a
//! depth-first search over per-file candidates, guided by what each op
//! *needs* the key's state to be and what it *gives* back.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use thiserror::Error;

use crate::key_index::KeyIndex;
use crate::key_index::KeyUsers;
use crate::trace::Op;
use crate::trace::OpKind;
use crate::trace::OpRef;
use crate::trace::StoreFlag;
use crate::trace::TraceFile;
use crate::trace::successful_transaction;

/// What an op requires of a key's state for its recorded return value to
/// come out again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Constraint<'a> {
    /// The key must exist; the value doesn't matter.
    MustExist,
    /// The key must not exist.
    MustNotExist,
    /// The key must be absent or hold a zero-length value.
    NotExistsOrEmpty,
    /// The key must hold exactly these bytes.
    Bytes(&'a BStr),
}

/// A key's state while simulating a candidate order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum State {
    Absent,
    Value(BString),
}

/// Pre-existing records the solver concluded the store must be seeded
/// with before every run.
pub type SeedStore = BTreeMap<BString, BString>;

/// No candidate order survived even the loosest seqnum fuzz.
#[derive(Debug, Error)]
#[error("{file}:{line}: FAIL: Could not resolve inter-dependencies")]
pub struct SolveError {
    pub file: String,
    pub line: usize,
}

fn key_matches(op: &Op, key: &BStr) -> bool {
    op.key.as_deref().map(|k| k.as_bstr()) == Some(key) || op.kind == OpKind::WipeAll
}

/// What op `i` needs the state of `key` to be, or `None` for no
/// constraint.
pub fn needs<'a>(ops: &'a [Op], i: usize, key: &BStr) -> Option<Constraint<'a>> {
    let op = &ops[i];
    // For a group, look through for an op which needs this key.
    if op.starts_transaction() || op.starts_chainlock() {
        let mut need = None;
        for j in i + 1..i + op.group_len {
            if key_matches(&ops[j], key) {
                need = needs(ops, j, key);
                // tdb_exists() is special: something later in the
                // transaction may have more specific requirements. Other
                // ops either have none or change the value, so no more
                // information can be pulled out past them.
                if ops[j].kind != OpKind::Exists {
                    break;
                }
            }
        }
        return need;
    }

    match op.kind {
        OpKind::Append => match op.append_pre() {
            Some(pre) if !pre.is_empty() => Some(Constraint::Bytes(pre)),
            _ => Some(Constraint::NotExistsOrEmpty),
        },
        OpKind::Store => match op.flag {
            StoreFlag::Insert if op.ret < 0 => Some(Constraint::MustExist),
            StoreFlag::Insert => Some(Constraint::MustNotExist),
            StoreFlag::Modify if op.ret < 0 => Some(Constraint::MustNotExist),
            StoreFlag::Modify => Some(Constraint::MustExist),
            StoreFlag::Replace => None,
        },
        OpKind::Exists => {
            if op.ret == 1 {
                Some(Constraint::MustExist)
            } else {
                Some(Constraint::MustNotExist)
            }
        }
        OpKind::ParseRecord | OpKind::Delete => {
            if op.ret < 0 {
                Some(Constraint::MustNotExist)
            } else {
                Some(Constraint::MustExist)
            }
        }
        OpKind::Fetch => match &op.data {
            Some(data) => Some(Constraint::Bytes(data.as_bstr())),
            None => Some(Constraint::MustNotExist),
        },
        _ => None,
    }
}

/// The state of `key` after op `i` runs over pre-state `pre`. `None`
/// means unchanged; a `Some` holding bytes equal to `pre` still counts as
/// a change for mutator classification.
pub fn gives(ops: &[Op], i: usize, key: &BStr, pre: &State) -> Option<State> {
    let op = &ops[i];
    if op.starts_transaction() || op.starts_chainlock() {
        let end = i + op.group_len;
        // Cancelled transactions don't change anything.
        if ops[end].kind == OpKind::TransactionCancel {
            return None;
        }
        debug_assert!(matches!(
            ops[end].kind,
            OpKind::TransactionCommit | OpKind::ChainUnlock | OpKind::ChainUnlockRead
        ));
        let mut current = None;
        for j in i + 1..end {
            // This skips nested group starts too; they carry no key.
            if key_matches(&ops[j], key) {
                let base = current.as_ref().unwrap_or(pre);
                if let Some(next) = gives(ops, j, key, base) {
                    current = Some(next);
                }
            }
        }
        return current;
    }

    // Failed ops don't change the state of the db.
    if op.ret < 0 {
        return None;
    }
    match op.kind {
        OpKind::Delete | OpKind::WipeAll => Some(State::Absent),
        OpKind::Append => Some(State::Value(op.append_post.clone().unwrap_or_default())),
        OpKind::Store => Some(State::Value(op.data.clone().unwrap_or_default())),
        _ => None,
    }
}

/// True if op `i` writes `key` (including deleting it).
pub fn changes_db(ops: &[Op], i: usize, key: &BStr) -> bool {
    gives(ops, i, key, &State::Absent).is_some()
}

/// True if `state` satisfies what op `i` needs of `key`.
pub fn satisfies(ops: &[Op], i: usize, key: &BStr, state: &State) -> bool {
    match needs(ops, i, key) {
        None => true,
        Some(Constraint::MustNotExist) => *state == State::Absent,
        Some(Constraint::MustExist) => *state != State::Absent,
        Some(Constraint::NotExistsOrEmpty) => match state {
            State::Absent => true,
            State::Value(value) => value.is_empty(),
        },
        Some(Constraint::Bytes(bytes)) => match state {
            State::Value(value) => value.as_bstr() == bytes,
            State::Absent => bytes.is_empty(),
        },
    }
}

/// Comparator for a key's user list before the search runs.
///
/// A standalone value so the tie-break rules are testable in isolation:
/// within one file the op order is authoritative, across files the
/// seqnums are, and at equal seqnums a cancelled transaction (which never
/// bumped the counter) sorts before a successful one.
pub struct UserOrder<'a> {
    pub traces: &'a [TraceFile],
}

impl UserOrder<'_> {
    pub fn compare(&self, a: &OpRef, b: &OpRef) -> Ordering {
        // First, maintain order within any trace file.
        if a.file == b.file {
            return a.op.cmp(&b.op);
        }
        let op_a = &self.traces[a.file].ops[a.op];
        let op_b = &self.traces[b.file].ops[b.op];
        match op_a.seqnum.cmp(&op_b.seqnum) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        // Cancelled transactions are assumed to happen first.
        if op_a.starts_transaction() && !successful_transaction(&self.traces[a.file].ops, a.op) {
            return Ordering::Less;
        }
        if op_b.starts_transaction() && !successful_transaction(&self.traces[b.file].ops, b.op) {
            return Ordering::Greater;
        }
        Ordering::Equal
    }
}

/// Depth-first search for an arrangement of `users[off..]` whose
/// constraints are satisfiable starting from `state`.
///
/// Ops within one trace file stay ordered, so at each position there is
/// one candidate per file. Inter-key relationships (which exist by virtue
/// of trace file order) aren't modeled; keeping close to seqnum order
/// minimizes the chance of harm.
fn sort_deps(
    traces: &[TraceFile],
    users: &mut [OpRef],
    off: usize,
    key: &BStr,
    state: &State,
    num_files: usize,
    fuzz: u32,
) -> bool {
    // None left? We're sorted.
    if off == users.len() {
        return true;
    }

    // The smallest remaining seqnum can only fall further behind; reject
    // the branch as soon as the backward jump exceeds the fuzz.
    if off > 0 {
        let placed = &traces[users[off - 1].file].ops[users[off - 1].op];
        let next = &traces[users[off].file].ops[users[off].op];
        if i64::from(placed.seqnum) - i64::from(next.seqnum) > i64::from(fuzz) {
            return false;
        }
    }

    let mut done = vec![false; num_files];
    let mut files_done = 0;
    let mut i = off;
    while i < users.len() && files_done < num_files {
        let candidate = users[i];
        if done[candidate.file] {
            i += 1;
            continue;
        }
        let ops = &traces[candidate.file].ops;
        if satisfies(ops, candidate.op, key, state) {
            users[off..=i].rotate_right(1);
            let next_state = gives(ops, candidate.op, key, state).unwrap_or_else(|| state.clone());
            if sort_deps(traces, users, off + 1, key, &next_state, num_files, fuzz) {
                return true;
            }
            users[off..=i].rotate_left(1);
        }
        done[candidate.file] = true;
        files_done += 1;
        i += 1;
    }

    // No combination worked.
    false
}

/// Tries the search under increasingly lax seqnum fuzz.
fn figure_deps(
    traces: &[TraceFile],
    key: &BStr,
    users: &mut [OpRef],
    state: &State,
    num_files: usize,
) -> bool {
    // Strict seqnum order is the most likely; get more lax if it fails.
    let mut fuzz = 0;
    while fuzz < 100 {
        if sort_deps(traces, users, 0, key, state, num_files, fuzz) {
            debug_assert!(per_file_order_kept(users, num_files));
            return true;
        }
        fuzz = (fuzz + 1) * 2;
    }
    false
}

fn per_file_order_kept(users: &[OpRef], num_files: usize) -> bool {
    let mut minima = vec![0; num_files];
    users.iter().all(|user| {
        let ok = minima[user.file] < user.op;
        minima[user.file] = user.op;
        ok
    })
}

/// We're having trouble sorting out this key: assume it's a pre-existing
/// record and determine a likely value from the first user that demands
/// one.
fn preexisting_data(traces: &[TraceFile], key: &BStr, users: &[OpRef]) -> Option<BString> {
    for user in users {
        let need = needs(&traces[user.file].ops, user.op, key);
        let data = match need {
            None | Some(Constraint::MustNotExist) => continue,
            Some(Constraint::Bytes(bytes)) => bytes.to_owned(),
            Some(Constraint::MustExist | Constraint::NotExistsOrEmpty) => BString::default(),
        };
        tracing::info!(
            file = %traces[user.file].name(),
            line = user.op + 1,
            key = %key,
            "needs pre-existing record"
        );
        return Some(data);
    }
    None
}

/// Sorts every key's user list into a replayable order, seeding
/// pre-existing records into `seeds` where that is the only way to make a
/// key's history consistent.
pub fn sort_ops(
    traces: &[TraceFile],
    index: &mut KeyIndex,
    seeds: &mut SeedStore,
) -> Result<(), SolveError> {
    let num_files = traces.len();
    for entry in index.keys_mut() {
        let KeyUsers { key, users } = entry;
        let key = key.as_bstr();
        let order = UserOrder { traces };
        users.sort_by(|a, b| order.compare(a, b));

        if figure_deps(traces, key, users, &State::Absent, num_files) {
            continue;
        }
        // Give the first op what it wants: does that help?
        let seed = preexisting_data(traces, key, users);
        let state = seed
            .as_ref()
            .map_or(State::Absent, |data| State::Value(data.clone()));
        if !figure_deps(traces, key, users, &state, num_files) {
            return Err(SolveError {
                file: traces[users[0].file].name(),
                line: users[0].op + 1,
            });
        }
        if let Some(data) = seed {
            seeds.insert(key.to_owned(), data);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::trace::load_trace_file;

    fn load(name: &str, lines: &[&str]) -> TraceFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        let mut trace = load_trace_file(file.path()).unwrap();
        trace.path = PathBuf::from(name);
        trace
    }

    fn key() -> BString {
        BString::from("K")
    }

    #[test]
    fn test_needs_store_flags() {
        let trace = load(
            "t",
            &[
                "tdb_open 1 0 2",
                "1 tdb_store 1:4b 1:56 2 = 0",
                "2 tdb_store 1:4b 1:56 2 = -1",
                "3 tdb_store 1:4b 1:56 3 = 0",
                "4 tdb_store 1:4b 1:56 3 = -1",
                "5 tdb_store 1:4b 1:56 0 = 0",
                "tdb_close",
            ],
        );
        let ops = &trace.ops;
        assert_eq!(needs(ops, 1, key().as_bstr()), Some(Constraint::MustNotExist));
        assert_eq!(needs(ops, 2, key().as_bstr()), Some(Constraint::MustExist));
        assert_eq!(needs(ops, 3, key().as_bstr()), Some(Constraint::MustExist));
        assert_eq!(needs(ops, 4, key().as_bstr()), Some(Constraint::MustNotExist));
        assert_eq!(needs(ops, 5, key().as_bstr()), None);
    }

    #[test]
    fn test_needs_read_ops() {
        let trace = load(
            "t",
            &[
                "tdb_open 1 0 2",
                "1 tdb_exists 1:4b = 1",
                "2 tdb_exists 1:4b = 0",
                "3 tdb_fetch 1:4b = 1:56",
                "4 tdb_fetch 1:4b = NULL",
                "5 tdb_delete 1:4b = 0",
                "6 tdb_delete 1:4b = -1",
                "7 tdb_append 1:4b 1:56 = 2:5656",
                "8 tdb_append 1:4b 1:56 = 1:56",
                "tdb_close",
            ],
        );
        let ops = &trace.ops;
        assert_eq!(needs(ops, 1, key().as_bstr()), Some(Constraint::MustExist));
        assert_eq!(needs(ops, 2, key().as_bstr()), Some(Constraint::MustNotExist));
        assert_eq!(
            needs(ops, 3, key().as_bstr()),
            Some(Constraint::Bytes(b"V".as_bstr()))
        );
        assert_eq!(needs(ops, 4, key().as_bstr()), Some(Constraint::MustNotExist));
        assert_eq!(needs(ops, 5, key().as_bstr()), Some(Constraint::MustExist));
        assert_eq!(needs(ops, 6, key().as_bstr()), Some(Constraint::MustNotExist));
        assert_eq!(
            needs(ops, 7, key().as_bstr()),
            Some(Constraint::Bytes(b"V".as_bstr()))
        );
        assert_eq!(
            needs(ops, 8, key().as_bstr()),
            Some(Constraint::NotExistsOrEmpty)
        );
    }

    #[test]
    fn test_gives_basics() {
        let trace = load(
            "t",
            &[
                "tdb_open 1 0 2",
                "1 tdb_store 1:4b 1:56 0 = 0",
                "2 tdb_delete 1:4b = 0",
                "3 tdb_delete 1:4b = -1",
                "4 tdb_fetch 1:4b = 1:56",
                "tdb_close",
            ],
        );
        let ops = &trace.ops;
        let pre = State::Absent;
        assert_eq!(
            gives(ops, 1, key().as_bstr(), &pre),
            Some(State::Value(BString::from("V")))
        );
        assert_eq!(gives(ops, 2, key().as_bstr(), &pre), Some(State::Absent));
        // Failed ops don't change the state of the db.
        assert_eq!(gives(ops, 3, key().as_bstr(), &pre), None);
        assert_eq!(gives(ops, 4, key().as_bstr(), &pre), None);
    }

    #[test]
    fn test_gives_cancelled_transaction_changes_nothing() {
        let trace = load(
            "t",
            &[
                "tdb_open 1 0 2",
                "1 tdb_transaction_start",
                "2 tdb_store 1:4b 1:58 0 = 0",
                "3 tdb_transaction_commit",
                "4 tdb_transaction_start",
                "5 tdb_store 1:4b 1:59 0 = 0",
                "6 tdb_transaction_cancel",
                "tdb_close",
            ],
        );
        let ops = &trace.ops;
        assert_eq!(ops[1].group_len, 2);
        assert_eq!(ops[4].group_len, 2);
        // The committed transaction gives X, the cancelled one gives
        // nothing back.
        assert_eq!(
            gives(ops, 1, key().as_bstr(), &State::Absent),
            Some(State::Value(BString::from("X")))
        );
        assert_eq!(gives(ops, 4, key().as_bstr(), &State::Absent), None);
    }

    #[test]
    fn test_comparator_prefers_cancelled_transaction_on_tie() {
        let t1 = load(
            "t1",
            &[
                "tdb_open 1 0 2",
                "5 tdb_transaction_start",
                "5 tdb_store 1:4b 1:58 0 = 0",
                "5 tdb_transaction_cancel",
                "tdb_close",
            ],
        );
        let t2 = load(
            "t2",
            &[
                "tdb_open 1 0 2",
                "5 tdb_transaction_start",
                "5 tdb_store 1:4b 1:59 0 = 0",
                "6 tdb_transaction_commit",
                "tdb_close",
            ],
        );
        let traces = [t1, t2];
        let order = UserOrder { traces: &traces };
        let cancelled = OpRef::new(0, 1);
        let committed = OpRef::new(1, 1);
        assert_eq!(order.compare(&cancelled, &committed), Ordering::Less);
        assert_eq!(order.compare(&committed, &cancelled), Ordering::Greater);
    }

    #[test]
    fn test_solver_orders_by_constraints_not_input_order() {
        // (insert K, success), (insert K, fail), (delete K, success): the
        // only consistent order is success, fail, delete, regardless of
        // the order the traces are listed in.
        let succ = load("succ", &["tdb_open 1 0 2", "7 tdb_store 1:4b 1:56 2 = 0", "tdb_close"]);
        let fail = load("fail", &["tdb_open 1 0 2", "7 tdb_store 1:4b 1:57 2 = -1", "tdb_close"]);
        let del = load("del", &["tdb_open 1 0 2", "7 tdb_delete 1:4b = 0", "tdb_close"]);
        for perm in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let all = [succ.clone(), fail.clone(), del.clone()];
            let traces = perm.map(|i| all[i].clone());
            let mut index = KeyIndex::build(&traces);
            let mut seeds = SeedStore::new();
            sort_ops(&traces, &mut index, &mut seeds).unwrap();
            let entry = index.keys().next().unwrap();
            let names = entry
                .users
                .iter()
                .map(|user| traces[user.file].name())
                .collect::<Vec<_>>();
            assert_eq!(names, ["succ", "fail", "del"], "input order {perm:?}");
            assert!(seeds.is_empty());
        }
    }

    #[test]
    fn test_solver_seeds_preexisting_record() {
        // A fetch with no prior insert forces a pre-existing record.
        let trace = load("t", &["tdb_open 1 0 2", "1 tdb_fetch 1:4b = 1:56", "tdb_close"]);
        let traces = [trace];
        let mut index = KeyIndex::build(&traces);
        let mut seeds = SeedStore::new();
        sort_ops(&traces, &mut index, &mut seeds).unwrap();
        assert_eq!(seeds.get(b"K".as_slice()), Some(&BString::from("V")));
    }

    #[test]
    fn test_solver_rejects_impossible_history() {
        // Two successful inserts of the same key in different files can
        // never both succeed.
        let t1 = load("t1", &["tdb_open 1 0 2", "1 tdb_store 1:4b 1:56 2 = 0", "tdb_close"]);
        let t2 = load("t2", &["tdb_open 1 0 2", "2 tdb_store 1:4b 1:57 2 = 0", "tdb_close"]);
        let traces = [t1, t2];
        let mut index = KeyIndex::build(&traces);
        let mut seeds = SeedStore::new();
        assert!(sort_ops(&traces, &mut index, &mut seeds).is_err());
    }
}
