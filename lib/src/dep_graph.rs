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

//! Cross-process happens-before edges.
//!
//! Once every key's users are ordered, each mutation must wait for the
//! previous mutation and for every reader in between, and each reader for
//! the mutation it observed. Edges live in one arena and are threaded
//! through per-op `pre`/`post` lists; the edge index doubles as the token
//! workers later push through their wakeup pipes.
//!
//! tdb traversals take the transaction lock, so edges touching a
//! traversal are promoted to group boundaries and overlapping traversals
//! are serialized outright; without that the replay schedule deadlocks
//! far more often than it backs off.

use std::cmp::Ordering;

use bstr::ByteSlice as _;
use itertools::Itertools as _;

use crate::key_index::KeyIndex;
use crate::solver::changes_db;
use crate::trace::OpKind;
use crate::trace::OpRef;
use crate::trace::TraceFile;
use crate::trace::in_transaction;
use crate::trace::in_traverse;

/// Identifier of one dependency edge; also the pipe token.
pub type EdgeId = u32;

/// A directed edge: `prereq` must run before `needs`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dep {
    pub needs: OpRef,
    pub prereq: OpRef,
}

/// The dependency graph over a fleet of traces.
#[derive(Clone, Debug)]
pub struct DepGraph {
    edges: Vec<Dep>,
    /// Per file, per op: edges this op waits for.
    pre: Vec<Vec<Vec<EdgeId>>>,
    /// Per file, per op: edges this op releases.
    post: Vec<Vec<Vec<EdgeId>>>,
}

impl DepGraph {
    /// Builds the graph from a key index whose user lists have been
    /// sorted by the solver.
    pub fn derive(traces: &[TraceFile], index: &KeyIndex) -> Self {
        let mut graph = Self {
            edges: vec![],
            pre: traces.iter().map(|t| vec![vec![]; t.ops.len()]).collect(),
            post: traces.iter().map(|t| vec![vec![]; t.ops.len()]).collect(),
        };

        // Depend on the last change rather than naively on the previous
        // user: readers between two mutations can run in any order among
        // themselves, and same-seqnum ops inside traversals would
        // otherwise produce edges against the traversal serialization
        // below.
        for entry in index.keys() {
            if entry.users.len() < 2 {
                continue;
            }
            let key = entry.key.as_bstr();
            let mut prev = None;
            for i in 0..entry.users.len() {
                let user = entry.users[i];
                if changes_db(&traces[user.file].ops, user.op, key) {
                    graph.depend_on_previous(traces, &entry.users, i, prev);
                    prev = Some(i);
                } else if let Some(p) = prev {
                    graph.add_dependency(traces, user, entry.users[p]);
                }
            }
        }

        graph.make_traverse_depends(traces);
        graph.optimize(traces);
        tracing::debug!(
            edges = graph.live_edges().len(),
            "derived dependency graph"
        );
        graph
    }

    pub fn edges(&self) -> &[Dep] {
        &self.edges
    }

    /// The pending pre-edge lists of one file, cloned for a worker to
    /// consume during a run.
    pub fn pre_lists(&self, file: usize) -> Vec<Vec<EdgeId>> {
        self.pre[file].clone()
    }

    /// The post-edge lists of one file.
    pub fn post_lists(&self, file: usize) -> &[Vec<EdgeId>] {
        &self.post[file]
    }

    /// All surviving edges, in arena order.
    pub fn live_edges(&self) -> Vec<Dep> {
        let mut ids = self
            .pre
            .iter()
            .flatten()
            .flatten()
            .copied()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids.iter().map(|&id| self.edges[id as usize]).collect()
    }

    fn push_edge(&mut self, dep: Dep) {
        let id = EdgeId::try_from(self.edges.len()).unwrap();
        self.edges.push(dep);
        self.pre[dep.needs.file][dep.needs.op].push(id);
        self.post[dep.prereq.file][dep.prereq.op].push(id);
    }

    fn remove_edge(&mut self, id: EdgeId) {
        let dep = self.edges[id as usize];
        self.pre[dep.needs.file][dep.needs.op].retain(|&e| e != id);
        self.post[dep.prereq.file][dep.prereq.op].retain(|&e| e != id);
    }

    /// Makes mutator `users[i]` wait for the previous mutator at `prev`
    /// and for the last intervening reader of every other file.
    fn depend_on_previous(
        &mut self,
        traces: &[TraceFile],
        users: &[OpRef],
        i: usize,
        prev: Option<usize>,
    ) {
        if i == 0 {
            return;
        }
        if prev == Some(i - 1) {
            self.add_dependency(traces, users[i], users[i - 1]);
            return;
        }
        // Wait for the readers: the last one in *each* file. They depend
        // on the previous mutator themselves, so ordering is transitive.
        let mut deps = vec![false; traces.len()];
        deps[users[i].file] = true;
        let first = prev.map_or(0, |p| p + 1);
        for j in (first..i).rev() {
            if !deps[users[j].file] {
                self.add_dependency(traces, users[i], users[j]);
                deps[users[j].file] = true;
            }
        }
    }

    fn add_dependency(&mut self, traces: &[TraceFile], needs: OpRef, prereq: OpRef) {
        // We don't depend on ourselves; intra-file order covers it.
        if needs.file == prereq.file {
            debug_assert!(prereq.op < needs.op);
            return;
        }

        let mut dep = Dep { needs, prereq };
        let prereq_ops = &traces[prereq.file].ops;
        let needs_ops = &traces[needs.file].ops;

        // If something in a traverse depends on something in another
        // traverse or transaction, the dependency is between the two
        // groups: satisfied by the end of the prereq's group, needed by
        // the start of ours.
        if (in_traverse(prereq_ops, prereq.op)
            && (needs_ops[needs.op].starts_transaction() || needs_ops[needs.op].starts_traverse()))
            || (in_traverse(needs_ops, needs.op)
                && (prereq_ops[prereq.op].starts_transaction()
                    || prereq_ops[prereq.op].starts_traverse()))
        {
            let start = prereq_ops[prereq.op].group_start;
            dep.prereq.op = start + prereq_ops[start].group_len;
            dep.needs.op = needs_ops[needs.op].group_start;
        } else if in_traverse(needs_ops, needs.op) {
            // A traverse that reads a record another process creates
            // after the traverse's recorded start could otherwise begin,
            // block waiting, and hold its lock against that very writer.
            // Where the seqnums show it's possible, wait before starting.
            let start = needs_ops[needs.op].group_start;
            if needs_ops[start].seqnum > prereq_ops[prereq.op].seqnum {
                dep.needs.op = start;
            }
        }

        // Depending on a transaction or chain-lock means depending on it
        // ending.
        let rewritten = &prereq_ops[dep.prereq.op];
        if rewritten.starts_transaction() || rewritten.starts_chainlock() {
            dep.prereq.op += rewritten.group_len;
        } else {
            // Never release from the middle of a transaction.
            debug_assert!(
                !in_transaction(prereq_ops, dep.prereq.op)
                    || matches!(
                        prereq_ops[dep.prereq.op].kind,
                        OpKind::TransactionCommit | OpKind::TransactionCancel
                    )
            );
        }

        self.push_edge(dep);
    }

    /// Forces an order among traversals so they don't deadlock (as much):
    /// overlapping write traversals run in seqnum order. Two read
    /// traversals share the read lock and need no edge.
    fn make_traverse_depends(&mut self, traces: &[TraceFile]) {
        let compare = |a: &OpRef, b: &OpRef| -> Ordering {
            let op_a = &traces[a.file].ops[a.op];
            let op_b = &traces[b.file].ops[b.op];
            match op_a.seqnum.cmp(&op_b.seqnum) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
            // Same seqnum means one made no changes; sort by the end in
            // that case.
            let end_a = traces[a.file].ops[a.op + op_a.group_len].seqnum;
            let end_b = traces[b.file].ops[b.op + op_b.group_len].seqnum;
            end_a.cmp(&end_b)
        };

        let mut starts = vec![];
        for (file, trace) in traces.iter().enumerate() {
            for op in 1..trace.ops.len() {
                // Traversals inside transactions are already covered by
                // transaction dependencies.
                if trace.ops[op].starts_traverse() && !in_transaction(&trace.ops, op) {
                    starts.push(OpRef::new(file, op));
                }
            }
        }
        starts.sort_by(compare);

        for (prev, curr) in starts.iter().copied().tuple_windows() {
            let prev_op = &traces[prev.file].ops[prev.op];
            let curr_op = &traces[curr.file].ops[curr.op];
            if prev_op.kind == OpKind::TraverseReadStart
                && curr_op.kind == OpKind::TraverseReadStart
            {
                continue;
            }
            // Only make the dependency if the order is clear.
            if compare(&curr, &prev) != Ordering::Equal {
                let end = OpRef::new(prev.file, prev.op + prev_op.group_len);
                self.add_dependency(traces, curr, end);
            }
        }
    }

    /// Drops redundant edges: per op at most one edge per prereq file
    /// (the latest), then per file anything an earlier op's edge already
    /// implies. Indirect dependencies are not taken into account.
    fn optimize(&mut self, traces: &[TraceFile]) {
        let num_files = traces.len();

        for file in 0..num_files {
            for op in 1..traces[file].ops.len() {
                let mut best: Vec<Option<EdgeId>> = vec![None; num_files];
                for id in self.pre[file][op].clone() {
                    let prereq = self.edges[id as usize].prereq;
                    match best[prereq.file] {
                        None => best[prereq.file] = Some(id),
                        Some(cur) => {
                            if self.edges[cur as usize].prereq.op < prereq.op {
                                self.remove_edge(cur);
                                best[prereq.file] = Some(id);
                            } else {
                                self.remove_edge(id);
                            }
                        }
                    }
                }
            }
        }

        for file in 0..num_files {
            let mut highest = vec![-1i64; num_files];
            for op in 1..traces[file].ops.len() {
                for id in self.pre[file][op].clone() {
                    let prereq = self.edges[id as usize].prereq;
                    if highest[prereq.file] >= prereq.op as i64 {
                        self.remove_edge(id);
                    } else {
                        highest[prereq.file] = prereq.op as i64;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::PathBuf;

    use super::*;
    use crate::solver::SeedStore;
    use crate::solver::sort_ops;
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

    fn derive(traces: &[TraceFile]) -> DepGraph {
        let mut index = KeyIndex::build(traces);
        let mut seeds = SeedStore::new();
        sort_ops(traces, &mut index, &mut seeds).unwrap();
        DepGraph::derive(traces, &index)
    }

    #[test]
    fn test_store_then_fetch_edge() {
        let t1 = load("t1", &["tdb_open 1 0 2", "5 tdb_store 1:4b 2:5631 0 = 0", "tdb_close"]);
        let t2 = load("t2", &["tdb_open 1 0 2", "6 tdb_fetch 1:4b = 2:5631", "tdb_close"]);
        let graph = derive(&[t1, t2]);
        assert_eq!(
            graph.live_edges(),
            vec![Dep {
                needs: OpRef::new(1, 1),
                prereq: OpRef::new(0, 1),
            }]
        );
    }

    #[test]
    fn test_prereq_transaction_promoted_to_commit() {
        let t1 = load(
            "t1",
            &[
                "tdb_open 1 0 2",
                "1 tdb_transaction_start",
                "2 tdb_store 1:4b 1:56 0 = 0",
                "3 tdb_transaction_commit",
                "tdb_close",
            ],
        );
        let t2 = load("t2", &["tdb_open 1 0 2", "4 tdb_fetch 1:4b = 1:56", "tdb_close"]);
        let graph = derive(&[t1, t2]);
        // The fetch waits for the commit, not the store inside the
        // transaction.
        assert_eq!(
            graph.live_edges(),
            vec![Dep {
                needs: OpRef::new(1, 1),
                prereq: OpRef::new(0, 3),
            }]
        );
    }

    #[test]
    fn test_mutator_waits_for_intervening_reader() {
        let t1 = load("t1", &["tdb_open 1 0 2", "1 tdb_store 1:4b 1:56 0 = 0", "tdb_close"]);
        let t2 = load("t2", &["tdb_open 1 0 2", "2 tdb_fetch 1:4b = 1:56", "tdb_close"]);
        let t3 = load("t3", &["tdb_open 1 0 2", "3 tdb_store 1:4b 1:57 0 = 0", "tdb_close"]);
        let graph = derive(&[t1, t2, t3]);
        let edges = graph.live_edges();
        // Reader depends on the first mutator; second mutator depends on
        // the reader, and only transitively on the first mutator.
        assert!(edges.contains(&Dep {
            needs: OpRef::new(1, 1),
            prereq: OpRef::new(0, 1),
        }));
        assert!(edges.contains(&Dep {
            needs: OpRef::new(2, 1),
            prereq: OpRef::new(1, 1),
        }));
        assert!(!edges.iter().any(|dep| dep.needs.file == 2 && dep.prereq.file == 0));
    }

    #[test]
    fn test_dominated_edge_dropped() {
        let t1 = load(
            "t1",
            &[
                "tdb_open 1 0 2",
                "1 tdb_store 1:4b 1:56 0 = 0",
                "2 tdb_store 1:4c 1:57 0 = 0",
                "tdb_close",
            ],
        );
        let t2 = load(
            "t2",
            &[
                "tdb_open 1 0 2",
                "3 tdb_fetch 1:4b = 1:56",
                "4 tdb_fetch 1:4c = 1:57",
                "5 tdb_fetch 1:4b = 1:56",
                "tdb_close",
            ],
        );
        let graph = derive(&[t1, t2]);
        // The second fetch of K already waits (through the L fetch) for a
        // later op of t1 than K's mutator, so its own edge is dominated.
        assert!(graph.pre_lists(1)[3].is_empty());
        let edges = graph.live_edges();
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn test_write_traversals_serialized() {
        let t1 = load(
            "t1",
            &[
                "tdb_open 1 0 2",
                "1 tdb_traverse_start",
                "1 traversefn",
                "2 tdb_traverse_end",
                "tdb_close",
            ],
        );
        let t2 = load(
            "t2",
            &[
                "tdb_open 1 0 2",
                "5 tdb_traverse_start",
                "5 traversefn",
                "6 tdb_traverse_end",
                "tdb_close",
            ],
        );
        let graph = derive(&[t1, t2]);
        // The later write traversal starts only after the earlier one
        // ends.
        assert_eq!(
            graph.live_edges(),
            vec![Dep {
                needs: OpRef::new(1, 1),
                prereq: OpRef::new(0, 3),
            }]
        );
    }

    #[test]
    fn test_read_traversals_not_serialized() {
        let t1 = load(
            "t1",
            &[
                "tdb_open 1 0 2",
                "1 tdb_traverse_read_start",
                "1 traversefn",
                "2 tdb_traverse_end",
                "tdb_close",
            ],
        );
        let t2 = load(
            "t2",
            &[
                "tdb_open 1 0 2",
                "5 tdb_traverse_read_start",
                "5 traversefn",
                "6 tdb_traverse_end",
                "tdb_close",
            ],
        );
        let graph = derive(&[t1, t2]);
        assert_eq!(graph.live_edges(), vec![]);
    }
}
