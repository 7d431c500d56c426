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

//! Worker-per-trace execution.
//!
//! One worker process replays each trace. Every worker owns the read end
//! of a wakeup pipe and the write ends of everybody else's: before an op
//! runs, the worker drains its pre-edges by reading one token per edge,
//! and after it runs it fires its post-edges into the owning peers'
//! pipes. Tokens are edge ids, resolved against the shared edge arena the
//! children inherit across `fork`.
//!
//! A pipe read that times out outside a traversal is a real deadlock and
//! kills the worker. Inside a traversal it is a backoff: the worker
//! reports the blocked op to the parent and abandons the traversal, and
//! the parent rewrites the schedule and repeats the run. Timeouts are
//! deadline-based `poll`, not alarms, so nothing here touches signal
//! handlers.

use std::io::Write as _;
use std::os::fd::AsFd as _;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use bstr::BStr;
use bstr::ByteSlice as _;
use nix::fcntl::FcntlArg;
use nix::fcntl::OFlag;
use nix::fcntl::fcntl;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::wait::WaitStatus;
use nix::sys::wait::waitpid;
use nix::unistd::ForkResult;
use nix::unistd::fork;
use nix::unistd::pipe;
use thiserror::Error;

use crate::dep_graph::Dep;
use crate::dep_graph::DepGraph;
use crate::dep_graph::EdgeId;
use crate::file_store::FileStore;
use crate::replay::ReplayOptions;
use crate::store::Store;
use crate::store::StoreError;
use crate::trace::FileId;
use crate::trace::Op;
use crate::trace::OpKind;
use crate::trace::TraceFile;

/// A replay-time failure. The located variant carries the trace position
/// whose replay went wrong.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{file}:{line}: FAIL: {message}")]
    Fail {
        file: String,
        line: usize,
        message: String,
    },
    #[error("replay I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(StoreError),
}

/// Why `run_ops` stopped.
enum Stopped {
    /// Ran to the requested stop index.
    AtEnd(usize),
    /// Hit a traversal callback op; only valid inside a traversal.
    AtTraverse(usize),
    /// Timed out inside a traversal and reported a backoff event.
    BackedOff(usize),
}

fn data_eq(live: Option<&[u8]>, recorded: Option<&[u8]>) -> bool {
    // A missing record and an empty one compare equal, as the traced
    // tool's key comparison did.
    live.unwrap_or_default() == recorded.unwrap_or_default()
}

fn key_of(op: &Op) -> &BStr {
    op.key.as_deref().map_or(b"".as_bstr(), |key| key.as_bstr())
}

fn data_of(op: &Op) -> &BStr {
    op.data.as_deref().map_or(b"".as_bstr(), |data| data.as_bstr())
}

/// The chain-lock key rides in the data payload.
fn chain_key_of(op: &Op) -> &BStr {
    data_of(op)
}

pub(crate) struct Worker<'a> {
    pub file: FileId,
    pub traces: &'a [TraceFile],
    pub edges: &'a [Dep],
    /// Pending pre-edges of this file's ops; consumed as tokens arrive.
    pub pre: Vec<Vec<EdgeId>>,
    /// Post-edges of this file's ops.
    pub post: &'a [Vec<EdgeId>],
    pub store: FileStore,
    pub pre_fd: &'a OwnedFd,
    /// Write ends of every worker's wakeup pipe, indexed by file.
    pub peer_fds: &'a [OwnedFd],
    pub backoff_fd: &'a OwnedFd,
    pub options: &'a ReplayOptions,
}

impl Worker<'_> {
    fn ops(&self) -> &[Op] {
        &self.traces[self.file].ops
    }

    fn name(&self) -> String {
        self.traces[self.file].name()
    }

    fn fail(&self, i: usize, message: impl Into<String>) -> RunError {
        RunError::Fail {
            file: self.name(),
            line: i + 1,
            message: message.into(),
        }
    }

    pub fn run(&mut self) -> Result<(), RunError> {
        let stop = self.ops().len();
        match self.run_ops(1, stop, false)? {
            Stopped::AtEnd(_) => {
                if let Some(op) = (1..stop).find(|&i| !self.pre[i].is_empty()) {
                    tracing::debug!(file = %self.name(), op, "dependencies left unconsumed");
                }
                Ok(())
            }
            Stopped::AtTraverse(i) => {
                Err(self.fail(i, "traverse callback outside traversal"))
            }
            Stopped::BackedOff(_) => unreachable!("backoff outside traversal"),
        }
    }

    fn run_ops(
        &mut self,
        start: usize,
        stop: usize,
        in_traverse: bool,
    ) -> Result<Stopped, RunError> {
        let mut i = start;
        while i < stop {
            if !self.drain_pre(i, in_traverse)? {
                return Ok(Stopped::BackedOff(i));
            }
            let op = &self.traces[self.file].ops[i];
            match op.kind {
                OpKind::Open => {}
                OpKind::LockAll => {
                    let live = logical(self.store.lock_all())?;
                    self.check(i, "tdb_lockall", live, op.ret)?;
                }
                OpKind::LockAllMark => {
                    let live = logical(self.store.lock_all_mark())?;
                    self.check(i, "tdb_lockall_mark", live, op.ret)?;
                }
                OpKind::LockAllUnmark => {
                    let live = logical(self.store.lock_all_unmark())?;
                    self.check(i, "tdb_lockall_unmark", live, op.ret)?;
                }
                OpKind::LockAllNonblock => {
                    let live = logical(self.store.lock_all_nonblock())?;
                    if live != op.ret {
                        self.moan(i, "tdb_lockall_nonblock", live, op.ret);
                        if op.ret == 0 {
                            hard(self.store.lock_all())?;
                        } else {
                            hard(self.store.unlock_all())?;
                        }
                    }
                }
                OpKind::UnlockAll => {
                    let live = logical(self.store.unlock_all())?;
                    self.check(i, "tdb_unlockall", live, op.ret)?;
                }
                OpKind::LockAllRead => {
                    let live = logical(self.store.lock_all_read())?;
                    self.check(i, "tdb_lockall_read", live, op.ret)?;
                }
                OpKind::LockAllReadNonblock => {
                    let live = logical(self.store.lock_all_read_nonblock())?;
                    if live != op.ret {
                        self.moan(i, "tdb_lockall_read_nonblock", live, op.ret);
                        if op.ret == 0 {
                            hard(self.store.lock_all_read())?;
                        } else {
                            hard(self.store.unlock_all_read())?;
                        }
                    }
                }
                OpKind::UnlockAllRead => {
                    let live = logical(self.store.unlock_all_read())?;
                    self.check(i, "tdb_unlockall_read", live, op.ret)?;
                }
                OpKind::ChainLock => {
                    let live = logical(self.store.chain_lock(chain_key_of(op)))?;
                    self.check(i, "tdb_chainlock", live, op.ret)?;
                }
                OpKind::ChainLockNonblock => {
                    let live = logical(self.store.chain_lock_nonblock(chain_key_of(op)))?;
                    if live != op.ret {
                        self.moan(i, "tdb_chainlock_nonblock", live, op.ret);
                        if op.ret == 0 {
                            hard(self.store.chain_lock(chain_key_of(op)))?;
                        } else {
                            hard(self.store.chain_unlock(chain_key_of(op)))?;
                        }
                    }
                }
                OpKind::ChainLockMark => {
                    let live = logical(self.store.chain_lock_mark(chain_key_of(op)))?;
                    self.check(i, "tdb_chainlock_mark", live, op.ret)?;
                }
                OpKind::ChainLockUnmark => {
                    let live = logical(self.store.chain_lock_unmark(chain_key_of(op)))?;
                    self.check(i, "tdb_chainlock_unmark", live, op.ret)?;
                }
                OpKind::ChainUnlock => {
                    let live = logical(self.store.chain_unlock(chain_key_of(op)))?;
                    self.check(i, "tdb_chainunlock", live, op.ret)?;
                }
                OpKind::ChainLockRead => {
                    let live = logical(self.store.chain_lock_read(chain_key_of(op)))?;
                    self.check(i, "tdb_chainlock_read", live, op.ret)?;
                }
                OpKind::ChainUnlockRead => {
                    let live = logical(self.store.chain_unlock_read(chain_key_of(op)))?;
                    self.check(i, "tdb_chainunlock_read", live, op.ret)?;
                }
                OpKind::ParseRecord => {
                    let live = match self.store.parse_record(key_of(op)) {
                        Ok(len) => i32::try_from(len).unwrap_or(i32::MAX),
                        Err(err) if err.is_logical() => -1,
                        Err(err) => return Err(RunError::Store(err)),
                    };
                    self.check(i, "tdb_parse_record", live, op.ret)?;
                }
                OpKind::Exists => {
                    let live = i32::from(hard(self.store.exists(key_of(op)))?);
                    self.check(i, "tdb_exists", live, op.ret)?;
                }
                OpKind::Store => {
                    let live =
                        logical(self.store.store(key_of(op), data_of(op), op.flag))?;
                    self.check(i, "tdb_store", live, op.ret)?;
                }
                OpKind::Append => {
                    let live = logical(self.store.append(key_of(op), data_of(op)))?;
                    self.check(i, "tdb_append", live, op.ret)?;
                }
                OpKind::GetSeqnum => {
                    let live = hard(self.store.get_seqnum())? as i32;
                    self.check(i, "tdb_get_seqnum", live, op.ret)?;
                }
                OpKind::WipeAll => {
                    let live = logical(self.store.wipe_all())?;
                    self.check(i, "tdb_wipe_all", live, op.ret)?;
                }
                OpKind::TransactionStart => {
                    let live = logical(self.store.transaction_start())?;
                    self.check(i, "tdb_transaction_start", live, op.ret)?;
                }
                OpKind::TransactionCancel => {
                    let live = logical(self.store.transaction_cancel())?;
                    self.check(i, "tdb_transaction_cancel", live, op.ret)?;
                }
                OpKind::TransactionPrepareCommit => {
                    let live = logical(self.store.transaction_prepare_commit())?;
                    self.check(i, "tdb_transaction_prepare_commit", live, op.ret)?;
                }
                OpKind::TransactionCommit => {
                    let live = logical(self.store.transaction_commit())?;
                    self.check(i, "tdb_transaction_commit", live, op.ret)?;
                }
                OpKind::TraverseReadStart => {
                    i = self.op_traverse(i, false)?;
                }
                OpKind::TraverseStart => {
                    i = self.op_traverse(i, true)?;
                }
                OpKind::Traverse | OpKind::TraverseEndEarly => {
                    // We're in a traverse and have done our ops.
                    return Ok(Stopped::AtTraverse(i));
                }
                OpKind::TraverseEnd => {
                    return Err(self.fail(i, "unexpected end traverse"));
                }
                OpKind::FirstKey => {
                    let live = hard(self.store.first_key())?;
                    if !data_eq(live.as_deref().map(Vec::as_slice), op.data.as_deref().map(Vec::as_slice)) {
                        return Err(self.fail(i, "bad firstkey"));
                    }
                }
                OpKind::NextKey => {
                    let live = hard(self.store.next_key(key_of(op)))?;
                    if !data_eq(live.as_deref().map(Vec::as_slice), op.data.as_deref().map(Vec::as_slice)) {
                        return Err(self.fail(i, "bad nextkey"));
                    }
                }
                OpKind::Fetch => {
                    let live = hard(self.store.fetch(key_of(op)))?;
                    if !data_eq(live.as_deref().map(Vec::as_slice), op.data.as_deref().map(Vec::as_slice)) {
                        let size = live.map_or(0, |data| data.len());
                        return Err(self.fail(i, format!("bad fetch {size}")));
                    }
                }
                OpKind::Delete => {
                    let live = logical(self.store.delete(key_of(op)))?;
                    self.check(i, "tdb_delete", live, op.ret)?;
                }
                OpKind::Repack => {
                    // Traced only to mark the spot; the surrounding
                    // transaction and traversal carry its effects.
                    hard(self.store.repack())?;
                }
            }
            self.fire_post(i)?;
            i += 1;
        }
        Ok(Stopped::AtEnd(i))
    }

    /// Replays one traversal group starting at `start`; returns the index
    /// of its end op.
    fn op_traverse(&mut self, start: usize, write: bool) -> Result<usize, RunError> {
        let ops = &self.traces[self.file].ops;
        let len = ops[start].group_len;
        if len == 0 {
            return Err(self.fail(start, "traversal without end"));
        }
        let stop = start + len;
        let mut i = start + 1;

        if !ops[start].truncated {
            let records = self.store.traverse_begin(write).map_err(RunError::Store)?;
            for _record in records {
                if i == stop {
                    // This can happen if the traverse expects to be empty.
                    if len == 1 {
                        break;
                    }
                    return Err(self.fail(start, "traverse did not terminate"));
                }
                match ops[i].kind {
                    OpKind::Traverse => {}
                    // A previous backoff truncated the recording here.
                    OpKind::TraverseEndEarly => break,
                    _ => return Err(self.fail(start, "traverse terminated early")),
                }
                match self.run_ops(i + 1, stop, true)? {
                    Stopped::AtEnd(j) | Stopped::AtTraverse(j) => i = j,
                    Stopped::BackedOff(j) => {
                        i = j;
                        break;
                    }
                }
                if ops[i].kind != OpKind::Traverse {
                    break;
                }
            }
            self.store.traverse_end().map_err(RunError::Store)?;
        }

        // Traversing in a different order can leave recorded ops behind:
        // if the original went A (delete A), B, the replay may visit B
        // first. Whatever is left runs now, outside the traversal.
        while i != stop {
            match ops[i].kind {
                OpKind::Traverse | OpKind::TraverseEndEarly => i += 1,
                _ => {
                    i = match self.run_ops(i, stop, false)? {
                        Stopped::AtEnd(j) | Stopped::AtTraverse(j) => j,
                        Stopped::BackedOff(_) => unreachable!("backoff outside traversal"),
                    };
                }
            }
        }
        Ok(stop)
    }

    /// Waits until op `i` has no pending pre-edges. Returns false if the
    /// wait was abandoned for a backoff.
    fn drain_pre(&mut self, i: usize, in_traverse: bool) -> Result<bool, RunError> {
        while !self.pre[i].is_empty() {
            let timeout = if in_traverse {
                self.options.backoff_timeout
            } else {
                self.options.deadlock_timeout
            };
            match self.read_token(timeout)? {
                Some(edge_id) => {
                    let dep = self.edges[edge_id as usize];
                    debug_assert_eq!(dep.needs.file, self.file);
                    // The token can satisfy any of our ops, not just this
                    // one.
                    self.pre[dep.needs.op].retain(|&id| id != edge_id);
                }
                None if in_traverse => {
                    eprintln!("{}:{}: avoiding deadlock", self.name(), i + 1);
                    let mut desc = [0; 8];
                    desc[..4].copy_from_slice(&u32::try_from(self.file).unwrap().to_le_bytes());
                    desc[4..].copy_from_slice(&u32::try_from(i).unwrap().to_le_bytes());
                    write_all_fd(self.backoff_fd, &desc)?;
                    return Ok(false);
                }
                None => {
                    self.dump_pre(i);
                    return Err(self.fail(i, "timed out waiting for dependencies"));
                }
            }
        }
        Ok(true)
    }

    fn read_token(&self, timeout: Duration) -> Result<Option<EdgeId>, RunError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let millis = i32::try_from(remaining.as_millis().max(1)).unwrap_or(i32::MAX);
            let mut fds = [PollFd::new(self.pre_fd.as_fd(), PollFlags::POLLIN)];
            match nix::poll::poll(&mut fds, PollTimeout::try_from(millis).unwrap()) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(errno_io(errno).into()),
            }
        }
        let mut token = [0; 4];
        read_exact_fd(self.pre_fd, &mut token)?;
        Ok(Some(EdgeId::from_le_bytes(token)))
    }

    fn fire_post(&self, i: usize) -> Result<(), RunError> {
        for &edge_id in &self.post[i] {
            let dep = self.edges[edge_id as usize];
            write_all_fd(&self.peer_fds[dep.needs.file], &edge_id.to_le_bytes())?;
        }
        Ok(())
    }

    fn dump_pre(&self, i: usize) {
        if self.options.quiet {
            return;
        }
        let ops = self.ops();
        eprintln!(
            "{}:{} ({}) still waiting for:",
            self.name(),
            i + 1,
            ops[i].seqnum
        );
        for &edge_id in &self.pre[i] {
            let prereq = self.edges[edge_id as usize].prereq;
            eprintln!(
                "    {}:{} ({})",
                self.traces[prereq.file].name(),
                prereq.op + 1,
                self.traces[prereq.file].ops[prereq.op].seqnum
            );
        }
    }

    fn check(&self, i: usize, what: &str, live: i32, expected: i32) -> Result<(), RunError> {
        if live == expected {
            Ok(())
        } else {
            Err(self.fail(i, format!("{what} gave {live} not {expected}")))
        }
    }

    /// Non-blocking lock acquisition is racy, so a divergence here is
    /// compensated rather than fatal.
    fn moan(&self, i: usize, what: &str, live: i32, expected: i32) {
        eprintln!(
            "{}:{}: {what} gave {live} not {expected}",
            self.name(),
            i + 1
        );
    }
}

/// Maps a logically-failing store call to the traced 0/-1 convention.
fn logical(result: Result<(), StoreError>) -> Result<i32, RunError> {
    match result {
        Ok(()) => Ok(0),
        Err(err) if err.is_logical() => Ok(-1),
        Err(err) => Err(RunError::Store(err)),
    }
}

/// Propagates any store failure as fatal.
fn hard<T>(result: Result<T, StoreError>) -> Result<T, RunError> {
    result.map_err(RunError::Store)
}

fn errno_io(errno: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(errno as i32)
}

fn write_all_fd(fd: &OwnedFd, mut buf: &[u8]) -> Result<(), RunError> {
    while !buf.is_empty() {
        match nix::unistd::write(fd, buf) {
            Ok(0) => return Err(RunError::Io(std::io::ErrorKind::WriteZero.into())),
            Ok(n) => buf = &buf[n..],
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno_io(errno).into()),
        }
    }
    Ok(())
}

fn read_exact_fd(fd: &OwnedFd, buf: &mut [u8]) -> Result<(), RunError> {
    let mut at = 0;
    while at < buf.len() {
        match nix::unistd::read(fd, &mut buf[at..]) {
            Ok(0) => return Err(RunError::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(n) => at += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno_io(errno).into()),
        }
    }
    Ok(())
}

fn set_nonblock(fd: &OwnedFd) -> Result<(), RunError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_io)?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_io)?;
    Ok(())
}

/// Result of one fleet run.
pub(crate) struct FleetOutcome {
    pub elapsed: Duration,
    pub failed: bool,
    /// Read end of the backoff pipe, drained by [`handle_backoff`].
    pub backoff_r: OwnedFd,
}

/// Forks one worker per trace, releases them simultaneously through the
/// start gate, and waits for the fleet.
pub(crate) fn run_fleet(
    traces: &[TraceFile],
    graph: &DepGraph,
    store_path: &Path,
    options: &ReplayOptions,
) -> Result<FleetOutcome, RunError> {
    let worker_pipes = traces
        .iter()
        .map(|_| pipe())
        .collect::<Result<Vec<_>, _>>()
        .map_err(errno_io)?;
    let peer_fds = worker_pipes
        .iter()
        .map(|(_, w)| w.try_clone())
        .collect::<Result<Vec<_>, _>>()?;
    let (backoff_r, backoff_w) = pipe().map_err(errno_io)?;
    set_nonblock(&backoff_r)?;
    set_nonblock(&backoff_w)?;
    let (gate_r, gate_w) = pipe().map_err(errno_io)?;

    // Anything buffered would be flushed once per child otherwise.
    std::io::stdout().flush().ok();
    std::io::stderr().flush().ok();

    let run_worker = |file: FileId| -> Result<(), RunError> {
        // Never truncate or clear: the parent alone initializes the
        // image.
        let store =
            FileStore::open(store_path, traces[file].hash_size).map_err(RunError::Store)?;
        // This read also catches the parent exiting early.
        let mut gate = [0; 1];
        read_exact_fd(&gate_r, &mut gate)?;
        Worker {
            file,
            traces,
            edges: graph.edges(),
            pre: graph.pre_lists(file),
            post: graph.post_lists(file),
            store,
            pre_fd: &worker_pipes[file].0,
            peer_fds: &peer_fds,
            backoff_fd: &backoff_w,
            options,
        }
        .run()
    };

    let mut children = vec![];
    for file in 0..traces.len() {
        match unsafe { fork() }.map_err(errno_io)? {
            ForkResult::Child => {
                let code = match run_worker(file) {
                    Ok(()) => 0,
                    Err(err) => {
                        eprintln!("{err}");
                        1
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => children.push(child),
        }
    }

    // Let the children open the store and park on the gate.
    std::thread::sleep(options.settle_delay);
    let start = Instant::now();
    // Any write of sufficient length will do.
    write_all_fd(&gate_w, &vec![0; children.len()])?;

    let mut failed = false;
    for &child in &children {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::debug!(%pid, code, "worker failed");
                failed = true;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                eprintln!("Child {pid} died with signal {}", signal as i32);
                failed = true;
            }
            Ok(_) => failed = true,
            Err(errno) => return Err(errno_io(errno).into()),
        }
    }
    let elapsed = start.elapsed();

    Ok(FleetOutcome {
        elapsed,
        failed,
        backoff_r,
    })
}

/// Replays a single trace in-process; simpler to debug, and a lone trace
/// has no cross-file edges to wait for anyway.
pub(crate) fn run_single(
    traces: &[TraceFile],
    graph: &DepGraph,
    store_path: &Path,
    options: &ReplayOptions,
) -> Result<Duration, RunError> {
    let (pre_r, _pre_w) = pipe().map_err(errno_io)?;
    let (_backoff_r, backoff_w) = pipe().map_err(errno_io)?;
    set_nonblock(&backoff_w)?;
    let store = FileStore::open(store_path, traces[0].hash_size).map_err(RunError::Store)?;
    let start = Instant::now();
    Worker {
        file: 0,
        traces,
        edges: graph.edges(),
        pre: graph.pre_lists(0),
        post: graph.post_lists(0),
        store,
        pre_fd: &pre_r,
        peer_fds: &[],
        backoff_fd: &backoff_w,
        options,
    }
    .run()?;
    Ok(start.elapsed())
}

/// Drains the backoff pipe and rewrites every reported traversal. Returns
/// true if anything was rewritten, in which case the whole run repeats.
///
/// Walking back from the blocked op, the nearest callback becomes an
/// early end, truncating the traversal there on the next run. If the
/// block happened before any callback, the traversal start is flagged
/// truncated instead: the runtime then skips the store traversal and
/// drains the whole group in place. Either way dependency endpoints are
/// group boundaries and stay valid.
pub(crate) fn handle_backoff(
    traces: &mut [TraceFile],
    backoff_r: &OwnedFd,
) -> Result<bool, RunError> {
    let mut handled = false;
    loop {
        let mut desc = [0; 8];
        match nix::unistd::read(backoff_r, &mut desc) {
            Ok(0) => break,
            Ok(8) => {}
            Ok(n) => {
                return Err(RunError::Io(std::io::Error::other(format!(
                    "short backoff descriptor: {n} bytes"
                ))));
            }
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(errno) => return Err(errno_io(errno).into()),
        }
        handled = true;
        let file = u32::from_le_bytes(desc[..4].try_into().unwrap()) as usize;
        let op_num = u32::from_le_bytes(desc[4..].try_into().unwrap()) as usize;
        let ops = &mut traces[file].ops;
        for i in (1..=op_num).rev() {
            if ops[i].kind == OpKind::Traverse {
                ops[i].kind = OpKind::TraverseEndEarly;
                break;
            } else if ops[i].starts_traverse() {
                ops[i].truncated = true;
                break;
            }
        }
        tracing::info!(file, op = op_num, "backoff: traversal rewritten");
    }
    Ok(handled)
}
