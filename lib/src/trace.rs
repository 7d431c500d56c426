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

//! Loading of captured tdb operation traces.
//!
//! A trace file is a UTF-8 text log produced by a tracing tdb build: one
//! `tdb_open` header line, then one line per operation carrying the global
//! sequence counter, the operation name, its arguments and the recorded
//! return value, terminated by `tdb_close`. Loading parses every line into
//! an [`Op`] and then resolves grouping: transactions, chain-locks and
//! traversals are bracketed spans whose members point back at the group
//! start.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use thiserror::Error;

/// Index of a trace file within the replayed fleet.
pub type FileId = usize;

/// Position of one operation: trace file and index into its op vector.
///
/// Index 0 is the `tdb_open` header pseudo-op, so real operations start at
/// index 1 and an index of 0 can double as a "no group" sentinel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OpRef {
    pub file: FileId,
    pub op: usize,
}

impl OpRef {
    pub fn new(file: FileId, op: usize) -> Self {
        Self { file, op }
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}:{}", self.file, self.op + 1)
    }
}

/// Flag argument of `tdb_store`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StoreFlag {
    /// `TDB_REPLACE` (or no flag): overwrite or create.
    #[default]
    Replace,
    /// `TDB_INSERT`: fail if the key already exists.
    Insert,
    /// `TDB_MODIFY`: fail unless the key already exists.
    Modify,
}

impl StoreFlag {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 | 1 => Some(Self::Replace),
            2 => Some(Self::Insert),
            3 => Some(Self::Modify),
            _ => None,
        }
    }
}

/// The recorded operation kinds.
#[expect(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpKind {
    /// Header pseudo-op occupying index 0 of every op vector.
    Open,
    LockAll,
    LockAllMark,
    LockAllUnmark,
    LockAllNonblock,
    UnlockAll,
    LockAllRead,
    LockAllReadNonblock,
    UnlockAllRead,
    ChainLock,
    ChainLockNonblock,
    ChainLockMark,
    ChainLockUnmark,
    ChainUnlock,
    ChainLockRead,
    ChainUnlockRead,
    ParseRecord,
    Exists,
    Store,
    Append,
    GetSeqnum,
    WipeAll,
    TransactionStart,
    TransactionCancel,
    TransactionPrepareCommit,
    TransactionCommit,
    TraverseReadStart,
    TraverseStart,
    TraverseEnd,
    /// One record callback within a traversal.
    Traverse,
    /// Synthetic early termination of a traversal, inserted by backoff.
    TraverseEndEarly,
    FirstKey,
    NextKey,
    Fetch,
    Delete,
    Repack,
}

/// A single recorded operation.
#[derive(Clone, Debug)]
pub struct Op {
    /// Global sequence counter sampled before the operation ran. Only
    /// monotone-ish: the capturer reads it without locking.
    pub seqnum: u32,
    pub kind: OpKind,
    /// Key the operation addresses, if it addresses one through the record
    /// namespace. Chain-lock keys live in `data` instead; they don't have
    /// to name an existing record and must not be indexed.
    pub key: Option<BString>,
    /// Data payload: stored/appended bytes, a recorded fetch result, a
    /// chain-lock key, or a recorded firstkey/nextkey result.
    pub data: Option<BString>,
    /// Recorded return value.
    pub ret: i32,
    /// Store flag; meaningful for [`OpKind::Store`] only.
    pub flag: StoreFlag,
    /// Recorded post-image of an append.
    pub append_post: Option<BString>,
    /// Index of the owning group's start op, 0 if none.
    pub group_start: usize,
    /// For group-starting ops, the number of ops the group spans (the end
    /// op lives at `start + group_len`). 0 until analysis fills it in.
    pub group_len: usize,
    /// Set by backoff when this traversal start was emptied: the runtime
    /// must not traverse and instead drains the whole group in place.
    pub truncated: bool,
}

impl Op {
    fn new(seqnum: u32, kind: OpKind) -> Self {
        Self {
            seqnum,
            kind,
            key: None,
            data: None,
            ret: 0,
            flag: StoreFlag::Replace,
            append_post: None,
            group_start: 0,
            group_len: 0,
            truncated: false,
        }
    }

    pub fn starts_transaction(&self) -> bool {
        self.kind == OpKind::TransactionStart
    }

    pub fn starts_traverse(&self) -> bool {
        matches!(self.kind, OpKind::TraverseStart | OpKind::TraverseReadStart)
    }

    pub fn starts_chainlock(&self) -> bool {
        matches!(self.kind, OpKind::ChainLock | OpKind::ChainLockRead)
            || (self.kind == OpKind::ChainLockNonblock && self.ret == 0)
    }

    /// The pre-image of an append, derived by subtraction from the recorded
    /// post-image and the appended bytes.
    pub fn append_pre(&self) -> Option<&BStr> {
        let post = self.append_post.as_deref()?;
        let appended = self.data.as_deref().map_or(0, |data| data.len());
        Some(post[..post.len() - appended].as_bstr())
    }
}

/// True if op `i` belongs to a transaction group.
pub fn in_transaction(ops: &[Op], i: usize) -> bool {
    ops[i].group_start != 0 && ops[ops[i].group_start].starts_transaction()
}

/// True if op `i` belongs to a traversal group.
pub fn in_traverse(ops: &[Op], i: usize) -> bool {
    ops[i].group_start != 0 && ops[ops[i].group_start].starts_traverse()
}

/// True if op `i` belongs to a chain-lock group.
pub fn in_chainlock(ops: &[Op], i: usize) -> bool {
    ops[i].group_start != 0 && ops[ops[i].group_start].starts_chainlock()
}

/// True if the transaction starting at `start` ends in a commit rather
/// than a cancel.
pub fn successful_transaction(ops: &[Op], start: usize) -> bool {
    ops[start].starts_transaction()
        && ops[start + ops[start].group_len].kind == OpKind::TransactionCommit
}

/// One loaded trace file: open parameters plus the annotated op vector.
#[derive(Clone, Debug)]
pub struct TraceFile {
    pub path: PathBuf,
    pub hash_size: u32,
    pub tdb_flags: u32,
    pub open_flags: u32,
    /// Ops, with the header pseudo-op at index 0.
    pub ops: Vec<Op>,
}

impl TraceFile {
    /// Short name used in diagnostics.
    pub fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// A malformed or inconsistent trace line, located by its 1-based line
/// number.
#[derive(Debug, Error)]
#[error("{file}:{line}: FAIL: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub message: String,
}

struct Loader<'a> {
    path: &'a Path,
    ops: Vec<Op>,
}

impl Loader<'_> {
    fn fail(&self, line: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            file: self.path.display().to_string(),
            line,
            message: message.into(),
        }
    }

    /// Parses `<dsize>:<hex>` or the literal `NULL`.
    fn record(&self, line: usize, word: &str) -> Result<Option<BString>, ParseError> {
        if word == "NULL" {
            return Ok(None);
        }
        let (size, hex) = word
            .split_once(':')
            .ok_or_else(|| self.fail(line, format!("invalid tdb data '{word}'")))?;
        let size: usize = size
            .parse()
            .map_err(|_| self.fail(line, format!("invalid tdb data '{word}'")))?;
        if hex.len() != size * 2 {
            return Err(self.fail(line, format!("invalid tdb data '{word}'")));
        }
        let mut data = Vec::with_capacity(size);
        for chunk in hex.as_bytes().chunks_exact(2) {
            let hi = hex_value(chunk[0])
                .ok_or_else(|| self.fail(line, invalid_hex_char(chunk[0])))?;
            let lo = hex_value(chunk[1])
                .ok_or_else(|| self.fail(line, invalid_hex_char(chunk[1])))?;
            data.push(hi << 4 | lo);
        }
        Ok(Some(data.into()))
    }

    fn ret(&self, line: usize, word: &str) -> Result<i32, ParseError> {
        word.parse()
            .map_err(|_| self.fail(line, format!("invalid return value '{word}'")))
    }

    /// Finds the nearest preceding unclosed group start matching `pred`.
    fn find_group_start(&self, from: usize, pred: impl Fn(&Op) -> bool) -> Option<usize> {
        (1..from)
            .rev()
            .find(|&i| pred(&self.ops[i]) && self.ops[i].group_len == 0)
    }

    fn analyze_transaction(&mut self, op_num: usize, line: usize) -> Result<(), ParseError> {
        let start = self
            .find_group_start(op_num, |op| op.kind == OpKind::TransactionStart)
            .ok_or_else(|| self.fail(line, "no transaction start found"))?;
        self.ops[start].group_len = op_num - start;
        // Nested transactions roll into the outer one.
        for i in start..=op_num {
            self.ops[i].group_start = start;
        }
        Ok(())
    }

    fn analyze_chainlock(&mut self, op_num: usize, line: usize) -> Result<(), ParseError> {
        let start = self
            .find_group_start(op_num, |op| op.kind == OpKind::ChainLock)
            .or_else(|| self.find_group_start(op_num, |op| op.kind == OpKind::ChainLockRead))
            .or_else(|| {
                self.find_group_start(op_num, |op| {
                    op.kind == OpKind::ChainLockNonblock && op.ret == 0
                })
            })
            .ok_or_else(|| self.fail(line, "no initial chainlock found"))?;
        // Nested chain-locks on a different key would deadlock against
        // another process doing the same in the opposite order.
        if self.ops[start].data != self.ops[op_num].data {
            return Err(self.fail(line, "nested chainlock calls?"));
        }
        self.ops[start].group_len = op_num - start;
        for i in start..=op_num {
            self.ops[i].group_start = start;
        }
        Ok(())
    }

    fn analyze_traverse(&mut self, op_num: usize, line: usize) -> Result<(), ParseError> {
        let start = self
            .find_group_start(op_num, |op| op.kind == OpKind::TraverseStart)
            .or_else(|| self.find_group_start(op_num, |op| op.kind == OpKind::TraverseReadStart))
            .ok_or_else(|| self.fail(line, "no traversal start found"))?;
        self.ops[start].group_len = op_num - start;
        // Keep nested traversals and chain-locks attached to their inner
        // start.
        for i in start..=op_num {
            if self.ops[i].group_start == 0 {
                self.ops[i].group_start = start;
            }
        }
        Ok(())
    }

    /// A trace can end with a transaction still open (the traced process
    /// was allowed to `tdb_close` mid-transaction). Synthesize the cancel
    /// so the group closes.
    fn cancel_open_transaction(&mut self) -> Result<(), ParseError> {
        let Some(start) =
            self.find_group_start(self.ops.len(), |op| op.kind == OpKind::TransactionStart)
        else {
            return Ok(());
        };
        let op_num = self.ops.len();
        self.ops
            .push(Op::new(self.ops[start].seqnum, OpKind::TransactionCancel));
        self.analyze_transaction(op_num, op_num + 1)
    }

    fn add_line(&mut self, line: usize, words: &[&str]) -> Result<(), ParseError> {
        let [seqnum, opname, args @ ..] = words else {
            return Err(self.fail(line, "Expected seqnum number and op"));
        };
        let seqnum: u32 = seqnum
            .parse()
            .map_err(|_| self.fail(line, format!("invalid seqnum '{seqnum}'")))?;
        let kind = match *opname {
            "tdb_lockall" => OpKind::LockAll,
            "tdb_lockall_mark" => OpKind::LockAllMark,
            "tdb_lockall_unmark" => OpKind::LockAllUnmark,
            "tdb_lockall_nonblock" => OpKind::LockAllNonblock,
            "tdb_unlockall" => OpKind::UnlockAll,
            "tdb_lockall_read" => OpKind::LockAllRead,
            "tdb_lockall_read_nonblock" => OpKind::LockAllReadNonblock,
            "tdb_unlockall_read" => OpKind::UnlockAllRead,
            "tdb_chainlock" => OpKind::ChainLock,
            "tdb_chainlock_nonblock" => OpKind::ChainLockNonblock,
            "tdb_chainlock_mark" => OpKind::ChainLockMark,
            "tdb_chainlock_unmark" => OpKind::ChainLockUnmark,
            "tdb_chainunlock" => OpKind::ChainUnlock,
            "tdb_chainlock_read" => OpKind::ChainLockRead,
            "tdb_chainunlock_read" => OpKind::ChainUnlockRead,
            "tdb_parse_record" => OpKind::ParseRecord,
            "tdb_exists" => OpKind::Exists,
            "tdb_store" => OpKind::Store,
            "tdb_append" => OpKind::Append,
            "tdb_get_seqnum" => OpKind::GetSeqnum,
            "tdb_wipe_all" => OpKind::WipeAll,
            "tdb_transaction_start" => OpKind::TransactionStart,
            "tdb_transaction_cancel" => OpKind::TransactionCancel,
            "tdb_transaction_prepare_commit" => OpKind::TransactionPrepareCommit,
            "tdb_transaction_commit" => OpKind::TransactionCommit,
            "tdb_traverse_read_start" => OpKind::TraverseReadStart,
            "tdb_traverse_start" => OpKind::TraverseStart,
            "tdb_traverse_end" => OpKind::TraverseEnd,
            "tdb_traverse" | "traversefn" => OpKind::Traverse,
            "tdb_firstkey" => OpKind::FirstKey,
            "tdb_nextkey" => OpKind::NextKey,
            "tdb_fetch" => OpKind::Fetch,
            "tdb_delete" => OpKind::Delete,
            "tdb_repack" => OpKind::Repack,
            _ => return Err(self.fail(line, format!("Unknown operation '{opname}'"))),
        };

        let op_num = self.ops.len();
        let mut op = Op::new(seqnum, kind);
        match kind {
            OpKind::LockAll
            | OpKind::LockAllMark
            | OpKind::LockAllUnmark
            | OpKind::UnlockAll
            | OpKind::LockAllRead
            | OpKind::UnlockAllRead
            | OpKind::WipeAll
            | OpKind::TransactionStart
            | OpKind::TransactionPrepareCommit
            | OpKind::TransactionCommit
            | OpKind::TransactionCancel
            | OpKind::TraverseReadStart
            | OpKind::TraverseStart
            | OpKind::Repack => {
                if !args.is_empty() {
                    return Err(self.fail(line, "Expected no arguments"));
                }
            }
            OpKind::LockAllNonblock | OpKind::LockAllReadNonblock | OpKind::GetSeqnum => {
                let ["=", ret] = args else {
                    return Err(self.fail(line, "Expect = <ret>"));
                };
                op.ret = self.ret(line, ret)?;
            }
            OpKind::ChainLock
            | OpKind::ChainLockRead
            | OpKind::ChainLockMark
            | OpKind::ChainLockUnmark
            | OpKind::ChainUnlock
            | OpKind::ChainUnlockRead => {
                let [key] = args else {
                    return Err(self.fail(line, "Expected just a key"));
                };
                // A chain-lock key isn't a key in the normal sense; it
                // doesn't have to be in the db at all, so it must not be
                // indexed.
                op.data = self.record(line, key)?;
            }
            OpKind::ChainLockNonblock => {
                let [key, "=", ret] = args else {
                    return Err(self.fail(line, "Expected <key> = <ret>"));
                };
                op.data = self.record(line, key)?;
                op.ret = self.ret(line, ret)?;
            }
            OpKind::ParseRecord | OpKind::Exists | OpKind::Delete => {
                let [key, "=", ret] = args else {
                    return Err(self.fail(line, "Expected <key> = <ret>"));
                };
                op.key = self.record(line, key)?;
                op.ret = self.ret(line, ret)?;
            }
            OpKind::Fetch | OpKind::NextKey => {
                let [key, "=", data] = args else {
                    return Err(self.fail(line, "Expected <key> = <data>"));
                };
                op.key = self.record(line, key)?;
                op.data = self.record(line, data)?;
            }
            OpKind::FirstKey => {
                let ["=", data] = args else {
                    return Err(self.fail(line, "Expect = <data>"));
                };
                op.data = self.record(line, data)?;
            }
            OpKind::Store => {
                let [key, data, flag, "=", ret] = args else {
                    return Err(self.fail(line, "Expect <key> <data> <flag> = <ret>"));
                };
                op.key = self.record(line, key)?;
                op.data = self.record(line, data)?;
                let raw = parse_u32(flag)
                    .ok_or_else(|| self.fail(line, format!("invalid store flag '{flag}'")))?;
                op.flag = StoreFlag::from_raw(raw)
                    .ok_or_else(|| self.fail(line, format!("invalid store flag '{flag}'")))?;
                op.ret = self.ret(line, ret)?;
            }
            OpKind::Append => {
                let [key, data, "=", post] = args else {
                    return Err(self.fail(line, "Expect <key> <data> = <rec>"));
                };
                op.key = self.record(line, key)?;
                op.data = self.record(line, data)?;
                op.append_post = self.record(line, post)?;
                let appended = op.data.as_deref().map_or(0, |data| data.len());
                let post_len = op.append_post.as_deref().map_or(0, |post| post.len());
                if post_len < appended {
                    return Err(self.fail(line, "append post-image shorter than appended data"));
                }
            }
            OpKind::Traverse => {
                // Keys and data of traverse callbacks are not used; the
                // records are reconstructed by re-traversal at replay time.
                // The long form still gets its arity checked.
                match args {
                    [] => {}
                    [key, "=", data] => {
                        self.record(line, key)?;
                        self.record(line, data)?;
                    }
                    _ => return Err(self.fail(line, "Expected <key> = <data>")),
                }
            }
            OpKind::TraverseEnd => match args {
                [] => {}
                ["=", ret] => op.ret = self.ret(line, ret)?,
                _ => return Err(self.fail(line, "expect = <num>")),
            },
            OpKind::TraverseEndEarly | OpKind::Open => unreachable!(),
        }
        self.ops.push(op);

        match kind {
            OpKind::TransactionCommit | OpKind::TransactionCancel => {
                self.analyze_transaction(op_num, line)
            }
            OpKind::ChainUnlock | OpKind::ChainUnlockRead => self.analyze_chainlock(op_num, line),
            OpKind::TraverseEnd => self.analyze_traverse(op_num, line),
            _ => Ok(()),
        }
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn invalid_hex_char(c: u8) -> String {
    format!("invalid hex character '{}'", char::from(c))
}

/// Parses a u32 that may be written in hex (flags sometimes are).
fn parse_u32(word: &str) -> Option<u32> {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        word.parse().ok()
    }
}

/// Loads and analyzes one trace file.
pub fn load_trace_file(path: &Path) -> Result<TraceFile, ParseError> {
    let mut loader = Loader { path, ops: vec![] };
    let contents = fs::read_to_string(path).map_err(|err| ParseError {
        file: path.display().to_string(),
        line: 0,
        message: format!("cannot read trace: {err}"),
    })?;
    let mut lines = contents.lines().enumerate();

    let Some((_, header)) = lines.next() else {
        return Err(loader.fail(1, "trace is empty"));
    };
    let words = header.split_whitespace().collect::<Vec<_>>();
    // The capturer prefixes the header with its own token in some
    // versions; accept both shapes.
    let params = match words.as_slice() {
        ["tdb_open", rest @ ..] => rest,
        [_, "tdb_open", rest @ ..] => rest,
        _ => return Err(loader.fail(1, "does not start with tdb_open")),
    };
    let [hash_size, tdb_flags, open_flags] = params else {
        return Err(loader.fail(1, "Expect <hashsize> <tdb_flags> <open_flags>"));
    };
    let hash_size = parse_u32(hash_size)
        .ok_or_else(|| loader.fail(1, format!("invalid hash size '{hash_size}'")))?;
    let tdb_flags = parse_u32(tdb_flags)
        .ok_or_else(|| loader.fail(1, format!("invalid tdb flags '{tdb_flags}'")))?;
    let open_flags = parse_u32(open_flags)
        .ok_or_else(|| loader.fail(1, format!("invalid open flags '{open_flags}'")))?;
    loader.ops.push(Op::new(0, OpKind::Open));

    let mut closed = false;
    for (index, text) in lines {
        let line = index + 1;
        let words = text.split_whitespace().collect::<Vec<_>>();
        if words.is_empty() {
            continue;
        }
        if closed {
            return Err(loader.fail(line, "lines after tdb_close"));
        }
        if words[0] == "tdb_close" || words.get(1) == Some(&"tdb_close") {
            closed = true;
            continue;
        }
        loader.add_line(line, &words)?;
    }
    if !closed {
        tracing::warn!(
            file = %path.display(),
            "last operation is not tdb_close: incomplete?"
        );
    }
    loader.cancel_open_transaction()?;

    Ok(TraceFile {
        path: path.to_path_buf(),
        hash_size,
        tdb_flags,
        open_flags,
        ops: loader.ops,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn load(lines: &[&str]) -> Result<TraceFile, ParseError> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        load_trace_file(file.path())
    }

    #[test]
    fn test_load_store_line() {
        let trace = load(&[
            "tdb_open 1024 0 2",
            "1 tdb_store 1:41 1:42 1 = 0",
            "tdb_close",
        ])
        .unwrap();
        assert_eq!(trace.hash_size, 1024);
        assert_eq!(trace.ops.len(), 2);
        let op = &trace.ops[1];
        assert_eq!(op.kind, OpKind::Store);
        assert_eq!(op.seqnum, 1);
        assert_eq!(op.key, Some(BString::from("A")));
        assert_eq!(op.data, Some(BString::from("B")));
        assert_eq!(op.flag, StoreFlag::Replace);
        assert_eq!(op.ret, 0);
    }

    #[test]
    fn test_load_append_derives_pre() {
        let trace = load(&[
            "tdb_open 1024 0 2",
            "1 tdb_append 1:41 2:4243 = 3:414243",
            "tdb_close",
        ])
        .unwrap();
        let op = &trace.ops[1];
        assert_eq!(op.append_pre().unwrap(), b"A".as_bstr());
        assert_eq!(op.append_post, Some(BString::from("ABC")));
    }

    #[test]
    fn test_load_null_record() {
        let trace = load(&["tdb_open 1 0 2", "1 tdb_fetch 1:4b = NULL", "tdb_close"]).unwrap();
        assert_eq!(trace.ops[1].data, None);
    }

    #[test]
    fn test_load_rejects_bad_hex() {
        let err = load(&["tdb_open 1 0 2", "1 tdb_fetch 1:zz = NULL", "tdb_close"]).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("invalid hex character"));
    }

    #[test]
    fn test_load_rejects_unknown_op() {
        let err = load(&["tdb_open 1 0 2", "1 tdb_frobnicate", "tdb_close"]).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("tdb_frobnicate"));
    }

    #[test]
    fn test_transaction_grouping() {
        let trace = load(&[
            "tdb_open 1 0 2",
            "1 tdb_transaction_start",
            "2 tdb_store 1:41 1:58 2 = 0",
            "3 tdb_transaction_commit",
            "tdb_close",
        ])
        .unwrap();
        assert_eq!(trace.ops[1].group_len, 2);
        for i in 1..=3 {
            assert_eq!(trace.ops[i].group_start, 1);
        }
        assert!(successful_transaction(&trace.ops, 1));
    }

    #[test]
    fn test_nested_traverse_keeps_inner_start() {
        let trace = load(&[
            "tdb_open 1 0 2",
            "1 tdb_traverse_start",
            "2 traversefn",
            "3 tdb_chainlock 1:4b",
            "4 tdb_chainunlock 1:4b",
            "5 tdb_traverse_end",
            "tdb_close",
        ])
        .unwrap();
        assert_eq!(trace.ops[1].group_len, 4);
        assert_eq!(trace.ops[2].group_start, 1);
        // The chain-lock pair keeps its own group.
        assert_eq!(trace.ops[3].group_start, 3);
        assert_eq!(trace.ops[4].group_start, 3);
    }

    #[test]
    fn test_chainlock_key_mismatch_is_error() {
        let err = load(&[
            "tdb_open 1 0 2",
            "1 tdb_chainlock 1:4b",
            "2 tdb_chainunlock 1:4c",
            "tdb_close",
        ])
        .unwrap_err();
        assert!(err.message.contains("nested chainlock"));
    }

    #[test]
    fn test_tail_synthesizes_cancel() {
        let trace = load(&[
            "tdb_open 1 0 2",
            "1 tdb_transaction_start",
            "2 tdb_store 1:41 1:58 0 = 0",
        ])
        .unwrap();
        let last = trace.ops.last().unwrap();
        assert_eq!(last.kind, OpKind::TransactionCancel);
        assert_eq!(trace.ops[1].group_len, 2);
    }
}
