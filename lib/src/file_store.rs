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

//! A deliberately simple file-backed store.
//!
//! One file is shared by every worker process. Mutations rewrite the
//! whole record image under an fcntl write lock; reads take the matching
//! read lock. That is crude next to a real hash store, but it gives the
//! replay exactly what it needs: real cross-process blocking, a sequence
//! number that bumps on every successful mutation, transactions that hold
//! the whole-store lock from start to commit, and traversals that hold it
//! from begin to end.
//!
//! Lock ranges are virtual: byte 0 is the whole-store ("allrecord") lock
//! and one byte per hash bucket above [`CHAIN_LOCK_BASE`] carries the
//! chain locks, so chain contention is real across processes too.

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt as _;
use std::path::Path;

use bstr::BStr;
use bstr::BString;
use bstr::ByteSlice as _;
use nix::fcntl::FcntlArg;
use nix::fcntl::fcntl;
use nix::libc;

use crate::key_index::key_hash;
use crate::store::Store;
use crate::store::StoreError;
use crate::trace::StoreFlag;

const MAGIC: &[u8; 8] = b"tdbrply\x01";
const HEADER_LEN: usize = 16;

const ALLRECORD_LOCK_OFF: u64 = 0;
const CHAIN_LOCK_BASE: u64 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LockKind {
    Read,
    Write,
}

struct Transaction {
    depth: u32,
    seqnum: u32,
    records: Vec<(BString, BString)>,
}

/// File-backed [`Store`] suitable for concurrent access from a fleet of
/// worker processes.
pub struct FileStore {
    file: File,
    hash_buckets: u32,
    /// Whole-store lock state: kind and re-entry depth.
    allrecord: Option<(LockKind, u32)>,
    /// Chain lock state keyed by lock byte offset.
    chains: HashMap<u64, (LockKind, u32)>,
    tx: Option<Transaction>,
    /// Open traversals; `true` entries own an allrecord lock reference.
    traversals: Vec<bool>,
}

impl FileStore {
    /// Creates (or truncates) the store file with an empty image.
    pub fn create(path: &Path, hash_size: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let store = Self::from_file(file, hash_size);
        store.write_image(0, &[])?;
        Ok(store)
    }

    /// Opens an existing store file.
    pub fn open(path: &Path, hash_size: u32) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file, hash_size))
    }

    fn from_file(file: File, hash_size: u32) -> Self {
        Self {
            file,
            hash_buckets: hash_size.max(1),
            allrecord: None,
            chains: HashMap::new(),
            tx: None,
            traversals: vec![],
        }
    }

    fn chain_offset(&self, key: &BStr) -> u64 {
        CHAIN_LOCK_BASE + u64::from(key_hash(key) % self.hash_buckets)
    }

    fn fcntl_lock(&self, start: u64, kind: Option<LockKind>, wait: bool) -> Result<(), StoreError> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = match kind {
            Some(LockKind::Write) => libc::F_WRLCK,
            Some(LockKind::Read) => libc::F_RDLCK,
            None => libc::F_UNLCK,
        } as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = start as libc::off_t;
        fl.l_len = 1;
        loop {
            let arg = if wait {
                FcntlArg::F_SETLKW(&fl)
            } else {
                FcntlArg::F_SETLK(&fl)
            };
            match fcntl(&self.file, arg) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EAGAIN | nix::errno::Errno::EACCES) if !wait => {
                    return Err(StoreError::LockBusy);
                }
                Err(errno) => {
                    return Err(StoreError::Io(std::io::Error::from_raw_os_error(
                        errno as i32,
                    )));
                }
            }
        }
    }

    fn allrecord_lock(&mut self, kind: LockKind, wait: bool) -> Result<(), StoreError> {
        // fcntl locks are per process; re-entry only bumps the depth.
        if let Some((_, depth)) = &mut self.allrecord {
            *depth += 1;
            return Ok(());
        }
        self.fcntl_lock(ALLRECORD_LOCK_OFF, Some(kind), wait)?;
        self.allrecord = Some((kind, 1));
        Ok(())
    }

    fn allrecord_unlock(&mut self, expect: Option<LockKind>) -> Result<(), StoreError> {
        match &mut self.allrecord {
            Some((kind, depth)) => {
                if let Some(expect) = expect
                    && *kind != expect
                {
                    return Err(StoreError::NotLocked);
                }
                *depth -= 1;
                if *depth == 0 {
                    self.allrecord = None;
                    self.fcntl_lock(ALLRECORD_LOCK_OFF, None, true)?;
                }
                Ok(())
            }
            None => Err(StoreError::NotLocked),
        }
    }

    fn chain_lock_at(&mut self, off: u64, kind: LockKind, wait: bool) -> Result<(), StoreError> {
        if let Some((_, depth)) = self.chains.get_mut(&off) {
            *depth += 1;
            return Ok(());
        }
        self.fcntl_lock(off, Some(kind), wait)?;
        self.chains.insert(off, (kind, 1));
        Ok(())
    }

    fn chain_unlock_at(&mut self, off: u64) -> Result<(), StoreError> {
        match self.chains.get_mut(&off) {
            Some((_, depth)) => {
                *depth -= 1;
                if *depth == 0 {
                    self.chains.remove(&off);
                    self.fcntl_lock(off, None, true)?;
                }
                Ok(())
            }
            None => Err(StoreError::NotLocked),
        }
    }

    fn read_image(&self) -> Result<(u32, Vec<(BString, BString)>), StoreError> {
        let len = self.file.metadata()?.len() as usize;
        let mut buf = vec![0; len];
        self.file.read_exact_at(&mut buf, 0)?;
        if len < HEADER_LEN || &buf[..8] != MAGIC {
            return Err(StoreError::Corrupt("bad header".into()));
        }
        let seqnum = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let mut records = Vec::with_capacity(count as usize);
        let mut at = HEADER_LEN;
        for _ in 0..count {
            let klen = u32::from_le_bytes(take(&buf, &mut at, 4)?.try_into().unwrap()) as usize;
            let vlen = u32::from_le_bytes(take(&buf, &mut at, 4)?.try_into().unwrap()) as usize;
            let key = BString::from(take(&buf, &mut at, klen)?);
            let value = BString::from(take(&buf, &mut at, vlen)?);
            records.push((key, value));
        }
        Ok((seqnum, records))
    }

    fn write_image(&self, seqnum: u32, records: &[(BString, BString)]) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&seqnum.to_le_bytes());
        buf.extend_from_slice(&u32::try_from(records.len()).unwrap().to_le_bytes());
        for (key, value) in records {
            buf.extend_from_slice(&u32::try_from(key.len()).unwrap().to_le_bytes());
            buf.extend_from_slice(&u32::try_from(value.len()).unwrap().to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }
        self.file.write_all_at(&buf, 0)?;
        self.file.set_len(buf.len() as u64)?;
        Ok(())
    }

    /// Runs a mutation over the record list, bumping the sequence number
    /// on success. Inside a transaction this only touches the buffer.
    fn mutate<R>(
        &mut self,
        chain_key: Option<&BStr>,
        f: impl FnOnce(&mut Vec<(BString, BString)>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if let Some(tx) = &mut self.tx {
            let result = f(&mut tx.records);
            if result.is_ok() {
                tx.seqnum = tx.seqnum.wrapping_add(1);
            }
            return result;
        }
        self.allrecord_lock(LockKind::Write, true)?;
        let chain = chain_key.map(|key| self.chain_offset(key));
        let result = match chain {
            Some(off) => self.chain_lock_at(off, LockKind::Write, true),
            None => Ok(()),
        }
        .and_then(|()| {
            let inner = self.read_image().and_then(|(seqnum, mut records)| {
                let value = f(&mut records)?;
                self.write_image(seqnum.wrapping_add(1), &records)?;
                Ok(value)
            });
            if let Some(off) = chain {
                self.chain_unlock_at(off)?;
            }
            inner
        });
        self.allrecord_unlock(None)?;
        result
    }

    /// Runs a read over the record list under the read locks.
    fn inspect<R>(
        &mut self,
        chain_key: Option<&BStr>,
        f: impl FnOnce(&[(BString, BString)]) -> R,
    ) -> Result<R, StoreError> {
        if let Some(tx) = &self.tx {
            return Ok(f(&tx.records));
        }
        self.allrecord_lock(LockKind::Read, true)?;
        let chain = chain_key.map(|key| self.chain_offset(key));
        let result = match chain {
            Some(off) => self.chain_lock_at(off, LockKind::Read, true),
            None => Ok(()),
        }
        .and_then(|()| {
            let inner = self.read_image().map(|(_, records)| f(&records));
            if let Some(off) = chain {
                self.chain_unlock_at(off)?;
            }
            inner
        });
        self.allrecord_unlock(None)?;
        result
    }
}

fn take<'a>(buf: &'a [u8], at: &mut usize, n: usize) -> Result<&'a [u8], StoreError> {
    let bytes = buf
        .get(*at..*at + n)
        .ok_or_else(|| StoreError::Corrupt("truncated record".into()))?;
    *at += n;
    Ok(bytes)
}

fn find(records: &[(BString, BString)], key: &BStr) -> Option<usize> {
    records.iter().position(|(k, _)| k.as_bstr() == key)
}

impl Store for FileStore {
    fn lock_all(&mut self) -> Result<(), StoreError> {
        self.allrecord_lock(LockKind::Write, true)
    }

    fn lock_all_nonblock(&mut self) -> Result<(), StoreError> {
        self.allrecord_lock(LockKind::Write, false)
    }

    fn unlock_all(&mut self) -> Result<(), StoreError> {
        self.allrecord_unlock(Some(LockKind::Write))
    }

    fn lock_all_read(&mut self) -> Result<(), StoreError> {
        self.allrecord_lock(LockKind::Read, true)
    }

    fn lock_all_read_nonblock(&mut self) -> Result<(), StoreError> {
        self.allrecord_lock(LockKind::Read, false)
    }

    fn unlock_all_read(&mut self) -> Result<(), StoreError> {
        self.allrecord_unlock(Some(LockKind::Read))
    }

    fn lock_all_mark(&mut self) -> Result<(), StoreError> {
        match &mut self.allrecord {
            Some((_, depth)) => *depth += 1,
            None => self.allrecord = Some((LockKind::Write, 1)),
        }
        Ok(())
    }

    fn lock_all_unmark(&mut self) -> Result<(), StoreError> {
        match &mut self.allrecord {
            Some((_, depth)) => {
                *depth -= 1;
                if *depth == 0 {
                    self.allrecord = None;
                }
                Ok(())
            }
            None => Err(StoreError::NotLocked),
        }
    }

    fn chain_lock(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.chain_lock_at(self.chain_offset(key), LockKind::Write, true)
    }

    fn chain_lock_nonblock(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.chain_lock_at(self.chain_offset(key), LockKind::Write, false)
    }

    fn chain_lock_read(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.chain_lock_at(self.chain_offset(key), LockKind::Read, true)
    }

    fn chain_unlock(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.chain_unlock_at(self.chain_offset(key))
    }

    fn chain_unlock_read(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.chain_unlock_at(self.chain_offset(key))
    }

    fn chain_lock_mark(&mut self, key: &BStr) -> Result<(), StoreError> {
        let off = self.chain_offset(key);
        match self.chains.get_mut(&off) {
            Some((_, depth)) => *depth += 1,
            None => {
                self.chains.insert(off, (LockKind::Write, 1));
            }
        }
        Ok(())
    }

    fn chain_lock_unmark(&mut self, key: &BStr) -> Result<(), StoreError> {
        let off = self.chain_offset(key);
        match self.chains.get_mut(&off) {
            Some((_, depth)) => {
                *depth -= 1;
                if *depth == 0 {
                    self.chains.remove(&off);
                }
                Ok(())
            }
            None => Err(StoreError::NotLocked),
        }
    }

    fn fetch(&mut self, key: &BStr) -> Result<Option<BString>, StoreError> {
        self.inspect(Some(key), |records| {
            find(records, key).map(|i| records[i].1.clone())
        })
    }

    fn parse_record(&mut self, key: &BStr) -> Result<usize, StoreError> {
        self.fetch(key)?.map(|data| data.len()).ok_or(StoreError::NotFound)
    }

    fn exists(&mut self, key: &BStr) -> Result<bool, StoreError> {
        self.inspect(Some(key), |records| find(records, key).is_some())
    }

    fn store(&mut self, key: &BStr, data: &BStr, flag: StoreFlag) -> Result<(), StoreError> {
        self.mutate(Some(key), |records| {
            let pos = find(records, key);
            match (flag, pos) {
                (StoreFlag::Insert, Some(_)) => Err(StoreError::Exists),
                (StoreFlag::Modify, None) => Err(StoreError::NotFound),
                (_, Some(i)) => {
                    records[i].1 = data.to_owned();
                    Ok(())
                }
                (_, None) => {
                    records.push((key.to_owned(), data.to_owned()));
                    Ok(())
                }
            }
        })
    }

    fn append(&mut self, key: &BStr, data: &BStr) -> Result<(), StoreError> {
        self.mutate(Some(key), |records| {
            match find(records, key) {
                Some(i) => records[i].1.extend_from_slice(data),
                None => records.push((key.to_owned(), data.to_owned())),
            }
            Ok(())
        })
    }

    fn delete(&mut self, key: &BStr) -> Result<(), StoreError> {
        self.mutate(Some(key), |records| {
            let i = find(records, key).ok_or(StoreError::NotFound)?;
            records.remove(i);
            Ok(())
        })
    }

    fn wipe_all(&mut self) -> Result<(), StoreError> {
        self.mutate(None, |records| {
            records.clear();
            Ok(())
        })
    }

    fn get_seqnum(&mut self) -> Result<u32, StoreError> {
        if let Some(tx) = &self.tx {
            return Ok(tx.seqnum);
        }
        self.allrecord_lock(LockKind::Read, true)?;
        let result = self.read_image().map(|(seqnum, _)| seqnum);
        self.allrecord_unlock(None)?;
        result
    }

    fn transaction_start(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = &mut self.tx {
            tx.depth += 1;
            return Ok(());
        }
        self.allrecord_lock(LockKind::Write, true)?;
        let (seqnum, records) = match self.read_image() {
            Ok(image) => image,
            Err(err) => {
                self.allrecord_unlock(None)?;
                return Err(err);
            }
        };
        self.tx = Some(Transaction {
            depth: 1,
            seqnum,
            records,
        });
        Ok(())
    }

    fn transaction_prepare_commit(&mut self) -> Result<(), StoreError> {
        if self.tx.is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(())
    }

    fn transaction_commit(&mut self) -> Result<(), StoreError> {
        match &mut self.tx {
            None => Err(StoreError::NoTransaction),
            Some(tx) if tx.depth > 1 => {
                tx.depth -= 1;
                Ok(())
            }
            Some(_) => {
                let tx = self.tx.take().unwrap();
                let result = self.write_image(tx.seqnum.wrapping_add(1), &tx.records);
                self.allrecord_unlock(None)?;
                result
            }
        }
    }

    fn transaction_cancel(&mut self) -> Result<(), StoreError> {
        match &mut self.tx {
            None => Err(StoreError::NoTransaction),
            Some(tx) if tx.depth > 1 => {
                tx.depth -= 1;
                Ok(())
            }
            Some(_) => {
                self.tx = None;
                self.allrecord_unlock(None)
            }
        }
    }

    fn traverse_begin(&mut self, write: bool) -> Result<Vec<(BString, BString)>, StoreError> {
        if let Some(tx) = &self.tx {
            let snapshot = tx.records.clone();
            self.traversals.push(false);
            return Ok(snapshot);
        }
        let kind = if write {
            LockKind::Write
        } else {
            LockKind::Read
        };
        self.allrecord_lock(kind, true)?;
        match self.read_image() {
            Ok((_, records)) => {
                self.traversals.push(true);
                Ok(records)
            }
            Err(err) => {
                self.allrecord_unlock(None)?;
                Err(err)
            }
        }
    }

    fn traverse_end(&mut self) -> Result<(), StoreError> {
        match self.traversals.pop() {
            Some(true) => self.allrecord_unlock(None),
            Some(false) => Ok(()),
            None => Err(StoreError::NotLocked),
        }
    }

    fn first_key(&mut self) -> Result<Option<BString>, StoreError> {
        self.inspect(None, |records| records.first().map(|(k, _)| k.clone()))
    }

    fn next_key(&mut self, key: &BStr) -> Result<Option<BString>, StoreError> {
        self.inspect(None, |records| {
            let i = find(records, key)?;
            records.get(i + 1).map(|(k, _)| k.clone())
        })
    }
}
