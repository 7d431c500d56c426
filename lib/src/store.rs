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

//! The key/value store contract the replayer drives.
//!
//! The contract mirrors the traced tdb API: whole-store and per-chain
//! locks, record operations, transactions and traversals. Traversals are
//! expressed as begin/end plus a snapshot instead of a callback, which
//! keeps the seam object-safe; the begin still takes the traversal lock
//! and holds it until the end, which is what the replay's deadlock story
//! depends on.

use bstr::BStr;
use bstr::BString;
use thiserror::Error;

use crate::trace::StoreFlag;

/// Store failures.
///
/// The "logical" variants correspond to the traced API returning -1 and
/// are compared against recorded return values; the rest abort the
/// replay.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Exists,
    #[error("lock is contended")]
    LockBusy,
    #[error("lock not held")]
    NotLocked,
    #[error("no transaction is open")]
    NoTransaction,
    #[error("store image is corrupt: {0}")]
    Corrupt(String),
    #[error("store I/O failed")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for failures the traced API reports as an ordinary -1 return.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::Exists | Self::LockBusy | Self::NotLocked | Self::NoTransaction
        )
    }
}

/// The operation contract consumed by the replayer, with the semantics
/// standardized by the captured log.
pub trait Store {
    fn lock_all(&mut self) -> Result<(), StoreError>;
    fn lock_all_nonblock(&mut self) -> Result<(), StoreError>;
    fn unlock_all(&mut self) -> Result<(), StoreError>;
    fn lock_all_read(&mut self) -> Result<(), StoreError>;
    fn lock_all_read_nonblock(&mut self) -> Result<(), StoreError>;
    fn unlock_all_read(&mut self) -> Result<(), StoreError>;
    /// Pretends the whole-store lock is held without acquiring it.
    fn lock_all_mark(&mut self) -> Result<(), StoreError>;
    fn lock_all_unmark(&mut self) -> Result<(), StoreError>;

    fn chain_lock(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_lock_nonblock(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_lock_read(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_unlock(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_unlock_read(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_lock_mark(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn chain_lock_unmark(&mut self, key: &BStr) -> Result<(), StoreError>;

    fn fetch(&mut self, key: &BStr) -> Result<Option<BString>, StoreError>;
    /// Parses a record by length: traces record the parsed size as the
    /// call's return value.
    fn parse_record(&mut self, key: &BStr) -> Result<usize, StoreError>;
    fn exists(&mut self, key: &BStr) -> Result<bool, StoreError>;
    fn store(&mut self, key: &BStr, data: &BStr, flag: StoreFlag) -> Result<(), StoreError>;
    fn append(&mut self, key: &BStr, data: &BStr) -> Result<(), StoreError>;
    fn delete(&mut self, key: &BStr) -> Result<(), StoreError>;
    fn wipe_all(&mut self) -> Result<(), StoreError>;
    fn get_seqnum(&mut self) -> Result<u32, StoreError>;
    /// Repacking is traced for bookkeeping only; replaying it is a no-op.
    fn repack(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn transaction_start(&mut self) -> Result<(), StoreError>;
    fn transaction_prepare_commit(&mut self) -> Result<(), StoreError>;
    fn transaction_commit(&mut self) -> Result<(), StoreError>;
    fn transaction_cancel(&mut self) -> Result<(), StoreError>;

    /// Takes the traversal lock (read or write) and returns a snapshot of
    /// the records to visit. The lock is held until [`Store::traverse_end`].
    fn traverse_begin(&mut self, write: bool) -> Result<Vec<(BString, BString)>, StoreError>;
    fn traverse_end(&mut self) -> Result<(), StoreError>;

    fn first_key(&mut self) -> Result<Option<BString>, StoreError>;
    fn next_key(&mut self, key: &BStr) -> Result<Option<BString>, StoreError>;
}
