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

//! Index from keys to the operations that touch them.
//!
//! The index is an open-addressed table sized to twice the upper bound of
//! distinct keys, probed with the gdbm-derived key hash. Ops inside a
//! transaction or chain-lock group are
//! collapsed to the group start: for cross-process analysis the group is
//! the unit of ordering. Whole-store wipes are appended as users of every
//! key the index knows about.

use bstr::BString;

use crate::trace::OpKind;
use crate::trace::OpRef;
use crate::trace::TraceFile;
use crate::trace::in_chainlock;
use crate::trace::in_transaction;

/// Hash used to bucket keys, seeded with the key length.
///
/// This is the hash algorithm from gdbm, kept bit-for-bit: schedules
/// derived from the same traces must bucket identically.
pub fn key_hash(key: &[u8]) -> u32 {
    let mut value = 0x238F13AFu32 ^ key.len() as u32;
    for (i, &b) in key.iter().enumerate() {
        value = value.wrapping_add(u32::from(b) << (i * 5 % 24));
    }
    1103515243u32.wrapping_mul(value).wrapping_add(12345)
}

/// All known users of one key, in no particular order until the solver
/// sorts them.
#[derive(Clone, Debug)]
pub struct KeyUsers {
    pub key: BString,
    pub users: Vec<OpRef>,
}

/// Key → users table over a whole fleet of traces.
#[derive(Clone, Debug)]
pub struct KeyIndex {
    slots: Vec<Option<KeyUsers>>,
}

impl KeyIndex {
    /// Indexes every keyed op of `traces` and fans wipe-alls out to every
    /// occupied slot.
    pub fn build(traces: &[TraceFile]) -> Self {
        // Upper bound of distinct keys; at least 1 to avoid mod by zero.
        let bound = 1 + traces
            .iter()
            .flat_map(|trace| &trace.ops)
            .filter(|op| op.key.is_some())
            .count();
        let mut index = Self {
            slots: vec![None; bound * 2],
        };

        let mut wipe_alls = vec![];
        for (file, trace) in traces.iter().enumerate() {
            for op_num in 1..trace.ops.len() {
                let op = &trace.ops[op_num];
                if op.kind == OpKind::WipeAll {
                    wipe_alls.push(OpRef::new(file, op_num));
                }
                let Some(key) = &op.key else {
                    continue;
                };
                let slot = index.lookup(key);
                index.add_user(slot, traces, OpRef::new(file, op_num));
            }
        }

        for slot in 0..index.slots.len() {
            if index.slots[slot].is_some() {
                for &wipe in &wipe_alls {
                    index.add_user(slot, traces, wipe);
                }
            }
        }
        index
    }

    /// Finds the slot for `key`, installing it if absent.
    fn lookup(&mut self, key: &BString) -> usize {
        let mut slot = key_hash(key) as usize % self.slots.len();
        loop {
            match &self.slots[slot] {
                Some(entry) if entry.key == *key => return slot,
                Some(_) => slot = (slot + 1) % self.slots.len(),
                None => {
                    self.slots[slot] = Some(KeyUsers {
                        key: key.clone(),
                        users: vec![],
                    });
                    return slot;
                }
            }
        }
    }

    fn add_user(&mut self, slot: usize, traces: &[TraceFile], mut user: OpRef) {
        let ops = &traces[user.file].ops;
        // If it's in a transaction, it's the transaction which matters
        // from an analysis point of view.
        if in_transaction(ops, user.op) || in_chainlock(ops, user.op) {
            user.op = ops[user.op].group_start;
            let entry = self.slots[slot].as_ref().unwrap();
            if entry.users.contains(&user) {
                return;
            }
        }
        self.slots[slot].as_mut().unwrap().users.push(user);
    }

    /// Iterates the occupied slots.
    pub fn keys(&self) -> impl Iterator<Item = &KeyUsers> {
        self.slots.iter().flatten()
    }

    /// Iterates the occupied slots mutably, for the solver to reorder
    /// user lists in place.
    pub fn keys_mut(&mut self) -> impl Iterator<Item = &mut KeyUsers> {
        self.slots.iter_mut().flatten()
    }
}
