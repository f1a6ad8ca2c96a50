//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Stowbox.
//
// Stowbox is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Stowbox is distributed in the hope that it  will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Stowbox. If not, see <http://www.gnu.org/licenses/>.

//! The index transaction, the append-only ledger of the higher layers which
//! the save path keeps in lockstep with the message files it commits.

use std::collections::BTreeSet;

use super::model::{Flag, Seq, Uid};
use crate::support::error::Error;

/// How a flag or keyword update combines with the existing set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModifyMode {
    Replace,
    Add,
    Remove,
}

pub trait IndexTransaction {
    /// Append a new record and return its sequence number.
    ///
    /// Fails with `Error::MailboxFull` if no more sequence numbers are left.
    fn append(&mut self) -> Result<Seq, Error>;

    /// Update the system flags of `seq`. Keyword flags in `flags` are
    /// ignored; use `update_keywords` for those.
    fn update_flags(&mut self, seq: Seq, mode: ModifyMode, flags: &[Flag]);

    fn update_keywords(
        &mut self,
        seq: Seq,
        mode: ModifyMode,
        keywords: &[String],
    );

    /// Drop a record appended by this transaction.
    ///
    /// Expunged records are skipped by `assign_uids`.
    fn expunge(&mut self, seq: Seq);

    /// Assign UIDs starting at `first_uid`, in sequence order, to every live
    /// record that does not have one yet, and return the UID after the last
    /// one assigned.
    fn assign_uids(&mut self, first_uid: Uid) -> Result<Uid, Error>;
}

/// One record of a `MemoryIndex`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexRecord {
    pub flags: BTreeSet<Flag>,
    pub keywords: BTreeSet<String>,
    pub uid: Option<Uid>,
    pub expunged: bool,
}

/// A complete `IndexTransaction` kept entirely in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    records: Vec<IndexRecord>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, seq: Seq) -> Option<&IndexRecord> {
        self.records.get(seq.to_index())
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Return the UIDs assigned so far, in sequence order.
    pub fn uids(&self) -> Vec<Uid> {
        self.records
            .iter()
            .filter(|r| !r.expunged)
            .filter_map(|r| r.uid)
            .collect()
    }

    fn record_mut(&mut self, seq: Seq) -> Option<&mut IndexRecord> {
        self.records.get_mut(seq.to_index())
    }
}

fn modify<T: Ord + Clone>(
    set: &mut BTreeSet<T>,
    mode: ModifyMode,
    items: impl Iterator<Item = T>,
) {
    match mode {
        ModifyMode::Replace => {
            set.clear();
            set.extend(items);
        },
        ModifyMode::Add => set.extend(items),
        ModifyMode::Remove => {
            for item in items {
                set.remove(&item);
            }
        },
    }
}

impl IndexTransaction for MemoryIndex {
    fn append(&mut self) -> Result<Seq, Error> {
        let seq =
            Seq::from_index(self.records.len()).ok_or(Error::MailboxFull)?;
        self.records.push(IndexRecord::default());
        Ok(seq)
    }

    fn update_flags(&mut self, seq: Seq, mode: ModifyMode, flags: &[Flag]) {
        if let Some(r) = self.record_mut(seq) {
            modify(
                &mut r.flags,
                mode,
                flags.iter().filter(|f| !f.is_keyword()).cloned(),
            );
        }
    }

    fn update_keywords(
        &mut self,
        seq: Seq,
        mode: ModifyMode,
        keywords: &[String],
    ) {
        if let Some(r) = self.record_mut(seq) {
            modify(&mut r.keywords, mode, keywords.iter().cloned());
        }
    }

    fn expunge(&mut self, seq: Seq) {
        if let Some(r) = self.record_mut(seq) {
            r.expunged = true;
        }
    }

    fn assign_uids(&mut self, first_uid: Uid) -> Result<Uid, Error> {
        let mut next = first_uid;
        for r in &mut self.records {
            if r.expunged || r.uid.is_some() {
                continue;
            }

            r.uid = Some(next);
            next = next.next().ok_or(Error::MailboxFull)?;
        }

        Ok(next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ledger_operations() {
        let mut index = MemoryIndex::new();
        let a = index.append().unwrap();
        let b = index.append().unwrap();
        let c = index.append().unwrap();
        assert_eq!(Some(a), Seq::of(1));

        index.update_flags(
            a,
            ModifyMode::Replace,
            &[Flag::Seen, Flag::Keyword("x".to_owned())],
        );
        index.update_flags(a, ModifyMode::Add, &[Flag::Flagged]);
        index.update_flags(a, ModifyMode::Remove, &[Flag::Seen]);
        index.update_keywords(b, ModifyMode::Add, &["$Junk".to_owned()]);
        index.expunge(b);

        assert_eq!(Uid::u(12), index.assign_uids(Uid::u(10)).unwrap());
        assert_eq!(Some(Uid::u(10)), index.record(a).unwrap().uid);
        assert_eq!(None, index.record(b).unwrap().uid);
        assert_eq!(Some(Uid::u(11)), index.record(c).unwrap().uid);
        assert_eq!(vec![Uid::u(10), Uid::u(11)], index.uids());

        let flags: Vec<Flag> =
            index.record(a).unwrap().flags.iter().cloned().collect();
        assert_eq!(vec![Flag::Flagged], flags);

        // Already-assigned records are not renumbered
        let d = index.append().unwrap();
        assert_eq!(Uid::u(13), index.assign_uids(Uid::u(12)).unwrap());
        assert_eq!(Some(Uid::u(12)), index.record(d).unwrap().uid);
    }
}
