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

use std::fs;
use std::io;
use std::path::Path;

use log::warn;

use super::filename::{KEYWORD_FIRST, MAX_KEYWORDS};
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::safe_name::is_safe_keyword;

pub const KEYWORDS_FILE: &str = "stowbox-keywords";

/// The mapping from the letters `a`..`z` in file names to keyword names.
///
/// The table is stored as one `<slot> <name>` line per keyword, where slot 0
/// is `a`. Slots are only ever added, never reassigned, since existing file
/// names refer to them. Modifications must happen under the uidlist lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeywordTable {
    slots: Vec<Option<String>>,
    dirty: bool,
}

impl KeywordTable {
    /// Load the table from `path`. A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return Ok(Self::default())
            },
            Err(e) => return Err(Error::critical("read", path, e)),
        };

        let mut this = Self::default();
        for line in text.lines().filter(|l| !l.is_empty()) {
            let mut parts = line.splitn(2, ' ');
            let slot = parts.next().and_then(|s| s.parse::<usize>().ok());
            let name = parts.next().filter(|n| is_safe_keyword(n));
            match (slot, name) {
                (Some(slot), Some(name)) if slot < MAX_KEYWORDS => {
                    if this.slots.len() <= slot {
                        this.slots.resize(slot + 1, None);
                    }
                    this.slots[slot] = Some(name.to_owned());
                },
                _ => warn!(
                    "Ignoring bad line in {}: {:?}",
                    path.display(),
                    line
                ),
            }
        }

        Ok(this)
    }

    /// Write the table to `path` if it has changed since it was loaded.
    pub fn save(
        &mut self,
        tmp: &Path,
        path: &Path,
        mode: u32,
        fsync: bool,
    ) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }

        let mut text = String::new();
        for (slot, name) in self.slots.iter().enumerate() {
            if let Some(ref name) = *name {
                text.push_str(&format!("{} {}\n", slot, name));
            }
        }

        file_ops::spit(tmp, path, mode, fsync, text.as_bytes())
            .map_err(|e| Error::critical("write", path, e))?;
        self.dirty = false;
        Ok(())
    }

    /// Return the file name character for `keyword`, if it has a slot.
    ///
    /// Keywords are matched case-insensitively.
    pub fn char_for(&self, keyword: &str) -> Option<char> {
        self.slots
            .iter()
            .position(|s| {
                s.as_ref()
                    .map_or(false, |s| s.eq_ignore_ascii_case(keyword))
            })
            .map(slot_char)
    }

    pub fn name_for(&self, ch: char) -> Option<&str> {
        if ch < KEYWORD_FIRST {
            return None;
        }

        let slot = ch as usize - KEYWORD_FIRST as usize;
        self.slots.get(slot).and_then(|s| s.as_deref())
    }

    /// Return the character for `keyword`, allocating a slot if it does not
    /// have one yet.
    ///
    /// Returns `None` if all slots are taken.
    pub fn assign(&mut self, keyword: &str) -> Option<char> {
        if let Some(ch) = self.char_for(keyword) {
            return Some(ch);
        }
        if !is_safe_keyword(keyword) {
            return None;
        }

        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.slots.len() < MAX_KEYWORDS => {
                self.slots.push(None);
                self.slots.len() - 1
            },
            None => return None,
        };

        self.slots[slot] = Some(keyword.to_owned());
        self.dirty = true;
        Some(slot_char(slot))
    }
}

fn slot_char(slot: usize) -> char {
    (KEYWORD_FIRST as u8 + slot as u8) as char
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn assign_and_persist() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join(KEYWORDS_FILE);

        let mut table = KeywordTable::load(&path).unwrap();
        assert_eq!(None, table.char_for("$Junk"));
        assert_eq!(Some('a'), table.assign("$Junk"));
        assert_eq!(Some('b'), table.assign("Work"));
        assert_eq!(Some('a'), table.assign("$junk"));
        table.save(root.path(), &path, 0o600, false).unwrap();

        let loaded = KeywordTable::load(&path).unwrap();
        assert_eq!(Some('b'), loaded.char_for("work"));
        assert_eq!(Some("$Junk"), loaded.name_for('a'));
        assert_eq!(None, loaded.name_for('c'));
        assert_eq!(None, loaded.name_for('S'));
    }

    #[test]
    fn table_fills_up() {
        let mut table = KeywordTable::default();
        for i in 0..MAX_KEYWORDS {
            assert!(table.assign(&format!("kw{}", i)).is_some());
        }
        assert_eq!(Some('z'), table.char_for("kw25"));
        assert_eq!(None, table.assign("one-too-many"));
    }

    #[test]
    fn bad_lines_are_skipped() {
        let root = tempfile::TempDir::new().unwrap();
        let path = root.path().join(KEYWORDS_FILE);
        fs::write(&path, "0 good\nnonsense\n99 far\n2 third\n").unwrap();

        let table = KeywordTable::load(&path).unwrap();
        assert_eq!(Some('a'), table.char_for("good"));
        assert_eq!(Some('c'), table.char_for("third"));
        assert_eq!(None, table.char_for("far"));
    }
}
