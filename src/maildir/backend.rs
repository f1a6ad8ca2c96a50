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
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::filename;
use super::model::{Location, Uid};
use crate::support::config::BackendKind;
use crate::support::file_ops::IgnoreKinds;

const CYDIR_STAGING_PREFIX: &str = "temp.";

/// The on-disk layout of a mailbox.
///
/// Both layouts share the save transaction, the uidlist and the file locator;
/// they only differ in where files are staged and what committed files are
/// called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// `tmp/`, `new/` and `cur/`, with sizes and flags in the file names.
    Maildir,
    /// A flat directory of `<uid>.` files. Flags live only in the index.
    Cydir,
}

impl From<BackendKind> for Backend {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Maildir => Backend::Maildir,
            BackendKind::Cydir => Backend::Cydir,
        }
    }
}

impl Backend {
    /// Create the directories of a mailbox rooted at `root`, tolerating any
    /// that already exist.
    pub fn create_layout(self, root: &Path, mode: u32) -> io::Result<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(mode);
        builder.create(root).ignore_already_exists()?;
        if Backend::Maildir == self {
            for sub in &["tmp", "new", "cur"] {
                fs::DirBuilder::new()
                    .mode(mode)
                    .create(root.join(sub))
                    .ignore_already_exists()?;
            }
        }
        Ok(())
    }

    pub fn staging_dir(self, root: &Path) -> PathBuf {
        match self {
            Backend::Maildir => root.join("tmp"),
            Backend::Cydir => root.to_owned(),
        }
    }

    /// Return the staging name for message `ordinal` of a transaction whose
    /// shared base name is `shared`.
    pub fn staging_name(self, shared: &str, ordinal: usize) -> String {
        match self {
            Backend::Maildir => format!("{}.{}", shared, ordinal),
            Backend::Cydir => {
                format!("{}{}.{}", CYDIR_STAGING_PREFIX, shared, ordinal)
            },
        }
    }

    /// Return whether `name`, found in the staging directory, is a staged
    /// message file.
    pub fn is_staging_name(self, name: &str) -> bool {
        match self {
            Backend::Maildir => !name.starts_with('.'),
            Backend::Cydir => name.starts_with(CYDIR_STAGING_PREFIX),
        }
    }

    /// The directories which hold committed messages.
    pub fn message_locations(self) -> &'static [Location] {
        match self {
            Backend::Maildir => &[Location::New, Location::Cur],
            Backend::Cydir => &[Location::Flat],
        }
    }

    /// Determine the final location and name of a message being committed.
    ///
    /// `base` already carries any size markers; `flags` are the file name
    /// flag characters of the message.
    pub fn committed_name(
        self,
        uid: Uid,
        base: &str,
        flags: &[char],
    ) -> (Location, String) {
        match self {
            Backend::Maildir if flags.is_empty() => {
                (Location::New, filename::set_flags(base, flags))
            },
            Backend::Maildir => {
                (Location::Cur, filename::set_flags(base, flags))
            },
            Backend::Cydir => (Location::Flat, format!("{}.", uid)),
        }
    }

    /// Return the UID encoded in a committed cydir file name.
    pub fn parse_cydir_name(name: &str) -> Option<Uid> {
        if !name.ends_with('.') {
            return None;
        }

        let digits = &name[..name.len() - 1];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u32>().ok().and_then(Uid::of)
    }

    /// Whether messages in this layout may be copied by hardlinking.
    pub fn supports_hardlink_copy(self) -> bool {
        Backend::Maildir == self
    }

    /// Whether file names carry size markers and flags.
    pub fn has_filename_metadata(self) -> bool {
        Backend::Maildir == self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layouts() {
        let root = tempfile::TempDir::new().unwrap();
        let mb = root.path().join("mb");
        Backend::Maildir.create_layout(&mb, 0o700).unwrap();
        Backend::Maildir.create_layout(&mb, 0o700).unwrap();
        assert!(mb.join("tmp").is_dir());
        assert!(mb.join("new").is_dir());
        assert!(mb.join("cur").is_dir());
        assert_eq!(mb.join("tmp"), Backend::Maildir.staging_dir(&mb));

        let cy = root.path().join("cy");
        Backend::Cydir.create_layout(&cy, 0o700).unwrap();
        assert!(cy.is_dir());
        assert!(!cy.join("tmp").exists());
        assert_eq!(cy, Backend::Cydir.staging_dir(&cy));
    }

    #[test]
    fn names() {
        assert_eq!("x.3", Backend::Maildir.staging_name("x", 3));
        assert_eq!("temp.x.3", Backend::Cydir.staging_name("x", 3));
        assert!(Backend::Cydir.is_staging_name("temp.x.3"));
        assert!(!Backend::Cydir.is_staging_name("3."));

        assert_eq!(
            (Location::New, "b,S=1".to_owned()),
            Backend::Maildir.committed_name(Uid::u(5), "b,S=1", &[])
        );
        assert_eq!(
            (Location::Cur, "b,S=1:2,S".to_owned()),
            Backend::Maildir.committed_name(Uid::u(5), "b,S=1", &['S'])
        );
        assert_eq!(
            (Location::Flat, "5.".to_owned()),
            Backend::Cydir.committed_name(Uid::u(5), "b", &['S'])
        );

        assert_eq!(Some(Uid::u(42)), Backend::parse_cydir_name("42."));
        assert_eq!(None, Backend::parse_cydir_name("0."));
        assert_eq!(None, Backend::parse_cydir_name("42"));
        assert_eq!(None, Backend::parse_cydir_name("."));
        assert_eq!(None, Backend::parse_cydir_name("temp.x.1"));
        assert_eq!(None, Backend::parse_cydir_name("stowbox-uidlist"));
    }
}
