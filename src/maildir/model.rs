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

use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::support::error::Error;
use crate::support::safe_name::is_safe_keyword;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused, not even the ones reserved by a
/// transaction that later failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU32);

impl Uid {
    pub const MIN: Self = Uid(match NonZeroU32::new(1) {
        Some(n) => n,
        None => unreachable!(),
    });

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The position of a record appended to an index transaction.
///
/// Sequence numbers are only meaningful within the transaction that handed
/// them out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(pub NonZeroU32);

impl Seq {
    pub fn of(seq: u32) -> Option<Self> {
        NonZeroU32::new(seq).map(Seq)
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn from_index(ix: usize) -> Option<Self> {
        u32::try_from(ix)
            .ok()
            .and_then(|ix| ix.checked_add(1))
            .and_then(Seq::of)
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the IMAP form of the flag. `FromStr`
/// does the reverse conversion, and also understands non-standard casing of
/// the system flags.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl Flag {
    /// Return the maildir info character for this system flag, or `None` for
    /// keywords (whose characters depend on the mailbox's keyword table).
    pub fn maildir_char(&self) -> Option<char> {
        match *self {
            Flag::Draft => Some('D'),
            Flag::Flagged => Some('F'),
            Flag::Answered => Some('R'),
            Flag::Seen => Some('S'),
            Flag::Deleted => Some('T'),
            Flag::Keyword(_) => None,
        }
    }

    pub fn from_maildir_char(ch: char) -> Option<Self> {
        match ch {
            'D' => Some(Flag::Draft),
            'F' => Some(Flag::Flagged),
            'R' => Some(Flag::Answered),
            'S' => Some(Flag::Seen),
            'T' => Some(Flag::Deleted),
            _ => None,
        }
    }

    pub fn is_keyword(&self) -> bool {
        matches!(*self, Flag::Keyword(_))
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if is_safe_keyword(s) {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

/// The sizes of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSize {
    /// The number of bytes in the file.
    pub physical: u64,
    /// The size the message would have with all line endings as CRLF.
    pub virtual_size: u64,
}

/// Which directory of a mailbox a committed message file lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// `new/`: never observed by a client.
    New,
    /// `cur/`: observed at least once.
    Cur,
    /// Directly in the mailbox directory (the cydir layout).
    Flat,
}

impl Location {
    pub fn to_char(self) -> char {
        match self {
            Location::New => 'N',
            Location::Cur => 'C',
            Location::Flat => 'F',
        }
    }

    pub fn from_char(ch: char) -> Option<Self> {
        match ch {
            'N' => Some(Location::New),
            'C' => Some(Location::Cur),
            'F' => Some(Location::Flat),
            _ => None,
        }
    }

    /// Return the directory under the mailbox `root` holding files with this
    /// location.
    pub fn dir(self, root: &Path) -> PathBuf {
        match self {
            Location::New => root.join("new"),
            Location::Cur => root.join("cur"),
            Location::Flat => root.to_owned(),
        }
    }
}
