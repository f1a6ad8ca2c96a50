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

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::file_ops;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not enough disk space")]
    NoSpace,
    #[error("Message file for UID {0} keeps moving; gave up after retrying")]
    PersistentRace(u32),
    #[error(
        "Only {} of {total} messages were committed ({cause})",
        .committed.len()
    )]
    PartialCommit {
        committed: Vec<u32>,
        total: usize,
        cause: Box<Error>,
    },
    #[error("{op}({}) failed: {source}", .path.display())]
    Critical {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Staging file {} already exists", .0.display())]
    StagingCollision(PathBuf),
    #[error("Non-existent message")]
    NxMessage,
    #[error("Non-existent mailbox")]
    NxMailbox,
    #[error("Unsafe keyword or mailbox name")]
    UnsafeName,
    #[error("Mailbox full; no more UIDs can be assigned")]
    MailboxFull,
    #[error("Operation not valid in the current transaction state")]
    BadTransactionState,
    #[error("An earlier message of this transaction could not be saved")]
    TransactionFailed(ErrorKind),
    #[error("Corrupt uidlist: {0}")]
    CorruptUidList(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

/// The coarse classification of an `Error`, as reported to the error sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The file system (or quota) is out of space. Callers usually turn this
    /// into an "over quota" response instead of an internal error.
    NoSpace,
    /// Concurrent modification of the mailbox prevented the operation from
    /// converging.
    Race,
    /// An unexpected OS-level failure.
    Critical,
    /// The request itself was unacceptable (bad name, missing message, ...).
    User,
}

impl Error {
    /// Build a `Critical` error for `op` on `path`, unless the underlying
    /// error is a space exhaustion, which is always reported as `NoSpace`.
    pub fn critical(
        op: &'static str,
        path: impl Into<PathBuf>,
        source: io::Error,
    ) -> Self {
        if file_ops::is_no_space(&source) {
            Error::NoSpace
        } else {
            Error::Critical {
                op,
                path: path.into(),
                source,
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::NoSpace => ErrorKind::NoSpace,
            Error::PersistentRace(_) => ErrorKind::Race,
            Error::PartialCommit { ref cause, .. } => cause.kind(),
            Error::TransactionFailed(kind) => kind,
            Error::NxMessage
            | Error::NxMailbox
            | Error::UnsafeName
            | Error::MailboxFull
            | Error::BadTransactionState => ErrorKind::User,
            Error::Io(ref e) if file_ops::is_no_space(e) => ErrorKind::NoSpace,
            Error::Nix(e) if file_ops::is_no_space_errno(e) => {
                ErrorKind::NoSpace
            },
            Error::Critical { .. }
            | Error::StagingCollision(_)
            | Error::CorruptUidList(_)
            | Error::Io(_)
            | Error::Nix(_)
            | Error::Config(_) => ErrorKind::Critical,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn critical_maps_space_exhaustion() {
        assert_matches!(
            Error::NoSpace,
            Error::critical(
                "open",
                "/x",
                io::Error::from_raw_os_error(nix::libc::ENOSPC)
            )
        );
        assert_matches!(
            Error::NoSpace,
            Error::critical(
                "write",
                "/x",
                io::Error::from_raw_os_error(nix::libc::EDQUOT)
            )
        );

        let e = Error::critical(
            "fsync",
            "/some/file",
            io::Error::from_raw_os_error(nix::libc::EIO),
        );
        assert_eq!(ErrorKind::Critical, e.kind());
        let message = e.to_string();
        assert!(message.starts_with("fsync(/some/file) failed: "));
    }

    #[test]
    fn partial_commit_takes_kind_of_cause() {
        let e = Error::PartialCommit {
            committed: vec![1, 2],
            total: 3,
            cause: Box::new(Error::NoSpace),
        };
        assert_eq!(ErrorKind::NoSpace, e.kind());
        assert!(e.to_string().starts_with("Only 2 of 3 messages"));
    }

    #[test]
    fn transaction_failure_keeps_kind() {
        assert_eq!(
            ErrorKind::NoSpace,
            Error::TransactionFailed(ErrorKind::NoSpace).kind()
        );
        assert_eq!(
            ErrorKind::Critical,
            Error::TransactionFailed(ErrorKind::Critical).kind()
        );
    }
}
