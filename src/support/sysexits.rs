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

//! Exit codes from `sysexits.h`, which mail delivery agents are expected to
//! use.

use std::io;

use super::error::{Error, ErrorKind};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_UNAVAILABLE: Sysexit = Sysexit(69);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// Choose the exit code that best describes `e` to an MTA.
    ///
    /// Out of space and races are temporary conditions; the MTA should retry
    /// delivery later.
    pub fn for_error(e: &Error) -> Self {
        match *e {
            Error::NoSpace | Error::PersistentRace(_) => EX_TEMPFAIL,
            Error::PartialCommit { ref cause, .. } => Sysexit::for_error(cause),
            Error::NxMailbox | Error::UnsafeName => EX_CANTCREAT,
            Error::NxMessage => EX_NOINPUT,
            Error::MailboxFull => EX_UNAVAILABLE,
            Error::Config(_) => EX_CONFIG,
            Error::Io(ref e) if io::ErrorKind::NotFound == e.kind() => {
                EX_NOINPUT
            },
            Error::TransactionFailed(ErrorKind::NoSpace) => EX_TEMPFAIL,
            Error::TransactionFailed(_) => EX_IOERR,
            Error::Io(_) | Error::Critical { .. } => EX_IOERR,
            _ => EX_SOFTWARE,
        }
    }
}
