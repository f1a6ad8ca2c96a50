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

//! Finding the file of a message by UID.
//!
//! Other agents may rename (flag changes, `new/` to `cur/`) or delete message
//! files at any time, so a path obtained from the listing can be stale by the
//! time it is used. An operation which finds its file missing resynchronises
//! the listing and tries again, a bounded number of times.

use std::io;
use std::path::Path;

use log::debug;

use super::model::{Location, Uid};
use crate::support::error::Error;

/// The view of the mailbox listing the locator needs.
pub trait Listing {
    /// Return where the listing believes the file of `uid` to be, or `None`
    /// if it has no record of `uid`.
    fn lookup(&self, uid: Uid) -> Option<(Location, String)>;

    /// Rescan the mailbox and bring the listing up to date.
    fn force_resync(&mut self) -> Result<(), Error>;
}

/// Run `f` on the path of the file holding `uid`.
///
/// Returns `Ok(None)` if the listing has no record of `uid`, i.e., the
/// message has been expunged. If `f` fails with `NotFound`, the file is
/// assumed to have moved; the listing is resynchronised and the operation
/// retried. After `max_retries` such retries, gives up with
/// `Error::PersistentRace`.
///
/// Any other error from `f` is reported as a critical failure of `op`.
pub fn file_do<L: Listing + ?Sized, R>(
    listing: &mut L,
    root: &Path,
    uid: Uid,
    max_retries: u32,
    op: &'static str,
    mut f: impl FnMut(&Path) -> io::Result<R>,
) -> Result<Option<R>, Error> {
    let mut retries = 0;
    loop {
        let (location, name) = match listing.lookup(uid) {
            Some(found) => found,
            None => return Ok(None),
        };

        // A file the listing still considers new may have been moved to cur/
        // since; that is cheap to check without a full resync.
        let candidates: &[Location] = match location {
            Location::New => &[Location::New, Location::Cur],
            Location::Cur => &[Location::Cur],
            Location::Flat => &[Location::Flat],
        };

        for &candidate in candidates {
            let path = candidate.dir(root).join(&name);
            match f(&path) {
                Ok(r) => return Ok(Some(r)),
                Err(e) if io::ErrorKind::NotFound == e.kind() => (),
                Err(e) => return Err(Error::critical(op, path, e)),
            }
        }

        if retries >= max_retries {
            return Err(Error::PersistentRace(uid.get()));
        }

        retries += 1;
        debug!(
            "File for UID {} ({}) vanished; resyncing (retry {}/{})",
            uid, name, retries, max_retries
        );
        listing.force_resync()?;
    }
}
