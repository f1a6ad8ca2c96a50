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

//! Copying messages between mailboxes by hardlinking.
//!
//! A message file is immutable once committed, so a copy can share the
//! source's inode. The link is made into the destination's staging
//! directory and then goes through the normal commit like any saved
//! message. Whenever linking is not possible, the caller is told to fall
//! back to copying the content.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use chrono::prelude::*;
use log::{debug, warn};
use nix::errno::Errno;
use nix::unistd::{linkat, LinkatFlags};

use super::filename::{self, FILE_SIZE, VIRTUAL_SIZE};
use super::mailbox::Mailbox;
use super::model::{MessageSize, Seq, Uid};
use super::save::{split_flags, SaveRequest, SaveTransaction, Staged};
use crate::support::error::Error;
use crate::support::file_ops;

/// The result of `SaveTransaction::copy()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The message was linked into the transaction with the given sequence
    /// number.
    Linked(Seq),
    /// The message could not be linked. Nothing was added to the
    /// transaction; the caller must copy the content instead.
    Fallback,
}

enum Attempt {
    Linked {
        tmp: PathBuf,
        base: String,
        preserved: bool,
        size: Option<MessageSize>,
    },
    Refused(Errno),
    NoSpace,
}

impl<'a> SaveTransaction<'a> {
    /// Try to add message `uid` of `src` to this transaction by hardlinking
    /// its file.
    ///
    /// Flags and keywords come from `request`; the received date is always
    /// that of the source, since the two share an inode.
    pub fn copy(
        &mut self,
        src: &mut Mailbox,
        uid: Uid,
        request: SaveRequest,
    ) -> Result<CopyOutcome, Error> {
        self.check_open()?;

        if !self.can_link_from(src) {
            return Ok(CopyOutcome::Fallback);
        }

        let config = &self.mailbox.shared.config.maildir;
        let preserve = config.copy_preserve_filename;
        let embed_size = config.save_size_in_filename;
        let embed_vsize = embed_size && config.save_virtual_size_in_filename;

        if preserve {
            self.mailbox.sync()?;
        }
        let fresh = self.save_alloc()?;
        let staging_dir = self
            .mailbox
            .shared
            .backend
            .staging_dir(&self.mailbox.root);

        let this = &*self;
        let attempt = src.file_do(uid, "link", |path| {
            let src_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let src_base = filename::base(src_name);

            let physical = filename::get_size(src_name, FILE_SIZE);
            let virtual_size = filename::get_size(src_name, VIRTUAL_SIZE);

            let preserved = preserve && !this.base_in_use(src_base);
            let (tmp_name, base) = if preserved {
                (src_base.to_owned(), src_base.to_owned())
            } else if embed_size {
                let physical = match physical {
                    Some(physical) => physical,
                    None => fs::metadata(path)?.len(),
                };
                let base = filename::insert_sizes(
                    &fresh,
                    Some(physical),
                    virtual_size.filter(|_| embed_vsize),
                );
                (fresh.clone(), base)
            } else {
                (fresh.clone(), fresh.clone())
            };

            let tmp = staging_dir.join(tmp_name);
            let linked = linkat(
                None,
                path,
                None,
                tmp.as_path(),
                LinkatFlags::SymlinkFollow,
            );
            match linked {
                Ok(()) => Ok(Attempt::Linked {
                    tmp,
                    base,
                    preserved,
                    size: physical.and_then(|physical| {
                        virtual_size.map(|virtual_size| MessageSize {
                            physical,
                            virtual_size,
                        })
                    }),
                }),
                Err(Errno::ENOENT) => Err(io::ErrorKind::NotFound.into()),
                Err(e) if file_ops::is_no_space_errno(e) => {
                    Ok(Attempt::NoSpace)
                },
                Err(e) if file_ops::is_cant_link_errno(e) => {
                    Ok(Attempt::Refused(e))
                },
                Err(e) => Err(e.into()),
            }
        });

        let (tmp, base, preserved, size) = match attempt {
            Ok(Some(Attempt::Linked {
                tmp,
                base,
                preserved,
                size,
            })) => (tmp, base, preserved, size),
            Ok(Some(Attempt::Refused(errno))) => {
                debug!(
                    "{} Can't link UID {} from {}: {}",
                    self.mailbox.log_prefix,
                    uid,
                    src.name(),
                    errno
                );
                return Ok(CopyOutcome::Fallback);
            },
            Ok(Some(Attempt::NoSpace)) => {
                return Err(self.mailbox.report(Error::NoSpace))
            },
            Ok(None) => {
                debug!(
                    "{} UID {} of {} is gone; not linking",
                    self.mailbox.log_prefix,
                    uid,
                    src.name()
                );
                return Ok(CopyOutcome::Fallback);
            },
            Err(Error::PersistentRace(_)) => {
                warn!(
                    "{} UID {} of {} keeps moving; copying instead of linking",
                    self.mailbox.log_prefix,
                    uid,
                    src.name()
                );
                return Ok(CopyOutcome::Fallback);
            },
            Err(e) => return Err(e),
        };

        let received = fs::metadata(&tmp)
            .ok()
            .and_then(|md| Utc.timestamp_opt(md.mtime(), 0).single());
        let (flags, keywords) = split_flags(request.flags);
        let seq = match self.register(&flags, &keywords) {
            Ok(seq) => seq,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            },
        };
        debug!(
            "{} Linked UID {} of {} as {}",
            self.mailbox.log_prefix,
            uid,
            src.name(),
            base
        );
        self.messages.push(Staged {
            seq,
            path: tmp,
            base,
            sizes_embedded: true,
            preserved,
            flags,
            keywords,
            size,
            received,
            failed: false,
            in_tmp: true,
        });

        Ok(CopyOutcome::Linked(seq))
    }

    /// Add message `uid` of `src` to this transaction, by linking if
    /// possible and by copying its content otherwise.
    pub fn copy_or_stream(
        &mut self,
        src: &mut Mailbox,
        uid: Uid,
        mut request: SaveRequest,
    ) -> Result<Seq, Error> {
        if let CopyOutcome::Linked(seq) =
            self.copy(src, uid, request.clone())?
        {
            return Ok(seq);
        }

        let file = src.open_message(uid)?;
        if request.received.is_none() {
            request.received = file
                .metadata()
                .ok()
                .and_then(|md| Utc.timestamp_opt(md.mtime(), 0).single());
        }

        self.save_begin(request, file)?;
        self.save_finish()
    }

    fn can_link_from(&self, src: &Mailbox) -> bool {
        if !self.mailbox.shared.config.maildir.copy_with_hardlinks {
            return false;
        }

        if !self.mailbox.backend().supports_hardlink_copy()
            || !src.backend().supports_hardlink_copy()
        {
            debug!(
                "{} Backend does not support linking from {}",
                self.mailbox.log_prefix,
                src.name()
            );
            return false;
        }

        // A link shares mode and owner with the source
        if src.permissions() != self.mailbox.permissions() {
            debug!(
                "{} Permissions differ from {}; not linking",
                self.mailbox.log_prefix,
                src.name()
            );
            return false;
        }

        true
    }

    /// Whether `base` is already used by a message in the destination or in
    /// this transaction.
    fn base_in_use(&self, base: &str) -> bool {
        self.mailbox.list.uid_for_base(base).is_some()
            || self
                .messages
                .iter()
                .any(|m| filename::base(&m.base) == base)
    }
}
