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
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use nix::sys::time::TimeVal;

use super::backend::Backend;
use super::filename::{self, FILE_SIZE, VIRTUAL_SIZE};
use super::index::IndexTransaction;
use super::keywords::{KeywordTable, KEYWORDS_FILE};
use super::locate;
use super::model::{Flag, MessageSize, Uid};
use super::save::SaveTransaction;
use super::storage::Shared;
use super::uidlist::{Record, UidList};
use crate::support::config::{PermissionsConfig, StorageConfig};
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;
use crate::support::log_prefix::LogPrefix;

/// Staging files are only scanned for staleness this often.
const TMP_SCAN_INTERVAL: Duration = Duration::from_secs(8 * 3600);
/// Staging files older than this are assumed to be abandoned.
const TMP_STALE_AGE: Duration = Duration::from_secs(36 * 3600);

/// A handle on one mailbox.
///
/// A handle is used by one thread at a time. Any number of handles, in any
/// number of processes, may operate on the same mailbox concurrently.
pub struct Mailbox {
    pub(super) shared: Shared,
    pub(super) name: String,
    pub(super) root: PathBuf,
    pub(super) log_prefix: LogPrefix,
    pub(super) list: UidList,
    pub(super) keywords: KeywordTable,
}

impl Mailbox {
    pub(super) fn open(
        shared: Shared,
        name: &str,
        root: PathBuf,
        log_prefix: LogPrefix,
    ) -> Result<Self, Error> {
        if !root.is_dir() {
            return Err(Error::NxMailbox);
        }

        // Other agents are known to delete empty maildir subdirectories
        shared
            .backend
            .create_layout(&root, shared.config.permissions.dir_mode)
            .map_err(|e| {
                shared.report(&log_prefix, Error::critical("mkdir", &root, e))
            })?;

        let list = UidList::new(
            root.clone(),
            shared.backend,
            shared.config.permissions.file_mode,
            shared.fsync(),
            log_prefix.clone(),
        );
        let keywords = KeywordTable::load(&root.join(KEYWORDS_FILE))
            .map_err(|e| shared.report(&log_prefix, e))?;

        let mut this = Mailbox {
            shared,
            name: name.to_owned(),
            root,
            log_prefix,
            list,
            keywords,
        };

        if this.shared.config.maildir.tmp_cleanup {
            if let Err(e) = this.cleanup_tmp(SystemTime::now()) {
                warn!(
                    "{} Failed to clean up staging files: {}",
                    this.log_prefix, e
                );
            }
        }

        this.sync()?;
        Ok(this)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> Backend {
        self.shared.backend
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn permissions(&self) -> &PermissionsConfig {
        &self.shared.config.permissions
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn uid_validity(&self) -> u32 {
        self.list.uid_validity()
    }

    pub fn next_uid(&self) -> Uid {
        self.list.next_uid()
    }

    /// All messages currently known, in UID order.
    pub fn records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.list.records()
    }

    /// Resynchronise with the mailbox on disk if anything has changed since
    /// the last sync.
    pub fn sync(&mut self) -> Result<bool, Error> {
        let rescanned = self.list.sync(false).map_err(|e| self.report(e))?;
        if rescanned {
            self.reload_keywords()?;
        }
        Ok(rescanned)
    }

    /// Unconditionally rescan the mailbox.
    pub fn force_sync(&mut self) -> Result<(), Error> {
        self.list.sync(true).map_err(|e| self.report(e))?;
        self.reload_keywords()
    }

    /// Return the flags of `uid` as recorded in its file name.
    ///
    /// Returns `None` if `uid` is not known. Backends without file name
    /// metadata always report no flags.
    pub fn flags(&self, uid: Uid) -> Option<Vec<Flag>> {
        let record = self.list.get(uid)?;
        if !self.shared.backend.has_filename_metadata() {
            return Some(Vec::new());
        }

        let chars = filename::flag_chars(&record.name).unwrap_or("");
        Some(
            chars
                .chars()
                .filter_map(|ch| {
                    Flag::from_maildir_char(ch).or_else(|| {
                        self.keywords
                            .name_for(ch)
                            .map(|kw| Flag::Keyword(kw.to_owned()))
                    })
                })
                .collect(),
        )
    }

    fn reload_keywords(&mut self) -> Result<(), Error> {
        if self.shared.backend.has_filename_metadata() {
            self.keywords = KeywordTable::load(&self.root.join(KEYWORDS_FILE))
                .map_err(|e| self.report(e))?;
        }
        Ok(())
    }

    /// Run `f` against the file of `uid`, following the file if other agents
    /// move it. See `locate::file_do`.
    pub fn file_do<R>(
        &mut self,
        uid: Uid,
        op: &'static str,
        f: impl FnMut(&Path) -> io::Result<R>,
    ) -> Result<Option<R>, Error> {
        locate::file_do(
            &mut self.list,
            &self.root,
            uid,
            self.shared.config.maildir.max_locate_retries,
            op,
            f,
        )
        .map_err(|e| self.report(e))
    }

    /// Return the current path of the file of `uid`, or `None` if it has been
    /// expunged.
    pub fn locate(&mut self, uid: Uid) -> Result<Option<PathBuf>, Error> {
        self.file_do(uid, "stat", |path| {
            fs::symlink_metadata(path).map(|_| path.to_owned())
        })
    }

    pub fn open_message(&mut self, uid: Uid) -> Result<fs::File, Error> {
        self.file_do(uid, "open", |p| fs::File::open(p))?
            .ok_or(Error::NxMessage)
    }

    /// Return the physical and virtual size of `uid`.
    ///
    /// Both are read from the file name if possible; otherwise the file is
    /// examined.
    pub fn message_size(&mut self, uid: Uid) -> Result<MessageSize, Error> {
        let name = match self.list.get(uid) {
            Some(r) => r.name.clone(),
            None => return Err(Error::NxMessage),
        };

        if self.shared.backend.has_filename_metadata() {
            if let (Some(physical), Some(virtual_size)) = (
                filename::get_size(&name, FILE_SIZE),
                filename::get_size(&name, VIRTUAL_SIZE),
            ) {
                return Ok(MessageSize {
                    physical,
                    virtual_size,
                });
            }
        }

        self.file_do(uid, "read", |path| measure(fs::File::open(path)?))?
            .ok_or(Error::NxMessage)
    }

    /// Delete staging files abandoned by crashed processes.
    ///
    /// The staging directory is only examined if it has not been examined in
    /// the last 8 hours (as tracked by its access time), and only files whose
    /// inode has not changed in 36 hours are deleted. `now` is the current
    /// time. Returns the number of files removed.
    pub fn cleanup_tmp(&self, now: SystemTime) -> Result<usize, Error> {
        let dir = self.shared.backend.staging_dir(&self.root);
        let md = match fs::metadata(&dir) {
            Ok(md) => md,
            Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(0),
            Err(e) => return Err(Error::critical("stat", &dir, e)),
        };

        let last_scan =
            UNIX_EPOCH + Duration::from_secs(md.atime().max(0) as u64);
        match now.duration_since(last_scan) {
            Ok(elapsed) if elapsed >= TMP_SCAN_INTERVAL => (),
            _ => return Ok(0),
        }

        let mut removed = 0;
        let entries = fs::read_dir(&dir)
            .map_err(|e| Error::critical("readdir", &dir, e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::critical("readdir", &dir, e))?;
            let name = entry.file_name();
            let is_staged = name
                .to_str()
                .map_or(false, |n| self.shared.backend.is_staging_name(n));
            if !is_staged {
                continue;
            }

            let md = match entry.metadata() {
                Ok(md) => md,
                Err(e) if io::ErrorKind::NotFound == e.kind() => continue,
                Err(e) => {
                    return Err(Error::critical("stat", entry.path(), e))
                },
            };
            if !md.is_file() {
                continue;
            }

            let changed =
                UNIX_EPOCH + Duration::from_secs(md.ctime().max(0) as u64);
            if now
                .duration_since(changed)
                .map_or(true, |age| age < TMP_STALE_AGE)
            {
                continue;
            }

            fs::remove_file(entry.path())
                .ignore_not_found()
                .map_err(|e| Error::critical("unlink", entry.path(), e))?;
            warn!(
                "{} Removed stale staging file {:?}",
                self.log_prefix, name
            );
            removed += 1;
        }

        // Record the scan in the access time, leaving the modification time
        // alone.
        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        nix::sys::stat::utimes(
            &dir,
            &TimeVal::new(now_secs as nix::libc::time_t, 0),
            &TimeVal::new(
                md.mtime() as nix::libc::time_t,
                (md.mtime_nsec() / 1000) as nix::libc::suseconds_t,
            ),
        )
        .map_err(|e| Error::critical("utimes", &dir, e.into()))?;

        if removed > 0 {
            info!(
                "{} Removed {} stale staging files",
                self.log_prefix, removed
            );
        }
        Ok(removed)
    }

    /// Start a transaction which saves or copies messages into this mailbox,
    /// recording them in `index`.
    pub fn transaction<'a>(
        &'a mut self,
        index: &'a mut dyn IndexTransaction,
    ) -> SaveTransaction<'a> {
        SaveTransaction::new(self, index)
    }

    pub(super) fn report(&self, e: Error) -> Error {
        self.shared.report(&self.log_prefix, e)
    }
}

/// Determine the sizes of a message by reading it.
fn measure(mut file: fs::File) -> io::Result<MessageSize> {
    let mut physical = 0u64;
    let mut bare_lf = 0u64;
    let mut prev = 0u8;
    let mut buf = [0u8; 16384];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
            Err(e) => return Err(e),
        };

        let chunk = &buf[..n];
        for ix in memchr::memchr_iter(b'\n', chunk) {
            let before = if 0 == ix { prev } else { chunk[ix - 1] };
            if b'\r' != before {
                bare_lf += 1;
            }
        }

        physical += n as u64;
        prev = chunk[n - 1];
    }

    Ok(MessageSize {
        physical,
        virtual_size: physical + bare_lf,
    })
}
