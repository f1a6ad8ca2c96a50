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

//! The save transaction.
//!
//! Messages are first written in full to the staging directory (`tmp/` for
//! maildir) under names derived from one generated base name. Nothing there
//! is visible to readers of the mailbox. Committing takes the uidlist lock,
//! reserves one UID per message, and links each file to its final name in
//! `new/` or `cur/`. The link is the point at which a message becomes
//! visible; there is no state in which another process can observe half a
//! message, and a file some other agent put at the same name is never
//! replaced.
//!
//! If any message fails to be saved, the whole transaction is failed: later
//! saves are refused and the commit rolls everything back.
//!
//! Since a visible message cannot be withdrawn in general, atomicity is per
//! message and not per batch once committing has started: if the N-th link
//! fails, the first N-1 messages stay committed and the caller learns so
//! through `Error::PartialCommit`.
//!
//! The lifecycle is
//!
//! ```text
//! (save_alloc) -> save_begin -> save_continue* -> save_finish  (per message)
//! commit_pre -> commit_post | rollback                         (per batch)
//! ```
//!
//! `save_cancel` abandons the message in progress; `rollback` (also run on
//! drop) abandons everything not yet committed and is idempotent.

use std::convert::TryFrom;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use nix::unistd::{linkat, LinkatFlags};

use super::filename::{self, FILE_SIZE, MAX_KEYWORDS, VIRTUAL_SIZE};
use super::index::{IndexTransaction, ModifyMode};
use super::keywords::{KeywordTable, KEYWORDS_FILE};
use super::line_ending::LineEndingFilter;
use super::mailbox::Mailbox;
use super::model::{Flag, MessageSize, Seq, Uid};
use super::uidlist::UidListLock;
use crate::support::error::{Error, ErrorKind};
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::log_prefix::LogPrefix;

/// How many times to re-create a missing staging directory before giving up.
const MAX_MKDIR_RETRIES: u32 = 3;
/// How many times a message may find its final name taken before the commit
/// gives up.
const MAX_NAME_COLLISIONS: u32 = 3;

/// The caller-supplied metadata of a message to be saved or copied.
#[derive(Clone, Debug, Default)]
pub struct SaveRequest {
    /// System flags and keywords to set on the new message.
    pub flags: Vec<Flag>,
    /// The internal date of the message. If `None`, the time the file was
    /// written is used.
    pub received: Option<DateTime<Utc>>,
}

impl SaveRequest {
    pub fn with_flags(flags: Vec<Flag>) -> Self {
        SaveRequest {
            flags,
            received: None,
        }
    }
}

/// The outcome of a successful commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitResult {
    pub uid_validity: u32,
    /// The first UID assigned, or `None` if nothing was committed.
    pub first_uid: Option<Uid>,
    /// The last UID assigned, or `None` if nothing was committed.
    pub last_uid: Option<Uid>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Open,
    PreCommitted,
    Done,
}

/// A message file staged by this transaction.
pub(super) struct Staged {
    pub(super) seq: Seq,
    /// Where the file currently is in the staging directory.
    pub(super) path: PathBuf,
    /// The base of the final name.
    pub(super) base: String,
    /// Whether `base` already carries the size markers.
    pub(super) sizes_embedded: bool,
    /// Whether `base` was taken over from the source of a copy, and so may
    /// clash with a message the destination already has.
    pub(super) preserved: bool,
    /// System flags only.
    pub(super) flags: Vec<Flag>,
    pub(super) keywords: Vec<String>,
    pub(super) size: Option<MessageSize>,
    pub(super) received: Option<DateTime<Utc>>,
    /// Set if the message was cancelled or could not be saved. It is never
    /// committed.
    pub(super) failed: bool,
    /// Whether `path` still exists and belongs to this transaction.
    pub(super) in_tmp: bool,
}

/// The message currently being streamed.
struct Current<'a> {
    file: fs::File,
    input: LineEndingFilter<Box<dyn Read + 'a>>,
    /// The first error encountered while streaming, reported by
    /// `save_finish`.
    error: Option<Error>,
    done: bool,
}

pub struct SaveTransaction<'a> {
    pub(super) mailbox: &'a mut Mailbox,
    pub(super) index: &'a mut dyn IndexTransaction,
    pub(super) messages: Vec<Staged>,
    shared_name: Option<String>,
    ordinal: usize,
    current: Option<Current<'a>>,
    state: State,
    /// Set once any message fails to be saved.
    failure: Option<ErrorKind>,
    lock: Option<UidListLock>,
    first_uid: Option<Uid>,
    committed: u32,

    #[cfg(test)]
    pub(super) fail_next_create: Option<i32>,
    #[cfg(test)]
    pub(super) fail_publish_at: Option<(usize, i32)>,
}

impl<'a> SaveTransaction<'a> {
    pub(super) fn new(
        mailbox: &'a mut Mailbox,
        index: &'a mut dyn IndexTransaction,
    ) -> Self {
        SaveTransaction {
            mailbox,
            index,
            messages: Vec::new(),
            shared_name: None,
            ordinal: 0,
            current: None,
            state: State::Open,
            failure: None,
            lock: None,
            first_uid: None,
            committed: 0,
            #[cfg(test)]
            fail_next_create: None,
            #[cfg(test)]
            fail_publish_at: None,
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        self.mailbox
    }

    /// The number of messages staged so far that will be committed.
    pub fn staged_count(&self) -> usize {
        self.messages.iter().filter(|m| !m.failed).count()
    }

    /// Allocate the staging name for the next message of this transaction.
    ///
    /// All messages of a transaction share one generated base name and are
    /// told apart by an ordinal suffix.
    pub fn save_alloc(&mut self) -> Result<String, Error> {
        self.check_open()?;

        let mailbox = &*self.mailbox;
        let shared = self
            .shared_name
            .get_or_insert_with(|| mailbox.shared.unique_name());
        self.ordinal += 1;
        Ok(self.mailbox.shared.backend.staging_name(shared, self.ordinal))
    }

    /// Start saving a new message whose content will be read from `input`.
    ///
    /// The staging file is created immediately. If that fails, no file is
    /// left behind and nothing is registered with the index; in particular,
    /// running out of space is reported as `Error::NoSpace` right away so
    /// that the caller can stop early.
    ///
    /// Fails with `Error::TransactionFailed` if an earlier message could not
    /// be saved.
    pub fn save_begin(
        &mut self,
        request: SaveRequest,
        input: impl Read + 'a,
    ) -> Result<Seq, Error> {
        self.check_open()?;
        if self.current.is_some() {
            return Err(Error::BadTransactionState);
        }

        let name = self.save_alloc()?;
        let path = self
            .mailbox
            .shared
            .backend
            .staging_dir(&self.mailbox.root)
            .join(&name);
        let file = self
            .create_staging_file(&path)
            .map_err(|e| self.mailbox.report(e))?;

        let (flags, keywords) = split_flags(request.flags);
        let seq = match self.register(&flags, &keywords) {
            Ok(seq) => seq,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            },
        };
        self.messages.push(Staged {
            seq,
            path,
            base: name,
            sizes_embedded: false,
            preserved: false,
            flags,
            keywords,
            size: None,
            received: request.received,
            failed: false,
            in_tmp: true,
        });

        let crlf = self.mailbox.shared.config.maildir.save_crlf;
        self.current = Some(Current {
            file,
            input: LineEndingFilter::new(Box::new(input), crlf),
            error: None,
            done: false,
        });
        Ok(seq)
    }

    /// Copy as much input as is currently available into the staging file.
    ///
    /// Returns `true` once the input is exhausted (or streaming failed), and
    /// `false` if the input would block. Failures fail the transaction but
    /// are not reported here; `save_finish` reports them.
    pub fn save_continue(&mut self) -> Result<bool, Error> {
        let current =
            self.current.as_mut().ok_or(Error::BadTransactionState)?;
        if current.done {
            return Ok(true);
        }
        if let Some(kind) = self.failure {
            return Err(Error::TransactionFailed(kind));
        }

        let mut buf = [0u8; 16384];
        loop {
            let n = match current.input.read(&mut buf) {
                Ok(0) => {
                    current.done = true;
                    return Ok(true);
                },
                Ok(n) => n,
                Err(e) if io::ErrorKind::WouldBlock == e.kind() => {
                    return Ok(false)
                },
                Err(e) if io::ErrorKind::Interrupted == e.kind() => continue,
                Err(e) => {
                    let e = Error::Io(e);
                    self.failure = Some(e.kind());
                    current.error = Some(e);
                    current.done = true;
                    return Ok(true);
                },
            };

            if let Err(e) = current.file.write_all(&buf[..n]) {
                let path = self
                    .messages
                    .last()
                    .map(|m| m.path.clone())
                    .unwrap_or_default();
                let e = Error::critical("write", path, e);
                self.failure = Some(e.kind());
                current.error = Some(e);
                current.done = true;
                return Ok(true);
            }
        }
    }

    /// Finish the message in progress: stream any remaining input, apply the
    /// received date, sync and close the file.
    ///
    /// On failure the message is dropped from the index transaction and the
    /// whole transaction is failed: no further messages are accepted and
    /// `commit_pre` rolls back. The staging files are removed by that
    /// rollback.
    pub fn save_finish(&mut self) -> Result<Seq, Error> {
        if self.current.is_none() {
            return Err(Error::BadTransactionState);
        }

        while !self.save_continue()? {
            // The input would block. A caller that wants to interleave other
            // work must call save_continue() itself before finishing.
            std::thread::yield_now();
        }

        let current = match self.current.take() {
            Some(current) => current,
            None => return Err(Error::BadTransactionState),
        };
        let ix = self.messages.len() - 1;
        match self.finish_file(current, ix) {
            Ok(()) => Ok(self.messages[ix].seq),
            Err(e) => {
                self.messages[ix].failed = true;
                self.index.expunge(self.messages[ix].seq);
                self.failure = Some(e.kind());
                Err(self.mailbox.report(e))
            },
        }
    }

    /// Abandon the message in progress, if any.
    pub fn save_cancel(&mut self) {
        if self.current.take().is_none() {
            return;
        }

        if let Some(staged) = self.messages.last_mut() {
            staged.failed = true;
            self.index.expunge(staged.seq);
            unlink_staged(staged, &self.mailbox.log_prefix);
        }
    }

    /// Assign UIDs to the staged messages and make them visible.
    ///
    /// On success, the uidlist lock is held until `commit_post`. On failure,
    /// the transaction is rolled back; if some messages had already been made
    /// visible, the error is `Error::PartialCommit` listing their UIDs.
    ///
    /// If any message failed to be saved, nothing is committed and the
    /// failure is returned as `Error::TransactionFailed`.
    pub fn commit_pre(&mut self) -> Result<(), Error> {
        if let (State::Open, Some(kind)) = (self.state, self.failure) {
            // Already reported when the message failed
            self.rollback();
            return Err(Error::TransactionFailed(kind));
        }
        self.check_open()?;
        if self.current.is_some() {
            return Err(Error::BadTransactionState);
        }

        match self.commit_pre_impl() {
            Ok(()) => {
                self.state = State::PreCommitted;
                Ok(())
            },
            Err(e) => {
                self.rollback();
                Err(self.mailbox.report(e))
            },
        }
    }

    fn commit_pre_impl(&mut self) -> Result<(), Error> {
        for staged in self.messages.iter_mut().filter(|m| m.failed) {
            unlink_staged(staged, &self.mailbox.log_prefix);
        }

        let live: Vec<usize> = (0..self.messages.len())
            .filter(|&ix| !self.messages[ix].failed)
            .collect();

        let lock = self.mailbox.list.lock()?;
        self.mailbox.list.refresh(&lock)?;

        if live.is_empty() {
            self.lock = Some(lock);
            return Ok(());
        }

        // Another agent may have taken a preserved name since it was chosen
        for &ix in &live {
            let staged = &self.messages[ix];
            if staged.preserved
                && self.mailbox.list.uid_for_base(&staged.base).is_some()
            {
                debug!(
                    "{} {} is now in use; committing under a fresh name",
                    self.mailbox.log_prefix, staged.base
                );
                self.freshen(ix)?;
            }
        }

        if self.mailbox.shared.backend.has_filename_metadata() {
            self.assign_keywords(&live)?;
        }

        let count = u32::try_from(live.len()).map_err(|_| Error::MailboxFull)?;
        let first = self.mailbox.list.reserve(&lock, count)?;
        self.first_uid = Some(first);
        let next = self.index.assign_uids(first)?;
        if u64::from(next.get()) != u64::from(first.get()) + u64::from(count) {
            error!(
                "{} Index assigned UIDs {}..{} but {} were reserved from {}",
                self.mailbox.log_prefix, first, next, count, first
            );
            return Err(Error::BadTransactionState);
        }

        let mut committed = Vec::with_capacity(live.len());
        for (n, &ix) in live.iter().enumerate() {
            let uid =
                Uid::of(first.get() + n as u32).ok_or(Error::MailboxFull)?;

            let (location, name) = match self.publish_staged(n, ix, uid) {
                Ok(placed) => placed,
                Err(cause) if committed.is_empty() => return Err(cause),
                Err(cause) => {
                    // What was linked is visible and must keep its UID
                    self.committed = committed.len() as u32;
                    self.mailbox.list.save(&lock)?;
                    return Err(Error::PartialCommit {
                        committed,
                        total: live.len(),
                        cause: Box::new(cause),
                    });
                },
            };

            self.messages[ix].in_tmp = false;
            self.mailbox.list.insert(&lock, uid, location, name);
            committed.push(uid.get());
        }
        self.committed = committed.len() as u32;

        if self.mailbox.shared.fsync() {
            for &location in self.mailbox.shared.backend.message_locations() {
                let dir = location.dir(&self.mailbox.root);
                if let Err(e) = file_ops::fsync_dir(&dir) {
                    self.mailbox.list.save(&lock)?;
                    return Err(Error::PartialCommit {
                        committed,
                        total: live.len(),
                        cause: Box::new(Error::critical("fsync", dir, e)),
                    });
                }
            }
        }

        self.lock = Some(lock);
        Ok(())
    }

    /// Persist the new listing and release the uidlist lock.
    pub fn commit_post(&mut self) -> Result<CommitResult, Error> {
        if State::PreCommitted != self.state {
            return Err(Error::BadTransactionState);
        }
        self.state = State::Done;

        if let Some(lock) = self.lock.take() {
            self.mailbox
                .list
                .save(&lock)
                .map_err(|e| self.mailbox.report(e))?;
            // Our own links should not trigger a rescan
            self.mailbox.list.record_stamp();
        }

        let last_uid = self
            .first_uid
            .filter(|_| self.committed > 0)
            .and_then(|first| Uid::of(first.get() + self.committed - 1));
        let first_uid = last_uid.and(self.first_uid);
        if let (Some(first), Some(last)) = (first_uid, last_uid) {
            info!(
                "{} Committed UIDs {}..={}",
                self.mailbox.log_prefix, first, last
            );
        }

        Ok(CommitResult {
            uid_validity: self.mailbox.list.uid_validity(),
            first_uid,
            last_uid,
        })
    }

    /// Abandon everything not yet committed.
    ///
    /// Staged files are deleted and the uidlist lock released. Messages that
    /// were already made visible stay visible. Calling this more than once is
    /// harmless.
    pub fn rollback(&mut self) {
        self.current = None;
        for staged in &mut self.messages {
            if staged.in_tmp && !staged.failed {
                self.index.expunge(staged.seq);
            }
            unlink_staged(staged, &self.mailbox.log_prefix);
        }

        if let Some(lock) = self.lock.take() {
            if self.committed > 0 {
                if let Err(e) = self.mailbox.list.save(&lock) {
                    error!(
                        "{} Failed to record committed messages: {}",
                        self.mailbox.log_prefix, e
                    );
                }
            }
        }

        if let Some(first) = self.first_uid.take() {
            if 0 == self.committed {
                warn!(
                    "{} UIDs from {} reserved by failed transaction are \
                     burned",
                    self.mailbox.log_prefix, first
                );
            }
        }

        self.state = State::Done;
    }

    /// Register a new message with the index transaction.
    pub(super) fn register(
        &mut self,
        flags: &[Flag],
        keywords: &[String],
    ) -> Result<Seq, Error> {
        let seq = self.index.append()?;
        self.index.update_flags(seq, ModifyMode::Replace, flags);
        if !keywords.is_empty() {
            self.index
                .update_keywords(seq, ModifyMode::Replace, keywords);
        }
        Ok(seq)
    }

    pub(super) fn check_open(&self) -> Result<(), Error> {
        if State::Open != self.state {
            return Err(Error::BadTransactionState);
        }

        match self.failure {
            Some(kind) => Err(Error::TransactionFailed(kind)),
            None => Ok(()),
        }
    }

    fn create_staging_file(&mut self, path: &Path) -> Result<fs::File, Error> {
        let permissions = &self.mailbox.shared.config.permissions;
        let mut retries = 0;

        let file = loop {
            #[cfg(test)]
            {
                if let Some(errno) = self.fail_next_create.take() {
                    return Err(Error::critical(
                        "open",
                        path,
                        io::Error::from_raw_os_error(errno),
                    ));
                }
            }

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(permissions.file_mode)
                .open(path)
            {
                Ok(file) => break file,
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    // The unique name generator should make this impossible
                    error!(
                        "{} Staging file {} already exists",
                        self.mailbox.log_prefix,
                        path.display()
                    );
                    return Err(Error::StagingCollision(path.to_owned()));
                },
                Err(e)
                    if io::ErrorKind::NotFound == e.kind()
                        && retries < MAX_MKDIR_RETRIES =>
                {
                    retries += 1;
                    warn!(
                        "{} Staging directory vanished; re-creating it",
                        self.mailbox.log_prefix
                    );
                    self.mailbox
                        .shared
                        .backend
                        .create_layout(&self.mailbox.root, permissions.dir_mode)
                        .map_err(|e| {
                            Error::critical("mkdir", &self.mailbox.root, e)
                        })?;
                },
                Err(e) => return Err(Error::critical("open", path, e)),
            }
        };

        if let Some(gid) = permissions.group {
            if let Err(e) = nix::unistd::fchown(
                file.as_raw_fd(),
                None,
                Some(nix::unistd::Gid::from_raw(gid)),
            ) {
                drop(file);
                let _ = fs::remove_file(path);
                return Err(Error::critical("fchown", path, e.into()));
            }
        }

        Ok(file)
    }

    fn finish_file(
        &mut self,
        mut current: Current<'a>,
        ix: usize,
    ) -> Result<(), Error> {
        if let Some(e) = current.error.take() {
            return Err(e);
        }

        let fsync = self.mailbox.shared.fsync();
        let staged = &mut self.messages[ix];
        let path = &staged.path;

        match staged.received {
            Some(received) => {
                let usecs = received.timestamp_subsec_micros();
                let tv = TimeVal::new(
                    received.timestamp() as nix::libc::time_t,
                    usecs as nix::libc::suseconds_t,
                );
                nix::sys::stat::utimes(path, &tv, &tv)
                    .map_err(|e| Error::critical("utimes", path, e.into()))?;
            },
            None => {
                let md = current
                    .file
                    .metadata()
                    .map_err(|e| Error::critical("fstat", path, e))?;
                staged.received = Utc
                    .timestamp_opt(md.mtime(), md.mtime_nsec() as u32)
                    .single();
            },
        }

        if fsync {
            current
                .file
                .sync_all()
                .map_err(|e| Error::critical("fsync", path, e))?;
        }

        staged.size = Some(MessageSize {
            physical: current.input.physical(),
            virtual_size: current.input.virtual_size(),
        });

        nix::unistd::close(current.file.into_raw_fd())
            .map_err(|e| Error::critical("close", path, e.into()))?;
        Ok(())
    }

    /// Assign keyword slots to the keywords of the live messages, under the
    /// uidlist lock.
    fn assign_keywords(&mut self, live: &[usize]) -> Result<(), Error> {
        if live.iter().all(|&ix| self.messages[ix].keywords.is_empty()) {
            return Ok(());
        }

        let root = &self.mailbox.root;
        let path = root.join(KEYWORDS_FILE);
        let mut table = KeywordTable::load(&path)?;
        for &ix in live {
            for keyword in &self.messages[ix].keywords {
                if table.assign(keyword).is_none() {
                    debug!(
                        "{} All {} keyword slots in use; {} is not stored in \
                         the file name",
                        self.mailbox.log_prefix, MAX_KEYWORDS, keyword
                    );
                }
            }
        }

        let permissions = &self.mailbox.shared.config.permissions;
        table.save(
            root,
            &path,
            permissions.file_mode,
            self.mailbox.shared.fsync(),
        )?;
        self.mailbox.keywords = table;
        Ok(())
    }

    /// Determine where `staged` goes when committed as `uid`.
    fn final_name(
        &self,
        uid: Uid,
        staged: &Staged,
    ) -> (super::model::Location, String) {
        let config = &self.mailbox.shared.config.maildir;
        let backend = self.mailbox.shared.backend;

        let base = match staged.size {
            Some(size)
                if !staged.sizes_embedded
                    && backend.has_filename_metadata()
                    && config.save_size_in_filename =>
            {
                filename::insert_sizes(
                    &staged.base,
                    Some(size.physical),
                    Some(size.virtual_size)
                        .filter(|_| config.save_virtual_size_in_filename),
                )
            },
            _ => staged.base.clone(),
        };

        let mut chars: Vec<char> =
            staged.flags.iter().filter_map(Flag::maildir_char).collect();
        chars.extend(
            staged
                .keywords
                .iter()
                .filter_map(|kw| self.mailbox.keywords.char_for(kw)),
        );

        backend.committed_name(uid, &base, &chars)
    }

    /// Make staged message `ix`, the `n`th of the commit, visible as `uid`.
    ///
    /// If its final name turns out to be taken, a maildir message is given a
    /// fresh base name and tried again.
    fn publish_staged(
        &mut self,
        n: usize,
        ix: usize,
        uid: Uid,
    ) -> Result<(super::model::Location, String), Error> {
        let mut collisions = 0;
        loop {
            let (location, name) = self.final_name(uid, &self.messages[ix]);
            let dst = location.dir(&self.mailbox.root).join(&name);
            let src = &self.messages[ix].path;

            match self.publish(n, src, &dst) {
                Ok(()) => return Ok((location, name)),
                Err(e)
                    if io::ErrorKind::AlreadyExists == e.kind()
                        && self.mailbox.shared.backend.has_filename_metadata()
                        && collisions < MAX_NAME_COLLISIONS =>
                {
                    collisions += 1;
                    warn!(
                        "{} {} appeared in the mailbox; committing under a \
                         fresh name",
                        self.mailbox.log_prefix,
                        dst.display()
                    );
                    self.freshen(ix)?;
                },
                Err(e) => return Err(Error::critical("link", src, e)),
            }
        }
    }

    /// Link the staged file `src` to `dst` and drop the staging name.
    ///
    /// An existing `dst` is never replaced; that case fails with
    /// `AlreadyExists`.
    fn publish(&self, n: usize, src: &Path, dst: &Path) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some((at, errno)) = self.fail_publish_at {
                if at == n {
                    return Err(io::Error::from_raw_os_error(errno));
                }
            }
        }
        let _ = n;

        match linkat(None, src, None, dst, LinkatFlags::NoSymlinkFollow) {
            Ok(()) => {
                if let Err(e) = fs::remove_file(src) {
                    warn!(
                        "{} Failed to remove staging file {}: {}",
                        self.mailbox.log_prefix,
                        src.display(),
                        e
                    );
                }
                Ok(())
            },
            Err(e) if Errno::EEXIST == e => {
                Err(io::ErrorKind::AlreadyExists.into())
            },
            // The file system cannot link at all
            Err(e) if file_ops::is_cant_link_errno(e) => {
                match fs::symlink_metadata(dst) {
                    Ok(_) => Err(io::ErrorKind::AlreadyExists.into()),
                    Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
                        fs::rename(src, dst)
                    },
                    Err(e) => Err(e),
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Give staged message `ix` a newly generated base name, carrying over
    /// the size markers of the old one.
    fn freshen(&mut self, ix: usize) -> Result<(), Error> {
        let config = &self.mailbox.shared.config.maildir;
        let staged = &self.messages[ix];
        let fresh = self.mailbox.shared.unique_name();

        let base = if config.save_size_in_filename {
            let physical = filename::get_size(&staged.base, FILE_SIZE)
                .or_else(|| staged.size.map(|s| s.physical));
            let physical = match physical {
                Some(physical) => physical,
                None => fs::metadata(&staged.path)
                    .map_err(|e| Error::critical("stat", &staged.path, e))?
                    .len(),
            };
            let virtual_size = filename::get_size(&staged.base, VIRTUAL_SIZE)
                .or_else(|| staged.size.map(|s| s.virtual_size))
                .filter(|_| config.save_virtual_size_in_filename);
            filename::insert_sizes(&fresh, Some(physical), virtual_size)
        } else {
            fresh
        };

        let staged = &mut self.messages[ix];
        staged.base = base;
        staged.sizes_embedded = true;
        staged.preserved = false;
        Ok(())
    }
}

impl Drop for SaveTransaction<'_> {
    fn drop(&mut self) {
        if State::Done != self.state {
            self.rollback();
        }
    }
}

/// Separate system flags from keywords.
pub(super) fn split_flags(flags: Vec<Flag>) -> (Vec<Flag>, Vec<String>) {
    let mut system = Vec::new();
    let mut keywords = Vec::new();
    for flag in flags {
        match flag {
            Flag::Keyword(kw) => keywords.push(kw),
            flag => system.push(flag),
        }
    }
    (system, keywords)
}

/// Delete the staging file of `staged` if this transaction still owns it.
fn unlink_staged(staged: &mut Staged, log_prefix: &LogPrefix) {
    if !staged.in_tmp {
        return;
    }

    staged.in_tmp = false;
    if let Err(e) = fs::remove_file(&staged.path).ignore_not_found() {
        warn!(
            "{} Failed to remove staging file {}: {}",
            log_prefix,
            staged.path.display(),
            e
        );
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::maildir::index::MemoryIndex;
    use crate::maildir::model::Location;
    use crate::maildir::storage::test_support::*;
    use crate::maildir::uidlist::UIDLIST_FILE;
    use crate::support::config::{BackendKind, StorageConfig};
    use crate::support::error::ErrorKind;

    fn save_one(
        tx: &mut SaveTransaction<'_>,
        data: &'static [u8],
        flags: Vec<Flag>,
    ) -> Seq {
        tx.save_begin(SaveRequest::with_flags(flags), data).unwrap();
        tx.save_finish().unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    fn read_uid(mb: &mut Mailbox, uid: u32) -> Vec<u8> {
        fs::read(mb.locate(Uid::u(uid)).unwrap().unwrap()).unwrap()
    }

    struct Failing;
    impl Read for Failing {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }
    }

    #[test]
    fn batch_gets_consecutive_uids() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        fs::write(root.join(UIDLIST_FILE), "1 V5 N100\n").unwrap();

        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();
        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"one\n", vec![]);
            save_one(&mut tx, b"two\n", vec![Flag::Seen]);
            save_one(&mut tx, b"three\n", vec![Flag::Seen, Flag::Flagged]);
            assert_eq!(3, tx.staged_count());
            tx.commit_pre().unwrap();
            let result = tx.commit_post().unwrap();
            assert_eq!(
                CommitResult {
                    uid_validity: 5,
                    first_uid: Some(Uid::u(100)),
                    last_uid: Some(Uid::u(102)),
                },
                result
            );
        }

        assert_eq!(
            vec![Uid::u(100), Uid::u(101), Uid::u(102)],
            index.uids()
        );
        assert_eq!(Uid::u(103), mb.next_uid());
        assert!(names(&root.join("tmp")).is_empty());

        let records: Vec<_> = mb.records().cloned().collect();
        assert_eq!(Location::New, records[0].location);
        assert!(records[0].name.ends_with(",S=4,W=5"));
        assert_eq!(Location::Cur, records[1].location);
        assert!(records[1].name.ends_with(":2,S"));
        assert!(records[2].name.ends_with(",S=6,W=7:2,FS"));

        assert_eq!(b"one\n".to_vec(), read_uid(&mut mb, 100));
        assert_eq!(b"three\n".to_vec(), read_uid(&mut mb, 102));

        let reopened = setup.storage.open_mailbox("INBOX").unwrap();
        assert_eq!(5, reopened.uid_validity());
        assert_eq!(Uid::u(103), reopened.next_uid());
        assert_eq!(3, reopened.records().count());
        assert!(setup.sink.kinds().is_empty());
    }

    #[test]
    fn nothing_visible_before_commit() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut other = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        let mut tx = mb.transaction(&mut index);
        save_one(&mut tx, b"hello\n", vec![]);
        assert_eq!(1, names(&root.join("tmp")).len());
        assert!(names(&root.join("new")).is_empty());
        assert!(names(&root.join("cur")).is_empty());
        other.force_sync().unwrap();
        assert_eq!(0, other.records().count());

        tx.commit_pre().unwrap();
        assert_eq!(1, names(&root.join("new")).len());
        tx.commit_post().unwrap();
        drop(tx);

        other.force_sync().unwrap();
        let record = other.records().next().unwrap().clone();
        assert_eq!(Uid::u(1), record.uid);
        assert_eq!(b"hello\n".to_vec(), read_uid(&mut other, 1));
    }

    #[test]
    fn no_space_at_begin_leaves_nothing() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            tx.fail_next_create = Some(nix::libc::ENOSPC);
            assert_matches!(
                Err(Error::NoSpace),
                tx.save_begin(SaveRequest::default(), &b"x\n"[..])
            );
            assert!(names(&root.join("tmp")).is_empty());

            // A retry once space is available succeeds
            save_one(&mut tx, b"x\n", vec![]);
            tx.commit_pre().unwrap();
            let result = tx.commit_post().unwrap();
            assert_eq!(Some(Uid::u(1)), result.first_uid);
        }

        assert_eq!(vec![ErrorKind::NoSpace], setup.sink.kinds());
        assert_eq!(vec![Uid::u(1)], index.uids());
        assert_eq!(1, index.records().len());
    }

    #[test]
    fn failed_commit_leaves_no_files() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"a\n", vec![]);
            save_one(&mut tx, b"b\n", vec![Flag::Seen]);
            fs::remove_dir(root.join("new")).unwrap();

            let err = tx.commit_pre().unwrap_err();
            assert_eq!(ErrorKind::Critical, err.kind());
            // Rolled back; further use is an error
            assert_matches!(Err(Error::BadTransactionState), tx.commit_post());
            tx.rollback();
        }

        assert!(names(&root.join("tmp")).is_empty());
        assert!(names(&root.join("cur")).is_empty());
        assert_eq!(vec![ErrorKind::Critical], setup.sink.kinds());
    }

    #[test]
    fn partial_commit_keeps_linked_messages() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"a\n", vec![]);
            save_one(&mut tx, b"b\n", vec![]);
            save_one(&mut tx, b"c\n", vec![]);
            tx.fail_publish_at = Some((1, nix::libc::EIO));

            assert_matches!(
                Err(Error::PartialCommit { ref committed, total: 3, .. })
                    if *committed == vec![1],
                tx.commit_pre()
            );
        }

        assert!(names(&root.join("tmp")).is_empty());
        assert_eq!(1, names(&root.join("new")).len());
        assert_eq!(vec![Uid::u(1)], index.uids());

        let mut reopened = setup.storage.open_mailbox("INBOX").unwrap();
        assert_eq!(b"a\n".to_vec(), read_uid(&mut reopened, 1));
        assert_eq!(1, reopened.records().count());
        // UIDs 2 and 3 were burned
        assert_eq!(Uid::u(4), reopened.next_uid());
    }

    #[test]
    fn cancel_and_drop_clean_up() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            tx.save_begin(SaveRequest::default(), &b"abandoned\n"[..])
                .unwrap();
            assert!(tx.save_continue().unwrap());
            tx.save_cancel();
            assert!(names(&root.join("tmp")).is_empty());
            assert_matches!(Err(Error::BadTransactionState), tx.save_finish());

            save_one(&mut tx, b"kept\n", vec![]);
            save_one(&mut tx, b"dropped\n", vec![]);
            assert_eq!(2, names(&root.join("tmp")).len());
            tx.rollback();
            tx.rollback();
            assert!(names(&root.join("tmp")).is_empty());
        }
        assert!(index.records().iter().all(|r| r.expunged));

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"never committed\n", vec![]);
            assert_eq!(1, names(&root.join("tmp")).len());
        }
        assert!(names(&root.join("tmp")).is_empty());
        assert!(names(&root.join("new")).is_empty());
        assert!(index.records().iter().all(|r| r.expunged));
        assert_eq!(Uid::u(1), mb.next_uid());
    }

    #[test]
    fn failed_message_fails_transaction() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"good\n", vec![]);
            tx.save_begin(SaveRequest::default(), Failing).unwrap();
            assert_matches!(Err(Error::Io(_)), tx.save_finish());

            assert_matches!(
                Err(Error::TransactionFailed(ErrorKind::Critical)),
                tx.save_begin(SaveRequest::default(), &b"late\n"[..])
            );
            assert_matches!(
                Err(Error::TransactionFailed(ErrorKind::Critical)),
                tx.commit_pre()
            );
            assert_matches!(Err(Error::BadTransactionState), tx.commit_post());
        }

        assert!(names(&root.join("tmp")).is_empty());
        assert!(names(&root.join("new")).is_empty());
        assert!(names(&root.join("cur")).is_empty());
        assert_eq!(2, index.records().len());
        assert!(index.records().iter().all(|r| r.expunged));
        assert!(index.uids().is_empty());
        assert_eq!(Uid::u(1), mb.next_uid());
        // Reported once, when the message failed
        assert_eq!(vec![ErrorKind::Critical], setup.sink.kinds());
    }

    #[test]
    fn index_is_reusable_after_rollback() {
        let setup = set_up(StorageConfig::default());
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"abandoned\n", vec![]);
            tx.rollback();
        }
        assert!(index.records()[0].expunged);

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"kept\n", vec![]);
            tx.commit_pre().unwrap();
            let result = tx.commit_post().unwrap();
            assert_eq!(Some(Uid::u(1)), result.first_uid);
        }

        assert_eq!(vec![Uid::u(1)], index.uids());
        assert_eq!(b"kept\n".to_vec(), read_uid(&mut mb, 1));
        assert!(setup.sink.kinds().is_empty());
    }

    #[test]
    fn publish_never_replaces() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();
        let tx = mb.transaction(&mut index);

        let staged = root.join("tmp/staged");
        fs::write(&staged, b"new\n").unwrap();
        fs::write(root.join("new/taken"), b"old\n").unwrap();

        let err = tx.publish(0, &staged, &root.join("new/taken")).unwrap_err();
        assert_eq!(io::ErrorKind::AlreadyExists, err.kind());
        assert_eq!(
            b"old\n".to_vec(),
            fs::read(root.join("new/taken")).unwrap()
        );
        assert!(staged.is_file());

        tx.publish(0, &staged, &root.join("new/free")).unwrap();
        assert!(!staged.exists());
        assert_eq!(b"new\n".to_vec(), fs::read(root.join("new/free")).unwrap());
    }

    #[test]
    fn keywords_and_received_date() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();
        let received = Utc.timestamp_opt(981_173_106, 0).unwrap();

        {
            let mut tx = mb.transaction(&mut index);
            tx.save_begin(
                SaveRequest {
                    flags: vec![
                        Flag::Keyword("$Junk".to_owned()),
                        Flag::Seen,
                    ],
                    received: Some(received),
                },
                &b"spam\n"[..],
            )
            .unwrap();
            tx.save_finish().unwrap();
            tx.commit_pre().unwrap();
            tx.commit_post().unwrap();
        }

        let record = mb.records().next().unwrap().clone();
        assert!(record.name.ends_with(":2,Sa"));
        assert_eq!(
            "0 $Junk\n",
            fs::read_to_string(root.join(KEYWORDS_FILE)).unwrap()
        );

        let path = mb.locate(Uid::u(1)).unwrap().unwrap();
        assert_eq!(981_173_106, fs::metadata(path).unwrap().mtime());

        let r = index.records()[0].clone();
        assert!(r.flags.contains(&Flag::Seen));
        assert!(r.keywords.contains("$Junk"));
    }

    #[test]
    fn crlf_and_permissions() {
        let mut config = StorageConfig::default();
        config.maildir.save_crlf = true;
        config.permissions.file_mode = 0o640;
        config.permissions.group = Some(nix::unistd::getegid().as_raw());
        let setup = set_up(config);
        let mut mb = setup.storage.open_mailbox("Other").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"a\nb\n", vec![]);
            tx.commit_pre().unwrap();
            tx.commit_post().unwrap();
        }

        let record = mb.records().next().unwrap().clone();
        assert!(record.name.ends_with(",S=6,W=6"));
        let path = mb.locate(Uid::u(1)).unwrap().unwrap();
        assert_eq!(b"a\r\nb\r\n".to_vec(), fs::read(&path).unwrap());
        let md = fs::metadata(&path).unwrap();
        assert_eq!(0o640, md.mode() & 0o777);
        assert_eq!(nix::unistd::getegid().as_raw(), md.gid());
    }

    #[test]
    fn vanished_staging_dir_is_recreated() {
        let setup = set_up(StorageConfig::default());
        let root = setup.root.path();
        let mut mb = setup.storage.open_mailbox("INBOX").unwrap();
        let mut index = MemoryIndex::new();

        fs::remove_dir(root.join("tmp")).unwrap();
        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"x\n", vec![]);
            tx.commit_pre().unwrap();
            tx.commit_post().unwrap();
        }
        assert!(root.join("tmp").is_dir());
        assert_eq!(b"x\n".to_vec(), read_uid(&mut mb, 1));
    }

    #[test]
    fn cydir_commits_by_uid() {
        let mut config = StorageConfig::default();
        config.backend = BackendKind::Cydir;
        let setup = set_up(config);
        let root = setup.root.path().join(".Other");
        let mut mb = setup.storage.open_mailbox("Other").unwrap();
        let mut index = MemoryIndex::new();

        {
            let mut tx = mb.transaction(&mut index);
            save_one(&mut tx, b"one\n", vec![Flag::Seen]);
            save_one(&mut tx, b"two\n", vec![]);
            let staged = names(&root)
                .into_iter()
                .filter(|n| n.starts_with("temp."))
                .count();
            assert_eq!(2, staged);
            tx.commit_pre().unwrap();
            tx.commit_post().unwrap();
        }

        let files: Vec<String> = names(&root)
            .into_iter()
            .filter(|n| !n.starts_with("stowbox-"))
            .collect();
        assert_eq!(vec!["1.".to_owned(), "2.".to_owned()], files);
        assert_eq!(b"two\n".to_vec(), read_uid(&mut mb, 2));
        assert_eq!(
            MessageSize {
                physical: 4,
                virtual_size: 5,
            },
            mb.message_size(Uid::u(1)).unwrap()
        );
    }
}
