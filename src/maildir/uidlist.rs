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

//! The uidlist: the persistent mapping between UIDs and message files.
//!
//! The file `stowbox-uidlist` in the mailbox root looks like
//!
//! ```text
//! 1 V<uid-validity> N<next-uid>
//! <uid> <N|C|F> <file name>
//! ...
//! ```
//!
//! It is always replaced atomically, so it can be read without locking. Any
//! change to it, and any allocation of UIDs, happens while holding an
//! exclusive `flock()` on `stowbox-uidlist.lock`. Since other agents may
//! rename or delete message files without touching the uidlist, it is only a
//! cache of the directory contents as far as file names are concerned;
//! records are matched to files by base name whenever the mailbox is
//! resynchronised.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::prelude::*;
use log::{debug, info, warn};

use super::backend::Backend;
use super::filename;
use super::locate::Listing;
use super::model::{Location, Uid};
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::log_prefix::LogPrefix;

pub const UIDLIST_FILE: &str = "stowbox-uidlist";
pub const LOCK_FILE: &str = "stowbox-uidlist.lock";

const FORMAT_VERSION: &str = "1";

/// What the uidlist knows about one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub uid: Uid,
    pub location: Location,
    pub name: String,
}

/// Proof that the uidlist lock is held. The lock is released when this is
/// dropped.
#[derive(Debug)]
pub struct UidListLock {
    _file: fs::File,
}

/// The modification state of the mailbox at the last sync, used to skip
/// rescanning when nothing has changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Stamp {
    dirs: [Option<SystemTime>; 2],
    list: Option<(SystemTime, u64, u64)>,
}

pub struct UidList {
    root: PathBuf,
    backend: Backend,
    file_mode: u32,
    fsync: bool,
    log_prefix: LogPrefix,

    uid_validity: u32,
    next_uid: Uid,
    records: BTreeMap<Uid, Record>,
    by_base: HashMap<String, Uid>,
    stamp: Option<Stamp>,
}

impl UidList {
    /// Create an empty, unsynchronised uidlist for the mailbox at `root`.
    ///
    /// Nothing is read from disk until the first `sync()`.
    pub fn new(
        root: PathBuf,
        backend: Backend,
        file_mode: u32,
        fsync: bool,
        log_prefix: LogPrefix,
    ) -> Self {
        UidList {
            root,
            backend,
            file_mode,
            fsync,
            log_prefix,
            uid_validity: 0,
            next_uid: Uid::MIN,
            records: BTreeMap::new(),
            by_base: HashMap::new(),
            stamp: None,
        }
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn next_uid(&self) -> Uid {
        self.next_uid
    }

    pub fn get(&self, uid: Uid) -> Option<&Record> {
        self.records.get(&uid)
    }

    /// Return the UID of the message whose file has the given base name.
    pub fn uid_for_base(&self, base: &str) -> Option<Uid> {
        self.by_base.get(base).copied()
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Acquire the exclusive uidlist lock, blocking until it is available.
    pub fn lock(&self) -> Result<UidListLock, Error> {
        let path = self.root.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(self.file_mode)
            .open(&path)
            .map_err(|e| Error::critical("open", &path, e))?;
        nix::fcntl::flock(
            file.as_raw_fd(),
            nix::fcntl::FlockArg::LockExclusive,
        )
        .map_err(|e| Error::critical("flock", &path, e.into()))?;
        Ok(UidListLock { _file: file })
    }

    /// Bring the in-memory listing up to date.
    ///
    /// Unless `force` is set, nothing happens if neither the message
    /// directories nor the uidlist file have been modified since the last
    /// sync. Returns whether a rescan happened.
    pub fn sync(&mut self, force: bool) -> Result<bool, Error> {
        if !force && self.stamp.is_some() && self.stamp == Some(self.capture())
        {
            return Ok(false);
        }

        let lock = self.lock()?;
        self.resync(&lock)?;
        Ok(true)
    }

    /// Like `sync(false)`, but with the lock already held.
    pub fn refresh(&mut self, lock: &UidListLock) -> Result<(), Error> {
        if self.stamp.is_none() || self.stamp != Some(self.capture()) {
            self.resync(lock)?;
        }
        Ok(())
    }

    /// Reload the uidlist from disk and reconcile it with the files actually
    /// present in the mailbox.
    ///
    /// Records whose files have vanished are dropped; files without a record
    /// are assigned new UIDs in name order. The result is written back if
    /// anything changed.
    pub fn resync(&mut self, lock: &UidListLock) -> Result<(), Error> {
        let dirs_before = self.capture_dirs();

        let mut changed = match self.load() {
            Ok(true) => false,
            Ok(false) => {
                self.reset();
                info!(
                    "{} Created uidlist with UID validity {}",
                    self.log_prefix, self.uid_validity
                );
                true
            },
            Err(Error::CorruptUidList(msg)) => {
                let old_validity = self.uid_validity;
                self.reset();
                warn!(
                    "{} Uidlist was corrupt ({}); rebuilt with UID validity {} \
                     (was {})",
                    self.log_prefix, msg, self.uid_validity, old_validity
                );
                true
            },
            Err(e) => return Err(e),
        };

        let mut found = self.scan()?;

        let known: Vec<Uid> = self.records.keys().copied().collect();
        for uid in known {
            let base = match self.records.get(&uid) {
                Some(r) => filename::base(&r.name).to_owned(),
                None => continue,
            };

            match found.remove(&base) {
                Some((location, name)) => {
                    if let Some(r) = self.records.get_mut(&uid) {
                        if r.location != location || r.name != name {
                            r.location = location;
                            r.name = name;
                            changed = true;
                        }
                    }
                },
                None => {
                    debug!(
                        "{} UID {} ({}) no longer exists",
                        self.log_prefix, uid, base
                    );
                    self.records.remove(&uid);
                    self.by_base.remove(&base);
                    changed = true;
                },
            }
        }

        let mut fresh: Vec<(Location, String)> =
            found.into_iter().map(|(_, v)| v).collect();
        fresh.sort_by(|a, b| a.1.cmp(&b.1));
        if Backend::Cydir == self.backend {
            fresh.sort_by_key(|(_, name)| Backend::parse_cydir_name(name));
        }

        for (location, name) in fresh {
            let uid = match Backend::parse_cydir_name(&name) {
                Some(uid) if Backend::Cydir == self.backend => {
                    if uid >= self.next_uid {
                        self.next_uid = uid.next().ok_or(Error::MailboxFull)?;
                    }
                    uid
                },
                _ => {
                    let uid = self.next_uid;
                    self.next_uid = uid.next().ok_or(Error::MailboxFull)?;
                    uid
                },
            };

            debug!("{} Assigned UID {} to {}", self.log_prefix, uid, name);
            self.insert_record(Record {
                uid,
                location,
                name,
            });
            changed = true;
        }

        if changed {
            self.save(lock)?;
        }

        self.stamp = Some(Stamp {
            dirs: dirs_before,
            list: self.capture_list(),
        });
        Ok(())
    }

    /// Reserve `count` consecutive UIDs and return the first one.
    ///
    /// The new next-UID is written out before returning, so the reservation
    /// survives even if the caller never uses it. UIDs are never handed out
    /// twice, so a reservation that fails to commit leaves a gap.
    pub fn reserve(
        &mut self,
        lock: &UidListLock,
        count: u32,
    ) -> Result<Uid, Error> {
        let first = self.next_uid;
        // One past the end must still be representable
        let next = u64::from(first.get()) + u64::from(count);
        if next > u64::from(u32::MAX) {
            return Err(Error::MailboxFull);
        }

        self.next_uid = Uid::of(next as u32).ok_or(Error::MailboxFull)?;
        if let Err(e) = self.save(lock) {
            self.next_uid = first;
            return Err(e);
        }

        Ok(first)
    }

    /// Record a message file which was just committed under `lock`.
    ///
    /// The change is only in memory until the next `save()`.
    pub fn insert(
        &mut self,
        _lock: &UidListLock,
        uid: Uid,
        location: Location,
        name: String,
    ) {
        self.insert_record(Record {
            uid,
            location,
            name,
        });
    }

    /// Atomically write the current state to disk.
    pub fn save(&mut self, _lock: &UidListLock) -> Result<(), Error> {
        let path = self.root.join(UIDLIST_FILE);
        file_ops::spit(
            &self.root,
            &path,
            self.file_mode,
            self.fsync,
            self.serialise().as_bytes(),
        )
        .map_err(|e| Error::critical("write", &path, e))
    }

    /// Note the current state of the mailbox as being known, so that the next
    /// non-forced `sync()` only rescans if something else changes.
    pub fn record_stamp(&mut self) {
        self.stamp = Some(self.capture());
    }

    fn insert_record(&mut self, record: Record) {
        self.by_base
            .insert(filename::base(&record.name).to_owned(), record.uid);
        self.records.insert(record.uid, record);
    }

    fn reset(&mut self) {
        let now = Utc::now().timestamp().max(1) as u32;
        self.uid_validity = now.max(self.uid_validity.wrapping_add(1));
        self.next_uid = Uid::MIN;
        self.records.clear();
        self.by_base.clear();
    }

    /// Replace the in-memory state with the file on disk. Returns `false` if
    /// there is no uidlist yet.
    fn load(&mut self) -> Result<bool, Error> {
        let path = self.root.join(UIDLIST_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(false),
            Err(e) if io::ErrorKind::InvalidData == e.kind() => {
                return Err(Error::CorruptUidList("not UTF-8".to_owned()))
            },
            Err(e) => return Err(Error::critical("read", &path, e)),
        };

        let (uid_validity, next_uid, records) = parse(&text)?;
        self.uid_validity = uid_validity;
        self.next_uid = next_uid;
        self.records.clear();
        self.by_base.clear();
        for record in records {
            self.insert_record(record);
        }
        Ok(true)
    }

    /// List the committed message files, keyed by base name.
    fn scan(&self) -> Result<HashMap<String, (Location, String)>, Error> {
        let mut found = HashMap::new();
        for &location in self.backend.message_locations() {
            let dir = location.dir(&self.root);
            let entries = fs::read_dir(&dir)
                .map_err(|e| Error::critical("readdir", &dir, e))?;
            for entry in entries {
                let entry =
                    entry.map_err(|e| Error::critical("readdir", &dir, e))?;
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(name) => {
                        warn!(
                            "{} Ignoring non-UTF-8 file {:?} in {}",
                            self.log_prefix,
                            name,
                            dir.display()
                        );
                        continue;
                    },
                };

                if name.starts_with('.') {
                    continue;
                }
                if Backend::Cydir == self.backend
                    && Backend::parse_cydir_name(&name).is_none()
                {
                    continue;
                }

                let base = filename::base(&name).to_owned();
                if let Some((_, other)) = found.get(&base) {
                    warn!(
                        "{} {} and {} are the same message; ignoring the \
                         latter",
                        self.log_prefix, other, name
                    );
                    continue;
                }
                found.insert(base, (location, name));
            }
        }

        Ok(found)
    }

    fn serialise(&self) -> String {
        let mut out = format!(
            "{} V{} N{}\n",
            FORMAT_VERSION, self.uid_validity, self.next_uid
        );
        for r in self.records.values() {
            out.push_str(&format!(
                "{} {} {}\n",
                r.uid,
                r.location.to_char(),
                r.name
            ));
        }
        out
    }

    fn capture(&self) -> Stamp {
        Stamp {
            dirs: self.capture_dirs(),
            list: self.capture_list(),
        }
    }

    fn capture_dirs(&self) -> [Option<SystemTime>; 2] {
        let mut dirs = [None; 2];
        for (slot, &location) in
            dirs.iter_mut().zip(self.backend.message_locations())
        {
            *slot = fs::metadata(location.dir(&self.root))
                .and_then(|md| md.modified())
                .ok();
        }
        dirs
    }

    fn capture_list(&self) -> Option<(SystemTime, u64, u64)> {
        let md = fs::metadata(self.root.join(UIDLIST_FILE)).ok()?;
        Some((md.modified().ok()?, md.len(), md.ino()))
    }
}

impl Listing for UidList {
    fn lookup(&self, uid: Uid) -> Option<(Location, String)> {
        self.records.get(&uid).map(|r| (r.location, r.name.clone()))
    }

    fn force_resync(&mut self) -> Result<(), Error> {
        self.sync(true).map(|_| ())
    }
}

fn parse(text: &str) -> Result<(u32, Uid, Vec<Record>), Error> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::CorruptUidList("empty file".to_owned()))?;

    let mut fields = header.split(' ');
    if Some(FORMAT_VERSION) != fields.next() {
        return Err(Error::CorruptUidList(format!(
            "unknown header {:?}",
            header
        )));
    }

    let mut uid_validity = None;
    let mut next_uid = None;
    for field in fields {
        if let Some(v) = field.strip_prefix('V') {
            uid_validity = v.parse::<u32>().ok();
        } else if let Some(n) = field.strip_prefix('N') {
            next_uid = n.parse::<u32>().ok().and_then(Uid::of);
        }
    }

    let (uid_validity, mut next_uid) = match (uid_validity, next_uid) {
        (Some(v), Some(n)) => (v, n),
        _ => {
            return Err(Error::CorruptUidList(format!(
                "bad header {:?}",
                header
            )))
        },
    };

    let mut records = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        let uid = parts.next().and_then(|u| u.parse::<u32>().ok());
        let location = parts
            .next()
            .and_then(|l| l.chars().next())
            .and_then(Location::from_char);
        let name = parts.next().filter(|n| !n.is_empty() && !n.contains('/'));

        match (uid.and_then(Uid::of), location, name) {
            (Some(uid), Some(location), Some(name)) => {
                // Tolerate a next-UID that lags behind the records
                if uid >= next_uid {
                    next_uid = uid.next().ok_or(Error::MailboxFull)?;
                }
                records.push(Record {
                    uid,
                    location,
                    name: name.to_owned(),
                });
            },
            _ => {
                return Err(Error::CorruptUidList(format!(
                    "bad record on line {}",
                    lineno + 2
                )))
            },
        }
    }

    Ok((uid_validity, next_uid, records))
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup(backend: Backend) -> (tempfile::TempDir, UidList) {
        crate::init_test_log();
        let root = tempfile::TempDir::new().unwrap();
        backend.create_layout(root.path(), 0o700).unwrap();
        let list = UidList::new(
            root.path().to_owned(),
            backend,
            0o600,
            false,
            LogPrefix::new("test".to_owned()),
        );
        (root, list)
    }

    fn reopen(root: &Path, backend: Backend) -> UidList {
        let mut list = UidList::new(
            root.to_owned(),
            backend,
            0o600,
            false,
            LogPrefix::new("test".to_owned()),
        );
        list.sync(true).unwrap();
        list
    }

    #[test]
    fn assigns_uids_to_existing_files() {
        let (root, mut list) = setup(Backend::Maildir);
        fs::write(root.path().join("new/b"), b"").unwrap();
        fs::write(root.path().join("new/a"), b"").unwrap();
        fs::write(root.path().join("cur/c:2,S"), b"").unwrap();

        assert!(list.sync(false).unwrap());
        assert!(list.uid_validity() > 0);
        assert_eq!(Uid::u(4), list.next_uid());
        assert_eq!("a", list.get(Uid::u(1)).unwrap().name);
        assert_eq!("b", list.get(Uid::u(2)).unwrap().name);
        assert_eq!(
            Record {
                uid: Uid::u(3),
                location: Location::Cur,
                name: "c:2,S".to_owned(),
            },
            *list.get(Uid::u(3)).unwrap()
        );
        assert_eq!(Some(Uid::u(3)), list.uid_for_base("c"));

        let text =
            fs::read_to_string(root.path().join(UIDLIST_FILE)).unwrap();
        assert!(text.starts_with(&format!("1 V{} N4\n", list.uid_validity())));
        assert!(text.contains("3 C c:2,S\n"));

        let reloaded = reopen(root.path(), Backend::Maildir);
        assert_eq!(list.uid_validity(), reloaded.uid_validity());
        assert_eq!(3, reloaded.len());
        assert_eq!(Some(Uid::u(2)), reloaded.uid_for_base("b"));
    }

    #[test]
    fn follows_renames_and_drops_vanished() {
        let (root, mut list) = setup(Backend::Maildir);
        fs::write(root.path().join("new/a,S=3"), b"abc").unwrap();
        fs::write(root.path().join("new/b"), b"").unwrap();
        list.sync(true).unwrap();

        fs::rename(
            root.path().join("new/a,S=3"),
            root.path().join("cur/a,S=3:2,RS"),
        )
        .unwrap();
        fs::remove_file(root.path().join("new/b")).unwrap();
        fs::write(root.path().join("new/c"), b"").unwrap();
        list.sync(true).unwrap();

        assert_eq!(
            Some((Location::Cur, "a,S=3:2,RS".to_owned())),
            list.lookup(Uid::u(1))
        );
        assert_eq!(None, list.lookup(Uid::u(2)));
        assert_eq!(None, list.uid_for_base("b"));
        // UID 2 is not reused
        assert_eq!(Some(Uid::u(3)), list.uid_for_base("c"));
    }

    #[test]
    fn reservations_are_durable() {
        let (root, mut list) = setup(Backend::Maildir);
        list.sync(false).unwrap();

        {
            let lock = list.lock().unwrap();
            list.resync(&lock).unwrap();
            assert_eq!(Uid::u(1), list.reserve(&lock, 3).unwrap());
            assert_eq!(Uid::u(4), list.reserve(&lock, 1).unwrap());
        }

        let reloaded = reopen(root.path(), Backend::Maildir);
        assert_eq!(Uid::u(5), reloaded.next_uid());
        assert!(reloaded.is_empty());
    }

    #[test]
    fn reservation_cannot_overflow() {
        let (root, mut list) = setup(Backend::Maildir);
        fs::write(
            root.path().join(UIDLIST_FILE),
            format!("1 V1 N{}\n", u32::MAX - 2),
        )
        .unwrap();

        let lock = list.lock().unwrap();
        list.resync(&lock).unwrap();
        assert_matches!(Err(Error::MailboxFull), list.reserve(&lock, 3));
        assert_eq!(Uid::u(u32::MAX - 2), list.next_uid());
        assert_eq!(Uid::u(u32::MAX - 2), list.reserve(&lock, 2).unwrap());
    }

    #[test]
    fn corrupt_uidlist_is_rebuilt() {
        let (root, mut list) = setup(Backend::Maildir);
        fs::write(root.path().join("new/a"), b"").unwrap();
        list.sync(false).unwrap();
        let old_validity = list.uid_validity();

        fs::write(root.path().join(UIDLIST_FILE), "garbage\n").unwrap();
        list.sync(true).unwrap();
        assert_ne!(old_validity, list.uid_validity());
        assert_eq!(Some(Uid::u(1)), list.uid_for_base("a"));
    }

    #[test]
    fn unchanged_mailbox_is_not_rescanned() {
        let (root, mut list) = setup(Backend::Maildir);
        assert!(list.sync(false).unwrap());
        assert!(!list.sync(false).unwrap());

        fs::write(root.path().join("new/a"), b"").unwrap();
        assert!(list.sync(false).unwrap());
        assert_eq!(Some(Uid::u(1)), list.uid_for_base("a"));
        assert!(!list.sync(false).unwrap());
    }

    #[test]
    fn cydir_uids_come_from_names() {
        let (root, mut list) = setup(Backend::Cydir);
        fs::write(root.path().join("7."), b"").unwrap();
        fs::write(root.path().join("3."), b"").unwrap();
        fs::write(root.path().join("temp.x.1"), b"").unwrap();
        list.sync(true).unwrap();

        assert_eq!(2, list.len());
        assert_eq!(
            Some((Location::Flat, "3.".to_owned())),
            list.lookup(Uid::u(3))
        );
        assert_eq!(Uid::u(8), list.next_uid());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_matches!(Err(Error::CorruptUidList(_)), parse(""));
        assert_matches!(Err(Error::CorruptUidList(_)), parse("2 V1 N1\n"));
        assert_matches!(Err(Error::CorruptUidList(_)), parse("1 V1\n"));
        assert_matches!(
            Err(Error::CorruptUidList(_)),
            parse("1 V1 N5\n3 X foo\n")
        );
        assert_matches!(
            Err(Error::CorruptUidList(_)),
            parse("1 V1 N5\n3 C a/b\n")
        );

        let (validity, next, records) =
            parse("1 V10 N2\n5 N foo bar\n").unwrap();
        assert_eq!(10, validity);
        assert_eq!(Uid::u(6), next);
        assert_eq!("foo bar", records[0].name);
    }
}
