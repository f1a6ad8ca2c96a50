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

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use super::backend::Backend;
use super::mailbox::Mailbox;
use super::unique::UniqueNameGenerator;
use crate::support::config::StorageConfig;
use crate::support::error::{Error, ErrorKind};
use crate::support::log_prefix::LogPrefix;
use crate::support::safe_name::is_safe_name;

/// Maps mailbox names to the directories that hold them.
pub trait MailboxPathResolver: Send + Sync {
    fn mailbox_path(&self, name: &str) -> Result<PathBuf, Error>;
}

/// The Maildir++ convention: `INBOX` is the root maildir, and every other
/// mailbox `A.B` lives in `<root>/.A.B`.
#[derive(Clone, Debug)]
pub struct MaildirPlusPlus {
    pub root: PathBuf,
}

impl MailboxPathResolver for MaildirPlusPlus {
    fn mailbox_path(&self, name: &str) -> Result<PathBuf, Error> {
        if name.eq_ignore_ascii_case("INBOX") {
            Ok(self.root.clone())
        } else if is_safe_name(name) {
            Ok(self.root.join(format!(".{}", name)))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

/// Receives every space-exhaustion and unexpected error that the storage
/// reports to its caller, so the protocol layer can surface it.
pub trait ErrorSink: Send + Sync {
    fn record(&self, kind: ErrorKind, message: &str);
}

/// An `ErrorSink` which just logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn record(&self, kind: ErrorKind, message: &str) {
        match kind {
            ErrorKind::NoSpace => warn!("{}", message),
            ErrorKind::Race => warn!("{}", message),
            ErrorKind::Critical => error!("{}", message),
            ErrorKind::User => debug!("{}", message),
        }
    }
}

/// The parts of a storage instance shared by all its mailbox handles.
#[derive(Clone)]
pub(super) struct Shared {
    pub(super) config: Arc<StorageConfig>,
    pub(super) backend: Backend,
    pub(super) error_sink: Arc<dyn ErrorSink>,
    names: Arc<Mutex<UniqueNameGenerator>>,
}

impl Shared {
    pub(super) fn unique_name(&self) -> String {
        // The generator is still consistent even if a holder panicked
        let mut names = match self.names.lock() {
            Ok(names) => names,
            Err(poisoned) => poisoned.into_inner(),
        };
        names.generate()
    }

    /// Pass `e` to the error sink if it is the kind of error the sink wants,
    /// then return it.
    pub(super) fn report(&self, log_prefix: &LogPrefix, e: Error) -> Error {
        match e.kind() {
            kind @ ErrorKind::NoSpace
            | kind @ ErrorKind::Race
            | kind @ ErrorKind::Critical => {
                self.error_sink
                    .record(kind, &format!("{} {}", log_prefix, e));
            },
            ErrorKind::User => (),
        }
        e
    }

    pub(super) fn fsync(&self) -> bool {
        !self.config.maildir.fsync_disable
    }
}

/// A storage instance: a configuration and a way to find mailboxes.
///
/// The configuration (including the backend) is fixed for the lifetime of
/// the instance.
pub struct Storage {
    shared: Shared,
    resolver: Arc<dyn MailboxPathResolver>,
    log_prefix: LogPrefix,
}

impl Storage {
    pub fn new(
        config: StorageConfig,
        resolver: Arc<dyn MailboxPathResolver>,
        log_prefix: LogPrefix,
    ) -> Self {
        Storage {
            shared: Shared {
                backend: Backend::from(config.backend),
                config: Arc::new(config),
                error_sink: Arc::new(LogErrorSink),
                names: Arc::new(Mutex::new(UniqueNameGenerator::new())),
            },
            resolver,
            log_prefix,
        }
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.shared.error_sink = error_sink;
        self
    }

    pub fn with_name_generator(mut self, names: UniqueNameGenerator) -> Self {
        self.shared.names = Arc::new(Mutex::new(names));
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn backend(&self) -> Backend {
        self.shared.backend
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    /// Create the directories for the mailbox `name`. Existing directories
    /// are left alone.
    pub fn create_mailbox(&self, name: &str) -> Result<(), Error> {
        let path = self.resolver.mailbox_path(name)?;
        self.shared
            .backend
            .create_layout(&path, self.shared.config.permissions.dir_mode)
            .map_err(|e| {
                self.shared.report(
                    &self.log_prefix,
                    Error::critical("mkdir", &path, e),
                )
            })
    }

    /// Open a handle on the existing mailbox `name`.
    pub fn open_mailbox(&self, name: &str) -> Result<Mailbox, Error> {
        let path = self.resolver.mailbox_path(name)?;
        Mailbox::open(
            self.shared.clone(),
            name,
            path,
            self.log_prefix.mailbox(name),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;
    use crate::maildir::unique::Timestamp;

    /// An `ErrorSink` which remembers what it was told.
    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<(ErrorKind, String)>>,
    }

    impl ErrorSink for RecordingSink {
        fn record(&self, kind: ErrorKind, message: &str) {
            self.records
                .lock()
                .unwrap()
                .push((kind, message.to_owned()));
        }
    }

    impl RecordingSink {
        pub fn kinds(&self) -> Vec<ErrorKind> {
            self.records.lock().unwrap().iter().map(|r| r.0).collect()
        }
    }

    pub struct Setup {
        pub root: tempfile::TempDir,
        pub storage: Storage,
        pub sink: Arc<RecordingSink>,
    }

    /// Set up a storage instance in a fresh temporary directory, with `INBOX`
    /// and `Other` already created.
    pub fn set_up(config: StorageConfig) -> Setup {
        crate::init_test_log();

        let root = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let storage = Storage::new(
            config,
            Arc::new(MaildirPlusPlus {
                root: root.path().to_owned(),
            }),
            LogPrefix::new("test".to_owned()),
        )
        .with_error_sink(sink.clone())
        .with_name_generator(UniqueNameGenerator::with_state(
            1234,
            "test.host",
            0,
            Box::new(Timestamp::now),
        ));
        storage.create_mailbox("INBOX").unwrap();
        storage.create_mailbox("Other").unwrap();

        Setup {
            root,
            storage,
            sink,
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::*;
    use super::*;

    #[test]
    fn maildir_plus_plus_paths() {
        let resolver = MaildirPlusPlus {
            root: PathBuf::from("/mail"),
        };
        assert_eq!(
            PathBuf::from("/mail"),
            resolver.mailbox_path("inbox").unwrap()
        );
        assert_eq!(
            PathBuf::from("/mail/.Archive.2020"),
            resolver.mailbox_path("Archive.2020").unwrap()
        );
        assert_matches!(
            Err(Error::UnsafeName),
            resolver.mailbox_path("../etc")
        );
        assert_matches!(Err(Error::UnsafeName), resolver.mailbox_path(""));
    }

    #[test]
    fn open_requires_existing_mailbox() {
        let setup = set_up(StorageConfig::default());
        assert!(setup.root.path().join(".Other/tmp").is_dir());
        assert!(setup.root.path().join("cur").is_dir());

        assert_matches!(
            Err(Error::NxMailbox),
            setup.storage.open_mailbox("Nonexistent").map(|_| ())
        );
        let mb = setup.storage.open_mailbox("Other").unwrap();
        assert_eq!("Other", mb.name());
        assert!(setup.sink.kinds().is_empty());
    }

    #[test]
    fn report_filters_user_errors() {
        let setup = set_up(StorageConfig::default());
        let prefix = LogPrefix::new("ctx".to_owned());
        let _ = setup.storage.shared.report(&prefix, Error::NxMessage);
        let _ = setup.storage.shared.report(&prefix, Error::NoSpace);
        assert_eq!(vec![ErrorKind::NoSpace], setup.sink.kinds());
        assert_eq!(
            "ctx Not enough disk space",
            setup.sink.records.lock().unwrap()[0].1
        );
    }
}
