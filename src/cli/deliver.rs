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
use std::mem;
use std::path::{Path, PathBuf};

use log::{error, info};

use super::main::DeliverSubcommand;
use crate::maildir::filename;
use crate::maildir::index::MemoryIndex;
use crate::maildir::mailbox::Mailbox;
use crate::maildir::model::Flag;
use crate::maildir::save::{CommitResult, SaveRequest, SaveTransaction};
use crate::maildir::storage::Storage;
use crate::support::error::Error;
use crate::support::sysexits::*;

pub(super) fn deliver(storage: Storage, mut cmd: DeliverSubcommand) {
    if cmd.create {
        match storage.create_mailbox(&cmd.mailbox) {
            Ok(()) => (),
            Err(Error::UnsafeName) => {
                die!(EX_CANTCREAT, "{}: Bad mailbox name", cmd.mailbox)
            },
            Err(e) => die!(
                Sysexit::for_error(&e),
                "Failed to create {}: {}",
                cmd.mailbox,
                e
            ),
        }
    }

    let mut mailbox = match storage.open_mailbox(&cmd.mailbox) {
        Ok(mb) => mb,
        Err(Error::NxMailbox) | Err(Error::UnsafeName) => {
            die!(EX_CANTCREAT, "{}: Non-existent mailbox", cmd.mailbox)
        },
        Err(e) => die!(
            Sysexit::for_error(&e),
            "Failed to open {}: {}",
            cmd.mailbox,
            e
        ),
    };

    let items = mem::take(&mut cmd.inputs);
    match run_delivery(&cmd, items.into_iter(), open_input, &mut mailbox) {
        Ok(CommitResult {
            first_uid: Some(first),
            last_uid: Some(last),
            ..
        }) => info!(
            "{} Delivered UIDs {}..={} to {}",
            storage.log_prefix(),
            first,
            last,
            cmd.mailbox
        ),
        Ok(_) => (),
        Err(exit) => exit.exit(),
    }
}

fn open_input(item: &Path) -> io::Result<Box<dyn Read>> {
    if Path::new("-") == item {
        Ok(Box::new(io::stdin()))
    } else {
        Ok(Box::new(fs::File::open(item)?))
    }
}

fn run_delivery(
    cmd: &DeliverSubcommand,
    items: impl Iterator<Item = PathBuf>,
    mut open: impl FnMut(&Path) -> io::Result<Box<dyn Read>>,
    mailbox: &mut Mailbox,
) -> Result<CommitResult, Sysexit> {
    let mut index = MemoryIndex::new();
    let mut tx = mailbox.transaction(&mut index);

    for item in items {
        if let Err(e) = deliver_single(cmd, &item, &mut open, &mut tx) {
            error!("Unable to process {}: {}", item.display(), e);
            return Err(Sysexit::for_error(&e));
        }
    }

    tx.commit_pre()
        .and_then(|()| tx.commit_post())
        .map_err(|e| {
            error!("Failed to deliver to {}: {}", cmd.mailbox, e);
            Sysexit::for_error(&e)
        })
}

fn deliver_single(
    cmd: &DeliverSubcommand,
    item: &Path,
    open: &mut impl FnMut(&Path) -> io::Result<Box<dyn Read>>,
    tx: &mut SaveTransaction<'_>,
) -> Result<(), Error> {
    let input = open(item)?;

    let mut flags = cmd.flag.clone();
    if cmd.maildir_flags {
        flags.extend(extract_maildir_flags(item));
    }

    tx.save_begin(SaveRequest::with_flags(flags), input)?;
    tx.save_finish()?;
    Ok(())
}

fn extract_maildir_flags(path: &Path) -> impl Iterator<Item = Flag> + '_ {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(filename::flag_chars)
        .unwrap_or("")
        .chars()
        .filter_map(Flag::from_maildir_char)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;

    use structopt::StructOpt;

    use super::*;
    use crate::maildir::model::Uid;
    use crate::maildir::storage::MaildirPlusPlus;
    use crate::support::config::StorageConfig;
    use crate::support::log_prefix::LogPrefix;

    fn set_up() -> (tempfile::TempDir, Storage) {
        crate::init_test_log();
        let root = tempfile::TempDir::new().unwrap();
        let storage = Storage::new(
            StorageConfig::default(),
            Arc::new(MaildirPlusPlus {
                root: root.path().to_owned(),
            }),
            LogPrefix::new("deliver".to_owned()),
        );
        storage.create_mailbox("INBOX").unwrap();
        (root, storage)
    }

    fn parse(args: &[&str]) -> DeliverSubcommand {
        let mut argv = vec!["deliver"];
        argv.extend_from_slice(args);
        DeliverSubcommand::from_iter_safe(argv).unwrap()
    }

    fn opener(
        files: HashMap<&'static str, &'static [u8]>,
    ) -> impl FnMut(&Path) -> io::Result<Box<dyn Read>> {
        move |path| match path.to_str().and_then(|p| files.get(p)) {
            Some(&data) => Ok(Box::new(data) as Box<dyn Read>),
            None => Err(io::ErrorKind::NotFound.into()),
        }
    }

    #[test]
    fn delivers_all_inputs_with_flags() {
        let (_root, storage) = set_up();
        let mut mailbox = storage.open_mailbox("INBOX").unwrap();
        let cmd = parse(&["--flag", "\\Flagged", "--maildir-flags"]);

        let mut files = HashMap::new();
        files.insert("a", &b"first\n"[..]);
        files.insert("cur/b:2,RS", &b"second\n"[..]);
        let items = vec![PathBuf::from("a"), PathBuf::from("cur/b:2,RS")];

        let result = run_delivery(
            &cmd,
            items.into_iter(),
            opener(files),
            &mut mailbox,
        )
        .unwrap();
        assert_eq!(Some(Uid::u(1)), result.first_uid);
        assert_eq!(Some(Uid::u(2)), result.last_uid);

        assert_eq!(Some(vec![Flag::Flagged]), mailbox.flags(Uid::u(1)));
        assert_eq!(
            Some(vec![Flag::Flagged, Flag::Answered, Flag::Seen]),
            mailbox.flags(Uid::u(2))
        );
    }

    #[test]
    fn missing_input_delivers_nothing() {
        let (root, storage) = set_up();
        let mut mailbox = storage.open_mailbox("INBOX").unwrap();
        let cmd = parse(&[]);

        let mut files = HashMap::new();
        files.insert("a", &b"first\n"[..]);
        let items = vec![PathBuf::from("a"), PathBuf::from("nonexistent")];

        assert_eq!(
            Err(EX_NOINPUT),
            run_delivery(&cmd, items.into_iter(), opener(files), &mut mailbox)
        );
        assert!(fs::read_dir(root.path().join("tmp"))
            .unwrap()
            .next()
            .is_none());
        assert!(fs::read_dir(root.path().join("new"))
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn flags_from_file_names() {
        let flags: Vec<Flag> =
            extract_maildir_flags(Path::new("cur/1234.host:2,FSa")).collect();
        assert_eq!(vec![Flag::Flagged, Flag::Seen], flags);
        assert_eq!(
            0,
            extract_maildir_flags(Path::new("new/1234.host")).count()
        );
    }
}
