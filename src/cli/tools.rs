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


//! The small administrative commands.

use std::io::{self, Write};

use super::main::{CopySubcommand, LocateSubcommand, SyncSubcommand};
use crate::maildir::index::MemoryIndex;
use crate::maildir::mailbox::Mailbox;
use crate::maildir::model::{Flag, Uid};
use crate::maildir::save::SaveRequest;
use crate::maildir::storage::Storage;
use crate::support::error::Error;
use crate::support::sysexits::*;

pub(super) fn copy(storage: Storage, cmd: CopySubcommand) {
    let uid = parse_uid(cmd.uid);
    let mut src = open_mailbox(&storage, &cmd.from);
    let mut dst = open_mailbox(&storage, &cmd.to);

    let flags = match src.flags(uid) {
        Some(flags) => flags,
        None => die!(EX_NOINPUT, "{}: No such message {}", cmd.from, uid),
    };

    let mut index = MemoryIndex::new();
    let mut tx = dst.transaction(&mut index);
    let result = tx
        .copy_or_stream(&mut src, uid, SaveRequest::with_flags(flags))
        .and_then(|_| tx.commit_pre())
        .and_then(|()| tx.commit_post());
    match result {
        Ok(result) => {
            if let Some(new_uid) = result.first_uid {
                println!("{} {}", result.uid_validity, new_uid);
            }
        },
        Err(e) => {
            tx.rollback();
            die!(
                Sysexit::for_error(&e),
                "Failed to copy {} UID {} to {}: {}",
                cmd.from,
                uid,
                cmd.to,
                e
            )
        },
    }
}

pub(super) fn locate(storage: Storage, cmd: LocateSubcommand) {
    let uid = parse_uid(cmd.uid);
    let mut mailbox = open_mailbox(&storage, &cmd.mailbox);
    match mailbox.locate(uid) {
        Ok(Some(path)) => println!("{}", path.display()),
        Ok(None) => {
            die!(EX_NOINPUT, "{}: No such message {}", cmd.mailbox, uid)
        },
        Err(e) => die!(Sysexit::for_error(&e), "{}: {}", cmd.mailbox, e),
    }
}

pub(super) fn sync(storage: Storage, cmd: SyncSubcommand) {
    let mut mailbox = open_mailbox(&storage, &cmd.mailbox);
    if let Err(e) = mailbox.force_sync() {
        die!(Sysexit::for_error(&e), "{}: {}", cmd.mailbox, e);
    }

    let stdout = io::stdout();
    if let Err(e) = write_listing(&mut stdout.lock(), &mailbox) {
        die!(EX_IOERR, "Failed to write listing: {}", e);
    }
}

fn write_listing(out: &mut impl Write, mailbox: &Mailbox) -> io::Result<()> {
    writeln!(
        out,
        "UIDVALIDITY {} UIDNEXT {}",
        mailbox.uid_validity(),
        mailbox.next_uid()
    )?;
    for record in mailbox.records() {
        let flags = mailbox
            .flags(record.uid)
            .unwrap_or_default()
            .iter()
            .map(Flag::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "{} ({}) {}", record.uid, flags, record.name)?;
    }
    Ok(())
}

fn parse_uid(uid: u32) -> Uid {
    match Uid::of(uid) {
        Some(uid) => uid,
        None => die!(EX_USAGE, "UID 0 is not valid"),
    }
}

fn open_mailbox(storage: &Storage, name: &str) -> Mailbox {
    match storage.open_mailbox(name) {
        Ok(mb) => mb,
        Err(Error::NxMailbox) | Err(Error::UnsafeName) => {
            die!(EX_NOINPUT, "{}: Non-existent mailbox", name)
        },
        Err(e) => {
            die!(Sysexit::for_error(&e), "Failed to open {}: {}", name, e)
        },
    }
}
