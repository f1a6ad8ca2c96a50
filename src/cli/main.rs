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


use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use structopt::StructOpt;

use crate::maildir::model::Flag;
use crate::maildir::storage::{MaildirPlusPlus, Storage};
use crate::support::config::StorageConfig;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The storage configuration file. A `logging.toml` next to it, if
    /// present, configures logging. [default: built-in defaults]
    #[structopt(long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    Deliver(DeliverSubcommand),
    /// Copy a message to another mailbox.
    ///
    /// The copy shares the file of the original if the configuration allows
    /// it; otherwise the content is copied. The copy keeps the flags of the
    /// original.
    Copy(CopySubcommand),
    /// Print the current path of a message file.
    Locate(LocateSubcommand),
    /// Rescan a mailbox and print its listing.
    ///
    /// The first line is the UID validity and the next UID; then there is
    /// one line per message with its UID, flags and file name.
    Sync(SyncSubcommand),
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Deliver(ref mut c) => mem::take(&mut c.common),
            Command::Copy(ref mut c) => mem::take(&mut c.common),
            Command::Locate(ref mut c) => mem::take(&mut c.common),
            Command::Sync(ref mut c) => mem::take(&mut c.common),
        }
    }

    fn name(&self) -> &'static str {
        match *self {
            Command::Deliver(..) => "deliver",
            Command::Copy(..) => "copy",
            Command::Locate(..) => "locate",
            Command::Sync(..) => "sync",
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The Maildir++ directory holding the mailboxes [default: ~/Maildir]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

/// Deliver or import mail.
///
/// All inputs are saved in one transaction: either every input is delivered
/// or, if any input fails, none is. (A failure while making the messages
/// visible can leave a prefix of them delivered; this is reported.)
///
/// A maildir can be imported by passing all its files to this command, e.g.
///
/// ls Maildir/cur/* | xargs -d'\n' stowbox deliver --maildir-flags -m Import
#[derive(StructOpt)]
pub(super) struct DeliverSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// Deliver to this mailbox.
    #[structopt(short, long, default_value = "INBOX")]
    pub(super) mailbox: String,

    /// Create the destination mailbox if it does not already exist.
    #[structopt(short, long)]
    pub(super) create: bool,

    /// Add this flag (e.g., '\Flagged') or keyword to the delivered
    /// message(s). Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    pub(super) flag: Vec<Flag>,

    /// Extract maildir-style flags from the file name(s).
    #[structopt(long)]
    pub(super) maildir_flags: bool,

    /// The files to deliver. "-" reads from standard input.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) inputs: Vec<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct CopySubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// The mailbox containing the message.
    #[structopt(long)]
    pub(super) from: String,

    /// The UID of the message.
    #[structopt(long)]
    pub(super) uid: u32,

    /// The mailbox to copy into.
    #[structopt(long)]
    pub(super) to: String,
}

#[derive(StructOpt)]
pub(super) struct LocateSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    #[structopt(short, long, default_value = "INBOX")]
    pub(super) mailbox: String,

    #[structopt(long)]
    pub(super) uid: u32,
}

#[derive(StructOpt)]
pub(super) struct SyncSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    #[structopt(short, long, default_value = "INBOX")]
    pub(super) mailbox: String,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let opts = Options::from_clap(&match Options::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    let mut cmd = opts.command;
    let common = cmd.common_options();

    let config = match opts.config {
        Some(ref path) => match StorageConfig::load(path) {
            Ok(config) => config,
            Err(e) => die!(
                EX_CONFIG,
                "Error in config file at '{}': {}",
                path.display(),
                e
            ),
        },
        None => StorageConfig::default(),
    };

    init_logging(opts.config.as_deref());

    let root = match common.root.or_else(default_root) {
        Some(root) => root,
        None => die!(
            EX_USAGE,
            "$HOME is not set; use --root=/path/to/Maildir to say where \
             the mailboxes are."
        ),
    };
    if !root.is_dir() {
        die!(EX_CANTCREAT, "'{}' is not a directory", root.display());
    }

    let storage = Storage::new(
        config,
        Arc::new(MaildirPlusPlus { root }),
        LogPrefix::new(format!(
            "{}:{}",
            cmd.name(),
            nix::unistd::getpid().as_raw()
        )),
    );

    match cmd {
        Command::Deliver(cmd) => super::deliver::deliver(storage, cmd),
        Command::Copy(cmd) => super::tools::copy(storage, cmd),
        Command::Locate(cmd) => super::tools::locate(storage, cmd),
        Command::Sync(cmd) => super::tools::sync(storage, cmd),
    }
}

fn default_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| Path::new(&home).join("Maildir"))
}

fn init_logging(config_path: Option<&Path>) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        init_simple_log();
        return;
    }

    let log_config_file = config_path
        .and_then(Path::parent)
        .map(|dir| dir.join("logging.toml"));
    if let Some(log_config_file) = log_config_file.filter(|f| f.is_file()) {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw(),
    };
    let logger = match syslog::unix(formatter) {
        Ok(logger) => logger,
        Err(e) => die!(EX_UNAVAILABLE, "Failed to connect to syslog: {}", e),
    };
    if let Err(e) =
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
    {
        die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
    }
    log::set_max_level(log::LevelFilter::Info);
}

fn init_simple_log() {
    let result = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message,
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply();
    if let Err(e) = result {
        die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
    }
}
