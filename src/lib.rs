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

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat if $guard:expr, $actual:expr) => {
        match $actual {
            $expected if $guard => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod cli;
pub mod maildir;
pub mod support;

pub use crate::maildir::copy::CopyOutcome;
pub use crate::maildir::index::{IndexTransaction, MemoryIndex, ModifyMode};
pub use crate::maildir::mailbox::Mailbox;
pub use crate::maildir::model::{Flag, MessageSize, Seq, Uid};
pub use crate::maildir::save::{CommitResult, SaveRequest, SaveTransaction};
pub use crate::maildir::storage::{
    ErrorSink, LogErrorSink, MailboxPathResolver, MaildirPlusPlus, Storage,
};
pub use crate::support::config::StorageConfig;
pub use crate::support::error::{Error, ErrorKind};

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} [{}][{}] {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    message,
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply();
    })
}
