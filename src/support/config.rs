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
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// The configuration of a storage instance.
///
/// This is typically stored in a file named `stowbox.toml`. Every option has
/// a default, so an empty file is a valid configuration. All options are
/// resolved once when the storage is created and never re-read.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Which on-disk layout to use.
    pub backend: BackendKind,

    /// Options governing how messages are saved and copied.
    pub maildir: MaildirConfig,

    /// Permissions applied to created files and directories.
    pub permissions: PermissionsConfig,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `tmp/`, `new/` and `cur/`, with metadata in file names.
    Maildir,
    /// One `<uid>.` file per message directly in the mailbox directory.
    Cydir,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Maildir
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaildirConfig {
    /// Try to copy messages between mailboxes by hardlinking the message
    /// file instead of copying its content.
    pub copy_with_hardlinks: bool,
    /// When hardlinking, keep the source file's base name if the destination
    /// does not already have a message by that name.
    pub copy_preserve_filename: bool,
    /// Embed the physical size (`,S=`) in new file names so that it can be
    /// found without a `stat()`.
    pub save_size_in_filename: bool,
    /// Also embed the virtual (CRLF) size (`,W=`). Only meaningful with
    /// `save_size_in_filename`.
    pub save_virtual_size_in_filename: bool,
    /// Store messages with CRLF line endings instead of bare LF.
    pub save_crlf: bool,
    /// Skip `fsync()` on saved messages and directories. Faster, but a crash
    /// may lose messages that were reported as saved.
    pub fsync_disable: bool,
    /// How many times to resynchronise the listing and retry when a message
    /// file vanishes between looking it up and opening it.
    pub max_locate_retries: u32,
    /// Periodically delete abandoned files from `tmp/`.
    pub tmp_cleanup: bool,
}

impl Default for MaildirConfig {
    fn default() -> Self {
        MaildirConfig {
            copy_with_hardlinks: true,
            copy_preserve_filename: false,
            save_size_in_filename: true,
            save_virtual_size_in_filename: true,
            save_crlf: false,
            fsync_disable: false,
            max_locate_retries: 10,
            tmp_cleanup: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Mode of newly created message and state files.
    pub file_mode: u32,
    /// Mode of newly created directories.
    pub dir_mode: u32,
    /// If set, the numeric group applied to newly created files.
    pub group: Option<u32>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        PermissionsConfig {
            file_mode: 0o600,
            dir_mode: 0o700,
            group: None,
        }
    }
}

impl StorageConfig {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }
}
