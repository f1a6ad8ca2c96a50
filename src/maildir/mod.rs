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


//! Crash-consistent message storage in maildir (and cydir) mailboxes.
//!
//! A `Storage` resolves mailbox names to directories and hands out
//! `Mailbox` handles. Messages enter a mailbox only through a
//! `SaveTransaction`, either by streaming their content or by hardlinking
//! them from another mailbox.

pub mod backend;
pub mod copy;
pub mod filename;
pub mod index;
pub mod keywords;
pub mod line_ending;
pub mod locate;
pub mod mailbox;
pub mod model;
pub mod save;
pub mod storage;
pub mod uidlist;
pub mod unique;
