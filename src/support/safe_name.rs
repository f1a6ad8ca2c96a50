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

/// Determine whether the given mailbox name is "safe" to turn into a
/// directory name.
///
/// This excludes empty names, directory traversal, hidden-file tricks and
/// anything containing control characters or a path separator. Whether the
/// name is ultimately accepted by the file system is left to the OS.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        // Block directory traversal through .. and creation of hidden files
        !name.starts_with('.') &&
        !name.ends_with('.') &&
        !name.contains("..") &&
        !name.contains('/') &&
        !name.contains('\\') &&
        !name.contains(|c: char| c < ' ' || c == '\x7F')
}

/// Determine whether `keyword` can be stored as a keyword.
///
/// Keywords end up one per line in the keyword table, so besides being a
/// valid IMAP atom they must not contain whitespace. A leading backslash is
/// reserved for system flags.
pub fn is_safe_keyword(keyword: &str) -> bool {
    !keyword.is_empty()
        && keyword.len() <= 128
        && !keyword.starts_with('\\')
        && keyword.chars().all(|c| {
            c > ' '
                && c != '\x7F'
                && !matches!(c, '(' | ')' | '{' | '%' | '*' | '"' | ']')
        })
}
