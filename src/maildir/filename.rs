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

//! Encoding and decoding of the metadata carried in maildir file names.
//!
//! A file name looks like
//!
//! ```text
//! <base>[,<marker>=<digits>]*[:2,<flagchars>]
//! ```
//!
//! The part before the first `:` (the "base") identifies the message for its
//! whole life; everything after it (the "info") changes whenever the flags
//! change. `S` carries the physical size and `W` the virtual size, so that
//! both can be answered without a `stat()`.

pub const INFO_SEP: char = ':';
pub const EXTRA_SEP: char = ',';
/// The standard flags separator: "experimental semantics" version 2.
pub const FLAGS_FULL_SEP: &str = ":2,";

pub const FILE_SIZE: char = 'S';
pub const VIRTUAL_SIZE: char = 'W';

pub const KEYWORD_FIRST: char = 'a';
pub const KEYWORD_LAST: char = 'z';
pub const MAX_KEYWORDS: usize =
    (KEYWORD_LAST as usize) - (KEYWORD_FIRST as usize) + 1;

/// Return the base of `name`, i.e., everything before the info section.
pub fn base(name: &str) -> &str {
    match name.find(INFO_SEP) {
        Some(ix) => &name[..ix],
        None => name,
    }
}

/// Return the flag characters of `name`, or `None` if it has no standard
/// info section.
pub fn flag_chars(name: &str) -> Option<&str> {
    name.find(FLAGS_FULL_SEP)
        .map(|ix| &name[ix + FLAGS_FULL_SEP.len()..])
}

/// Look for a `,<marker>=<digits>` token in `name` and return its value.
///
/// The digits must be terminated by another extra field, the info section,
/// or the end of the name. Anything malformed, including a value that does
/// not fit in a `u64`, is treated as not present.
pub fn get_size(name: &str, marker: char) -> Option<u64> {
    let base = base(name);
    let mut token = [0u8; 3];
    let token = {
        token[0] = EXTRA_SEP as u8;
        token[1] = marker as u8;
        token[2] = b'=';
        &token[..]
    };

    let bytes = base.as_bytes();
    let start = bytes
        .windows(token.len())
        .position(|w| w == token)
        .map(|ix| ix + token.len())?;

    let digits = &bytes[start..];
    let end = digits
        .iter()
        .position(|&b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if 0 == end {
        return None;
    }
    // Only the base was scanned, so the only terminators left are EXTRA_SEP
    // and the end of the base.
    if end < digits.len() && digits[end] != EXTRA_SEP as u8 {
        return None;
    }

    digits[..end].iter().try_fold(0u64, |accum, &d| {
        accum.checked_mul(10)?.checked_add((d - b'0') as u64)
    })
}

/// Insert size markers into `name` immediately before its info section (or
/// at the end if there is none).
///
/// Each marker must be inserted at most once per name; this does not check
/// whether the marker is already present.
pub fn insert_sizes(
    name: &str,
    size: Option<u64>,
    vsize: Option<u64>,
) -> String {
    let base_end = base(name).len();
    let mut out = String::with_capacity(name.len() + 32);
    out.push_str(&name[..base_end]);
    if let Some(size) = size {
        out.push(EXTRA_SEP);
        out.push(FILE_SIZE);
        out.push('=');
        out.push_str(&size.to_string());
    }
    if let Some(vsize) = vsize {
        out.push(EXTRA_SEP);
        out.push(VIRTUAL_SIZE);
        out.push('=');
        out.push_str(&vsize.to_string());
    }
    out.push_str(&name[base_end..]);
    out
}

/// Replace the info section of `name` with one carrying `flags`.
///
/// `flags` are sorted and deduplicated. If there are no flags, the result
/// has no info section at all, which is the form used in `new/`.
pub fn set_flags(name: &str, flags: &[char]) -> String {
    let mut flags = flags.to_vec();
    flags.sort_unstable();
    flags.dedup();

    let mut out = base(name).to_owned();
    if !flags.is_empty() {
        out.push_str(FLAGS_FULL_SEP);
        out.extend(flags);
    }
    out
}

/// Build the full name of a message: `base` with its size markers, followed
/// by the info section for `flags`.
pub fn encode(
    base: &str,
    flags: &[char],
    size: Option<u64>,
    vsize: Option<u64>,
) -> String {
    set_flags(&insert_sizes(base, size, vsize), flags)
}

/// Return whether two file names refer to the same message, i.e., whether
/// their bases are equal.
pub fn same_base(a: &str, b: &str) -> bool {
    base(a) == base(b)
}
