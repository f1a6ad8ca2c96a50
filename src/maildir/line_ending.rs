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

use std::io::{self, Read};

/// A reader which normalises line endings to either LF or CRLF.
///
/// Both bare LF and CRLF in the input are treated as line endings. A CR not
/// followed by LF is passed through unchanged. Along the way, the filter
/// counts both the number of bytes it produced and the number of bytes it
/// would have produced with CRLF line endings (the "virtual size").
///
/// `WouldBlock` and other errors from the inner reader are passed through;
/// the filter can be read from again afterwards without losing data.
pub struct LineEndingFilter<R> {
    inner: R,
    crlf: bool,
    pending_cr: bool,
    eof: bool,
    out: Vec<u8>,
    out_pos: usize,
    physical: u64,
    virtual_size: u64,
}

const CHUNK: usize = 16384;

impl<R: Read> LineEndingFilter<R> {
    pub fn new(inner: R, crlf: bool) -> Self {
        LineEndingFilter {
            inner,
            crlf,
            pending_cr: false,
            eof: false,
            out: Vec::with_capacity(CHUNK * 2),
            out_pos: 0,
            physical: 0,
            virtual_size: 0,
        }
    }

    /// The number of bytes produced so far.
    pub fn physical(&self) -> u64 {
        self.physical
    }

    /// The size of the output so far if all line endings were CRLF.
    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn convert(&mut self, mut input: &[u8]) {
        if self.pending_cr && !input.is_empty() {
            self.pending_cr = false;
            if b'\n' == input[0] {
                self.push_eol();
                input = &input[1..];
            } else {
                self.push(b"\r");
            }
        }

        while let Some(ix) = memchr::memchr2(b'\r', b'\n', input) {
            self.push(&input[..ix]);
            if b'\n' == input[ix] {
                self.push_eol();
                input = &input[ix + 1..];
            } else if ix + 1 == input.len() {
                // Can't tell yet whether this is a line ending
                self.pending_cr = true;
                input = &[];
            } else if b'\n' == input[ix + 1] {
                self.push_eol();
                input = &input[ix + 2..];
            } else {
                self.push(b"\r");
                input = &input[ix + 1..];
            }
        }

        self.push(input);
    }

    fn finish(&mut self) {
        if self.pending_cr {
            self.pending_cr = false;
            self.push(b"\r");
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
        self.physical += data.len() as u64;
        self.virtual_size += data.len() as u64;
    }

    fn push_eol(&mut self) {
        if self.crlf {
            self.out.extend_from_slice(b"\r\n");
            self.physical += 2;
        } else {
            self.out.push(b'\n');
            self.physical += 1;
        }
        self.virtual_size += 2;
    }
}

impl<R: Read> Read for LineEndingFilter<R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        while self.out_pos >= self.out.len() {
            if self.eof {
                return Ok(0);
            }

            self.out.clear();
            self.out_pos = 0;

            let mut chunk = [0u8; CHUNK];
            let n = self.inner.read(&mut chunk)?;
            if 0 == n {
                self.eof = true;
                self.finish();
            } else {
                self.convert(&chunk[..n]);
            }
        }

        let available = &self.out[self.out_pos..];
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        self.out_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Yields its data one byte per read, with a `WouldBlock` before each
    /// byte.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        block: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
            self.block = !self.block;
            if self.block {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            if self.pos >= self.data.len() || dst.is_empty() {
                return Ok(0);
            }

            dst[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    fn filter_all(input: &[u8], crlf: bool) -> (Vec<u8>, u64, u64) {
        let mut filter = LineEndingFilter::new(input, crlf);
        let mut out = Vec::new();
        filter.read_to_end(&mut out).unwrap();
        let (p, v) = (filter.physical(), filter.virtual_size());
        (out, p, v)
    }

    #[test]
    fn normalise_to_lf() {
        let (out, p, v) = filter_all(b"a\r\nb\nc\rd\r", false);
        assert_eq!(b"a\nb\nc\rd\r".to_vec(), out);
        assert_eq!(out.len() as u64, p);
        assert_eq!(10, v);
    }

    #[test]
    fn normalise_to_crlf() {
        let (out, p, v) = filter_all(b"a\r\nb\nc\rd", true);
        assert_eq!(b"a\r\nb\r\nc\rd".to_vec(), out);
        assert_eq!(out.len() as u64, p);
        assert_eq!(p, v);
    }

    #[test]
    fn cr_split_across_reads() {
        let input = b"one\r\ntwo\r\r\nthree\r".to_vec();
        let mut filter = LineEndingFilter::new(
            Trickle {
                data: input.clone(),
                pos: 0,
                block: false,
            },
            false,
        );

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            match filter.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if io::ErrorKind::WouldBlock == e.kind() => continue,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(b"one\ntwo\r\nthree\r".to_vec(), out);
        assert_eq!(filter_all(&input, false).0, out);
        assert_eq!(17, filter.virtual_size());
    }
}
