//! Growable byte buffer with a prepend area and scatter reads. Grounded in
//! `original_source/include/Buffer.h` / `src/Buffer.cpp`.

use std::io::{self, IoSliceMut, Read};
use std::os::unix::io::{FromRawFd, RawFd};

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

/// `0 ≤ prepend_size ≤ reader ≤ writer ≤ capacity` is maintained by every
/// method; `capacity()` below is `buf.len()`, not `buf.capacity()` — the
/// buffer always keeps its backing `Vec` fully initialized so scatter reads
/// can write directly into the tail slice.
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    pub fn readable(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable(&self) -> usize {
        self.reader
    }

    /// The unread bytes, oldest first.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Consumes `n` readable bytes. `n` must be `<= self.readable()`.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable());
        if n < self.readable() {
            self.reader += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Consumes and returns everything currently readable.
    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let data = self.buf[self.reader..self.writer].to_vec();
        self.retrieve_all();
        data
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Prepend bytes ahead of the readable region, e.g. for a length
    /// header. `data.len()` must be `<= prependable()`.
    pub fn prepend(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.prependable());
        self.reader -= data.len();
        let start = self.reader;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Grows the region either by sliding live bytes back to the prepend
    /// boundary, or by reallocating — whichever avoids a copy of the live
    /// data when possible.
    fn ensure_writable(&mut self, need: usize) {
        if self.writable() >= need {
            return;
        }

        let readable = self.readable();
        if self.prependable() + self.writable() >= need + CHEAP_PREPEND {
            self.buf.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        } else {
            self.buf.resize(self.writer + need, 0);
        }
    }

    /// Scatter-reads from `fd` into the buffer's tail plus a 64 KiB
    /// stack extra buffer, so most reads complete in one syscall without
    /// having to pre-grow the buffer to the peer's send size.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<isize> {
        let mut extra_buf = [0u8; 65536];
        let writable = self.writable();

        let n = {
            let mut file = unsafe { std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(fd)) };
            let mut slices = [
                IoSliceMut::new(&mut self.buf[self.writer..]),
                IoSliceMut::new(&mut extra_buf),
            ];
            (*file).read_vectored(&mut slices)
        };

        match n {
            Ok(n) => {
                if n <= writable {
                    self.writer += n;
                } else {
                    self.writer = self.buf.len();
                    self.append(&extra_buf[..n - writable]);
                }
                Ok(n as isize)
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(-1)
                } else {
                    Err(e)
                }
            }
        }
    }
}

// SAFETY of read_fd's ManuallyDrop<File>: the fd is borrowed, not owned —
// `TcpConnection` owns the underlying `Socket`. Wrapping a raw fd as a
// `File` only to call the standard library's vectored-read implementation,
// then forgetting the `File` without closing the fd, is the same trick
// `sys::fd::FileDesc` uses internally for its owned case; here we must not
// let `File::drop` close a fd we don't own.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_retrieve() {
        let mut buf = Buffer::new();
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.retrieve(5);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    fn retrieve_partial_matches_expected_remainder() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        let before = buf.readable();
        buf.retrieve(6);
        assert_eq!(buf.readable(), before - 6);
        assert_eq!(buf.peek(), b"world");
    }

    #[test]
    fn grows_by_move_when_prepend_has_room() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789");
        buf.retrieve(8);
        assert_eq!(buf.readable(), 2);
        // writable space is small, but prepend + trailing slack covers it
        buf.append(b"0123456789");
        assert_eq!(buf.readable(), 12);
        assert_eq!(&buf.peek()[..2], b"89");
    }

    #[test]
    fn prepend_writes_ahead_of_reader() {
        let mut buf = Buffer::new();
        buf.append(b"body");
        buf.prepend(&4i32.to_be_bytes());
        assert_eq!(buf.readable(), 8);
        assert_eq!(&buf.peek()[..4], &4i32.to_be_bytes());
    }

    #[test]
    fn invariants_hold_after_growth() {
        let mut buf = Buffer::with_capacity(4);
        for _ in 0..100 {
            buf.append(b"xxxxxxxxxxxxxxxxxxxxxxxxx");
            buf.retrieve(10);
        }
        assert!(buf.prependable() <= buf.reader && buf.reader <= buf.writer);
        assert!(buf.writer <= buf.buf.len());
    }
}
