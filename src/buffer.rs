//! A growable byte buffer with a cheap prepend area, used for both the
//! inbound and outbound sides of a [`crate::net::connection::Connection`].
//!
//! Layout:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader_index   <=   writer_index    <=    len
//! ```

use std::io::{self, IoSliceMut};

use crate::sys::ReadVectored;

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

/// Size of the stack-resident spill buffer `read_fd` reads into when the
/// writable tail of the buffer runs out. Keeps a socket with little pending
/// data from forcing a 64 KiB allocation per connection.
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Buffer {
        let mut buf = Vec::with_capacity(CHEAP_PREPEND + initial_size);
        buf.resize(CHEAP_PREPEND + initial_size, 0);
        Buffer {
            buf,
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region as a slice.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.peek().iter().position(|&b| b == b'\n')
    }

    /// Drop `len` bytes from the front of the readable region.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end <= self.readable_bytes());
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Drop and return the first `len` readable bytes as an owned `Vec`.
    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.peek()[..len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let n = self.readable_bytes();
        self.retrieve_as_vec(n)
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Mark `len` bytes, already written directly into the writable tail
    /// (e.g. by a vectored read), as part of the readable region.
    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    /// Inject `data` directly before the current readable region, e.g. for
    /// a length-prefix header computed after the body was already appended.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    fn writer_ptr_range(&mut self) -> std::ops::Range<usize> {
        self.writer_index..self.buf.len()
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }

    /// Read once from `fd` directly into the buffer's writable tail, spilling
    /// into a stack-resident scratch array when that tail is small. This is
    /// what lets a single read syscall drain an arbitrarily large socket
    /// buffer without first probing its size with an ioctl.
    pub fn read_fd(&mut self, fd: &impl ReadVectored) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let range = self.writer_ptr_range();
            let tail = &mut self.buf[range];
            if writable < EXTRA_BUF_SIZE {
                let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
                fd.read_vectored(&mut slices)?
            } else {
                let mut slices = [IoSliceMut::new(tail)];
                fd.read_vectored(&mut slices)?
            }
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    pub fn internal_capacity(&self) -> usize {
        self.buf.capacity()
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn starts_empty() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), super::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), super::CHEAP_PREPEND);
    }

    #[test]
    fn append_then_retrieve_round_trips() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        let out = buf.retrieve_as_vec(11);
        assert_eq!(out, b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn split_append_reads_back_concatenated() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.retrieve_all_as_vec(), b"hello world");
    }

    #[test]
    fn prepend_lands_before_readable_region() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        buf.prepend(b"hello ");
        assert_eq!(buf.retrieve_all_as_vec(), b"hello world");
    }

    #[test]
    fn growth_past_initial_capacity_preserves_content() {
        let mut buf = Buffer::with_capacity(4);
        let payload = vec![7u8; 4096];
        buf.append(&payload);
        assert_eq!(buf.readable_bytes(), 4096);
        assert_eq!(buf.retrieve_all_as_vec(), payload);
    }

    #[test]
    fn retrieve_reclaims_space_via_make_space_shift() {
        let mut buf = Buffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(10);
        buf.append(b"more");
        assert_eq!(buf.retrieve_all_as_vec(), b"abcdefmore");
    }

    #[test]
    fn find_eol_locates_newline_in_readable_region() {
        let mut buf = Buffer::new();
        buf.append(b"line one\nline two");
        let pos = buf.find_eol().unwrap();
        assert_eq!(&buf.peek()[..pos], b"line one");
    }
}
