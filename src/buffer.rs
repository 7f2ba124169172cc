use std::io;
use std::io::IoSliceMut;
use std::os::fd::RawFd;

use crate::sys::readv;

/// Space reserved in front of the readable zone so framing codecs can
/// prepend a small header without shifting the payload.
const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer with a prependable header area.
///
/// The storage is split into three zones by two indices:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=    len
/// ```
///
/// `append` grows the writable zone, `retrieve` consumes the readable
/// zone, `prepend` writes backwards into the prependable zone. When the
/// writable zone runs out, readable content is slid back to
/// `CHEAP_PREPEND` before any reallocation happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
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

    /// The readable zone, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consume `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume everything and reset both indices to the cheap-prepend
    /// mark, making the whole buffer writable again.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Copy out and consume `n` readable bytes.
    pub fn retrieve_as_bytes(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    /// Copy out and consume the whole readable zone as a string.
    pub fn retrieve_all_as_string(&mut self) -> String {
        let out = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        out
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.writer_index..self.writer_index + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Write `data` in front of the readable zone without moving it.
    ///
    /// Panics if the prependable zone is too small; callers only prepend
    /// headers no larger than `CHEAP_PREPEND`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        self.buf[self.reader_index..self.reader_index + data.len()].copy_from_slice(data);
    }

    /// Make room for at least `n` more writable bytes.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.writable_bytes() + self.prependable_bytes() < n + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + n, 0);
        } else {
            // Enough total room; slide readable content back to the
            // cheap-prepend mark instead of reallocating.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
        assert!(self.writable_bytes() >= n);
    }

    /// Append a `u32` in network byte order.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Prepend a `u32` in network byte order; the cheap way to emit a
    /// length header after the payload has been appended.
    pub fn prepend_u32(&mut self, value: u32) {
        self.prepend(&value.to_be_bytes());
    }

    /// Read a big-endian `u32` from the front of the readable zone
    /// without consuming it. Byte-wise, so alignment of the underlying
    /// storage never matters.
    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.peek()[..4]);
        u32::from_be_bytes(bytes)
    }

    /// [`peek_u32`] then consume the four bytes.
    ///
    /// [`peek_u32`]: Buffer::peek_u32
    pub fn read_u32(&mut self) -> u32 {
        let value = self.peek_u32();
        self.retrieve(4);
        value
    }

    /// Fill the buffer from `fd` with a two-iovec scatter read.
    ///
    /// The second iovec is a 64 KiB stack extent: one syscall can pull in
    /// far more than the current writable zone without every idle buffer
    /// carrying that much memory. Whatever lands in the extent is
    /// appended afterwards.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let (_, tail) = self.buf.split_at_mut(self.writer_index);
        let mut iovs = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];

        let n = readv(fd, &mut iovs)?;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        let data = vec![b'x'; 200];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 200);

        let front = buf.retrieve_as_bytes(50);
        assert_eq!(front.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn random_round_trip() {
        use rand::RngCore;

        let mut data = vec![0u8; 128 * 1024];
        rand::rng().fill_bytes(&mut data);

        let mut buf = Buffer::new();
        buf.append(&data);
        assert_eq!(buf.peek(), &data[..]);
        assert_eq!(buf.retrieve_as_bytes(data.len()), data);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn grows_and_compacts() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.retrieve(350);

        // 50 readable left near the end; this fits only after compaction.
        buf.append(&vec![b'z'; INITIAL_SIZE - 100]);
        assert_eq!(buf.readable_bytes(), 50 + INITIAL_SIZE - 100);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        // And this forces an actual reallocation.
        buf.append(&vec![b'w'; INITIAL_SIZE]);
        assert_eq!(buf.readable_bytes(), 50 + INITIAL_SIZE - 100 + INITIAL_SIZE);
    }

    #[test]
    fn prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_u32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.read_u32(), 7);
        assert_eq!(buf.peek(), b"payload");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn u32_byte_wise() {
        let mut buf = Buffer::new();
        // Misalign the readable zone on purpose.
        buf.append(b"x");
        buf.append_u32(0xdead_beef);
        buf.retrieve(1);
        assert_eq!(buf.peek_u32(), 0xdead_beef);
        assert_eq!(buf.read_u32(), 0xdead_beef);
        assert_eq!(buf.readable_bytes(), 0);
    }
}
