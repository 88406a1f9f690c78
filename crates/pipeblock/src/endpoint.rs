//! Parent-side pipe endpoints with item-granular, nonblocking transfers.
//!
//! Each endpoint owns exactly one descriptor. Dropping an endpoint closes it, so
//! every exit path (including a failed construction) releases the descriptor.
//!
//! Items are opaque fixed-size byte runs. The pipe does not preserve item
//! boundaries, so both directions keep a small carry buffer:
//! - read: trailing bytes of an item that has only partly arrived
//! - write: the unwritten tail of an item the pipe only partly accepted
//!
//! In both cases the carry never holds a whole item.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};

use crate::error::{SpawnError, TransferError};

/// Staging capacity for buffered writes (bytes). Matches the stdio default
/// buffer size on common platforms.
pub const WRITE_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Parent reads what the child writes to its stdout.
    ReadFromChild,
    /// Parent writes what the child reads from its stdin.
    WriteToChild,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ReadFromChild => "output",
            Direction::WriteToChild => "input",
        }
    }
}

/// A single owned pipe descriptor with an explicit direction and blocking mode.
#[derive(Debug)]
pub struct PipeEndpoint {
    file: File,
    direction: Direction,
    nonblocking: bool,
}

impl PipeEndpoint {
    /// Wrap a descriptor without touching its flags.
    pub fn new(fd: OwnedFd, direction: Direction) -> Self {
        Self {
            file: File::from(fd),
            direction,
            nonblocking: false,
        }
    }

    /// Wrap a parent-side descriptor and mark it nonblocking and close-on-exec.
    ///
    /// On failure the descriptor is closed before the error is returned.
    pub fn configure(fd: OwnedFd, direction: Direction) -> Result<Self, SpawnError> {
        let raw = fd.as_raw_fd();
        let mut endpoint = Self::new(fd, direction);
        set_cloexec(endpoint.as_fd()).map_err(|source| {
            tracing::error!(fd = raw, error = %source, "fcntl(F_SETFD) failed");
            SpawnError::Fcntl { fd: raw, source }
        })?;
        endpoint.set_nonblocking(true).map_err(|source| {
            tracing::error!(fd = raw, error = %source, "fcntl(F_SETFL) failed");
            SpawnError::Fcntl { fd: raw, source }
        })?;
        Ok(endpoint)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn set_nonblocking(&mut self, nonblocking: bool) -> nix::Result<()> {
        let bits = fcntl(self.file.as_fd(), FcntlArg::F_GETFL)?;
        let mut flags = OFlag::from_bits_truncate(bits);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(self.file.as_fd(), FcntlArg::F_SETFL(flags))?;
        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Read into `buf`, retrying on EINTR. `Ok(None)` means "would block".
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            match self.file.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `buf` as the pipe takes right now, retrying on EINTR.
    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.file.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

impl AsFd for PipeEndpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for PipeEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl From<PipeEndpoint> for OwnedFd {
    fn from(endpoint: PipeEndpoint) -> Self {
        OwnedFd::from(endpoint.file)
    }
}

fn set_cloexec(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(bits);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

/// Result of one item-granular read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Whole items placed at the start of the caller's buffer.
    pub items: usize,
    /// The child closed its stdout. Distinct from "nothing ready yet".
    pub eof: bool,
}

/// Reads whole items from the child's stdout.
#[derive(Debug)]
pub struct ReadEndpoint {
    pipe: PipeEndpoint,
    item_size: usize,
    carry: Vec<u8>,
}

impl ReadEndpoint {
    /// `item_size` must be non-zero; the bridge constructors check it.
    pub(crate) fn new(pipe: PipeEndpoint, item_size: usize) -> Self {
        debug_assert_eq!(pipe.direction(), Direction::ReadFromChild);
        Self {
            pipe,
            item_size,
            carry: Vec::with_capacity(item_size),
        }
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Bytes of a partly received item held over from earlier reads.
    pub fn carried(&self) -> usize {
        self.carry.len()
    }

    pub fn pipe(&self) -> &PipeEndpoint {
        &self.pipe
    }

    pub fn pipe_mut(&mut self) -> &mut PipeEndpoint {
        &mut self.pipe
    }

    /// Read up to `max_items` whole items into `out`.
    ///
    /// Carried bytes from earlier calls are placed first. Bytes that do not
    /// complete an item are carried to the next call; zero items is a normal
    /// outcome when nothing (or less than one item) is ready.
    pub fn read_items(
        &mut self,
        out: &mut [u8],
        max_items: usize,
    ) -> Result<ReadOutcome, TransferError> {
        let size = self.item_size;
        let want = max_items.min(out.len() / size) * size;
        if want == 0 {
            return Ok(ReadOutcome::default());
        }

        let mut filled = self.carry.len();
        out[..filled].copy_from_slice(&self.carry);
        self.carry.clear();

        let mut eof = false;
        while filled < want {
            match self.pipe.read_some(&mut out[filled..want]) {
                Ok(Some(0)) => {
                    eof = true;
                    break;
                }
                Ok(Some(n)) => filled += n,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(fd = self.pipe.as_raw_fd(), error = %e, "read() failed");
                    return Err(TransferError::Read(e));
                }
            }
        }

        let items = filled / size;
        let whole = items * size;
        if eof && filled > whole {
            tracing::warn!(
                bytes = filled - whole,
                item_size = size,
                "Child closed stdout mid-item, discarding partial item"
            );
        } else {
            self.carry.extend_from_slice(&out[whole..filled]);
        }

        tracing::trace!(items, carried = self.carry.len(), eof, "Read from child");
        Ok(ReadOutcome { items, eof })
    }

    /// Blocking-agnostic raw read used by teardown. `Ok(None)` means "would block".
    pub(crate) fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        self.pipe.read_some(buf)
    }
}

/// Writes whole items into the child's stdin.
#[derive(Debug)]
pub struct WriteEndpoint {
    pipe: PipeEndpoint,
    item_size: usize,
    capacity: usize,
    unbuffered: bool,
    staged: Vec<u8>,
}

impl WriteEndpoint {
    /// `item_size` must be non-zero; the bridge constructors check it.
    pub(crate) fn new(pipe: PipeEndpoint, item_size: usize, unbuffered: bool) -> Self {
        debug_assert_eq!(pipe.direction(), Direction::WriteToChild);
        let capacity = WRITE_BUFFER_CAPACITY.max(item_size);
        Self {
            pipe,
            item_size,
            capacity,
            unbuffered,
            staged: Vec::with_capacity(capacity),
        }
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn is_unbuffered(&self) -> bool {
        self.unbuffered
    }

    /// Switching to unbuffered takes effect on the next write, which first
    /// flushes anything staged while buffered.
    pub fn set_unbuffered(&mut self, unbuffered: bool) {
        self.unbuffered = unbuffered;
    }

    /// Bytes accepted from the caller but not yet in the pipe.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    pub fn pipe(&self) -> &PipeEndpoint {
        &self.pipe
    }

    pub fn pipe_mut(&mut self) -> &mut PipeEndpoint {
        &mut self.pipe
    }

    fn staging_full(&self) -> bool {
        self.staged.len() + self.item_size > self.capacity
    }

    /// Offer up to `nitems` items from `input`; returns how many were accepted.
    ///
    /// Accepted items count as consumed by the caller. Fewer than `nitems`,
    /// including zero, is the normal "would block" outcome.
    pub fn write_items(&mut self, input: &[u8], nitems: usize) -> Result<usize, TransferError> {
        let size = self.item_size;
        let nitems = nitems.min(input.len() / size);

        if self.unbuffered || self.staging_full() {
            self.flush_staged()?;
        }

        let accepted = if self.unbuffered {
            if !self.staged.is_empty() {
                return Ok(0);
            }
            let bytes = &input[..nitems * size];
            let written = self
                .pipe
                .write_some(bytes)
                .map_err(|e| self.write_error(e))?;
            let accepted = written.div_ceil(size);
            self.staged
                .extend_from_slice(&bytes[written..accepted * size]);
            accepted
        } else {
            let room = (self.capacity - self.staged.len()) / size;
            let accepted = nitems.min(room);
            self.staged.extend_from_slice(&input[..accepted * size]);
            if self.staging_full() {
                self.flush_staged()?;
            }
            accepted
        };

        tracing::trace!(
            offered = nitems,
            accepted,
            staged = self.staged.len(),
            "Wrote to child"
        );
        Ok(accepted)
    }

    /// Push staged bytes into the pipe. In nonblocking mode this stops at the
    /// first "would block"; in blocking mode it writes everything.
    pub fn flush_staged(&mut self) -> Result<usize, TransferError> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let written = self
            .pipe
            .write_some(&self.staged)
            .map_err(|e| self.write_error(e))?;
        self.staged.drain(..written);
        Ok(written)
    }

    fn write_error(&self, e: io::Error) -> TransferError {
        tracing::error!(fd = self.pipe.as_raw_fd(), error = %e, "write() failed");
        TransferError::Write(e)
    }

    /// Close the descriptor. Returns the number of staged bytes that never
    /// reached the child, which are logged and discarded.
    pub fn close(self) -> usize {
        let discarded = self.staged.len();
        if discarded > 0 {
            tracing::warn!(
                fd = self.pipe.as_raw_fd(),
                bytes = discarded,
                "Closing child stdin with undelivered input"
            );
        } else {
            tracing::debug!(fd = self.pipe.as_raw_fd(), "Closing child stdin");
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    fn reader(item_size: usize) -> (ReadEndpoint, File) {
        let (r, w) = pipe().unwrap();
        let pipe = PipeEndpoint::configure(r, Direction::ReadFromChild).unwrap();
        (ReadEndpoint::new(pipe, item_size), File::from(w))
    }

    fn writer(item_size: usize, unbuffered: bool) -> (WriteEndpoint, File) {
        let (r, w) = pipe().unwrap();
        let pipe = PipeEndpoint::configure(w, Direction::WriteToChild).unwrap();
        (WriteEndpoint::new(pipe, item_size, unbuffered), File::from(r))
    }

    fn set_nonblocking(file: &File) {
        let bits = fcntl(file.as_fd(), FcntlArg::F_GETFL).unwrap();
        let flags = OFlag::from_bits_truncate(bits) | OFlag::O_NONBLOCK;
        fcntl(file.as_fd(), FcntlArg::F_SETFL(flags)).unwrap();
    }

    #[test]
    fn configure_sets_nonblocking_and_cloexec() {
        let (r, _w) = pipe().unwrap();
        let pipe = PipeEndpoint::configure(r, Direction::ReadFromChild).unwrap();

        assert!(pipe.is_nonblocking());
        let fl = OFlag::from_bits_truncate(fcntl(pipe.as_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(fl.contains(OFlag::O_NONBLOCK));
        let fd = FdFlag::from_bits_truncate(fcntl(pipe.as_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(fd.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn set_nonblocking_round_trips() {
        let (r, _w) = pipe().unwrap();
        let mut pipe = PipeEndpoint::configure(r, Direction::ReadFromChild).unwrap();
        pipe.set_nonblocking(false).unwrap();

        assert!(!pipe.is_nonblocking());
        let fl = OFlag::from_bits_truncate(fcntl(pipe.as_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(!fl.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn read_on_empty_pipe_is_zero_items_not_error() {
        let (mut ep, _w) = reader(4);
        let mut out = [0u8; 16];

        let outcome = ep.read_items(&mut out, 4).unwrap();
        assert_eq!(outcome, ReadOutcome { items: 0, eof: false });
    }

    #[test]
    fn partial_item_is_carried_into_next_read() {
        let (mut ep, mut w) = reader(4);
        let mut out = [0u8; 16];

        w.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        let outcome = ep.read_items(&mut out, 4).unwrap();
        assert_eq!(outcome.items, 1);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(ep.carried(), 2);

        w.write_all(&[7]).unwrap();
        assert_eq!(ep.read_items(&mut out, 4).unwrap().items, 0);
        assert_eq!(ep.carried(), 3);

        w.write_all(&[8, 9]).unwrap();
        let outcome = ep.read_items(&mut out, 4).unwrap();
        assert_eq!(outcome.items, 1);
        assert_eq!(&out[..4], &[5, 6, 7, 8]);
        assert_eq!(ep.carried(), 1);
    }

    #[test]
    fn read_respects_requested_item_count() {
        let (mut ep, mut w) = reader(2);
        let mut out = [0u8; 32];

        w.write_all(&[0u8; 10]).unwrap();
        assert_eq!(ep.read_items(&mut out, 3).unwrap().items, 3);
        assert_eq!(ep.read_items(&mut out, 0).unwrap().items, 0);
        assert_eq!(ep.read_items(&mut out, 8).unwrap().items, 2);
    }

    #[test]
    fn eof_is_reported_distinctly() {
        let (mut ep, mut w) = reader(2);
        let mut out = [0u8; 8];

        w.write_all(&[1, 2, 3]).unwrap();
        drop(w);

        let outcome = ep.read_items(&mut out, 4).unwrap();
        assert_eq!(outcome, ReadOutcome { items: 1, eof: true });
        // truncated trailing item is dropped, not carried
        assert_eq!(ep.carried(), 0);
    }

    #[test]
    fn unbuffered_write_is_visible_immediately() {
        let (mut ep, mut r) = writer(2, true);
        set_nonblocking(&r);

        assert_eq!(ep.write_items(&[1, 2, 3, 4, 5, 6], 3).unwrap(), 3);
        assert_eq!(ep.staged(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn buffered_write_is_deferred_until_staging_fills() {
        let (mut ep, mut r) = writer(1, false);
        set_nonblocking(&r);

        assert_eq!(ep.write_items(&[9; 10], 10).unwrap(), 10);
        assert_eq!(ep.staged(), 10);
        let mut buf = [0u8; 16];
        assert_eq!(
            r.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        let fill = vec![7u8; WRITE_BUFFER_CAPACITY];
        let accepted = ep.write_items(&fill, fill.len()).unwrap();
        assert_eq!(accepted, WRITE_BUFFER_CAPACITY - 10);
        assert_eq!(ep.staged(), 0);
        assert_eq!(r.read(&mut buf).unwrap(), 16);
    }

    #[test]
    fn switching_to_unbuffered_flushes_staged_items_first() {
        let (mut ep, mut r) = writer(1, false);
        set_nonblocking(&r);

        ep.write_items(&[1, 2, 3], 3).unwrap();
        ep.set_unbuffered(true);
        assert_eq!(ep.write_items(&[4, 5], 2).unwrap(), 2);

        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn full_pipe_accepts_whole_items_and_carries_tail() {
        let (mut ep, mut r) = writer(3, true);
        set_nonblocking(&r);

        let chunk = vec![0xAB; 3 * 1024];
        let mut accepted_total = 0;
        loop {
            let n = ep.write_items(&chunk, 1024).unwrap();
            if n == 0 {
                break;
            }
            accepted_total += n;
        }
        assert!(accepted_total > 0);
        assert!(ep.staged() < 3);

        // pipe full: nothing more is accepted, and that is not an error
        assert_eq!(ep.write_items(&chunk, 1024).unwrap(), 0);

        let mut drained = 0;
        let mut buf = [0u8; 8192];
        loop {
            match r.read(&mut buf) {
                Ok(n) => drained += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if ep.staged() == 0 {
                        break;
                    }
                    ep.flush_staged().unwrap();
                }
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert_eq!(drained, accepted_total * 3);
    }

    #[test]
    fn write_to_closed_reader_is_a_transfer_error() {
        let (mut ep, r) = writer(1, true);
        drop(r);

        let err = ep.write_items(&[1, 2, 3], 3).unwrap_err();
        assert!(matches!(err, TransferError::Write(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn flush_then_close_delivers_staged_bytes() {
        let (mut ep, mut r) = writer(2, false);
        ep.write_items(&[1, 2, 3, 4], 2).unwrap();
        assert_eq!(ep.flush_staged().unwrap(), 4);
        assert_eq!(ep.close(), 0);

        let mut got = Vec::new();
        r.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn close_reports_undelivered_bytes() {
        let (mut ep, _r) = writer(1, false);
        ep.write_items(b"abc", 3).unwrap();
        assert_eq!(ep.close(), 3);
    }
}
