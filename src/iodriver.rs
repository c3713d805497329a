//! I/O driver interface: server-side file access on a disk node.
//!
//! The driver admits a request only when the `token` query parameter
//! verifies against the physical file name, the client identity and the
//! requested mode; the [`OpenFlags::INSECURE`] bit bypasses that for
//! trusted local administrative paths.

use bitflags::bitflags;

use std::sync::Arc;

use crate::errors::DmResult;
use crate::extensible::Extensible;
use crate::security::SecurityContext;

bitflags! {
    /// Open flags, POSIX semantics plus the token bypass bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const WRONLY = 0o1;
        /// Open for reading and writing.
        const RDWR = 0o2;
        /// Bypass token validation (trusted local paths only).
        const INSECURE = 0o10;
        /// Create the file when absent.
        const CREAT = 0o100;
        /// Truncate on open.
        const TRUNC = 0o1000;
        /// Append on every write.
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    /// True when the flags ask for write access of any kind.
    pub fn wants_write(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
            || self.intersects(OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::APPEND)
    }
}

/// Seek reference point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    /// From the beginning of the file.
    Set,
    /// From the current position.
    Cur,
    /// From the end of the file.
    End,
}

/// What `fstat` reports about an open physical file. Size is always
/// populated; times are best effort.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStat {
    /// File size in bytes.
    pub size: u64,
    /// Last access time (unix seconds, 0 when unknown).
    pub atime: i64,
    /// Last modification time (unix seconds, 0 when unknown).
    pub mtime: i64,
}

/// An open file on the disk node.
pub trait IoHandler: Send + std::fmt::Debug {
    /// Read from the current position.
    fn read(&mut self, buffer: &mut [u8]) -> DmResult<usize>;

    /// Write at the current position.
    fn write(&mut self, buffer: &[u8]) -> DmResult<usize>;

    /// Read into multiple buffers. The default loops over [`read`].
    ///
    /// [`read`]: IoHandler::read
    fn read_vectored(&mut self, buffers: &mut [&mut [u8]]) -> DmResult<usize> {
        let mut total = 0;
        for buf in buffers {
            let n = self.read(buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Write from multiple buffers. The default loops over [`write`].
    ///
    /// [`write`]: IoHandler::write
    fn write_vectored(&mut self, buffers: &[&[u8]]) -> DmResult<usize> {
        let mut total = 0;
        for buf in buffers {
            let n = self.write(buf)?;
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Positioned read; does not move the cursor.
    fn pread(&mut self, buffer: &mut [u8], offset: u64) -> DmResult<usize>;

    /// Positioned write; does not move the cursor.
    fn pwrite(&mut self, buffer: &[u8], offset: u64) -> DmResult<usize>;

    /// Move the cursor, returning the new absolute position.
    fn seek(&mut self, offset: i64, whence: Whence) -> DmResult<u64>;

    /// The current cursor position.
    fn tell(&mut self) -> DmResult<u64>;

    /// True once a read hit the end of the file.
    fn eof(&mut self) -> bool;

    /// Stat the open file.
    fn fstat(&mut self) -> DmResult<IoStat>;

    /// Flush buffered writes.
    fn flush(&mut self) -> DmResult<()>;

    /// Close the handle. Further calls fail.
    fn close(&mut self) -> DmResult<()>;
}

/// Factory for I/O handlers plus the front-end write completion.
pub trait IoDriver: Send {
    /// Adopt the security context all subsequent calls run under.
    fn set_security_context(&mut self, context: Option<Arc<SecurityContext>>);

    /// Open `pfn`. Unless [`OpenFlags::INSECURE`] is set, `extras` must
    /// carry a `token` valid for this pfn, client and mode. `mode` is used
    /// when creating the file.
    fn create_io_handler(
        &mut self,
        pfn: &str,
        flags: OpenFlags,
        extras: &Extensible,
        mode: u32,
    ) -> DmResult<Box<dyn IoHandler>>;

    /// Stat a physical file without opening it.
    fn pfn_stat(&mut self, pfn: &str) -> DmResult<IoStat>;

    /// Front-end write completion: forwards to the pool manager's
    /// `done_writing` with this node as the host.
    fn done_writing(&mut self, pfn: &str, params: &Extensible) -> DmResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_write() {
        assert!(!OpenFlags::empty().wants_write());
        assert!(!OpenFlags::INSECURE.wants_write());
        assert!(OpenFlags::WRONLY.wants_write());
        assert!(OpenFlags::RDWR.wants_write());
        assert!((OpenFlags::CREAT | OpenFlags::TRUNC).wants_write());
    }
}
