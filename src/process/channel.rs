//! One-byte synchronisation pipes between the spawn participants.
//!
//! Every fd is held in a guard so an early error on any branch cannot
//! leak descriptors across `exec`; the handshake itself still closes each
//! end explicitly at the protocol point where EOF becomes meaningful for
//! the peer.

use std::os::unix::io::RawFd;

use nix::unistd::{self, Pid};

use crate::error::{Error, Result};

/// The sentinel byte written across sync pipes.
pub const SYNC_BYTE: u8 = 0x06;

/// A close-on-drop file descriptor. Closing explicitly disarms the guard.
#[derive(Debug)]
pub struct Fd(Option<RawFd>);

impl Fd {
    pub fn new(fd: RawFd) -> Self {
        Fd(Some(fd))
    }

    fn raw(&self) -> Result<RawFd> {
        self.0.ok_or(Error::SpawnSync)
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(fd) = self.0.take() {
            unistd::close(fd)?;
        }
        Ok(())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Some(fd) = self.0.take() {
            let _ = unistd::close(fd);
        }
    }
}

/// A pipe used for the spawn handshake. After a fork each process closes
/// the end it does not use, so a peer dying early surfaces as EOF instead
/// of a hang.
#[derive(Debug)]
pub struct SyncPipe {
    read: Fd,
    write: Fd,
}

impl SyncPipe {
    pub fn new() -> Result<Self> {
        let (read, write) = unistd::pipe()?;
        Ok(SyncPipe {
            read: Fd::new(read),
            write: Fd::new(write),
        })
    }

    pub fn close_read(&mut self) -> Result<()> {
        self.read.close()
    }

    pub fn close_write(&mut self) -> Result<()> {
        self.write.close()
    }

    /// Write the sentinel byte to release the peer.
    pub fn send_sync(&mut self) -> Result<()> {
        let n = unistd::write(self.write.raw()?, &[SYNC_BYTE])?;
        if n != 1 {
            return Err(Error::SpawnSync);
        }
        Ok(())
    }

    /// Block until the peer writes the sentinel byte. EOF or any other
    /// byte means the peer failed.
    pub fn wait_sync(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        let n = unistd::read(self.read.raw()?, &mut buf)?;
        if n != 1 || buf[0] != SYNC_BYTE {
            return Err(Error::SpawnSync);
        }
        Ok(())
    }

    /// Write a pid in ASCII, the way it travels from the intermediate
    /// process to the parent.
    pub fn send_pid(&mut self, pid: Pid) -> Result<()> {
        let ascii = pid.to_string();
        let n = unistd::write(self.write.raw()?, ascii.as_bytes())?;
        if n != ascii.len() {
            return Err(Error::SpawnSync);
        }
        Ok(())
    }

    /// Read an ASCII pid. The writer closes its end right after writing,
    /// so a single short read cannot split the number.
    pub fn wait_pid(&mut self) -> Result<Pid> {
        let mut buf = [0u8; 64];
        let n = unistd::read(self.read.raw()?, &mut buf)?;
        if n == 0 {
            return Err(Error::SpawnSync);
        }
        let text = std::str::from_utf8(&buf[..n]).map_err(|_| Error::SpawnSync)?;
        let pid: libc::pid_t = text.trim().parse().map_err(|_| Error::SpawnSync)?;
        Ok(Pid::from_raw(pid))
    }
}
