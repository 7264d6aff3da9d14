//! Raw `PF_ROUTE` socket (Darwin only)

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

/// Blocking routing socket. Closed on drop.
pub struct RoutingSocket {
    file: File,
}

impl RoutingSocket {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain syscall, the returned descriptor is checked below.
        let fd = unsafe { libc::socket(libc::PF_ROUTE, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` is a freshly opened descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            file: File::from(fd),
        })
    }

    pub fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let written = self.file.write(msg)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "routing socket accepted no bytes",
            ));
        }
        Ok(())
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.file.read(buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "routing socket closed",
            ));
        }
        Ok(read)
    }
}
