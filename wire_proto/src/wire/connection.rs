// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use log::{trace, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::uio::{IoSlice, IoSliceMut};

use crate::error::Error;
use crate::wire::buffer::{Buffer, FD_RING_CAPACITY};

/// Which directions a caller wants `Connection::drain` to service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };

    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };

    pub const fn both() -> Self {
        Self {
            readable: true,
            writable: true,
        }
    }
}

/// The state machine a connection moves through: `open` accepts reads/writes, `draining` means
/// the peer half-closed and buffered data is being emptied, `dead` rejects all operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Draining,
    Closing,
    Dead,
}

/// Outcome of attempting to queue a message for transmission.
pub enum SendOutcome {
    /// The message (and any descriptors) were fully queued, and possibly already flushed.
    Queued,
    /// The outbound ring could not hold the message even after a non-blocking flush attempt;
    /// writable interest should be (re-)signaled to the caller's event loop. The descriptors the
    /// caller passed in are handed back unconsumed, since nothing was queued for them to travel
    /// alongside.
    WouldBlock(Vec<OwnedFd>),
}

/// Owns one stream socket, both wire buffers, and reports interest changes upward so the endpoint
/// can re-register its poll interest with the (external) event loop.
pub struct Connection {
    stream: UnixStream,
    pub inbound: Buffer,
    pub outbound: Buffer,
    state: ConnState,
    interest: Interest,
    on_interest_change: Option<Box<dyn FnMut(Interest)>>,
}

impl Connection {
    pub fn new(stream: UnixStream) -> Result<Self, Error> {
        set_nonblocking(&stream)?;

        Ok(Self {
            stream,
            inbound: Buffer::new(),
            outbound: Buffer::new(),
            state: ConnState::Open,
            interest: Interest::READABLE,
            on_interest_change: None,
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_dead(&self) -> bool {
        self.state == ConnState::Dead
    }

    /// The underlying descriptor, for registering with an external event loop (`nix::poll`, etc).
    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_fd().as_raw_fd()
    }

    pub fn set_interest_callback(&mut self, cb: impl FnMut(Interest) + 'static) {
        self.on_interest_change = Some(Box::new(cb));
    }

    fn set_interest(&mut self, interest: Interest) {
        if interest != self.interest {
            self.interest = interest;
            if let Some(cb) = self.on_interest_change.as_mut() {
                cb(interest);
            }
        }
    }

    /// Perform one non-blocking read and/or one non-blocking write, depending on `mask`. Returns
    /// the number of bytes now buffered on the inbound side. Partial I/O is normal and is not an
    /// error.
    pub fn drain(&mut self, mask: Interest) -> Result<usize, Error> {
        if self.state == ConnState::Dead {
            return Err(Error::Protocol(crate::error::ProtocolError::Fatal));
        }

        if mask.readable {
            self.drain_read()?;
        }
        if mask.writable {
            self.drain_write()?;
        }

        // Once the peer has half-closed and there is nothing left of ours queued to send, there
        // is nothing left for this connection to do: advance past `Closing` straight to `Dead`
        // within the same call, since the owning endpoint only ever observes state at drain-call
        // granularity.
        if self.state == ConnState::Draining
            && self.outbound.bytes.is_empty()
            && self.outbound.fds.is_empty()
        {
            self.state = ConnState::Closing;
        }
        if self.state == ConnState::Closing {
            self.state = ConnState::Dead;
        }

        Ok(self.inbound.bytes.len())
    }

    fn drain_read(&mut self) -> Result<(), Error> {
        let mut scratch = [0u8; 4096];
        let mut cmsg_buffer = nix::cmsg_space!([std::os::fd::RawFd; FD_RING_CAPACITY]);

        loop {
            let mut iov = [IoSliceMut::new(&mut scratch)];
            let result = recvmsg::<UnixAddr>(
                self.stream.as_fd().as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::empty(),
            );

            let msg = match result {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.fail();
                    return Err(Error::from(e));
                }
            };

            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    for raw in fds {
                        // SAFETY: `raw` was just received as ownership-transferring ancillary
                        // data from the kernel; it is not otherwise owned.
                        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                        self.inbound.fds.push_fd(fd);
                    }
                }
            }

            let n = msg.bytes;
            if n == 0 {
                trace!("peer half-closed the connection");
                self.state = ConnState::Draining;
                return Ok(());
            }

            let written = self.inbound.bytes.write(&scratch[..n]);
            if written < n {
                warn!(
                    "inbound ring full; {} bytes left on the socket, pausing reads",
                    n - written
                );
                self.set_interest(Interest {
                    readable: false,
                    writable: self.interest.writable,
                });
                return Ok(());
            }

            if n < scratch.len() {
                return Ok(());
            }
        }
    }

    fn drain_write(&mut self) -> Result<(), Error> {
        loop {
            let len = self.outbound.bytes.len();
            if len == 0 {
                self.set_interest(Interest {
                    readable: self.interest.readable,
                    writable: false,
                });
                return Ok(());
            }

            let chunk = self.outbound.bytes.copy(len).expect("len was just read");
            let iov = [IoSlice::new(&chunk)];

            let fds: Vec<OwnedFd> = std::iter::from_fn(|| self.outbound.fds.pop_fd())
                .collect();
            let raw_fds: Vec<std::os::fd::RawFd> = fds.iter().map(|f| f.as_raw_fd()).collect();
            let cmsgs = if raw_fds.is_empty() {
                Vec::new()
            } else {
                vec![ControlMessage::ScmRights(&raw_fds)]
            };

            let result = sendmsg::<UnixAddr>(
                self.stream.as_fd().as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None,
            );

            match result {
                Ok(n) => {
                    self.outbound.bytes.consume(n);
                    // Descriptors were handed to the kernel with this write; any we couldn't
                    // fit go back to the front of the queue for the next attempt.
                    if n < chunk.len() {
                        for fd in fds.into_iter().rev() {
                            self.outbound.fds.push_fd(fd);
                        }
                        self.set_interest(Interest {
                            readable: self.interest.readable,
                            writable: true,
                        });
                        return Ok(());
                    }
                }
                Err(Errno::EAGAIN) => {
                    for fd in fds.into_iter().rev() {
                        self.outbound.fds.push_fd(fd);
                    }
                    self.set_interest(Interest {
                        readable: self.interest.readable,
                        writable: true,
                    });
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.fail();
                    return Err(Error::from(e));
                }
            }
        }
    }

    /// Append a full message (and its descriptors) to the outbound ring. Attempts a non-blocking
    /// flush first if the ring cannot hold it outright.
    pub fn send(&mut self, bytes: &[u8], fds: Vec<OwnedFd>) -> Result<SendOutcome, Error> {
        if self.state == ConnState::Dead {
            return Err(Error::Protocol(crate::error::ProtocolError::Fatal));
        }

        if bytes.len() > self.outbound.bytes.free_space() {
            self.drain_write()?;
        }

        if bytes.len() > self.outbound.bytes.free_space() {
            self.set_interest(Interest {
                readable: self.interest.readable,
                writable: true,
            });
            return Ok(SendOutcome::WouldBlock(fds));
        }

        let written = self.outbound.bytes.write(bytes);
        debug_assert_eq!(written, bytes.len());
        for fd in fds {
            self.outbound.fds.push_fd(fd);
        }

        self.drain_write()?;

        Ok(SendOutcome::Queued)
    }

    fn fail(&mut self) {
        self.state = ConnState::Dead;
    }
}

fn set_nonblocking(stream: &UnixStream) -> Result<(), Error> {
    let raw = stream.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(Error::from)?;
    Ok(())
}
