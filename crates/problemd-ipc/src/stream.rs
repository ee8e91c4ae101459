//! Line framing over a Unix stream with descriptors attached
//!
//! Every message is one line of JSON. Descriptors are sent as `SCM_RIGHTS`
//! ancillary data together with the first bytes of the line and queued on
//! the receiving side until the decoded message claims them by count.

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, getsockopt, recvmsg, sendmsg, sockopt,
};
use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::warn;

use crate::{IpcError, IpcResult};

/// Most descriptors the kernel passes in one message (SCM_MAX_FD)
pub const MAX_FDS_PER_MESSAGE: usize = 253;

const READ_CHUNK: usize = 64 * 1024;

/// Credentials of the process on the other end of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub pid: i32,
}

/// Get peer credentials from a Unix socket
pub fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    match getsockopt(stream, sockopt::PeerCredentials) {
        Ok(cred) => Some(PeerCredentials {
            uid: cred.uid(),
            pid: cred.pid(),
        }),
        Err(e) => {
            warn!(error = %e, "Failed to get peer credentials");
            None
        }
    }
}

/// Split a stream into its reading and writing ends
///
/// Lines longer than `max_line` bytes are rejected.
pub fn split(stream: UnixStream, max_line: usize) -> (MessageReader, MessageWriter) {
    let stream = Arc::new(stream);
    (
        MessageReader {
            stream: Arc::clone(&stream),
            buf: Vec::new(),
            fds: VecDeque::new(),
            max_line,
        },
        MessageWriter { stream },
    )
}

/// Reading end: yields lines and queues received descriptors
pub struct MessageReader {
    stream: Arc<UnixStream>,
    buf: Vec<u8>,
    fds: VecDeque<OwnedFd>,
    max_line: usize,
}

impl MessageReader {
    /// Next line without its newline, `None` on a clean end of stream
    pub async fn next_line(&mut self) -> IpcResult<Option<String>> {
        loop {
            let end = self.buf.iter().position(|&b| b == b'\n');
            if end.unwrap_or(self.buf.len()) > self.max_line {
                return Err(IpcError::InvalidMessage(format!(
                    "Message exceeds {} bytes",
                    self.max_line
                )));
            }

            if let Some(pos) = end {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| IpcError::InvalidMessage("Message is not valid UTF-8".into()));
            }

            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(IpcError::ConnectionClosed)
                };
            }
        }
    }

    /// Take the first `count` queued descriptors
    pub fn take_fds(&mut self, count: u32) -> IpcResult<Vec<OwnedFd>> {
        let count = count as usize;
        if count > self.fds.len() {
            return Err(IpcError::InvalidMessage(format!(
                "Expected {} file descriptors, received {}",
                count,
                self.fds.len()
            )));
        }
        Ok(self.fds.drain(..count).collect())
    }

    /// Number of received descriptors nobody claimed yet
    pub fn queued_fds(&self) -> usize {
        self.fds.len()
    }

    /// Close every queued descriptor, returning how many there were
    pub fn discard_fds(&mut self) -> usize {
        let count = self.fds.len();
        self.fds.clear();
        count
    }

    async fn fill(&mut self) -> IpcResult<usize> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let fd = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_with_fds(fd, &mut chunk))
            {
                Ok((n, fds)) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.fds.extend(fds);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Writing end
pub struct MessageWriter {
    stream: Arc<UnixStream>,
}

impl MessageWriter {
    /// Send `line` plus a newline with `fds` attached
    pub async fn send_line(&self, line: &str, fds: &[OwnedFd]) -> IpcResult<()> {
        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(IpcError::InvalidMessage(format!(
                "Cannot send {} file descriptors in one message",
                fds.len()
            )));
        }

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let fd = self.stream.as_raw_fd();
        let mut sent = 0;
        while sent < data.len() {
            // Descriptors go out with the first chunk only
            let attach: &[RawFd] = if sent == 0 { &raw } else { &[] };
            self.stream.writable().await?;
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_with_fds(fd, &data[sent..], attach))
            {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: the kernel installed these descriptors for this process
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!(received = fds.len(), "Ancillary data truncated, file descriptors lost");
    }
    Ok((msg.bytes, fds))
}

fn send_with_fds(fd: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    Ok(sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)?)
}
