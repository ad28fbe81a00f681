//! Control-socket transport: a listening unix socket, length-prefixed
//! message framing, and SCM_RIGHTS descriptor passing for shared rings and
//! data-plane sockets.

use std::fs;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use thiserror::Error;

use chorus_protocol::msg;
use chorus_protocol::MAX_CTL_MSG_SIZE;

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("creating socket directory {0}: {1}")]
    CreateDir(PathBuf, io::Error),
    #[error("removing stale socket {0}: {1}")]
    RemoveStale(PathBuf, io::Error),
    #[error("binding {0}: {1}")]
    Bind(PathBuf, io::Error),
}

/// Bind the server's listening socket. This is the only startup step that
/// is allowed to be fatal.
pub fn listen(path: &Path) -> Result<UnixListener, ListenError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|e| ListenError::CreateDir(dir.to_owned(), e))?;
        }
    }

    if path.exists() {
        fs::remove_file(path).map_err(|e| ListenError::RemoveStale(path.to_owned(), e))?;
    }

    let listener = UnixListener::bind(path).map_err(|e| ListenError::Bind(path.to_owned(), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ListenError::Bind(path.to_owned(), e))?;

    log::info!("listening on {}", path.display());
    Ok(listener)
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Send one framed message, carrying `fds` as ancillary rights.
pub fn send_with_fds(sock: &UnixStream, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let iov = [IoSlice::new(bytes)];
    let rights;
    let cmsgs: &[ControlMessage] = if fds.is_empty() {
        &[]
    } else {
        rights = [ControlMessage::ScmRights(fds)];
        &rights
    };

    let sent = sendmsg(
        sock.as_raw_fd(),
        &iov,
        cmsgs,
        MsgFlags::empty(),
        None::<&UnixAddr>,
    )
    .map_err(nix_to_io)?;

    if sent != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write on control socket",
        ));
    }
    Ok(())
}

pub fn send_msg(sock: &UnixStream, bytes: &[u8]) -> io::Result<()> {
    send_with_fds(sock, bytes, &[])
}

/// Nonblocking read of whatever is available, collecting any passed
/// descriptors. Returns `Ok((0, _))` on a closed peer.
pub fn recv_with_fds(sock: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);

    let received = recvmsg::<UnixAddr>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(nix_to_io)?;

    let mut fds = Vec::new();
    for cmsg in received.cmsgs().map_err(nix_to_io)? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    Ok((received.bytes, fds))
}

/// Accumulates control-socket bytes and cuts them into whole frames.
pub struct MsgReader {
    buf: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length outside protocol bounds")]
    BadLength,
}

impl MsgReader {
    pub fn new() -> MsgReader {
        MsgReader { buf: Vec::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has accumulated.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < msg::HEADER_SIZE {
            return Ok(None);
        }
        let length = msg::frame_length(&self.buf).ok_or(FrameError::BadLength)?;
        if length > MAX_CTL_MSG_SIZE {
            return Err(FrameError::BadLength);
        }
        if self.buf.len() < length {
            return Ok(None);
        }
        let rest = self.buf.split_off(length);
        let frame = std::mem::replace(&mut self.buf, rest);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_protocol::msg::{as_bytes, DisconnectMsg};
    use chorus_protocol::types::StreamId;
    use std::io::Read;

    #[test]
    fn fd_passing_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let region = chorus_core::shm::ShmRegion::anonymous("chorus-sock-test", 4096).unwrap();

        send_with_fds(&a, b"hello", &[region.fd().as_raw_fd()]).unwrap();

        let mut buf = [0u8; 16];
        let (n, fds) = recv_with_fds(&b, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fds.len(), 1);

        // the received descriptor maps the same region
        let peer = chorus_core::shm::ShmRegion::from_fd(fds.into_iter().next().unwrap(), 4096).unwrap();
        unsafe {
            region.as_ptr().write(0x5a);
            assert_eq!(peer.as_ptr().read(), 0x5a);
        }
    }

    #[test]
    fn reader_reassembles_split_frames() {
        let msg = DisconnectMsg::new(StreamId(3));
        let bytes = as_bytes(&msg);

        let mut reader = MsgReader::new();
        reader.push(&bytes[..5]);
        assert_eq!(reader.next_frame().unwrap(), None);
        reader.push(&bytes[5..]);
        assert_eq!(reader.next_frame().unwrap().as_deref(), Some(bytes));
        assert_eq!(reader.next_frame().unwrap(), None);
    }

    #[test]
    fn reader_rejects_absurd_length() {
        let mut reader = MsgReader::new();
        reader.push(&u32::MAX.to_le_bytes());
        reader.push(&0u32.to_le_bytes());
        assert_eq!(reader.next_frame(), Err(FrameError::BadLength));
    }

    #[test]
    fn plain_send_is_visible_to_std_reads() {
        let (a, mut b) = UnixStream::pair().unwrap();
        send_msg(&a, b"abc").unwrap();
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
