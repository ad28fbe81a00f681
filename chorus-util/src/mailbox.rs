//! MPSC command mailbox whose receive side is a pollable descriptor.
//!
//! Device workers suspend on a single poll set; queueing a command writes an
//! eventfd so the worker wakes without taking any lock the sender holds.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::mpsc::{self, Receiver, SendError, Sender, TryIter};
use std::sync::Arc;

use nix::sys::eventfd::{EfdFlags, EventFd};

pub fn channel<T>() -> nix::Result<(MailboxSender<T>, Mailbox<T>)> {
    let event = Arc::new(EventFd::from_value_and_flags(
        0,
        EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
    )?);
    let (tx, rx) = mpsc::channel();
    Ok((
        MailboxSender { tx, event: event.clone() },
        Mailbox { rx, event },
    ))
}

pub struct MailboxSender<T> {
    tx: Sender<T>,
    event: Arc<EventFd>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        MailboxSender {
            tx: self.tx.clone(),
            event: self.event.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.tx.send(msg)?;
        // wake the receiver; a dead receiver already failed the send above
        let _ = self.event.write(1);
        Ok(())
    }
}

pub struct Mailbox<T> {
    rx: Receiver<T>,
    event: Arc<EventFd>,
}

impl<T> Mailbox<T> {
    /// Descriptor to include in a poll set; readable while messages wait.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.event.as_fd()
    }

    /// Take every queued message in send order, clearing the wake counter.
    pub fn drain(&self) -> TryIter<'_, T> {
        let mut counter = [0u8; 8];
        let _ = nix::unistd::read(self.event.as_fd().as_raw_fd(), &mut counter);
        self.rx.try_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    #[test]
    fn send_wakes_poll_and_drains_in_order() {
        let (tx, rx) = channel().unwrap();
        tx.send(1u32).unwrap();
        tx.send(2).unwrap();

        let mut fds = [PollFd::new(rx.fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO).unwrap();
        assert_eq!(n, 1);

        let got: Vec<u32> = rx.drain().collect();
        assert_eq!(got, vec![1, 2]);

        // drained: fd no longer readable
        let mut fds = [PollFd::new(rx.fd(), PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = channel().unwrap();
        drop(rx);
        assert!(tx.send(1u32).is_err());
    }
}
