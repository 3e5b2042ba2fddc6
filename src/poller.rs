//! Thin adapter over the OS readiness primitive (epoll/kqueue via mio).
//!
//! The adapter registers raw fds, waits for a batch of readiness events, and
//! reports them with error/eof flags attached. It never interprets what an
//! event means; dispatch does that by switching on the owning poll's type.

use crate::types::Interest;
use mio::unix::SourceFd;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Token offset for UDP sockets to avoid collision with TCP sockets.
pub(crate) const UDP_TOKEN_OFFSET: usize = 1 << 30;
/// Token offset for internal callback polls (the async wake-up handle).
pub(crate) const CALLBACK_TOKEN_OFFSET: usize = 2 << 30;

pub(crate) fn tcp_token(index: usize) -> mio::Token {
    mio::Token(index)
}

pub(crate) fn udp_token(index: usize) -> mio::Token {
    mio::Token(index + UDP_TOKEN_OFFSET)
}

pub(crate) fn callback_token(index: usize) -> mio::Token {
    mio::Token(index + CALLBACK_TOKEN_OFFSET)
}

/// One readiness notification, decoupled from the poller's event storage.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    /// Hard error reported by the poller (EPOLLERR / EV_ERROR).
    pub error: bool,
    /// Peer closed its write side (reported alongside readability).
    pub eof: bool,
}

pub(crate) struct Poller {
    poll: mio::Poll,
    events: mio::Events,
}

impl Poller {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(event_capacity),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn register(&self, fd: RawFd, token: mio::Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, to_mio(interest))
    }

    /// Re-state interest for an already registered fd.
    ///
    /// Also used to re-arm a fd we deliberately stopped reading while data
    /// was still buffered: the modify re-queues a readiness event for it.
    pub fn reregister(&self, fd: RawFd, token: mio::Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token, to_mio(interest))
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until readiness or `timeout`, then return the ready batch.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<PollEvent>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .events
            .iter()
            .map(|e| PollEvent {
                token: e.token().0,
                readable: e.is_readable(),
                writable: e.is_writable(),
                error: e.is_error(),
                eof: e.is_read_closed(),
            })
            .collect())
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (
        interest.contains(Interest::READABLE),
        interest.contains(Interest::WRITABLE),
    ) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        // Callers deregister instead of registering an empty mask.
        (false, false) => unreachable!("empty interest mask"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_no_events() {
        let mut poller = Poller::new(64).unwrap();
        let events = poller.wait(Some(Duration::from_millis(5))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_token_spaces_disjoint() {
        assert_ne!(tcp_token(1), udp_token(1));
        assert_ne!(udp_token(1), callback_token(1));
        assert!(udp_token(0).0 >= UDP_TOKEN_OFFSET);
        assert!(callback_token(0).0 >= CALLBACK_TOKEN_OFFSET);
    }

    #[test]
    fn test_register_listener_and_accept_event() {
        use crate::net;
        use crate::types::SocketOptions;

        let addr = "127.0.0.1:0".parse().unwrap();
        let fd = net::create_listen_fd(addr, SocketOptions::default(), 16).unwrap();
        let mut poller = Poller::new(64).unwrap();
        poller.register(fd, tcp_token(3), Interest::READABLE).unwrap();

        let bound = net::local_addr(fd).unwrap();
        let _client = std::net::TcpStream::connect(bound).unwrap();

        let events = poller.wait(Some(Duration::from_millis(500))).unwrap();
        assert!(events.iter().any(|e| e.token == 3 && e.readable));

        poller.deregister(fd).unwrap();
        net::close_fd(fd);
    }
}
