//! UDP sockets: batched receive, drain notification after a blocked send.

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::net::{self, Datagram};
use crate::poller::udp_token;
use crate::types::{Interest, UdpId};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::debug;

/// Callback table for a UDP socket.
pub trait UdpEvents {
    /// A batch of datagrams arrived. The batch borrows the loop's receive
    /// scratch buffer; copy payloads if you need retention.
    fn on_data(&self, _lp: &mut EventLoop, _u: UdpId, _batch: &UdpBatch<'_>) {}

    /// The socket became writable again after a blocked send. Delivered
    /// once per blocked send, not on every iteration.
    fn on_drain(&self, _lp: &mut EventLoop, _u: UdpId) {}
}

/// A received batch of datagrams, borrowed from the receive scratch buffer.
pub struct UdpBatch<'a> {
    pub(crate) buf: &'a [u8],
    pub(crate) datagrams: &'a [Datagram],
}

impl UdpBatch<'_> {
    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Payload bytes of datagram `i`.
    pub fn payload(&self, i: usize) -> &[u8] {
        let d = &self.datagrams[i];
        &self.buf[d.offset..d.offset + d.len]
    }

    /// Source address of datagram `i`.
    pub fn peer(&self, i: usize) -> SocketAddr {
        self.datagrams[i].peer
    }
}

pub(crate) struct UdpSocket {
    pub generation: u32,
    pub fd: RawFd,
    pub interest: Interest,
    pub registered: bool,
    pub events: Rc<dyn UdpEvents>,
    pub closed: bool,
    pub next_closed: Option<UdpId>,
}

impl EventLoop {
    /// Bind a UDP socket and start polling it for readability.
    pub fn udp_create(
        &mut self,
        host: &str,
        port: u16,
        events: Rc<dyn UdpEvents>,
    ) -> Result<UdpId> {
        let addr = crate::context::resolve_one(host, port)?;
        let fd = net::create_udp_fd(addr)?;

        let generation = self.next_generation();
        let entry = self.udp_sockets.vacant_entry();
        let uid = UdpId::new(entry.key(), generation);
        entry.insert(UdpSocket {
            generation,
            fd,
            interest: Interest::READABLE,
            registered: false,
            events,
            closed: false,
            next_closed: None,
        });

        if let Err(e) = self
            .poller
            .register(fd, udp_token(uid.index()), Interest::READABLE)
        {
            self.udp_sockets.remove(uid.index());
            net::close_fd(fd);
            return Err(Error::Io(e));
        }
        if let Some(udp) = self.udp_mut(uid) {
            udp.registered = true;
        }
        self.keep_handle();
        debug!(udp = uid.index(), %addr, "udp socket bound");
        Ok(uid)
    }

    /// Send datagrams until one would block. Returns how many were sent;
    /// on a block the socket polls for writability and `on_drain` fires
    /// when it clears.
    pub fn udp_send(&mut self, u: UdpId, packets: &[(&[u8], SocketAddr)]) -> usize {
        let Some(udp) = self.udp_ref(u) else {
            return 0;
        };
        if udp.closed {
            return 0;
        }
        let fd = udp.fd;
        let interest = udp.interest;

        let mut sent = 0;
        for (payload, peer) in packets {
            match net::send_to(fd, payload, *peer) {
                Ok(_) => sent += 1,
                Err(e) if net::would_block(&e) => {
                    self.udp_poll_change(u, interest | Interest::WRITABLE);
                    break;
                }
                Err(e) => {
                    debug!(udp = u.index(), "udp send failed: {e}");
                    break;
                }
            }
        }
        sent
    }

    /// Close a UDP socket; its slot is reclaimed at the next post-hook.
    pub fn udp_close(&mut self, u: UdpId) {
        let head = self.closed_udp_head;
        let Some(udp) = self.udp_mut(u) else {
            return;
        };
        if udp.closed {
            return;
        }
        udp.closed = true;
        udp.next_closed = head;
        let fd = udp.fd;
        let registered = udp.registered;
        udp.registered = false;
        if registered {
            let _ = self.poller.deregister(fd);
        }
        net::close_fd(fd);
        self.closed_udp_head = Some(u);
        self.release_handle();
    }

    pub fn udp_local_addr(&self, u: UdpId) -> Option<SocketAddr> {
        let udp = self.udp_ref(u)?;
        if udp.closed {
            return None;
        }
        net::local_addr(udp.fd).ok()
    }

    pub(crate) fn udp_poll_change(&mut self, u: UdpId, interest: Interest) {
        let Some(udp) = self.udp_ref(u) else {
            return;
        };
        if udp.closed {
            return;
        }
        let fd = udp.fd;
        let was_registered = udp.registered;
        let token = udp_token(u.index());

        let result = match (was_registered, interest.is_empty()) {
            (true, true) => self.poller.deregister(fd),
            (true, false) => self.poller.reregister(fd, token, interest),
            (false, false) => self.poller.register(fd, token, interest),
            (false, true) => Ok(()),
        };
        if result.is_ok()
            && let Some(udp) = self.udp_mut(u)
        {
            udp.interest = interest;
            udp.registered = !interest.is_empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::event_loop::Hooks;

    struct Noop;
    impl UdpEvents for Noop {}

    #[test]
    fn test_udp_create_and_close() {
        let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap();
        let u = lp.udp_create("127.0.0.1", 0, Rc::new(Noop)).unwrap();
        let addr = lp.udp_local_addr(u).unwrap();
        assert_ne!(addr.port(), 0);

        lp.udp_close(u);
        assert!(lp.udp_local_addr(u).is_none());
        // Second close is a no-op.
        lp.udp_close(u);
    }

    #[test]
    fn test_udp_send_counts_packets() {
        let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap();
        let a = lp.udp_create("127.0.0.1", 0, Rc::new(Noop)).unwrap();
        let b = lp.udp_create("127.0.0.1", 0, Rc::new(Noop)).unwrap();
        let dest = lp.udp_local_addr(b).unwrap();

        let sent = lp.udp_send(a, &[(b"one".as_slice(), dest), (b"two".as_slice(), dest)]);
        assert_eq!(sent, 2);

        lp.udp_close(a);
        lp.udp_close(b);
    }

    #[test]
    fn test_udp_batch_views() {
        let buf = b"aaaabbbb".to_vec();
        let datagrams = vec![
            Datagram {
                offset: 0,
                len: 4,
                peer: "127.0.0.1:1000".parse().unwrap(),
            },
            Datagram {
                offset: 4,
                len: 2,
                peer: "127.0.0.1:2000".parse().unwrap(),
            },
        ];
        let batch = UdpBatch {
            buf: &buf,
            datagrams: &datagrams,
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.payload(0), b"aaaa");
        assert_eq!(batch.payload(1), b"bb");
        assert_eq!(batch.peer(1).port(), 2000);
    }
}
