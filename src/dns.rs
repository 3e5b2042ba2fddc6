//! Outbound connects and the cross-thread DNS completion hand-off.
//!
//! `connect()` creates a connecting socket. Numeric hosts resolve on the
//! loop thread; hostnames go to a resolver worker which completes them via
//! [`LoopHandle::dns_callback_threadsafe`], pushing onto the mutex-guarded
//! ready list and waking the loop. The list is drained at both pre- and
//! post-hook: results arriving just before a poll-wait complete before the
//! wait, results arriving during dispatch complete at post-hook.

use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::net;
use crate::types::{ConnectingId, ContextId, Interest, PollType, SocketId, SocketOptions};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use tracing::{debug, trace};

/// Pre-connect entity holding resolver state and the current attempt.
pub(crate) struct ConnectingSocket {
    pub generation: u32,
    pub context: ContextId,
    pub port: u16,
    pub source: Option<SocketAddr>,
    pub options: SocketOptions,
    /// Addresses still to try, in resolver order.
    pub addrs: VecDeque<SocketAddr>,
    /// The in-flight semi-socket, if an attempt is underway.
    pub attempt: Option<SocketId>,
    pub last_error: Option<io::Error>,
    pub closed: bool,
    pub next_closed: Option<ConnectingId>,
}

pub(crate) struct ResolveJob {
    pub id: ConnectingId,
    pub host: String,
    pub port: u16,
    pub handle: LoopHandle,
}

/// One background worker performing blocking `getaddrinfo` lookups.
///
/// Results come back through the thread-safe DNS callback; the worker never
/// touches loop state. The worker exits when the loop (and its sender) is
/// dropped.
pub(crate) struct Resolver {
    tx: mpsc::Sender<ResolveJob>,
}

impl Resolver {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<ResolveJob>();
        std::thread::Builder::new()
            .name("sockloop-resolver".into())
            .spawn(move || {
                for job in rx.iter() {
                    let result = (job.host.as_str(), job.port)
                        .to_socket_addrs()
                        .map(|addrs| addrs.collect::<Vec<_>>());
                    trace!(host = %job.host, ok = result.is_ok(), "resolved");
                    job.handle.dns_callback_threadsafe(job.id, result);
                }
            })
            .expect("failed to spawn resolver thread");
        Self { tx }
    }

    pub fn enqueue(&self, job: ResolveJob) {
        // The receiver lives as long as the loop; a send can only fail
        // during teardown, where dropping the job is fine.
        let _ = self.tx.send(job);
    }
}

impl EventLoop {
    /// Start an outbound connection.
    ///
    /// Success surfaces as `on_open(s, is_client = true, ..)` with a fresh
    /// socket; failure (after all resolved addresses are exhausted) as
    /// `on_connect_error`. The returned id identifies the pending connect
    /// in both callbacks and in [`EventLoop::connect_abort`].
    pub fn connect(
        &mut self,
        ctx: ContextId,
        host: &str,
        port: u16,
        source: Option<SocketAddr>,
        options: SocketOptions,
    ) -> Result<ConnectingId> {
        let context = self.context(ctx).ok_or(Error::UnknownContext)?;
        if context.is_closed {
            return Err(Error::ContextClosed);
        }

        let generation = self.next_generation();
        let entry = self.connecting.vacant_entry();
        let cid = ConnectingId::new(entry.key(), generation);
        entry.insert(ConnectingSocket {
            generation,
            context: ctx,
            port,
            source,
            options,
            addrs: VecDeque::new(),
            attempt: None,
            last_error: None,
            closed: false,
            next_closed: None,
        });
        self.keep_handle();

        if let Ok(ip) = host.parse::<IpAddr>() {
            // Numeric host: no resolver round-trip, connect right away.
            socket_after_resolve(self, cid, Ok(vec![SocketAddr::new(ip, port)]));
        } else {
            let handle = self.handle();
            let job = ResolveJob {
                id: cid,
                host: host.to_string(),
                port,
                handle,
            };
            self.resolver.get_or_insert_with(Resolver::spawn).enqueue(job);
        }
        Ok(cid)
    }

    /// Cancel a pending connect without surfacing any callback.
    pub fn connect_abort(&mut self, c: ConnectingId) {
        let Some(connecting) = self.connecting_mut(c) else {
            return;
        };
        if connecting.closed {
            return;
        }
        if let Some(sid) = connecting.attempt.take() {
            self.discard_socket(sid);
        }
        self.close_connecting(c);
    }

    /// Defer the connecting slot to the closed list; freed at post-hook.
    pub(crate) fn close_connecting(&mut self, c: ConnectingId) {
        let head = self.closed_connecting_head;
        let Some(connecting) = self.connecting_mut(c) else {
            return;
        };
        if connecting.closed {
            return;
        }
        connecting.closed = true;
        connecting.next_closed = head;
        self.closed_connecting_head = Some(c);
        self.release_handle();
    }
}

/// A resolution result reached the loop thread; start connecting.
pub(crate) fn socket_after_resolve(
    lp: &mut EventLoop,
    cid: ConnectingId,
    result: io::Result<Vec<SocketAddr>>,
) {
    let Some(connecting) = lp.connecting_mut(cid) else {
        return;
    };
    if connecting.closed {
        return;
    }
    match result {
        Err(e) => fail_connecting(lp, cid, e),
        Ok(addrs) => {
            let port = connecting.port;
            connecting.addrs = addrs
                .into_iter()
                .map(|a| SocketAddr::new(a.ip(), port))
                .collect();
            start_connect_attempt(lp, cid);
        }
    }
}

/// Pop the next address and open a non-blocking connect towards it.
/// Exhausting the list fails the connect with the last recorded error.
pub(crate) fn start_connect_attempt(lp: &mut EventLoop, cid: ConnectingId) {
    loop {
        let (addr, source, ctx, options) = {
            let Some(connecting) = lp.connecting_mut(cid) else {
                return;
            };
            match connecting.addrs.pop_front() {
                Some(addr) => (addr, connecting.source, connecting.context, connecting.options),
                None => {
                    let err = connecting.last_error.take().unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to connect")
                    });
                    fail_connecting(lp, cid, err);
                    return;
                }
            }
        };

        if lp.context(ctx).map(|c| c.is_closed).unwrap_or(true) {
            lp.close_connecting(cid);
            return;
        }

        match net::create_connect_fd(addr, source) {
            Ok(fd) => {
                let sid =
                    lp.create_socket_entry(fd, ctx, PollType::SemiSocket, Interest::WRITABLE, options);
                if let Some(socket) = lp.socket_mut(sid) {
                    socket.connect_state = Some(cid);
                    socket.peer = Some(addr);
                }
                if let Some(connecting) = lp.connecting_mut(cid) {
                    connecting.attempt = Some(sid);
                }
                trace!(socket = %sid, %addr, "connect attempt started");
                return;
            }
            Err(e) => {
                if let Some(connecting) = lp.connecting_mut(cid) {
                    connecting.last_error = Some(e);
                }
            }
        }
    }
}

/// A semi-socket's connect finished: writable (success) or error/eof
/// (failure). On failure the next resolved address is tried before the
/// connect as a whole is failed.
pub(crate) fn socket_after_open(lp: &mut EventLoop, sid: SocketId, failed: bool) {
    let Some(socket) = lp.socket(sid) else {
        return;
    };
    if socket.is_closed {
        return;
    }
    let cid = socket.connect_state;
    let fd = socket.fd;
    let peer = socket.peer;

    if failed {
        let err = net::socket_error(fd)
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "connect failed"));
        lp.discard_socket(sid);
        let Some(cid) = cid else {
            return;
        };
        let has_more = lp
            .connecting_ref(cid)
            .map(|c| !c.addrs.is_empty())
            .unwrap_or(false);
        if let Some(connecting) = lp.connecting_mut(cid) {
            connecting.attempt = None;
            connecting.last_error = Some(err);
        }
        if has_more {
            start_connect_attempt(lp, cid);
        } else if let Some(connecting) = lp.connecting_mut(cid) {
            let err = connecting.last_error.take().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "connect failed")
            });
            fail_connecting(lp, cid, err);
        }
        return;
    }

    if let Some(socket) = lp.socket_mut(sid) {
        socket.poll_type = PollType::Socket;
        socket.connect_state = None;
    }
    lp.poll_change(sid, Interest::READABLE);
    if let Some(cid) = cid {
        lp.close_connecting(cid);
    }
    debug!(socket = %sid, "outbound connection open");
    if let Some(events) = lp.socket_events(sid) {
        events.on_open(lp, sid, true, peer);
    }
}

/// Surface `on_connect_error` once, then retire the connecting slot.
fn fail_connecting(lp: &mut EventLoop, cid: ConnectingId, err: io::Error) {
    let events = lp
        .connecting_ref(cid)
        .and_then(|c| lp.context(c.context))
        .map(|ctx| ctx.events.clone());
    debug!(connecting = cid.index(), "connect failed: {err}");
    lp.close_connecting(cid);
    if let Some(events) = events {
        events.on_connect_error(lp, cid, err);
    }
}
