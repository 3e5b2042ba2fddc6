//! Socket contexts: groups of sockets sharing one callback table.

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::net;
use crate::poller::tcp_token;
use crate::socket::{DISARMED, Socket};
use crate::types::{CloseReason, ConnectingId, ContextId, Interest, PollType, SocketId, SocketOptions};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use tracing::debug;

/// Per-context callback table.
///
/// Implement the events you care about; the rest default to no-ops. Every
/// callback receives the loop by `&mut` and may close the socket it was
/// called for, close siblings, re-home the socket to another context, or arm
/// and disarm timeouts. Dispatch re-validates socket liveness after every
/// callback, so all of that is safe mid-walk.
///
/// Data passed to `on_data` lives in the loop's scratch buffer and is only
/// valid for the duration of the call; copy it if you need retention.
pub trait SocketEvents {
    /// A socket finished opening: accepted (`is_client == false`) or an
    /// outbound connect completed (`is_client == true`).
    fn on_open(&self, _lp: &mut EventLoop, _s: SocketId, _is_client: bool, _peer: Option<SocketAddr>) {
    }

    /// Data arrived. The slice is the loop's receive scratch buffer.
    fn on_data(&self, _lp: &mut EventLoop, _s: SocketId, _data: &mut [u8]) {}

    /// The socket drained its kernel send buffer after a failed write.
    fn on_writable(&self, _lp: &mut EventLoop, _s: SocketId) {}

    /// The peer shut down its write side. Only half-open sockets stay
    /// usable afterwards; otherwise a clean close follows immediately.
    fn on_end(&self, _lp: &mut EventLoop, _s: SocketId) {}

    /// The socket is gone. Fires exactly once; no callback for this socket
    /// runs after it.
    fn on_close(&self, _lp: &mut EventLoop, _s: SocketId, _reason: CloseReason) {}

    /// The short (seconds wheel) timeout fired. The slot is disarmed before
    /// this runs; re-arm inside the callback to keep a recurring timeout.
    fn on_timeout(&self, _lp: &mut EventLoop, _s: SocketId) {}

    /// The long (minutes wheel) timeout fired.
    fn on_long_timeout(&self, _lp: &mut EventLoop, _s: SocketId) {}

    /// An outbound connect failed after exhausting every resolved address.
    fn on_connect_error(&self, _lp: &mut EventLoop, _c: ConnectingId, _err: io::Error) {}

    /// A file descriptor arrived over an IPC socket (`SCM_RIGHTS`).
    /// Called before `on_data` sees the payload of the same message.
    /// The receiver owns the descriptor.
    fn on_fd(&self, _lp: &mut EventLoop, _s: SocketId, _fd: RawFd) {}

    /// Classify a readable socket as expensive. Low-priority sockets are
    /// throttled to a per-iteration budget; the rest are parked and drip-fed
    /// on later iterations.
    fn is_low_prio(&self, _lp: &EventLoop, _s: SocketId) -> bool {
        false
    }
}

/// A no-op callback table.
pub struct NoopEvents;

impl SocketEvents for NoopEvents {}

pub(crate) struct SocketContext {
    pub generation: u32,
    /// Sibling links in the loop's context list, repurposed as the
    /// closed-context chain after close.
    pub prev: Option<ContextId>,
    pub next: Option<ContextId>,
    /// Head of this context's intrusive socket list.
    pub head_sockets: Option<SocketId>,
    /// Sweep position; event handlers that splice the list move it.
    pub iterator: Option<SocketId>,
    pub global_tick: u32,
    pub timestamp: u8,
    pub long_timestamp: u8,
    pub events: Rc<dyn SocketEvents>,
    /// Held by parked low-priority sockets and explicit `context_ref`.
    pub refcount: u32,
    pub is_closed: bool,
}

impl EventLoop {
    /// Create a context with the given callback table and link it to the
    /// head of the loop's context list.
    pub fn context_create(&mut self, events: Rc<dyn SocketEvents>) -> ContextId {
        let generation = self.next_generation();
        let entry = self.contexts.vacant_entry();
        let cid = ContextId::new(entry.key(), generation);
        entry.insert(SocketContext {
            generation,
            prev: None,
            next: None,
            head_sockets: None,
            iterator: None,
            global_tick: 0,
            timestamp: 0,
            long_timestamp: 0,
            events,
            refcount: 0,
            is_closed: false,
        });
        self.link_context(cid);
        cid
    }

    /// Replace the context's callback table.
    pub fn context_set_events(&mut self, ctx: ContextId, events: Rc<dyn SocketEvents>) -> Result<()> {
        let context = self.context_mut(ctx).ok_or(Error::UnknownContext)?;
        context.events = events;
        Ok(())
    }

    pub fn context_ref(&mut self, ctx: ContextId) {
        if let Some(context) = self.context_mut(ctx) {
            context.refcount += 1;
        }
    }

    pub fn context_unref(&mut self, ctx: ContextId) {
        if let Some(context) = self.context_mut(ctx) {
            context.refcount = context.refcount.saturating_sub(1);
        }
    }

    /// Close a context: closes every socket that belongs to it (listed,
    /// parked, or still connecting), then defers the context itself to the
    /// closed list. Memory is reclaimed at the next post-hook, once the
    /// refcount drains.
    pub fn context_close(&mut self, ctx: ContextId) {
        let Some(context) = self.context_mut(ctx) else {
            return;
        };
        if context.is_closed {
            return;
        }

        // Abort pending connects first so closing their attempt sockets
        // cannot start a fail-over attempt mid-teardown.
        let pending: Vec<ConnectingId> = self
            .connecting
            .iter()
            .filter(|(_, c)| c.context == ctx && !c.closed)
            .map(|(key, c)| ConnectingId::new(key, c.generation))
            .collect();
        for cid in pending {
            self.connect_abort(cid);
        }

        let mut members = Vec::new();
        let mut cursor = self.context(ctx).and_then(|c| c.head_sockets);
        while let Some(sid) = cursor {
            cursor = self.sockets[sid.index()].next;
            members.push(sid);
        }
        let mut cursor = self.low_prio_head;
        while let Some(sid) = cursor {
            let socket = &self.sockets[sid.index()];
            cursor = socket.next;
            if socket.context == ctx {
                members.push(sid);
            }
        }
        for sid in members {
            self.socket_close(sid, CloseReason::CleanShutdown);
        }

        self.unlink_context(ctx);
        let head = self.closed_context_head;
        let context = self.context_mut(ctx).expect("context exists until post-hook");
        context.is_closed = true;
        context.prev = None;
        context.next = head;
        self.closed_context_head = Some(ctx);
        debug!(context = ctx.index(), "context closed");
    }

    /// Bind a listening socket into this context.
    ///
    /// Accepted children inherit `ALLOW_HALF_OPEN` from the listen options.
    pub fn listen(
        &mut self,
        ctx: ContextId,
        host: &str,
        port: u16,
        options: SocketOptions,
    ) -> Result<SocketId> {
        let context = self.context(ctx).ok_or(Error::UnknownContext)?;
        if context.is_closed {
            return Err(Error::ContextClosed);
        }

        let addr = resolve_one(host, port)?;
        let fd = net::create_listen_fd(addr, options, 512)?;
        let sid = self.create_socket_entry(fd, ctx, PollType::SemiSocket, Interest::READABLE, options);
        if let Some(socket) = self.socket_mut(sid) {
            socket.is_listener = true;
        }
        debug!(socket = %sid, %addr, "listening");
        Ok(sid)
    }

    /// Adopt an externally created descriptor as an established socket of
    /// this context. `is_ipc` sockets receive ancillary descriptors through
    /// `on_fd`. Fires `on_open` for the adopted socket.
    pub fn socket_from_fd(&mut self, ctx: ContextId, fd: RawFd, is_ipc: bool) -> Result<SocketId> {
        let context = self.context(ctx).ok_or(Error::UnknownContext)?;
        if context.is_closed {
            return Err(Error::ContextClosed);
        }

        net::set_nonblocking(fd)?;
        let sid = self.create_socket_entry(
            fd,
            ctx,
            PollType::Socket,
            Interest::READABLE,
            SocketOptions::default(),
        );
        if let Some(socket) = self.socket_mut(sid) {
            socket.is_ipc = is_ipc;
        }
        if let Some(events) = self.socket_events(sid) {
            events.on_open(self, sid, false, None);
        }
        Ok(sid)
    }

    /// Move an established socket to another context. The socket keeps its
    /// fd, interest mask and timeouts; subsequent events use the new
    /// context's callback table and tick counters.
    pub fn adopt_socket(&mut self, ctx: ContextId, s: SocketId) -> Result<()> {
        let target = self.context(ctx).ok_or(Error::UnknownContext)?;
        if target.is_closed {
            return Err(Error::ContextClosed);
        }
        let socket = self.socket(s).ok_or(Error::UnknownSocket)?;
        if socket.is_closed {
            return Err(Error::UnknownSocket);
        }
        let old = socket.context;
        if old == ctx {
            return Ok(());
        }
        // A parked socket keeps its queue slot; only listed sockets move.
        if socket.low_prio_state != 1 {
            self.unlink_socket(old, s);
            self.link_socket(ctx, s);
        }
        if let Some(socket) = self.socket_mut(s) {
            socket.context = ctx;
        }
        Ok(())
    }

    /// Create a socket arena entry, register its fd, and link it into the
    /// context's socket list. Timeouts start disarmed.
    pub(crate) fn create_socket_entry(
        &mut self,
        fd: RawFd,
        ctx: ContextId,
        poll_type: PollType,
        interest: Interest,
        options: SocketOptions,
    ) -> SocketId {
        let generation = self.next_generation();
        let entry = self.sockets.vacant_entry();
        let sid = SocketId::new(entry.key(), generation);
        entry.insert(Socket {
            generation,
            fd,
            poll_type,
            interest,
            registered: false,
            context: ctx,
            prev: None,
            next: None,
            timeout: DISARMED,
            long_timeout: DISARMED,
            connect_state: None,
            low_prio_state: 0,
            allow_half_open: options.contains(SocketOptions::ALLOW_HALF_OPEN),
            is_paused: false,
            is_ipc: false,
            is_shut_down: false,
            is_closed: false,
            is_listener: false,
            peer: None,
        });

        if !interest.is_empty() {
            if let Err(e) = self.poller.register(fd, tcp_token(sid.index()), interest) {
                debug!(socket = %sid, "poll registration failed: {e}");
            } else if let Some(socket) = self.socket_mut(sid) {
                socket.registered = true;
            }
        }

        self.link_socket(ctx, sid);
        self.keep_handle();
        sid
    }

    /// Push a socket onto the head of its context's socket list.
    pub(crate) fn link_socket(&mut self, ctx: ContextId, s: SocketId) {
        let head = {
            let context = &mut self.contexts[ctx.index()];
            let head = context.head_sockets;
            context.head_sockets = Some(s);
            head
        };
        if let Some(old_head) = head {
            self.sockets[old_head.index()].prev = Some(s);
        }
        let socket = &mut self.sockets[s.index()];
        socket.prev = None;
        socket.next = head;
    }

    /// Unlink a socket from its context's list, keeping a sweep walk that
    /// currently points at it valid.
    pub(crate) fn unlink_socket(&mut self, ctx: ContextId, s: SocketId) {
        let (prev, next) = {
            let socket = &self.sockets[s.index()];
            (socket.prev, socket.next)
        };

        let context = &mut self.contexts[ctx.index()];
        if context.iterator == Some(s) {
            context.iterator = next;
        }
        if context.head_sockets == Some(s) {
            context.head_sockets = next;
        }
        if let Some(prev) = prev {
            self.sockets[prev.index()].next = next;
        }
        if let Some(next) = next {
            self.sockets[next.index()].prev = prev;
        }
        let socket = &mut self.sockets[s.index()];
        socket.prev = None;
        socket.next = None;
    }

    fn link_context(&mut self, ctx: ContextId) {
        let head = self.ctx_head;
        if let Some(old_head) = head {
            self.contexts[old_head.index()].prev = Some(ctx);
        }
        let context = &mut self.contexts[ctx.index()];
        context.prev = None;
        context.next = head;
        self.ctx_head = Some(ctx);
    }

    fn unlink_context(&mut self, ctx: ContextId) {
        let (prev, next) = {
            let context = &self.contexts[ctx.index()];
            (context.prev, context.next)
        };
        if self.ctx_iterator == Some(ctx) {
            self.ctx_iterator = next;
        }
        if self.ctx_head == Some(ctx) {
            self.ctx_head = next;
        }
        if let Some(prev) = prev {
            self.contexts[prev.index()].next = next;
        }
        if let Some(next) = next {
            self.contexts[next.index()].prev = prev;
        }
    }
}

/// Resolve a host/port pair to one address, synchronously.
/// Listen paths use this; connect paths go through the resolver worker.
pub(crate) fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::event_loop::Hooks;

    fn test_loop() -> EventLoop {
        EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap()
    }

    #[test]
    fn test_context_create_and_close() {
        let mut lp = test_loop();
        let ctx = lp.context_create(Rc::new(NoopEvents));
        assert!(lp.context(ctx).is_some());
        assert_eq!(lp.ctx_head, Some(ctx));

        lp.context_close(ctx);
        assert!(lp.context(ctx).map(|c| c.is_closed).unwrap_or(false));
        assert_eq!(lp.ctx_head, None);
    }

    #[test]
    fn test_context_list_links() {
        let mut lp = test_loop();
        let a = lp.context_create(Rc::new(NoopEvents));
        let b = lp.context_create(Rc::new(NoopEvents));
        // Head insertion: b is first.
        assert_eq!(lp.ctx_head, Some(b));
        assert_eq!(lp.context(b).unwrap().next, Some(a));
        assert_eq!(lp.context(a).unwrap().prev, Some(b));

        lp.context_close(b);
        assert_eq!(lp.ctx_head, Some(a));
        assert_eq!(lp.context(a).unwrap().prev, None);
    }

    #[test]
    fn test_listen_links_socket() {
        let mut lp = test_loop();
        let ctx = lp.context_create(Rc::new(NoopEvents));
        let sid = lp.listen(ctx, "127.0.0.1", 0, SocketOptions::default()).unwrap();
        assert_eq!(lp.context(ctx).unwrap().head_sockets, Some(sid));
        assert!(lp.socket(sid).unwrap().is_listener);
        assert!(lp.socket_local_addr(sid).unwrap().port() > 0);
    }

    #[test]
    fn test_listen_on_closed_context_fails() {
        let mut lp = test_loop();
        let ctx = lp.context_create(Rc::new(NoopEvents));
        lp.context_close(ctx);
        assert!(matches!(
            lp.listen(ctx, "127.0.0.1", 0, SocketOptions::default()),
            Err(Error::ContextClosed)
        ));
    }

    #[test]
    fn test_resolve_one_numeric() {
        let addr = resolve_one("127.0.0.1", 80).unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:80");
    }
}
