//! Sockets: arena entries, poll mask changes, write/shutdown/close, and the
//! two one-byte timeout slots.

use crate::event_loop::EventLoop;
use crate::net;
use crate::poller::tcp_token;
use crate::types::{CloseReason, ConnectingId, ContextId, Interest, PollType, SocketId};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use tracing::{debug, trace};

/// Sentinel for a disarmed timeout slot. Armed values are future tick
/// values in 0..240.
pub(crate) const DISARMED: u8 = 255;

pub(crate) struct Socket {
    pub generation: u32,
    pub fd: RawFd,
    pub poll_type: PollType,
    /// Current readiness interest. Empty means the fd is deregistered.
    pub interest: Interest,
    pub registered: bool,
    pub context: ContextId,
    /// Links in whichever list currently holds this socket: the context's
    /// socket list, the loop's low-priority queue, or the closed list.
    pub prev: Option<SocketId>,
    pub next: Option<SocketId>,
    /// Short-wheel tick value, or 255 when disarmed.
    pub timeout: u8,
    /// Long-wheel tick value, or 255 when disarmed.
    pub long_timeout: u8,
    /// Present while this socket is an in-flight outbound attempt.
    pub connect_state: Option<ConnectingId>,
    /// 0 = normal, 1 = parked in the low-priority queue, 2 = promoted for
    /// one iteration.
    pub low_prio_state: u8,
    pub allow_half_open: bool,
    pub is_paused: bool,
    pub is_ipc: bool,
    pub is_shut_down: bool,
    pub is_closed: bool,
    pub is_listener: bool,
    pub peer: Option<SocketAddr>,
}

impl EventLoop {
    /// Change a socket's poll mask, registering or deregistering as needed.
    ///
    /// Re-stating an unchanged mask is meaningful: it re-queues a readiness
    /// event for data we deliberately left in the kernel buffer.
    pub(crate) fn poll_change(&mut self, s: SocketId, interest: Interest) {
        let Some(socket) = self.socket(s) else {
            return;
        };
        let fd = socket.fd;
        let was_registered = socket.registered;
        let token = tcp_token(s.index());

        let result = match (was_registered, interest.is_empty()) {
            (true, true) => self.poller.deregister(fd),
            (true, false) => self.poller.reregister(fd, token, interest),
            (false, false) => self.poller.register(fd, token, interest),
            (false, true) => Ok(()),
        };
        if let Err(e) = result {
            debug!(socket = %s, "poll change failed: {e}");
            return;
        }
        if let Some(socket) = self.socket_mut(s) {
            socket.interest = interest;
            socket.registered = !interest.is_empty();
        }
    }

    /// Non-blocking write. Returns the number of bytes accepted by the
    /// kernel; on a short or failed write the socket starts polling for
    /// writability and `on_writable` fires once it drains.
    pub fn socket_write(&mut self, s: SocketId, data: &[u8]) -> usize {
        let Some(socket) = self.socket(s) else {
            return 0;
        };
        if socket.is_closed || socket.is_shut_down || data.is_empty() {
            return 0;
        }
        let fd = socket.fd;
        let interest = socket.interest;

        match net::send(fd, data) {
            Ok(n) => {
                if n < data.len() {
                    self.last_write_failed = true;
                    self.poll_change(s, interest | Interest::WRITABLE);
                }
                n
            }
            Err(e) => {
                trace!(socket = %s, "write blocked: {e}");
                self.last_write_failed = true;
                self.poll_change(s, interest | Interest::WRITABLE);
                0
            }
        }
    }

    /// Shut down the write side. The socket keeps reading; once the peer's
    /// FIN arrives the socket closes with `CleanShutdown`.
    pub fn socket_shutdown(&mut self, s: SocketId) {
        let Some(socket) = self.socket_mut(s) else {
            return;
        };
        if socket.is_closed || socket.is_shut_down {
            return;
        }
        socket.is_shut_down = true;
        socket.poll_type = PollType::SocketShutDown;
        let fd = socket.fd;
        let interest = socket.interest;
        net::shutdown_write(fd);
        self.poll_change(s, interest & Interest::READABLE);
    }

    /// Stop delivering `on_data` without closing. Data accumulates in the
    /// kernel buffer until `socket_resume`.
    pub fn socket_pause(&mut self, s: SocketId) {
        let Some(socket) = self.socket_mut(s) else {
            return;
        };
        if socket.is_closed || socket.is_paused {
            return;
        }
        socket.is_paused = true;
        let interest = socket.interest;
        self.poll_change(s, interest & !Interest::READABLE);
    }

    pub fn socket_resume(&mut self, s: SocketId) {
        let Some(socket) = self.socket_mut(s) else {
            return;
        };
        if socket.is_closed || !socket.is_paused {
            return;
        }
        socket.is_paused = false;
        let interest = socket.interest;
        self.poll_change(s, interest | Interest::READABLE);
    }

    /// Arm the short timeout roughly `seconds` ahead (rounded up to sweep
    /// ticks), or disarm with `0`.
    pub fn socket_timeout(&mut self, s: SocketId, seconds: u32) {
        let ticks = self.seconds_to_ticks(seconds);
        let Some(socket) = self.socket(s) else {
            return;
        };
        if socket.is_closed {
            return;
        }
        let base = self
            .context(socket.context)
            .map(|c| c.timestamp)
            .unwrap_or(0);
        let value = match ticks {
            0 => DISARMED,
            t => ((base as u32 + t) % 240) as u8,
        };
        let old = std::mem::replace(&mut self.socket_mut(s).expect("checked above").timeout, value);
        self.account_timeout_slot(old, value);
    }

    /// Arm the long timeout `minutes` ahead (one long tick per 15 sweep
    /// ticks, one minute at the default granularity), or disarm with `0`.
    pub fn socket_long_timeout(&mut self, s: SocketId, minutes: u32) {
        let Some(socket) = self.socket(s) else {
            return;
        };
        if socket.is_closed {
            return;
        }
        let base = self
            .context(socket.context)
            .map(|c| c.long_timestamp)
            .unwrap_or(0);
        let value = match minutes {
            0 => DISARMED,
            m => ((base as u32 + m) % 240) as u8,
        };
        let old = std::mem::replace(
            &mut self.socket_mut(s).expect("checked above").long_timeout,
            value,
        );
        self.account_timeout_slot(old, value);
    }

    /// Track armed-slot transitions and keep the sweep timer running iff
    /// any slot is armed.
    pub(crate) fn account_timeout_slot(&mut self, old: u8, new: u8) {
        match (old == DISARMED, new == DISARMED) {
            (true, false) => {
                self.armed_timeouts += 1;
                if self.armed_timeouts == 1 {
                    self.enable_sweep_timer();
                }
            }
            (false, true) => {
                self.armed_timeouts -= 1;
                if self.armed_timeouts == 0 {
                    self.disable_sweep_timer();
                }
            }
            _ => {}
        }
    }

    fn seconds_to_ticks(&self, seconds: u32) -> u32 {
        if seconds == 0 {
            return 0;
        }
        let granularity_ms = self.cfg.sweep_granularity.as_millis().max(1) as u64;
        let ticks = (seconds as u64 * 1000).div_ceil(granularity_ms);
        ticks.clamp(1, 254) as u32
    }

    /// Close a socket: disarm its timeouts, unlink it from whichever list
    /// holds it, stop and close the fd, move it to the closed list, and
    /// fire `on_close` exactly once. Memory is reclaimed at the next
    /// post-hook.
    pub fn socket_close(&mut self, s: SocketId, reason: CloseReason) {
        if !self.begin_socket_close(s) {
            return;
        }
        if let Some(events) = self.socket_events(s) {
            events.on_close(self, s, reason);
        }
    }

    /// Close without firing `on_close`; for attempts that never opened.
    pub(crate) fn discard_socket(&mut self, s: SocketId) {
        self.begin_socket_close(s);
    }

    /// Shared close path. Returns false if the socket was already closed.
    fn begin_socket_close(&mut self, s: SocketId) -> bool {
        let Some(socket) = self.socket(s) else {
            return false;
        };
        if socket.is_closed {
            return false;
        }
        let fd = socket.fd;
        let registered = socket.registered;
        let ctx = socket.context;
        let low_prio_state = socket.low_prio_state;
        let old_timeout = socket.timeout;
        let old_long = socket.long_timeout;

        self.account_timeout_slot(old_timeout, DISARMED);
        self.account_timeout_slot(old_long, DISARMED);

        if low_prio_state == 1 {
            self.unlink_low_prio(s);
            self.context_unref(ctx);
        } else {
            self.unlink_socket(ctx, s);
        }

        if registered {
            let _ = self.poller.deregister(fd);
        }
        net::close_fd(fd);

        let head = self.closed_head;
        let socket = self.socket_mut(s).expect("checked above");
        socket.is_closed = true;
        socket.registered = false;
        socket.timeout = DISARMED;
        socket.long_timeout = DISARMED;
        socket.prev = None;
        socket.next = head;
        self.closed_head = Some(s);
        self.release_handle();
        trace!(socket = %s, "socket closed");
        true
    }

    pub fn socket_is_closed(&self, s: SocketId) -> bool {
        !self.socket_alive(s)
    }

    pub fn socket_is_shut_down(&self, s: SocketId) -> bool {
        self.socket(s).map(|sock| sock.is_shut_down).unwrap_or(false)
    }

    /// The context this socket currently belongs to.
    pub fn socket_context(&self, s: SocketId) -> Option<ContextId> {
        self.socket(s).map(|sock| sock.context)
    }

    pub fn socket_local_addr(&self, s: SocketId) -> Option<SocketAddr> {
        let socket = self.socket(s)?;
        net::local_addr(socket.fd).ok()
    }

    /// Peer address, captured at accept/connect time.
    pub fn socket_peer_addr(&self, s: SocketId) -> Option<SocketAddr> {
        self.socket(s)?.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::context::NoopEvents;
    use crate::event_loop::Hooks;
    use crate::types::SocketOptions;
    use std::rc::Rc;

    fn test_loop() -> EventLoop {
        EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap()
    }

    /// A connected socket pair adopted into the loop, for list/flag tests.
    fn adopted_pair(lp: &mut EventLoop) -> (SocketId, RawFd) {
        let ctx = lp.context_create(Rc::new(NoopEvents));
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let sid = lp.socket_from_fd(ctx, fds[0], false).unwrap();
        (sid, fds[1])
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut lp = test_loop();
        let (sid, other) = adopted_pair(&mut lp);

        lp.socket_close(sid, CloseReason::CleanShutdown);
        assert!(lp.socket_is_closed(sid));
        let closed_head = lp.closed_head;

        // Second close is a no-op; the closed list does not change.
        lp.socket_close(sid, CloseReason::Generic);
        assert_eq!(lp.closed_head, closed_head);
        net::close_fd(other);
    }

    #[test]
    fn test_closed_socket_leaves_context_list() {
        let mut lp = test_loop();
        let (sid, other) = adopted_pair(&mut lp);
        let ctx = lp.socket_context(sid).unwrap();
        assert_eq!(lp.context(ctx).unwrap().head_sockets, Some(sid));

        lp.socket_close(sid, CloseReason::CleanShutdown);
        assert_eq!(lp.context(ctx).unwrap().head_sockets, None);
        assert_eq!(lp.closed_head, Some(sid));
        net::close_fd(other);
    }

    #[test]
    fn test_timeout_arm_disarm_tracks_sweep_refcount() {
        let mut lp = test_loop();
        let (sid, other) = adopted_pair(&mut lp);

        assert_eq!(lp.armed_timeouts, 0);
        lp.socket_timeout(sid, 8);
        assert_eq!(lp.armed_timeouts, 1);
        assert_ne!(lp.socket(sid).unwrap().timeout, DISARMED);

        // Re-arming does not double count.
        lp.socket_timeout(sid, 16);
        assert_eq!(lp.armed_timeouts, 1);

        lp.socket_timeout(sid, 0);
        assert_eq!(lp.armed_timeouts, 0);
        assert_eq!(lp.socket(sid).unwrap().timeout, DISARMED);
        net::close_fd(other);
    }

    #[test]
    fn test_close_disarms_timeouts() {
        let mut lp = test_loop();
        let (sid, other) = adopted_pair(&mut lp);
        lp.socket_timeout(sid, 8);
        lp.socket_long_timeout(sid, 2);
        assert_eq!(lp.armed_timeouts, 2);

        lp.socket_close(sid, CloseReason::CleanShutdown);
        assert_eq!(lp.armed_timeouts, 0);
        net::close_fd(other);
    }

    #[test]
    fn test_shutdown_flips_poll_type() {
        let mut lp = test_loop();
        let (sid, other) = adopted_pair(&mut lp);
        lp.socket_shutdown(sid);
        let socket = lp.socket(sid).unwrap();
        assert!(socket.is_shut_down);
        assert_eq!(socket.poll_type, PollType::SocketShutDown);
        net::close_fd(other);
    }

    #[test]
    fn test_stale_id_misses_after_free() {
        let mut lp = test_loop();
        let ctx = lp.context_create(Rc::new(NoopEvents));
        let addr = lp
            .listen(ctx, "127.0.0.1", 0, SocketOptions::default())
            .unwrap();
        lp.socket_close(addr, CloseReason::CleanShutdown);
        // Simulate the post-hook free, then reuse the slot.
        lp.run();
        let replacement = lp
            .listen(ctx, "127.0.0.1", 0, SocketOptions::default())
            .unwrap();
        assert_eq!(addr.index(), replacement.index());
        assert!(lp.socket(addr).is_none());
        assert!(lp.socket(replacement).is_some());
        lp.socket_close(replacement, CloseReason::CleanShutdown);
    }
}
