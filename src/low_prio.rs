//! Low-priority admission: bounding expensive readable sockets per
//! iteration.
//!
//! CPU-heavy sockets (a TLS handshake, say) must not starve established
//! flows during a connection storm. Each iteration admits up to the
//! configured budget of them; the rest are parked on a LIFO queue with
//! readability switched off and drip-fed on later iterations. LIFO favours
//! fresh clients: under overload the older parked connections are the ones
//! most likely to have given up client-side, so serving newer ones first
//! yields better goodput.

use crate::event_loop::EventLoop;
use crate::types::{Interest, SocketId};
use tracing::trace;

impl EventLoop {
    /// Pre-iteration: refill the budget, then promote parked sockets from
    /// the queue head, consuming budget for each. A promoted socket is
    /// relinked into its context, has readability restored, and is
    /// processed once (state 2) before returning to normal (state 0).
    pub(crate) fn handle_low_priority_sockets(&mut self) {
        self.low_prio_budget = self.cfg.low_prio_budget;

        while self.low_prio_budget > 0 {
            let Some(sid) = self.low_prio_head else {
                break;
            };
            self.unlink_low_prio(sid);

            let ctx = self.sockets[sid.index()].context;
            self.link_socket(ctx, sid);
            self.context_unref(ctx);

            let interest = self.sockets[sid.index()].interest;
            self.poll_change(sid, interest | Interest::READABLE);
            self.sockets[sid.index()].low_prio_state = 2;
            self.low_prio_budget -= 1;
            trace!(socket = %sid, "low-prio socket promoted");
        }
    }

    /// Park a readable socket whose budget ran out: readability off, out of
    /// the context list, onto the queue head. The context is pinned while
    /// the socket sits outside its list.
    pub(crate) fn defer_low_prio_socket(&mut self, s: SocketId) {
        let (ctx, interest) = {
            let socket = &self.sockets[s.index()];
            (socket.context, socket.interest)
        };
        self.poll_change(s, interest & Interest::WRITABLE);
        self.context_ref(ctx);
        self.unlink_socket(ctx, s);

        let head = self.low_prio_head;
        if let Some(old_head) = head {
            self.sockets[old_head.index()].prev = Some(s);
        }
        let socket = &mut self.sockets[s.index()];
        socket.prev = None;
        socket.next = head;
        socket.low_prio_state = 1;
        self.low_prio_head = Some(s);
        trace!(socket = %s, "low-prio socket deferred");
    }

    /// Remove a socket from the low-priority queue (promotion or close).
    pub(crate) fn unlink_low_prio(&mut self, s: SocketId) {
        let (prev, next) = {
            let socket = &self.sockets[s.index()];
            (socket.prev, socket.next)
        };
        if self.low_prio_head == Some(s) {
            self.low_prio_head = next;
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
}
