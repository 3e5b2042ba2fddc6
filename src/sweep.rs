//! The coarse two-wheel timeout sweep.
//!
//! One sweep per granularity tick, across every context on the loop. The
//! hot path is a tight list walk comparing two one-byte slots against the
//! context's current tick values; only a match leaves the fast path. 240
//! slots with 255 as the disarmed sentinel fit one byte, and 240 = 16 x 15
//! gives the nested wheels a clean relationship: 15 short ticks per long
//! tick.
//!
//! Timeout handlers may close the current socket, close siblings, or re-home
//! sockets; the context's `iterator` slot keeps the walk valid through any
//! of that.

use crate::event_loop::EventLoop;
use crate::socket::DISARMED;

/// Never runs re-entrantly: only the sweep timer expiry calls it.
pub(crate) fn timer_sweep(lp: &mut EventLoop) {
    lp.ctx_iterator = lp.ctx_head;
    while let Some(cid) = lp.ctx_iterator {
        let (short_ticks, long_ticks) = {
            let ctx = &mut lp.contexts[cid.index()];
            ctx.global_tick = ctx.global_tick.wrapping_add(1);
            ctx.timestamp = (ctx.global_tick % 240) as u8;
            ctx.long_timestamp = ((ctx.global_tick / 15) % 240) as u8;
            (ctx.timestamp, ctx.long_timestamp)
        };

        let mut cursor = lp.contexts[cid.index()].head_sockets;
        while let Some(sid) = cursor {
            let (timeout, long_timeout, next) = {
                let socket = &lp.sockets[sid.index()];
                (socket.timeout, socket.long_timeout, socket.next)
            };
            // Fast path: one byte compare per wheel, then step.
            if timeout != short_ticks && long_timeout != long_ticks {
                cursor = next;
                continue;
            }

            // Slow path: a timeout to emit. Park the walk position where
            // event handlers that splice the chain can move it.
            lp.contexts[cid.index()].iterator = Some(sid);

            if timeout == short_ticks {
                lp.sockets[sid.index()].timeout = DISARMED;
                lp.account_timeout_slot(timeout, DISARMED);
                if let Some(events) = lp.socket_events(sid) {
                    events.on_timeout(lp, sid);
                }
            }

            // The short handler may have closed the socket (moving the
            // iterator off it) or re-armed the long slot; re-read both.
            let still_current = lp
                .context(cid)
                .map(|ctx| ctx.iterator == Some(sid))
                .unwrap_or(false);
            if still_current && lp.sockets[sid.index()].long_timeout == long_ticks {
                lp.sockets[sid.index()].long_timeout = DISARMED;
                lp.account_timeout_slot(long_ticks, DISARMED);
                if let Some(events) = lp.socket_events(sid) {
                    events.on_long_timeout(lp, sid);
                }
            }

            // Step one if the handlers left the chain alone, otherwise
            // resume from wherever they pointed the iterator.
            let iterator = lp.contexts[cid.index()].iterator;
            if iterator == Some(sid) {
                cursor = lp.sockets[sid.index()].next;
            } else {
                cursor = iterator;
            }
        }
        lp.contexts[cid.index()].iterator = None;

        // Advance to the sibling unless a handler unlinked this context,
        // in which case the unlink already moved our position.
        if lp.ctx_iterator == Some(cid) {
            lp.ctx_iterator = lp.contexts[cid.index()].next;
        }
    }
    lp.ctx_iterator = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;
    use crate::context::SocketEvents;
    use crate::event_loop::{EventLoop, Hooks};
    use crate::types::{CloseReason, SocketId};
    use std::cell::RefCell;
    use std::os::unix::io::RawFd;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        fired: RefCell<Vec<(SocketId, &'static str)>>,
        /// Sockets to disarm when the first short timeout fires.
        disarm_on_first: RefCell<Vec<SocketId>>,
        /// Socket to close when any short timeout fires.
        close_on_fire: RefCell<Option<SocketId>>,
    }

    impl SocketEvents for Rc<Recorder> {
        fn on_timeout(&self, lp: &mut EventLoop, s: SocketId) {
            // The slot must be disarmed before the handler runs.
            assert_eq!(lp.socket(s).unwrap().timeout, DISARMED);
            self.fired.borrow_mut().push((s, "timeout"));
            for other in self.disarm_on_first.borrow_mut().drain(..) {
                lp.socket_timeout(other, 0);
            }
            if let Some(victim) = self.close_on_fire.borrow_mut().take() {
                lp.socket_close(victim, CloseReason::CleanShutdown);
            }
        }

        fn on_long_timeout(&self, lp: &mut EventLoop, s: SocketId) {
            assert_eq!(lp.socket(s).unwrap().long_timeout, DISARMED);
            self.fired.borrow_mut().push((s, "long_timeout"));
        }
    }

    struct Fixture {
        lp: EventLoop,
        recorder: Rc<Recorder>,
        ctx: crate::types::ContextId,
        peers: Vec<RawFd>,
    }

    impl Fixture {
        fn new(sockets: usize) -> (Self, Vec<SocketId>) {
            let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default()).unwrap();
            let recorder = Rc::new(Recorder::default());
            let ctx = lp.context_create(Rc::new(recorder.clone()));
            let mut ids = Vec::new();
            let mut peers = Vec::new();
            for _ in 0..sockets {
                let mut fds = [0; 2];
                let rc = unsafe {
                    libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
                };
                assert_eq!(rc, 0);
                ids.push(lp.socket_from_fd(ctx, fds[0], false).unwrap());
                peers.push(fds[1]);
            }
            (
                Self {
                    lp,
                    recorder,
                    ctx,
                    peers,
                },
                ids,
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for fd in &self.peers {
                crate::net::close_fd(*fd);
            }
        }
    }

    #[test]
    fn test_short_timeout_fires_on_matching_tick() {
        let (mut f, ids) = Fixture::new(1);
        let s = ids[0];

        // Arm two ticks ahead of the context's current timestamp.
        f.lp.sockets[s.index()].timeout = 2;
        f.lp.account_timeout_slot(DISARMED, 2);

        timer_sweep(&mut f.lp); // tick 1
        assert!(f.recorder.fired.borrow().is_empty());
        timer_sweep(&mut f.lp); // tick 2: match
        assert_eq!(&*f.recorder.fired.borrow(), &[(s, "timeout")]);
        assert_eq!(f.lp.armed_timeouts, 0);

        // A fired timeout does not fire again.
        timer_sweep(&mut f.lp);
        assert_eq!(f.recorder.fired.borrow().len(), 1);
    }

    #[test]
    fn test_wheel_wraps_at_240() {
        let (mut f, ids) = Fixture::new(1);
        let s = ids[0];

        // Next sweep lands on tick 240, i.e. slot 0 after wrap-around.
        f.lp.contexts[f.ctx.index()].global_tick = 239;
        f.lp.sockets[s.index()].timeout = 0;
        f.lp.account_timeout_slot(DISARMED, 0);

        timer_sweep(&mut f.lp);
        assert_eq!(&*f.recorder.fired.borrow(), &[(s, "timeout")]);
    }

    #[test]
    fn test_long_wheel_ticks_every_15_short_ticks() {
        let (mut f, ids) = Fixture::new(1);
        let s = ids[0];

        f.lp.contexts[f.ctx.index()].global_tick = 14;
        f.lp.sockets[s.index()].long_timeout = 1;
        f.lp.account_timeout_slot(DISARMED, 1);

        // Tick 15: long wheel advances to 1 and the slot matches.
        timer_sweep(&mut f.lp);
        assert_eq!(&*f.recorder.fired.borrow(), &[(s, "long_timeout")]);
    }

    #[test]
    fn test_disarm_in_callback_suppresses_siblings() {
        let (mut f, ids) = Fixture::new(10);

        for &s in &ids {
            f.lp.sockets[s.index()].timeout = 1;
            f.lp.account_timeout_slot(DISARMED, 1);
        }
        // Whichever socket fires first disarms all the others.
        *f.recorder.disarm_on_first.borrow_mut() = ids.clone();

        timer_sweep(&mut f.lp);
        assert_eq!(f.recorder.fired.borrow().len(), 1);
        assert_eq!(f.lp.armed_timeouts, 0);
    }

    #[test]
    fn test_close_of_sibling_mid_walk_is_safe() {
        let (mut f, ids) = Fixture::new(3);

        // The list is LIFO, so ids[2] is walked first; have its handler
        // close ids[1] (the next socket in the walk).
        f.lp.sockets[ids[2].index()].timeout = 1;
        f.lp.account_timeout_slot(DISARMED, 1);
        f.lp.sockets[ids[0].index()].timeout = 1;
        f.lp.account_timeout_slot(DISARMED, 1);
        *f.recorder.close_on_fire.borrow_mut() = Some(ids[1]);

        timer_sweep(&mut f.lp);
        let fired = f.recorder.fired.borrow();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0], (ids[2], "timeout"));
        assert_eq!(fired[1], (ids[0], "timeout"));
    }

    #[test]
    fn test_close_of_current_socket_mid_walk_is_safe() {
        let (mut f, ids) = Fixture::new(2);

        // ids[1] is walked first and closes itself in the handler; the walk
        // must still reach ids[0].
        f.lp.sockets[ids[1].index()].timeout = 1;
        f.lp.account_timeout_slot(DISARMED, 1);
        f.lp.sockets[ids[0].index()].timeout = 1;
        f.lp.account_timeout_slot(DISARMED, 1);
        *f.recorder.close_on_fire.borrow_mut() = Some(ids[1]);

        timer_sweep(&mut f.lp);
        let fired = f.recorder.fired.borrow();
        assert_eq!(fired.len(), 2);
        assert!(f.lp.socket_is_closed(ids[1]));
        assert!(!f.lp.socket_is_closed(ids[0]));
    }
}
