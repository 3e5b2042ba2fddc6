//! The event loop: arenas, iteration pre/post hooks, and deferred
//! destruction.
//!
//! One `EventLoop` is pinned to one OS thread. All socket creation,
//! dispatch, timer firing, close, and user callbacks run on that thread.
//! The only cross-thread entry points are [`LoopHandle::wakeup`],
//! [`LoopHandle::loop_ref`]/[`LoopHandle::loop_unref`], and the DNS
//! completion hand-off.

use crate::config::LoopConfig;
use crate::context::{SocketContext, SocketEvents};
use crate::dns::{ConnectingSocket, Resolver};
use crate::error::Result;
use crate::poller::{Poller, callback_token};
use crate::socket::Socket;
use crate::timer::{CallbackKind, CallbackPoll, TimerAction};
use crate::types::{ConnectingId, ContextId, SocketId, TimerId, UdpId};
use crate::udp::UdpSocket;
use crate::{dispatch, net};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, warn};

/// User hooks invoked around each iteration.
///
/// `on_pre` runs after DNS results are drained and low-priority sockets are
/// promoted, before the poll-wait. `on_post` runs after closed objects are
/// freed. `on_wakeup` runs when another thread wakes the loop.
#[derive(Default)]
pub struct Hooks {
    pub on_wakeup: Option<Rc<dyn Fn(&mut EventLoop)>>,
    pub on_pre: Option<Rc<dyn Fn(&mut EventLoop)>>,
    pub on_post: Option<Rc<dyn Fn(&mut EventLoop)>>,
}

/// State shared with other threads: the waker, the DNS-ready hand-off list,
/// and the external keep-alive count.
///
/// The hand-off list is the only cross-thread mutable data; it is guarded by
/// a single mutex, heap-placed behind this `Arc`.
pub(crate) struct LoopShared {
    pub(crate) waker: mio::Waker,
    pub(crate) dns_ready: Mutex<Vec<(ConnectingId, io::Result<Vec<SocketAddr>>)>>,
    pub(crate) keep_alive: AtomicI64,
}

/// Cheap, cloneable, `Send` handle to a loop, usable from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Force an immediate wake-up of the loop's poll-wait.
    ///
    /// Concurrent wake-ups coalesce; at least one iteration runs.
    pub fn wakeup(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!("loop wakeup failed: {e}");
        }
    }

    /// Keep the loop alive across iterations even with no live sockets.
    pub fn loop_ref(&self) {
        self.shared.keep_alive.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a reference taken with [`LoopHandle::loop_ref`].
    pub fn loop_unref(&self) {
        self.shared.keep_alive.fetch_sub(1, Ordering::AcqRel);
    }

    /// Deliver a DNS resolution result from the loop thread itself.
    ///
    /// Queues the result without waking the loop; it is drained at the next
    /// pre- or post-hook.
    pub fn dns_callback(&self, c: ConnectingId, result: io::Result<Vec<SocketAddr>>) {
        self.shared.dns_ready.lock().push((c, result));
    }

    /// Deliver a DNS resolution result from any thread and wake the loop.
    pub fn dns_callback_threadsafe(&self, c: ConnectingId, result: io::Result<Vec<SocketAddr>>) {
        self.dns_callback(c, result);
        self.wakeup();
    }
}

/// A single-threaded socket event loop.
pub struct EventLoop {
    pub(crate) cfg: LoopConfig,
    pub(crate) poller: Poller,

    pub(crate) sockets: Slab<Socket>,
    pub(crate) contexts: Slab<SocketContext>,
    pub(crate) connecting: Slab<ConnectingSocket>,
    pub(crate) udp_sockets: Slab<UdpSocket>,
    pub(crate) timers: Slab<CallbackPoll>,
    generation_counter: u32,

    /// Head of the intrusive list of contexts on this loop.
    pub(crate) ctx_head: Option<ContextId>,
    /// Sweep position in the context list; survives re-entrant unlinks.
    pub(crate) ctx_iterator: Option<ContextId>,

    /// LIFO queue of deferred low-priority sockets.
    pub(crate) low_prio_head: Option<SocketId>,
    pub(crate) low_prio_budget: u32,

    pub(crate) closed_head: Option<SocketId>,
    pub(crate) closed_udp_head: Option<UdpId>,
    pub(crate) closed_connecting_head: Option<ConnectingId>,
    pub(crate) closed_context_head: Option<ContextId>,

    pub(crate) iteration: u64,
    pub(crate) num_ready_polls: usize,
    pub(crate) last_write_failed: bool,

    /// Number of armed timeout slots across all sockets; the sweep timer
    /// runs iff this is non-zero, so idle loops stay asleep.
    pub(crate) armed_timeouts: u64,
    pub(crate) sweep_timer: TimerId,

    /// Handles that keep `run()` iterating (sockets, UDP sockets, pending
    /// connects, armed user timers). The wake-up async and the sweep timer
    /// are fallthrough polls and never count.
    pub(crate) active_handles: i64,

    pub(crate) shared: Arc<LoopShared>,
    pub(crate) hooks: Hooks,

    /// Receive scratch; taken out while a receive loop runs so callbacks can
    /// borrow the data while holding `&mut EventLoop`.
    recv_scratch: Option<Box<[u8]>>,
    send_scratch: Box<[u8]>,

    pub(crate) resolver: Option<Resolver>,
}

impl EventLoop {
    pub fn new(cfg: LoopConfig, hooks: Hooks) -> Result<Self> {
        let poller = Poller::new(cfg.event_capacity)?;

        let mut timers: Slab<CallbackPoll> = Slab::new();
        let wakeup_index = timers.insert(CallbackPoll {
            generation: 0,
            kind: CallbackKind::Async,
            action: TimerAction::Wakeup,
            internal: true,
        });
        let waker = mio::Waker::new(poller.registry(), callback_token(wakeup_index))?;

        let sweep_index = timers.insert(CallbackPoll {
            generation: 1,
            kind: CallbackKind::Timer {
                deadline: None,
                period: Some(cfg.sweep_granularity),
            },
            action: TimerAction::Sweep,
            internal: true,
        });

        let recv_scratch =
            vec![0u8; cfg.recv_buffer_len + 2 * cfg.recv_buffer_padding].into_boxed_slice();
        let send_scratch = vec![0u8; cfg.send_buffer_len].into_boxed_slice();

        Ok(Self {
            sweep_timer: TimerId::new(sweep_index, 1),
            poller,
            sockets: Slab::new(),
            contexts: Slab::new(),
            connecting: Slab::new(),
            udp_sockets: Slab::new(),
            timers,
            generation_counter: 2,
            ctx_head: None,
            ctx_iterator: None,
            low_prio_head: None,
            low_prio_budget: cfg.low_prio_budget,
            closed_head: None,
            closed_udp_head: None,
            closed_connecting_head: None,
            closed_context_head: None,
            iteration: 0,
            num_ready_polls: 0,
            last_write_failed: false,
            armed_timeouts: 0,
            active_handles: 0,
            shared: Arc::new(LoopShared {
                waker,
                dns_ready: Mutex::new(Vec::new()),
                keep_alive: AtomicI64::new(0),
            }),
            hooks,
            recv_scratch: Some(recv_scratch),
            send_scratch,
            resolver: None,
            cfg,
        })
    }

    /// A `Send` handle for wake-ups, keep-alive refs, and DNS completions.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    /// Monotonically increasing iteration number.
    pub fn iteration_number(&self) -> u64 {
        self.iteration
    }

    pub fn config(&self) -> &LoopConfig {
        &self.cfg
    }

    /// Loop-owned send scratch buffer, reused across all sockets.
    /// Contents are not stable across callbacks.
    pub fn send_scratch(&mut self) -> &mut [u8] {
        &mut self.send_scratch
    }

    /// Run iterations until no referenced handles remain.
    ///
    /// Each iteration: pre-hook (advance iteration number, drain DNS
    /// results, promote low-priority sockets, user pre-callback), poll-wait
    /// bounded by the nearest timer deadline, dispatch of the ready batch,
    /// post-hook (drain DNS results again, free closed objects, user
    /// post-callback).
    pub fn run(&mut self) {
        while self.alive() {
            self.pre_iteration();
            if !self.alive() {
                break;
            }

            let timeout = self.next_timer_timeout();
            let events = match self.poller.wait(timeout) {
                Ok(events) => events,
                Err(e) => {
                    warn!("poll wait failed: {e}");
                    self.post_iteration();
                    continue;
                }
            };
            self.num_ready_polls = events.len();

            self.fire_expired_timers();
            for ev in events {
                dispatch::dispatch_ready_poll(self, ev);
            }

            self.post_iteration();
        }
        // Final reap so nothing closed in the last iteration outlives run().
        self.free_closed_sockets();
        self.free_closed_contexts();
    }

    fn alive(&self) -> bool {
        self.active_handles > 0 || self.shared.keep_alive.load(Ordering::Acquire) > 0
    }

    fn pre_iteration(&mut self) {
        self.iteration += 1;
        self.handle_dns_results();
        self.handle_low_priority_sockets();
        if let Some(pre) = self.hooks.on_pre.clone() {
            pre(self);
        }
    }

    fn post_iteration(&mut self) {
        self.handle_dns_results();
        self.free_closed_sockets();
        self.free_closed_contexts();
        if let Some(post) = self.hooks.on_post.clone() {
            post(self);
        }
    }

    /// Detach the DNS-ready list under the mutex, then complete each entry
    /// with the lock released. Entries are completed in arrival order.
    pub(crate) fn handle_dns_results(&mut self) {
        let drained = std::mem::take(&mut *self.shared.dns_ready.lock());
        if !drained.is_empty() {
            debug!(count = drained.len(), "draining dns results");
        }
        for (cid, result) in drained {
            crate::dns::socket_after_resolve(self, cid, result);
        }
    }

    /// Free everything that was closed during this iteration. Runs only
    /// after dispatch has fully unwound, so re-entrant handlers never see a
    /// reused slot for an id still on the call stack.
    fn free_closed_sockets(&mut self) {
        let mut next = self.closed_head.take();
        while let Some(sid) = next {
            let socket = self.sockets.remove(sid.index());
            next = socket.next;
        }

        let mut next = self.closed_udp_head.take();
        while let Some(uid) = next {
            let socket = self.udp_sockets.remove(uid.index());
            next = socket.next_closed;
        }

        let mut next = self.closed_connecting_head.take();
        while let Some(cid) = next {
            let connecting = self.connecting.remove(cid.index());
            next = connecting.next_closed;
        }
    }

    /// Free closed contexts whose refcount has dropped to zero. A parked
    /// low-priority socket holds a reference, so its context outlives it.
    fn free_closed_contexts(&mut self) {
        let mut pending = None;
        let mut next = self.closed_context_head.take();
        while let Some(cid) = next {
            let ctx = &self.contexts[cid.index()];
            next = ctx.next;
            if ctx.refcount == 0 {
                self.contexts.remove(cid.index());
            } else {
                let ctx = &mut self.contexts[cid.index()];
                ctx.next = pending;
                pending = Some(cid);
            }
        }
        self.closed_context_head = pending;
    }

    pub(crate) fn next_generation(&mut self) -> u32 {
        self.generation_counter = self.generation_counter.wrapping_add(1);
        self.generation_counter
    }

    // Arena accessors, all generation-checked so stale ids miss.

    pub(crate) fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets
            .get(id.index())
            .filter(|s| s.generation == id.generation)
    }

    pub(crate) fn socket_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.sockets
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
    }

    pub(crate) fn context(&self, id: ContextId) -> Option<&SocketContext> {
        self.contexts
            .get(id.index())
            .filter(|c| c.generation == id.generation)
    }

    pub(crate) fn context_mut(&mut self, id: ContextId) -> Option<&mut SocketContext> {
        self.contexts
            .get_mut(id.index())
            .filter(|c| c.generation == id.generation)
    }

    pub(crate) fn connecting_ref(&self, id: ConnectingId) -> Option<&ConnectingSocket> {
        self.connecting
            .get(id.index())
            .filter(|c| c.generation == id.generation)
    }

    pub(crate) fn connecting_mut(&mut self, id: ConnectingId) -> Option<&mut ConnectingSocket> {
        self.connecting
            .get_mut(id.index())
            .filter(|c| c.generation == id.generation)
    }

    pub(crate) fn udp_ref(&self, id: UdpId) -> Option<&UdpSocket> {
        self.udp_sockets
            .get(id.index())
            .filter(|u| u.generation == id.generation)
    }

    pub(crate) fn udp_mut(&mut self, id: UdpId) -> Option<&mut UdpSocket> {
        self.udp_sockets
            .get_mut(id.index())
            .filter(|u| u.generation == id.generation)
    }

    /// True while the socket exists and has not been closed.
    pub(crate) fn socket_alive(&self, id: SocketId) -> bool {
        self.socket(id).map(|s| !s.is_closed).unwrap_or(false)
    }

    /// The callback table of the context a socket currently belongs to.
    pub(crate) fn socket_events(&self, id: SocketId) -> Option<Rc<dyn SocketEvents>> {
        let socket = self.socket(id)?;
        Some(self.context(socket.context)?.events.clone())
    }

    pub(crate) fn take_recv_scratch(&mut self) -> Box<[u8]> {
        self.recv_scratch
            .take()
            .expect("receive loops do not nest")
    }

    pub(crate) fn put_recv_scratch(&mut self, buf: Box<[u8]>) {
        self.recv_scratch = Some(buf);
    }

    pub(crate) fn keep_handle(&mut self) {
        self.active_handles += 1;
    }

    pub(crate) fn release_handle(&mut self) {
        self.active_handles -= 1;
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for (_, socket) in self.sockets.iter() {
            if !socket.is_closed {
                net::close_fd(socket.fd);
            }
        }
        for (_, udp) in self.udp_sockets.iter() {
            if !udp.closed {
                net::close_fd(udp.fd);
            }
        }
    }
}
