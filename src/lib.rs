//! sockloop - a single-threaded socket event loop.
//!
//! Many non-blocking TCP/UDP sockets are multiplexed on one OS thread.
//! Readiness from the OS poller is translated into lifecycle callbacks
//! (`on_open`, `on_data`, `on_writable`, `on_end`, `on_close`, timeouts) on
//! per-context callback tables. The loop also carries:
//!
//! - a coarse two-wheel timeout sweep: one-byte slots, 240 positions,
//!   15 short ticks per long tick, O(sockets) per sweep with a single byte
//!   compare on the hot path
//! - a low-priority admission queue bounding expensive readable sockets
//!   (e.g. handshakes) to a per-iteration budget, so connection storms do
//!   not starve established flows
//! - a thread-safe DNS completion hand-off: a resolver worker pushes
//!   results onto a mutex-guarded list and wakes the loop
//!
//! # Quick start
//!
//! ```ignore
//! use sockloop::{EventLoop, Hooks, LoopConfig, SocketEvents, SocketOptions};
//! use std::rc::Rc;
//!
//! struct Echo;
//!
//! impl SocketEvents for Echo {
//!     fn on_data(&self, lp: &mut EventLoop, s: sockloop::SocketId, data: &mut [u8]) {
//!         lp.socket_write(s, data);
//!     }
//! }
//!
//! let mut lp = EventLoop::new(LoopConfig::default(), Hooks::default())?;
//! let ctx = lp.context_create(Rc::new(Echo));
//! lp.listen(ctx, "127.0.0.1", 4000, SocketOptions::default())?;
//! lp.run();
//! ```
//!
//! # Threading
//!
//! A loop is pinned to the thread that runs it; every callback executes
//! there. [`LoopHandle`] is the only `Send` surface: wake-ups, keep-alive
//! references, and DNS completions. Multiple loops may run in one process
//! on different threads; they share nothing.
//!
//! # Buffers
//!
//! Receive data is handed to `on_data` in a loop-owned scratch buffer
//! (default 512 KiB, the maximum single chunk) that is reused across all
//! sockets; consume or copy it before returning.

mod config;
mod context;
mod dispatch;
mod dns;
mod error;
mod event_loop;
mod low_prio;
mod net;
mod poller;
mod socket;
mod sweep;
mod timer;
mod types;
mod udp;

pub use config::LoopConfig;
pub use context::{NoopEvents, SocketEvents};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, Hooks, LoopHandle};
pub use types::{
    CloseReason, ConnectingId, ContextId, Interest, PollType, SocketId, SocketOptions, TimerId,
    UdpId,
};
pub use udp::{UdpBatch, UdpEvents};
