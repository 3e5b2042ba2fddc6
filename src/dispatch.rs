//! Readiness → lifecycle translation.
//!
//! One entry per ready poll, switching on the poll's type. Every user
//! callback may close the socket it was called for, close siblings, adopt
//! the socket into another context, or change poll masks; dispatch
//! re-validates liveness by id after each callback before touching the
//! socket again. Closed entities stay in their arena until the post-hook,
//! so an id on the call stack never resolves to a reused slot within the
//! iteration that closed it.

use crate::dns;
use crate::event_loop::EventLoop;
use crate::net;
use crate::poller::{CALLBACK_TOKEN_OFFSET, PollEvent, UDP_TOKEN_OFFSET};
use crate::types::{CloseReason, Interest, PollType, SocketId, SocketOptions, TimerId, UdpId};
use crate::udp::UdpBatch;
use tracing::debug;

/// The loop is "not very busy" below this many ready polls; quiet
/// iterations may re-read the same socket repeatedly.
const NOT_BUSY_THRESHOLD: usize = 25;
/// Cap on consecutive re-reads of one socket while other polls wait.
const MAX_REPEAT_RECV: usize = 10;
/// A read within this margin of the buffer size counts as "nearly full",
/// i.e. more data is probably waiting.
const REPEAT_RECV_SLACK: usize = 24 * 1024;

pub(crate) fn dispatch_ready_poll(lp: &mut EventLoop, ev: PollEvent) {
    if ev.token >= CALLBACK_TOKEN_OFFSET {
        dispatch_callback(lp, ev.token - CALLBACK_TOKEN_OFFSET);
    } else if ev.token >= UDP_TOKEN_OFFSET {
        dispatch_udp(lp, ev.token - UDP_TOKEN_OFFSET, ev);
    } else {
        dispatch_tcp(lp, ev.token, ev);
    }
}

/// The async wake-up handle fired. The poller already consumed the signal;
/// run the stored action.
fn dispatch_callback(lp: &mut EventLoop, index: usize) {
    let Some(entry) = lp.timers.get(index) else {
        return;
    };
    let t = TimerId::new(index, entry.generation);
    lp.invoke_callback_poll(t);
}

fn dispatch_tcp(lp: &mut EventLoop, index: usize, ev: PollEvent) {
    // The fd may have been closed after the event was queued.
    let Some(socket) = lp.sockets.get(index) else {
        return;
    };
    if socket.is_closed {
        return;
    }
    let sid = SocketId::new(index, socket.generation);
    match socket.poll_type {
        PollType::SemiSocket => dispatch_semi_socket(lp, sid, ev),
        PollType::Socket | PollType::SocketShutDown => dispatch_socket(lp, sid, ev),
        // Callback polls have no fd token here and UDP lives in its own
        // arena; neither reaches this arm.
        PollType::Callback | PollType::Udp => {}
    }
}

/// Semi-sockets poll for different events depending on what they are: a
/// connecting socket polls WRITABLE (connect completion), a listener polls
/// READABLE (pending accepts).
fn dispatch_semi_socket(lp: &mut EventLoop, sid: SocketId, ev: PollEvent) {
    let Some(socket) = lp.socket(sid) else {
        return;
    };
    if socket.interest == Interest::WRITABLE {
        dns::socket_after_open(lp, sid, ev.error || ev.eof);
    } else {
        accept_loop(lp, sid);
    }
}

/// Accept until the listener would block, or until `on_open` closes it.
fn accept_loop(lp: &mut EventLoop, listen_sid: SocketId) {
    loop {
        let Some(listener) = lp.socket(listen_sid) else {
            return;
        };
        if listener.is_closed {
            return;
        }
        let listen_fd = listener.fd;
        let ctx = listener.context;
        let mut options = SocketOptions::default();
        if listener.allow_half_open {
            options |= SocketOptions::ALLOW_HALF_OPEN;
        }

        match net::accept_fd(listen_fd) {
            Ok((fd, peer)) => {
                net::set_nodelay(fd, true);
                let sid =
                    lp.create_socket_entry(fd, ctx, PollType::Socket, Interest::READABLE, options);
                if let Some(socket) = lp.socket_mut(sid) {
                    socket.peer = Some(peer);
                }
                if let Some(events) = lp.socket_events(sid) {
                    events.on_open(lp, sid, false, Some(peer));
                }
            }
            Err(e) if net::would_block(&e) => return,
            Err(e) => {
                debug!(socket = %listen_sid, "accept failed: {e}");
                return;
            }
        }
    }
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Abort,
}

/// Established sockets: four phases in fixed order, each short-circuiting
/// if the socket closed along the way.
fn dispatch_socket(lp: &mut EventLoop, sid: SocketId, ev: PollEvent) {
    let mut eof = ev.eof;
    let error = ev.error;

    // Writable phase. The callback reports failed writes through
    // `last_write_failed`; if it wrote cleanly (or shut down) we stop
    // polling for writability.
    if ev.writable && !error {
        lp.last_write_failed = false;
        if let Some(events) = lp.socket_events(sid) {
            events.on_writable(lp, sid);
        }
        let Some(socket) = lp.socket(sid) else {
            return;
        };
        if socket.is_closed {
            return;
        }
        if !lp.last_write_failed || socket.is_shut_down {
            let interest = socket.interest;
            lp.poll_change(sid, interest & Interest::READABLE);
        }
    }

    // Readable phase: admission control, then the bounded receive loop.
    if ev.readable && lp.socket_alive(sid) {
        if !admit_readable(lp, sid) {
            // Deferred to the low-priority queue; the remaining phases are
            // skipped entirely, as if the event had not fired.
            return;
        }
        if recv_phase(lp, sid, error, &mut eof) == Flow::Abort {
            return;
        }
    }

    // EOF phase.
    if eof && lp.socket_alive(sid) {
        let (is_shut_down, allow_half_open, interest) = {
            let socket = lp.socket(sid).expect("alive checked");
            (socket.is_shut_down, socket.allow_half_open, socket.interest)
        };
        if is_shut_down {
            // FIN both ways.
            lp.socket_close(sid, CloseReason::CleanShutdown);
            return;
        }
        if allow_half_open {
            // Keep the write side; just stop reading.
            lp.poll_change(sid, interest & Interest::WRITABLE);
            if let Some(events) = lp.socket_events(sid) {
                events.on_end(lp, sid);
            }
        } else {
            if let Some(events) = lp.socket_events(sid) {
                events.on_end(lp, sid);
            }
            if lp.socket_alive(sid) {
                lp.socket_close(sid, CloseReason::CleanShutdown);
            }
            return;
        }
    }

    // Error phase (EPOLLERR / EV_ERROR).
    if error && lp.socket_alive(sid) {
        lp.socket_close(sid, CloseReason::Generic);
    }
}

/// Low-priority admission. Returns false when the socket was parked.
fn admit_readable(lp: &mut EventLoop, sid: SocketId) -> bool {
    let Some(events) = lp.socket_events(sid) else {
        return false;
    };
    if !events.is_low_prio(lp, sid) {
        return true;
    }
    let state = lp.sockets[sid.index()].low_prio_state;
    if state == 2 {
        // Previously delayed; it gets one iteration's worth now.
        lp.sockets[sid.index()].low_prio_state = 0;
        true
    } else if lp.low_prio_budget > 0 {
        lp.low_prio_budget -= 1;
        true
    } else {
        lp.defer_low_prio_socket(sid);
        false
    }
}

fn recv_phase(lp: &mut EventLoop, sid: SocketId, error: bool, eof: &mut bool) -> Flow {
    // The scratch buffer leaves the loop while callbacks can run, so
    // `on_data` can borrow the bytes alongside `&mut EventLoop`.
    let mut buf = lp.take_recv_scratch();
    let flow = recv_loop(lp, sid, &mut buf, error, eof);
    lp.put_recv_scratch(buf);
    flow
}

fn recv_loop(
    lp: &mut EventLoop,
    sid: SocketId,
    buf: &mut [u8],
    error: bool,
    eof: &mut bool,
) -> Flow {
    let padding = lp.cfg.recv_buffer_padding;
    let len = lp.cfg.recv_buffer_len;
    let mut repeat_recv_count = 0usize;
    let mut left_data_buffered = false;

    loop {
        let Some(socket) = lp.socket(sid) else {
            return Flow::Abort;
        };
        if socket.is_closed {
            break;
        }
        let fd = socket.fd;
        let is_ipc = socket.is_ipc;

        let received = if is_ipc {
            match net::recv_with_fd(fd, &mut buf[padding..padding + len]) {
                Ok((n, passed_fd)) => {
                    if let Some(passed_fd) = passed_fd {
                        // The descriptor is delivered before the payload
                        // bytes of the same message.
                        match lp.socket_events(sid) {
                            Some(events) => events.on_fd(lp, sid, passed_fd),
                            None => net::close_fd(passed_fd),
                        }
                        if !lp.socket_alive(sid) {
                            break;
                        }
                    }
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        } else {
            net::recv(fd, &mut buf[padding..padding + len])
        };

        match received {
            Ok(0) => {
                // Handle EOF in one place, after the loop.
                *eof = true;
                break;
            }
            Ok(n) => {
                if let Some(events) = lp.socket_events(sid) {
                    events.on_data(lp, sid, &mut buf[padding..padding + n]);
                }
                if !lp.socket_alive(sid) {
                    break;
                }
                let nearly_full = n >= len.saturating_sub(REPEAT_RECV_SLACK);
                if nearly_full && !error {
                    repeat_recv_count += 1;
                }
                if should_repeat_recv(n, len, error, lp.num_ready_polls, repeat_recv_count) {
                    continue;
                }
                left_data_buffered = nearly_full;
                break;
            }
            Err(e) if net::would_block(&e) => break,
            Err(_) => {
                lp.socket_close(sid, CloseReason::Generic);
                return Flow::Abort;
            }
        }
    }

    // The poller is edge-triggered: data we deliberately left in the
    // kernel buffer will not produce another event on its own, so re-state
    // interest to queue one.
    if left_data_buffered && lp.socket_alive(sid) {
        let interest = lp.socket(sid).map(|s| s.interest).unwrap_or_default();
        if interest.contains(Interest::READABLE) {
            lp.poll_change(sid, interest);
        }
    }
    Flow::Continue
}

/// Rare case: a nearly full read means more is probably waiting, and
/// either the peer hung up (the error flag) or the loop is quiet enough to
/// read again right away. Capped at 10 consecutive reads when other polls
/// are waiting, so one firehose socket never starves the rest.
fn should_repeat_recv(
    n: usize,
    len: usize,
    error: bool,
    num_ready_polls: usize,
    repeats: usize,
) -> bool {
    if n < len.saturating_sub(REPEAT_RECV_SLACK) {
        return false;
    }
    if !(error || num_ready_polls < NOT_BUSY_THRESHOLD) {
        return false;
    }
    !(repeats > MAX_REPEAT_RECV && num_ready_polls > 2)
}

fn dispatch_udp(lp: &mut EventLoop, index: usize, ev: PollEvent) {
    let Some(udp) = lp.udp_sockets.get(index) else {
        return;
    };
    if udp.closed {
        return;
    }
    let uid = UdpId::new(index, udp.generation);
    let mut error = ev.error;

    if ev.readable {
        let mut buf = lp.take_recv_scratch();
        let padding = lp.cfg.recv_buffer_padding;
        let len = lp.cfg.recv_buffer_len;
        let batch_max = lp.cfg.udp_batch;

        loop {
            let Some(udp) = lp.udp_ref(uid) else {
                break;
            };
            if udp.closed {
                break;
            }
            let fd = udp.fd;
            let events = udp.events.clone();

            match net::udp_recv_batch(fd, &mut buf[padding..padding + len], batch_max) {
                Ok(datagrams) if !datagrams.is_empty() => {
                    let batch = UdpBatch {
                        buf: &buf[padding..padding + len],
                        datagrams: &datagrams,
                    };
                    events.on_data(lp, uid, &batch);
                }
                // Zero datagrams: drained.
                Ok(_) => break,
                Err(e) if net::would_block(&e) => break,
                Err(e) => {
                    debug!(udp = uid.index(), "udp recv failed: {e}");
                    error = true;
                    break;
                }
            }
        }
        lp.put_recv_scratch(buf);
    }

    let closed = lp.udp_ref(uid).map(|u| u.closed).unwrap_or(true);
    if ev.writable && !error && !closed {
        let events = lp.udp_ref(uid).expect("checked above").events.clone();
        events.on_drain(lp, uid);
        // Writability is only armed after a blocked send, and one drain
        // notification per block; otherwise every iteration would report
        // writable.
        if let Some(udp) = lp.udp_ref(uid)
            && !udp.closed
        {
            let interest = udp.interest;
            lp.udp_poll_change(uid, interest & Interest::READABLE);
        }
    }

    let closed = lp.udp_ref(uid).map(|u| u.closed).unwrap_or(true);
    if error && !closed {
        lp.udp_close(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEN: usize = 512 * 1024;

    #[test]
    fn test_full_read_repeats_when_quiet() {
        assert!(should_repeat_recv(LEN, LEN, false, 1, 1));
    }

    #[test]
    fn test_read_below_slack_margin_never_repeats() {
        assert!(!should_repeat_recv(LEN - 24 * 1024 - 1, LEN, false, 1, 1));
        // The margin boundary itself still counts.
        assert!(should_repeat_recv(LEN - 24 * 1024, LEN, false, 1, 1));
    }

    #[test]
    fn test_busy_loop_suppresses_repeat() {
        assert!(!should_repeat_recv(LEN, LEN, false, NOT_BUSY_THRESHOLD, 1));
        // Unless the peer hung up; then we drain regardless.
        assert!(should_repeat_recv(LEN, LEN, true, NOT_BUSY_THRESHOLD, 1));
    }

    #[test]
    fn test_repeat_cap_applies_only_with_other_polls_waiting() {
        assert!(!should_repeat_recv(LEN, LEN, false, 3, MAX_REPEAT_RECV + 1));
        // With (almost) nothing else ready, keep draining.
        assert!(should_repeat_recv(LEN, LEN, false, 2, MAX_REPEAT_RECV + 1));
    }
}
