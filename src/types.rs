//! Core identifier and flag types for the event loop.

use std::fmt;

/// Opaque TCP socket identifier.
///
/// Handed out on accept, connect completion, or fd adoption, and used to
/// identify the socket in subsequent operations.
///
/// Encodes both a slot index and a generation counter so that a stale id
/// (one whose socket has been closed and its slot reused) is detected
/// rather than misdirecting operations to a new socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SocketId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// Slot index, suitable for indexing into per-socket user arrays.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.index, self.generation)
    }
}

/// Opaque socket context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ContextId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// Slot index of this context.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque identifier for an in-flight outbound connection.
///
/// Lives from `connect()` until the connection either opens (surfacing a
/// [`SocketId`] through `on_open`) or fails (surfacing through
/// `on_connect_error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectingId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnectingId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// Slot index of this connecting socket.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque UDP socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl UdpId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }

    /// Slot index of this UDP socket.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Opaque identifier for an internal callback poll (timer or async handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TimerId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self {
            index: index as u32,
            generation,
        }
    }
}

bitflags::bitflags! {
    /// Readiness interest mask for a poll handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Options for `listen` and `connect`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketOptions: u8 {
        /// Keep the socket open for writing after the peer sends FIN.
        /// The read side closes and `on_end` fires, but the socket stays
        /// writable until closed explicitly.
        const ALLOW_HALF_OPEN = 1 << 0;
        /// Set `SO_REUSEPORT` on the listen socket.
        const REUSE_PORT = 1 << 1;
    }
}

/// Tag carried by every poll handle; dispatch switches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollType {
    /// Internal timer or async wake-up handle.
    Callback,
    /// A socket that is not yet a full socket: a listener (polls READABLE
    /// to accept) or an outbound connect in progress (polls WRITABLE for
    /// completion).
    SemiSocket,
    /// An established TCP socket.
    Socket,
    /// An established TCP socket whose write side has been shut down.
    SocketShutDown,
    /// A UDP socket.
    Udp,
}

/// Why a socket was closed, delivered to `on_close` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// FIN observed in both directions, no unread bytes lost.
    CleanShutdown,
    /// A non-would-block receive/send error or a poller-reported error.
    Generic,
    /// Caller-supplied close code.
    Custom(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id_index_and_eq() {
        let a = SocketId::new(7, 1);
        let b = SocketId::new(7, 1);
        let c = SocketId::new(7, 2);
        assert_eq!(a.index(), 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_socket_id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SocketId::new(1, 0));
        set.insert(SocketId::new(1, 1));
        set.insert(SocketId::new(1, 0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_interest_mask_ops() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert_eq!(both & Interest::READABLE, Interest::READABLE);
        assert!((both & !Interest::WRITABLE & Interest::WRITABLE).is_empty());
    }

    #[test]
    fn test_socket_options_default_empty() {
        assert!(SocketOptions::default().is_empty());
        assert!(SocketOptions::ALLOW_HALF_OPEN.contains(SocketOptions::ALLOW_HALF_OPEN));
    }

    #[test]
    fn test_close_reason_eq() {
        assert_eq!(CloseReason::Custom(42), CloseReason::Custom(42));
        assert_ne!(CloseReason::CleanShutdown, CloseReason::Generic);
    }
}
