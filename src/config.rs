use std::time::Duration;

/// Configuration for an [`EventLoop`](crate::EventLoop).
///
/// The defaults match the wire contracts the loop documents: a 512 KiB
/// receive scratch buffer (the maximum single `on_data` chunk), 4-second
/// timeout granularity, and a budget of 5 low-priority sockets per
/// iteration.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Receive scratch buffer length. This is the largest chunk a single
    /// `on_data` call can deliver.
    pub recv_buffer_len: usize,
    /// Padding reserved on each side of the receive buffer, so protocol
    /// layers can prepend/append framing in place.
    pub recv_buffer_padding: usize,
    /// Send scratch buffer length. Loop-owned, reused across sockets;
    /// contents are not stable across callbacks.
    pub send_buffer_len: usize,
    /// Granularity of the timeout sweep. One sweep tick per this interval;
    /// `socket_timeout` seconds are rounded up to whole ticks. The long
    /// wheel ticks once per 15 of these.
    pub sweep_granularity: Duration,
    /// Maximum number of low-priority sockets admitted to full processing
    /// per loop iteration.
    pub low_prio_budget: u32,
    /// Maximum datagrams received per UDP batch.
    pub udp_batch: usize,
    /// Capacity of the poller's event batch.
    pub event_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            recv_buffer_len: 512 * 1024,
            recv_buffer_padding: 64,
            send_buffer_len: 512 * 1024,
            sweep_granularity: Duration::from_secs(4),
            low_prio_budget: 5,
            udp_batch: 8,
            event_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LoopConfig::default();
        assert_eq!(cfg.recv_buffer_len, 512 * 1024);
        assert_eq!(cfg.recv_buffer_padding, 64);
        assert_eq!(cfg.sweep_granularity, Duration::from_secs(4));
        assert_eq!(cfg.low_prio_budget, 5);
        assert_eq!(cfg.udp_batch, 8);
    }
}
