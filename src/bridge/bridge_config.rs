use anyhow::bail;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// maximum number of bytes read from the left pipe in a single `recv()`. If the left pipe is
    ///  a datagram pipe, this must be at least its maximum datagram size
    pub left_recv_size: usize,
    /// see `left_recv_size`
    pub right_recv_size: usize,
    /// Number of bytes a single activity callback relays in one direction before it yields to
    ///  the reactor and asks to be called again on the next pass.
    pub max_relay_per_event: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            left_recv_size: 8 * 1024,
            right_recv_size: 8 * 1024,
            max_relay_per_event: 64 * 1024,
        }
    }
}

impl BridgeConfig {
    /// the size of the relay buffer, i.e. the larger of the two receive sizes
    pub fn buf_size(&self) -> usize {
        self.left_recv_size.max(self.right_recv_size)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.left_recv_size == 0 || self.right_recv_size == 0 {
            bail!("receive sizes must be positive");
        }
        if self.max_relay_per_event < self.buf_size() {
            bail!("relay budget per event ({}) must be at least the larger receive size ({})", self.max_relay_per_event, self.buf_size());
        }
        Ok(())
    }
}
