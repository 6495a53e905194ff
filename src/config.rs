/// Settings for a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Capacity of the broadcast channel behind event streams. A stream that
    /// falls further behind than this skips the oldest events.
    pub(crate) event_capacity: usize,
    /// Forward characteristic values that arrive without a pending read.
    pub(crate) forward_notifications: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            forward_notifications: true,
        }
    }
}

impl BridgeConfig {
    /// Capacity of each event stream's buffer
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Whether notification and indication values are dispatched as
    /// characteristic read events
    pub fn forward_notifications(mut self, enabled: bool) -> Self {
        self.forward_notifications = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_clamped() {
        let config = BridgeConfig::default().event_capacity(0);

        assert_eq!(config.event_capacity, 1);
    }
}
