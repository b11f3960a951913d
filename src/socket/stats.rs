/// Traffic counters. They only ever grow, and are updated once per successful transfer.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct TrafficStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl TrafficStats {
    pub(crate) fn record_tx(&mut self, num_bytes: usize) {
        self.tx_packets += 1;
        self.tx_bytes += num_bytes as u64;
    }

    pub(crate) fn record_rx(&mut self, num_bytes: usize) {
        self.rx_packets += 1;
        self.rx_bytes += num_bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let mut stats = TrafficStats::default();
        stats.record_tx(10);
        stats.record_tx(5);
        stats.record_rx(7);
        assert_eq!(stats, TrafficStats { rx_packets: 1, tx_packets: 2, rx_bytes: 7, tx_bytes: 15 });
    }
}
