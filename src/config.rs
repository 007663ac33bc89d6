use anyhow::bail;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Size of the TT header pushed between the MAC header and the payload.
pub const TT_HLEN: usize = 4;

pub struct TtConfig {
    /// UDP destination port that marks a datagram as TRDP process data. The
    ///  first two bytes of the UDP payload of such a datagram are the flow id.
    pub trdp_udp_port: u16,

    /// EtherType of native TT frames. The default is from the IEEE 802 local
    ///  experimental range; deployments that standardize on a different value
    ///  configure it here, and both classification and header push use it.
    pub tt_ethertype: u16,

    /// Floor capacity of the per-port flow tables. Tables never shrink below
    ///  this, and a fresh table starts at this size.
    pub min_table_capacity: u16,

    /// Maximum number of flows a single table-assembly session may announce.
    pub max_flows: u16,

    /// How much earlier than the true instant the schedule timer fires. The
    ///  handler spins away the remaining slack against the wall clock, which
    ///  aligns emission more tightly than the timer alone can.
    pub default_advance_time: Duration,

    /// Per-port overrides for the pre-arm slack.
    pub port_advance_times: FxHashMap<u32, Duration>,
}

impl TtConfig {
    /// Defaults for a TRDP deployment: process data on UDP port 17224,
    ///  TT frames on EtherType 0x88b5.
    pub fn default_trdp() -> TtConfig {
        TtConfig {
            trdp_udp_port: 17224,
            tt_ethertype: 0x88b5,
            min_table_capacity: 4,
            max_flows: 255,
            default_advance_time: Duration::from_micros(500),
            port_advance_times: FxHashMap::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_table_capacity == 0 {
            bail!("flow table floor capacity must be at least 1");
        }
        if self.max_flows == 0 {
            bail!("max_flows must be at least 1");
        }
        if self.default_advance_time.is_zero() {
            bail!("advance time must be positive, the handler needs slack to align against");
        }
        Ok(())
    }

    pub fn effective_advance_time(&self, port_no: u32) -> Duration {
        self.port_advance_times
            .get(&port_no)
            .copied()
            .unwrap_or(self.default_advance_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(TtConfig::default_trdp().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let mut config = TtConfig::default_trdp();
        config.min_table_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = TtConfig::default_trdp();
        config.max_flows = 0;
        assert!(config.validate().is_err());

        let mut config = TtConfig::default_trdp();
        config.default_advance_time = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_per_port_advance_time() {
        let mut config = TtConfig::default_trdp();
        config.port_advance_times.insert(7, Duration::from_micros(50));

        assert_eq!(config.effective_advance_time(7), Duration::from_micros(50));
        assert_eq!(config.effective_advance_time(8), Duration::from_micros(500));
    }
}
