use anyhow::bail;
use crate::engine::segment::SEGMENT_HEADER_LEN;

pub const DEFAULT_MTU: usize = 1400;
pub const DEFAULT_SEND_WINDOW: u16 = 32;
/// This is also the lower bound for the receive window: it must hold all fragments of the
///  largest permitted packet
pub const MIN_RECEIVE_WINDOW: u16 = 128;
pub const DEFAULT_INTERVAL_MILLIS: u32 = 100;
pub const MIN_INTERVAL_MILLIS: u32 = 10;
pub const MAX_INTERVAL_MILLIS: u32 = 5000;
pub const DEFAULT_DEAD_LINK: u32 = 20;
pub const DEFAULT_FAST_RESEND_LIMIT: u32 = 5;
pub const MIN_MTU: usize = 50;
/// largest payload a UDP datagram can carry over IPV6 without jumbograms
pub const MAX_MTU: usize = u16::MAX as usize;

/// Engine tunables. `Default` gives the engine's defaults, which is what `Session::new` uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KcpConfig {
    /// Maximum size of a frame handed to the output function, including segment headers. Packets
    ///  bigger than `mtu - 24` are split into several segments by the engine.
    ///
    /// This should not exceed the payload size the datagram transport can carry without
    ///  fragmentation, e.g. `1500 - 20 - 8 = 1472` for UDP over IPV4 with full Ethernet frames.
    pub mtu: usize,

    /// Maximum number of segments in flight, i.e. sent but not yet acknowledged. A small send
    ///  window throttles throughput on links with a high bandwidth-delay product.
    pub send_window: u16,

    /// Maximum number of segments the receiver buffers. Values below 128 are raised to 128.
    pub receive_window: u16,

    /// Nodelay mode lowers the minimum retransmission timeout and backs off more gently
    pub nodelay: bool,

    /// Interval of the engine's internal flush timer, clamped to 10..=5000 ms
    pub interval_millis: u32,

    /// Number of acknowledgements skipping a segment that triggers its fast retransmission. 0
    ///  disables fast retransmission.
    pub fast_resend: u32,

    pub congestion_control: bool,

    /// A segment transmitted this many times without acknowledgement marks the link as dead.
    ///  This is informational only, the engine keeps retransmitting.
    pub dead_link: u32,

    /// Upper bound for the number of fast retransmissions of a single segment. 0 means no limit.
    pub fast_resend_limit: u32,
}

impl Default for KcpConfig {
    fn default() -> Self {
        KcpConfig {
            mtu: DEFAULT_MTU,
            send_window: DEFAULT_SEND_WINDOW,
            receive_window: MIN_RECEIVE_WINDOW,
            nodelay: false,
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            fast_resend: 0,
            congestion_control: true,
            dead_link: DEFAULT_DEAD_LINK,
            fast_resend_limit: DEFAULT_FAST_RESEND_LIMIT,
        }
    }
}

impl KcpConfig {
    /// Low latency profile: nodelay, 10 ms interval, fast resend after two skipping acks, no
    ///  congestion control
    pub fn fastest() -> KcpConfig {
        KcpConfig {
            nodelay: true,
            interval_millis: 10,
            fast_resend: 2,
            congestion_control: false,
            ..KcpConfig::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < MIN_MTU || self.mtu < SEGMENT_HEADER_LEN {
            bail!("MTU of {} is too small, must be at least {}", self.mtu, MIN_MTU);
        }
        if self.mtu > MAX_MTU {
            bail!("MTU of {} is too big, must be at most {}", self.mtu, MAX_MTU);
        }
        if self.send_window == 0 {
            bail!("send window must not be zero");
        }
        if self.receive_window == 0 {
            bail!("receive window must not be zero");
        }
        if self.interval_millis < MIN_INTERVAL_MILLIS || self.interval_millis > MAX_INTERVAL_MILLIS {
            bail!("interval of {} ms is out of range {}..={}", self.interval_millis, MIN_INTERVAL_MILLIS, MAX_INTERVAL_MILLIS);
        }
        if self.dead_link == 0 {
            bail!("dead link threshold must not be zero");
        }

        Ok(())
    }

    pub fn nodelay_params(&self) -> NodelayParams {
        NodelayParams {
            nodelay: Some(self.nodelay),
            interval_millis: Some(self.interval_millis),
            fast_resend: Some(self.fast_resend),
            congestion_control: Some(self.congestion_control),
        }
    }
}

/// Arguments for the engine's combined 'nodelay' call. `None` leaves the corresponding
///  setting unchanged, which is how the single-purpose setters on `Session` touch one
///  parameter at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodelayParams {
    pub nodelay: Option<bool>,
    pub interval_millis: Option<u32>,
    pub fast_resend: Option<u32>,
    pub congestion_control: Option<bool>,
}

impl NodelayParams {
    pub const UNCHANGED: NodelayParams = NodelayParams {
        nodelay: None,
        interval_millis: None,
        fast_resend: None,
        congestion_control: None,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(KcpConfig::default().validate().is_ok());
        assert!(KcpConfig::fastest().validate().is_ok());
    }

    #[rstest]
    #[case::mtu_too_small(KcpConfig { mtu: 49, ..KcpConfig::default() })]
    #[case::mtu_too_big(KcpConfig { mtu: MAX_MTU + 1, ..KcpConfig::default() })]
    #[case::zero_send_window(KcpConfig { send_window: 0, ..KcpConfig::default() })]
    #[case::zero_receive_window(KcpConfig { receive_window: 0, ..KcpConfig::default() })]
    #[case::interval_too_small(KcpConfig { interval_millis: 9, ..KcpConfig::default() })]
    #[case::interval_too_big(KcpConfig { interval_millis: 5001, ..KcpConfig::default() })]
    #[case::zero_dead_link(KcpConfig { dead_link: 0, ..KcpConfig::default() })]
    fn test_validate_rejects(#[case] config: KcpConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nodelay_params() {
        let params = KcpConfig::fastest().nodelay_params();
        assert_eq!(params, NodelayParams {
            nodelay: Some(true),
            interval_millis: Some(10),
            fast_resend: Some(2),
            congestion_control: Some(false),
        });
    }
}
