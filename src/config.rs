use crate::gap_list::GapPolicy;
use crate::station_token::StationToken;
use anyhow::bail;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of one link session.
///
/// The threshold values are policy, not protocol: the peer does not see them, and the defaults
///  were tuned empirically for one deployment's traffic patterns. They are deliberately exposed
///  here instead of being buried as magic numbers, but revisit them before trusting them for a
///  different network.
pub struct LinkConfig {
    /// the station this session serves; inbound connection requests are validated against it
    pub station_name: String,

    /// creator identity stamped into outgoing frame headers and the ACKNACK frame set label
    pub creator: String,
    /// destination identity stamped into outgoing frame headers and the ACKNACK frame set label
    pub destination: String,

    /// cadence of periodic acknowledgments, independent of data arrival
    pub ack_interval: Duration,

    /// cadence of synchronous gap-snapshot persistence; also written on close
    pub checkpoint_interval: Duration,

    /// no inbound data for this long forces the connection closed; the session then waits for
    ///  the broker's next reopen
    pub liveness_timeout: Duration,

    /// a forward sequence jump beyond this is alarmed as a possible series reset. A long
    ///  telemetry delay produces the same signature, so the jump is flagged, never auto-reset.
    pub large_jump_threshold: u64,

    /// how far below a peer-reported low the local gap state is still considered meaningful
    pub reconcile_lookback: u64,

    /// upper bound on the header's total-length field; larger values are treated as corruption
    pub max_frame_len: u32,

    /// upper bound on the trailer's auth-size field; larger values are treated as corruption
    pub max_auth_len: u32,

    /// where to persist gap snapshots; None disables persistence
    pub snapshot_path: Option<PathBuf>,
}

impl LinkConfig {
    pub fn default_for_station(station_name: &str) -> LinkConfig {
        LinkConfig {
            station_name: station_name.to_string(),
            creator: station_name.to_string(),
            destination: "IDC".to_string(),
            ack_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(600),
            liveness_timeout: Duration::from_secs(300),
            large_jump_threshold: 2000,
            reconcile_lookback: 10_000,
            max_frame_len: 16 * 1024 * 1024,
            max_auth_len: 4096,
            snapshot_path: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        StationToken::new(&self.station_name)?;
        StationToken::new(&self.creator)?;
        StationToken::new(&self.destination)?;

        if self.ack_interval.is_zero() || self.checkpoint_interval.is_zero() {
            bail!("ack and checkpoint intervals must be non-zero");
        }
        if self.liveness_timeout < self.ack_interval {
            bail!("liveness timeout below the ack interval would tear down healthy idle sessions");
        }
        if self.max_frame_len < 52 {
            bail!("maximum frame length {} cannot hold header and trailer", self.max_frame_len);
        }
        if self.large_jump_threshold == 0 || self.reconcile_lookback == 0 {
            bail!("jump threshold and reconcile lookback must be non-zero");
        }
        Ok(())
    }

    pub fn gap_policy(&self) -> GapPolicy {
        GapPolicy {
            large_jump_threshold: self.large_jump_threshold,
            reconcile_lookback: self.reconcile_lookback,
        }
    }

    pub fn creator_token(&self) -> anyhow::Result<StationToken> {
        StationToken::new(&self.creator)
    }

    pub fn destination_token(&self) -> anyhow::Result<StationToken> {
        StationToken::new(&self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(LinkConfig::default_for_station("STA01").validate().is_ok());
    }

    #[test]
    fn test_rejects_unusable_station_name() {
        assert!(LinkConfig::default_for_station("STATION-NAME-TOO-LONG").validate().is_err());
    }

    #[test]
    fn test_rejects_liveness_below_ack_interval() {
        let mut config = LinkConfig::default_for_station("STA01");
        config.liveness_timeout = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let mut config = LinkConfig::default_for_station("STA01");
        config.large_jump_threshold = 0;
        assert!(config.validate().is_err());
    }
}
