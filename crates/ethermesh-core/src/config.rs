//! Core timing configuration
//!
//! All intervals are milliseconds. Defaults match the protocol constants;
//! tests tighten them to keep timeout scenarios fast.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Switch timing knobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Delay between WHOIS retries to successive roots
    pub whois_retry_delay: i64,

    /// WHOIS sends before the request is abandoned
    pub max_whois_retries: u8,

    /// Age at which a packet waiting for peer resolution is dropped
    pub transmit_queue_timeout: i64,

    /// Age at which a received packet blocked on a missing peer is dropped
    pub receive_queue_timeout: i64,

    /// Age at which an incomplete reassembly is discarded
    pub fragmented_packet_receive_timeout: i64,

    /// Minimum spacing between rendezvous introductions for any pair
    pub min_unite_interval: i64,

    /// Window within which a path counts as actively direct
    pub path_activity_timeout: i64,

    /// Floor on the delay suggested by the periodic tick
    pub timer_min_delay: i64,

    /// Ceiling on the suggested delay, so queue age-outs run even when
    /// nothing is scheduled
    pub timer_max_delay: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            whois_retry_delay: 500,
            max_whois_retries: 4,
            transmit_queue_timeout: 5_000,
            receive_queue_timeout: 5_000,
            fragmented_packet_receive_timeout: 1_000,
            min_unite_interval: 30_000,
            path_activity_timeout: 45_000,
            timer_min_delay: 10,
            timer_max_delay: 1_000,
        }
    }
}

impl CoreConfig {
    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_whois_retries == 0 {
            return Err(CoreError::InvalidConfig(
                "max_whois_retries must be at least 1".into(),
            ));
        }
        if self.timer_min_delay <= 0 || self.timer_max_delay < self.timer_min_delay {
            return Err(CoreError::InvalidConfig(
                "timer delay bounds must be positive and ordered".into(),
            ));
        }
        for (name, v) in [
            ("whois_retry_delay", self.whois_retry_delay),
            ("transmit_queue_timeout", self.transmit_queue_timeout),
            ("receive_queue_timeout", self.receive_queue_timeout),
            (
                "fragmented_packet_receive_timeout",
                self.fragmented_packet_receive_timeout,
            ),
            ("min_unite_interval", self.min_unite_interval),
            ("path_activity_timeout", self.path_activity_timeout),
        ] {
            if v <= 0 {
                return Err(CoreError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_config_rejected() {
        let mut c = CoreConfig::default();
        c.max_whois_retries = 0;
        assert!(c.validate().is_err());

        let mut c = CoreConfig::default();
        c.timer_max_delay = 1;
        assert!(c.validate().is_err());

        let mut c = CoreConfig::default();
        c.min_unite_interval = 0;
        assert!(c.validate().is_err());
    }
}
