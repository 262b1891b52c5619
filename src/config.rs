//! Bundle and link configuration.
//!
//! A configuration is validated as a whole before it is committed to a
//! bundle. Static checks (ranges, minimum MRU/MRRU) live in
//! [`NodeConfig::validate`]; checks that depend on the live bundle (mode
//! changes while links are active) live in [`check_transition`]. A rejected
//! configuration leaves the bundle untouched.
//!
//! # Example
//!
//! ```
//! use ppp_multilink::config::{LinkConfig, NodeConfig};
//!
//! let config = NodeConfig::multilink(vec![
//!     LinkConfig::enabled(800, 10),
//!     LinkConfig::enabled(800, 10),
//! ]);
//! assert!(config.validate().is_ok());
//! ```

use crate::sequence::SeqMode;
use serde::{Deserialize, Serialize};

/// Maximum number of links in a bundle.
pub const MAX_LINKS: usize = 16;

/// Smallest MRU accepted on an enabled link.
pub const MIN_LINK_MRU: u16 = 32;

/// Smallest MRRU accepted when multilink is enabled (RFC 1990).
pub const MIN_MRRU: u16 = 1500;

/// Default link MRU.
pub const DEFAULT_MRU: u16 = 1500;

/// Default peer MRRU.
pub const DEFAULT_MRRU: u16 = 1600;

/// Largest bandwidth accepted, in units of 10 bytes/sec.
pub const MAX_BANDWIDTH: u32 = 1_000_000;

/// Default bandwidth, in units of 10 bytes/sec (64 kbit/s).
pub const DEFAULT_BANDWIDTH: u32 = 800;

/// Largest link latency accepted, in milliseconds.
pub const MAX_LATENCY_MS: u32 = 1000;

/// Per-link configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Whether the link may carry traffic.
    pub enabled: bool,
    /// Maximum receive unit of the peer on this link.
    pub mru: u16,
    /// Bandwidth in units of 10 bytes/sec.
    pub bandwidth: u32,
    /// One-way latency in milliseconds.
    pub latency_ms: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mru: DEFAULT_MRU,
            bandwidth: DEFAULT_BANDWIDTH,
            latency_ms: 0,
        }
    }
}

impl LinkConfig {
    /// Enabled link with the given bandwidth (10 bytes/sec units) and latency.
    pub fn enabled(bandwidth: u32, latency_ms: u32) -> Self {
        Self {
            enabled: true,
            bandwidth,
            latency_ms,
            ..Default::default()
        }
    }

    /// Same link with a different MRU.
    pub fn with_mru(self, mru: u16) -> Self {
        Self { mru, ..self }
    }

    fn validate(&self, link: usize) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.mru < MIN_LINK_MRU {
            return Err(ConfigError::LinkMruTooSmall {
                link,
                mru: self.mru,
                min: MIN_LINK_MRU,
            });
        }
        if self.bandwidth == 0 {
            return Err(ConfigError::ZeroBandwidth { link });
        }
        if self.bandwidth > MAX_BANDWIDTH {
            return Err(ConfigError::BandwidthTooHigh {
                link,
                bandwidth: self.bandwidth,
                max: MAX_BANDWIDTH,
            });
        }
        if self.latency_ms > MAX_LATENCY_MS {
            return Err(ConfigError::LatencyTooHigh {
                link,
                latency_ms: self.latency_ms,
                max: MAX_LATENCY_MS,
            });
        }
        Ok(())
    }
}

/// Bundle-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Multilink negotiated and enabled.
    pub enable_multilink: bool,
    /// Peer's maximum reconstructed receive unit.
    pub mrru: u16,
    /// Transmit with 12-bit sequence numbers.
    pub xmit_short_seq: bool,
    /// Receive with 12-bit sequence numbers.
    pub recv_short_seq: bool,
    /// Send whole datagrams on one link at a time.
    pub enable_round_robin: bool,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            enable_multilink: false,
            mrru: DEFAULT_MRRU,
            xmit_short_seq: false,
            recv_short_seq: false,
            enable_round_robin: false,
        }
    }
}

impl BundleConfig {
    /// Sequence width for outbound fragments.
    pub fn xmit_mode(&self) -> SeqMode {
        SeqMode::from_short(self.xmit_short_seq)
    }

    /// Sequence width for inbound fragments.
    pub fn recv_mode(&self) -> SeqMode {
        SeqMode::from_short(self.recv_short_seq)
    }
}

/// Complete configuration of a bundle and its links.
///
/// The index of a link in `links` is its link id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bundle parameters.
    pub bundle: BundleConfig,
    /// Link parameters, indexed by link id.
    pub links: Vec<LinkConfig>,
}

impl NodeConfig {
    /// Multilink configuration with default bundle parameters.
    pub fn multilink(links: Vec<LinkConfig>) -> Self {
        Self {
            bundle: BundleConfig {
                enable_multilink: true,
                ..Default::default()
            },
            links,
        }
    }

    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Number of links enabled in this configuration.
    pub fn enabled_links(&self) -> usize {
        self.links.iter().filter(|l| l.enabled).count()
    }

    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.links.len() > MAX_LINKS {
            return Err(ConfigError::TooManyLinks {
                count: self.links.len(),
                max: MAX_LINKS,
            });
        }
        for (link, conf) in self.links.iter().enumerate() {
            conf.validate(link)?;
        }
        if self.bundle.enable_multilink && self.bundle.mrru < MIN_MRRU {
            return Err(ConfigError::MrruTooSmall {
                mrru: self.bundle.mrru,
                min: MIN_MRRU,
            });
        }
        Ok(())
    }
}

/// Validate moving a bundle from `current` to `next`.
///
/// `active_now` is the number of links active under `current`; `active_next`
/// the number that would be active under `next` given the links attached
/// today. Multilink mode and sequence widths may only change while the
/// bundle is idle on one side of the change.
pub fn check_transition(
    current: &NodeConfig,
    active_now: usize,
    next: &NodeConfig,
    active_next: usize,
) -> Result<(), ConfigError> {
    next.validate()?;

    if active_now > 0 && active_next > 0 {
        let (cur, new) = (&current.bundle, &next.bundle);
        if cur.enable_multilink != new.enable_multilink {
            return Err(ConfigError::ChangeWhileActive("enable_multilink"));
        }
        if cur.xmit_short_seq != new.xmit_short_seq {
            return Err(ConfigError::ChangeWhileActive("xmit_short_seq"));
        }
        if cur.recv_short_seq != new.recv_short_seq {
            return Err(ConfigError::ChangeWhileActive("recv_short_seq"));
        }
    }

    if !next.bundle.enable_multilink && active_next > 1 {
        return Err(ConfigError::TooManyActiveLinks {
            active: active_next,
        });
    }
    Ok(())
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// More links than a bundle supports.
    TooManyLinks { count: usize, max: usize },
    /// Enabled link MRU below the minimum.
    LinkMruTooSmall { link: usize, mru: u16, min: u16 },
    /// Enabled link with zero bandwidth.
    ZeroBandwidth { link: usize },
    /// Enabled link bandwidth above the maximum.
    BandwidthTooHigh { link: usize, bandwidth: u32, max: u32 },
    /// Enabled link latency above the maximum.
    LatencyTooHigh {
        link: usize,
        latency_ms: u32,
        max: u32,
    },
    /// MRRU below the multilink minimum.
    MrruTooSmall { mrru: u16, min: u16 },
    /// A mode field changed while links are active.
    ChangeWhileActive(&'static str),
    /// More than one active link without multilink.
    TooManyActiveLinks { active: usize },
    /// Configuration text could not be parsed.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooManyLinks { count, max } => {
                write!(f, "too many links ({}, max {})", count, max)
            }
            Self::LinkMruTooSmall { link, mru, min } => {
                write!(f, "link {}: MRU {} below minimum {}", link, mru, min)
            }
            Self::ZeroBandwidth { link } => write!(f, "link {}: bandwidth must be > 0", link),
            Self::BandwidthTooHigh {
                link,
                bandwidth,
                max,
            } => write!(f, "link {}: bandwidth {} above maximum {}", link, bandwidth, max),
            Self::LatencyTooHigh {
                link,
                latency_ms,
                max,
            } => write!(
                f,
                "link {}: latency {}ms above maximum {}ms",
                link, latency_ms, max
            ),
            Self::MrruTooSmall { mrru, min } => {
                write!(f, "MRRU {} below multilink minimum {}", mrru, min)
            }
            Self::ChangeWhileActive(field) => {
                write!(f, "cannot change {} while links are active", field)
            }
            Self::TooManyActiveLinks { active } => write!(
                f,
                "{} links active but multilink is disabled (max 1)",
                active
            ),
            Self::Parse(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_links() -> NodeConfig {
        NodeConfig::multilink(vec![LinkConfig::enabled(100, 0), LinkConfig::enabled(100, 0)])
    }

    #[test]
    fn test_defaults() {
        let link = LinkConfig::default();
        assert!(!link.enabled);
        assert_eq!(link.mru, DEFAULT_MRU);

        let bundle = BundleConfig::default();
        assert!(!bundle.enable_multilink);
        assert_eq!(bundle.mrru, DEFAULT_MRRU);
        assert_eq!(bundle.xmit_mode(), SeqMode::Long);
        assert_eq!(bundle.recv_mode(), SeqMode::Long);
    }

    #[test]
    fn test_valid_config() {
        assert!(two_links().validate().is_ok());
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_disabled_link_not_checked() {
        let mut config = two_links();
        config.links.push(LinkConfig {
            enabled: false,
            mru: 0,
            bandwidth: 0,
            latency_ms: 99_999,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_link_mru_too_small() {
        let mut config = two_links();
        config.links[1].mru = MIN_LINK_MRU - 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::LinkMruTooSmall {
                link: 1,
                mru: 31,
                min: 32
            })
        );
    }

    #[test]
    fn test_bandwidth_bounds() {
        let mut config = two_links();
        config.links[0].bandwidth = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBandwidth { link: 0 }));

        config.links[0].bandwidth = MAX_BANDWIDTH + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BandwidthTooHigh { link: 0, .. })
        ));

        config.links[0].bandwidth = MAX_BANDWIDTH;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_latency_bound() {
        let mut config = two_links();
        config.links[1].latency_ms = MAX_LATENCY_MS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LatencyTooHigh { link: 1, .. })
        ));
    }

    #[test]
    fn test_mrru_minimum_only_with_multilink() {
        let mut config = two_links();
        config.bundle.mrru = MIN_MRRU - 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MrruTooSmall {
                mrru: 1499,
                min: 1500
            })
        );

        config.bundle.enable_multilink = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_too_many_links() {
        let config = NodeConfig::multilink(vec![LinkConfig::default(); MAX_LINKS + 1]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyLinks { count: 17, max: 16 })
        ));
    }

    #[test]
    fn test_transition_mode_change_while_active() {
        let current = two_links();
        let mut next = current.clone();
        next.bundle.recv_short_seq = true;

        assert_eq!(
            check_transition(&current, 2, &next, 2),
            Err(ConfigError::ChangeWhileActive("recv_short_seq"))
        );
        // Allowed when the bundle is idle before or after the change
        assert!(check_transition(&current, 0, &next, 2).is_ok());
        assert!(check_transition(&current, 2, &next, 0).is_ok());
    }

    #[test]
    fn test_transition_disable_multilink_while_active() {
        let current = two_links();
        let mut next = current.clone();
        next.bundle.enable_multilink = false;
        assert_eq!(
            check_transition(&current, 2, &next, 2),
            Err(ConfigError::ChangeWhileActive("enable_multilink"))
        );
    }

    #[test]
    fn test_transition_multiple_links_without_multilink() {
        let mut next = two_links();
        next.bundle.enable_multilink = false;
        assert_eq!(
            check_transition(&NodeConfig::default(), 0, &next, 2),
            Err(ConfigError::TooManyActiveLinks { active: 2 })
        );
        assert!(check_transition(&NodeConfig::default(), 0, &next, 1).is_ok());
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "bundle": { "enable_multilink": true, "xmit_short_seq": true },
            "links": [
                { "enabled": true, "bandwidth": 100, "latency_ms": 5 },
                { "enabled": true, "bandwidth": 200 }
            ]
        }"#;
        let config = NodeConfig::from_json(json).unwrap();
        assert!(config.bundle.enable_multilink);
        assert_eq!(config.bundle.xmit_mode(), SeqMode::Short);
        assert_eq!(config.bundle.mrru, DEFAULT_MRRU);
        assert_eq!(config.links[1].mru, DEFAULT_MRU);
        assert_eq!(config.links[1].latency_ms, 0);
        assert_eq!(config.enabled_links(), 2);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            NodeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        let zero_bw = r#"{ "links": [ { "enabled": true, "bandwidth": 0 } ] }"#;
        assert_eq!(
            NodeConfig::from_json(zero_bw),
            Err(ConfigError::ZeroBandwidth { link: 0 })
        );
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::ChangeWhileActive("xmit_short_seq");
        assert_eq!(
            err.to_string(),
            "cannot change xmit_short_seq while links are active"
        );
    }
}
