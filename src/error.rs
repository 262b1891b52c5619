//! Error types for the multilink engine.

use crate::config::ConfigError;
use crate::link::LinkId;
use crate::sequence::Seq;

/// Error returned by a link transport when a fragment cannot be sent.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// Malformed or unusable inbound fragment.
///
/// Violations are counted and the fragment is dropped; the bundle keeps
/// running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Frame too short to hold an MP header.
    Runt { len: usize },
    /// A fragment with this sequence number is already queued.
    Duplicate { seq: Seq },
    /// Sequence number is behind the receive low-water mark.
    BehindLowWater { seq: Seq, mseq: Seq },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runt { len } => write!(f, "runt fragment ({} bytes)", len),
            Self::Duplicate { seq } => write!(f, "duplicate fragment seq {}", seq),
            Self::BehindLowWater { seq, mseq } => {
                write!(f, "fragment seq {} is behind MSEQ {}", seq, mseq)
            }
        }
    }
}

/// Errors from bundle operations.
#[derive(Debug)]
pub enum MpError {
    /// Configuration rejected; nothing was applied.
    ConfigurationInvalid(ConfigError),
    /// Memory for a fragment or datagram could not be reserved.
    ResourceExhausted,
    /// Inbound fragment dropped.
    ProtocolViolation(Violation),
    /// No active link to send on.
    LinkDown,
    /// Datagram has no payload.
    EmptyDatagram,
    /// Multilink is not enabled on this bundle.
    MultilinkDisabled,
    /// Link id is out of range or not active.
    UnknownLink(LinkId),
    /// Encoded fragment is larger than the link's MRU.
    FrameTooLarge {
        /// Link the fragment was assigned to.
        link: LinkId,
        /// Frame length including the MP header.
        len: usize,
        /// MRU of the link.
        mru: u16,
    },
    /// The link transport failed to send a fragment.
    Send {
        /// Link the fragment was sent on.
        link: LinkId,
        /// Transport error.
        source: TransportError,
    },
}

impl std::fmt::Display for MpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigurationInvalid(e) => write!(f, "configuration rejected: {}", e),
            Self::ResourceExhausted => write!(f, "out of memory while queuing fragment"),
            Self::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            Self::LinkDown => write!(f, "no active link"),
            Self::EmptyDatagram => write!(f, "cannot fragment empty datagram"),
            Self::MultilinkDisabled => write!(f, "multilink is disabled"),
            Self::UnknownLink(link) => write!(f, "link {} is not active", link),
            Self::FrameTooLarge { link, len, mru } => {
                write!(f, "{} byte frame exceeds link {} MRU {}", len, link, mru)
            }
            Self::Send { link, source } => write!(f, "send on link {} failed: {}", link, source),
        }
    }
}

impl std::error::Error for MpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigurationInvalid(e) => Some(e),
            Self::Send { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<ConfigError> for MpError {
    fn from(e: ConfigError) -> Self {
        Self::ConfigurationInvalid(e)
    }
}

impl From<Violation> for MpError {
    fn from(v: Violation) -> Self {
        Self::ProtocolViolation(v)
    }
}

/// Copy `bytes` into a new buffer, reporting allocation failure instead of
/// aborting.
pub(crate) fn try_copy(bytes: &[u8]) -> Result<Vec<u8>, MpError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes.len())
        .map_err(|_| MpError::ResourceExhausted)?;
    buf.extend_from_slice(bytes);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display() {
        assert_eq!(MpError::LinkDown.to_string(), "no active link");
        assert_eq!(
            MpError::from(Violation::BehindLowWater { seq: 3, mseq: 9 }).to_string(),
            "protocol violation: fragment seq 3 is behind MSEQ 9"
        );
    }

    #[test]
    fn test_source_chain() {
        let err = MpError::from(ConfigError::ZeroBandwidth { link: 2 });
        assert!(err.source().is_some());

        let err = MpError::Send {
            link: 1,
            source: "wire unplugged".into(),
        };
        assert_eq!(err.source().map(|e| e.to_string()), Some("wire unplugged".into()));
        assert!(MpError::ResourceExhausted.source().is_none());
    }
}
