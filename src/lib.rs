#![doc = include_str!("../README.md")]

pub mod cancellation;
pub mod compare;
pub mod config;
pub mod diff;
pub mod enrich;
pub mod net;
pub mod packet;
pub mod protocol;
pub mod resolver;
pub mod stats;
pub mod tracer;

// Re-export the primary surface for convenience.
pub use cancellation::CancelToken;
pub use compare::{Comparison, TraceSource};
pub use config::{TraceConfig, TraceConfigBuilder};
pub use diff::{ChangeDetector, ChangeEvent, ChangeFlags, ChangeThresholds, HopSample};
pub use enrich::{EnrichOptions, Enricher, Enrichment};
pub use net::prober::{ProbeOutcome, Prober, ProberSettings, ProtocolProber};
pub use packet::{MplsLabel, ResponseKind};
pub use protocol::{AddressFamily, FamilyPolicy, Protocol};
pub use resolver::resolve_target;
pub use stats::{HopStats, HopStatsStore};
pub use tracer::continuous::{ContinuousTracer, EventReceiver, EventSender, event_queue};
#[cfg(unix)]
pub use tracer::continuous::{TraceHandle, run_continuous};
pub use tracer::cycle::{CycleTracer, FlowMode};
pub use tracer::{CycleResult, Event, HopRecord, ProbeEvent};

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type TraceResult<T> = Result<T, TraceError>;

/// The error surface of a trace run.
///
/// Only conditions that make further progress impossible are errors;
/// everything else (a lost probe, a malformed response, a failed
/// enrichment sub-lookup) degrades to a partial observation.
#[derive(Debug)]
pub enum TraceError {
    /// A literal target did not match the requested address family.
    FamilyMismatch {
        target: String,
        policy: FamilyPolicy,
    },

    /// A hostname resolved to no addresses at all.
    NoAddress { target: String },

    /// A hostname resolved, but not to any address of the requested
    /// family.
    NoAddressForFamily {
        target: String,
        policy: FamilyPolicy,
    },

    /// Raw sockets are unavailable to this process. Fatal to the run.
    PermissionDenied(io::Error),

    /// The configuration failed validation.
    InvalidConfig(String),

    /// Any other I/O failure on the socket surface.
    Io(io::Error),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::FamilyMismatch { target, policy } => {
                write!(f, "target {target} does not match family policy {policy:?}")
            }
            TraceError::NoAddress { target } => {
                write!(f, "could not resolve any address for {target}")
            }
            TraceError::NoAddressForFamily { target, policy } => {
                write!(f, "no {policy:?} address found for {target}")
            }
            TraceError::PermissionDenied(e) => {
                write!(
                    f,
                    "raw socket unavailable ({e}); run with elevated privileges or grant \
                     CAP_NET_RAW"
                )
            }
            TraceError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            TraceError::Io(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TraceError::PermissionDenied(e) | TraceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_carries_a_remediation_hint() {
        let error = TraceError::PermissionDenied(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(error.to_string().contains("elevated privileges"));
    }

    #[test]
    fn test_error_messages_name_the_target() {
        let error = TraceError::NoAddress {
            target: "nonexistent.example".into(),
        };
        assert!(error.to_string().contains("nonexistent.example"));
    }
}
