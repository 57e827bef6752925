//! DNS plumbing for enrichment lookups.
//!
//! Lookups go through the [`DnsClient`] trait so the enrichment pipeline
//! can be exercised hermetically; [`SystemDns`] is the production
//! implementation.

use crate::{TraceError, TraceResult};

use hickory_resolver::Resolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use tracing::debug;

use std::net::IpAddr;
use std::time::Duration;

/// The queries the enrichment pipeline needs.
pub trait DnsClient: Send + Sync {
    /// All TXT strings under `name`, or `None` on failure or no answer.
    fn txt_lookup(&self, name: &str) -> Option<Vec<String>>;

    /// The PTR name of `addr` via in-addr.arpa / ip6.arpa.
    fn ptr_lookup(&self, addr: IpAddr) -> Option<String>;
}

/// A blocking resolver using the system DNS configuration.
pub struct SystemDns {
    resolver: Resolver,
}

impl SystemDns {
    /// Build a resolver whose queries give up after `timeout`.
    pub fn new(timeout: Duration) -> TraceResult<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        let resolver =
            Resolver::new(ResolverConfig::default(), opts).map_err(TraceError::Io)?;
        Ok(Self { resolver })
    }
}

impl DnsClient for SystemDns {
    fn txt_lookup(&self, name: &str) -> Option<Vec<String>> {
        match self.resolver.txt_lookup(name) {
            Ok(lookup) => Some(
                lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part).into_owned())
                            .collect::<String>()
                    })
                    .collect(),
            ),
            Err(e) => {
                debug!(name, %e, "txt lookup failed");
                None
            }
        }
    }

    fn ptr_lookup(&self, addr: IpAddr) -> Option<String> {
        match self.resolver.reverse_lookup(addr) {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
            Err(e) => {
                debug!(%addr, %e, "ptr lookup failed");
                None
            }
        }
    }
}
