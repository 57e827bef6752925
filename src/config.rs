//! Trace configuration.

use crate::enrich::EnrichOptions;
use crate::net::prober::ProberSettings;
use crate::protocol::{DEFAULT_BASE_PORT, FamilyPolicy, MAX_PACKET_SIZE, Protocol};
use crate::{TraceError, TraceResult};

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a trace run can be configured with.
///
/// Use [`TraceConfig::builder()`] for ergonomic construction, or
/// [`TraceConfig::default()`] for the standard ICMP trace.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Probe shape.
    pub protocol: Protocol,
    /// Address family selection for target resolution.
    pub family: FamilyPolicy,
    /// Upper TTL bound.
    pub max_hops: u8,
    /// Probes per TTL per cycle.
    pub packets_per_hop: u16,
    /// When non-zero, overrides `packets_per_hop` with one probe per
    /// diversified flow id.
    pub ecmp_flows: u16,
    /// Per-probe deadline.
    pub timeout: Duration,
    /// Inter-cycle delay in continuous mode.
    pub interval: Duration,
    /// Zero for unbounded, otherwise stop after this many cycles.
    pub cycles: u64,
    /// UDP base port or TCP destination port.
    pub port: u16,
    /// Pad probe payloads to this total size.
    pub probe_size: u16,
    /// Set the IPv4 don't-fragment bit and surface Fragmentation-Needed
    /// MTU signals.
    pub discover_mtu: bool,
    /// Run the response-TTL NAT inference heuristics.
    pub detect_nat: bool,
    /// Disable network enrichment.
    pub offline: bool,
    /// ICMP correlation identifier; the low 16 bits of the process id
    /// unless overridden (tests do).
    pub identifier: u16,
    /// Optional MaxMind city database for location enrichment.
    pub geoip_path: Option<PathBuf>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Icmp,
            family: FamilyPolicy::Auto,
            max_hops: 30,
            packets_per_hop: 1,
            ecmp_flows: 0,
            timeout: Duration::from_millis(500),
            interval: Duration::from_secs(1),
            cycles: 0,
            port: DEFAULT_BASE_PORT,
            probe_size: 0,
            discover_mtu: false,
            detect_nat: false,
            offline: false,
            identifier: std::process::id() as u16,
            geoip_path: None,
        }
    }
}

impl TraceConfig {
    pub fn builder() -> TraceConfigBuilder {
        TraceConfigBuilder::default()
    }

    /// The prober settings for a resolved target.
    pub fn prober_settings(&self, target: IpAddr) -> ProberSettings {
        ProberSettings {
            protocol: self.protocol,
            target,
            identifier: self.identifier,
            port: self.port,
            payload_size: self.probe_size,
            timeout: self.timeout,
            discover_mtu: self.discover_mtu,
        }
    }

    /// The enrichment options this trace configuration implies.
    pub fn enrich_options(&self) -> EnrichOptions {
        EnrichOptions {
            offline: self.offline,
            geoip_path: self.geoip_path.clone(),
            ..Default::default()
        }
    }
}

/// Builder for [`TraceConfig`].
///
/// ```rust
/// use path_probe::{Protocol, TraceConfig};
/// use std::time::Duration;
///
/// let config = TraceConfig::builder()
///     .with_protocol(Protocol::Udp)
///     .with_max_hops(20)
///     .with_timeout(Duration::from_millis(250))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(config.max_hops, 20);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TraceConfigBuilder {
    config: TraceConfig,
}

impl TraceConfigBuilder {
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_family(mut self, family: FamilyPolicy) -> Self {
        self.config.family = family;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.config.max_hops = max_hops;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_packets_per_hop(mut self, packets: u16) -> Self {
        self.config.packets_per_hop = packets;
        self
    }

    /// Enable ECMP flow diversification with the given number of flows.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_ecmp_flows(mut self, flows: u16) -> Self {
        self.config.ecmp_flows = flows;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_cycles(mut self, cycles: u64) -> Self {
        self.config.cycles = cycles;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_probe_size(mut self, size: u16) -> Self {
        self.config.probe_size = size;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_mtu_discovery(mut self, enabled: bool) -> Self {
        self.config.discover_mtu = enabled;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_nat_detection(mut self, enabled: bool) -> Self {
        self.config.detect_nat = enabled;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.config.identifier = identifier;
        self
    }

    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_geoip_path(mut self, path: PathBuf) -> Self {
        self.config.geoip_path = Some(path);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> TraceResult<TraceConfig> {
        let config = self.config;
        if config.max_hops == 0 {
            return Err(TraceError::InvalidConfig("max_hops must be at least 1".into()));
        }
        if config.timeout.is_zero() {
            return Err(TraceError::InvalidConfig("timeout must be non-zero".into()));
        }
        if usize::from(config.probe_size) > MAX_PACKET_SIZE {
            return Err(TraceError::InvalidConfig(format!(
                "probe_size {} exceeds the maximum packet size {MAX_PACKET_SIZE}",
                config.probe_size
            )));
        }
        if config.protocol == Protocol::Tcp && config.port == 0 {
            return Err(TraceError::InvalidConfig(
                "tcp probes need a destination port".into(),
            ));
        }
        Ok(config)
    }
}
