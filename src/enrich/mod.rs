//! Address enrichment: ASN, reverse name, location and exchange
//! classification, with a process-wide de-duplicating cache.
//!
//! Enrichment runs asynchronously to probing: the first time an address
//! appears in a trace the caller asks the [`Enricher`] for its metadata;
//! every result, even an empty one, is cached so each address is resolved
//! at most once per process.

pub mod asn;
pub mod dns;
pub mod geo;
pub mod ix;

pub use asn::{AsnFallback, AsnInfo};
pub use dns::{DnsClient, SystemDns};
pub use ix::{IxEntry, IxTable};

use geo::GeoDb;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// Default bound on the enrichment cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default deadline for the network sub-lookups of one address.
pub const DEFAULT_LOOKUP_DEADLINE: Duration = Duration::from_secs(2);

/// Address-derived metadata. Fields are populated independently; any of
/// them may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Enrichment {
    pub asn: Option<u32>,
    pub as_org: Option<String>,
    pub prefix: Option<String>,
    pub registry: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub ix: Option<String>,
    pub hostname: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold `other` into `self` without overwriting fields already set.
    pub fn merge(&mut self, other: Enrichment) {
        merge_field(&mut self.asn, other.asn);
        merge_field(&mut self.as_org, other.as_org);
        merge_field(&mut self.prefix, other.prefix);
        merge_field(&mut self.registry, other.registry);
        merge_field(&mut self.country, other.country);
        merge_field(&mut self.city, other.city);
        merge_field(&mut self.ix, other.ix);
        merge_field(&mut self.hostname, other.hostname);
    }
}

fn merge_field<T>(field: &mut Option<T>, value: Option<T>) {
    if field.is_none() {
        *field = value;
    }
}

impl From<AsnInfo> for Enrichment {
    fn from(info: AsnInfo) -> Self {
        Self {
            asn: Some(info.asn),
            as_org: info.name,
            prefix: Some(info.prefix),
            registry: Some(info.registry),
            country: (!info.country.is_empty()).then_some(info.country),
            ..Default::default()
        }
    }
}

/// Configuration for an [`Enricher`].
pub struct EnrichOptions {
    /// Disable all network sub-lookups.
    pub offline: bool,
    pub cache_capacity: usize,
    pub lookup_deadline: Duration,
    /// Path to a local MaxMind city database, if one is available.
    pub geoip_path: Option<PathBuf>,
    /// Replacement exchange table; the built-in seed table otherwise.
    pub ix_table: Option<IxTable>,
    /// ASN provider consulted when DNS has no answer.
    pub fallback: Option<Box<dyn AsnFallback>>,
}

impl Default for EnrichOptions {
    fn default() -> Self {
        Self {
            offline: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            lookup_deadline: DEFAULT_LOOKUP_DEADLINE,
            geoip_path: None,
            ix_table: None,
            fallback: None,
        }
    }
}

/// Cache occupancy counters, mirrored from the cache the way the parser
/// exposes its template cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub current_size: usize,
    pub max_size: usize,
    /// Entries discarded by the half-eviction policy.
    pub evictions: u64,
}

/// The enrichment fan-out plus its process-wide cache.
pub struct Enricher {
    dns: Option<Box<dyn DnsClient>>,
    fallback: Option<Box<dyn AsnFallback>>,
    geo: Option<GeoDb>,
    ix: IxTable,
    offline: bool,
    cache: Mutex<LruCache<String, Enrichment>>,
    evictions: AtomicU64,
}

impl Enricher {
    /// Build an enricher around the given DNS client.
    pub fn new(dns: Box<dyn DnsClient>, options: EnrichOptions) -> Self {
        Self::build(Some(dns), options)
    }

    /// Build an enricher around the system resolver, with DNS queries
    /// bounded by the configured lookup deadline.
    pub fn with_system_dns(options: EnrichOptions) -> crate::TraceResult<Self> {
        let dns = SystemDns::new(options.lookup_deadline)?;
        Ok(Self::build(Some(Box::new(dns)), options))
    }

    /// An enricher that performs no network I/O at all.
    pub fn offline() -> Self {
        Self::build(
            None,
            EnrichOptions {
                offline: true,
                ..Default::default()
            },
        )
    }

    fn build(dns: Option<Box<dyn DnsClient>>, options: EnrichOptions) -> Self {
        let geo = options
            .geoip_path
            .as_deref()
            .and_then(GeoDb::open);
        let capacity =
            NonZeroUsize::new(options.cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            dns,
            fallback: options.fallback,
            geo,
            ix: options.ix_table.unwrap_or_else(IxTable::builtin),
            offline: options.offline,
            cache: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up everything known about `addr`.
    ///
    /// Private, loopback, link-local and unique-local addresses
    /// short-circuit to an empty enrichment without touching the network,
    /// as does offline mode. Results, including empty ones, are cached by
    /// address string.
    pub fn lookup(&self, addr: IpAddr) -> Enrichment {
        let key = addr.to_string();
        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }
        let enrichment = if self.offline || is_non_routable(addr) {
            Enrichment::default()
        } else {
            self.resolve(addr)
        };
        self.insert(key, enrichment.clone());
        enrichment
    }

    /// Run the four sub-lookups concurrently and merge their results.
    /// Each sub-lookup is bounded by its client's own deadline; a failed
    /// sub-lookup simply leaves its fields empty.
    fn resolve(&self, addr: IpAddr) -> Enrichment {
        let dns = self.dns.as_deref();
        let (asn, hostname, location, ix) = thread::scope(|scope| {
            let asn = scope
                .spawn(move || dns.and_then(|dns| asn::lookup(dns, self.fallback.as_deref(), addr)));
            let hostname = scope.spawn(move || dns.and_then(|dns| dns.ptr_lookup(addr)));
            let location = scope.spawn(|| {
                self.geo
                    .as_ref()
                    .map_or((None, None), |geo| geo.lookup(addr))
            });
            let ix = scope.spawn(|| self.ix.classify(addr).map(str::to_string));
            (
                asn.join().unwrap_or_default(),
                hostname.join().unwrap_or_default(),
                location.join().unwrap_or_default(),
                ix.join().unwrap_or_default(),
            )
        });
        let mut enrichment = Enrichment::default();
        if let Some(info) = asn {
            enrichment.merge(Enrichment::from(info));
        }
        let (country, city) = location;
        enrichment.merge(Enrichment {
            country,
            city,
            ix,
            hostname,
            ..Default::default()
        });
        debug!(%addr, empty = enrichment.is_empty(), "enrichment resolved");
        enrichment
    }

    fn insert(&self, key: String, enrichment: Enrichment) {
        let mut cache = self.cache.lock();
        let capacity = cache.cap().get();
        if cache.len() >= capacity {
            // Drop the least-recently-used half in one deterministic
            // sweep rather than thrashing entry by entry.
            let to_evict = (capacity / 2).max(1);
            for _ in 0..to_evict {
                if cache.pop_lru().is_none() {
                    break;
                }
            }
            self.evictions.fetch_add(to_evict as u64, Ordering::Relaxed);
        }
        cache.put(key, enrichment);
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            current_size: cache.len(),
            max_size: cache.cap().get(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Addresses that can never have public enrichment: private, loopback,
/// link-local and IPv6 unique-local ranges.
pub fn is_non_routable(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_non_routable(IpAddr::V4(v4)),
            None => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unique_local()
                    || v6.is_unicast_link_local()
            }
        },
    }
}
