//! Real DNS resolution for custom-domain verification.
//!
//! NXDOMAIN / no-records answers resolve to an empty record set rather
//! than an error: the caller reports those as record mismatches (with the
//! empty `found` list), which is the actionable message for a site owner
//! who has not published the records yet. Transport-level failures stay
//! errors.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;

use opticdata_core::dns::{DnsLookupError, DnsResolver};

pub struct HickoryDnsResolver {
    resolver: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    /// Resolver against the default public configuration. Infallible, so
    /// startup cannot be wedged by an unreadable /etc/resolv.conf.
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn no_records(kind: &ResolveErrorKind) -> bool {
    matches!(kind, ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl DnsResolver for HickoryDnsResolver {
    async fn lookup_a(&self, host: &str) -> Result<Vec<IpAddr>, DnsLookupError> {
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) if no_records(e.kind()) => Ok(Vec::new()),
            Err(e) => Err(DnsLookupError {
                host: host.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn lookup_txt(&self, host: &str) -> Result<Vec<String>, DnsLookupError> {
        match self.resolver.txt_lookup(host).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|segment| String::from_utf8_lossy(segment).into_owned())
                        .collect::<Vec<_>>()
                        .concat()
                })
                .collect()),
            Err(e) if no_records(e.kind()) => Ok(Vec::new()),
            Err(e) => Err(DnsLookupError {
                host: host.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
