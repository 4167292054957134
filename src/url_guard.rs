//! SSRF validation for web capture targets.
//!
//! A target must use http(s), must not name a cloud metadata endpoint, must
//! match the configured domain allowlist and must not resolve into a private,
//! loopback or link-local range.

use crate::CaptureError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, warn};
use url::{Host, Url};

/// Hostnames that reach instance metadata services without a private IP.
const METADATA_HOSTS: &[&str] = &[
    "metadata",
    "metadata.google.internal",
    "metadata.goog",
    "instance-data",
    "instance-data.ec2.internal",
];

const METADATA_ADDRESSES: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    IpAddr::V4(Ipv4Addr::new(169, 254, 170, 2)),
    IpAddr::V4(Ipv4Addr::new(100, 100, 100, 200)),
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0xec2, 0, 0, 0, 0, 0, 0x254)),
];

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver via tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// A hostname tied to the address it was vetted at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPin {
    pub host: String,
    pub address: IpAddr,
}

impl HostPin {
    /// Chrome switch that makes the browser use the vetted address instead
    /// of resolving the host again.
    pub fn chrome_arg(&self) -> String {
        match self.address {
            IpAddr::V4(ip) => format!("--host-resolver-rules=MAP {} {ip}", self.host),
            IpAddr::V6(ip) => format!("--host-resolver-rules=MAP {} [{ip}]", self.host),
        }
    }
}

/// A validated target plus the pin for its hostname, if it has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VettedUrl {
    pub url: Url,
    pub pin: Option<HostPin>,
}

pub struct UrlGuard {
    allowed_domains: Vec<String>,
    resolver: Arc<dyn HostResolver>,
}

impl UrlGuard {
    pub fn new(allowed_domains: &[String], resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            resolver,
        }
    }

    /// Parses and validates a capture target, returning the parsed URL.
    pub async fn validate(&self, raw: &str) -> Result<Url, CaptureError> {
        self.vet(raw).await.map(|vetted| vetted.url)
    }

    /// Like [`UrlGuard::validate`], also returning the checked address for a
    /// domain host so the browser can be pinned to it.
    pub async fn vet(&self, raw: &str) -> Result<VettedUrl, CaptureError> {
        let url = Url::parse(raw)
            .map_err(|e| CaptureError::InvalidRequest(format!("invalid url: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => return Err(reject(&url, format!("scheme '{scheme}' is not allowed"))),
        }

        let host = url
            .host()
            .ok_or_else(|| CaptureError::InvalidRequest("url has no host".to_string()))?;

        match host {
            Host::Ipv4(ip) => check_address(&url, IpAddr::V4(ip))?,
            Host::Ipv6(ip) => check_address(&url, IpAddr::V6(ip))?,
            Host::Domain(domain) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if METADATA_HOSTS.contains(&domain.as_str()) {
                    return Err(reject(&url, "metadata endpoint".to_string()));
                }
            }
        }

        let host_str = url.host_str().unwrap_or_default().trim_end_matches('.');
        if !self.is_domain_allowed(host_str) {
            return Err(reject(&url, "host is not in the domain allowlist".to_string()));
        }

        let mut pin = None;
        if let Some(Host::Domain(domain)) = url.host() {
            let port = url.port_or_known_default().unwrap_or(443);
            let addresses = self.resolver.resolve(domain, port).await.map_err(|e| {
                CaptureError::NavigationFailed(format!("could not resolve {domain}: {e}"))
            })?;

            if addresses.is_empty() {
                return Err(CaptureError::NavigationFailed(format!(
                    "{domain} did not resolve to any address"
                )));
            }
            for address in &addresses {
                check_address(&url, *address)?;
            }
            pin = Some(HostPin {
                host: domain.trim_end_matches('.').to_ascii_lowercase(),
                address: addresses[0],
            });
        }

        debug!(url = %url, pinned = ?pin.as_ref().map(|p| p.address), "Target URL accepted");
        Ok(VettedUrl { url, pin })
    }

    /// True when `host` equals an allowed domain or is a subdomain of one.
    pub fn is_domain_allowed(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.allowed_domains.iter().any(|allowed| {
            host == allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}

fn check_address(url: &Url, address: IpAddr) -> Result<(), CaptureError> {
    if METADATA_ADDRESSES.contains(&address) {
        return Err(reject(url, "metadata address".to_string()));
    }
    if is_forbidden_address(address) {
        return Err(reject(url, format!("{address} is in a private or reserved range")));
    }
    Ok(())
}

fn reject(url: &Url, reason: String) -> CaptureError {
    warn!(security_event = true, url = %url, reason = %reason, "Rejected capture target");
    CaptureError::UrlNotAllowed(reason)
}

/// True for loopback, private, link-local, shared and other non-public ranges.
pub fn is_forbidden_address(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(ip) => is_forbidden_v4(ip),
        IpAddr::V6(ip) => {
            if let Some(mapped) = ip.to_ipv4_mapped() {
                return is_forbidden_v4(mapped);
            }
            let first = ip.segments()[0];
            ip.is_loopback()
                || ip.is_unspecified()
                || ip.is_multicast()
                || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
                || (first == 0x0064 && ip.segments()[1] == 0xff9b) // NAT64 64:ff9b::/96
        }
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        || a == 0
        || (a == 100 && (64..128).contains(&b)) // shared address space 100.64.0.0/10
        || (a == 198 && (b == 18 || b == 19)) // benchmarking 198.18.0.0/15
        || a >= 240
}
