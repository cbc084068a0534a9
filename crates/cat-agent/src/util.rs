// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host facts used to stamp outgoing records.

use std::env;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::constants::{DEFAULT_HOSTNAME, DEFAULT_IP};

/// Milliseconds since the unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Get the system hostname
///
/// Tries, in order: the `HOSTNAME` environment variable, `gethostname()`, and
/// finally falls back to `UnknownHost`.
#[must_use]
pub fn get_hostname() -> String {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => {
            if let Some(hostname) = hostname.to_str() {
                if !hostname.is_empty() {
                    return hostname.to_string();
                }
            }
        }
        Err(e) => warn!("Failed to get system hostname: {}", e),
    }

    warn!("Could not determine hostname, using '{}'", DEFAULT_HOSTNAME);
    DEFAULT_HOSTNAME.to_string()
}

/// First non-loopback IPv4 address, preferring `eth0` and `em1`.
#[must_use]
pub fn get_local_ip() -> String {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Failed to list interfaces: {}, using {}", e, DEFAULT_IP);
            return DEFAULT_IP.to_string();
        }
    };

    let mut candidates: Vec<(String, Ipv4Addr)> = addrs
        .filter_map(|ifaddr| {
            let sin = *ifaddr.address?.as_sockaddr_in()?;
            let ip = *SocketAddrV4::from(sin).ip();
            (!ip.is_loopback() && !ip.is_unspecified()).then_some((ifaddr.interface_name, ip))
        })
        .collect();
    candidates.sort_by_key(|(name, _)| !matches!(name.as_str(), "eth0" | "em1"));

    match candidates.first() {
        Some((_, ip)) => ip.to_string(),
        None => {
            warn!("No non-loopback IPv4 address found, using {}", DEFAULT_IP);
            DEFAULT_IP.to_string()
        }
    }
}

/// Hex form of a dotted IPv4 address, e.g. `127.0.0.1` -> `7f000001`.
///
/// ```
/// use cat_agent::util::ip_to_hex;
///
/// assert_eq!(ip_to_hex("10.1.2.255"), Some("0a0102ff".to_string()));
/// assert_eq!(ip_to_hex("not-an-ip"), None);
/// ```
#[must_use]
pub fn ip_to_hex(ip: &str) -> Option<String> {
    let ip: Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, d] = ip.octets();
    Some(format!("{a:02x}{b:02x}{c:02x}{d:02x}"))
}
