//! Candidate LAN addresses for display.

use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

/// Non-loopback IPv4 addresses of this host, sorted and deduplicated.
///
/// A host without usable interfaces yields an empty list; enumeration
/// failures are logged and treated the same way.
pub fn list_local_addresses() -> Vec<Ipv4Addr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => lan_ipv4(interfaces.into_iter().map(|(_, ip)| ip)),
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
            Vec::new()
        }
    }
}

fn lan_ipv4(addresses: impl IntoIterator<Item = IpAddr>) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = addresses
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .collect();
    ips.sort();
    ips.dedup();
    ips
}
