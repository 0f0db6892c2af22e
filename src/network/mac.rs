//! Deterministic MAC derivation (spec §4.4): locally-administered, unicast,
//! with the last four octets taken from the allocated IPv4 so ARP/DHCP
//! behavior is reproducible across restarts without persisting a MAC table.

use std::net::Ipv4Addr;

/// Derive a MAC address for `ip`. The first octet (`0x02`) sets the
/// locally-administered bit and clears the multicast bit; the remaining
/// five octets are a fixed vendor-ish prefix byte followed by the IP's four
/// octets, matching the teacher's link-local addressing style of deriving
/// host identity directly from IP bytes (`ext/link_local.rs`).
pub fn derive_mac(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}
