//! Wake-on-LAN
//!
//! Builds the magic packet (6×0xFF followed by the MAC sixteen times) and
//! broadcasts it to UDP port 9 on every up, non-loopback IPv4 interface.

use std::net::{Ipv4Addr, UdpSocket};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::{info, warn};

use crate::error::{AppError, Result};

const WOL_PORT: u16 = 9;
const MAGIC_PACKET_SIZE: usize = 6 + 16 * 6;

/// Parse a MAC address with `:`, `-`, `.` or no separators.
fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let hex: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if hex.len() != 12 {
        return Err(AppError::Config(format!("invalid mac address {mac}")));
    }

    let mut bytes = [0u8; 6];
    for (i, slot) in bytes.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| AppError::Config(format!("invalid mac address {mac}")))?;
    }

    Ok(bytes)
}

fn build_magic_packet(mac: &[u8; 6]) -> [u8; MAGIC_PACKET_SIZE] {
    let mut packet = [0xFFu8; MAGIC_PACKET_SIZE];

    for i in 0..16 {
        let offset = 6 + i * 6;
        packet[offset..offset + 6].copy_from_slice(mac);
    }

    packet
}

/// Broadcast addresses of every up, non-loopback IPv4 interface.
///
/// The kernel-reported broadcast address is used when present; otherwise it
/// is derived as `ip | !netmask`.
fn broadcast_addresses() -> Result<Vec<Ipv4Addr>> {
    let mut addrs = Vec::new();

    for ifaddr in getifaddrs().map_err(std::io::Error::from)? {
        let flags = ifaddr.flags;
        if flags.contains(InterfaceFlags::IFF_LOOPBACK) || !flags.contains(InterfaceFlags::IFF_UP)
        {
            continue;
        }

        if let Some(broadcast) = ifaddr
            .broadcast
            .as_ref()
            .and_then(|addr| addr.as_sockaddr_in())
        {
            addrs.push(broadcast.ip());
            continue;
        }

        let (Some(ip), Some(mask)) = (
            ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()),
            ifaddr.netmask.as_ref().and_then(|a| a.as_sockaddr_in()),
        ) else {
            continue;
        };

        let derived = u32::from(ip.ip()) | !u32::from(mask.ip());
        addrs.push(Ipv4Addr::from(derived));
    }

    Ok(addrs)
}

/// Send the magic packet for `mac` out of every eligible interface.
pub fn send_wol(mac: &str) -> Result<()> {
    let mac = parse_mac(mac)?;
    let packet = build_magic_packet(&mac);

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_broadcast(true)?;

    let addrs = broadcast_addresses()?;
    if addrs.is_empty() {
        warn!("wake on lan: no eligible interfaces");
        return Ok(());
    }

    for addr in addrs {
        if let Err(e) = socket.send_to(&packet, (addr, WOL_PORT)) {
            warn!("wake on lan send to {} failed: {}", addr, e);
        } else {
            info!("wake on lan packet sent to {}:{}", addr, WOL_PORT);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac_separators() {
        let expected = [0xC4, 0x75, 0xAB, 0x1A, 0x07, 0x1B];
        assert_eq!(parse_mac("C4:75:AB:1A:07:1B").unwrap(), expected);
        assert_eq!(parse_mac("c4-75-ab-1a-07-1b").unwrap(), expected);
        assert_eq!(parse_mac("c475.ab1a.071b").unwrap(), expected);
        assert_eq!(parse_mac("c475ab1a071b").unwrap(), expected);
    }

    #[test]
    fn test_parse_mac_invalid() {
        assert!(parse_mac("").is_err());
        assert!(parse_mac("C4:75:AB:1A:07").is_err());
        assert!(parse_mac("C4:75:AB:1A:07:GG").is_err());
        assert!(parse_mac("C4:75:AB:1A:07:1B:00").is_err());
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = parse_mac("C4:75:AB:1A:07:1B").unwrap();
        let packet = build_magic_packet(&mac);

        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        for i in 0..16 {
            let offset = 6 + i * 6;
            assert_eq!(&packet[offset..offset + 6], &mac);
        }
    }
}
