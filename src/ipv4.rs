use super::checksum;

use byteorder::{BigEndian, ByteOrder};
use std::net;
use std::str::FromStr;

// IPv4
//
// This module contains accessors for IPv4 headers laid out in a byte slice,
// a type for IPv4 addresses, and some related utilities. All multi-byte
// values are spoken in host byte order; the slice holds network byte order.
//
//   Address - u32 (in host byte order)
//   ntop(Address) -> String - return string representation of IPv4 address
//   pton(&str) -> Address - parse IPv4 address from string representation
//   version(&[u8]) -> u8 - get 4-bit version (always 4)
//   ihl(&[u8]) -> u8 - get 4-bit IHL (5 unless there are options)
//   set_ihl(&mut [u8], u8) - set 4-bit IHL
//   header_len(&[u8]) -> usize - get header length in bytes (IHL*4)
//   total_len(&[u8]) -> u16 / set_total_len - IPv4 frame size incl. header
//   id(&[u8]) -> u16 / set_id - get/set datagram identifier
//   frag_off(&[u8]) -> u16 - get raw flags+fragment-offset field
//   is_fragment(&[u8]) -> bool - MF set or fragment offset non-zero
//   ttl(&[u8]) -> u8 / set_ttl - get/set Time-To-Live (max. hops)
//   protocol(&[u8]) -> u8 - get protocol
//   checksum_field(&[u8]) -> u16 / set_checksum - get/set header checksum
//   checksum_compute(&mut [u8]) - compute and set header checksum
//   checksum_ok(&[u8]) -> bool - verify header checksum
//   pseudo_checksum(&[u8],u8,u16) -> u16 - compute pseudo-header checksum
//   src(&[u8]) -> Address / set_src - get/set source address
//   dst(&[u8]) -> Address / set_dst - get/set destination address
//   PROTOCOL_TCP, PROTOCOL_UDP, PROTOCOL_ICMP - protocol identifiers
//   MIN_HEADER, MAX_HEADER - header length bounds

pub type Address = u32;

pub fn ntop(address: Address) -> String {
    net::Ipv4Addr::from(address).to_string()
}

pub fn pton(string: &str) -> Address {
    u32::from(net::Ipv4Addr::from_str(string).unwrap())
}

pub const MIN_HEADER: usize = 20;
pub const MAX_HEADER: usize = 60;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

pub fn version(h: &[u8]) -> u8 { h[0] >> 4 }

pub fn ihl(h: &[u8]) -> u8 { h[0] & 0xf }

pub fn set_ihl(h: &mut [u8], ihl: u8) {
    h[0] = (h[0] & 0xf0) | (ihl & 0xf);
}

pub fn header_len(h: &[u8]) -> usize { ihl(h) as usize * 4 }

pub fn total_len(h: &[u8]) -> u16 { BigEndian::read_u16(&h[2..4]) }

pub fn set_total_len(h: &mut [u8], len: u16) {
    BigEndian::write_u16(&mut h[2..4], len);
}

pub fn id(h: &[u8]) -> u16 { BigEndian::read_u16(&h[4..6]) }

pub fn set_id(h: &mut [u8], id: u16) {
    BigEndian::write_u16(&mut h[4..6], id);
}

pub fn frag_off(h: &[u8]) -> u16 { BigEndian::read_u16(&h[6..8]) }

// MF flag set or fragment offset non-zero (the DF bit does not count).
pub fn is_fragment(h: &[u8]) -> bool { frag_off(h) & 0x3fff != 0 }

pub fn ttl(h: &[u8]) -> u8 { h[8] }

pub fn set_ttl(h: &mut [u8], ttl: u8) { h[8] = ttl; }

pub fn protocol(h: &[u8]) -> u8 { h[9] }

pub fn checksum_field(h: &[u8]) -> u16 { BigEndian::read_u16(&h[10..12]) }

pub fn set_checksum(h: &mut [u8], sum: u16) {
    BigEndian::write_u16(&mut h[10..12], sum);
}

pub fn src(h: &[u8]) -> Address { BigEndian::read_u32(&h[12..16]) }

pub fn set_src(h: &mut [u8], address: Address) {
    BigEndian::write_u32(&mut h[12..16], address);
}

pub fn dst(h: &[u8]) -> Address { BigEndian::read_u32(&h[16..20]) }

pub fn set_dst(h: &mut [u8], address: Address) {
    BigEndian::write_u32(&mut h[16..20], address);
}

pub fn checksum_compute(h: &mut [u8]) {
    let len = header_len(h);
    set_checksum(h, 0);
    let sum = checksum::ipsum(h, len, 0);
    set_checksum(h, sum);
}

pub fn checksum_ok(h: &[u8]) -> bool {
    0 == checksum::ipsum(h, header_len(h), 0)
}

// Checksum of the TCP/UDP pseudo header: source and destination address,
// zero, protocol, and upper-layer length.
pub fn pseudo_checksum(h: &[u8], protocol: u8, len: u16) -> u16 {
    let mut ph = [0u8; 12];
    ph[..8].copy_from_slice(&h[12..20]);
    ph[9] = protocol;
    BigEndian::write_u16(&mut ph[10..12], len);
    checksum::ipsum(&ph, 12, 0)
}
