use byteorder::{BigEndian, ByteOrder};

// UDP
//
// This module contains accessors for UDP headers laid out in a byte slice.
//
//   src_port(&[u8]) -> u16 / set_src_port - get/set source port
//   dst_port(&[u8]) -> u16 / set_dst_port - get/set destination port
//   len(&[u8]) -> u16 / set_len - get/set datagram length
//   checksum_field(&[u8]) -> u16 / set_checksum - get/set checksum

pub const HEADER: usize = 8;

pub fn src_port(h: &[u8]) -> u16 { BigEndian::read_u16(&h[0..2]) }

pub fn set_src_port(h: &mut [u8], port: u16) {
    BigEndian::write_u16(&mut h[0..2], port);
}

pub fn dst_port(h: &[u8]) -> u16 { BigEndian::read_u16(&h[2..4]) }

pub fn set_dst_port(h: &mut [u8], port: u16) {
    BigEndian::write_u16(&mut h[2..4], port);
}

pub fn len(h: &[u8]) -> u16 { BigEndian::read_u16(&h[4..6]) }

pub fn set_len(h: &mut [u8], len: u16) {
    BigEndian::write_u16(&mut h[4..6], len);
}

pub fn checksum_field(h: &[u8]) -> u16 { BigEndian::read_u16(&h[6..8]) }

pub fn set_checksum(h: &mut [u8], sum: u16) {
    BigEndian::write_u16(&mut h[6..8], sum);
}
