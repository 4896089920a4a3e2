use byteorder::{BigEndian, ByteOrder};

// TCP
//
// This module contains accessors for TCP headers laid out in a byte slice.
//
//   src_port(&[u8]) -> u16 / set_src_port - get/set source port
//   dst_port(&[u8]) -> u16 / set_dst_port - get/set destination port
//   seq(&[u8]) -> u32 / set_seq - get/set sequence number
//   ack_seq(&[u8]) -> u32 / set_ack_seq - get/set acknowledgment number
//   data_offset(&[u8]) -> u8 / set_data_offset - get/set 4-bit data offset
//   header_len(&[u8]) -> usize - data offset in bytes
//   syn/ack/fin/rst(&[u8]) -> bool - get flag bits
//   set_flags(&mut [u8], u8) - set the low flag byte (CWR..FIN) wholesale
//   checksum_field(&[u8]) -> u16 / set_checksum - get/set checksum

pub const MIN_HEADER: usize = 20;
pub const MAX_HEADER: usize = 60;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

pub fn src_port(h: &[u8]) -> u16 { BigEndian::read_u16(&h[0..2]) }

pub fn set_src_port(h: &mut [u8], port: u16) {
    BigEndian::write_u16(&mut h[0..2], port);
}

pub fn dst_port(h: &[u8]) -> u16 { BigEndian::read_u16(&h[2..4]) }

pub fn set_dst_port(h: &mut [u8], port: u16) {
    BigEndian::write_u16(&mut h[2..4], port);
}

pub fn seq(h: &[u8]) -> u32 { BigEndian::read_u32(&h[4..8]) }

pub fn set_seq(h: &mut [u8], seq: u32) {
    BigEndian::write_u32(&mut h[4..8], seq);
}

pub fn ack_seq(h: &[u8]) -> u32 { BigEndian::read_u32(&h[8..12]) }

pub fn set_ack_seq(h: &mut [u8], ack: u32) {
    BigEndian::write_u32(&mut h[8..12], ack);
}

pub fn data_offset(h: &[u8]) -> u8 { h[12] >> 4 }

pub fn set_data_offset(h: &mut [u8], offset: u8) {
    h[12] = (h[12] & 0x0f) | (offset << 4);
}

pub fn header_len(h: &[u8]) -> usize { data_offset(h) as usize * 4 }

pub fn fin(h: &[u8]) -> bool { h[13] & FLAG_FIN != 0 }
pub fn syn(h: &[u8]) -> bool { h[13] & FLAG_SYN != 0 }
pub fn rst(h: &[u8]) -> bool { h[13] & FLAG_RST != 0 }
pub fn ack(h: &[u8]) -> bool { h[13] & FLAG_ACK != 0 }

pub fn set_flags(h: &mut [u8], flags: u8) { h[13] = flags; }

pub fn checksum_field(h: &[u8]) -> u16 { BigEndian::read_u16(&h[16..18]) }

pub fn set_checksum(h: &mut [u8], sum: u16) {
    BigEndian::write_u16(&mut h[16..18], sum);
}

#[cfg(test)]
mod selftest {
    use super::*;

    #[test]
    fn tcp() {
        let mut h = [0u8; 32];
        set_src_port(&mut h, 56843);
        set_dst_port(&mut h, 443);
        set_seq(&mut h, 3889911740);
        set_ack_seq(&mut h, 0x91cd1832);
        set_data_offset(&mut h, 8);
        set_flags(&mut h, FLAG_SYN | FLAG_ACK);
        assert_eq!(src_port(&h), 56843);
        assert_eq!(dst_port(&h), 443);
        assert_eq!(seq(&h), 3889911740);
        assert_eq!(ack_seq(&h), 0x91cd1832);
        assert_eq!(data_offset(&h), 8);
        assert_eq!(header_len(&h), 32);
        assert!(syn(&h) && ack(&h) && !fin(&h) && !rst(&h));
        set_seq(&mut h, 42);
        assert_eq!(seq(&h), 42);
    }
}
