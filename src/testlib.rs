use super::icmp;
use super::ipv4;
use super::tcp;
use super::udp;

// Raw datagram builders shared by the module selftests.

pub fn tcp_bytes(saddr: &str, daddr: &str, sport: u16, dport: u16,
                 seq: u32, flags: u8, payload: usize) -> Vec<u8> {
    let mut b = vec![0u8; 40 + payload];
    b[0] = 0x45;
    ipv4::set_total_len(&mut b, (40 + payload) as u16);
    ipv4::set_id(&mut b, 0x1234);
    ipv4::set_ttl(&mut b, 64);
    b[9] = ipv4::PROTOCOL_TCP;
    ipv4::set_src(&mut b, ipv4::pton(saddr));
    ipv4::set_dst(&mut b, ipv4::pton(daddr));
    tcp::set_src_port(&mut b[20..], sport);
    tcp::set_dst_port(&mut b[20..], dport);
    tcp::set_seq(&mut b[20..], seq);
    tcp::set_data_offset(&mut b[20..], 5);
    tcp::set_flags(&mut b[20..], flags);
    b
}

pub fn udp_bytes(saddr: &str, daddr: &str, sport: u16, dport: u16,
                 payload: usize) -> Vec<u8> {
    let mut b = vec![0u8; 28 + payload];
    b[0] = 0x45;
    ipv4::set_total_len(&mut b, (28 + payload) as u16);
    ipv4::set_ttl(&mut b, 64);
    b[9] = ipv4::PROTOCOL_UDP;
    ipv4::set_src(&mut b, ipv4::pton(saddr));
    ipv4::set_dst(&mut b, ipv4::pton(daddr));
    udp::set_src_port(&mut b[20..], sport);
    udp::set_dst_port(&mut b[20..], dport);
    udp::set_len(&mut b[20..], (8 + payload) as u16);
    b
}

// A TIME_EXCEEDED notification from `router` quoting the head of the
// expired datagram (its IP header plus eight transport octets).
pub fn icmp_expired_bytes(router: &str, daddr: &str, expired: &[u8]) -> Vec<u8> {
    let quoted = std::cmp::min(expired.len(), ipv4::header_len(expired) + 8);
    let mut b = vec![0u8; 28 + quoted];
    b[0] = 0x45;
    ipv4::set_total_len(&mut b, (28 + quoted) as u16);
    ipv4::set_ttl(&mut b, 64);
    b[9] = ipv4::PROTOCOL_ICMP;
    ipv4::set_src(&mut b, ipv4::pton(router));
    ipv4::set_dst(&mut b, ipv4::pton(daddr));
    b[20] = icmp::TIME_EXCEEDED;
    b[28..28 + quoted].copy_from_slice(&expired[..quoted]);
    b
}
