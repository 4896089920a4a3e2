use super::checksum;
use super::icmp;
use super::ipopts;
use super::ipv4;
use super::tcp;
use super::udp;

use rand::rngs::StdRng;
use rand::Rng;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

// PACKET STRUCT AND MANGLING METADATA
//
// This module defines a struct owning one IPv4 datagram together with the
// metadata the mangling pipeline attaches to it, and the byte surgery
// performed on it.
//
//   Packet - owned datagram bytes, derived header offsets, pipeline marks
//   Packet::parse(Vec<u8>, mtu) - validate and adopt a raw datagram
//   Packet::duplicate() - deep copy with a fresh id and reset marks
//   ip()/l4()/payload() (+_mut) - typed views into the buffer
//   ip_header_resize(n), tcp_header_resize(n) - grow/shrink header space
//   ip_payload_resize(n), tcp_payload_resize(n), udp_payload_resize(n)
//   payload_random_fill(rng) - overwrite the payload with noise
//   fix_checksums() - recompute every checksum the datagram carries
//   corrupt_checksum() - deliberately break the innermost checksum
//   randomize_ip_id(rng) - jitter the IP id field
//   inject_ip_options(corrupt, strip, rng) - mangle IP options
//   mark(source, judge, evil) - stamp pipeline marks
//   contract_ok(origin) - validate the §plugin contract fields

// Where a packet entered the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Source { Tunnel, Network, Local, TtlBforce, Unassigned }

impl Source {
    // Bit for source-mask filtering on the SEND queue.
    pub fn bit(self) -> u8 {
        match self {
            Source::Tunnel => 0x01,
            Source::Network => 0x02,
            Source::Local => 0x04,
            Source::TtlBforce => 0x08,
            Source::Unassigned => 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Proto { Tcp, Udp, Icmp, OtherIp, Unassigned }

// How a decoy is meant to be rejected by the remote peer. Irrelevant for
// packets that really belong to the host's sessions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Judge { Prescription, Innocent, Guilty, Malformed, Unassigned }

// Decoy or real traffic, in the spirit of RFC 3514.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Evil { Good, Evil, Unassigned }

// Where a plugin-produced packet must sit relative to the original.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Position { Anticipation, Posticipation, AnyPosition, Unassigned }

// Whether a plugin-produced packet may be mangled again by other plugins.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Chain { Final, Rehackable, Unassigned }

// Which lifecycle list of the queue currently owns the packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueKind { Young, Keep, Send, Unassigned }

// Rejected input datagram; dropped with a warning at the transport edge.
#[derive(Debug)]
pub struct MalformedPacket(pub &'static str);

impl fmt::Display for MalformedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed packet: {}", self.0)
    }
}

impl Error for MalformedPacket {}

static PACKET_IDS: AtomicU32 = AtomicU32::new(0);

fn next_id() -> u32 {
    PACKET_IDS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

const TCPOPT_NOP: u8 = 1;

pub struct Packet {
    pub id: u32,
    pub source: Source,
    pub proto: Proto,
    pub judge: Judge,
    pub evil: Evil,
    pub position: Position,
    pub chain: Chain,
    pub choosable_scramble: u8,
    pub queue: QueueKind,
    fragment: bool,
    mtu: usize,
    iphdrlen: usize,
    l4hdrlen: usize,
    buf: Vec<u8>,
}

// Offsets derived from the raw bytes; returned by the validating parse and
// re-derived after every length-changing operation.
struct Offsets {
    fragment: bool,
    proto: Proto,
    iphdrlen: usize,
    l4hdrlen: usize,
}

fn derive_offsets(buf: &[u8]) -> Result<Offsets, MalformedPacket> {
    let len = buf.len();
    if len < ipv4::MIN_HEADER {
        return Err(MalformedPacket("shorter than an IP header"));
    }
    if ipv4::ihl(buf) < 5 {
        return Err(MalformedPacket("IHL below 5"));
    }
    let iphdrlen = ipv4::header_len(buf);
    if len < iphdrlen {
        return Err(MalformedPacket("shorter than its own IP header"));
    }
    if ipv4::total_len(buf) as usize != len {
        return Err(MalformedPacket("total length disagrees with buffer"));
    }
    // A fragment is treated as an opaque IP packet: no L4 interpretation.
    if ipv4::is_fragment(buf) {
        return Ok(Offsets { fragment: true, proto: Proto::OtherIp, iphdrlen, l4hdrlen: 0 });
    }
    match ipv4::protocol(buf) {
        ipv4::PROTOCOL_TCP => {
            if len < iphdrlen + tcp::MIN_HEADER {
                return Err(MalformedPacket("truncated TCP header"));
            }
            let l4 = &buf[iphdrlen..];
            if tcp::data_offset(l4) < 5 {
                return Err(MalformedPacket("TCP data offset below 5"));
            }
            let l4hdrlen = tcp::header_len(l4);
            if len < iphdrlen + l4hdrlen {
                return Err(MalformedPacket("truncated TCP options"));
            }
            Ok(Offsets { fragment: false, proto: Proto::Tcp, iphdrlen, l4hdrlen })
        }
        ipv4::PROTOCOL_UDP => {
            if len < iphdrlen + udp::HEADER {
                return Err(MalformedPacket("truncated UDP header"));
            }
            if (udp::len(&buf[iphdrlen..]) as usize) > len - iphdrlen {
                return Err(MalformedPacket("UDP length beyond buffer"));
            }
            Ok(Offsets { fragment: false, proto: Proto::Udp, iphdrlen, l4hdrlen: udp::HEADER })
        }
        ipv4::PROTOCOL_ICMP => {
            if len < iphdrlen + icmp::HEADER {
                return Err(MalformedPacket("truncated ICMP header"));
            }
            Ok(Offsets { fragment: false, proto: Proto::Icmp, iphdrlen, l4hdrlen: icmp::HEADER })
        }
        _ => Ok(Offsets { fragment: false, proto: Proto::OtherIp, iphdrlen, l4hdrlen: 0 }),
    }
}

impl Packet {

    // Validate and adopt a raw IPv4 datagram. Every invariant the engine
    // later relies on is established here; anything inconsistent is refused.
    pub fn parse(buf: Vec<u8>, mtu: usize) -> Result<Packet, MalformedPacket> {
        if buf.len() > mtu {
            return Err(MalformedPacket("longer than the interface MTU"));
        }
        let o = derive_offsets(&buf)?;
        Ok(Packet {
            id: next_id(),
            source: Source::Unassigned,
            proto: o.proto,
            judge: Judge::Unassigned,
            evil: Evil::Unassigned,
            position: Position::Unassigned,
            chain: Chain::Unassigned,
            choosable_scramble: 0,
            queue: QueueKind::Unassigned,
            fragment: o.fragment,
            mtu,
            iphdrlen: o.iphdrlen,
            l4hdrlen: o.l4hdrlen,
            buf,
        })
    }

    // Deep copy with a fresh id. Pipeline marks reset so the copy walks the
    // pipeline on its own; the chain flag carries over.
    pub fn duplicate(&self) -> Packet {
        Packet {
            id: next_id(),
            source: Source::Unassigned,
            proto: self.proto,
            judge: Judge::Unassigned,
            evil: Evil::Unassigned,
            position: Position::Unassigned,
            chain: self.chain,
            choosable_scramble: 0,
            queue: QueueKind::Unassigned,
            fragment: self.fragment,
            mtu: self.mtu,
            iphdrlen: self.iphdrlen,
            l4hdrlen: self.l4hdrlen,
            buf: self.buf.clone(),
        }
    }

    pub fn mark(&mut self, source: Source, judge: Judge, evil: Evil) {
        self.source = source;
        self.judge = judge;
        self.evil = evil;
    }

    // Offsets must be re-derivable after any internal mutation; failure
    // here is a bug in the mutating operation, not an input error.
    fn refresh(&mut self) {
        match derive_offsets(&self.buf) {
            Ok(o) => {
                self.fragment = o.fragment;
                self.proto = o.proto;
                self.iphdrlen = o.iphdrlen;
                self.l4hdrlen = o.l4hdrlen;
            }
            Err(e) => panic!("BUG[refresh]: resize left packet i{} inconsistent: {}", self.id, e),
        }
    }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn bytes(&self) -> &[u8] { &self.buf }

    pub fn into_bytes(self) -> Vec<u8> { self.buf }

    pub fn is_fragment(&self) -> bool { self.fragment }

    pub fn mtu(&self) -> usize { self.mtu }

    pub fn free_space(&self) -> usize { self.mtu - self.buf.len() }

    pub fn ip_header_len(&self) -> usize { self.iphdrlen }

    pub fn l4_header_len(&self) -> usize { self.l4hdrlen }

    pub fn payload_len(&self) -> usize { self.buf.len() - self.iphdrlen - self.l4hdrlen }

    pub fn ip(&self) -> &[u8] { &self.buf[..self.iphdrlen] }

    pub fn ip_mut(&mut self) -> &mut [u8] { &mut self.buf[..self.iphdrlen] }

    pub fn l4(&self) -> &[u8] {
        &self.buf[self.iphdrlen..self.iphdrlen + self.l4hdrlen]
    }

    pub fn l4_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.iphdrlen..self.iphdrlen + self.l4hdrlen]
    }

    pub fn payload(&self) -> &[u8] { &self.buf[self.iphdrlen + self.l4hdrlen..] }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let ofs = self.iphdrlen + self.l4hdrlen;
        &mut self.buf[ofs..]
    }

    pub fn saddr(&self) -> ipv4::Address { ipv4::src(&self.buf) }

    pub fn daddr(&self) -> ipv4::Address { ipv4::dst(&self.buf) }

    // Transport ports; zero for protocols that have none.
    pub fn sport(&self) -> u16 {
        match self.proto {
            Proto::Tcp => tcp::src_port(self.l4()),
            Proto::Udp => udp::src_port(self.l4()),
            _ => 0,
        }
    }

    pub fn dport(&self) -> u16 {
        match self.proto {
            Proto::Tcp => tcp::dst_port(self.l4()),
            Proto::Udp => udp::dst_port(self.l4()),
            _ => 0,
        }
    }

    // Grow or shrink the IP header to `size` bytes. The caller guarantees a
    // multiple of 4 within [20, 60] that keeps the packet within the MTU;
    // grown space is NOOP option filler.
    pub fn ip_header_resize(&mut self, size: usize) {
        if size == self.iphdrlen { return; }
        assert!(size % 4 == 0 && size >= ipv4::MIN_HEADER && size <= ipv4::MAX_HEADER,
                "BUG[iphdr-resize]: size {}", size);
        assert!(self.buf.len() - self.iphdrlen + size <= self.mtu,
                "BUG[iphdr-resize]: past MTU");
        if size > self.iphdrlen {
            let fill = std::iter::repeat(ipopts::IPOPT_NOOP).take(size - self.iphdrlen);
            self.buf.splice(self.iphdrlen..self.iphdrlen, fill);
        } else {
            self.buf.drain(size..self.iphdrlen);
        }
        let total = self.buf.len() as u16;
        ipv4::set_ihl(&mut self.buf, (size / 4) as u8);
        ipv4::set_total_len(&mut self.buf, total);
        self.refresh();
    }

    // Grow or shrink the TCP header to `size` bytes, same caller contract
    // as ip_header_resize but within [20, 60] of TCP option space.
    pub fn tcp_header_resize(&mut self, size: usize) {
        assert!(!self.fragment && self.proto == Proto::Tcp,
                "BUG[tcphdr-resize]: not a TCP packet");
        if size == self.l4hdrlen { return; }
        assert!(size % 4 == 0 && size >= tcp::MIN_HEADER && size <= tcp::MAX_HEADER,
                "BUG[tcphdr-resize]: size {}", size);
        assert!(self.buf.len() - self.l4hdrlen + size <= self.mtu,
                "BUG[tcphdr-resize]: past MTU");
        let base = self.iphdrlen;
        if size > self.l4hdrlen {
            let fill = std::iter::repeat(TCPOPT_NOP).take(size - self.l4hdrlen);
            self.buf.splice(base + self.l4hdrlen..base + self.l4hdrlen, fill);
        } else {
            self.buf.drain(base + size..base + self.l4hdrlen);
        }
        let total = self.buf.len() as u16;
        tcp::set_data_offset(&mut self.buf[base..], (size / 4) as u8);
        ipv4::set_total_len(&mut self.buf, total);
        self.refresh();
    }

    pub fn ip_payload_resize(&mut self, size: usize) {
        let new_total = self.iphdrlen + size;
        assert!(new_total <= self.mtu, "BUG[ippayload-resize]: past MTU");
        self.buf.resize(new_total, 0);
        ipv4::set_total_len(&mut self.buf, new_total as u16);
        self.refresh();
    }

    pub fn tcp_payload_resize(&mut self, size: usize) {
        assert!(!self.fragment && self.proto == Proto::Tcp,
                "BUG[tcppayload-resize]: not a TCP packet");
        let new_total = self.iphdrlen + self.l4hdrlen + size;
        assert!(new_total <= self.mtu, "BUG[tcppayload-resize]: past MTU");
        self.buf.resize(new_total, 0);
        ipv4::set_total_len(&mut self.buf, new_total as u16);
        self.refresh();
    }

    pub fn udp_payload_resize(&mut self, size: usize) {
        assert!(!self.fragment && self.proto == Proto::Udp,
                "BUG[udppayload-resize]: not a UDP packet");
        let new_total = self.iphdrlen + self.l4hdrlen + size;
        assert!(new_total <= self.mtu, "BUG[udppayload-resize]: past MTU");
        self.buf.resize(new_total, 0);
        ipv4::set_total_len(&mut self.buf, new_total as u16);
        udp::set_len(&mut self.buf[self.iphdrlen..], (udp::HEADER + size) as u16);
        self.refresh();
    }

    pub fn payload_random_fill(&mut self, rng: &mut StdRng) {
        rng.fill(self.payload_mut());
    }

    // Recompute every checksum the datagram carries: the IP header always,
    // the transport checksum over its pseudo header for non-fragments.
    pub fn fix_checksums(&mut self) {
        let iphdrlen = self.iphdrlen;
        let l4len = self.buf.len() - iphdrlen;
        if !self.fragment {
            match self.proto {
                Proto::Tcp => {
                    let init = !ipv4::pseudo_checksum(&self.buf, ipv4::PROTOCOL_TCP, l4len as u16);
                    tcp::set_checksum(&mut self.buf[iphdrlen..], 0);
                    let sum = checksum::ipsum(&self.buf[iphdrlen..], l4len, init);
                    tcp::set_checksum(&mut self.buf[iphdrlen..], sum);
                }
                Proto::Udp => {
                    let init = !ipv4::pseudo_checksum(&self.buf, ipv4::PROTOCOL_UDP, l4len as u16);
                    udp::set_checksum(&mut self.buf[iphdrlen..], 0);
                    let sum = checksum::ipsum(&self.buf[iphdrlen..], l4len, init);
                    udp::set_checksum(&mut self.buf[iphdrlen..], sum);
                }
                Proto::Icmp => {
                    icmp::set_checksum(&mut self.buf[iphdrlen..], 0);
                    let sum = checksum::ipsum(&self.buf[iphdrlen..], l4len, 0);
                    icmp::set_checksum(&mut self.buf[iphdrlen..], sum);
                }
                _ => {}
            }
        }
        ipv4::checksum_compute(&mut self.buf);
    }

    // Break the innermost checksum so the remote peer discards the packet
    // while the on-path observer still sees a plausible datagram.
    pub fn corrupt_checksum(&mut self) {
        let iphdrlen = self.iphdrlen;
        if !self.fragment && self.proto == Proto::Tcp {
            let sum = tcp::checksum_field(self.l4()).wrapping_add(0xd34d);
            tcp::set_checksum(&mut self.buf[iphdrlen..], sum);
        } else if !self.fragment && self.proto == Proto::Udp {
            let sum = udp::checksum_field(self.l4()).wrapping_add(0xd34d);
            udp::set_checksum(&mut self.buf[iphdrlen..], sum);
        } else {
            let sum = ipv4::checksum_field(&self.buf).wrapping_add(0xd34d);
            ipv4::set_checksum(&mut self.buf, sum);
        }
    }

    // Jitter the IP id inside [-10, +9] of its current value.
    pub fn randomize_ip_id(&mut self, rng: &mut StdRng) {
        let jitter: u16 = rng.gen_range(0..20);
        let id = ipv4::id(&self.buf).wrapping_sub(10).wrapping_add(jitter);
        ipv4::set_id(&mut self.buf, id);
    }

    pub fn inject_ip_options(&mut self, corrupt: bool, strip: bool, rng: &mut StdRng) -> bool {
        ipopts::inject(self, corrupt, strip, rng)
    }

    // Validate that a plugin assigned every mark the pipeline needs before
    // its packet may be finalized. Failures name the offending plugin.
    pub fn contract_ok(&self, origin: &str) -> bool {
        if self.judge == Judge::Unassigned {
            log::warn!("{}: packet i{} left judge unassigned", origin, self.id);
            return false;
        }
        if self.choosable_scramble == 0 {
            log::warn!("{}: packet i{} left choosable scramble empty", origin, self.id);
            return false;
        }
        if self.proto == Proto::Unassigned {
            log::warn!("{}: packet i{} left proto unassigned", origin, self.id);
            return false;
        }
        if self.position == Position::Unassigned {
            log::warn!("{}: packet i{} left position unassigned", origin, self.id);
            return false;
        }
        if self.chain == Chain::Unassigned {
            log::warn!("{}: packet i{} left chain unassigned", origin, self.id);
            return false;
        }
        true
    }

    // Compact one-line summary for log output.
    pub fn describe(&self) -> String {
        format!("i{} {:?}|{:?} {}:{} -> {}:{} {:?} len {} ttl {}",
                self.id, self.source, self.judge,
                ipv4::ntop(self.saddr()), self.sport(),
                ipv4::ntop(self.daddr()), self.dport(),
                self.proto, self.buf.len(), ipv4::ttl(&self.buf))
    }
}
