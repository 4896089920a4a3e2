use super::ipv4;
use super::packet::Packet;
use super::tcp;

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

// TTL FOCUS
//
// Per-destination hop-distance learning. The first outbound packet toward
// a new destination seeds a focus record holding the bruteforce state: a
// probe template cloned from that packet, a random key the probe replies
// are recognized by, and a puppet source port that keeps probe responses
// distinguishable from real traffic. Like the session map, the focus map
// is bounded and only ever grown from the tunnel side.
//
//   TtlStatus - UNKNOWN -> BRUTEFORCE -> KNOWN
//   TTLFocus - the learning state machine for one destination
//   TTLFocusMap.get(&Packet, now, rng) - fetch or create from a packet
//   TTLFocusMap.find(Address) / find_mut(Address) - fetch only
//   TTLFocusMap.manage(now) - expire idle entries, evict past bounds

pub const MAX_TTLPROBE: u32 = 26;
pub const TTLPROBE_RETRY_ON_UNKNOWN: u64 = 15;
pub const PROBE_TIMEOUT_GRACE: u64 = 2;
pub const BRUTEFORCE_ACCESS_WINDOW: u64 = 30;

pub const TTLFOCUS_MAX_ENTRIES: usize = 1024;
pub const TTLFOCUS_IDLE_TIMEOUT: u64 = 600;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TtlStatus { Unknown, Bruteforce, Known }

pub struct TTLFocus {
    pub status: TtlStatus,
    pub ttl_estimate: u8,
    pub ttl_synack: u8,
    pub sent_probe: u32,
    pub received_probe: u32,
    pub puppet_port: u16,
    pub rand_key: u32,
    pub probe_timeout: u64,
    pub next_probe_time: u64,
    pub access_timestamp: u64,
    pub probe_dummy: Packet,
}

impl TTLFocus {

    // Seed a focus from the first outbound packet of a flow. The probe
    // template is that packet shrunk to a bare 40-byte SYN: probes must
    // look like a fresh connection attempt from the puppet port.
    pub fn new(pkt: &Packet, now: u64, rng: &mut StdRng) -> TTLFocus {
        let mut dummy = pkt.duplicate();
        dummy.ip_header_resize(ipv4::MIN_HEADER);
        dummy.tcp_header_resize(tcp::MIN_HEADER);
        dummy.tcp_payload_resize(0);
        tcp::set_flags(dummy.l4_mut(), tcp::FLAG_SYN);
        tcp::set_ack_seq(dummy.l4_mut(), 0);
        let puppet_port = loop {
            let port: u16 = rng.gen_range(1024..=65535);
            if port != pkt.sport() { break port; }
        };
        TTLFocus {
            status: TtlStatus::Unknown,
            ttl_estimate: 0xff,
            ttl_synack: 0,
            sent_probe: 0,
            received_probe: 0,
            puppet_port,
            rand_key: rng.gen(),
            probe_timeout: 0,
            next_probe_time: now,
            access_timestamp: now,
            probe_dummy: dummy,
        }
    }

    pub fn daddr(&self) -> ipv4::Address { self.probe_dummy.daddr() }

    // A bruteforce round ran dry: forget what it taught and retry later.
    pub fn reset(&mut self, now: u64) {
        self.status = TtlStatus::Unknown;
        self.sent_probe = 0;
        self.received_probe = 0;
        self.ttl_estimate = 0xff;
        self.ttl_synack = 0;
        self.probe_timeout = 0;
        self.next_probe_time = now + TTLPROBE_RETRY_ON_UNKNOWN;
    }
}

pub struct TTLFocusMap {
    map: HashMap<ipv4::Address, TTLFocus>,
}

impl TTLFocusMap {

    pub fn new() -> TTLFocusMap {
        TTLFocusMap { map: HashMap::new() }
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn get(&mut self, pkt: &Packet, now: u64, rng: &mut StdRng) -> &mut TTLFocus {
        let focus = self.map.entry(pkt.daddr())
            .or_insert_with(|| TTLFocus::new(pkt, now, rng));
        focus.access_timestamp = now;
        focus
    }

    pub fn find(&self, daddr: ipv4::Address) -> Option<&TTLFocus> {
        self.map.get(&daddr)
    }

    pub fn find_mut(&mut self, daddr: ipv4::Address) -> Option<&mut TTLFocus> {
        self.map.get_mut(&daddr)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut TTLFocus> {
        self.map.values_mut()
    }

    pub fn manage(&mut self, now: u64) {
        self.map.retain(|_, f| f.access_timestamp + TTLFOCUS_IDLE_TIMEOUT > now);
        if self.map.len() > TTLFOCUS_MAX_ENTRIES {
            let mut stamps: Vec<(ipv4::Address, u64)> = self.map.iter()
                .map(|(a, f)| (*a, f.access_timestamp))
                .collect();
            stamps.sort_by_key(|&(_, at)| at);
            for (addr, _) in stamps.iter().take(self.map.len() - TTLFOCUS_MAX_ENTRIES) {
                self.map.remove(addr);
            }
        }
    }
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::testlib::tcp_bytes;
    use rand::SeedableRng;

    fn outbound(daddr: &str) -> Packet {
        let b = tcp_bytes("10.0.0.1", daddr, 54321, 443, 777,
                          tcp::FLAG_ACK | tcp::FLAG_PSH, 64);
        Packet::parse(b, 1500).unwrap()
    }

    #[test]
    fn probe_dummy_is_a_bare_syn() {
        let mut rng = StdRng::seed_from_u64(3);
        let focus = TTLFocus::new(&outbound("8.8.8.8"), 100, &mut rng);
        let dummy = &focus.probe_dummy;
        assert_eq!(dummy.len(), 40);
        assert_eq!(dummy.payload_len(), 0);
        assert!(tcp::syn(dummy.l4()));
        assert!(!tcp::ack(dummy.l4()));
        assert_eq!(tcp::ack_seq(dummy.l4()), 0);
        assert_eq!(ipv4::ntop(dummy.daddr()), "8.8.8.8");
        assert_eq!(focus.status, TtlStatus::Unknown);
        assert_eq!(focus.ttl_estimate, 0xff);
        assert_ne!(focus.puppet_port, 54321);
        assert!(focus.puppet_port >= 1024);
    }

    #[test]
    fn get_creates_find_does_not() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut m = TTLFocusMap::new();
        let p = outbound("8.8.8.8");
        m.get(&p, 100, &mut rng);
        m.get(&p, 120, &mut rng);
        assert_eq!(m.len(), 1);
        assert_eq!(m.find(p.daddr()).unwrap().access_timestamp, 120);
        assert!(m.find(ipv4::pton("9.9.9.9")).is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn reset_rearms_probing() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut focus = TTLFocus::new(&outbound("8.8.8.8"), 100, &mut rng);
        focus.status = TtlStatus::Bruteforce;
        focus.sent_probe = MAX_TTLPROBE;
        focus.ttl_estimate = 12;
        focus.reset(200);
        assert_eq!(focus.status, TtlStatus::Unknown);
        assert_eq!(focus.sent_probe, 0);
        assert_eq!(focus.ttl_estimate, 0xff);
        assert_eq!(focus.next_probe_time, 200 + TTLPROBE_RETRY_ON_UNKNOWN);
    }

    #[test]
    fn bounds() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut m = TTLFocusMap::new();
        for i in 0..40u32 {
            let daddr = format!("10.1.{}.{}", i / 256, i % 256);
            m.get(&outbound(&daddr), i as u64, &mut rng);
        }
        m.manage(20 + TTLFOCUS_IDLE_TIMEOUT);
        // Stamps 0..=20 have aged out.
        assert_eq!(m.len(), 19);
        assert!(m.find(ipv4::pton("10.1.0.0")).is_none());
        assert!(m.find(ipv4::pton("10.1.0.39")).is_some());
    }
}
