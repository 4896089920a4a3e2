use super::conf::{Config, PACKET_DEBUG};
use super::icmp;
use super::ipv4;
use super::packet::{Evil, Judge, Packet, Position, Proto, QueueKind, Source};
use super::plugin::PluginPool;
use super::queue::{Handle, PacketQueue};
use super::scramble::*;
use super::session::SessionTrackMap;
use super::tcp;
use super::ttlfocus::*;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// MANGLING ENGINE
//
// The heart of the middlebox: a single-threaded engine the surrounding
// daemon drives from its poll loop. Both tunnel and network push raw
// datagrams in through write_packet; each tick analyzes the young
// arrivals, releases packets held for hop-distance knowledge, decorates
// outbound TCP with plugin-forged decoys, prunes the state maps, and
// keeps the TTL bruteforces running; the daemon then drains the ready
// packets with read_packet for whichever side they face.
//
//   Engine::new(Config, PluginPool) - entropy-seeded engine
//   Engine::with_seed(Config, PluginPool, u64) - deterministic engine
//   write_packet(Source, &[u8]) - enqueue one datagram (malformed input
//     is dropped with a warning, never an error)
//   read_packet(Side) -> Option<Packet> - pop a ready packet facing the
//     given side
//   tick(now) - run one full pipeline pass at monotonic second `now`
//   set_topology_hook(f) - observe suspected hop-distance changes
//
// Phase order within a tick is fixed: young analysis, keep release, decoy
// injection on send, map management, TTL probe emission. Map management
// runs after the send fixups so an eviction can never invalidate a focus
// the fixup is reading, and before probe emission so a probe is never
// forged from a record about to be dropped.

// The side of the middlebox a ready packet leaves through. The network
// writer carries everything of ours (tunnel traffic, decoys, probes); the
// tunnel writer hands inbound traffic back to the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side { Network, Tunnel }

enum Verdict { Send, Keep, Consumed }

pub struct Engine {
    conf: Config,
    pool: PluginPool,
    queue: PacketQueue,
    sessions: SessionTrackMap,
    ttlfoci: TTLFocusMap,
    rng: StdRng,
    now: u64,
    topology_hook: Option<Box<dyn FnMut(ipv4::Address, u8, u8)>>,
}

impl Engine {

    pub fn new(conf: Config, pool: PluginPool) -> Engine {
        Engine::with_rng(conf, pool, StdRng::from_entropy())
    }

    pub fn with_seed(conf: Config, pool: PluginPool, seed: u64) -> Engine {
        Engine::with_rng(conf, pool, StdRng::seed_from_u64(seed))
    }

    fn with_rng(conf: Config, pool: PluginPool, rng: StdRng) -> Engine {
        Engine {
            conf,
            pool,
            queue: PacketQueue::new(),
            sessions: SessionTrackMap::new(),
            ttlfoci: TTLFocusMap::new(),
            rng,
            now: 0,
            topology_hook: None,
        }
    }

    // Observe a KNOWN destination answering from an unexpected distance.
    // Observation only; recalibration is up to the caller.
    pub fn set_topology_hook(&mut self, hook: Box<dyn FnMut(ipv4::Address, u8, u8)>) {
        self.topology_hook = Some(hook);
    }

    pub fn sessions(&self) -> &SessionTrackMap { &self.sessions }

    pub fn ttl_foci(&self) -> &TTLFocusMap { &self.ttlfoci }

    pub fn queue_len(&self) -> usize { self.queue.len() }

    // Enqueue one raw datagram for analysis.
    pub fn write_packet(&mut self, source: Source, bytes: &[u8]) {
        match source {
            Source::Tunnel | Source::Network => {}
            _ => {
                log::warn!("refusing write from source {:?}", source);
                return;
            }
        }
        match Packet::parse(bytes.to_vec(), self.conf.mtu as usize) {
            Ok(mut pkt) => {
                pkt.mark(source, Judge::Innocent, Evil::Good);
                self.queue.insert(Box::new(pkt), QueueKind::Young);
            }
            Err(e) => log::warn!("malformed original packet dropped: {}", e),
        }
    }

    // Pop a ready packet facing the given side, in queue order.
    pub fn read_packet(&mut self, dest: Side) -> Option<Packet> {
        let mask = match dest {
            Side::Network => {
                Source::Tunnel.bit() | Source::Local.bit() | Source::TtlBforce.bit()
            }
            Side::Tunnel => Source::Network.bit(),
        };
        self.queue.select(QueueKind::Send);
        while let Some(h) = self.queue.get() {
            if self.queue.packet(h).source.bit() & mask != 0 {
                return Some(*self.queue.remove(h));
            }
        }
        None
    }

    // One full pipeline pass at monotonic second `now`.
    pub fn tick(&mut self, now: u64) {
        self.now = now;
        if !self.queue.is_empty() {
            self.handle_young();
            self.handle_keep();
            self.handle_send();
        }
        self.sessions.manage(now);
        self.ttlfoci.manage(now);
        self.exec_ttl_bruteforces();
    }

    // Drain the YOUNG list: network traffic is inspected for probe
    // responses, tunnel TCP is attached to its session and either released
    // or parked until the hop distance is known.
    fn handle_young(&mut self) {
        self.queue.select(QueueKind::Young);
        while let Some(h) = self.queue.get() {
            let (source, proto) = {
                let p = self.queue.packet(h);
                (p.source, p.proto)
            };
            let verdict = match (source, proto) {
                (Source::Network, Proto::Icmp) => self.incoming_icmp(h),
                (Source::Network, Proto::Tcp) => {
                    self.incoming_tcp_ttl_track(h);
                    self.incoming_tcp_synack(h)
                }
                (Source::Tunnel, Proto::Tcp) => {
                    let daddr = self.queue.packet(h).daddr();
                    if self.hack_allowed(daddr) {
                        self.outgoing_analyze(h)
                    } else {
                        log::debug!("address list match for {}: packet left alone",
                                    ipv4::ntop(daddr));
                        Verdict::Send
                    }
                }
                _ => Verdict::Send,
            };
            match verdict {
                Verdict::Send => {
                    let mut pkt = self.queue.remove(h);
                    if pkt.source == Source::Tunnel && pkt.proto == Proto::Tcp
                        && !finalize_packet(&mut pkt, &self.ttlfoci, &mut self.rng)
                    {
                        panic!("BUG[young-fix]: good packet refused fixup: {}", pkt.describe());
                    }
                    self.queue.insert(pkt, QueueKind::Send);
                }
                Verdict::Keep => {
                    let pkt = self.queue.remove(h);
                    self.queue.insert(pkt, QueueKind::Keep);
                }
                Verdict::Consumed => {
                    drop(self.queue.remove(h));
                }
            }
        }
    }

    // Release held packets whose destination is resolved, or whose probe
    // round gave up (a dead destination must not stall the flow).
    fn handle_keep(&mut self) {
        self.queue.select(QueueKind::Keep);
        while let Some(h) = self.queue.get() {
            let daddr = self.queue.packet(h).daddr();
            let release = match self.ttlfoci.find(daddr) {
                None => true,
                Some(f) => match f.status {
                    TtlStatus::Known => true,
                    TtlStatus::Unknown => {
                        f.sent_probe == 0 && f.next_probe_time > self.now
                    }
                    TtlStatus::Bruteforce => false,
                },
            };
            if release {
                let mut pkt = self.queue.remove(h);
                if !finalize_packet(&mut pkt, &self.ttlfoci, &mut self.rng) {
                    panic!("BUG[keep-fix]: held packet refused fixup: {}", pkt.describe());
                }
                self.queue.insert(pkt, QueueKind::Send);
            }
        }
    }

    // Decorate outbound TCP sitting on SEND with plugin decoys.
    fn handle_send(&mut self) {
        self.queue.select(QueueKind::Send);
        while let Some(h) = self.queue.get() {
            let (source, proto, fragment, daddr) = {
                let p = self.queue.packet(h);
                (p.source, p.proto, p.is_fragment(), p.daddr())
            };
            if source == Source::Tunnel && proto == Proto::Tcp && !fragment
                && self.hack_allowed(daddr)
            {
                self.inject_hack(h);
            }
        }
    }

    // Address-list gate: a blacklisted destination, or anything off the
    // whitelist when one is configured, passes through unmangled.
    fn hack_allowed(&self, daddr: ipv4::Address) -> bool {
        if let Some(blacklist) = &self.conf.blacklist {
            return !blacklist.contains(&daddr);
        }
        if let Some(whitelist) = &self.conf.whitelist {
            return whitelist.contains(&daddr);
        }
        true
    }

    // A TIME_EXCEEDED quoting one of our probes reveals the distance of
    // the expiring hop; everything else passes through. The focus lookup
    // never creates: an inbound packet must not grow our maps.
    fn incoming_icmp(&mut self, h: Handle) -> Verdict {
        let (inner_daddr, inner_id, inner_seq) = {
            let p = self.queue.packet(h);
            if icmp::typ(p.l4()) != icmp::TIME_EXCEEDED {
                return Verdict::Send;
            }
            let inner = p.payload();
            if inner.len() < ipv4::MIN_HEADER || ipv4::ihl(inner) < 5 {
                return Verdict::Send;
            }
            if ipv4::protocol(inner) != ipv4::PROTOCOL_TCP {
                return Verdict::Send;
            }
            let ihl = ipv4::header_len(inner);
            if inner.len() < ihl + 8 {
                return Verdict::Send;
            }
            (ipv4::dst(inner), ipv4::id(inner), tcp::seq(&inner[ihl..]))
        };
        let now = self.now;
        let focus = match self.ttlfoci.find_mut(inner_daddr) {
            Some(f) => f,
            None => return Verdict::Send,
        };
        let expired_ttl = inner_id.wrapping_sub((focus.rand_key % 64) as u16) as u8;
        let double_check = inner_seq.wrapping_sub(focus.rand_key) as u8;
        if expired_ttl != double_check {
            return Verdict::Send;
        }
        if focus.status == TtlStatus::Bruteforce {
            log::debug!("puppet {} incoming ICMP expired, generated from {}",
                        focus.puppet_port, expired_ttl);
            focus.received_probe += 1;
            if focus.probe_timeout != 0 {
                focus.probe_timeout = now + PROBE_TIMEOUT_GRACE;
            }
            if expired_ttl >= focus.ttl_estimate {
                // An expiry at or past the estimate invalidates it; back
                // to UNKNOWN so the estimate recalibrates.
                focus.status = TtlStatus::Unknown;
                focus.ttl_estimate = expired_ttl.wrapping_add(1);
            }
        }
        // Scattered by our own probes: swallow it.
        Verdict::Consumed
    }

    // Watch the arriving TTL of known peers; a deviation from the learned
    // value suggests the path changed underneath us.
    fn incoming_tcp_ttl_track(&mut self, h: Handle) {
        let (saddr, ttl) = {
            let p = self.queue.packet(h);
            (p.saddr(), ipv4::ttl(p.ip()))
        };
        let observed = match self.ttlfoci.find(saddr) {
            Some(f) if f.status == TtlStatus::Known && f.ttl_synack != ttl => {
                Some((f.sent_probe, f.ttl_estimate, f.ttl_synack))
            }
            _ => None,
        };
        if let Some((probes, estimate, expected)) = observed {
            log::warn!("probable net topology change at {}! #probe {} [estimate {} synack ttl {} got {}]",
                       ipv4::ntop(saddr), probes, estimate, expected, ttl);
            if let Some(hook) = &mut self.topology_hook {
                hook(saddr, expected, ttl);
            }
        }
    }

    // A TCP packet answering the puppet port belongs to the bruteforce:
    // the echoed acknowledgment encodes the distance the SYN traveled.
    fn incoming_tcp_synack(&mut self, h: Handle) -> Verdict {
        let (saddr, dport, ack_seq, ttl) = {
            let p = self.queue.packet(h);
            (p.saddr(), p.dport(), tcp::ack_seq(p.l4()), ipv4::ttl(p.ip()))
        };
        let focus = match self.ttlfoci.find_mut(saddr) {
            Some(f) => f,
            None => return Verdict::Send,
        };
        if dport != focus.puppet_port {
            return Verdict::Send;
        }
        if focus.status == TtlStatus::Bruteforce {
            let discern_ttl = ack_seq.wrapping_sub(focus.rand_key).wrapping_sub(1) as u8;
            focus.received_probe += 1;
            if discern_ttl < focus.ttl_estimate {
                focus.ttl_estimate = discern_ttl;
                focus.ttl_synack = ttl;
            }
            focus.status = TtlStatus::Known;
            log::debug!("puppet {} incoming SYN/ACK: distance {}",
                        focus.puppet_port, focus.ttl_estimate);
        }
        Verdict::Consumed
    }

    // Attach the packet to its session and destination focus. Until the
    // hop distance is resolved the packet waits on KEEP.
    fn outgoing_analyze(&mut self, h: Handle) -> Verdict {
        let now = self.now;
        {
            let p = self.queue.packet(h);
            self.sessions.get(p, now).packet_number += 1;
        }
        let status = {
            let p = self.queue.packet(h);
            self.ttlfoci.get(p, now, &mut self.rng).status
        };
        // Real traffic gets the decoys' scramble set so the last-mile
        // fixup can dress it in the same cover options.
        let union = self.pool.enabled_union();
        self.queue.packet_mut(h).choosable_scramble = union;
        if status == TtlStatus::Known { Verdict::Send } else { Verdict::Keep }
    }

    // Fan the original out to every applicable plugin and splice the
    // decoys around it.
    fn inject_hack(&mut self, orig: Handle) {
        let now = self.now;
        let (daddr, dport) = {
            let p = self.queue.packet(orig);
            (p.daddr(), p.dport())
        };
        let ttl_known = matches!(self.ttlfoci.find(daddr),
                                 Some(f) if f.status == TtlStatus::Known);
        let avail = available_scrambles(ttl_known);
        let packet_number = {
            let p = self.queue.packet(orig);
            self.sessions.get(p, now).packet_number
        };
        let user_mask = self.conf.aggressivity(dport);

        let mut applicable: Vec<usize> = Vec::new();
        for (i, track) in self.pool.tracks().iter().enumerate() {
            if avail & track.plugin.supported_scrambles() == 0 {
                log::debug!("no scramble available for {}", track.plugin.plugin_name());
                continue;
            }
            if !track.plugin.condition(self.queue.packet(orig), avail) {
                continue;
            }
            if !percentage(&mut self.rng, now, packet_number, track.frequency(), user_mask) {
                continue;
            }
            applicable.push(i);
        }
        applicable.shuffle(&mut self.rng);

        let mut remove_orig = false;
        for idx in applicable {
            let produced = {
                let Engine { queue, pool, rng, .. } = &mut *self;
                let orig_ref = queue.packet(orig);
                pool.track_mut(idx).plugin.create_hack(orig_ref, avail, rng)
            };
            let name = self.pool.tracks()[idx].plugin.plugin_name();
            for mut fake in produced {
                if !fake.contract_ok(name) {
                    if self.conf.debug_level >= PACKET_DEBUG {
                        panic!("BUG[plugin-contract]: invalid packet generated by {}", name);
                    }
                    continue;
                }
                if !finalize_packet(&mut fake, &self.ttlfoci, &mut self.rng) {
                    log::debug!("unable to scramble {} decoy: {}", name, fake.describe());
                    continue;
                }
                fake.source = Source::Local;
                fake.evil = Evil::Evil;
                {
                    let p = self.queue.packet(orig);
                    self.sessions.get(p, now).injected_pktnumber += 1;
                }
                log::debug!("new decoy by [{}]: {}", name, fake.describe());
                match fake.position {
                    Position::Anticipation => {
                        self.queue.insert_before(Box::new(fake), orig);
                    }
                    Position::Posticipation => {
                        self.queue.insert_after(Box::new(fake), orig);
                    }
                    Position::AnyPosition => {
                        if self.rng.gen::<bool>() {
                            self.queue.insert_before(Box::new(fake), orig);
                        } else {
                            self.queue.insert_after(Box::new(fake), orig);
                        }
                    }
                    Position::Unassigned => {
                        panic!("BUG[position]: unassigned slipped past the contract check");
                    }
                }
            }
            if self.pool.tracks()[idx].plugin.remove_orig() {
                remove_orig = true;
            }
        }
        // Dropped last so every plugin saw the original in place.
        if remove_orig {
            log::debug!("removing original as requested: {}",
                        self.queue.packet(orig).describe());
            drop(self.queue.remove(orig));
        }
    }

    // Emit due probes for every destination still being resolved. Only
    // destinations touched within the last 30 seconds are worth probing.
    fn exec_ttl_bruteforces(&mut self) {
        let now = self.now;
        let Engine { queue, ttlfoci, .. } = &mut *self;
        for focus in ttlfoci.values_mut() {
            if focus.status != TtlStatus::Known
                && focus.access_timestamp + BRUTEFORCE_ACCESS_WINDOW > now
                && focus.next_probe_time <= now
            {
                inject_ttl_probe(focus, queue, now);
            }
        }
    }
}

// One step of the bruteforce toward a destination: clone the probe
// template with the next TTL, the puppet source port, and the id/seq pair
// its responses are recognized by. A finished round without an answer
// backs off and rearms.
fn inject_ttl_probe(focus: &mut TTLFocus, queue: &mut PacketQueue, now: u64) {
    if focus.status == TtlStatus::Unknown {
        focus.status = TtlStatus::Bruteforce;
    }
    if focus.status != TtlStatus::Bruteforce {
        return;
    }
    if focus.sent_probe == MAX_TTLPROBE {
        if focus.probe_timeout == 0 {
            focus.probe_timeout = now + PROBE_TIMEOUT_GRACE;
        } else if focus.probe_timeout < now {
            log::debug!("giving up bruteforce toward {}", ipv4::ntop(focus.daddr()));
            focus.reset(now);
        }
        return;
    }
    focus.sent_probe += 1;
    let mut probe = focus.probe_dummy.duplicate();
    probe.mark(Source::TtlBforce, Judge::Innocent, Evil::Good);
    ipv4::set_id(probe.ip_mut(),
                 ((focus.rand_key % 64) as u16).wrapping_add(focus.sent_probe as u16));
    ipv4::set_ttl(probe.ip_mut(), focus.sent_probe as u8);
    tcp::set_src_port(probe.l4_mut(), focus.puppet_port);
    tcp::set_seq(probe.l4_mut(), focus.rand_key.wrapping_add(focus.sent_probe));
    probe.fix_checksums();
    log::debug!("bruteforce probe #{} toward {} [estimate {}]",
                focus.sent_probe, ipv4::ntop(focus.daddr()), focus.ttl_estimate);
    queue.insert(Box::new(probe), QueueKind::Send);
    // The next probe is due on the very next cycle.
    focus.next_probe_time = now;
}

// Decide whether a hack fires on this packet. An ALWAYS hack mask is the
// only-plugin test mode and short-circuits. Otherwise a configured port
// decides alone (an explicit NONE silences the port) and an unconfigured
// port falls back to the hack's own frequency.
fn percentage(rng: &mut StdRng, now: u64, packet_number: u32,
              hack_mask: u16, user_mask: u16) -> bool {
    if hack_mask & AGG_ALWAYS != 0 {
        return true;
    }
    let pct = if user_mask != 0 {
        derive_percentage(packet_number, now, user_mask)
    } else {
        derive_percentage(packet_number, now, hack_mask)
    };
    rng.gen_range(1..=100) <= pct
}

// The last modification applied before a packet faces the wire.
//
//   PRESCRIPTION decoys expire an hop short of the peer (needs a KNOWN
//     distance); everything else gets its TTL masked so the real hop
//     distance is never disclosed.
//   MALFORMED decoys get corrupt IP options, degrading to GUILTY when the
//     header has no room; real packets get valid cover options most of
//     the time so the decoys do not stand out.
//   GUILTY decoys leave with a freshly broken transport checksum, applied
//     after the general checksum fix.
fn finalize_packet(pkt: &mut Packet, ttlfoci: &TTLFocusMap, rng: &mut StdRng) -> bool {
    let known_estimate = ttlfoci.find(pkt.daddr())
        .filter(|f| f.status == TtlStatus::Known)
        .map(|f| f.ttl_estimate);
    match known_estimate {
        Some(estimate) => {
            let ttl = if pkt.judge == Judge::Prescription {
                std::cmp::max(1, estimate.saturating_sub(rng.gen_range(1..=5)))
            } else {
                estimate.saturating_add(rng.gen_range(0..=4))
            };
            ipv4::set_ttl(pkt.ip_mut(), ttl);
        }
        None => {
            let jitter: i16 = rng.gen_range(-10..=9);
            let ttl = (ipv4::ttl(pkt.ip()) as i16 + jitter).clamp(1, 255) as u8;
            ipv4::set_ttl(pkt.ip_mut(), ttl);
        }
    }
    if pkt.judge == Judge::Malformed {
        if !pkt.inject_ip_options(true, true, rng) {
            if pkt.choosable_scramble & SCRAMBLE_CHECKSUM != 0 {
                pkt.judge = Judge::Guilty;
            } else {
                return false;
            }
        }
    }
    if pkt.choosable_scramble & SCRAMBLE_MALFORMED != 0 && pkt.evil == Evil::Good {
        if rng.gen_range(0..100) < 66 {
            let _ = pkt.inject_ip_options(false, false, rng);
        }
    }
    pkt.fix_checksums();
    if pkt.judge == Judge::Guilty {
        if pkt.choosable_scramble & SCRAMBLE_CHECKSUM != 0 {
            pkt.corrupt_checksum();
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod selftest {
    use super::*;
    use crate::checksum;
    use crate::plugin::{Plugin, PluginPool, Registry, ENGINE_VERSION};
    use crate::testlib::{icmp_expired_bytes, tcp_bytes, udp_bytes};

    // A configurable forging plugin: one decoy per original, a verbatim
    // copy with the given judge and position.
    struct Forge {
        judge: Judge,
        position: Position,
        supported: u8,
        enabled: u8,
    }

    impl Plugin for Forge {
        fn version(&self) -> &'static str { ENGINE_VERSION }
        fn plugin_name(&self) -> &'static str { "forge" }
        fn hack_name(&self) -> &'static str { "verbatim decoy" }
        fn supported_scrambles(&self) -> u8 { self.supported }
        fn frequency(&self) -> u16 { AGG_ALWAYS }
        fn init(&mut self, enabled: u8) -> bool { self.enabled = enabled; true }
        fn condition(&self, pkt: &Packet, _avail: u8) -> bool {
            pkt.proto == Proto::Tcp && !pkt.is_fragment() && pkt.payload_len() > 0
        }
        fn create_hack(&mut self, pkt: &Packet, _avail: u8, _rng: &mut StdRng) -> Vec<Packet> {
            let mut fake = pkt.duplicate();
            fake.judge = self.judge;
            fake.choosable_scramble = self.enabled & self.supported;
            fake.position = self.position;
            fake.chain = crate::packet::Chain::Final;
            vec![fake]
        }
    }

    fn anticipator() -> Box<dyn Plugin> {
        Box::new(Forge { judge: Judge::Guilty, position: Position::Anticipation,
                         supported: SCRAMBLE_CHECKSUM, enabled: 0 })
    }
    fn anyposer() -> Box<dyn Plugin> {
        Box::new(Forge { judge: Judge::Guilty, position: Position::AnyPosition,
                         supported: SCRAMBLE_CHECKSUM, enabled: 0 })
    }
    fn prescriber() -> Box<dyn Plugin> {
        Box::new(Forge { judge: Judge::Prescription, position: Position::Posticipation,
                         supported: SCRAMBLE_TTL, enabled: 0 })
    }
    fn malformer() -> Box<dyn Plugin> {
        Box::new(Forge { judge: Judge::Malformed, position: Position::Posticipation,
                         supported: SCRAMBLE_MALFORMED | SCRAMBLE_CHECKSUM, enabled: 0 })
    }

    const FORGES: Registry<'static> = &[
        ("anticipator", anticipator),
        ("anyposer", anyposer),
        ("prescriber", prescriber),
        ("malformer", malformer),
    ];

    fn engine(conf: Config, enabler: &str, seed: u64) -> Engine {
        let pool = PluginPool::load(&conf, enabler, FORGES).unwrap();
        Engine::with_seed(conf, pool, seed)
    }

    fn drain(e: &mut Engine, side: Side) -> Vec<Packet> {
        let mut all = Vec::new();
        while let Some(p) = e.read_packet(side) { all.push(p); }
        all
    }

    // Run the bruteforce dance until `daddr` is KNOWN at `distance`,
    // consuming everything emitted along the way. Returns the next tick.
    fn learn_distance(e: &mut Engine, daddr: &str, distance: u32, start: u64) -> u64 {
        let syn = tcp_bytes("10.0.0.1", daddr, 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        let mut now = start;
        for _ in 0..distance {
            e.tick(now);
            now += 1;
        }
        let (rand_key, puppet) = {
            let f = e.ttl_foci().find(ipv4::pton(daddr)).unwrap();
            assert_eq!(f.sent_probe, distance);
            (f.rand_key, f.puppet_port)
        };
        let mut synack = tcp_bytes(daddr, "10.0.0.1", 443, puppet, 5000,
                                   tcp::FLAG_SYN | tcp::FLAG_ACK, 0);
        tcp::set_ack_seq(&mut synack[20..], rand_key.wrapping_add(distance).wrapping_add(1));
        ipv4::set_ttl(&mut synack, 64u8.saturating_sub(distance as u8));
        e.write_packet(Source::Network, &synack);
        e.tick(now);
        now += 1;
        let f = e.ttl_foci().find(ipv4::pton(daddr)).unwrap();
        assert_eq!(f.status, TtlStatus::Known);
        assert_eq!(f.ttl_estimate, distance as u8);
        e.tick(now); // idle pass, the held SYN is out by now
        now += 1;
        drain(e, Side::Network);
        assert!(drain(e, Side::Tunnel).is_empty());
        now
    }

    fn tcp_checksum_ok(p: &Packet) -> bool {
        let l4len = p.len() - p.ip_header_len();
        let init = !ipv4::pseudo_checksum(p.ip(), ipv4::PROTOCOL_TCP, l4len as u16);
        checksum::ipsum(&p.bytes()[p.ip_header_len()..], l4len, init) == 0
    }

    #[test]
    fn syn_triggers_ttl_probe() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 42);
        let syn = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        e.tick(100);
        let (rand_key, puppet) = {
            let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
            assert_eq!(f.status, TtlStatus::Bruteforce);
            assert_eq!(f.sent_probe, 1);
            (f.rand_key, f.puppet_port)
        };
        // One probe faces the network; the original SYN is still held.
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), 1);
        let probe = &out[0];
        assert_eq!(probe.source, Source::TtlBforce);
        assert_eq!(ipv4::ttl(probe.ip()), 1);
        assert_eq!(ipv4::id(probe.ip()), ((rand_key % 64) as u16).wrapping_add(1));
        assert_eq!(tcp::seq(probe.l4()), rand_key.wrapping_add(1));
        assert_eq!(tcp::src_port(probe.l4()), puppet);
        assert!(tcp::syn(probe.l4()) && !tcp::ack(probe.l4()));
        assert!(ipv4::checksum_ok(probe.ip()));
        assert!(tcp_checksum_ok(probe));
        assert!(drain(&mut e, Side::Tunnel).is_empty());
        assert_eq!(e.queue_len(), 1); // the SYN on KEEP
    }

    #[test]
    fn icmp_expired_counts_probe() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 43);
        let syn = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        e.tick(100);
        let probe = drain(&mut e, Side::Network).pop().unwrap();
        // A router at hop 1 quotes the expired probe back at us.
        let expired = icmp_expired_bytes("192.0.2.1", "10.0.0.1", probe.bytes());
        e.write_packet(Source::Network, &expired);
        e.tick(101);
        let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
        assert_eq!(f.received_probe, 1);
        // Expiry at hop 1 is far below the 0xff ceiling: still bruteforcing.
        assert_eq!(f.status, TtlStatus::Bruteforce);
        assert_eq!(f.ttl_estimate, 0xff);
        // Swallowed: nothing surfaces toward the tunnel.
        assert!(drain(&mut e, Side::Tunnel).is_empty());
    }

    #[test]
    fn icmp_expired_recalibrates_at_estimate() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 44);
        let syn = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        e.tick(100);
        let rand_key = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap().rand_key;
        drain(&mut e, Side::Network);
        // Forge an expiry matching the estimate ceiling itself.
        let mut quoted = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443,
                                   rand_key.wrapping_add(0xff), tcp::FLAG_SYN, 0);
        ipv4::set_id(&mut quoted, ((rand_key % 64) as u16).wrapping_add(0xff));
        let expired = icmp_expired_bytes("192.0.2.1", "10.0.0.1", &quoted);
        e.write_packet(Source::Network, &expired);
        e.tick(101);
        let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
        assert_eq!(f.received_probe, 1);
        // The estimate was rebuilt from the expiry (0xff wraps around) and
        // the probe phase of the same tick re-armed the bruteforce.
        assert_eq!(f.ttl_estimate, 0xffu8.wrapping_add(1));
        assert_eq!(f.status, TtlStatus::Bruteforce);
        assert!(drain(&mut e, Side::Tunnel).is_empty());
    }

    #[test]
    fn unrelated_icmp_passes_through() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 45);
        // No focus at all for the quoted destination.
        let quoted = tcp_bytes("10.0.0.1", "9.9.9.9", 1000, 80, 7, tcp::FLAG_SYN, 0);
        let expired = icmp_expired_bytes("192.0.2.1", "10.0.0.1", &quoted);
        e.write_packet(Source::Network, &expired);
        e.tick(100);
        assert_eq!(e.ttl_foci().len(), 0);
        assert_eq!(e.sessions().len(), 0);
        let back = drain(&mut e, Side::Tunnel);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].proto, Proto::Icmp);
    }

    #[test]
    fn synack_learns_distance_and_releases_keep() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 46);
        let syn = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        let mut now = 100;
        for _ in 0..5 {
            e.tick(now);
            now += 1;
        }
        let (rand_key, puppet) = {
            let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
            assert_eq!(f.sent_probe, 5);
            (f.rand_key, f.puppet_port)
        };
        drain(&mut e, Side::Network); // the five probes
        let mut synack = tcp_bytes("8.8.8.8", "10.0.0.1", 443, puppet, 5000,
                                   tcp::FLAG_SYN | tcp::FLAG_ACK, 0);
        tcp::set_ack_seq(&mut synack[20..], rand_key.wrapping_add(5).wrapping_add(1));
        ipv4::set_ttl(&mut synack, 50);
        e.write_packet(Source::Network, &synack);
        e.tick(now);
        now += 1;
        {
            let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
            assert_eq!(f.status, TtlStatus::Known);
            assert_eq!(f.ttl_estimate, 5);
            assert_eq!(f.ttl_synack, 50);
            assert_eq!(f.received_probe, 1);
        }
        // The puppet answer never reaches the tunnel.
        assert!(drain(&mut e, Side::Tunnel).is_empty());
        // Next tick the held SYN leaves with a KNOWN-based TTL.
        e.tick(now);
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), 1);
        let released = &out[0];
        assert_eq!(released.source, Source::Tunnel);
        assert!(tcp::syn(released.l4()));
        assert_eq!(released.dport(), 443);
        let ttl = ipv4::ttl(released.ip());
        assert!((5..=9).contains(&ttl), "ttl {} outside 5..=9", ttl);
        assert!(ipv4::checksum_ok(released.ip()));
        assert!(tcp_checksum_ok(released));
        assert_eq!(e.queue_len(), 0);
    }

    #[test]
    fn anticipation_decoy_precedes_original() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 47);
        let now = learn_distance(&mut e, "8.8.8.8", 4, 100);
        let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1000,
                             tcp::FLAG_ACK | tcp::FLAG_PSH, 64);
        e.write_packet(Source::Tunnel, &data);
        e.tick(now);
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), 2);
        for p in &out {
            assert!(p.len() <= 1500);
            assert_eq!(ipv4::total_len(p.ip()) as usize, p.len());
        }
        let (decoy, orig) = (&out[0], &out[1]);
        assert_eq!(decoy.source, Source::Local);
        assert_eq!(decoy.evil, Evil::Evil);
        assert!(ipv4::checksum_ok(decoy.ip()));
        assert!(!tcp_checksum_ok(decoy), "decoy must carry a broken TCP sum");
        assert_eq!(orig.source, Source::Tunnel);
        assert!(tcp_checksum_ok(orig));
        assert_eq!(&orig.payload()[..], &data[40..]);
        assert_eq!(e.sessions().len(), 1);
    }

    #[test]
    fn any_position_splits_evenly() {
        let mut e = engine(Config::default(), "anyposer,CHECKSUM\n", 48);
        let now = learn_distance(&mut e, "8.8.8.8", 3, 100);
        let runs = 200;
        for i in 0..runs {
            let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 2000 + i,
                                 tcp::FLAG_ACK | tcp::FLAG_PSH, 32);
            e.write_packet(Source::Tunnel, &data);
        }
        e.tick(now);
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), (runs * 2) as usize);
        let mut before = 0;
        let mut after = 0;
        for pair in out.chunks(2) {
            match (pair[0].source, pair[1].source) {
                (Source::Local, Source::Tunnel) => before += 1,
                (Source::Tunnel, Source::Local) => after += 1,
                other => panic!("stream out of order: {:?}", other),
            }
            assert_eq!(tcp::seq(pair[0].l4()), tcp::seq(pair[1].l4()));
        }
        println!("anticipated {} posticipated {}", before, after);
        assert!(before > runs / 4 && after > runs / 4,
                "skew: {} vs {}", before, after);
    }

    #[test]
    fn prescription_expires_short_of_peer() {
        let mut e = engine(Config::default(), "prescriber,TTL\n", 49);
        let now = learn_distance(&mut e, "8.8.8.8", 10, 100);
        for i in 0..50 {
            let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 3000 + i,
                                 tcp::FLAG_ACK | tcp::FLAG_PSH, 32);
            e.write_packet(Source::Tunnel, &data);
        }
        e.tick(now);
        let out = drain(&mut e, Side::Network);
        let decoys: Vec<&Packet> = out.iter().filter(|p| p.source == Source::Local).collect();
        assert_eq!(decoys.len(), 50);
        for d in decoys {
            let ttl = ipv4::ttl(d.ip());
            assert!((5..=9).contains(&ttl), "prescription ttl {} not short of 10", ttl);
            // TTL decoys keep their checksums intact.
            assert!(tcp_checksum_ok(d));
        }
        // Originals travel at or past the estimate.
        for p in out.iter().filter(|p| p.source == Source::Tunnel) {
            assert!((10..=14).contains(&ipv4::ttl(p.ip())));
        }
    }

    #[test]
    fn blacklisted_flow_passes_unmangled() {
        let mut conf = Config::default();
        let mut blacklist = std::collections::HashSet::new();
        blacklist.insert(ipv4::pton("8.8.8.8"));
        conf.blacklist = Some(blacklist);
        let mut e = engine(conf, "anticipator,CHECKSUM\n", 50);
        let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 4000,
                             tcp::FLAG_ACK | tcp::FLAG_PSH, 64);
        e.write_packet(Source::Tunnel, &data);
        e.tick(100);
        assert_eq!(e.sessions().len(), 0);
        assert_eq!(e.ttl_foci().len(), 0);
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.len(), data.len());
        assert_eq!(&p.payload()[..], &data[40..]);
        assert_eq!(p.ip_header_len(), 20); // no cover options either
        let ttl = ipv4::ttl(p.ip()) as i32;
        assert!((64 - 10..=64 + 9).contains(&ttl));
        assert!(ipv4::checksum_ok(p.ip()));
        assert!(tcp_checksum_ok(p));
    }

    #[test]
    fn whitelist_excludes_the_rest() {
        let mut conf = Config::default();
        let mut whitelist = std::collections::HashSet::new();
        whitelist.insert(ipv4::pton("1.1.1.1"));
        conf.whitelist = Some(whitelist);
        let mut e = engine(conf, "anticipator,CHECKSUM\n", 51);
        let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 4000,
                             tcp::FLAG_ACK | tcp::FLAG_PSH, 16);
        e.write_packet(Source::Tunnel, &data);
        e.tick(100);
        assert_eq!(e.sessions().len(), 0);
        assert_eq!(drain(&mut e, Side::Network).len(), 1);
    }

    #[test]
    fn malformed_degrades_to_guilty_without_room() {
        // 68-byte MTU leaves no space for IP options: the MALFORMED decoy
        // silently degrades to a checksum kill.
        let conf = Config {
            mtu: 68,
            only_plugin: Some("malformer,MALFORMED,CHECKSUM".to_string()),
            ..Config::default()
        };
        let mut e = engine(conf, "", 52);
        let now = learn_distance(&mut e, "8.8.8.8", 4, 100);
        let data = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 5000,
                             tcp::FLAG_ACK | tcp::FLAG_PSH, 28);
        assert_eq!(data.len(), 68);
        e.write_packet(Source::Tunnel, &data);
        e.tick(now);
        let out = drain(&mut e, Side::Network);
        assert_eq!(out.len(), 2);
        let (orig, decoy) = (&out[0], &out[1]);
        assert_eq!(orig.source, Source::Tunnel);
        assert!(tcp_checksum_ok(orig));
        assert_eq!(decoy.source, Source::Local);
        assert_eq!(decoy.judge, Judge::Guilty);
        assert_eq!(decoy.ip_header_len(), 20);
        assert!(ipv4::checksum_ok(decoy.ip()));
        assert!(!tcp_checksum_ok(decoy));
    }

    #[test]
    fn ingress_never_grows_the_maps() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 53);
        for i in 0..20u32 {
            let saddr = format!("198.51.100.{}", i + 1);
            let t = tcp_bytes(&saddr, "10.0.0.1", 443, 50000, i,
                              tcp::FLAG_SYN | tcp::FLAG_ACK, 0);
            e.write_packet(Source::Network, &t);
            let quoted = tcp_bytes("10.0.0.1", &saddr, 50000, 443, i, tcp::FLAG_SYN, 0);
            e.write_packet(Source::Network, &icmp_expired_bytes(&saddr, "10.0.0.1", &quoted));
            e.write_packet(Source::Network, &udp_bytes(&saddr, "10.0.0.1", 53, 40000, 24));
        }
        e.tick(100);
        assert_eq!(e.sessions().len(), 0);
        assert_eq!(e.ttl_foci().len(), 0);
        // All sixty packets pass through toward the tunnel.
        assert_eq!(drain(&mut e, Side::Tunnel).len(), 60);
        assert!(drain(&mut e, Side::Network).is_empty());
    }

    #[test]
    fn malformed_writes_are_dropped_quietly() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 54);
        e.write_packet(Source::Tunnel, &[0x45, 0x00, 0x00]);
        e.write_packet(Source::Tunnel, &[0u8; 48]); // version 0, tot_len 0
        let mut bad = tcp_bytes("10.0.0.1", "8.8.8.8", 1, 2, 3, 0, 0);
        ipv4::set_total_len(&mut bad, 2000);
        e.write_packet(Source::Tunnel, &bad);
        assert_eq!(e.queue_len(), 0);
        e.tick(100);
        assert!(drain(&mut e, Side::Network).is_empty());
    }

    #[test]
    fn topology_hook_fires_on_known_peer_drift() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 55);
        let now = learn_distance(&mut e, "8.8.8.8", 4, 100);
        let seen = std::rc::Rc::new(std::cell::Cell::new((0u32, 0u8, 0u8)));
        let inner = seen.clone();
        e.set_topology_hook(Box::new(move |addr, expected, got| {
            inner.set((addr, expected, got));
        }));
        // The peer suddenly answers from a different distance.
        let mut t = tcp_bytes("8.8.8.8", "10.0.0.1", 443, 54321, 6000, tcp::FLAG_ACK, 0);
        ipv4::set_ttl(&mut t, 33);
        e.write_packet(Source::Network, &t);
        e.tick(now);
        let (addr, expected, got) = seen.get();
        assert_eq!(addr, ipv4::pton("8.8.8.8"));
        assert_eq!(expected, 60);
        assert_eq!(got, 33);
        // Observation only: the focus stays KNOWN.
        assert_eq!(e.ttl_foci().find(addr).unwrap().status, TtlStatus::Known);
        assert_eq!(drain(&mut e, Side::Tunnel).len(), 1);
    }

    #[test]
    fn bruteforce_gives_up_and_releases() {
        let mut e = engine(Config::default(), "anticipator,CHECKSUM\n", 56);
        let syn = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 1, tcp::FLAG_SYN, 0);
        e.write_packet(Source::Tunnel, &syn);
        let mut now = 100;
        // All probes go unanswered, then the grace period lapses.
        for _ in 0..MAX_TTLPROBE + 5 {
            e.tick(now);
            now += 1;
        }
        {
            let f = e.ttl_foci().find(ipv4::pton("8.8.8.8")).unwrap();
            assert_eq!(f.status, TtlStatus::Unknown);
            assert_eq!(f.sent_probe, 0);
            assert_eq!(f.ttl_estimate, 0xff);
        }
        let out = drain(&mut e, Side::Network);
        let probes = out.iter().filter(|p| p.source == Source::TtlBforce).count();
        assert_eq!(probes, MAX_TTLPROBE as usize);
        // The flow was released during the back-off instead of stalling.
        let syns: Vec<&Packet> = out.iter().filter(|p| p.source == Source::Tunnel).collect();
        assert_eq!(syns.len(), 1);
        assert!(tcp::syn(syns[0].l4()));
        assert_eq!(e.queue_len(), 0);
    }

    #[test]
    fn percentage_gate() {
        let mut rng = StdRng::seed_from_u64(57);
        // ALWAYS in the hack mask short-circuits.
        for _ in 0..50 {
            assert!(percentage(&mut rng, 1, 1, AGG_ALWAYS, AGG_NONE));
        }
        // An explicit NONE on the port silences the hack entirely.
        for _ in 0..200 {
            assert!(!percentage(&mut rng, 1, 1, AGG_COMMON, AGG_NONE));
        }
        // An unconfigured port falls back to the hack frequency.
        let fired = (0..2000)
            .filter(|_| percentage(&mut rng, 1, 50, AGG_COMMON, 0))
            .count();
        println!("COMMON fallback fired {}/2000", fired);
        assert!((600..1000).contains(&fired), "COMMON fired {}/2000", fired);
        // A configured port overrides the hack frequency.
        let fired = (0..2000)
            .filter(|_| percentage(&mut rng, 1, 50, AGG_VERYRARE, AGG_HEAVY))
            .count();
        println!("HEAVY override fired {}/2000", fired);
        assert!((1300..1700).contains(&fired), "HEAVY fired {}/2000", fired);
    }

    #[test]
    fn finalize_is_deterministic_under_a_fixed_seed() {
        let ttlfoci = TTLFocusMap::new();
        let bytes = tcp_bytes("10.0.0.1", "8.8.8.8", 54321, 443, 7000,
                              tcp::FLAG_ACK | tcp::FLAG_PSH, 48);
        let mut first = Packet::parse(bytes.clone(), 1500).unwrap();
        first.mark(Source::Tunnel, Judge::Innocent, Evil::Good);
        let mut second = Packet::parse(bytes, 1500).unwrap();
        second.mark(Source::Tunnel, Judge::Innocent, Evil::Good);
        let mut rng1 = StdRng::seed_from_u64(99);
        let mut rng2 = StdRng::seed_from_u64(99);
        assert!(finalize_packet(&mut first, &ttlfoci, &mut rng1));
        assert!(finalize_packet(&mut second, &ttlfoci, &mut rng2));
        assert_eq!(first.bytes(), second.bytes());
    }
}
