use super::packet::{Chain, Packet, Position, Proto};
use super::plugin::{random_damage, Constructor, Plugin, Registry, ENGINE_VERSION};
use super::scramble::*;
use super::tcp;

use rand::rngs::StdRng;

// BUILT-IN HACKS
//
// The stock mangling plugins compiled into the registry. Each forges
// decoys that a passive observer must take as part of the session while
// the remote peer provably discards them (per the judge assigned from the
// scrambles available for the destination).
//
//   fake_data - a copy of the original segment carrying noise payload
//   fake_close - a forged RST ahead of the original, to desync trackers
//   BUILTIN - the compiled-in registry handed to PluginPool::load

// A decoy that repeats the original segment with a random payload. An
// observer reassembling the stream records the noise bytes; the peer
// never acknowledges them.
pub struct FakeData {
    enabled: u8,
}

impl Plugin for FakeData {
    fn version(&self) -> &'static str { ENGINE_VERSION }
    fn plugin_name(&self) -> &'static str { "fake_data" }
    fn hack_name(&self) -> &'static str { "fake data injection" }
    fn supported_scrambles(&self) -> u8 {
        SCRAMBLE_TTL | SCRAMBLE_CHECKSUM | SCRAMBLE_MALFORMED
    }
    fn frequency(&self) -> u16 { AGG_COMMON }

    fn init(&mut self, enabled_scrambles: u8) -> bool {
        self.enabled = enabled_scrambles;
        true
    }

    fn condition(&self, pkt: &Packet, _avail: u8) -> bool {
        pkt.proto == Proto::Tcp && !pkt.is_fragment() && pkt.payload_len() > 0
    }

    fn create_hack(&mut self, pkt: &Packet, avail: u8, rng: &mut StdRng) -> Vec<Packet> {
        let usable = avail & self.enabled & self.supported_scrambles();
        let mut fake = pkt.duplicate();
        fake.payload_random_fill(rng);
        fake.randomize_ip_id(rng);
        fake.judge = random_damage(rng, usable);
        fake.choosable_scramble = usable;
        fake.position = Position::AnyPosition;
        fake.chain = Chain::Final;
        vec![fake]
    }
}

// A forged RST carrying the current sequence point. A tracker that honors
// it declares the session closed and stops inspecting the real stream;
// the peer discards it.
pub struct FakeClose {
    enabled: u8,
}

impl Plugin for FakeClose {
    fn version(&self) -> &'static str { ENGINE_VERSION }
    fn plugin_name(&self) -> &'static str { "fake_close" }
    fn hack_name(&self) -> &'static str { "fake RST injection" }
    fn supported_scrambles(&self) -> u8 {
        SCRAMBLE_TTL | SCRAMBLE_CHECKSUM | SCRAMBLE_MALFORMED
    }
    fn frequency(&self) -> u16 { AGG_RARE | AGG_STARTPEEK }

    fn init(&mut self, enabled_scrambles: u8) -> bool {
        self.enabled = enabled_scrambles;
        true
    }

    fn condition(&self, pkt: &Packet, _avail: u8) -> bool {
        pkt.proto == Proto::Tcp && !pkt.is_fragment()
            && !tcp::syn(pkt.l4()) && !tcp::rst(pkt.l4())
    }

    fn create_hack(&mut self, pkt: &Packet, avail: u8, rng: &mut StdRng) -> Vec<Packet> {
        let usable = avail & self.enabled & self.supported_scrambles();
        let mut fake = pkt.duplicate();
        fake.tcp_payload_resize(0);
        tcp::set_flags(fake.l4_mut(), tcp::FLAG_RST | tcp::FLAG_ACK);
        fake.randomize_ip_id(rng);
        fake.judge = random_damage(rng, usable);
        fake.choosable_scramble = usable;
        fake.position = Position::Anticipation;
        fake.chain = Chain::Final;
        vec![fake]
    }
}

fn new_fake_data() -> Box<dyn Plugin> { Box::new(FakeData { enabled: 0 }) }
fn new_fake_close() -> Box<dyn Plugin> { Box::new(FakeClose { enabled: 0 }) }

pub const BUILTIN: Registry<'static> = &[
    ("fake_data", new_fake_data as Constructor),
    ("fake_close", new_fake_close as Constructor),
];
