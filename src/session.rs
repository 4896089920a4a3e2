use super::ipv4;
use super::packet::Packet;

use std::collections::HashMap;

// SESSION TRACKING
//
// Per-flow bookkeeping for outbound traffic: one record per 5-tuple,
// carrying the packet count the probability gates key on and the decoy
// count injected into the flow. The map is bounded both by entry count
// and by idle age, and is only ever grown from the tunnel side, so a
// remote peer cannot inflate it.
//
//   SessionKey - (saddr, daddr, sport, dport, proto)
//   SessionTrack - per-session counters + last access stamp
//   SessionTrackMap.get(&Packet, now) - fetch or create from a packet
//   SessionTrackMap.find(&SessionKey) - fetch only, never creates
//   SessionTrackMap.manage(now) - expire idle entries, evict past bounds

pub const SESSION_MAX_ENTRIES: usize = 4096;
pub const SESSION_IDLE_TIMEOUT: u64 = 600;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SessionKey {
    pub saddr: ipv4::Address,
    pub daddr: ipv4::Address,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
}

impl SessionKey {
    pub fn of(pkt: &Packet) -> SessionKey {
        SessionKey {
            saddr: pkt.saddr(),
            daddr: pkt.daddr(),
            sport: pkt.sport(),
            dport: pkt.dport(),
            proto: ipv4::protocol(pkt.ip()),
        }
    }
}

pub struct SessionTrack {
    pub packet_number: u32,
    pub injected_pktnumber: u32,
    pub access_timestamp: u64,
}

pub struct SessionTrackMap {
    map: HashMap<SessionKey, SessionTrack>,
}

impl SessionTrackMap {

    pub fn new() -> SessionTrackMap {
        SessionTrackMap { map: HashMap::new() }
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn get(&mut self, pkt: &Packet, now: u64) -> &mut SessionTrack {
        let key = SessionKey::of(pkt);
        let session = self.map.entry(key).or_insert_with(|| SessionTrack {
            packet_number: 0,
            injected_pktnumber: 0,
            access_timestamp: now,
        });
        session.access_timestamp = now;
        session
    }

    pub fn find(&mut self, key: &SessionKey) -> Option<&mut SessionTrack> {
        self.map.get_mut(key)
    }

    // Expire idle sessions, then shed the oldest entries past the size
    // bound. Called once per tick after the SEND fixups.
    pub fn manage(&mut self, now: u64) {
        self.map.retain(|_, s| s.access_timestamp + SESSION_IDLE_TIMEOUT > now);
        if self.map.len() > SESSION_MAX_ENTRIES {
            let mut stamps: Vec<(SessionKey, u64)> = self.map.iter()
                .map(|(k, s)| (*k, s.access_timestamp))
                .collect();
            stamps.sort_by_key(|&(_, at)| at);
            for (key, _) in stamps.iter().take(self.map.len() - SESSION_MAX_ENTRIES) {
                self.map.remove(key);
            }
        }
    }
}
