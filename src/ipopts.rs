use super::ipv4;
use super::packet::Packet;

use rand::rngs::StdRng;
use rand::Rng;

// IP OPTION INJECTION
//
// This module writes IP option blocks into a packet's header space, either
// valid-looking cover options (so real traffic and decoys share the same
// silhouette) or deliberately broken ones (so the remote peer's option
// parser discards the decoy while an on-path observer sees nothing odd).
//
//   IPOPT_NOOP / IPOPT_EOL / IPOPT_RR / IPOPT_LSRR - option kinds
//   inject(&mut Packet, corrupt, strip, rng) -> bool
//     grow the IP header and write an option block; false when neither the
//     60-byte header ceiling nor the MTU leaves room for one

pub const IPOPT_EOL: u8 = 0;
pub const IPOPT_NOOP: u8 = 1;
pub const IPOPT_RR: u8 = 7;
pub const IPOPT_LSRR: u8 = 0x83;

// Grow the header by a random multiple of four and write one option block
// into the new space. With `strip` any pre-existing options are dropped
// first; without it the block lands after them.
pub fn inject(pkt: &mut Packet, corrupt: bool, strip: bool, rng: &mut StdRng) -> bool {
    if strip && pkt.ip_header_len() > ipv4::MIN_HEADER {
        pkt.ip_header_resize(ipv4::MIN_HEADER);
    }
    let hdrlen = pkt.ip_header_len();
    let ceiling = std::cmp::min(ipv4::MAX_HEADER - hdrlen, pkt.free_space());
    let room = ceiling - ceiling % 4;
    if room < 4 {
        return false;
    }
    let optlen = 4 * rng.gen_range(1..=room / 4);
    pkt.ip_header_resize(hdrlen + optlen);
    let opts = &mut pkt.ip_mut()[hdrlen..hdrlen + optlen];
    if corrupt {
        write_corrupt_block(opts, rng);
    } else {
        write_cover_block(opts);
    }
    true
}

// A source-route option whose length byte runs past the header: any
// conforming receiver aborts option parsing and drops the datagram.
fn write_corrupt_block(opts: &mut [u8], rng: &mut StdRng) {
    let n = opts.len();
    opts[0] = IPOPT_LSRR;
    opts[1] = (n as u8).wrapping_add(rng.gen_range(1..=4));
    opts[2] = 4;
    for b in &mut opts[3..] { *b = 0; }
}

// A well-formed record-route option with empty slots, closed with EOL.
fn write_cover_block(opts: &mut [u8]) {
    let n = opts.len();
    opts[0] = IPOPT_RR;
    opts[1] = (n - 1) as u8;
    opts[2] = 4;
    for b in &mut opts[3..n - 1] { *b = 0; }
    opts[n - 1] = IPOPT_EOL;
}
