//! Extracts length-prefixed packets out of the receive ring.
//!
//! See `SPEC_FULL.md` §4.2. The original C implementation has a bug where a
//! packet straddling the ring's wrap point only copies 8 bytes of its second
//! segment; this copies the full `dlen - step` remainder instead.

use tracing::debug;

use crate::{
    protocol::{HEADER_SIZE, MAX_PKT, pad4},
    ring::RxRing,
};

/// Drains every complete packet currently available in `ring`, calling
/// `on_packet` with a view of each one (header included). `on_packet`
/// returns `false` to signal the dispatcher couldn't handle the packet
/// (e.g. an allocation failure downstream); the framer stops for this call
/// but leaves the unconsumed packet in the ring for the next drive.
pub fn drain(ring: &mut RxRing, mut on_packet: impl FnMut(&[u8]) -> bool) {
    loop {
        if ring.available() < HEADER_SIZE {
            break;
        }

        let len = ring.peek_len_header() as usize;
        let dlen = pad4(len);
        if ring.available() < dlen {
            break;
        }

        if dlen > MAX_PKT {
            debug!(len, dlen, "coremodel: discarding oversized packet");
            ring.advance_read(dlen);
            continue;
        }

        if let Some(slice) = ring.contiguous_slice(dlen) {
            if !on_packet(slice) {
                break;
            }
        } else {
            let owned = ring.copy_contiguous(dlen);
            if !on_packet(&owned) {
                break;
            }
        }

        ring.advance_read(dlen);
    }
}
