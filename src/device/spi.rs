//! SPI endpoint state machine (`SPEC_FULL.md` §4.4.3).
//!
//! Transfers are full-duplex: the VM's `TX` payload is write data, and the
//! client accumulates read data from the callback into a per-transaction
//! buffer until the whole transfer is consumed, then emits one `RX` packet
//! carrying exactly as many bytes as the original `TX`.

use tracing::trace;

use crate::protocol::{Packet, spi as wire};

use super::Advance;

/// Largest chunk handed to [`SpiCallbacks::xfr`] per call, matching the
/// source's per-call transfer cap.
const CHUNK: usize = 256;

pub trait SpiCallbacks {
    /// Chip-select line changed; `asserted` mirrors `bflag[0]`.
    fn cs(&mut self, asserted: bool);

    /// Full-duplex transfer of `wr.len()` bytes (`<= 256`); writes the
    /// simultaneously-clocked-in bytes into `rd` (same length as `wr`) and
    /// returns how many bytes were transferred this call. `0` stalls.
    fn xfr(&mut self, wr: &[u8], rd: &mut [u8]) -> usize;
}

pub struct SpiState {
    pub callbacks: Box<dyn SpiCallbacks + Send>,
    /// Bytes of read data collected for the in-progress transfer.
    rd_accum: Vec<u8>,
}

impl SpiState {
    #[must_use]
    pub fn new(callbacks: Box<dyn SpiCallbacks + Send>) -> Self {
        Self { callbacks, rd_accum: Vec::new() }
    }
}

pub(crate) fn step(
    state: &mut SpiState,
    conn: u16,
    busy: &mut bool,
    offset: &mut u32,
    pkt: &Packet,
    emit: &mut dyn FnMut(Packet),
) -> Advance {
    match pkt.pkt {
        wire::CS => {
            state.callbacks.cs(pkt.bflag & 0x01 != 0);
            Advance::Consumed
        }
        wire::TX => {
            loop {
                let have = *offset as usize;
                let total = pkt.data.len();
                if have >= total {
                    let rd = std::mem::take(&mut state.rd_accum);
                    *offset = 0;
                    emit(Packet::new(conn, wire::RX, 0, pkt.hflag, rd));
                    return Advance::Consumed;
                }
                let chunk_len = (total - have).min(CHUNK);
                let wr = &pkt.data[have..have + chunk_len];
                let base = state.rd_accum.len();
                state.rd_accum.resize(base + chunk_len, 0);
                let n = state.callbacks.xfr(wr, &mut state.rd_accum[base..base + chunk_len]);
                if n == 0 {
                    state.rd_accum.truncate(base);
                    *busy = true;
                    return Advance::Stop;
                }
                state.rd_accum.truncate(base + n);
                *offset += n as u32;
            }
        }
        other => {
            trace!(other, "coremodel: spi: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Loopback;

    impl SpiCallbacks for Loopback {
        fn cs(&mut self, _asserted: bool) {}
        fn xfr(&mut self, wr: &[u8], rd: &mut [u8]) -> usize {
            for (o, i) in rd.iter_mut().zip(wr) {
                *o = i.wrapping_mul(0x10);
            }
            wr.len()
        }
    }

    #[test]
    fn full_duplex_transfer_echoes_same_length_and_transaction_index() {
        let mut state = SpiState::new(Box::new(Loopback));
        let mut busy = false;
        let mut offset = 0;
        let pkt = Packet::new(2, wire::TX, 0, 7, vec![0x01, 0x02, 0x03]);
        let mut emitted = Vec::new();
        let outcome =
            step(&mut state, 2, &mut busy, &mut offset, &pkt, &mut |p| emitted.push(p));
        assert!(matches!(outcome, Advance::Consumed));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].hflag, 7);
        assert_eq!(emitted[0].data, vec![0x10, 0x20, 0x30]);
    }
}
