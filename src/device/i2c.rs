//! I²C endpoint state machine (`SPEC_FULL.md` §4.4.2).
//!
//! Transactions are correlated by a transaction index carried in `hflag`;
//! the client stores it as `trnidx` on `START` and echoes it back in every
//! `DONE` emitted for that transaction.

use tracing::trace;

use crate::protocol::{Packet, i2c as wire};

use super::Advance;

const SCRATCH_SIZE: usize = 256;

/// Application hooks for an I²C endpoint.
pub trait I2cCallbacks {
    /// VM issued `START`. Returns `1` (ACK), `-1` (NAK), or `0` (stall).
    fn start(&mut self) -> i32;

    /// VM wrote `data`. Returns the number of bytes accepted (`>0`), `-1`
    /// to NAK the whole write, or `0` to stall.
    fn write(&mut self, data: &[u8]) -> i32;

    /// VM requested a read. Writes up to `scratch.len()` bytes into
    /// `scratch` and returns how many were produced this call; `0` stalls.
    fn read(&mut self, scratch: &mut [u8]) -> usize;

    /// VM issued `STOP`.
    fn stop(&mut self);
}

pub struct I2cState {
    pub callbacks: Box<dyn I2cCallbacks + Send>,
    pub trnidx: u16,
    scratch: Box<[u8; SCRATCH_SIZE]>,
}

impl I2cState {
    #[must_use]
    pub fn new(callbacks: Box<dyn I2cCallbacks + Send>) -> Self {
        Self { callbacks, trnidx: 0, scratch: Box::new([0; SCRATCH_SIZE]) }
    }
}

fn ack_expected(bflag: u8) -> bool {
    bflag & 0x01 != 0
}

pub(crate) fn step(
    state: &mut I2cState,
    conn: u16,
    busy: &mut bool,
    offset: &mut u32,
    pkt: &Packet,
    emit: &mut dyn FnMut(Packet),
) -> Advance {
    match pkt.pkt {
        wire::START => {
            state.trnidx = pkt.hflag;
            let want_ack = ack_expected(pkt.bflag);
            match state.callbacks.start() {
                0 => {
                    *busy = true;
                    Advance::Stop
                }
                nak if nak < 0 => {
                    if want_ack {
                        emit(Packet::new(conn, wire::DONE, 1, state.trnidx, Vec::new()));
                    }
                    Advance::Consumed
                }
                _ack => {
                    if want_ack {
                        emit(Packet::new(conn, wire::DONE, 0, state.trnidx, Vec::new()));
                    }
                    Advance::Consumed
                }
            }
        }
        wire::WRITE => {
            state.trnidx = pkt.hflag;
            let want_ack = ack_expected(pkt.bflag);
            loop {
                let remaining = &pkt.data[*offset as usize..];
                if remaining.is_empty() {
                    *offset = 0;
                    return Advance::Consumed;
                }
                match state.callbacks.write(remaining) {
                    0 => {
                        *busy = true;
                        return Advance::Stop;
                    }
                    n if n < 0 => {
                        *offset = 0;
                        if want_ack {
                            emit(Packet::new(conn, wire::DONE, 1, state.trnidx, Vec::new()));
                        }
                        return Advance::Consumed;
                    }
                    n => {
                        *offset += n as u32;
                        if (*offset as usize) >= pkt.data.len() {
                            *offset = 0;
                            if want_ack {
                                emit(Packet::new(conn, wire::DONE, 0, state.trnidx, Vec::new()));
                            }
                            return Advance::Consumed;
                        }
                    }
                }
            }
        }
        wire::READ => {
            state.trnidx = pkt.hflag;
            let want = pkt.bflag as usize;
            loop {
                let have = *offset as usize;
                if have >= want {
                    let data = state.scratch[..want].to_vec();
                    *offset = 0;
                    emit(Packet::new(conn, wire::DONE, 0, state.trnidx, data));
                    return Advance::Consumed;
                }
                let n = state.callbacks.read(&mut state.scratch[have..want]);
                if n == 0 {
                    *busy = true;
                    return Advance::Stop;
                }
                *offset += n as u32;
            }
        }
        wire::STOP => {
            state.callbacks.stop();
            Advance::Consumed
        }
        other => {
            trace!(other, "coremodel: i2c: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

/// Encodes an unsolicited `DONE` carrying up to 255 bytes of speculatively
/// prepared read data, tagged with the endpoint's current transaction index.
#[must_use]
pub fn encode_push_read(state: &I2cState, conn: u16, data: &[u8]) -> Packet {
    let len = data.len().min(255);
    Packet::new(conn, wire::DONE, 0, state.trnidx, data[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        start_ret: i32,
        write_ret: i32,
        stopped: bool,
    }

    impl I2cCallbacks for Fixture {
        fn start(&mut self) -> i32 {
            self.start_ret
        }
        fn write(&mut self, data: &[u8]) -> i32 {
            if self.write_ret < 0 { self.write_ret } else { data.len() as i32 }
        }
        fn read(&mut self, scratch: &mut [u8]) -> usize {
            scratch.fill(0xAB);
            scratch.len()
        }
        fn stop(&mut self) {
            self.stopped = true;
        }
    }

    fn make(start_ret: i32, write_ret: i32) -> I2cState {
        I2cState::new(Box::new(Fixture { start_ret, write_ret, stopped: false }))
    }

    #[test]
    fn start_ack_emits_done_with_matching_transaction_index() {
        let mut state = make(1, 0);
        let mut busy = false;
        let mut offset = 0;
        let pkt = Packet::new(3, wire::START, 1, 42, Vec::new());
        let mut emitted = Vec::new();
        let outcome =
            step(&mut state, 3, &mut busy, &mut offset, &pkt, &mut |p| emitted.push(p));
        assert!(matches!(outcome, Advance::Consumed));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].hflag, 42);
        assert_eq!(emitted[0].bflag, 0);
    }

    #[test]
    fn write_nak_emits_done_and_drops_remaining_payload() {
        let mut state = make(1, -1);
        let mut busy = false;
        let mut offset = 0;
        let pkt = Packet::new(3, wire::WRITE, 1, 7, vec![0xAA, 0xBB]);
        let mut emitted = Vec::new();
        let outcome =
            step(&mut state, 3, &mut busy, &mut offset, &pkt, &mut |p| emitted.push(p));
        assert!(matches!(outcome, Advance::Consumed));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].bflag, 1);
        assert_eq!(offset, 0);
    }

    #[test]
    fn read_emits_done_with_full_requested_length() {
        let mut state = make(1, 0);
        let mut busy = false;
        let mut offset = 0;
        let pkt = Packet::new(3, wire::READ, 0, 5, Vec::new());
        // bflag is the requested count, not hflag; set directly.
        let pkt = Packet { bflag: 4, ..pkt };
        let mut emitted = Vec::new();
        step(&mut state, 3, &mut busy, &mut offset, &pkt, &mut |p| emitted.push(p));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].data, vec![0xAB; 4]);
    }
}
