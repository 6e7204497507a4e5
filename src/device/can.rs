//! CAN endpoint state machine (`SPEC_FULL.md` §4.4.6).
//!
//! Every frame carries a 64-bit control word and a 64-bit extended control
//! word ahead of the payload; the payload length is derived from the DLC
//! field of the first control word via the CAN-FD/XL lookup table.

use tracing::{debug, trace};

use crate::protocol::{Packet, can as wire};

use super::Advance;

const CTRL_WORDS_LEN: usize = 16;

pub trait CanCallbacks {
    /// A frame arrived from the VM. Returns `ACK`/`NAK`/`STALL`
    /// ([`wire::ACK`], [`wire::NAK`], [`wire::STALL`]).
    fn tx(&mut self, ctrl: u64, ext_ctrl: u64, data: &[u8]) -> i32;

    /// A previously transmitted [`CanState`] frame completed; `nak`
    /// mirrors the VM's acknowledgement.
    fn rxcomplete(&mut self, _nak: bool) {}
}

pub struct CanState {
    pub callbacks: Box<dyn CanCallbacks + Send>,
    trnidx: u8,
    rx_outstanding: bool,
    /// Set when a `TX` stalled the callback. Scoped to the `TX` sub-stream
    /// only, not the generic per-endpoint busy flag, so a stalled `TX`
    /// never blocks a queued `RX_ACK` from being examined.
    busy: bool,
}

impl CanState {
    #[must_use]
    pub fn new(callbacks: Box<dyn CanCallbacks + Send>) -> Self {
        Self { callbacks, trnidx: 0, rx_outstanding: false, busy: false }
    }
}

/// Decodes the DLC field (control word bits[3:0]) into a frame data length.
#[must_use]
pub fn dlc_len(ctrl: u64) -> usize {
    wire::DATA_LEN[(ctrl & 0xF) as usize]
}

fn split_ctrl(data: &[u8]) -> Option<(u64, u64, &[u8])> {
    if data.len() < CTRL_WORDS_LEN {
        return None;
    }
    let ctrl = u64::from_le_bytes(data[0..8].try_into().unwrap());
    let ext_ctrl = u64::from_le_bytes(data[8..16].try_into().unwrap());
    Some((ctrl, ext_ctrl, &data[CTRL_WORDS_LEN..]))
}

pub(crate) fn step(state: &mut CanState, conn: u16, pkt: &Packet, emit: &mut dyn FnMut(Packet)) -> Advance {
    match pkt.pkt {
        wire::TX => {
            if state.busy {
                // Already stalled from a previous call; leave it queued and
                // let the scan reach whatever follows (e.g. an RX_ACK).
                return Advance::Skip;
            }
            let Some((ctrl, ext_ctrl, data)) = split_ctrl(&pkt.data) else {
                debug!(len = pkt.data.len(), "coremodel: can: TX shorter than control words, dropping");
                return Advance::Consumed;
            };
            match state.callbacks.tx(ctrl, ext_ctrl, data) {
                wire::STALL => {
                    state.busy = true;
                    Advance::Skip
                }
                wire::NAK => {
                    emit(Packet::new(conn, wire::TX_ACK, 0, 1, Vec::new()));
                    Advance::Consumed
                }
                _ack => {
                    emit(Packet::new(conn, wire::TX_ACK, 0, 0, Vec::new()));
                    Advance::Consumed
                }
            }
        }
        wire::RX_ACK => {
            if state.rx_outstanding && pkt.bflag == state.trnidx {
                state.rx_outstanding = false;
                state.callbacks.rxcomplete(pkt.hflag != 0);
            } else {
                trace!(
                    bflag = pkt.bflag,
                    trnidx = state.trnidx,
                    "coremodel: can: RX_ACK for unexpected transaction, dropping"
                );
            }
            Advance::Consumed
        }
        other => {
            trace!(other, "coremodel: can: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

/// Clears the TX stall so a queued `TX` can be retried.
pub fn ready(state: &mut CanState) {
    state.busy = false;
}

/// Encodes an `RX` frame carrying `ctrl`/`ext_ctrl`/`data`, bumping the
/// transaction index. Returns `None` if a previous `RX` is still
/// outstanding (no matching `RX_ACK` yet).
#[must_use]
pub fn encode_rx(state: &mut CanState, conn: u16, ctrl: u64, ext_ctrl: u64, data: &[u8]) -> Option<Packet> {
    if state.rx_outstanding {
        return None;
    }
    state.trnidx = state.trnidx.wrapping_add(1);
    state.rx_outstanding = true;
    let mut payload = Vec::with_capacity(CTRL_WORDS_LEN + data.len());
    payload.extend_from_slice(&ctrl.to_le_bytes());
    payload.extend_from_slice(&ext_ctrl.to_le_bytes());
    payload.extend_from_slice(data);
    Some(Packet::new(conn, wire::RX, state.trnidx, 0, payload))
}
