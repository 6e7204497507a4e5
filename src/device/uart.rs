//! UART endpoint state machine (`SPEC_FULL.md` §4.4.1).
//!
//! Flow control is credit-based: the VM grants `credit` bytes of transmit
//! allowance via `RX_ACK`; `TX` packets are only forwarded to the
//! application up to the remaining credit, and partially accepted data
//! stalls the endpoint until the next `ready` call.

use tracing::trace;

use crate::protocol::{Packet, uart as wire};

use super::Advance;

/// Application hooks for a UART endpoint. All methods have a default that
/// matches "no callback installed" in the source: `tx` accepts everything,
/// `brk`/`rxrdy` are no-ops.
pub trait UartCallbacks {
    /// Offered `data` to transmit. Returns the number of bytes accepted;
    /// `0` stalls the endpoint until [`crate::Coremodel::uart_txrdy`].
    fn tx(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    /// The VM signalled a break condition.
    fn brk(&mut self) {}

    /// The VM is ready to accept more `RX` bytes after a prior stall.
    fn rxrdy(&mut self) {}
}

pub struct UartState {
    pub callbacks: Box<dyn UartCallbacks + Send>,
    /// Remaining transmit credit granted by the most recent `RX_ACK`.
    pub credit: u32,
}

impl UartState {
    #[must_use]
    pub fn new(callbacks: Box<dyn UartCallbacks + Send>) -> Self {
        Self { callbacks, credit: 0 }
    }
}

pub(crate) fn step(
    state: &mut UartState,
    _conn: u16,
    busy: &mut bool,
    offset: &mut u32,
    pkt: &Packet,
    _emit: &mut dyn FnMut(Packet),
) -> Advance {
    match pkt.pkt {
        wire::TX => {
            // Keep feeding the callback chunks of the same packet until it
            // either drains the payload or genuinely stalls; a partial
            // accept is retried immediately rather than deferred.
            loop {
                let remaining = &pkt.data[*offset as usize..];
                if remaining.is_empty() {
                    *offset = 0;
                    return Advance::Consumed;
                }
                let accepted = state.callbacks.tx(remaining);
                if accepted == 0 {
                    *busy = true;
                    return Advance::Stop;
                }
                *offset += accepted as u32;
            }
        }
        wire::RX_ACK => {
            let was_zero = state.credit == 0;
            state.credit = state.credit.saturating_add(u32::from(pkt.hflag));
            if was_zero {
                state.callbacks.rxrdy();
            }
            Advance::Consumed
        }
        wire::BRK => {
            state.callbacks.brk();
            Advance::Consumed
        }
        other => {
            trace!(other, "coremodel: uart: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

/// Encodes an `RX` packet carrying up to `state.credit` bytes of `data`,
/// consuming that much credit. Returns `None` if there is no remaining
/// credit or `data` is empty.
#[must_use]
pub fn encode_rx(state: &mut UartState, conn: u16, data: &[u8]) -> Option<Packet> {
    if state.credit == 0 || data.is_empty() {
        return None;
    }
    let n = (state.credit as usize).min(data.len());
    state.credit -= n as u32;
    Some(Packet::new(conn, wire::RX, 0, 0, data[..n].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTx {
        seen: Vec<u8>,
        rxrdy_calls: u32,
    }

    impl UartCallbacks for CountingTx {
        fn tx(&mut self, data: &[u8]) -> usize {
            self.seen.extend_from_slice(data);
            data.len()
        }

        fn rxrdy(&mut self) {
            self.rxrdy_calls += 1;
        }
    }

    fn make(seen: Vec<u8>) -> UartState {
        UartState::new(Box::new(CountingTx { seen, rxrdy_calls: 0 }))
    }

    #[test]
    fn tx_delivers_full_payload_in_one_step() {
        let mut state = make(Vec::new());
        let mut busy = false;
        let mut offset = 0;
        let pkt = Packet::new(5, wire::TX, 0, 0, vec![1, 2, 3]);
        let outcome = step(&mut state, 5, &mut busy, &mut offset, &pkt, &mut |_| {});
        assert!(matches!(outcome, Advance::Consumed));
        assert!(!busy);
        assert_eq!(offset, 0);
    }

    #[test]
    fn rx_ack_only_signals_rxrdy_when_credit_was_exhausted() {
        let mut state = make(Vec::new());
        let mut busy = false;
        let mut offset = 0;

        // First grant: credit was zero, rxrdy fires.
        let ack = Packet::new(5, wire::RX_ACK, 0, 8, Vec::new());
        step(&mut state, 5, &mut busy, &mut offset, &ack, &mut |_| {});
        assert_eq!(state.credit, 8);

        // Second grant while credit is still non-zero: no rxrdy.
        let ack2 = Packet::new(5, wire::RX_ACK, 0, 4, Vec::new());
        step(&mut state, 5, &mut busy, &mut offset, &ack2, &mut |_| {});
        assert_eq!(state.credit, 12);
    }

    #[test]
    fn uart_rx_caps_at_remaining_credit() {
        let mut state = make(Vec::new());
        state.credit = 16;
        let pkt = encode_rx(&mut state, 5, &[0u8; 16]).unwrap();
        assert_eq!(pkt.data.len(), 16);
        assert_eq!(state.credit, 0);
        assert!(encode_rx(&mut state, 5, &[0u8; 1]).is_none());
    }
}

