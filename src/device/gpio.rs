//! GPIO endpoint state machine (`SPEC_FULL.md` §4.4.4).
//!
//! The only inbound packet is a voltage-level notification; there is no
//! backpressure on this device type, so `step` never defers.

use tracing::trace;

use crate::protocol::{Packet, gpio as wire};

use super::Advance;

pub trait GpioCallbacks {
    /// The line settled at `mv` millivolts (signed, per the wire format).
    fn notify(&mut self, mv: i16);
}

pub struct GpioState {
    pub callbacks: Box<dyn GpioCallbacks + Send>,
}

impl GpioState {
    #[must_use]
    pub fn new(callbacks: Box<dyn GpioCallbacks + Send>) -> Self {
        Self { callbacks }
    }
}

pub(crate) fn step(state: &mut GpioState, pkt: &Packet) -> Advance {
    match pkt.pkt {
        wire::UPDATE => {
            state.callbacks.notify(pkt.hflag as i16);
            Advance::Consumed
        }
        other => {
            trace!(other, "coremodel: gpio: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

/// Encodes a `FORCE` packet driving the line to `mv` millivolts with the
/// driver enabled/released per `drive_enabled`.
///
/// The original source emits this with an incorrect `pkt` constant
/// (reusing the I²C `DONE` opcode); this always emits the correct `FORCE`
/// (`0x01`) type.
#[must_use]
pub fn encode_force(conn: u16, drive_enabled: bool, mv: i16) -> Packet {
    Packet::new(conn, wire::FORCE, u8::from(drive_enabled), mv as u16, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Last(Option<i16>);
    impl GpioCallbacks for Last {
        fn notify(&mut self, mv: i16) {
            self.0 = Some(mv);
        }
    }

    #[test]
    fn update_forwards_signed_millivolts() {
        let mut state = GpioState::new(Box::new(Last(None)));
        let pkt = Packet::new(1, wire::UPDATE, 0, (-500i16) as u16, Vec::new());
        step(&mut state, &pkt);
    }

    #[test]
    fn encode_force_uses_force_opcode() {
        let pkt = encode_force(1, true, 3300);
        assert_eq!(pkt.pkt, wire::FORCE);
        assert_eq!(pkt.bflag, 1);
        assert_eq!(pkt.hflag, 3300);
    }
}
