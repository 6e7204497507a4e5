//! USB host-port endpoint state machine (`SPEC_FULL.md` §4.4.5).
//!
//! NAKed `(endpoint, token)` pairs latch a bit in a 64-bit `extended_busy`
//! mask rather than the generic per-endpoint `busy` flag used elsewhere,
//! because a single USB host port multiplexes many independently-NAKable
//! transfer streams.

use tracing::trace;

use crate::protocol::{Packet, usbh as wire};

use super::Advance;

const SCRATCH_SIZE: usize = 512;

/// Token type for a transfer, decoded from `hflag` bits[3:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Out,
    In,
    Setup,
}

impl Token {
    fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Self::Out),
            1 => Some(Self::In),
            2 => Some(Self::Setup),
            _ => None,
        }
    }

    fn bits(self) -> u16 {
        match self {
            Self::Out => 0,
            Self::In => 1,
            Self::Setup => 2,
        }
    }
}

pub trait UsbhCallbacks {
    /// The port was reset; all outstanding NAK state has already been
    /// cleared by the time this fires.
    fn rst(&mut self) {}

    /// A transfer for `(dev, ep, tkn)`. `buf` holds the OUT/SETUP payload to
    /// consume, or scratch space to fill for an IN transfer; `end` mirrors
    /// the end-of-transfer bit forwarded verbatim from the wire.
    ///
    /// Returns the byte count transferred (`>=0`), [`wire::XFR_NAK`], or
    /// [`wire::XFR_STALL`].
    fn xfr(&mut self, dev: u8, ep: u8, tkn: Token, buf: &mut [u8], end: bool) -> i32;
}

pub struct UsbhState {
    pub callbacks: Box<dyn UsbhCallbacks + Send>,
    extended_busy: u64,
    scratch: Box<[u8; SCRATCH_SIZE]>,
}

impl UsbhState {
    #[must_use]
    pub fn new(callbacks: Box<dyn UsbhCallbacks + Send>) -> Self {
        Self { callbacks, extended_busy: 0, scratch: Box::new([0; SCRATCH_SIZE]) }
    }

    fn bit_index(ep: u8, tkn: Token) -> u32 {
        u32::from(ep) * 4 + u32::from(tkn.bits())
    }

    fn is_busy(&self, ep: u8, tkn: Token) -> bool {
        self.extended_busy & (1 << Self::bit_index(ep, tkn)) != 0
    }

    fn set_busy(&mut self, ep: u8, tkn: Token) {
        self.extended_busy |= 1 << Self::bit_index(ep, tkn);
    }

    fn clear_busy(&mut self, ep: u8, tkn: Token) {
        self.extended_busy &= !(1 << Self::bit_index(ep, tkn));
    }
}

fn decode_xfr_hflag(hflag: u16) -> Option<(u8, u8, u8, bool)> {
    let tkn_bits = hflag & 0xF;
    let ep = ((hflag >> 4) & 0xF) as u8;
    let dev = ((hflag >> 8) & 0x7F) as u8;
    let end = hflag & 0x8000 != 0;
    Token::from_bits(tkn_bits).map(|tkn| (dev, ep, tkn.bits() as u8, end))
}

fn done_hflag(dev: u8, ep: u8, tkn: Token, stall: bool) -> u16 {
    let mut hflag = tkn.bits() | (u16::from(ep) << 4) | (u16::from(dev) << 8);
    if stall {
        hflag |= 0x8000;
    }
    hflag
}

pub(crate) fn step(
    state: &mut UsbhState,
    conn: u16,
    pkt: &Packet,
    emit: &mut dyn FnMut(Packet),
) -> Advance {
    match pkt.pkt {
        wire::RESET => {
            state.extended_busy = 0;
            state.callbacks.rst();
            Advance::ConsumedRestart
        }
        wire::XFR => {
            let Some((dev, ep, tkn_bits, end)) = decode_xfr_hflag(pkt.hflag) else {
                trace!(hflag = pkt.hflag, "coremodel: usbh: unrecognised token, dropping");
                return Advance::Consumed;
            };
            let tkn = Token::from_bits(u16::from(tkn_bits)).unwrap();

            if tkn == Token::Setup {
                state.clear_busy(ep, tkn);
            } else if state.is_busy(ep, tkn) {
                // Only this (ep, tkn) is latched; XFRs queued for other
                // endpoints/tokens must still be reachable.
                return Advance::Skip;
            }

            let result = match tkn {
                Token::Out | Token::Setup => {
                    let mut buf = pkt.data.clone();
                    state.callbacks.xfr(dev, ep, tkn, &mut buf, end)
                }
                Token::In => {
                    let requested = if pkt.data.len() >= 2 {
                        u16::from_le_bytes([pkt.data[0], pkt.data[1]]) as usize
                    } else {
                        0
                    };
                    let size = requested.min(SCRATCH_SIZE);
                    state.callbacks.xfr(dev, ep, tkn, &mut state.scratch[..size], end)
                }
            };

            if tkn == Token::Setup {
                // SETUP is never NAKed and never completes with a DONE.
                return Advance::Consumed;
            }

            match result {
                wire::XFR_NAK => {
                    state.set_busy(ep, tkn);
                    Advance::Skip
                }
                wire::XFR_STALL => {
                    emit(Packet::new(conn, wire::DONE, 0, done_hflag(dev, ep, tkn, true), Vec::new()));
                    Advance::Consumed
                }
                n if n >= 0 => {
                    let n = n as usize;
                    let data = match tkn {
                        Token::In => state.scratch[..n].to_vec(),
                        Token::Out | Token::Setup => (n as u16).to_le_bytes().to_vec(),
                    };
                    emit(Packet::new(conn, wire::DONE, 0, done_hflag(dev, ep, tkn, false), data));
                    Advance::Consumed
                }
                other => {
                    trace!(other, "coremodel: usbh: unexpected xfr return, dropping");
                    Advance::Consumed
                }
            }
        }
        other => {
            trace!(other, "coremodel: usbh: unexpected packet type, dropping");
            Advance::Consumed
        }
    }
}

/// Clears the NAK latch for a single `(ep, tkn)` pair so a queued transfer
/// for it can be re-examined. `tkn` uses the same `0=OUT, 1=IN, 2=SETUP`
/// encoding as the wire.
pub fn ready(state: &mut UsbhState, ep: u8, tkn: u8) {
    if let Some(tkn) = Token::from_bits(u16::from(tkn)) {
        state.clear_busy(ep, tkn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysNak;
    impl UsbhCallbacks for AlwaysNak {
        fn xfr(&mut self, _dev: u8, _ep: u8, _tkn: Token, _buf: &mut [u8], _end: bool) -> i32 {
            wire::XFR_NAK
        }
    }

    fn xfr_hflag(dev: u8, ep: u8, tkn: Token, end: bool) -> u16 {
        let mut h = tkn.bits() | (u16::from(ep) << 4) | (u16::from(dev) << 8);
        if end {
            h |= 0x8000;
        }
        h
    }

    #[test]
    fn nak_latches_bit_and_defers_without_done() {
        let mut state = UsbhState::new(Box::new(AlwaysNak));
        let hflag = xfr_hflag(0, 1, Token::In, true);
        let mut size = 8u16.to_le_bytes().to_vec();
        size.resize(8, 0);
        let pkt = Packet::new(3, wire::XFR, 0, hflag, size);

        let mut emitted = Vec::new();
        let outcome = step(&mut state, 3, &pkt, &mut |p| emitted.push(p));
        assert!(matches!(outcome, Advance::Skip));
        assert!(emitted.is_empty());
        assert!(state.is_busy(1, Token::In));

        // A second XFR for the same (ep, tkn) stays deferred too.
        let outcome2 = step(&mut state, 3, &pkt, &mut |p| emitted.push(p));
        assert!(matches!(outcome2, Advance::Skip));

        ready(&mut state, 1, Token::In.bits() as u8);
        assert!(!state.is_busy(1, Token::In));
    }

    /// A NAKed `(ep, tkn)` must not block an XFR queued behind it for a
    /// different `(ep, tkn)`: the scheduler should skip past the deferred
    /// head and still dispatch the independent transfer.
    #[test]
    fn nak_on_one_endpoint_does_not_block_another_queued_behind_it() {
        use super::super::{DeviceKind, Endpoint};

        struct NakFirstEndpointOnly;
        impl UsbhCallbacks for NakFirstEndpointOnly {
            fn xfr(&mut self, _dev: u8, ep: u8, _tkn: Token, buf: &mut [u8], _end: bool) -> i32 {
                if ep == 1 {
                    wire::XFR_NAK
                } else {
                    buf.len() as i32
                }
            }
        }

        let mut ep = Endpoint::new(DeviceKind::Usbh(UsbhState::new(Box::new(NakFirstEndpointOnly))));
        ep.conn = 3;

        let hflag_ep1 = xfr_hflag(0, 1, Token::In, false);
        let mut size1 = 4u16.to_le_bytes().to_vec();
        size1.resize(4, 0);
        ep.push(Packet::new(3, wire::XFR, 0, hflag_ep1, size1));

        let hflag_ep2 = xfr_hflag(0, 2, Token::In, false);
        let mut size2 = 4u16.to_le_bytes().to_vec();
        size2.resize(4, 0);
        ep.push(Packet::new(3, wire::XFR, 0, hflag_ep2, size2));

        let mut emitted = Vec::new();
        super::super::advance(&mut ep, &mut |p| emitted.push(p));

        // The NAKed ep1 transfer is still queued; ep2's DONE was emitted.
        assert_eq!(ep.pending.len(), 1);
        assert_eq!(ep.pending[0].hflag, hflag_ep1);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].pkt, wire::DONE);
        assert_eq!(emitted[0].hflag & 0xF0, hflag_ep2 & 0xF0);
    }
}
