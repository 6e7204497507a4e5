//! Per-connection device state machines (`SPEC_FULL.md` §4.4).
//!
//! Every attached endpoint owns a pending-receive queue, a busy/stall flag,
//! a partial-consumption offset, and type-specific state (credits,
//! transaction indices, scratch buffers). [`advance`] drains the queue,
//! calling into the application callback for each device type until a
//! packet is deferred (`busy`) or the queue empties.

pub mod can;
pub mod gpio;
pub mod i2c;
pub mod spi;
pub mod uart;
pub mod usbh;

pub use can::CanState;
pub use gpio::GpioState;
pub use i2c::I2cState;
pub use spi::SpiState;
pub use uart::UartState;
pub use usbh::UsbhState;

use std::collections::VecDeque;

use crate::protocol::{DeviceType, Packet};

/// Outcome of handling one queued packet for a device type.
pub(crate) enum Advance {
    /// Packet was fully handled; remove it and keep draining from the same
    /// position (the next packet slides into it).
    Consumed,
    /// Packet was fully handled and, because device-internal state that
    /// gates other queued packets changed (USB host reset clearing NAK
    /// latches), the whole queue should be re-examined from the front.
    ConsumedRestart,
    /// This packet can't make progress for a reason scoped to it alone (a
    /// NAK-latched USB `(ep, tkn)`, a stalled CAN TX) — leave it queued and
    /// move on to the next entry instead of blocking everything behind it.
    Skip,
    /// Nothing in the queue can make progress right now; leave the packet
    /// at its position and stop examining this endpoint until `ready` is
    /// called.
    Stop,
}

pub enum DeviceKind {
    Uart(uart::UartState),
    I2c(i2c::I2cState),
    Spi(spi::SpiState),
    Gpio(gpio::GpioState),
    Usbh(usbh::UsbhState),
    Can(can::CanState),
}

impl DeviceKind {
    #[must_use]
    pub fn device_type(&self) -> DeviceType {
        match self {
            Self::Uart(_) => DeviceType::Uart,
            Self::I2c(_) => DeviceType::I2c,
            Self::Spi(_) => DeviceType::Spi,
            Self::Gpio(_) => DeviceType::Gpio,
            Self::Usbh(_) => DeviceType::Usbh,
            Self::Can(_) => DeviceType::Can,
        }
    }
}

/// One attached endpoint: the VM-assigned connection id, the shared
/// scheduling state (busy/offset/pending), and the device-type-specific
/// state and callback table.
pub struct Endpoint {
    pub conn: u16,
    pub busy: bool,
    pub offset: u32,
    pub pending: VecDeque<Packet>,
    pub kind: DeviceKind,
}

impl Endpoint {
    #[must_use]
    pub fn new(kind: DeviceKind) -> Self {
        Self { conn: crate::protocol::CONN_QUERY, busy: false, offset: 0, pending: VecDeque::new(), kind }
    }

    pub fn push(&mut self, pkt: Packet) {
        self.pending.push_back(pkt);
    }
}

/// Drains `ep.pending`, dispatching each packet to the type-specific step
/// function and emitting outbound packets via `emit`. Walks the queue by
/// position rather than always popping the front: a `Skip` outcome leaves
/// its packet queued and moves on to examine later entries, so one stalled
/// sub-stream (a NAK-latched USB `(ep, tkn)`, a stalled CAN TX) can't block
/// independent packets queued behind it. Stops when a packet can't make
/// progress at all (`Stop`) or every remaining entry has been examined.
pub fn advance(ep: &mut Endpoint, emit: &mut dyn FnMut(Packet)) {
    let mut idx = 0;
    loop {
        if ep.busy {
            break;
        }
        let Some(pkt) = ep.pending.get(idx).cloned() else { break };

        let outcome = match &mut ep.kind {
            DeviceKind::Uart(state) => uart::step(state, ep.conn, &mut ep.busy, &mut ep.offset, &pkt, emit),
            DeviceKind::I2c(state) => i2c::step(state, ep.conn, &mut ep.busy, &mut ep.offset, &pkt, emit),
            DeviceKind::Spi(state) => spi::step(state, ep.conn, &mut ep.busy, &mut ep.offset, &pkt, emit),
            DeviceKind::Gpio(state) => gpio::step(state, &pkt),
            DeviceKind::Usbh(state) => usbh::step(state, ep.conn, &pkt, emit),
            DeviceKind::Can(state) => can::step(state, ep.conn, &pkt, emit),
        };

        match outcome {
            Advance::Consumed => {
                ep.pending.remove(idx);
            }
            Advance::ConsumedRestart => {
                ep.pending.remove(idx);
                ep.offset = 0;
                idx = 0;
            }
            Advance::Skip => {
                idx += 1;
            }
            Advance::Stop => break,
        }
    }
}
