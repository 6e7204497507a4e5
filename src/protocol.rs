//! Wire format constants and the packet header shared by every connection.
//!
//! See `SPEC_FULL.md` §3 for the frame layout and §4.3/§4.4 for the
//! per-connection packet type tables. All multi-byte fields are little-endian.

/// Connection index reserved for the control plane.
pub const CONN_QUERY: u16 = 0xFFFF;

/// Fixed packet header size, in bytes. Payload follows immediately.
pub const HEADER_SIZE: usize = 8;

/// Largest padded packet the framer will accept; anything bigger is
/// discarded (still drained from the ring) rather than fragmented.
pub const MAX_PKT: usize = 1024;

/// Receive ring buffer capacity, in bytes.
pub const RX_RING_SIZE: usize = 4096;

/// Default TCP port for the VM's device model service.
pub const DEFAULT_PORT: u16 = 1900;

/// Environment variable consulted by `connect` when no explicit target is given.
pub const TARGET_ENV_VAR: &str = "COREMODEL_VM";

/// Rounds `len` up to the next multiple of 4, matching the wire padding rule
/// `(len + 3) & !3`.
#[inline]
#[must_use]
pub const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// One packet frame: fixed 8-byte header plus an opaque payload.
#[derive(Debug, Clone)]
pub struct Packet {
    pub conn: u16,
    pub pkt: u8,
    pub bflag: u8,
    pub hflag: u16,
    pub data: Vec<u8>,
}

impl Packet {
    #[must_use]
    pub fn new(conn: u16, pkt: u8, bflag: u8, hflag: u16, data: Vec<u8>) -> Self {
        Self { conn, pkt, bflag, hflag, data }
    }

    #[must_use]
    pub fn empty(conn: u16, pkt: u8) -> Self {
        Self { conn, pkt, bflag: 0, hflag: 0, data: Vec::new() }
    }

    /// Total packet length including the header, as it appears on the wire
    /// in the `len` field.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    /// Serialises this packet into `buf`, padding to a 4-byte multiple with
    /// zeroed bytes. `buf` is cleared first.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let len = self.wire_len();
        let padded = pad4(len);
        buf.clear();
        buf.reserve(padded);
        buf.extend_from_slice(&(len as u16).to_le_bytes());
        buf.extend_from_slice(&self.conn.to_le_bytes());
        buf.push(self.pkt);
        buf.push(self.bflag);
        buf.extend_from_slice(&self.hflag.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(padded, 0);
    }

    /// Parses a packet out of a contiguous byte slice that contains at least
    /// `len` bytes (as returned by the framer). Panics if `raw` is shorter
    /// than the length encoded in its own header; the framer guarantees this
    /// never happens.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= HEADER_SIZE);
        let conn = u16::from_le_bytes([raw[2], raw[3]]);
        let pkt = raw[4];
        let bflag = raw[5];
        let hflag = u16::from_le_bytes([raw[6], raw[7]]);
        Self { conn, pkt, bflag, hflag, data: raw[HEADER_SIZE..].to_vec() }
    }
}

/// Reads the little-endian `len` field out of the first two bytes of a raw
/// header. Used by the framer before a full `Packet` is worth allocating.
#[inline]
#[must_use]
pub fn peek_len(header: &[u8; HEADER_SIZE]) -> u16 {
    u16::from_le_bytes([header[0], header[1]])
}

/// Control-plane (query connection) packet types.
pub mod query {
    pub const REQ_LIST: u8 = 0x00;
    pub const RSP_LIST: u8 = 0x01;
    pub const REQ_CONN: u8 = 0x02;
    pub const RSP_CONN: u8 = 0x03;
    pub const REQ_DISC: u8 = 0x04;
}

pub mod uart {
    pub const TX: u8 = 0x00;
    pub const RX: u8 = 0x01;
    pub const RX_ACK: u8 = 0x02;
    pub const BRK: u8 = 0x03;
}

pub mod i2c {
    pub const START: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const STOP: u8 = 0x03;
    pub const DONE: u8 = 0x04;

    pub const FLAG_START_ACK: u16 = 0x0001;
    pub const FLAG_WRITE_ACK: u16 = 0x0002;
}

pub mod spi {
    pub const CS: u8 = 0x00;
    pub const TX: u8 = 0x01;
    pub const RX: u8 = 0x02;

    pub const FLAG_BLOCK: u16 = 0x0001;
}

pub mod gpio {
    pub const UPDATE: u8 = 0x00;
    pub const FORCE: u8 = 0x01;
}

pub mod usbh {
    pub const RESET: u8 = 0x00;
    pub const XFR: u8 = 0x01;
    pub const DONE: u8 = 0x02;

    pub const TKN_OUT: u8 = 0;
    pub const TKN_IN: u8 = 1;
    pub const TKN_SETUP: u8 = 2;

    pub const XFR_NAK: i32 = -1;
    pub const XFR_STALL: i32 = -2;

    pub const SPEED_LOW: u32 = 0;
    pub const SPEED_FULL: u32 = 1;
    pub const SPEED_HIGH: u32 = 2;
    pub const SPEED_SUPER: u32 = 3;
}

pub mod can {
    pub const TX: u8 = 0x00;
    pub const TX_ACK: u8 = 0x01;
    pub const RX: u8 = 0x02;
    pub const RX_ACK: u8 = 0x03;

    pub const ACK: i32 = 0;
    pub const NAK: i32 = 1;
    pub const STALL: i32 = -1;

    /// DLC (bits[3:0] of the control word) -> payload byte length, per the
    /// CAN-FD/XL encoding.
    pub const DATA_LEN: [usize; 16] =
        [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

    pub const CTRL_DLC_SHIFT: u64 = 0;
    pub const CTRL_DLC_MASK: u64 = 0xF << CTRL_DLC_SHIFT;
}

/// Device type tags, shared between the list/attach wire records and the
/// public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum DeviceType {
    Uart = 0,
    I2c = 1,
    Spi = 2,
    Gpio = 3,
    Usbh = 4,
    Can = 5,
    /// Sentinel used only by [`crate::Coremodel::list_raw`]; never produced
    /// by [`DeviceType::from_wire`].
    Invalid = -1,
}

impl DeviceType {
    #[must_use]
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Uart),
            1 => Some(Self::I2c),
            2 => Some(Self::Spi),
            3 => Some(Self::Gpio),
            4 => Some(Self::Usbh),
            5 => Some(Self::Can),
            _ => None,
        }
    }
}

/// One entry in a device enumeration, as returned by [`crate::Coremodel::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListEntry {
    pub kind: DeviceType,
    pub name: String,
    /// Number of chip-selects (SPI), pins (GPIO), or ports (USB); 0 for
    /// UART/CAN, which have a single sub-endpoint.
    pub num: u32,
}
