//! Host-side client for multiplexing emulated peripheral endpoints (UART,
//! I²C, SPI, GPIO, USB host port, CAN bus) over a single TCP connection to
//! a VM device model.
//!
//! See `SPEC_FULL.md` for the full design. [`Coremodel::connect`] opens the
//! socket; [`Coremodel::list`] enumerates endpoints the VM offers;
//! `attach_*` blocks until the VM accepts (or rejects) a named endpoint and
//! returns a [`DeviceHandle`]; outbound/flow-control calls and
//! [`Coremodel::run`] drive the rest.

pub mod device;
pub mod error;
mod framer;
mod macros;
pub mod protocol;
mod query;
mod ring;
pub mod selectset;
mod transport;

use std::{
    collections::HashMap,
    io,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

pub use device::can::CanCallbacks;
pub use device::gpio::GpioCallbacks;
pub use device::i2c::I2cCallbacks;
pub use device::spi::SpiCallbacks;
pub use device::uart::UartCallbacks;
pub use device::usbh::{Token as UsbToken, UsbhCallbacks};
pub use error::{CoremodelError, Result};
pub use protocol::{DeviceListEntry, DeviceType};

use device::{CanState, Endpoint, GpioState, I2cState, SpiState, UartState, UsbhState};
pub(crate) use device::DeviceKind;
use protocol::{CONN_QUERY, Packet, query as wire};
use selectset::FdSet;
use transport::Transport;

bitflags::bitflags! {
    /// I²C attach flags, OR'd into `hflag` on the `REQ_CONN` packet.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct I2cFlags: u16 {
        const START_ACK = 0x0001;
        const WRITE_ACK = 0x0002;
    }
}

bitflags::bitflags! {
    /// SPI attach flags, OR'd into `hflag` on the `REQ_CONN` packet.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SpiFlags: u16 {
        const BLOCK = 0x0001;
    }
}

/// USB host port speeds, passed in `hflag` bits `[3:0]` of the `REQ_CONN`
/// packet.
pub mod usb_speed {
    pub const LOW: u16 = 0;
    pub const FULL: u16 = 1;
    pub const HIGH: u16 = 2;
    pub const SUPER: u16 = 3;
}

/// Opaque handle to a live endpoint, returned by every `attach_*` call.
/// Internally this is just the VM-assigned connection index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u16);

enum Query {
    Idle,
    Listing {
        items: Vec<DeviceListEntry>,
        /// Count of records stepped over so far, including ones whose type
        /// wasn't recognised and so aren't in `items`. Drives the next
        /// `REQ_LIST` index; using `items.len()` instead would re-request
        /// an already-returned batch forever if it ever contained an
        /// unrecognised type.
        next_index: u16,
    },
    Attaching { endpoint: Endpoint },
}

/// Outcome of a completed query, stashed by the packet router and consumed
/// by whichever public call is blocking on it.
enum QueryOutcome {
    List(Vec<DeviceListEntry>),
    Attached(DeviceHandle),
    AttachRejected,
}

/// The library's context: one TCP connection, its receive/transmit state,
/// and every live endpoint. Threaded explicitly through every public entry
/// point rather than held in module statics (`SPEC_FULL.md` §9).
pub struct Coremodel {
    transport: Transport,
    endpoints: HashMap<u16, Endpoint>,
    query: Query,
    query_outcome: Option<QueryOutcome>,
}

impl Coremodel {
    /// Opens the TCP connection, setting `TCP_NODELAY` and non-blocking
    /// mode. `target` is `host[:port]`, defaulting the port to `1900`;
    /// when `None`, reads `COREMODEL_VM` from the environment.
    pub fn connect(target: Option<&str>) -> Result<Self> {
        let transport = Transport::connect(target).inspect_err(|err| {
            warn!(?err, "coremodel: connect failed");
        })?;
        info!("coremodel: connected");
        Ok(Self {
            transport,
            endpoints: HashMap::new(),
            query: Query::Idle,
            query_outcome: None,
        })
    }

    /// Detaches every live endpoint and tears down the connection.
    pub fn disconnect(mut self) -> Result<()> {
        let conns: Vec<u16> = self.endpoints.keys().copied().collect();
        for conn in conns {
            self.endpoints.remove(&conn);
            self.send(query::encode_req_disc(conn));
        }
        info!("coremodel: disconnected");
        Ok(())
    }

    // ---- control plane -------------------------------------------------

    /// Enumerates every endpoint the VM currently offers. Blocks until the
    /// enumeration completes; only one query (`list` or an `attach_*`) may
    /// be outstanding at a time.
    pub fn list(&mut self) -> Result<Vec<DeviceListEntry>> {
        let raw = self.list_raw()?;
        Ok(raw.into_iter().filter(|e| e.kind != DeviceType::Invalid).collect())
    }

    /// Like [`Coremodel::list`], but preserves the source's
    /// sentinel-terminated shape (a trailing entry of kind
    /// [`DeviceType::Invalid`]) for callers that want it.
    pub fn list_raw(&mut self) -> Result<Vec<DeviceListEntry>> {
        self.begin_query(Query::Listing { items: Vec::new(), next_index: 0 })?;
        self.send(query::encode_req_list(0));
        self.run_until(None, |s| s.query_outcome.is_some())?;
        match self.query_outcome.take() {
            Some(QueryOutcome::List(mut items)) => {
                items.push(DeviceListEntry { kind: DeviceType::Invalid, name: String::new(), num: 0 });
                Ok(items)
            }
            _ => unreachable!("list query completed with a non-list outcome"),
        }
    }

    fn begin_query(&mut self, query: Query) -> Result<()> {
        if !matches!(self.query, Query::Idle) {
            return Err(CoremodelError::QueryBusy);
        }
        self.query = query;
        self.query_outcome = None;
        Ok(())
    }

    fn attach(&mut self, devtype: DeviceType, name: &str, num: u32, flags: u16, kind: DeviceKind) -> Result<DeviceHandle> {
        debug!(?devtype, name, "coremodel: attach");
        self.begin_query(Query::Attaching { endpoint: Endpoint::new(kind) })?;
        self.send(query::encode_req_conn(devtype, name, num, flags));
        self.run_until(None, |s| s.query_outcome.is_some())?;
        match self.query_outcome.take() {
            Some(QueryOutcome::Attached(handle)) => {
                info!(?devtype, name, conn = handle.0, "coremodel: attached");
                Ok(handle)
            }
            Some(QueryOutcome::AttachRejected) => {
                warn!(?devtype, name, "coremodel: attach rejected");
                Err(CoremodelError::AttachRejected)
            }
            _ => unreachable!("attach query completed with a non-attach outcome"),
        }
    }

    pub fn attach_uart(&mut self, name: &str, callbacks: Box<dyn UartCallbacks + Send>) -> Result<DeviceHandle> {
        self.attach(DeviceType::Uart, name, 0, 0, DeviceKind::Uart(UartState::new(callbacks)))
    }

    pub fn attach_i2c(&mut self, name: &str, addr: u32, callbacks: Box<dyn I2cCallbacks + Send>, flags: I2cFlags) -> Result<DeviceHandle> {
        self.attach(DeviceType::I2c, name, addr, flags.bits(), DeviceKind::I2c(I2cState::new(callbacks)))
    }

    pub fn attach_spi(&mut self, name: &str, cs: u32, callbacks: Box<dyn SpiCallbacks + Send>, flags: SpiFlags) -> Result<DeviceHandle> {
        self.attach(DeviceType::Spi, name, cs, flags.bits(), DeviceKind::Spi(SpiState::new(callbacks)))
    }

    pub fn attach_gpio(&mut self, name: &str, pin: u32, callbacks: Box<dyn GpioCallbacks + Send>) -> Result<DeviceHandle> {
        self.attach(DeviceType::Gpio, name, pin, 0, DeviceKind::Gpio(GpioState::new(callbacks)))
    }

    pub fn attach_usbh(&mut self, name: &str, port: u32, callbacks: Box<dyn UsbhCallbacks + Send>, speed: u16) -> Result<DeviceHandle> {
        self.attach(DeviceType::Usbh, name, port, speed & 0xF, DeviceKind::Usbh(UsbhState::new(callbacks)))
    }

    pub fn attach_can(&mut self, name: &str, callbacks: Box<dyn CanCallbacks + Send>) -> Result<DeviceHandle> {
        self.attach(DeviceType::Can, name, 0, 0, DeviceKind::Can(CanState::new(callbacks)))
    }

    /// Detaches `handle`, notifying the VM with a `REQ_DISC`.
    pub fn detach(&mut self, handle: DeviceHandle) -> Result<()> {
        if self.endpoints.remove(&handle.0).is_none() {
            return Err(CoremodelError::NotConnected);
        }
        self.send(query::encode_req_disc(handle.0));
        debug!(conn = handle.0, "coremodel: detached");
        Ok(())
    }

    // ---- UART -----------------------------------------------------------

    /// Transmits up to `min(data.len(), credit)` bytes as a `TX` packet,
    /// consuming that much credit. Returns the number of bytes sent.
    pub fn uart_rx(&mut self, handle: DeviceHandle, data: &[u8]) -> Result<usize> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        let DeviceKind::Uart(state) = &mut ep.kind else {
            crate::safe_assert!(false, "uart_rx called on a non-UART handle");
            return Ok(0);
        };
        let pkt = device::uart::encode_rx(state, ep.conn, data);
        match pkt {
            Some(pkt) => {
                let n = pkt.data.len();
                self.send(pkt);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Clears the `busy` stall set by a `0`-return from
    /// [`UartCallbacks::tx`] and re-examines the pending queue.
    pub fn uart_txrdy(&mut self, handle: DeviceHandle) -> Result<()> {
        self.ready(handle)
    }

    // ---- I2C --------------------------------------------------------

    /// Emits an unsolicited `DONE` carrying up to 255 bytes of
    /// speculatively prepared read data.
    pub fn i2c_push_read(&mut self, handle: DeviceHandle, data: &[u8]) -> Result<()> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        let DeviceKind::I2c(state) = &ep.kind else {
            crate::safe_assert!(false, "i2c_push_read called on a non-I2C handle");
            return Ok(());
        };
        let pkt = device::i2c::encode_push_read(state, ep.conn, data);
        self.send(pkt);
        Ok(())
    }

    pub fn i2c_ready(&mut self, handle: DeviceHandle) -> Result<()> {
        self.ready(handle)
    }

    // ---- SPI ----------------------------------------------------------

    pub fn spi_ready(&mut self, handle: DeviceHandle) -> Result<()> {
        self.ready(handle)
    }

    // ---- GPIO -----------------------------------------------------------

    /// Sends a `FORCE` packet driving the line to `mv` millivolts with the
    /// driver enabled/released per `drive_enabled`.
    pub fn gpio_set(&mut self, handle: DeviceHandle, drive_enabled: bool, mv: i16) -> Result<()> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        crate::safe_assert!(matches!(ep.kind, DeviceKind::Gpio(_)), "gpio_set called on a non-GPIO handle");
        let pkt = device::gpio::encode_force(ep.conn, drive_enabled, mv);
        self.send(pkt);
        Ok(())
    }

    // ---- USB host ---------------------------------------------------

    /// Clears the NAK latch for `(ep, tkn)` and re-examines the queue.
    pub fn usbh_ready(&mut self, handle: DeviceHandle, ep_num: u8, tkn: u8) -> Result<()> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        let DeviceKind::Usbh(state) = &mut ep.kind else {
            crate::safe_assert!(false, "usbh_ready called on a non-USB-host handle");
            return Ok(());
        };
        device::usbh::ready(state, ep_num, tkn);
        let transport = &mut self.transport;
        device::advance(ep, &mut |pkt| emit(transport, pkt));
        Ok(())
    }

    // ---- CAN ------------------------------------------------------------

    /// Sends an `RX` frame carrying `ctrl`/`ext_ctrl`/`data` (copied into
    /// the outbound buffer immediately, so the caller need not keep it
    /// alive past this call). Returns `Ok(false)` if a prior `RX` is still
    /// outstanding.
    pub fn can_rx(&mut self, handle: DeviceHandle, ctrl: u64, ext_ctrl: u64, data: &[u8]) -> Result<bool> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        let DeviceKind::Can(state) = &mut ep.kind else {
            crate::safe_assert!(false, "can_rx called on a non-CAN handle");
            return Ok(false);
        };
        let pkt = device::can::encode_rx(state, ep.conn, ctrl, ext_ctrl, data);
        match pkt {
            Some(pkt) => {
                self.send(pkt);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Clears a stalled `TX`'s busy latch and re-examines the queue.
    pub fn can_ready(&mut self, handle: DeviceHandle) -> Result<()> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        let DeviceKind::Can(state) = &mut ep.kind else {
            crate::safe_assert!(false, "can_ready called on a non-CAN handle");
            return Ok(());
        };
        device::can::ready(state);
        let transport = &mut self.transport;
        device::advance(ep, &mut |pkt| emit(transport, pkt));
        Ok(())
    }

    // ---- generic stall clear -------------------------------------------

    /// Clears the generic `busy` stall on `handle` and re-examines its
    /// pending queue. A no-op if the endpoint is already idle.
    fn ready(&mut self, handle: DeviceHandle) -> Result<()> {
        let ep = endpoint_mut(&mut self.endpoints, handle)?;
        ep.busy = false;
        let transport = &mut self.transport;
        device::advance(ep, &mut |pkt| emit(transport, pkt));
        Ok(())
    }

    // ---- dispatcher -----------------------------------------------------

    /// Marks `readset`/`writeset` per the transport's readiness rules and
    /// returns the updated `nfds`, for integrating into a caller-owned
    /// `select(2)` loop instead of [`Coremodel::run`].
    pub fn prepare_readiness(&mut self, nfds: i32, readset: &mut FdSet, writeset: &mut FdSet) -> i32 {
        self.transport.prepare(nfds, readset, writeset)
    }

    /// Services whatever `readset`/`writeset` reported, then dispatches any
    /// complete packets that arrived.
    pub fn drive_readiness(&mut self, readset: &FdSet, writeset: &FdSet) -> Result<()> {
        self.transport.drive(readset, writeset)?;
        self.pump_incoming();
        Ok(())
    }

    /// Blocks until `usec` microseconds elapse (no deadline if negative),
    /// servicing the socket and dispatching packets throughout.
    pub fn run(&mut self, usec: i64) -> Result<()> {
        let deadline = (usec >= 0).then(|| Instant::now() + Duration::from_micros(usec as u64));
        self.run_until(deadline, |_| false)
    }

    fn run_until(&mut self, deadline: Option<Instant>, mut done: impl FnMut(&Self) -> bool) -> Result<()> {
        loop {
            if done(self) {
                return Ok(());
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(());
                    }
                    Some(d - now)
                }
                None => None,
            };

            let mut readset = FdSet::empty();
            let mut writeset = FdSet::empty();
            let nfds = self.transport.prepare(0, &mut readset, &mut writeset);
            select_wait(nfds, &mut readset, &mut writeset, remaining)?;
            self.transport.drive(&readset, &writeset)?;
            self.pump_incoming();
        }
    }

    fn pump_incoming(&mut self) {
        let mut packets = Vec::new();
        framer::drain(self.transport.rx_ring_mut(), |raw| {
            packets.push(Packet::decode(raw));
            true
        });
        for pkt in packets {
            self.route_packet(pkt);
        }
    }

    fn route_packet(&mut self, pkt: Packet) {
        if pkt.conn == CONN_QUERY {
            self.handle_query_packet(pkt);
            return;
        }
        let Some(ep) = self.endpoints.get_mut(&pkt.conn) else {
            debug!(conn = pkt.conn, "coremodel: packet for unknown connection, dropping");
            return;
        };
        ep.push(pkt);
        let transport = &mut self.transport;
        device::advance(ep, &mut |out| emit(transport, out));
    }

    fn handle_query_packet(&mut self, pkt: Packet) {
        match pkt.pkt {
            wire::RSP_LIST => self.handle_rsp_list(pkt),
            wire::RSP_CONN => self.handle_rsp_conn(pkt),
            other => debug!(other, "coremodel: unexpected query packet type, dropping"),
        }
    }

    fn handle_rsp_list(&mut self, pkt: Packet) {
        let Query::Listing { items, next_index } = &mut self.query else {
            debug!("coremodel: RSP_LIST with no outstanding list query, dropping");
            return;
        };

        if pkt.data.is_empty() {
            let items = std::mem::take(items);
            self.query = Query::Idle;
            self.query_outcome = Some(QueryOutcome::List(items));
            return;
        }

        let (batch, consumed) = query::parse_list_batch(&pkt.data);
        items.extend(batch);
        *next_index += consumed;
        let idx = *next_index;
        self.send(query::encode_req_list(idx));
    }

    fn handle_rsp_conn(&mut self, pkt: Packet) {
        let Query::Attaching { .. } = &self.query else {
            debug!("coremodel: RSP_CONN with no outstanding attach, dropping");
            return;
        };
        let Query::Attaching { endpoint } = std::mem::replace(&mut self.query, Query::Idle) else {
            unreachable!()
        };

        if pkt.hflag == CONN_QUERY {
            self.query_outcome = Some(QueryOutcome::AttachRejected);
            return;
        }

        let conn = pkt.hflag;
        let mut endpoint = endpoint;
        endpoint.conn = conn;
        if let DeviceKind::Uart(state) = &mut endpoint.kind {
            if let Some(credit) = query::parse_rsp_conn_credit(&pkt.data) {
                state.credit = credit;
            }
        }
        self.endpoints.insert(conn, endpoint);
        self.query_outcome = Some(QueryOutcome::Attached(DeviceHandle(conn)));
    }

    fn send(&mut self, pkt: Packet) {
        emit(&mut self.transport, pkt);
    }
}

fn emit(transport: &mut Transport, pkt: Packet) {
    let mut buf = Vec::new();
    pkt.encode_into(&mut buf);
    transport.enqueue(buf);
}

/// Looks up a live endpoint by handle. A free function (rather than a
/// `&mut self` method) so callers can still borrow `self.transport`
/// afterwards without the borrow checker treating the whole context as
/// mutably borrowed.
fn endpoint_mut(endpoints: &mut HashMap<u16, Endpoint>, handle: DeviceHandle) -> Result<&mut Endpoint> {
    endpoints.get_mut(&handle.0).ok_or(CoremodelError::NotConnected)
}

/// Blocks in `select(2)` for up to `timeout` (forever if `None`), retrying
/// on `EINTR`.
fn select_wait(nfds: i32, readset: &mut FdSet, writeset: &mut FdSet, timeout: Option<Duration>) -> Result<()> {
    loop {
        let mut tv;
        let tv_ptr = match timeout {
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_usec: libc::suseconds_t::from(d.subsec_micros()),
                };
                &mut tv as *mut libc::timeval
            }
            None => std::ptr::null_mut(),
        };

        let rc = unsafe {
            libc::select(nfds, readset.as_raw_mut(), writeset.as_raw_mut(), std::ptr::null_mut(), tv_ptr)
        };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        warn!(?err, "coremodel: select failed");
        return Err(CoremodelError::TransportDown(err));
    }
}
