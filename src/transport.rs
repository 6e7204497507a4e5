//! Owns the non-blocking TCP socket: a bounded receive ring and an unbounded
//! outbound FIFO, driven by the `prepare`/`drive` readiness hooks described
//! in `SPEC_FULL.md` §4.1.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    os::unix::io::{AsRawFd, RawFd},
};

use tracing::{debug, warn};

use crate::{
    error::{CoremodelError, Result},
    protocol::{DEFAULT_PORT, TARGET_ENV_VAR, pad4},
    ring::RxRing,
    selectset::FdSet,
};

/// Resolves `target`, or `COREMODEL_VM` when `target` is `None`, into a
/// `host:port` pair, defaulting the port to [`DEFAULT_PORT`].
fn resolve_target(target: Option<&str>) -> Result<String> {
    let owned;
    let target = match target {
        Some(t) => t,
        None => {
            owned = std::env::var(TARGET_ENV_VAR).map_err(|_| CoremodelError::BadTarget)?;
            &owned
        }
    };
    if target.is_empty() {
        return Err(CoremodelError::BadTarget);
    }
    Ok(if target.contains(':') { target.to_string() } else { format!("{target}:{DEFAULT_PORT}") })
}

pub struct Transport {
    stream: TcpStream,
    rx: RxRing,
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front outbound buffer already written to the kernel.
    out_offset: usize,
    /// Latches `true` when a buffer is enqueued; mirrors the source's
    /// `coremodel_txflag`, which forces a write attempt even when the
    /// caller's `select` didn't (yet) report writability.
    tx_flag: bool,
}

impl Transport {
    pub fn connect(target: Option<&str>) -> Result<Self> {
        let addr = resolve_target(target)?;
        let mut addrs = addr.to_socket_addrs().map_err(|_| CoremodelError::BadTarget)?;
        let sockaddr = addrs.next().ok_or(CoremodelError::BadTarget)?;

        let stream = TcpStream::connect(sockaddr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        Ok(Self {
            stream,
            rx: RxRing::new(),
            outbound: VecDeque::new(),
            out_offset: 0,
            tx_flag: false,
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[must_use]
    pub fn rx_ring(&self) -> &RxRing {
        &self.rx
    }

    pub fn rx_ring_mut(&mut self) -> &mut RxRing {
        &mut self.rx
    }

    /// Enqueues an already-encoded, 4-byte-padded buffer for transmission.
    pub fn enqueue(&mut self, buf: Vec<u8>) {
        debug_assert_eq!(buf.len(), pad4(buf.len()));
        self.outbound.push_back(buf);
        self.tx_flag = true;
    }

    /// Marks `readset`/`writeset` per `SPEC_FULL.md` §4.1 and returns the
    /// updated `nfds`. Resets the internal tx latch, matching the source's
    /// "clear txflag on prepare" behavior.
    pub fn prepare(&mut self, nfds: i32, readset: &mut FdSet, writeset: &mut FdSet) -> i32 {
        let fd = self.fd();
        let mut next_nfds = nfds;

        if self.rx.space() > 0 {
            readset.set(fd);
            next_nfds = next_nfds.max(fd + 1);
        }
        if !self.outbound.is_empty() {
            writeset.set(fd);
            next_nfds = next_nfds.max(fd + 1);
        }
        self.tx_flag = false;

        next_nfds
    }

    /// Performs the actual reads/writes once `select` has reported
    /// readiness. Returns `Ok(())` on success; a transport-level failure
    /// closes the underlying socket (further calls will fail immediately).
    pub fn drive(&mut self, readset: &FdSet, writeset: &FdSet) -> Result<()> {
        let fd = self.fd();

        if readset.is_set(fd) {
            self.read_into_ring()?;
        }

        let should_write = writeset.is_set(fd) || (self.tx_flag && !self.outbound.is_empty());
        if should_write {
            self.write_from_outbound()?;
        }

        Ok(())
    }

    fn read_into_ring(&mut self) -> Result<()> {
        loop {
            if self.rx.space() == 0 {
                break;
            }
            let (first, second) = self.rx.writable_slices();
            let slice = if first.is_empty() { second } else { first };
            if slice.is_empty() {
                break;
            }
            match self.stream.read(slice) {
                Ok(0) => {
                    debug!("coremodel: peer closed connection");
                    return Err(CoremodelError::TransportDown(io::Error::from(
                        io::ErrorKind::ConnectionReset,
                    )));
                }
                Ok(n) => self.rx.advance_write(n),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "coremodel: read failed");
                    return Err(CoremodelError::TransportDown(err));
                }
            }
        }
        Ok(())
    }

    fn write_from_outbound(&mut self) -> Result<()> {
        while let Some(front) = self.outbound.front() {
            match self.stream.write(&front[self.out_offset..]) {
                Ok(0) => {
                    warn!("coremodel: write returned 0, treating as reset");
                    return Err(CoremodelError::TransportDown(io::Error::from(
                        io::ErrorKind::ConnectionReset,
                    )));
                }
                Ok(n) => {
                    self.out_offset += n;
                    if self.out_offset >= front.len() {
                        self.outbound.pop_front();
                        self.out_offset = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "coremodel: write failed");
                    return Err(CoremodelError::TransportDown(err));
                }
            }
        }
        Ok(())
    }
}
