//! Drives `Coremodel` end to end against a loopback TCP peer that plays the
//! role of the VM, mirroring the wire scenarios in `SPEC_FULL.md` §8.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use coremodel::protocol::{self, CONN_QUERY, DeviceType, Packet, pad4, query as qwire, uart as uwire};
use coremodel::{Coremodel, I2cCallbacks, UartCallbacks};

/// Reads one padded frame off `stream`, blocking. Mirrors the framer's
/// length math but on the "VM" side of the socket.
fn read_packet(stream: &mut TcpStream) -> Packet {
    let mut header = [0u8; protocol::HEADER_SIZE];
    stream.read_exact(&mut header).expect("read header");
    let len = u16::from_le_bytes([header[0], header[1]]) as usize;
    let mut rest = vec![0u8; pad4(len) - protocol::HEADER_SIZE];
    stream.read_exact(&mut rest).expect("read payload+pad");
    let mut raw = header.to_vec();
    raw.extend_from_slice(&rest);
    Packet::decode(&raw[..len.max(protocol::HEADER_SIZE)])
}

fn write_packet(stream: &mut TcpStream, pkt: &Packet) {
    let mut buf = Vec::new();
    pkt.encode_into(&mut buf);
    stream.write_all(&buf).expect("write packet");
}

fn accept_with_timeout(listener: &TcpListener) -> TcpStream {
    let (stream, _) = listener.accept().expect("accept");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
}

#[test]
fn list_one_endpoint_then_sentinel() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_with_timeout(&listener);

        let req0 = read_packet(&mut stream);
        assert_eq!(req0.pkt, qwire::REQ_LIST);
        assert_eq!(req0.hflag, 0);

        // One UART record, then an empty RSP_LIST terminating enumeration.
        let mut record = Vec::new();
        record.extend_from_slice(&0u16.to_le_bytes()); // type = UART
        record.extend_from_slice(&4u16.to_le_bytes()); // name_len
        record.extend_from_slice(&0u32.to_le_bytes()); // num
        record.extend_from_slice(b"UART");
        write_packet(&mut stream, &Packet::new(CONN_QUERY, qwire::RSP_LIST, 0, 0, record));

        let req1 = read_packet(&mut stream);
        assert_eq!(req1.pkt, qwire::REQ_LIST);
        assert_eq!(req1.hflag, 1);

        write_packet(&mut stream, &Packet::new(CONN_QUERY, qwire::RSP_LIST, 0, 1, Vec::new()));
    });

    let mut client = Coremodel::connect(Some(&addr.to_string())).unwrap();
    let entries = client.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, DeviceType::Uart);
    assert_eq!(entries[0].name, "UART");

    server.join().unwrap();
}

struct CountingUart {
    rxrdy_calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl UartCallbacks for CountingUart {
    fn rxrdy(&mut self) {
        self.rxrdy_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn uart_attach_then_credit_round_trip() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_with_timeout(&listener);

        let req_conn = read_packet(&mut stream);
        assert_eq!(req_conn.pkt, qwire::REQ_CONN);

        // Accept with conn id 7 and 16 initial credits.
        let credit = 16u32.to_le_bytes().to_vec();
        write_packet(&mut stream, &Packet::new(CONN_QUERY, qwire::RSP_CONN, 0, 7, credit));

        // Host -> VM bytes are wire-named RX.
        let rx1 = read_packet(&mut stream);
        assert_eq!(rx1.conn, 7);
        assert_eq!(rx1.pkt, uwire::RX);
        assert_eq!(rx1.data.len(), 16);

        // Grant 8 more credits.
        write_packet(&mut stream, &Packet::new(7, uwire::RX_ACK, 0, 8, Vec::new()));

        let rx2 = read_packet(&mut stream);
        assert_eq!(rx2.conn, 7);
        assert_eq!(rx2.data.len(), 8);
    });

    let rxrdy_calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    let mut client = Coremodel::connect(Some(&addr.to_string())).unwrap();
    let handle = client.attach_uart("UART0", Box::new(CountingUart { rxrdy_calls: rxrdy_calls.clone() })).unwrap();

    assert_eq!(client.uart_rx(handle, &[0u8; 16]).unwrap(), 16);
    assert_eq!(client.uart_rx(handle, &[0u8; 1]).unwrap(), 0);

    // Block briefly so the RX_ACK the server sends after seeing rx1 has a
    // chance to arrive and be dispatched.
    client.run(200_000).unwrap();

    assert_eq!(rxrdy_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(client.uart_rx(handle, &[0u8; 32]).unwrap(), 8);

    server.join().unwrap();
}

struct NakOnce;

impl I2cCallbacks for NakOnce {
    fn start(&mut self) -> i32 {
        1
    }
    fn write(&mut self, _data: &[u8]) -> i32 {
        -1
    }
    fn read(&mut self, _scratch: &mut [u8]) -> usize {
        0
    }
    fn stop(&mut self) {}
}

#[test]
fn i2c_write_nak_emits_done_with_matching_transaction_index() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_with_timeout(&listener);

        let req_conn = read_packet(&mut stream);
        assert_eq!(req_conn.pkt, qwire::REQ_CONN);
        write_packet(&mut stream, &Packet::new(CONN_QUERY, qwire::RSP_CONN, 0, 3, Vec::new()));

        write_packet(&mut stream, &Packet::new(3, protocol::i2c::WRITE, 1, 42, vec![0xAA, 0xBB]));

        let done = read_packet(&mut stream);
        assert_eq!(done.pkt, protocol::i2c::DONE);
        assert_eq!(done.hflag, 42);
        assert_eq!(done.bflag, 1);
    });

    let mut client = Coremodel::connect(Some(&addr.to_string())).unwrap();
    let _handle = client.attach_i2c("I2C0", 0x50, Box::new(NakOnce), coremodel::I2cFlags::empty()).unwrap();

    client.run(200_000).unwrap();

    server.join().unwrap();
}

#[test]
fn oversized_packet_is_discarded_but_stream_continues() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let mut stream = accept_with_timeout(&listener);

        let req0 = read_packet(&mut stream);
        assert_eq!(req0.pkt, qwire::REQ_LIST);

        // An oversized RSP_LIST: declared len way above MAX_PKT. The framer
        // must drain and discard it without dispatching anything.
        let mut raw = Vec::new();
        let total_len = 2000u16;
        raw.extend_from_slice(&total_len.to_le_bytes());
        raw.extend_from_slice(&CONN_QUERY.to_le_bytes());
        raw.push(qwire::RSP_LIST);
        raw.push(0);
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.resize(pad4(total_len as usize), 0);
        stream.write_all(&raw).unwrap();

        // Followed by a well-formed, empty RSP_LIST that still parses and
        // terminates the enumeration.
        write_packet(&mut stream, &Packet::new(CONN_QUERY, qwire::RSP_LIST, 0, 0, Vec::new()));
    });

    let mut client = Coremodel::connect(Some(&addr.to_string())).unwrap();
    let entries = client.list().unwrap();
    assert!(entries.is_empty());

    server.join().unwrap();
}
