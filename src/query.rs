//! Control-plane wire encoding for the reserved query connection
//! (`SPEC_FULL.md` §4.3): device enumeration, attach, and disconnect.

use crate::protocol::{CONN_QUERY, DeviceType, DeviceListEntry, Packet, pad4, query as wire};

/// Builds a `REQ_LIST` packet asking for entries starting at `index`.
#[must_use]
pub fn encode_req_list(index: u16) -> Packet {
    Packet::new(CONN_QUERY, wire::REQ_LIST, 0, index, Vec::new())
}

/// Builds a `REQ_CONN` packet attaching `name` as `devtype`, targeting
/// sub-endpoint `num` (I²C address, SPI chip-select, GPIO pin, USB port;
/// `0` for UART/CAN), with per-type `flags` in `hflag`.
#[must_use]
pub fn encode_req_conn(devtype: DeviceType, name: &str, num: u32, flags: u16) -> Packet {
    let data = encode_record(devtype, name, num);
    Packet::new(CONN_QUERY, wire::REQ_CONN, 0, flags, data)
}

/// Builds a `REQ_DISC` packet releasing `conn`.
#[must_use]
pub fn encode_req_disc(conn: u16) -> Packet {
    Packet::new(CONN_QUERY, wire::REQ_DISC, 0, conn, Vec::new())
}

/// Encodes one list/attach record: `{u16 type, u16 name_len, u32 num, name}`,
/// padded to a 4-byte multiple (stride `(11 + name_len) & !3`, i.e.
/// `pad4(8 + name_len)`).
fn encode_record(devtype: DeviceType, name: &str, num: u32) -> Vec<u8> {
    let name = name.as_bytes();
    let unpadded = 8 + name.len();
    let mut buf = Vec::with_capacity(pad4(unpadded));
    buf.extend_from_slice(&(devtype as i32 as u16).to_le_bytes());
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(&num.to_le_bytes());
    buf.extend_from_slice(name);
    buf.resize(pad4(unpadded), 0);
    buf
}

/// Parses every complete record out of a `RSP_LIST` payload, skipping
/// records whose `type` field is not a recognised [`DeviceType`], and
/// returns the number of records stepped over alongside the recognised
/// ones. The count includes unrecognised-type records: the next
/// `REQ_LIST` index must advance past every record the VM returned, not
/// just the ones this client kept, or a batch containing an unrecognised
/// type would be re-requested forever.
#[must_use]
pub fn parse_list_batch(payload: &[u8]) -> (Vec<DeviceListEntry>, u16) {
    let mut entries = Vec::new();
    let mut offset = 0;
    let mut count: u16 = 0;
    while offset + 8 <= payload.len() {
        let kind_raw = u16::from_le_bytes([payload[offset], payload[offset + 1]]);
        let name_len = u16::from_le_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
        let num = u32::from_le_bytes(payload[offset + 4..offset + 8].try_into().unwrap());
        let name_start = offset + 8;
        let name_end = name_start + name_len;
        if name_end > payload.len() {
            break;
        }
        count += 1;
        if let Some(kind) = DeviceType::from_wire(kind_raw) {
            let name = String::from_utf8_lossy(&payload[name_start..name_end]).into_owned();
            entries.push(DeviceListEntry { kind, name, num });
        }
        offset += pad4(8 + name_len);
    }
    (entries, count)
}

/// Parses every complete record out of a `RSP_LIST` payload, skipping
/// records whose `type` field is not a recognised [`DeviceType`].
#[must_use]
pub fn parse_list_entries(payload: &[u8]) -> Vec<DeviceListEntry> {
    parse_list_batch(payload).0
}

/// Parses the optional `u32` initial credit carried in a `RSP_CONN` payload.
#[must_use]
pub fn parse_rsp_conn_credit(payload: &[u8]) -> Option<u32> {
    (payload.len() >= 4).then(|| u32::from_le_bytes(payload[0..4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_list_parser() {
        let record = encode_record(DeviceType::Uart, "UART", 0);
        let entries = parse_list_entries(&record);
        assert_eq!(entries, vec![DeviceListEntry { kind: DeviceType::Uart, name: "UART".into(), num: 0 }]);
    }

    #[test]
    fn list_parser_consumes_multiple_records_in_sequence() {
        let mut payload = encode_record(DeviceType::Uart, "UART0", 0);
        payload.extend(encode_record(DeviceType::I2c, "I2C1", 0x50));
        let entries = parse_list_entries(&payload);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].name, "I2C1");
        assert_eq!(entries[1].num, 0x50);
    }

    #[test]
    fn unrecognised_type_is_skipped_but_parsing_continues() {
        let mut payload = encode_record(DeviceType::Can, "BAD", 0);
        payload[0] = 0xEE;
        payload[1] = 0xEE;
        payload.extend(encode_record(DeviceType::Spi, "SPI0", 1));
        let entries = parse_list_entries(&payload);
        assert_eq!(entries, vec![DeviceListEntry { kind: DeviceType::Spi, name: "SPI0".into(), num: 1 }]);
    }

    #[test]
    fn batch_count_includes_unrecognised_records_for_next_index() {
        let mut payload = encode_record(DeviceType::Can, "BAD", 0);
        payload[0] = 0xEE;
        payload[1] = 0xEE;
        payload.extend(encode_record(DeviceType::Spi, "SPI0", 1));
        let (entries, count) = parse_list_batch(&payload);
        assert_eq!(entries.len(), 1);
        assert_eq!(count, 2, "next REQ_LIST index must step past the unrecognised record too");
    }

    #[test]
    fn rsp_conn_credit_absent_when_payload_empty() {
        assert_eq!(parse_rsp_conn_credit(&[]), None);
        assert_eq!(parse_rsp_conn_credit(&42u32.to_le_bytes()), Some(42));
    }
}
