//! IEC 60870-5-104 protocol module.
//!
//! APDUs are classified into the three frame formats by the tag bits of the
//! first control octet: I (information transfer), S (supervisory), and U
//! (unnumbered control). The model is byte-granular — sequence numbers are
//! kept as the raw control octet pairs so parse/serialize round-trips are
//! exact even for frames that abuse the reserved bits.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::genetics::Population;
use crate::packet::capture::SeedRecord;
use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
use crate::protocols::ProtocolFuzzer;
use crate::transition::TransitionPayload;

const START_BYTE: u8 = 0x68;
/// APCI: start, length, four control octets.
const APCI_LEN: usize = 6;
/// APCI plus the ASDU head (type, vsq, cot, org, two address octets).
const I_FRAME_MIN: usize = 12;

const U_SPECIES: &str = "IEC-104 U APDU";

static INFO_OBJECT: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new("IEC-104 IO", vec![
        FieldSpec::new("ioa", FieldKind::U24Le, FieldValue::Int(0)),
        FieldSpec::new("data", FieldKind::Bytes, FieldValue::Bytes(Vec::new())),
    ])
});

static I_SCHEMA: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new("IEC-104 I APDU", vec![
        FieldSpec::new("start", FieldKind::Const, FieldValue::Bytes(vec![START_BYTE])),
        FieldSpec::new("apdu_len", FieldKind::U8, FieldValue::Int(4)),
        FieldSpec::new("tx_seq", FieldKind::U16Le, FieldValue::Int(0)),
        FieldSpec::new("rx_seq", FieldKind::U16Le, FieldValue::Int(0)),
        FieldSpec::new("type_id", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("vsq", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("cot", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("org", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("asdu_addr", FieldKind::U16Le, FieldValue::Int(0)),
        FieldSpec::new(
            "ios",
            FieldKind::PacketList(Arc::clone(&INFO_OBJECT)),
            FieldValue::Packets(Vec::new()),
        ),
    ])
});

static S_SCHEMA: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new("IEC-104 S APDU", vec![
        FieldSpec::new("start", FieldKind::Const, FieldValue::Bytes(vec![START_BYTE])),
        FieldSpec::new("apdu_len", FieldKind::U8, FieldValue::Int(4)),
        FieldSpec::new("ctrl1", FieldKind::U8, FieldValue::Int(0x01)),
        FieldSpec::new("ctrl2", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("rx_seq", FieldKind::U16Le, FieldValue::Int(0)),
    ])
});

static U_SCHEMA: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new(U_SPECIES, vec![
        FieldSpec::new("start", FieldKind::Const, FieldValue::Bytes(vec![START_BYTE])),
        FieldSpec::new("apdu_len", FieldKind::U8, FieldValue::Int(4)),
        FieldSpec::new("ctrl1", FieldKind::U8, FieldValue::Int(0x43)),
        FieldSpec::new("ctrl2", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("ctrl3", FieldKind::U8, FieldValue::Int(0)),
        FieldSpec::new("ctrl4", FieldKind::U8, FieldValue::Int(0)),
    ])
});

#[derive(Debug)]
pub struct Iec104;

impl Iec104 {
    fn decode_apdu(payload: &[u8]) -> Option<Packet> {
        if payload.len() < APCI_LEN || payload[0] != START_BYTE {
            return None;
        }
        let ctrl1 = payload[2];
        if ctrl1 & 0x01 == 0 {
            Self::decode_i_frame(payload)
        } else if ctrl1 & 0x03 == 0x01 {
            Self::decode_s_frame(payload)
        } else {
            Self::decode_u_frame(payload)
        }
    }

    fn decode_i_frame(payload: &[u8]) -> Option<Packet> {
        if payload.len() < I_FRAME_MIN {
            return None;
        }
        let mut packet = Packet::from_schema(Arc::clone(&I_SCHEMA));
        packet.set("apdu_len", FieldValue::Int(u64::from(payload[1])));
        packet.set("tx_seq", FieldValue::Int(u16le(payload, 2)));
        packet.set("rx_seq", FieldValue::Int(u16le(payload, 4)));
        packet.set("type_id", FieldValue::Int(u64::from(payload[6])));
        packet.set("vsq", FieldValue::Int(u64::from(payload[7])));
        packet.set("cot", FieldValue::Int(u64::from(payload[8])));
        packet.set("org", FieldValue::Int(u64::from(payload[9])));
        packet.set("asdu_addr", FieldValue::Int(u16le(payload, 10)));

        let rest = &payload[I_FRAME_MIN..];
        let ios = match Self::split_info_objects(payload[6], payload[7], rest) {
            Some(ios) => ios,
            None if rest.is_empty() => Vec::new(),
            // Unknown type, sequence layout, or truncated objects: keep the
            // whole tail as one object so the round trip stays exact.
            None if rest.len() >= 3 => vec![info_object(rest)],
            None => return None,
        };
        packet.set("ios", FieldValue::Packets(ios));
        Some(packet)
    }

    /// Split the ASDU tail into its information objects when the layout is
    /// unambiguous: no sequence bit, a known per-type element size, and a
    /// tail length that matches the announced object count exactly.
    fn split_info_objects(type_id: u8, vsq: u8, rest: &[u8]) -> Option<Vec<Packet>> {
        let sequence = vsq & 0x80 != 0;
        let count = usize::from(vsq & 0x7f);
        if sequence || count == 0 {
            return None;
        }
        let element = info_element_size(type_id)?;
        if rest.len() != count * (3 + element) {
            return None;
        }
        let ios = rest
            .chunks_exact(3 + element)
            .map(info_object)
            .collect();
        Some(ios)
    }

    fn decode_s_frame(payload: &[u8]) -> Option<Packet> {
        if payload.len() != APCI_LEN {
            return None;
        }
        let mut packet = Packet::from_schema(Arc::clone(&S_SCHEMA));
        packet.set("apdu_len", FieldValue::Int(u64::from(payload[1])));
        packet.set("ctrl1", FieldValue::Int(u64::from(payload[2])));
        packet.set("ctrl2", FieldValue::Int(u64::from(payload[3])));
        packet.set("rx_seq", FieldValue::Int(u16le(payload, 4)));
        Some(packet)
    }

    fn decode_u_frame(payload: &[u8]) -> Option<Packet> {
        if payload.len() != APCI_LEN {
            return None;
        }
        let mut packet = Packet::from_schema(Arc::clone(&U_SCHEMA));
        packet.set("apdu_len", FieldValue::Int(u64::from(payload[1])));
        packet.set("ctrl1", FieldValue::Int(u64::from(payload[2])));
        packet.set("ctrl2", FieldValue::Int(u64::from(payload[3])));
        packet.set("ctrl3", FieldValue::Int(u64::from(payload[4])));
        packet.set("ctrl4", FieldValue::Int(u64::from(payload[5])));
        Some(packet)
    }
}

impl ProtocolFuzzer for Iec104 {
    fn name(&self) -> &'static str {
        "iec104"
    }

    fn decode(&self, record: &SeedRecord) -> Option<Packet> {
        Self::decode_apdu(&record.payload)
    }

    /// Drive the link into the STARTDT state before every fuzzed message and
    /// back out afterwards. U frames manage that state themselves and get
    /// empty phases.
    fn wire_transitions(&self, populations: &mut BTreeMap<String, Population>) -> Result<()> {
        let testfr = TransitionPayload::new(
            "testfr",
            vec![0x68, 0x04, 0x43, 0x00, 0x00, 0x00],
            true,
        );
        let startdt = TransitionPayload::new(
            "startdt",
            vec![0x68, 0x04, 0x07, 0x00, 0x00, 0x00],
            true,
        );
        let stopdt = TransitionPayload::new(
            "stopdt",
            vec![0x68, 0x04, 0x13, 0x00, 0x00, 0x00],
            false,
        );
        for (species, population) in populations.iter_mut() {
            let graph = population.graph_mut();
            if species != U_SPECIES {
                graph.pre(testfr.clone())?;
                graph.pre(startdt.clone())?;
                graph.finalize_pre()?;
                graph.post(stopdt.clone())?;
                graph.finalize_post()?;
            } else {
                graph.finalize_pre()?;
                graph.finalize_post()?;
            }
        }
        Ok(())
    }
}

fn u16le(bytes: &[u8], offset: usize) -> u64 {
    u64::from(u16::from_le_bytes([bytes[offset], bytes[offset + 1]]))
}

/// One information object from its wire bytes (3-byte address + element).
fn info_object(bytes: &[u8]) -> Packet {
    let mut object = Packet::from_schema(Arc::clone(&INFO_OBJECT));
    let ioa = u64::from(bytes[0]) | (u64::from(bytes[1]) << 8) | (u64::from(bytes[2]) << 16);
    object.set("ioa", FieldValue::Int(ioa));
    object.set("data", FieldValue::Bytes(bytes[3..].to_vec()));
    object
}

/// Information element size per ASDU type, for the common monitoring and
/// control types. Unknown types keep their tail as one opaque object.
fn info_element_size(type_id: u8) -> Option<usize> {
    Some(match type_id {
        // Single-point, double-point.
        1 | 3 => 1,
        // Step position + quality.
        5 => 2,
        // Normalized / scaled measured value + quality.
        9 | 11 => 3,
        // Short float measured value + quality.
        13 => 5,
        // Single-point with CP56Time2a.
        30 => 8,
        // Single / double command, regulating step.
        45..=47 => 1,
        // Set points: normalized, scaled, short float.
        48 | 49 => 3,
        50 => 5,
        // Interrogation / counter interrogation qualifier.
        100 | 101 => 1,
        // Clock synchronisation (CP56Time2a).
        103 => 7,
        _ => return None,
    })
}
