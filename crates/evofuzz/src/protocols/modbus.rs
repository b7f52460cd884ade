//! Modbus/TCP protocol module.
//!
//! Every ADU is an MBAP header followed by one function code and its data.
//! Populations are split per function class rather than per frame layout:
//! the schema is shared, but a "write single register" request exercises
//! very different target code than a "read coils" request, so they evolve
//! separately. Modbus is strictly request/response, so a reply is expected
//! after every fuzzed message.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::genetics::Population;
use crate::packet::capture::SeedRecord;
use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
use crate::protocols::ProtocolFuzzer;

/// MBAP header plus the function code.
const ADU_MIN: usize = 8;

static ADU_SCHEMA: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new("Modbus ADU", vec![
        FieldSpec::new("transaction_id", FieldKind::U16Be, FieldValue::Int(0)),
        FieldSpec::new("protocol_id", FieldKind::U16Be, FieldValue::Int(0)),
        FieldSpec::new("length", FieldKind::U16Be, FieldValue::Int(2)),
        FieldSpec::new("unit_id", FieldKind::U8, FieldValue::Int(1)),
        FieldSpec::new("function", FieldKind::U8, FieldValue::Int(3)),
        FieldSpec::new("data", FieldKind::Bytes, FieldValue::Bytes(Vec::new())),
    ])
});

#[derive(Debug)]
pub struct Modbus;

impl Modbus {
    fn function_label(function: u64) -> String {
        let name = match function {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0f => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            0x17 => "Read Write Multiple Registers",
            other => return format!("Modbus Function {other}"),
        };
        format!("Modbus {name}")
    }
}

impl ProtocolFuzzer for Modbus {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn decode(&self, record: &SeedRecord) -> Option<Packet> {
        let payload = &record.payload;
        if payload.len() < ADU_MIN {
            return None;
        }
        // Protocol identifier is always zero on the wire; anything else is
        // not Modbus/TCP.
        if payload[2] != 0 || payload[3] != 0 {
            return None;
        }
        let mut packet = Packet::from_schema(Arc::clone(&ADU_SCHEMA));
        packet.set("transaction_id", FieldValue::Int(u16be(payload, 0)));
        packet.set("protocol_id", FieldValue::Int(u16be(payload, 2)));
        packet.set("length", FieldValue::Int(u16be(payload, 4)));
        packet.set("unit_id", FieldValue::Int(u64::from(payload[6])));
        packet.set("function", FieldValue::Int(u64::from(payload[7])));
        packet.set("data", FieldValue::Bytes(payload[ADU_MIN..].to_vec()));
        Some(packet)
    }

    fn classify(&self, packet: &Packet) -> String {
        match packet.get("function") {
            Some(&FieldValue::Int(function)) => Self::function_label(function),
            _ => packet.name().to_owned(),
        }
    }

    fn wire_transitions(&self, populations: &mut BTreeMap<String, Population>) -> Result<()> {
        for population in populations.values_mut() {
            population.recv_after_send = true;
            population.graph_mut().finalize_pre()?;
            population.graph_mut().finalize_post()?;
        }
        Ok(())
    }
}

fn u16be(bytes: &[u8], offset: usize) -> u64 {
    u64::from(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]))
}
