//! Fallback module: every transport payload is one opaque byte-string
//! packet of species `raw`. Useful against protocols without a dedicated
//! module — crossover degenerates to cloning, so progress comes from spot
//! mutations alone.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::genetics::Population;
use crate::packet::capture::SeedRecord;
use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
use crate::protocols::ProtocolFuzzer;

static RAW_SCHEMA: LazyLock<Arc<PacketSchema>> = LazyLock::new(|| {
    PacketSchema::new("raw", vec![FieldSpec::new(
        "data",
        FieldKind::Bytes,
        FieldValue::Bytes(Vec::new()),
    )])
});

#[derive(Debug)]
pub struct Raw;

impl ProtocolFuzzer for Raw {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(&self, record: &SeedRecord) -> Option<Packet> {
        let mut packet = Packet::from_schema(Arc::clone(&RAW_SCHEMA));
        packet.set("data", FieldValue::Bytes(record.payload.clone()));
        Some(packet)
    }

    fn wire_transitions(&self, populations: &mut BTreeMap<String, Population>) -> Result<()> {
        for population in populations.values_mut() {
            population.graph_mut().finalize_pre()?;
            population.graph_mut().finalize_post()?;
        }
        Ok(())
    }
}
