//! Structured packet model.
//!
//! A [`PacketSchema`] names the fields of one message type in wire order; a
//! [`Packet`] pairs a schema with current field values. The genome view of a
//! packet iterates field names in lexicographic order, which keeps crossover
//! and equality checks deterministic; serialization always follows wire
//! order, so the two orderings are independent.
//!
//! Random value generation is a small per-kind registry: primitive kinds map
//! to typed RNG draws, composite kinds recurse through the individual's
//! mutation drill-down, and [`FieldKind::Const`] is inert.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::rng::FuzzRng;

pub mod capture;

/// Upper bound on randomly generated byte-string lengths.
const MAX_RANDOM_BYTES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed marker bytes. Has no random generator, so mutation leaves it
    /// unchanged.
    Const,
    U8,
    U16Be,
    U16Le,
    /// Three-byte little-endian integer (information object addresses).
    U24Le,
    U32Be,
    /// Unbounded byte string.
    Bytes,
    /// Homogeneous list of sub-packets.
    PacketList(Arc<PacketSchema>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Bytes(Vec<u8>),
    Packets(Vec<Packet>),
}

impl FieldValue {
    fn write(&self, kind: &FieldKind, out: &mut Vec<u8>) {
        match (kind, self) {
            (FieldKind::Const | FieldKind::Bytes, FieldValue::Bytes(bytes)) => {
                out.extend_from_slice(bytes);
            }
            (FieldKind::U8, FieldValue::Int(v)) => out.push(*v as u8),
            (FieldKind::U16Be, FieldValue::Int(v)) => {
                out.extend_from_slice(&(*v as u16).to_be_bytes());
            }
            (FieldKind::U16Le, FieldValue::Int(v)) => {
                out.extend_from_slice(&(*v as u16).to_le_bytes());
            }
            (FieldKind::U24Le, FieldValue::Int(v)) => {
                out.extend_from_slice(&(*v as u32).to_le_bytes()[..3]);
            }
            (FieldKind::U32Be, FieldValue::Int(v)) => {
                out.extend_from_slice(&(*v as u32).to_be_bytes());
            }
            (FieldKind::PacketList(_), FieldValue::Packets(inner)) => {
                for packet in inner {
                    out.extend_from_slice(&packet.serialize());
                }
            }
            // A mutated value can only ever be of the field's own shape;
            // mismatches mean a protocol module bug, serialize nothing.
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub default: FieldValue,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind, default: FieldValue) -> Self {
        Self {
            name,
            kind,
            default,
        }
    }
}

/// Named, ordered field layout of one message type.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketSchema {
    name: &'static str,
    /// Wire order.
    fields: Vec<FieldSpec>,
    /// Indices into `fields`, sorted by field name: the genome order.
    sorted: Vec<usize>,
    /// Field name → wire index.
    by_name: IndexMap<&'static str, usize>,
}

impl PacketSchema {
    pub fn new(name: &'static str, fields: Vec<FieldSpec>) -> Arc<Self> {
        let mut sorted: Vec<usize> = (0..fields.len()).collect();
        sorted.sort_by_key(|&i| fields[i].name);
        let by_name = fields.iter().enumerate().map(|(i, f)| (f.name, i)).collect();
        Arc::new(Self {
            name,
            fields,
            sorted,
            by_name,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> &FieldSpec {
        &self.fields[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Field names in lexicographic order.
    pub fn sorted_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.sorted.iter().map(|&i| self.fields[i].name)
    }

    /// Wire-order index of the `rank`-th field in genome order.
    pub fn sorted_index(&self, rank: usize) -> usize {
        self.sorted[rank]
    }
}

/// One packet instance: a schema plus its current field values.
#[derive(Debug, Clone)]
pub struct Packet {
    schema: Arc<PacketSchema>,
    /// Parallel to `schema.fields`.
    values: Vec<FieldValue>,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name && self.values == other.values
    }
}

impl Eq for Packet {}

impl Packet {
    /// Fresh packet with every field at its default value.
    pub fn from_schema(schema: Arc<PacketSchema>) -> Self {
        let values = schema.fields.iter().map(|f| f.default.clone()).collect();
        Self {
            schema,
            values,
        }
    }

    pub fn schema(&self) -> &Arc<PacketSchema> {
        &self.schema
    }

    /// The top-layer name; the default species label.
    pub fn name(&self) -> &'static str {
        self.schema.name
    }

    pub fn value_at(&self, index: usize) -> &FieldValue {
        &self.values[index]
    }

    pub fn value_at_mut(&mut self, index: usize) -> &mut FieldValue {
        &mut self.values[index]
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema.index_of(name).map(|i| &self.values[i])
    }

    pub fn set(&mut self, name: &str, value: FieldValue) -> bool {
        match self.schema.index_of(name) {
            Some(i) => {
                self.values[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn set_at(&mut self, index: usize, value: FieldValue) {
        self.values[index] = value;
    }

    /// Deterministic wire encoding of the current field values.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (spec, value) in self.schema.fields.iter().zip(&self.values) {
            value.write(&spec.kind, &mut out);
        }
        out
    }

    /// Draw a random value for the field at `index`, if its kind has a
    /// generator. `Const` and `PacketList` fields return `None`.
    pub fn random_value(&self, index: usize, rng: &mut FuzzRng) -> Option<FieldValue> {
        random_value_for(&self.schema.fields[index].kind, rng)
    }
}

/// The per-kind random value registry.
pub(crate) fn random_value_for(kind: &FieldKind, rng: &mut FuzzRng) -> Option<FieldValue> {
    match kind {
        FieldKind::Const | FieldKind::PacketList(_) => None,
        FieldKind::U8 => Some(FieldValue::Int(u64::from(rng.gene_byte()))),
        FieldKind::U16Be | FieldKind::U16Le => Some(FieldValue::Int(rng.gene_u64() & 0xffff)),
        FieldKind::U24Le => Some(FieldValue::Int(rng.gene_u64() & 0x00ff_ffff)),
        FieldKind::U32Be => Some(FieldValue::Int(rng.gene_u64() & 0xffff_ffff)),
        FieldKind::Bytes => {
            let len = rng.gene_index(MAX_RANDOM_BYTES + 1);
            Some(FieldValue::Bytes(rng.gene_bytes(len)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
    use crate::rng::FuzzRng;

    fn toy_schema() -> Arc<PacketSchema> {
        PacketSchema::new("toy", vec![
            FieldSpec::new("start", FieldKind::Const, FieldValue::Bytes(vec![0x68])),
            FieldSpec::new("length", FieldKind::U8, FieldValue::Int(4)),
            FieldSpec::new("seq", FieldKind::U16Le, FieldValue::Int(0x0102)),
            FieldSpec::new("body", FieldKind::Bytes, FieldValue::Bytes(vec![0xaa, 0xbb])),
        ])
    }

    #[test]
    fn serialize_follows_wire_order() {
        let packet = Packet::from_schema(toy_schema());
        assert_eq!(packet.serialize(), vec![0x68, 0x04, 0x02, 0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn genome_order_is_lexicographic() {
        let schema = toy_schema();
        let names: Vec<_> = schema.sorted_names().collect();
        assert_eq!(names, vec!["body", "length", "seq", "start"]);
    }

    #[test]
    fn const_fields_have_no_generator() {
        let packet = Packet::from_schema(toy_schema());
        let mut rng = FuzzRng::from_seed(0);
        let start = packet.schema().index_of("start").unwrap();
        assert!(packet.random_value(start, &mut rng).is_none());
    }

    #[test]
    fn primitive_generators_stay_in_range() {
        let packet = Packet::from_schema(toy_schema());
        let mut rng = FuzzRng::from_seed(5);
        let length = packet.schema().index_of("length").unwrap();
        for _ in 0..64 {
            match packet.random_value(length, &mut rng) {
                Some(FieldValue::Int(v)) => assert!(v <= 0xff),
                other => panic!("unexpected value: {other:?}"),
            }
        }
    }

    #[test]
    fn set_and_reserialize() {
        let mut packet = Packet::from_schema(toy_schema());
        assert!(packet.set("seq", FieldValue::Int(0xbeef)));
        assert!(!packet.set("missing", FieldValue::Int(0)));
        assert_eq!(packet.serialize()[2..4], [0xef, 0xbe]);
    }

    #[test]
    fn packet_list_serializes_recursively() {
        let inner = PacketSchema::new("item", vec![FieldSpec::new(
            "data",
            FieldKind::Bytes,
            FieldValue::Bytes(vec![1, 2]),
        )]);
        let outer = PacketSchema::new("outer", vec![FieldSpec::new(
            "items",
            FieldKind::PacketList(Arc::clone(&inner)),
            FieldValue::Packets(vec![
                Packet::from_schema(Arc::clone(&inner)),
                Packet::from_schema(Arc::clone(&inner)),
            ]),
        )]);
        let packet = Packet::from_schema(outer);
        assert_eq!(packet.serialize(), vec![1, 2, 1, 2]);
    }
}
