use std::collections::BTreeMap;

use uuid::Uuid;

use crate::packet::{FieldKind, FieldValue, Packet, random_value_for};
use crate::rng::{FuzzRng, rng_trace};

/// Field-name → value map in canonical (lexicographic) genome order.
pub type Genes = BTreeMap<&'static str, FieldValue>;

/// Recombination operator: mixes two parents' genes into a child genome.
pub type CrossoverFn = fn(&Individual, &Individual, &mut FuzzRng) -> Genes;

/// Outcome of the latest test case an individual was used in.
#[derive(Debug, Clone, Copy)]
pub struct CaseOutcome {
    pub case_id: u64,
    pub coverage_increase: bool,
}

/// One packet instance treated as a genome.
#[derive(Debug, Clone)]
pub struct Individual {
    packet: Packet,
    identity: Uuid,
    species: String,
    parents: [Option<Uuid>; 2],
    /// Transient priority position inside the owning population; stamped
    /// whenever the individual is sampled.
    pub(crate) index: usize,
    /// Whether this individual came straight out of the seed capture.
    pub seed_corpus: bool,
    pub latest_case: Option<CaseOutcome>,
}

impl Individual {
    pub fn new(packet: Packet, rng: &mut FuzzRng) -> Self {
        let species = packet.name().to_owned();
        Self {
            packet,
            identity: rng.identity(),
            species,
            parents: [None, None],
            index: usize::MAX,
            seed_corpus: false,
            latest_case: None,
        }
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    /// Override the species label (protocol-specific classifiers).
    pub fn set_species(&mut self, species: impl Into<String>) {
        self.species = species.into();
    }

    pub fn parents(&self) -> &[Option<Uuid>; 2] {
        &self.parents
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn chromosome_count(&self) -> usize {
        self.packet.schema().len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.packet.serialize()
    }

    /// Same species and same field-name set.
    pub fn compatible(&self, other: &Self) -> bool {
        self.species == other.species
            && self
                .packet
                .schema()
                .sorted_names()
                .eq(other.packet.schema().sorted_names())
    }

    /// `compatible` and every field's current value is equal.
    pub fn identical(&self, other: &Self) -> bool {
        self.compatible(other) && self.packet == other.packet
    }

    /// Current genes in canonical order.
    pub fn genes(&self) -> Genes {
        self.packet
            .schema()
            .sorted_names()
            .map(|name| {
                let value = self
                    .packet
                    .get(name)
                    .cloned()
                    .unwrap_or(FieldValue::Bytes(Vec::new()));
                (name, value)
            })
            .collect()
    }

    /// Mutate one uniformly chosen field. List-of-packet fields drill into a
    /// uniformly chosen inner packet and field; fields without a random
    /// generator are left unchanged.
    pub fn random_mutate(&mut self, rng: &mut FuzzRng) {
        let n = self.packet.schema().len();
        if n == 0 {
            return;
        }
        let rank = rng.gene_index(n);
        let wire_idx = self.packet.schema().sorted_index(rank);
        rng_trace("random_mutation", 1, self.packet.schema().field(wire_idx).name);

        if let FieldKind::PacketList(_) = self.packet.schema().field(wire_idx).kind {
            self.mutate_list_field(wire_idx, rng);
            return;
        }
        if let Some(value) = self.packet.random_value(wire_idx, rng) {
            rng_trace("random_mutate", 2, format!("{value:?}"));
            self.packet.set_at(wire_idx, value);
        }
    }

    fn mutate_list_field(&mut self, wire_idx: usize, rng: &mut FuzzRng) {
        let FieldValue::Packets(items) = self.packet.value_at(wire_idx) else {
            return;
        };
        if items.is_empty() {
            return;
        }
        let which = rng.gene_index(items.len());
        let inner_schema = items[which].schema().clone();
        if inner_schema.is_empty() {
            return;
        }
        let inner_rank = rng.gene_index(inner_schema.len());
        let inner_idx = inner_schema.sorted_index(inner_rank);
        rng_trace("random_mutate", 1, inner_schema.field(inner_idx).name);
        let Some(value) = random_value_for(&inner_schema.field(inner_idx).kind, rng) else {
            return;
        };
        rng_trace("random_mutate", 2, format!("{value:?}"));
        if let FieldValue::Packets(items) = self.packet.value_at_mut(wire_idx) {
            items[which].set_at(inner_idx, value);
        }
    }

    /// Deep-copy the packet structure, set every field from `genes`, and
    /// record both parents' identities.
    pub fn give_birth(&self, other: &Self, genes: Genes, rng: &mut FuzzRng) -> Self {
        let mut packet = self.packet.clone();
        for (name, value) in genes {
            packet.set(name, value);
        }
        let mut child = Individual::new(packet, rng);
        child.species = self.species.clone();
        child.parents = [Some(self.identity), Some(other.identity)];
        child
    }
}

/// Single-point crossover over the sorted field-name list of length `n`:
/// a point `p ∈ [0, n]` is drawn uniformly, fields `[0, p)` come from `a`
/// and `[p, n)` from `b`. With fewer than two fields the child degenerates
/// to a clone of one parent.
pub fn single_point_crossover(a: &Individual, b: &Individual, rng: &mut FuzzRng) -> Genes {
    let keys: Vec<&'static str> = a.packet().schema().sorted_names().collect();
    let point = rng.gene_index(keys.len() + 1);
    rng_trace("single_point", 1, point);
    let mut genes = Genes::new();
    for (i, name) in keys.iter().copied().enumerate() {
        let donor = if i < point { a } else { b };
        if let Some(value) = donor.packet().get(name) {
            genes.insert(name, value.clone());
        }
    }
    genes
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Individual, single_point_crossover};
    use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
    use crate::rng::FuzzRng;

    pub(crate) fn frame_schema() -> Arc<PacketSchema> {
        PacketSchema::new("frame", vec![
            FieldSpec::new("start", FieldKind::Const, FieldValue::Bytes(vec![0x68])),
            FieldSpec::new("length", FieldKind::U8, FieldValue::Int(4)),
            FieldSpec::new("seq", FieldKind::U16Le, FieldValue::Int(0)),
            FieldSpec::new("body", FieldKind::Bytes, FieldValue::Bytes(vec![0, 0])),
        ])
    }

    fn individual(seq: u64, rng: &mut FuzzRng) -> Individual {
        let mut packet = Packet::from_schema(frame_schema());
        packet.set("seq", FieldValue::Int(seq));
        Individual::new(packet, rng)
    }

    #[test]
    fn compatibility_and_identity() {
        let mut rng = FuzzRng::from_seed(0);
        let a = individual(1, &mut rng);
        let b = individual(1, &mut rng);
        let c = individual(2, &mut rng);
        assert!(a.compatible(&b));
        assert!(a.identical(&b));
        assert!(a.compatible(&c));
        assert!(!a.identical(&c));

        let mut d = individual(1, &mut rng);
        d.set_species("other");
        assert!(!a.compatible(&d));
        assert!(!a.identical(&d));
    }

    #[test]
    fn crossover_of_identical_parents_is_a_clone() {
        let mut rng = FuzzRng::from_seed(1);
        let x = individual(7, &mut rng);
        let y = x.clone();
        let genes = single_point_crossover(&x, &y, &mut rng);
        let child = x.give_birth(&y, genes, &mut rng);
        assert!(child.identical(&x));
        assert_ne!(child.identity(), x.identity());
        assert_eq!(child.parents(), &[Some(x.identity()), Some(y.identity())]);
    }

    #[test]
    fn mutation_of_generatorless_fields_is_inert() {
        let schema = PacketSchema::new("markers", vec![
            FieldSpec::new("magic", FieldKind::Const, FieldValue::Bytes(vec![0xca, 0xfe])),
            FieldSpec::new("tail", FieldKind::Const, FieldValue::Bytes(vec![0x00])),
        ]);
        let mut rng = FuzzRng::from_seed(2);
        let mut ind = Individual::new(Packet::from_schema(schema), &mut rng);
        let before = ind.serialize();
        for _ in 0..32 {
            ind.random_mutate(&mut rng);
        }
        assert_eq!(ind.serialize(), before);
    }

    #[test]
    fn mutation_eventually_changes_a_mutable_field() {
        let mut rng = FuzzRng::from_seed(3);
        let mut ind = individual(0, &mut rng);
        let before = ind.serialize();
        for _ in 0..64 {
            ind.random_mutate(&mut rng);
        }
        assert_ne!(ind.serialize(), before);
        // The start marker is const and must have survived every mutation.
        assert_eq!(ind.serialize()[0], 0x68);
    }

    #[test]
    fn list_fields_drill_into_inner_packets() {
        let inner = PacketSchema::new("item", vec![FieldSpec::new(
            "value",
            FieldKind::U8,
            FieldValue::Int(0),
        )]);
        let outer = PacketSchema::new("list_frame", vec![FieldSpec::new(
            "items",
            FieldKind::PacketList(Arc::clone(&inner)),
            FieldValue::Packets(vec![Packet::from_schema(Arc::clone(&inner))]),
        )]);
        let mut rng = FuzzRng::from_seed(4);
        let mut ind = Individual::new(Packet::from_schema(outer), &mut rng);
        let before = ind.serialize();
        let mut changed = false;
        for _ in 0..64 {
            ind.random_mutate(&mut rng);
            if ind.serialize() != before {
                changed = true;
                break;
            }
        }
        assert!(changed, "list drill-down never mutated the inner field");
    }

    #[test]
    fn crossover_point_splits_sorted_keys() {
        // With seq taken from one parent and body from the other, the child
        // must mix wire bytes from both.
        let mut rng = FuzzRng::from_seed(5);
        let mut pa = Packet::from_schema(frame_schema());
        pa.set("seq", FieldValue::Int(0x1111));
        pa.set("body", FieldValue::Bytes(vec![0xaa, 0xaa]));
        let mut pb = Packet::from_schema(frame_schema());
        pb.set("seq", FieldValue::Int(0x2222));
        pb.set("body", FieldValue::Bytes(vec![0xbb, 0xbb]));
        let a = Individual::new(pa, &mut rng);
        let b = Individual::new(pb, &mut rng);

        // Sorted keys: body < length < seq < start. Build the genes by hand
        // for point 1: body from a, the rest from b.
        let mut genes = super::Genes::new();
        genes.insert("body", a.packet().get("body").unwrap().clone());
        for key in ["length", "seq", "start"] {
            genes.insert(key, b.packet().get(key).unwrap().clone());
        }
        let child = a.give_birth(&b, genes, &mut rng);
        let wire = child.serialize();
        assert_eq!(&wire[2..4], &[0x22, 0x22]);
        assert_eq!(&wire[4..6], &[0xaa, 0xaa]);
    }
}
