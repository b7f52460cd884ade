//! Protocol modules.
//!
//! A [`ProtocolFuzzer`] knows how to turn raw capture payloads into typed
//! packets, how to label them with a species, and which handshake payloads
//! must be sent around a fuzzed message. Modules are found through an
//! explicit registry keyed by name.

pub mod iec104;
pub mod modbus;
pub mod raw;

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::genetics::{Individual, Population, single_point_crossover};
use crate::packet::Packet;
use crate::packet::capture::{self, SeedRecord};
use crate::rng::{FuzzRng, rng_trace};

/// Attempts to grow a singleton species before giving up; mutation can land
/// on generator-less fields and change nothing.
const GROW_ATTEMPTS: usize = 8;

pub trait ProtocolFuzzer: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Decode one transport payload into a typed packet, or `None` to
    /// discard the record.
    fn decode(&self, record: &SeedRecord) -> Option<Packet>;

    /// Species label for a decoded packet. Defaults to the packet's
    /// top-layer name.
    fn classify(&self, packet: &Packet) -> String {
        packet.name().to_owned()
    }

    /// Attach transition graphs and reply expectations to the populations.
    /// Every graph must be finalized here, even when its phases are empty.
    fn wire_transitions(&self, populations: &mut BTreeMap<String, Population>) -> Result<()>;
}

/// All registered protocol modules.
pub fn registry() -> Vec<Box<dyn ProtocolFuzzer>> {
    vec![
        Box::new(iec104::Iec104),
        Box::new(modbus::Modbus),
        Box::new(raw::Raw),
    ]
}

pub fn lookup(name: &str) -> Result<Box<dyn ProtocolFuzzer>> {
    registry()
        .into_iter()
        .find(|fuzzer| fuzzer.name() == name)
        .ok_or_else(|| Error::UnknownFuzzer(name.to_owned()))
}

/// Build the per-species populations from a seed capture.
///
/// Capture order is shuffled away so it cannot bias the initial priorities,
/// and any species left with a single member is grown by cloning and
/// mutating it — crossover needs two distinct parents.
pub fn build_populations(
    fuzzer: &dyn ProtocolFuzzer,
    pcap: &Path,
    p_mutation: f64,
    rng: &mut FuzzRng,
) -> Result<BTreeMap<String, Population>> {
    let records = capture::read_payloads(pcap)?;
    debug!(records = records.len(), "capture payloads extracted");

    let mut populations: BTreeMap<String, Population> = BTreeMap::new();
    for record in &records {
        let Some(packet) = fuzzer.decode(record) else {
            continue;
        };
        let species = fuzzer.classify(&packet);
        let mut individual = Individual::new(packet, rng);
        individual.set_species(species.clone());
        populations
            .entry(species)
            .or_insert_with(|| Population::new(single_point_crossover, p_mutation))
            .add(individual, true);
    }
    if populations.is_empty() {
        return Err(Error::Capture(format!(
            "no seeds for fuzzer `{}` in {}",
            fuzzer.name(),
            pcap.display()
        )));
    }

    for population in populations.values_mut() {
        population.shuffle(rng);
    }
    grow_singletons(&mut populations, rng);
    fuzzer.wire_transitions(&mut populations)?;

    for (species, population) in &populations {
        info!(species, size = population.len(), "population seeded");
    }
    Ok(populations)
}

fn grow_singletons(populations: &mut BTreeMap<String, Population>, rng: &mut FuzzRng) {
    for (species, population) in populations.iter_mut() {
        if population.len() >= 2 {
            continue;
        }
        let sole = population.member(0).clone();
        let chromosomes = sole.chromosome_count().max(2);
        let mutations = rng.sched_range(1, chromosomes);
        rng_trace("generate", 1, mutations);

        let mut grown = false;
        for _ in 0..GROW_ATTEMPTS {
            let mut clone = Individual::new(sole.packet().clone(), rng);
            clone.set_species(sole.species());
            for _ in 0..mutations {
                clone.random_mutate(rng);
            }
            if population.add(clone, true) {
                grown = true;
                break;
            }
        }
        if !grown {
            warn!(species, "could not grow singleton species to two members");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use etherparse::PacketBuilder;

    use super::{build_populations, lookup, registry};
    use crate::rng::FuzzRng;

    fn legacy_pcap(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65_535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        for frame in frames {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            out.extend_from_slice(frame);
        }
        out
    }

    fn tcp_frame(payload: &[u8]) -> Vec<u8> {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 0, 1], [192, 168, 0, 2], 64)
            .tcp(49152, 2404, 0, 8192);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    fn write_pcap(frames: &[Vec<u8>]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&legacy_pcap(frames)).unwrap();
        file
    }

    #[test]
    fn registry_lookup() {
        let names: Vec<_> = registry().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["iec104", "modbus", "raw"]);
        assert!(lookup("iec104").is_ok());
        assert!(lookup("modbus").is_ok());
        assert!(lookup("dnp3").is_err());
    }

    #[test]
    fn populations_are_grown_to_two_members() {
        // One lone U frame: the species must still end up with two members.
        let pcap = write_pcap(&[tcp_frame(&[0x68, 0x04, 0x43, 0x00, 0x00, 0x00])]);
        let fuzzer = lookup("iec104").unwrap();
        let mut rng = FuzzRng::from_seed(0);
        let populations = build_populations(fuzzer.as_ref(), pcap.path(), 0.8, &mut rng).unwrap();

        let population = &populations["IEC-104 U APDU"];
        assert_eq!(population.len(), 2);
        assert!(population.graph().finalized());
        // Both members count as seed corpus for re-seeding.
        assert_eq!(population.seed_individuals().len(), 2);
    }

    #[test]
    fn undecodable_captures_are_an_error() {
        let pcap = write_pcap(&[tcp_frame(b"not iec104 at all")]);
        let fuzzer = lookup("iec104").unwrap();
        let mut rng = FuzzRng::from_seed(0);
        assert!(build_populations(fuzzer.as_ref(), pcap.path(), 0.8, &mut rng).is_err());
    }

    #[test]
    fn raw_fuzzer_accepts_anything() {
        let pcap = write_pcap(&[tcp_frame(b"alpha"), tcp_frame(b"beta")]);
        let fuzzer = lookup("raw").unwrap();
        let mut rng = FuzzRng::from_seed(1);
        let populations = build_populations(fuzzer.as_ref(), pcap.path(), 0.8, &mut rng).unwrap();
        assert_eq!(populations.len(), 1);
        assert_eq!(populations["raw"].len(), 2);
    }

    #[test]
    fn classifier_splits_one_schema_into_species() {
        let read = &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x00, 0x00, 0x0a];
        let mut write = read.to_vec();
        write[7] = 0x06;
        let pcap = write_pcap(&[tcp_frame(read), tcp_frame(&write)]);

        let fuzzer = lookup("modbus").unwrap();
        let mut rng = FuzzRng::from_seed(3);
        let populations = build_populations(fuzzer.as_ref(), pcap.path(), 0.8, &mut rng).unwrap();
        assert_eq!(populations.len(), 2);
        assert!(populations.contains_key("Modbus Read Holding Registers"));
        assert!(populations.contains_key("Modbus Write Single Register"));
        for population in populations.values() {
            assert!(population.len() >= 2);
            assert!(population.recv_after_send);
        }
    }

    #[test]
    fn seeding_is_deterministic() {
        let pcap = write_pcap(&[
            tcp_frame(&[0x68, 0x04, 0x43, 0x00, 0x00, 0x00]),
            tcp_frame(&[0x68, 0x04, 0x07, 0x00, 0x00, 0x00]),
            tcp_frame(&[0x68, 0x04, 0x01, 0x00, 0x02, 0x00]),
        ]);
        let fuzzer = lookup("iec104").unwrap();
        let ids = |seed: u64| {
            let mut rng = FuzzRng::from_seed(seed);
            let populations =
                build_populations(fuzzer.as_ref(), pcap.path(), 0.8, &mut rng).unwrap();
            populations
                .values()
                .flat_map(|p| p.iter().map(|i| i.identity()))
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(9), ids(9));
    }
}
