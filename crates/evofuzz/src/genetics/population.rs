use std::collections::HashMap;

use uuid::Uuid;

use super::{CrossoverFn, Individual};
use crate::rng::{FuzzRng, rng_trace};
use crate::transition::TransitionGraph;

/// A priority-ordered set of individuals of one species.
///
/// Position 0 is the highest priority. All members are pairwise compatible
/// and no two members are identical; both invariants are enforced on every
/// insertion path. Each member's `index` matches its position whenever the
/// population is sampled.
#[derive(Debug)]
pub struct Population {
    members: Vec<Individual>,
    by_id: HashMap<Uuid, usize>,
    /// Pristine copies of every capture-derived individual, for re-seeding.
    seeds: Vec<Individual>,
    p_mutation: f64,
    crossover: CrossoverFn,
    pub crossovers: u64,
    pub spot_mutations: u64,
    /// Whether a reply is expected after the fuzzed message.
    pub recv_after_send: bool,
    graph: TransitionGraph,
}

impl Population {
    pub fn new(crossover: CrossoverFn, p_mutation: f64) -> Self {
        Self {
            members: Vec::new(),
            by_id: HashMap::new(),
            seeds: Vec::new(),
            p_mutation,
            crossover,
            crossovers: 0,
            spot_mutations: 0,
            recv_after_send: false,
            graph: TransitionGraph::new(),
        }
    }

    pub fn species(&self) -> &str {
        self.members.first().map_or("", |m| m.species())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Individual> {
        self.members.iter()
    }

    pub fn member(&self, index: usize) -> &Individual {
        &self.members[index]
    }

    pub fn seed_individuals(&self) -> &[Individual] {
        &self.seeds
    }

    pub fn graph(&self) -> &TransitionGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut TransitionGraph {
        &mut self.graph
    }

    pub fn contains(&self, identity: &Uuid) -> bool {
        self.by_id.contains_key(identity)
    }

    /// Insert an individual. Rejected if incompatible with the existing
    /// members or identical to one of them. Seed-corpus members are also
    /// recorded in the re-seeding list.
    pub fn add(&mut self, mut individual: Individual, seed_corpus: bool) -> bool {
        let compatible = self
            .members
            .first()
            .is_none_or(|m| m.compatible(&individual));
        if !compatible || self.members.iter().any(|m| m.identical(&individual)) {
            return false;
        }
        if seed_corpus {
            individual.seed_corpus = true;
            self.seeds.push(individual.clone());
        }
        self.members.push(individual);
        self.reindex();
        true
    }

    /// Produce a child from two distinct parents: one drawn by
    /// truncated-exponential sampling (favouring high priority), the other
    /// uniformly — which is which is a coin flip. The child is crossed over
    /// and, with probability `p_mutation`, spot-mutated.
    pub fn new_child(&mut self, rng: &mut FuzzRng) -> Individual {
        let n = self.members.len();
        debug_assert!(n >= 1, "new_child on an empty population");

        let coin = rng.gene_unit();
        rng_trace("new_child", 1, coin);
        let exp_first = coin <= 0.5;

        let a_idx = self.draw(rng, exp_first);
        let mut b_idx = a_idx;
        // A population capped down to one member can only self-cross.
        while n > 1 && b_idx == a_idx {
            b_idx = self.draw(rng, !exp_first);
        }
        self.members[a_idx].index = a_idx;
        self.members[b_idx].index = b_idx;

        let genes = (self.crossover)(&self.members[a_idx], &self.members[b_idx], rng);
        self.crossovers += 1;
        let mut child = self.members[a_idx].give_birth(&self.members[b_idx], genes, rng);

        let mutation_coin = rng.gene_unit();
        rng_trace("new_child", 2, mutation_coin);
        if mutation_coin <= self.p_mutation {
            self.spot_mutations += 1;
            child.random_mutate(rng);
        }
        child
    }

    fn draw(&self, rng: &mut FuzzRng, exponential: bool) -> usize {
        let n = self.members.len();
        if exponential {
            rng.truncated_exp_index(n)
        } else {
            let idx = rng.gene_index(n);
            rng_trace("truncated_uniform_choice", 1, idx);
            idx
        }
    }

    /// Fold a child and its test outcome back into the ordering.
    ///
    /// A coverage-increasing child promotes its parents one position and
    /// enters at the front. Otherwise the parents are demoted and the child
    /// is only inserted when the annealing decision (`add`) says so, at a
    /// depth proportional to how cold the energy is.
    pub fn update(&mut self, child: Individual, heat: f64, add: bool) {
        if self.members.iter().any(|m| m.identical(&child)) {
            return;
        }
        let increase = child.latest_case.is_some_and(|c| c.coverage_increase);
        // Parents are resolved through the identity index; evicted ones are
        // simply absent.
        let mut parent_pos: Vec<usize> = child
            .parents()
            .iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id).copied())
            .collect();

        if increase {
            for k in 0..parent_pos.len() {
                let idx = parent_pos[k];
                let new_idx = idx.saturating_sub(1);
                let parent = self.members.remove(idx);
                self.members.insert(new_idx, parent);
                for pos in parent_pos.iter_mut().skip(k + 1) {
                    if (new_idx..idx).contains(pos) {
                        *pos += 1;
                    }
                }
            }
            self.members.insert(0, child);
        } else {
            for k in 0..parent_pos.len() {
                let idx = parent_pos[k];
                let parent = self.members.remove(idx);
                let new_idx = (idx + 1).min(self.members.len());
                self.members.insert(new_idx, parent);
                for pos in parent_pos.iter_mut().skip(k + 1) {
                    if *pos > idx && *pos <= new_idx {
                        *pos -= 1;
                    }
                }
            }
            if add {
                let slot = ((1.0 - heat) * self.members.len() as f64) as usize;
                let slot = slot.min(self.members.len());
                self.members.insert(slot, child);
            }
        }
        self.reindex();
    }

    /// Evict tail members until the population fits the cap. A cap of zero
    /// means unbounded.
    pub fn shrink(&mut self, cap: usize) {
        if cap == 0 {
            return;
        }
        while self.members.len() > cap {
            if let Some(dying) = self.members.pop() {
                self.by_id.remove(&dying.identity());
            }
        }
    }

    /// Re-insert every seed individual at the front (dropping any prior
    /// copy), shrink to the cap, and re-stamp all indices.
    pub fn reseed(&mut self, cap: usize) {
        for seed in self.seeds.clone() {
            if let Some(pos) = self
                .members
                .iter()
                .position(|m| m.identity() == seed.identity())
            {
                self.members.remove(pos);
            }
            self.members.insert(0, seed);
        }
        self.reindex();
        self.shrink(cap);
        self.reindex();
    }

    /// Randomize the order; used once at start so that capture order does
    /// not bias the initial priorities.
    pub fn shuffle(&mut self, rng: &mut FuzzRng) {
        rng_trace("shuffle", 1, "-");
        rng.shuffle(&mut self.members);
        self.reindex();
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        for (i, member) in self.members.iter_mut().enumerate() {
            member.index = i;
            self.by_id.insert(member.identity(), i);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Population;
    use crate::genetics::individual::{CaseOutcome, Individual, single_point_crossover};
    use crate::packet::{FieldKind, FieldSpec, FieldValue, Packet, PacketSchema};
    use crate::rng::FuzzRng;

    fn schema() -> Arc<PacketSchema> {
        PacketSchema::new("frame", vec![
            FieldSpec::new("seq", FieldKind::U16Le, FieldValue::Int(0)),
            FieldSpec::new("body", FieldKind::Bytes, FieldValue::Bytes(vec![0])),
        ])
    }

    fn individual(seq: u64, rng: &mut FuzzRng) -> Individual {
        let mut packet = Packet::from_schema(schema());
        packet.set("seq", FieldValue::Int(seq));
        Individual::new(packet, rng)
    }

    fn population_of(count: u64, rng: &mut FuzzRng) -> Population {
        let mut pop = Population::new(single_point_crossover, 0.8);
        for seq in 0..count {
            assert!(pop.add(individual(seq, rng), true));
        }
        pop
    }

    fn assert_invariants(pop: &Population) {
        for (i, a) in pop.iter().enumerate() {
            assert_eq!(a.index, i, "index stamp out of sync at {i}");
            for (j, b) in pop.iter().enumerate() {
                if i != j {
                    assert!(a.compatible(b));
                    assert!(!a.identical(b));
                }
            }
        }
    }

    #[test]
    fn add_rejects_duplicates_and_aliens() {
        let mut rng = FuzzRng::from_seed(0);
        let mut pop = population_of(3, &mut rng);
        assert!(!pop.add(individual(1, &mut rng), false));
        let mut alien = individual(9, &mut rng);
        alien.set_species("something else");
        assert!(!pop.add(alien, false));
        assert_eq!(pop.len(), 3);
        assert_invariants(&pop);
    }

    #[test]
    fn new_child_on_two_members_uses_both() {
        let mut rng = FuzzRng::from_seed(1);
        let mut pop = population_of(2, &mut rng);
        let a_id = pop.member(0).identity();
        let b_id = pop.member(1).identity();
        let child = pop.new_child(&mut rng);
        let mut parent_ids: Vec<_> = child.parents().iter().flatten().copied().collect();
        parent_ids.sort();
        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(parent_ids, expected);
        assert_eq!(pop.crossovers, 1);
    }

    #[test]
    fn coverage_increase_promotes_parents_and_fronts_child() {
        let mut rng = FuzzRng::from_seed(2);
        let mut pop = population_of(5, &mut rng);
        let mut child = pop.member(3).give_birth(
            pop.member(4),
            pop.member(3).genes(),
            &mut rng,
        );
        // Make the child distinct from all members.
        child.random_mutate(&mut rng);
        while pop.iter().any(|m| m.identical(&child)) {
            child.random_mutate(&mut rng);
        }
        let p3 = pop.member(3).identity();
        let p4 = pop.member(4).identity();
        child.latest_case = Some(CaseOutcome {
            case_id: 1,
            coverage_increase: true,
        });
        pop.update(child.clone(), 1.0, true);

        assert_eq!(pop.member(0).identity(), child.identity());
        // Former positions 3 and 4 moved one up (now shifted by the fronted
        // child: 2+1 and 3+1).
        assert_eq!(pop.member(3).identity(), p3);
        assert_eq!(pop.member(4).identity(), p4);
        assert_invariants(&pop);
    }

    #[test]
    fn stagnant_child_demotes_parents() {
        let mut rng = FuzzRng::from_seed(3);
        let mut pop = population_of(5, &mut rng);
        let p1 = pop.member(1).identity();
        let p3 = pop.member(3).identity();
        let mut child = pop.member(1).give_birth(
            pop.member(3),
            pop.member(1).genes(),
            &mut rng,
        );
        while pop.iter().any(|m| m.identical(&child)) {
            child.random_mutate(&mut rng);
        }
        child.latest_case = Some(CaseOutcome {
            case_id: 1,
            coverage_increase: false,
        });
        pop.update(child, 1.0, false);
        // Both parents dropped one position each.
        assert_eq!(pop.member(2).identity(), p1);
        assert_eq!(pop.member(4).identity(), p3);
        assert_eq!(pop.len(), 5);
        assert_invariants(&pop);
    }

    #[test]
    fn identical_children_are_discarded() {
        let mut rng = FuzzRng::from_seed(4);
        let mut pop = population_of(3, &mut rng);
        let clone = pop.member(1).give_birth(
            pop.member(2),
            pop.member(1).genes(),
            &mut rng,
        );
        pop.update(clone, 1.0, true);
        assert_eq!(pop.len(), 3);
        assert_invariants(&pop);
    }

    #[test]
    fn cold_energy_buries_accepted_children() {
        let mut rng = FuzzRng::from_seed(5);
        let mut pop = population_of(4, &mut rng);
        let mut child = pop.member(0).give_birth(
            pop.member(1),
            pop.member(0).genes(),
            &mut rng,
        );
        while pop.iter().any(|m| m.identical(&child)) {
            child.random_mutate(&mut rng);
        }
        child.latest_case = Some(CaseOutcome {
            case_id: 1,
            coverage_increase: false,
        });
        let id = child.identity();
        pop.update(child, 0.0, true);
        // heat 0.0 places the child at the very tail.
        assert_eq!(pop.member(pop.len() - 1).identity(), id);
        assert_invariants(&pop);
    }

    #[test]
    fn shrink_caps_population() {
        let mut rng = FuzzRng::from_seed(6);
        let mut pop = population_of(8, &mut rng);
        pop.shrink(3);
        assert_eq!(pop.len(), 3);
        pop.shrink(0);
        assert_eq!(pop.len(), 3);
        assert_invariants(&pop);
    }

    #[test]
    fn reseed_restores_every_seed() {
        let mut rng = FuzzRng::from_seed(7);
        let mut pop = population_of(3, &mut rng);
        let seed_ids: Vec<_> = pop.seed_individuals().iter().map(|s| s.identity()).collect();
        // Push the population around: children, demotions, evictions.
        for _ in 0..20 {
            let mut child = pop.new_child(&mut rng);
            child.latest_case = Some(CaseOutcome {
                case_id: 0,
                coverage_increase: false,
            });
            pop.update(child, 0.5, true);
            pop.shrink(4);
        }
        pop.reseed(10);
        for id in &seed_ids {
            assert!(pop.contains(id), "seed {id} missing after reseed");
        }
        assert_invariants(&pop);
    }

    #[test]
    fn shuffle_keeps_membership_and_indices() {
        let mut rng = FuzzRng::from_seed(8);
        let mut pop = population_of(6, &mut rng);
        let mut ids: Vec<_> = pop.iter().map(|m| m.identity()).collect();
        pop.shuffle(&mut rng);
        let mut after: Vec<_> = pop.iter().map(|m| m.identity()).collect();
        ids.sort();
        after.sort();
        assert_eq!(ids, after);
        assert_invariants(&pop);
    }

    #[test]
    fn child_sequence_is_reproducible() {
        let runs: Vec<Vec<Vec<u8>>> = (0..2)
            .map(|_| {
                let mut rng = FuzzRng::from_seed(42);
                let mut pop = population_of(4, &mut rng);
                (0..16).map(|_| pop.new_child(&mut rng).serialize()).collect()
            })
            .collect();
        assert_eq!(runs[0], runs[1]);
    }
}
