//! Candidate pre-filtering for the comparator.
//!
//! The index only narrows which references get a full evaluation. It never
//! drops a reference that the full evaluation would accept, so indexed and
//! naive comparisons produce the same result.

use crate::core::criteria::{CombineMode, CompiledCriteria, Criterion, HashRule};
use crate::core::hash::PerceptualHash;
use crate::core::image::ImageRecord;
use std::collections::HashMap;

pub(crate) struct CandidateIndex<'a> {
    criteria: &'a CompiledCriteria,
    sizes: HashMap<u64, Vec<usize>>,
    names: HashMap<String, Vec<usize>>,
    metadata: HashMap<Vec<String>, Vec<usize>>,
    hashes: Option<(HashRule, HashMap<u32, SegmentTable>)>,
}

/// Multi-index over hashes of one width.
///
/// Two hashes within distance `d` agree exactly on at least one of `d + 1`
/// disjoint segments, so looking up each segment finds every match.
struct SegmentTable {
    ranges: Vec<(u32, u32)>,
    buckets: Vec<HashMap<Vec<u8>, Vec<usize>>>,
    /// Every reference of this width; used when the distance budget covers
    /// the whole hash and no segment split is possible.
    all: Vec<usize>,
}

impl SegmentTable {
    fn new(bits: u32, max_distance: u32) -> Self {
        let ranges = if max_distance < bits {
            let segments = max_distance + 1;
            (0..segments)
                .map(|i| (i * bits / segments, (i + 1) * bits / segments))
                .collect()
        } else {
            Vec::new()
        };
        let buckets = ranges.iter().map(|_| HashMap::new()).collect();

        Self {
            ranges,
            buckets,
            all: Vec::new(),
        }
    }

    fn insert(&mut self, hash: &PerceptualHash, index: usize) {
        self.all.push(index);
        for (range, bucket) in self.ranges.iter().zip(self.buckets.iter_mut()) {
            bucket
                .entry(segment_key(hash, *range))
                .or_default()
                .push(index);
        }
    }

    fn lookup(&self, hash: &PerceptualHash) -> Vec<usize> {
        if self.ranges.is_empty() {
            return self.all.clone();
        }
        let mut found: Vec<usize> = self
            .ranges
            .iter()
            .zip(&self.buckets)
            .filter_map(|(range, bucket)| bucket.get(&segment_key(hash, *range)))
            .flatten()
            .copied()
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }
}

fn segment_key(hash: &PerceptualHash, (start, end): (u32, u32)) -> Vec<u8> {
    PerceptualHash::from_bits((start..end).map(|bit| hash.bit(bit)))
        .as_bytes()
        .to_vec()
}

impl<'a> CandidateIndex<'a> {
    pub(crate) fn build(criteria: &'a CompiledCriteria, references: &[ImageRecord]) -> Self {
        let mut sizes: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut names: HashMap<String, Vec<usize>> = HashMap::new();
        let mut metadata: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
        let mut hashes = criteria
            .hash_rule()
            .filter(|_| criteria.uses(Criterion::HashSimilarity))
            .map(|rule| (rule, HashMap::<u32, SegmentTable>::new()));

        for (index, reference) in references.iter().enumerate() {
            if criteria.uses(Criterion::Size) {
                sizes.entry(reference.size).or_default().push(index);
            }
            if let Some(key) = criteria.name_key(reference) {
                names.entry(key).or_default().push(index);
            }
            if let Some(key) = criteria.metadata_key(reference) {
                metadata.entry(key).or_default().push(index);
            }
            if let Some((rule, tables)) = hashes.as_mut() {
                if let Some(hash) = reference.hash(&rule.config) {
                    let bits = hash.bit_length();
                    tables
                        .entry(bits)
                        .or_insert_with(|| SegmentTable::new(bits, rule.max_distance(bits)))
                        .insert(hash, index);
                }
            }
        }

        log::debug!(
            "Indexed {} references: {} size buckets, {} name buckets, {} metadata buckets",
            references.len(),
            sizes.len(),
            names.len(),
            metadata.len()
        );

        Self {
            criteria,
            sizes,
            names,
            metadata,
            hashes,
        }
    }

    /// Reference indices worth a full evaluation against `working`, ascending.
    pub(crate) fn candidates(&self, working: &ImageRecord) -> Vec<usize> {
        let per_criterion: Vec<Vec<usize>> = self
            .criteria
            .criteria()
            .iter()
            .map(|criterion| self.bucket(*criterion, working))
            .collect();

        match self.criteria.combine() {
            CombineMode::Any => {
                let mut union: Vec<usize> = per_criterion.into_iter().flatten().collect();
                union.sort_unstable();
                union.dedup();
                union
            }
            CombineMode::All => per_criterion
                .into_iter()
                .min_by_key(Vec::len)
                .unwrap_or_default(),
        }
    }

    fn bucket(&self, criterion: Criterion, working: &ImageRecord) -> Vec<usize> {
        let found = match criterion {
            Criterion::Size => self.sizes.get(&working.size).cloned(),
            Criterion::Name => self
                .criteria
                .name_key(working)
                .and_then(|key| self.names.get(&key).cloned()),
            Criterion::Metadata => self
                .criteria
                .metadata_key(working)
                .and_then(|key| self.metadata.get(&key).cloned()),
            Criterion::HashSimilarity => self.hashes.as_ref().and_then(|(rule, tables)| {
                let hash = working.hash(&rule.config)?;
                Some(tables.get(&hash.bit_length())?.lookup(hash))
            }),
        };
        found.unwrap_or_default()
    }
}
