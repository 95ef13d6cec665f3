use crate::config::ConfigError;
use crate::core::criteria::{CompiledCriteria, Criterion, MatchCriteria};
use crate::core::image::ImageRecord;
use crate::core::index::CandidateIndex;
use crate::core::progress::{Phase, ProgressSender, ProgressTracker, send_complete};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Above this many reference/working pairs, `Auto` switches to the index.
const AUTO_INDEX_PAIRS: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareStrategy {
    #[default]
    Auto,
    Naive,
    Indexed,
}

impl CompareStrategy {
    fn use_index(&self, pairs: usize) -> bool {
        match self {
            CompareStrategy::Auto => pairs > AUTO_INDEX_PAIRS,
            CompareStrategy::Naive => false,
            CompareStrategy::Indexed => true,
        }
    }
}

/// Position of an image in its input slice, with its path for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub index: usize,
    pub path: PathBuf,
}

impl ImageRef {
    fn new(index: usize, record: &ImageRecord) -> Self {
        Self {
            index,
            path: record.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "set", content = "image", rename_all = "snake_case")]
pub enum ClusterAnchor {
    Reference(ImageRef),
    Working(ImageRef),
}

impl ClusterAnchor {
    pub fn image(&self) -> &ImageRef {
        match self {
            ClusterAnchor::Reference(image) | ClusterAnchor::Working(image) => image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub image: ImageRef,
    pub matched: Vec<Criterion>,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    pub anchor: ClusterAnchor,
    pub members: Vec<ClusterMember>,
}

/// Full partition of the working set for one comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub clusters: Vec<DuplicateCluster>,
    /// Working images that matched nothing, in working order.
    pub uniques: Vec<ImageRef>,
    /// Reference images no working image matched.
    pub unmatched_references: Vec<ImageRef>,
}

impl ComparisonResult {
    pub fn duplicate_count(&self) -> usize {
        self.clusters.iter().map(|cluster| cluster.members.len()).sum()
    }

    pub fn members(&self) -> impl Iterator<Item = &ClusterMember> {
        self.clusters.iter().flat_map(|cluster| cluster.members.iter())
    }
}

/// Best candidate found for one working image.
#[derive(Debug, Clone)]
struct Assignment {
    anchor: usize,
    matched: Vec<Criterion>,
    similarity: Option<f64>,
}

impl Assignment {
    /// Higher similarity wins; a known score beats an unknown one. Callers
    /// visit candidates in ascending index order, so ties keep the earliest.
    fn outranks(&self, other: &Assignment) -> bool {
        match (self.similarity, other.similarity) {
            (Some(a), Some(b)) => a > b,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// The better of two assignments, falling back to the earlier anchor.
    /// Order-independent, so it can drive a parallel reduction.
    fn preferred(a: Assignment, b: Assignment) -> Assignment {
        if b.outranks(&a) || (!a.outranks(&b) && b.anchor < a.anchor) {
            b
        } else {
            a
        }
    }
}

#[derive(Default)]
pub struct Comparator {
    strategy: CompareStrategy,
    progress_sender: Option<ProgressSender>,
}

impl Comparator {
    pub fn new(strategy: CompareStrategy) -> Self {
        Self {
            strategy,
            progress_sender: None,
        }
    }

    pub fn with_progress_sender(mut self, sender: ProgressSender) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn strategy(&self) -> CompareStrategy {
        self.strategy
    }

    /// Cluster each working image under its best-matching reference image.
    pub fn compare(
        &self,
        reference: &[ImageRecord],
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<ComparisonResult, ConfigError> {
        let compiled = criteria.validate()?;
        let index = self
            .strategy
            .use_index(reference.len() * working.len())
            .then(|| CandidateIndex::build(&compiled, reference));

        let tracker =
            ProgressTracker::new(self.progress_sender.clone(), Phase::Comparing, working.len());
        let assignments: Vec<Option<Assignment>> = working
            .par_iter()
            .map(|image| {
                let candidates: Box<dyn Iterator<Item = usize>> = match &index {
                    Some(index) => Box::new(index.candidates(image).into_iter()),
                    None => Box::new(0..reference.len()),
                };
                let best = best_match(&compiled, image, reference, candidates);
                tracker.advance(&image.path);
                best
            })
            .collect();

        let mut grouped: BTreeMap<usize, Vec<ClusterMember>> = BTreeMap::new();
        let mut uniques = Vec::new();
        for (position, assignment) in assignments.into_iter().enumerate() {
            let image = ImageRef::new(position, &working[position]);
            match assignment {
                Some(assignment) => {
                    grouped
                        .entry(assignment.anchor)
                        .or_default()
                        .push(ClusterMember {
                            image,
                            matched: assignment.matched,
                            similarity: assignment.similarity,
                        })
                }
                None => uniques.push(image),
            }
        }

        let unmatched_references = reference
            .iter()
            .enumerate()
            .filter(|(position, _)| !grouped.contains_key(position))
            .map(|(position, record)| ImageRef::new(position, record))
            .collect();

        let clusters = grouped
            .into_iter()
            .map(|(anchor, members)| DuplicateCluster {
                anchor: ClusterAnchor::Reference(ImageRef::new(anchor, &reference[anchor])),
                members,
            })
            .collect();

        let result = ComparisonResult {
            clusters,
            uniques,
            unmatched_references,
        };
        send_complete(self.progress_sender.as_ref(), working.len());
        log::info!(
            "Compared {} working against {} reference images: \
             {} clusters, {} duplicates, {} unique",
            working.len(),
            reference.len(),
            result.clusters.len(),
            result.duplicate_count(),
            result.uniques.len()
        );
        Ok(result)
    }

    /// Working images that match no reference image.
    pub fn find_uniques(
        &self,
        reference: &[ImageRecord],
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<Vec<ImageRef>, ConfigError> {
        Ok(self.compare(reference, working, criteria)?.uniques)
    }

    /// Cluster duplicates inside a single set.
    ///
    /// Images are visited in order. Each joins the best-matching earlier image
    /// that is not itself a member of a cluster, or becomes a potential anchor.
    pub fn compare_within(
        &self,
        working: &[ImageRecord],
        criteria: &MatchCriteria,
    ) -> Result<ComparisonResult, ConfigError> {
        let compiled = criteria.validate()?;
        let pairs = working.len().saturating_mul(working.len().saturating_sub(1)) / 2;
        let index = self
            .strategy
            .use_index(pairs)
            .then(|| CandidateIndex::build(&compiled, working));

        let tracker =
            ProgressTracker::new(self.progress_sender.clone(), Phase::Comparing, working.len());

        // Only images that are not yet members can take new members, so each
        // image is scored against the live anchors before it and nothing else.
        let mut is_member = vec![false; working.len()];
        let mut grouped: BTreeMap<usize, Vec<ClusterMember>> = BTreeMap::new();
        for (position, image) in working.iter().enumerate() {
            let earlier: Vec<usize> = match &index {
                Some(index) => index
                    .candidates(image)
                    .into_iter()
                    .take_while(|&candidate| candidate < position)
                    .filter(|&candidate| !is_member[candidate])
                    .collect(),
                None => (0..position).filter(|&candidate| !is_member[candidate]).collect(),
            };

            let best = earlier
                .par_iter()
                .filter_map(|&candidate| {
                    let evaluation = compiled.evaluate(image, &working[candidate]);
                    evaluation.is_match.then_some(Assignment {
                        anchor: candidate,
                        matched: evaluation.matched,
                        similarity: evaluation.similarity,
                    })
                })
                .reduce_with(Assignment::preferred);
            tracker.advance(&image.path);

            if let Some(best) = best {
                is_member[position] = true;
                grouped.entry(best.anchor).or_default().push(ClusterMember {
                    image: ImageRef::new(position, image),
                    matched: best.matched,
                    similarity: best.similarity,
                });
            }
        }

        let uniques = working
            .iter()
            .enumerate()
            .filter(|(position, _)| !is_member[*position] && !grouped.contains_key(position))
            .map(|(position, record)| ImageRef::new(position, record))
            .collect();

        let clusters = grouped
            .into_iter()
            .map(|(anchor, members)| DuplicateCluster {
                anchor: ClusterAnchor::Working(ImageRef::new(anchor, &working[anchor])),
                members,
            })
            .collect();

        send_complete(self.progress_sender.as_ref(), working.len());
        Ok(ComparisonResult {
            clusters,
            uniques,
            unmatched_references: Vec::new(),
        })
    }
}

fn best_match(
    criteria: &CompiledCriteria,
    image: &ImageRecord,
    reference: &[ImageRecord],
    candidates: impl Iterator<Item = usize>,
) -> Option<Assignment> {
    let mut best: Option<Assignment> = None;
    for candidate in candidates {
        let evaluation = criteria.evaluate(image, &reference[candidate]);
        if !evaluation.is_match {
            continue;
        }
        let assignment = Assignment {
            anchor: candidate,
            matched: evaluation.matched,
            similarity: evaluation.similarity,
        };
        if best.as_ref().is_none_or(|current| assignment.outranks(current)) {
            best = Some(assignment);
        }
    }
    best
}

/// [`Comparator::compare`] with the default strategy.
pub fn compare(
    reference: &[ImageRecord],
    working: &[ImageRecord],
    criteria: &MatchCriteria,
) -> Result<ComparisonResult, ConfigError> {
    Comparator::default().compare(reference, working, criteria)
}

/// [`Comparator::find_uniques`] with the default strategy.
pub fn find_uniques(
    reference: &[ImageRecord],
    working: &[ImageRecord],
    criteria: &MatchCriteria,
) -> Result<Vec<ImageRef>, ConfigError> {
    Comparator::default().find_uniques(reference, working, criteria)
}
