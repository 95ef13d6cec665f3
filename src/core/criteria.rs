use crate::config::ConfigError;
use crate::core::hash::{HashConfig, max_distance};
use crate::core::image::{ImageRecord, MetadataField};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// A pair matches when any enabled criterion matches.
    #[default]
    Any,
    /// A pair matches only when every enabled criterion matches.
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct NameNormalization {
    pub case_insensitive: bool,
    pub ignore_extension: bool,
}

impl NameNormalization {
    pub fn apply(&self, name: &str) -> String {
        let base = if self.ignore_extension {
            Path::new(name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string())
        } else {
            name.to_string()
        };

        if self.case_insensitive {
            base.to_lowercase()
        } else {
            base
        }
    }
}

/// The individual signals a match can be made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Size,
    Name,
    Metadata,
    HashSimilarity,
}

/// Which signals take part in a match and how they combine.
///
/// A plain value; [`MatchCriteria::validate`] checks it and produces the
/// matcher the comparator actually runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCriteria {
    pub size: bool,
    pub name: bool,
    pub name_normalization: NameNormalization,
    pub metadata: bool,
    pub metadata_fields: Vec<MetadataField>,
    pub hash_similarity: bool,
    pub hash_config: Option<HashConfig>,
    /// Fraction of matching bits in `0.0..=1.0`.
    pub similarity_threshold: f64,
    pub combine: CombineMode,
}

impl Default for MatchCriteria {
    fn default() -> Self {
        Self {
            size: false,
            name: false,
            name_normalization: NameNormalization::default(),
            metadata: false,
            metadata_fields: Vec::new(),
            hash_similarity: true,
            hash_config: Some(HashConfig::default()),
            similarity_threshold: 0.9,
            combine: CombineMode::Any,
        }
    }
}

impl MatchCriteria {
    /// Criteria with nothing enabled. Chain the `with_*` methods onto it.
    pub fn none() -> Self {
        Self {
            hash_similarity: false,
            hash_config: None,
            ..Self::default()
        }
    }

    pub fn with_size(mut self) -> Self {
        self.size = true;
        self
    }

    pub fn with_name(mut self, normalization: NameNormalization) -> Self {
        self.name = true;
        self.name_normalization = normalization;
        self
    }

    pub fn with_metadata(mut self, fields: impl IntoIterator<Item = MetadataField>) -> Self {
        self.metadata = true;
        self.metadata_fields = fields.into_iter().collect();
        self
    }

    pub fn with_hash(mut self, config: HashConfig, similarity_threshold: f64) -> Self {
        self.hash_similarity = true;
        self.hash_config = Some(config);
        self.similarity_threshold = similarity_threshold;
        self
    }

    pub fn require_all(mut self) -> Self {
        self.combine = CombineMode::All;
        self
    }

    pub fn validate(&self) -> Result<CompiledCriteria, ConfigError> {
        let mut checks = Vec::new();
        if self.size {
            checks.push(Criterion::Size);
        }
        if self.name {
            checks.push(Criterion::Name);
        }

        let mut metadata_fields = Vec::new();
        if self.metadata {
            for field in &self.metadata_fields {
                if !metadata_fields.contains(field) {
                    metadata_fields.push(*field);
                }
            }
            if metadata_fields.is_empty() {
                return Err(ConfigError::NoMetadataFields);
            }
            checks.push(Criterion::Metadata);
        }

        let mut hash = None;
        if self.hash_similarity {
            let config = self.hash_config.ok_or(ConfigError::MissingHashConfig)?;
            let threshold = self.similarity_threshold;
            if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidThreshold(threshold));
            }
            hash = Some(HashRule { config, threshold });
            checks.push(Criterion::HashSimilarity);
        }

        if checks.is_empty() {
            return Err(ConfigError::NoCriteria);
        }

        Ok(CompiledCriteria {
            checks,
            name: self.name.then_some(self.name_normalization),
            metadata_fields,
            hash,
            scoring: self.hash_config,
            combine: self.combine,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct HashRule {
    pub(crate) config: HashConfig,
    pub(crate) threshold: f64,
}

impl HashRule {
    pub(crate) fn max_distance(&self, bits: u32) -> u32 {
        max_distance(bits, self.threshold)
    }
}

/// Outcome of checking one working image against one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub matched: Vec<Criterion>,
    pub similarity: Option<f64>,
    pub is_match: bool,
}

/// Validated criteria holding only the enabled checks.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCriteria {
    checks: Vec<Criterion>,
    name: Option<NameNormalization>,
    metadata_fields: Vec<MetadataField>,
    hash: Option<HashRule>,
    scoring: Option<HashConfig>,
    combine: CombineMode,
}

impl CompiledCriteria {
    pub fn criteria(&self) -> &[Criterion] {
        &self.checks
    }

    pub fn combine(&self) -> CombineMode {
        self.combine
    }

    /// Hash config used to score similarity, even when hash matching is off.
    pub fn scoring_config(&self) -> Option<HashConfig> {
        self.scoring
    }

    pub(crate) fn hash_rule(&self) -> Option<HashRule> {
        self.hash
    }

    pub(crate) fn uses(&self, criterion: Criterion) -> bool {
        self.checks.contains(&criterion)
    }

    pub(crate) fn name_key(&self, record: &ImageRecord) -> Option<String> {
        self.name
            .map(|normalization| normalization.apply(&record.name))
            .filter(|key| !key.is_empty())
    }

    /// Values of every declared metadata field, or `None` if any is missing.
    pub(crate) fn metadata_key(&self, record: &ImageRecord) -> Option<Vec<String>> {
        if self.metadata_fields.is_empty() {
            return None;
        }
        self.metadata_fields
            .iter()
            .map(|field| field.value(record))
            .collect()
    }

    pub fn evaluate(&self, working: &ImageRecord, candidate: &ImageRecord) -> Evaluation {
        let similarity = self.scoring.and_then(|config| {
            let (a, b) = (working.hash(&config)?, candidate.hash(&config)?);
            a.similarity(b)
        });

        let matched: Vec<Criterion> = self
            .checks
            .iter()
            .copied()
            .filter(|criterion| self.check(*criterion, working, candidate))
            .collect();

        let is_match = match self.combine {
            CombineMode::Any => !matched.is_empty(),
            CombineMode::All => matched.len() == self.checks.len(),
        };

        Evaluation {
            matched,
            similarity,
            is_match,
        }
    }

    fn check(&self, criterion: Criterion, working: &ImageRecord, candidate: &ImageRecord) -> bool {
        match criterion {
            Criterion::Size => working.size == candidate.size,
            Criterion::Name => match (self.name_key(working), self.name_key(candidate)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            Criterion::Metadata => {
                match (self.metadata_key(working), self.metadata_key(candidate)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            Criterion::HashSimilarity => self.hash.is_some_and(|rule| {
                match (working.hash(&rule.config), candidate.hash(&rule.config)) {
                    (Some(a), Some(b)) => a
                        .hamming_distance(b)
                        .is_some_and(|distance| distance <= rule.max_distance(a.bit_length())),
                    _ => false,
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::{HashAlgorithm, PerceptualHash};
    use chrono::Utc;

    fn record(path: &str, size: u64) -> ImageRecord {
        ImageRecord::new(path, size, Utc::now())
    }

    fn hash_config() -> HashConfig {
        HashConfig::new(HashAlgorithm::Average, 4).unwrap()
    }

    fn with_hash(mut record: ImageRecord, byte: u8) -> ImageRecord {
        let hash = PerceptualHash::from_bytes(vec![byte; 2], hash_config().bit_length()).unwrap();
        record.set_hash(hash_config(), hash);
        record
    }

    #[test]
    fn test_validate_rejects_empty_criteria() {
        assert_eq!(MatchCriteria::none().validate(), Err(ConfigError::NoCriteria));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let criteria = MatchCriteria::none().with_hash(hash_config(), 1.5);
        assert_eq!(criteria.validate(), Err(ConfigError::InvalidThreshold(1.5)));

        let criteria = MatchCriteria::none().with_hash(hash_config(), f64::NAN);
        assert!(matches!(criteria.validate(), Err(ConfigError::InvalidThreshold(_))));
    }

    #[test]
    fn test_validate_rejects_missing_hash_config() {
        let criteria = MatchCriteria {
            hash_similarity: true,
            hash_config: None,
            ..MatchCriteria::none()
        };
        assert_eq!(criteria.validate(), Err(ConfigError::MissingHashConfig));
    }

    #[test]
    fn test_validate_rejects_empty_metadata_fields() {
        let criteria = MatchCriteria::none().with_metadata(Vec::new());
        assert_eq!(criteria.validate(), Err(ConfigError::NoMetadataFields));
    }

    #[test]
    fn test_name_normalization() {
        let both = NameNormalization {
            case_insensitive: true,
            ignore_extension: true,
        };
        assert_eq!(both.apply("IMG_0001.JPG"), "img_0001");
        assert_eq!(both.apply("archive.tar.gz"), "archive.tar");
        assert_eq!(NameNormalization::default().apply("IMG.JPG"), "IMG.JPG");
    }

    #[test]
    fn test_name_match_respects_normalization() {
        let a = record("/ref/Beach.JPG", 10);
        let b = record("/work/beach.png", 20);

        let strict = MatchCriteria::none()
            .with_name(NameNormalization::default())
            .validate()
            .unwrap();
        assert!(!strict.evaluate(&b, &a).is_match);

        let loose = MatchCriteria::none()
            .with_name(NameNormalization {
                case_insensitive: true,
                ignore_extension: true,
            })
            .validate()
            .unwrap();
        let evaluation = loose.evaluate(&b, &a);
        assert!(evaluation.is_match);
        assert_eq!(evaluation.matched, vec![Criterion::Name]);
    }

    #[test]
    fn test_metadata_missing_field_never_matches() {
        let mut a = record("/ref/a.jpg", 10);
        let mut b = record("/work/b.jpg", 10);
        a.metadata.make = Some("Canon".to_string());
        b.metadata.make = Some("canon ".to_string());

        let make_only = MatchCriteria::none()
            .with_metadata([MetadataField::Make])
            .validate()
            .unwrap();
        assert!(make_only.evaluate(&b, &a).is_match);

        let with_model = MatchCriteria::none()
            .with_metadata([MetadataField::Make, MetadataField::Model])
            .validate()
            .unwrap();
        assert!(!with_model.evaluate(&b, &a).is_match);
    }

    #[test]
    fn test_hash_threshold_boundary() {
        let a = with_hash(record("/ref/a.jpg", 1000), 0xFF);
        let b = with_hash(record("/work/b.jpg", 1000), 0xF7);

        let strict = MatchCriteria::none().with_hash(hash_config(), 0.9).validate().unwrap();
        let evaluation = strict.evaluate(&b, &a);
        assert!(!evaluation.is_match);
        assert_eq!(evaluation.similarity, Some(0.875));

        let loose = MatchCriteria::none().with_hash(hash_config(), 0.8).validate().unwrap();
        assert!(loose.evaluate(&b, &a).is_match);

        let exact = MatchCriteria::none().with_hash(hash_config(), 0.875).validate().unwrap();
        assert!(exact.evaluate(&b, &a).is_match);
    }

    #[test]
    fn test_missing_hash_is_no_match() {
        let a = with_hash(record("/ref/a.jpg", 1000), 0xFF);
        let b = record("/work/b.jpg", 1000);

        let criteria = MatchCriteria::none().with_hash(hash_config(), 0.5).validate().unwrap();
        let evaluation = criteria.evaluate(&b, &a);
        assert!(!evaluation.is_match);
        assert_eq!(evaluation.similarity, None);
    }

    #[test]
    fn test_combine_all_requires_every_check() {
        let a = with_hash(record("/ref/a.jpg", 1000), 0xFF);
        let b = with_hash(record("/work/b.jpg", 1000), 0x00);

        let any = MatchCriteria::none()
            .with_size()
            .with_hash(hash_config(), 0.9)
            .validate()
            .unwrap();
        assert!(any.evaluate(&b, &a).is_match);

        let all = MatchCriteria::none()
            .with_size()
            .with_hash(hash_config(), 0.9)
            .require_all()
            .validate()
            .unwrap();
        let evaluation = all.evaluate(&b, &a);
        assert!(!evaluation.is_match);
        assert_eq!(evaluation.matched, vec![Criterion::Size]);
    }

    #[test]
    fn test_similarity_scored_without_hash_criterion() {
        let a = with_hash(record("/ref/a.jpg", 1000), 0xFF);
        let b = with_hash(record("/work/b.jpg", 1000), 0xF7);

        let criteria = MatchCriteria {
            hash_config: Some(hash_config()),
            ..MatchCriteria::none().with_size()
        }
        .validate()
        .unwrap();
        let evaluation = criteria.evaluate(&b, &a);
        assert!(evaluation.is_match);
        assert_eq!(evaluation.similarity, Some(0.875));
    }
}
