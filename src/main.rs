use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use unique_image_finder::database::default_cache_path;
use unique_image_finder::{
    AppConfig, ClusterAnchor, ComparisonResult, Criterion, FingerprintMode, HashAlgorithm,
    HashCache, HashConfig, HashingReport, ImageRef, ImageSet, MatchCriteria, MetadataField,
    NameNormalization, Phase, Progress, ScanWarning, Session, SqliteHashCache,
};

#[derive(Parser, Debug)]
#[command(
    name = "uif",
    version,
    about = "Find duplicate and unique images across two folders"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// JSON config file; flags override its values
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hash cache database (default: ~/.unique_image_finder/hash_cache.db)
    #[arg(long, global = true, value_name = "PATH")]
    cache: Option<PathBuf>,

    /// Keep hashes in memory for this run only
    #[arg(long, global = true)]
    no_cache: bool,

    /// Identify files by content checksum instead of path and mtime
    #[arg(long, global = true)]
    checksum: bool,

    /// Worker threads for scanning and hashing
    #[arg(long, global = true, value_name = "N")]
    workers: Option<usize>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Cluster working images under matching reference images
    Compare {
        /// Reference directory
        #[arg(short, long, value_name = "DIR")]
        reference: PathBuf,
        /// Working directory
        #[arg(short, long, value_name = "DIR")]
        working: PathBuf,
        #[command(flatten)]
        criteria: CriteriaArgs,
    },

    /// List working images that match nothing in the reference directory
    Uniques {
        /// Reference directory
        #[arg(short, long, value_name = "DIR")]
        reference: PathBuf,
        /// Working directory
        #[arg(short, long, value_name = "DIR")]
        working: PathBuf,
        #[command(flatten)]
        criteria: CriteriaArgs,
    },

    /// Find duplicates inside a single directory
    Dedupe {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[command(flatten)]
        criteria: CriteriaArgs,
    },

    /// Inspect or reset the hash cache
    Cache {
        #[command(subcommand)]
        command: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCmd {
    /// Show entry count and location
    Stats,
    /// Remove every cached hash
    Clear,
    /// Forget cached hashes for one file
    Invalidate {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Forget cached hashes for files that no longer exist
    Prune,
}

#[derive(Args, Debug, Default)]
struct CriteriaArgs {
    /// Match on identical file size
    #[arg(long)]
    size: bool,

    /// Match on file name
    #[arg(long)]
    name: bool,

    /// Compare names case-insensitively
    #[arg(long, requires = "name")]
    ignore_case: bool,

    /// Compare names without their extension
    #[arg(long, requires = "name")]
    ignore_extension: bool,

    /// Match when all of these metadata fields are equal
    #[arg(long, value_delimiter = ',', value_name = "FIELD")]
    metadata: Vec<MetadataField>,

    /// Perceptual hash algorithm (average, perceptual, difference, wavelet)
    #[arg(long, value_name = "ALG")]
    hash: Option<HashAlgorithm>,

    /// Hash grid size (4, 8, 16 or 32)
    #[arg(long, value_name = "N")]
    hash_size: Option<u32>,

    /// Minimum hash similarity in percent
    #[arg(long, value_name = "PCT", value_parser = parse_percent)]
    similarity: Option<f64>,

    /// Require every selected criterion to match
    #[arg(long)]
    require_all: bool,
}

impl CriteriaArgs {
    fn is_explicit(&self) -> bool {
        self.size
            || self.name
            || !self.metadata.is_empty()
            || self.hash.is_some()
            || self.hash_size.is_some()
            || self.similarity.is_some()
    }

    /// Flags replace the configured criteria; with no flags the config wins.
    fn resolve(&self, configured: &MatchCriteria) -> Result<MatchCriteria> {
        let mut criteria = if self.is_explicit() {
            MatchCriteria::none()
        } else {
            configured.clone()
        };

        if self.size {
            criteria = criteria.with_size();
        }
        if self.name {
            criteria = criteria.with_name(NameNormalization {
                case_insensitive: self.ignore_case,
                ignore_extension: self.ignore_extension,
            });
        }
        if !self.metadata.is_empty() {
            criteria = criteria.with_metadata(self.metadata.iter().copied());
        }
        if self.hash.is_some() || self.hash_size.is_some() || self.similarity.is_some() {
            let base = configured.hash_config.unwrap_or_default();
            let config = HashConfig::new(
                self.hash.unwrap_or(base.algorithm()),
                self.hash_size.unwrap_or(base.bit_size()),
            )?;
            let threshold = self.similarity.unwrap_or(configured.similarity_threshold);
            criteria = criteria.with_hash(config, threshold);
        }
        if self.require_all {
            criteria = criteria.require_all();
        }

        criteria.validate()?;
        Ok(criteria)
    }
}

fn parse_percent(value: &str) -> Result<f64, String> {
    let percent: f64 = value
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("'{value}' is not a number"))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("similarity must be between 0 and 100, got {percent}"));
    }
    Ok(percent / 100.0)
}

#[derive(Serialize)]
struct Report<'a, T: Serialize> {
    result: &'a T,
    hashing: Vec<&'a HashingReport>,
    warnings: Vec<&'a ScanWarning>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.global.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let mut config = match &cli.global.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    apply_global_flags(&mut config, &cli.global);
    let json = cli.global.json;

    match cli.command {
        Commands::Compare {
            reference,
            working,
            criteria,
        } => {
            config.criteria = criteria.resolve(&config.criteria)?;
            let session = Session::open(config).context("Failed to start session")?;
            if !json {
                println!(
                    "▶ Comparing {} against {}",
                    working.display(),
                    reference.display()
                );
            }

            let (result, sets) = run_engine(session, !json, move |session| {
                let criteria = session.config().criteria.clone();
                let reference = load_set(session, &reference, &criteria)?;
                let working = load_set(session, &working, &criteria)?;
                let result = benchmark("comparing", || {
                    session.compare(&reference.records, &working.records, &criteria)
                })?;
                Ok((result, [reference, working]))
            })
            .await?;

            if json {
                print_json(&result, &sets)?;
            } else {
                print_clusters(&result);
                print_uniques(&result.uniques);
                print_summary(&sets);
            }
        }

        Commands::Uniques {
            reference,
            working,
            criteria,
        } => {
            config.criteria = criteria.resolve(&config.criteria)?;
            let session = Session::open(config).context("Failed to start session")?;

            let (uniques, sets) = run_engine(session, !json, move |session| {
                let criteria = session.config().criteria.clone();
                let reference = load_set(session, &reference, &criteria)?;
                let working = load_set(session, &working, &criteria)?;
                let uniques = benchmark("finding uniques", || {
                    session.find_uniques(&reference.records, &working.records, &criteria)
                })?;
                Ok((uniques, [reference, working]))
            })
            .await?;

            if json {
                print_json(&uniques, &sets)?;
            } else {
                print_uniques(&uniques);
                print_summary(&sets);
            }
        }

        Commands::Dedupe { path, criteria } => {
            config.criteria = criteria.resolve(&config.criteria)?;
            let session = Session::open(config).context("Failed to start session")?;
            if !json {
                println!("▶ Looking for duplicates in: {}", path.display());
            }

            let (result, sets) = run_engine(session, !json, move |session| {
                let criteria = session.config().criteria.clone();
                let set = load_set(session, &path, &criteria)?;
                let result = benchmark("clustering", || {
                    session.compare_within(&set.records, &criteria)
                })?;
                Ok((result, [set]))
            })
            .await?;

            if json {
                print_json(&result, &sets)?;
            } else {
                print_clusters(&result);
                print_summary(&sets);
            }
        }

        Commands::Cache { command } => {
            if !config.cache_enabled {
                anyhow::bail!("--no-cache leaves no cache to manage");
            }
            let path = match &config.cache_path {
                Some(path) => path.clone(),
                None => default_cache_path()?,
            };
            let cache = SqliteHashCache::open(&path);

            match command {
                CacheCmd::Stats => {
                    let stats = cache.stats();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&stats)?);
                    } else {
                        println!("🗂️  Hash cache at {}", path.display());
                        println!("   entries: {}", stats.entries);
                        if stats.degraded {
                            println!("   ⚠️  unusable; run `uif cache clear` to rebuild it");
                        }
                    }
                }
                CacheCmd::Clear => {
                    cache
                        .clear()
                        .with_context(|| format!("Failed to clear cache {}", path.display()))?;
                    println!("🧹 Cleared {}", path.display());
                }
                CacheCmd::Invalidate { path: target } => {
                    let target = target.canonicalize().unwrap_or(target);
                    let removed = cache.invalidate_path(&target);
                    println!("🧹 Removed {} cached hash(es) for {}", removed, target.display());
                }
                CacheCmd::Prune => {
                    let removed = benchmark("pruning", || cache.prune_missing());
                    if json {
                        println!("{}", serde_json::json!({ "removed": removed }));
                    } else {
                        println!("🧹 Removed {} cached hash(es) for missing files", removed);
                    }
                }
            }
            cache.close();
        }
    }

    Ok(())
}

fn apply_global_flags(config: &mut AppConfig, global: &GlobalArgs) {
    if let Some(path) = &global.cache {
        config.cache_path = Some(path.clone());
    }
    if global.no_cache {
        config.cache_enabled = false;
    }
    if global.checksum {
        config.fingerprint_mode = FingerprintMode::Content;
    }
    if let Some(workers) = global.workers {
        config.parallel_workers = workers;
    }
}

fn load_set(session: &Session, root: &Path, criteria: &MatchCriteria) -> Result<ImageSet> {
    benchmark(&format!("loading {}", root.display()), || {
        session
            .load_set(root, criteria)
            .with_context(|| format!("Failed to scan {}", root.display()))
    })
}

/// Run `job` on a blocking thread while drawing its progress events.
async fn run_engine<T, F>(session: Session, show_progress: bool, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> Result<T> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = session.with_progress_sender(tx);
    let handle = tokio::task::spawn_blocking(move || {
        let result = job(&session);
        session.close();
        result
    });

    let bar = if show_progress {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg:<10} [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    } else {
        ProgressBar::hidden()
    };

    // The channel closes once the session and its workers are gone.
    while let Some(progress) = rx.recv().await {
        draw(&bar, &progress);
    }
    bar.finish_and_clear();

    handle.await.context("Engine task panicked")?
}

fn draw(bar: &ProgressBar, progress: &Progress) {
    if progress.phase == Phase::Complete {
        bar.set_position(bar.length().unwrap_or(0));
        return;
    }
    bar.set_length(progress.total as u64);
    bar.set_position(progress.processed as u64);
    bar.set_message(format!("{:?}", progress.phase));
}

fn print_clusters(result: &ComparisonResult) {
    if result.clusters.is_empty() {
        println!("No duplicates found.");
        return;
    }

    println!("Found {} duplicate cluster(s):", result.clusters.len());
    for (i, cluster) in result.clusters.iter().enumerate() {
        let origin = match &cluster.anchor {
            ClusterAnchor::Reference(_) => "reference",
            ClusterAnchor::Working(_) => "first seen",
        };
        println!("\n✨ Cluster {}:", i + 1);
        println!(
            "   🏆 {} → {}",
            origin,
            cluster.anchor.image().path.display()
        );
        for member in &cluster.members {
            let matched: Vec<&str> = member.matched.iter().map(criterion_label).collect();
            let similarity = member
                .similarity
                .map(|s| format!(", {:.1}% similar", s * 100.0))
                .unwrap_or_default();
            println!(
                "   📦 {} [{}{}]",
                member.image.path.display(),
                matched.join(", "),
                similarity
            );
        }
    }
}

fn print_uniques(uniques: &[ImageRef]) {
    if uniques.is_empty() {
        println!("\nNo unique images.");
        return;
    }
    println!("\n🔍 {} unique image(s):", uniques.len());
    for image in uniques {
        println!("   ▶ {}", image.path.display());
    }
}

fn print_summary<const N: usize>(sets: &[ImageSet; N]) {
    for set in sets {
        let report = &set.hashing;
        if !report.failures.is_empty() {
            println!("\n⚠️  {} image(s) could not be hashed:", report.failures.len());
            for failure in &report.failures {
                println!("   {}", failure.error);
            }
        }
        if !set.warnings.is_empty() {
            println!("\n⚠️  {} file(s) skipped while scanning", set.warnings.len());
        }
    }
}

fn print_json<T: Serialize, const N: usize>(result: &T, sets: &[ImageSet; N]) -> Result<()> {
    let report = Report {
        result,
        hashing: sets.iter().map(|set| &set.hashing).collect(),
        warnings: sets.iter().flat_map(|set| &set.warnings).collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn criterion_label(criterion: &Criterion) -> &'static str {
    match criterion {
        Criterion::Size => "size",
        Criterion::Name => "name",
        Criterion::Metadata => "metadata",
        Criterion::HashSimilarity => "hash",
    }
}

/// Run `f()`, log how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    log::info!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
