//! Command-line entry point.
//!
//! ```bash
//! terasort --root ./data generate --records 1000000 --output datasets/1m
//! terasort --root ./data sort --input datasets/1m --maps 8 --reduces 8
//! terasort --root ./data validate --prefix terasort/output
//! terasort estimate --maps 100 --reduces 100
//! ```

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use terasort_common::{
    CompressionAlgorithm, Storage, StorageBackend, StorageBuilder, StorageConfig,
};
use terasort_core::dataset::{DEFAULT_RECORDS_PER_SEGMENT, validate_objects};
use terasort_core::{
    CostModel, DatasetGenerator, Driver, LocalExecutor, OutputMode, PartitionScheme, RecordFormat,
    ShuffleEstimate, SortConfig,
};

#[derive(Parser, Debug)]
#[command(name = "terasort", version, about = "Object-store shuffle sort")]
struct Cli {
    #[command(flatten)]
    storage: StorageArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Directory backing the object store
    #[arg(long, global = true, env = "TERASORT_ROOT", default_value = "./terasort-data")]
    root: PathBuf,

    /// S3 bucket; takes precedence over --root
    #[cfg(feature = "aws")]
    #[arg(long, global = true, env = "TERASORT_BUCKET")]
    bucket: Option<String>,
}

impl StorageArgs {
    #[cfg(feature = "aws")]
    fn remote_backend(&self) -> Option<StorageBackend> {
        self.bucket.as_ref().map(|bucket| StorageBackend::S3 {
            bucket: bucket.clone(),
            region: None,
            endpoint: None,
        })
    }

    #[cfg(not(feature = "aws"))]
    fn remote_backend(&self) -> Option<StorageBackend> {
        None
    }

    fn config(&self) -> Result<StorageConfig> {
        if let Some(backend) = self.remote_backend() {
            return Ok(StorageConfig {
                backend,
                key_prefix: None,
            });
        }
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;
        Ok(StorageConfig {
            backend: StorageBackend::LocalFileSystem {
                root_path: self.root.display().to_string(),
            },
            key_prefix: None,
        })
    }
}

#[derive(Args, Debug, Clone, Copy)]
struct FormatArgs {
    #[arg(long, default_value_t = 10)]
    key_len: usize,
    #[arg(long, default_value_t = 100)]
    record_len: usize,
}

impl From<FormatArgs> for RecordFormat {
    fn from(args: FormatArgs) -> Self {
        RecordFormat {
            key_len: args.key_len,
            record_len: args.record_len,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum SchemeArg {
    Hash,
    Uniform,
    Sampled,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CompressionArg {
    None,
    Zstd,
    Lz4,
    Snappy,
}

impl From<CompressionArg> for CompressionAlgorithm {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => CompressionAlgorithm::Uncompressed,
            CompressionArg::Zstd => CompressionAlgorithm::Zstd,
            CompressionArg::Lz4 => CompressionAlgorithm::Lz4,
            CompressionArg::Snappy => CompressionAlgorithm::Snappy,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a synthetic dataset
    Generate {
        #[arg(long)]
        records: u64,
        #[arg(long)]
        output: String,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = DEFAULT_RECORDS_PER_SEGMENT)]
        records_per_segment: u64,
        #[command(flatten)]
        format: FormatArgs,
    },
    /// Sort a dataset
    Sort {
        /// JSON job configuration, storage backend included; flags below
        /// override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        input: Option<String>,
        #[arg(long)]
        maps: Option<u32>,
        #[arg(long)]
        reduces: Option<u32>,
        #[arg(long)]
        output_prefix: Option<String>,
        /// Write one object assembled from per-reducer segments
        #[arg(long)]
        segmented: bool,
        #[arg(long, value_enum)]
        partitioning: Option<SchemeArg>,
        #[arg(long, default_value_t = 1000)]
        sample_records: usize,
        #[arg(long, value_enum)]
        compression: Option<CompressionArg>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        keep_intermediates: bool,
    },
    /// Check that objects are sorted and report their checksum
    Validate {
        /// Validate every object below this prefix, in key order
        #[arg(long, conflicts_with = "keys")]
        prefix: Option<String>,
        #[arg(long, num_args = 1..)]
        keys: Vec<String>,
        /// Fail unless the checksum matches, e.g. the input's
        #[arg(long)]
        expect_checksum: Option<u64>,
        #[command(flatten)]
        format: FormatArgs,
    },
    /// Print the shuffle cost estimate for a job shape
    Estimate {
        #[arg(long)]
        maps: u32,
        #[arg(long)]
        reduces: u32,
    },
}

async fn open_storage(args: &StorageArgs) -> Result<Arc<dyn Storage>> {
    let storage = StorageBuilder::from_config(args.config()?).build().await?;
    Ok(storage)
}

fn sort_config(command: Command, storage: &StorageArgs) -> Result<SortConfig> {
    let Command::Sort {
        config,
        input,
        maps,
        reduces,
        output_prefix,
        segmented,
        partitioning,
        sample_records,
        compression,
        concurrency,
        keep_intermediates,
    } = command
    else {
        bail!("not a sort command");
    };

    let mut sort = match config {
        Some(path) => SortConfig::from_json_file(path)?,
        None => SortConfig {
            storage: storage.config()?,
            ..SortConfig::default()
        },
    };
    if let Some(input) = input {
        sort.input_key = input;
    }
    if let Some(maps) = maps {
        sort.map_tasks = maps;
    }
    if let Some(reduces) = reduces {
        sort.reduce_tasks = reduces;
    }
    if let Some(prefix) = output_prefix {
        sort.output_prefix = prefix;
    }
    if segmented {
        sort.output_mode = OutputMode::Segmented;
    }
    if let Some(scheme) = partitioning {
        sort.partitioning = match scheme {
            SchemeArg::Hash => PartitionScheme::Hash,
            SchemeArg::Uniform => PartitionScheme::UniformRange,
            SchemeArg::Sampled => PartitionScheme::Sampled {
                sample_records_per_split: sample_records,
            },
        };
    }
    if let Some(compression) = compression {
        sort.compression = compression.into();
    }
    if let Some(concurrency) = concurrency {
        sort.executor.max_concurrency = concurrency;
    }
    sort.keep_intermediates |= keep_intermediates;
    sort.validate()?;
    Ok(sort)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Generate {
            records,
            output,
            seed,
            records_per_segment,
            format,
        } => {
            let storage = open_storage(&cli.storage).await?;
            let generator = DatasetGenerator::new(format.into(), seed)?;
            let dataset = generator
                .write(storage.as_ref(), &output, records, records_per_segment)
                .await?;
            println!("{}", serde_json::to_string_pretty(&dataset)?);
        }
        command @ Command::Sort { .. } => {
            let config = sort_config(command, &cli.storage)?;
            let storage = StorageBuilder::from_config(config.storage.clone())
                .build()
                .await?;
            let executor = LocalExecutor::new(storage.clone(), config.executor.clone());
            let driver = Driver::new(executor, storage, config);
            let summary = driver.run().await?;
            info!(
                job_id = %summary.job_id(),
                rows = summary.execution_results.rows_out,
                seconds = summary.sort.elapsed(),
                cost = summary.cost.total_cost,
                "Sort complete"
            );
            println!("{}", serde_json::to_string_pretty(&summary.execution_results)?);
        }
        Command::Validate {
            prefix,
            keys,
            expect_checksum,
            format,
        } => {
            let storage = open_storage(&cli.storage).await?;
            let keys = match prefix {
                Some(prefix) => {
                    let mut keys = storage.list(&prefix).await?;
                    keys.sort();
                    keys
                }
                None => keys,
            };
            if keys.is_empty() {
                bail!("nothing to validate");
            }
            let report = validate_objects(storage.as_ref(), format.into(), &keys).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_sorted() {
                bail!(
                    "{} records out of order, first at record {:?}",
                    report.unordered_records,
                    report.first_unordered
                );
            }
            if let Some(expected) = expect_checksum {
                if expected != report.checksum {
                    bail!("checksum {} does not match {}", report.checksum, expected);
                }
            }
        }
        Command::Estimate { maps, reduces } => {
            let model = CostModel::default();
            let estimate = ShuffleEstimate::for_job(&model, maps, reduces);
            println!("{}", serde_json::to_string_pretty(&estimate)?);
        }
    }
    Ok(())
}
