use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use sft_common::{
    HfTokenizer, JsonlMemMapDataset, RecordSource, SftDatasetConfig, SftError, SpecialTokenNames,
    TokenizerAdapter,
};
use sft_core::{AssembledExample, SftDataset};

#[derive(Parser, Debug)]
#[command(name = "sftpack", about = "Turn JSONL records into SFT training batches")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default dataset config to edit.
    InitConfig(InitConfigArgs),
    /// Build (or verify) the line-offset index of a JSONL file.
    Index(IndexArgs),
    /// Show how individual records are split, truncated and assembled.
    Preview(PreviewArgs),
    /// Process a whole file and collate it into batches.
    Collate(CollateArgs),
}

// ── Shared args ────────────────────────────────────────────────────────────────

#[derive(Args, Debug)]
struct TokenizerArgs {
    /// Hugging Face tokenizer.json
    #[arg(long)]
    tokenizer: PathBuf,
    #[arg(long, default_value = "<|endoftext|>")]
    bos_token: String,
    #[arg(long, default_value = "<|endoftext|>")]
    eos_token: String,
    /// Whether a leading space changes tokenization (true for GPT-2 style BPE).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    space_sensitive: bool,
}

impl TokenizerArgs {
    fn load(&self) -> Result<HfTokenizer> {
        let specials = SpecialTokenNames {
            bos: self.bos_token.clone(),
            eos: self.eos_token.clone(),
        };
        HfTokenizer::from_file(&self.tokenizer, &specials, self.space_sensitive)
            .with_context(|| format!("loading tokenizer {}", self.tokenizer.display()))
    }
}

#[derive(Args, Debug)]
struct DatasetArgs {
    #[arg(long, default_value = "sft_config.json")]
    config: PathBuf,
    /// JSONL file, one record per line.
    #[arg(long)]
    data: PathBuf,
    #[command(flatten)]
    tokenizer: TokenizerArgs,
}

impl DatasetArgs {
    fn open(&self) -> Result<SftDataset<JsonlMemMapDataset, HfTokenizer>> {
        let config = SftDatasetConfig::load(&self.config)
            .with_context(|| format!("loading config {}", self.config.display()))?;
        let tokenizer = self.tokenizer.load()?;
        SftDataset::open(&self.data, config, tokenizer)
            .with_context(|| format!("opening dataset {}", self.data.display()))
    }
}

// ── Subcommand args ────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "sft_config.json")]
    output: PathBuf,
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct IndexArgs {
    #[arg(long)]
    data: PathBuf,
    /// Where to keep the index; defaults to next to the data file.
    #[arg(long)]
    index_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PreviewArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    /// First sample index; negative counts from the end.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    index: i64,
    #[arg(long, default_value_t = 1)]
    count: usize,
}

#[derive(Parser, Debug)]
struct CollateArgs {
    #[command(flatten)]
    dataset: DatasetArgs,
    #[arg(long, default_value_t = 8)]
    batch_size: usize,
    /// Process at most this many samples.
    #[arg(long)]
    limit: Option<usize>,
    /// Worker threads; 0 lets rayon decide.
    #[arg(long, default_value_t = 0)]
    num_threads: usize,
    /// Write collated batches as JSON lines.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Index(args) => cmd_index(args),
        Command::Preview(args) => cmd_preview(args),
        Command::Collate(args) => cmd_collate(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            args.output.display()
        );
    }
    SftDatasetConfig::default().save(&args.output)?;
    eprintln!("Created default config at {}", args.output.display());
    Ok(())
}

fn cmd_index(args: IndexArgs) -> Result<()> {
    let ds = JsonlMemMapDataset::open(&args.data, args.index_dir.as_deref())
        .with_context(|| format!("indexing {}", args.data.display()))?;
    let index_path = JsonlMemMapDataset::index_path(&args.data, args.index_dir.as_deref());
    eprintln!(
        "{}: {} records (index {})",
        args.data.display(),
        ds.len(),
        index_path.display()
    );
    Ok(())
}

fn cmd_preview(args: PreviewArgs) -> Result<()> {
    let ds = args.dataset.open()?;
    eprintln!("Template: {:?}", ds.template().as_str());
    let tok = ds.tokenizer();

    for offset in 0..args.count as i64 {
        let idx = args.index + offset;
        let ex = ds
            .get_wrapped(idx)
            .with_context(|| format!("processing sample {idx}"))?;
        let view = serde_json::json!({
            "index": idx,
            "length": ex.len(),
            "answer_start_idx": ex.answer_start_idx,
            "context_length": ex.context_length,
            "context_text": tok.ids_to_text(&ex.context_ids)?,
            "answer_text": tok.ids_to_text(&ex.answer_ids)?,
            "input_ids": ex.input_ids,
            "metadata": ex.metadata,
            "overflow": ex.overflow.map(|w| w.to_string()),
            "meets_min_length": ds.meets_min_length(&ex),
        });
        println!("{}", serde_json::to_string_pretty(&view)?);
    }
    Ok(())
}

/// Per-sample outcome of the parallel pass.
enum Processed {
    Kept(AssembledExample),
    TooShort,
    Untruncatable,
}

fn cmd_collate(args: CollateArgs) -> Result<()> {
    if args.batch_size == 0 {
        anyhow::bail!("--batch-size must be positive");
    }
    if args.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.num_threads)
            .build_global()
            .context("configuring rayon thread pool")?;
    }

    let ds = args.dataset.open()?;
    let total = args.limit.map_or(ds.len(), |n| n.min(ds.len()));
    eprintln!("Processing {total} of {} samples", ds.len());

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} samples")
            .context("progress bar template")?
            .progress_chars("=>-"),
    );

    let processed: Vec<Processed> = (0..total)
        .into_par_iter()
        .map(|i| {
            let outcome = match ds.get(i) {
                Ok(ex) if ds.meets_min_length(&ex) => Ok(Processed::Kept(ex)),
                Ok(_) => Ok(Processed::TooShort),
                Err(e @ (SftError::FieldTruncation { .. } | SftError::NoTruncatableField { .. })) => {
                    tracing::warn!(index = i, error = %e, "Dropping sample that cannot be truncated");
                    Ok(Processed::Untruncatable)
                }
                Err(e) => Err(e),
            };
            pb.inc(1);
            outcome
        })
        .collect::<Result<_, SftError>>()?;
    pb.finish_and_clear();

    let mut too_short = 0usize;
    let mut untruncatable = 0usize;
    let mut examples = Vec::with_capacity(processed.len());
    for p in processed {
        match p {
            Processed::Kept(ex) => examples.push(ex),
            Processed::TooShort => too_short += 1,
            Processed::Untruncatable => untruncatable += 1,
        }
    }
    let overflowed = examples.iter().filter(|e| e.overflow.is_some()).count();

    let mut writer = match &args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => None,
    };

    let device = Device::Cpu;
    let mut batches = 0usize;
    let mut loss_tokens = 0f64;
    let mut padded_tokens = 0usize;
    for chunk in examples.chunks(args.batch_size) {
        let batch = ds.collate(chunk)?;
        let tensors = batch.to_tensors(&device)?;
        tracing::debug!(
            batch = batches,
            tokens = ?tensors.tokens.dims(),
            attention_mask = ?tensors.attention_mask.dims(),
            "Collated batch"
        );
        loss_tokens += tensors.loss_mask.sum_all()?.to_scalar::<f32>()? as f64;
        padded_tokens += batch.batch_size() * batch.length;
        if let Some(w) = writer.as_mut() {
            serde_json::to_writer(&mut *w, &batch)?;
            writeln!(w)?;
        }
        batches += 1;
    }
    if let Some(mut w) = writer {
        w.flush()?;
    }

    eprintln!(
        "Kept {} samples in {batches} batches; dropped {too_short} too short, {untruncatable} untruncatable; {overflowed} clamped",
        examples.len()
    );
    if padded_tokens > 0 {
        eprintln!(
            "Loss tokens: {loss_tokens:.0} of {padded_tokens} ({:.1}%)",
            100.0 * loss_tokens / padded_tokens as f64
        );
    }
    Ok(())
}
