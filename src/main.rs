use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokenizers::Tokenizer;

use rolling_batch::core::block::compute_num_blocks;
use rolling_batch::engine::TextCodec;
use rolling_batch::logging::{self, LogFormat};
use rolling_batch::{Error, Result, RollingBatchConfig};

#[derive(Parser, Debug)]
#[command(name = "rolling-batch")]
#[command(about = "Inspect a rolling batch serving configuration")]
struct Args {
    /// serving.properties file (`option.` prefixes allowed)
    #[arg(short, long)]
    properties: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// tokenizer.json used to size a prompt
    #[arg(short, long, requires = "prompt")]
    tokenizer: Option<PathBuf>,

    /// Prompt to check against the admission limits
    #[arg(long)]
    prompt: Option<String>,

    /// Generation limit assumed for the prompt check
    #[arg(long, default_value = "256")]
    max_new_tokens: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = logging::init(&args.log_level, LogFormat::from_env()) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "rolling-batch failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.properties {
        Some(path) => RollingBatchConfig::from_properties_file(path)?,
        None => RollingBatchConfig::default(),
    };
    let num_blocks = config.num_cache_blocks()?;

    println!("rolling-batch v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!(
        "KV cache pool: {} blocks x {} tokens = {} token slots",
        num_blocks,
        config.block_size,
        num_blocks * config.block_size
    );

    if let (Some(path), Some(prompt)) = (&args.tokenizer, &args.prompt) {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| Error::Tokenization(e.to_string()))?;
        let prompt_tokens = TextCodec::encode(&tokenizer, prompt)?.len();
        let blocks = if config.paged_attention {
            compute_num_blocks(prompt_tokens, config.block_size)
        } else {
            config.contiguous_footprint(prompt_tokens, args.max_new_tokens)
        };

        println!("Prompt: {prompt_tokens} tokens, {blocks} initial blocks");
        if prompt_tokens > config.max_rolling_batch_prefill_tokens {
            println!(
                "Rejected: exceeds max_rolling_batch_prefill_tokens ({})",
                config.max_rolling_batch_prefill_tokens
            );
        } else if blocks > num_blocks {
            println!("Rejected: larger than the KV cache pool");
        } else {
            println!("Admissible");
        }
    }

    Ok(())
}
