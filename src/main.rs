//! plhost CLI - run queries against a WebAssembly Prolog engine
//!
//! Commands:
//!   plhost query <module.wasm> <goal>  - Print every answer of a goal

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use plhost::{DecodeOptions, Prolog, PrologOptions, PrologText, QueryOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "plhost")]
#[command(about = "Run queries against a WebAssembly Prolog engine", long_about = None)]
struct Cli {
    /// Log bridge activity to stderr
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// One JSON answer per line
    Json,
    /// Toplevel text, e.g. `X = 1.`
    Prolog,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a goal and print its answers
    Query(QueryArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// Path to the engine module
    module: PathBuf,

    /// Goal text
    goal: String,

    /// Program files to load first
    #[arg(long, short = 'c')]
    consult: Vec<PathBuf>,

    #[arg(long, short = 'f', value_enum, default_value = "json")]
    format: Format,

    /// Answer decoding options as JSON, e.g. '{"atoms":"string"}'
    #[arg(long)]
    encode: Option<String>,

    /// Stop after the first answer
    #[arg(long)]
    once: bool,

    /// Autoyield interval in milliseconds (0 disables)
    #[arg(long, default_value_t = 20)]
    autoyield: u64,

    /// Library directory inside the engine's filesystem
    #[arg(long)]
    library: Option<String>,

    /// Environment variable for the engine, KEY=VALUE
    #[arg(long, short = 'e', value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Silence the engine's own warnings
    #[arg(long, short = 'q')]
    quiet: bool,
}

impl QueryArgs {
    fn engine(&self) -> PrologOptions {
        let mut engine = PrologOptions::default().quiet(self.quiet);
        if let Some(dir) = &self.library {
            engine = engine.library_dir(dir.clone());
        }
        for (key, value) in &self.env {
            engine = engine.env(key.clone(), value.clone());
        }
        engine
    }

    fn query_options(&self) -> anyhow::Result<QueryOptions> {
        let encode = match &self.encode {
            Some(text) => serde_json::from_str::<DecodeOptions>(text).context("invalid --encode options")?,
            None => DecodeOptions::default(),
        };
        Ok(QueryOptions::default()
            .encode(encode)
            .autoyield(Duration::from_millis(self.autoyield)))
    }

    fn limit(&self) -> usize {
        if self.once {
            1
        } else {
            usize::MAX
        }
    }
}

fn parse_env(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {text:?}"))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // RUST_LOG refines the -v level
    let result = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .try_init();
    if let Err(e) = result {
        eprintln!("logging disabled: {e}");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Query(args) => query_command(&args).await,
    }
}

async fn query_command(args: &QueryArgs) -> anyhow::Result<()> {
    let options = args.query_options()?;
    let bytes = std::fs::read(&args.module).with_context(|| format!("failed to read {}", args.module.display()))?;
    plhost::guest::wasm::load(&bytes).context("failed to compile engine module")?;
    let pl = Prolog::instantiate(args.engine())?;

    for file in &args.consult {
        let text = std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?;
        pl.consult_text(&text).await?;
    }

    match args.format {
        Format::Json => {
            let mut answers = pl.query(&args.goal, options).take(args.limit());
            while let Some(answer) = answers.next().await {
                println!("{}", serde_json::to_string(&answer?.to_json_value()?)?);
            }
        }
        Format::Prolog => {
            let mut answers = pl.query_with(&args.goal, options, PrologText::default()).take(args.limit());
            while let Some(answer) = answers.next().await {
                println!("{}", answer?);
            }
        }
    }
    Ok(())
}
