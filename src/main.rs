use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use ocsf_parser_check::catalog::Catalog;
use ocsf_parser_check::config::ValidatorConfig;
use ocsf_parser_check::engine::ValidationContext;
use ocsf_parser_check::error::Result;
use ocsf_parser_check::model::Severity;
use ocsf_parser_check::report::ResultSet;

/// Validate that log-event generators and their parsers agree on fields.
///
/// Discovers generator templates and parser configurations, pairs them by
/// product, scores field coverage statically, and optionally sends tagged
/// events through a live ingestion pipeline to measure extraction rates.
#[derive(Parser)]
#[command(name = "ocsf-parser-check", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover, pair and score generators against parsers. No network.
    Static {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Static scoring plus live validation against ingestion and query endpoints.
    #[cfg(feature = "http")]
    Live {
        #[command(flatten)]
        common: CommonArgs,

        /// Ingestion endpoint base URL.
        #[arg(long, env = "INGEST_URL")]
        ingest_url: Option<String>,

        /// Ingestion endpoint credential.
        #[arg(long, env = "INGEST_TOKEN", hide_env_values = true)]
        ingest_token: Option<String>,

        /// Query endpoint base URL.
        #[arg(long, env = "QUERY_URL")]
        query_url: Option<String>,

        /// Query endpoint credential.
        #[arg(long, env = "QUERY_TOKEN", hide_env_values = true)]
        query_token: Option<String>,

        /// Seconds to keep polling for tagged events.
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Tagged events sent per pair.
        #[arg(long)]
        samples: Option<usize>,
    },

    /// Rank parser names against a product name.
    Resolve {
        /// Product name to look up (e.g., "acme_widget-latest").
        name: String,

        /// Directory of local parser definitions.
        #[arg(long, default_value = "parsers")]
        parsers: PathBuf,

        /// Number of candidates to print.
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Search the remote parser repository instead of local parsers.
        #[cfg(feature = "http")]
        #[arg(long)]
        remote: bool,

        /// Remote parser repository base URL.
        #[cfg(feature = "http")]
        #[arg(long, env = "PARSER_REPO_URL")]
        remote_url: Option<String>,

        /// Remote parser repository credential.
        #[cfg(feature = "http")]
        #[arg(long, env = "PARSER_REPO_TOKEN", hide_env_values = true)]
        remote_token: Option<String>,

        /// Configuration file (JSON).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Directory of generator templates (<category>/<name>.json).
    #[arg(long, default_value = "generators")]
    generators: PathBuf,

    /// Directory of parser definitions (<name>/parser.json).
    #[arg(long, default_value = "parsers")]
    parsers: PathBuf,

    /// Configuration file (JSON). Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write results.json and report.md here instead of printing JSON.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Static scoring worker threads.
    #[arg(long, env = "VALIDATOR_WORKERS")]
    workers: Option<usize>,

    /// Coverage/extraction percentage below which an issue is `medium`.
    #[arg(long)]
    low_pct: Option<f64>,

    /// Coverage/extraction percentage below which an issue is `high`.
    #[arg(long)]
    very_low_pct: Option<f64>,

    /// Comma-separated vendor slugs forming the high-priority tier.
    #[arg(long, value_delimiter = ',')]
    priority_vendors: Vec<String>,

    /// Exit with status 2 when an issue at or above this severity exists.
    #[arg(long, value_enum)]
    fail_on: Option<FailOn>,

    /// Suppress non-error output.
    #[arg(long, short)]
    quiet: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FailOn {
    Critical,
    High,
    Medium,
    Low,
}

impl From<FailOn> for Severity {
    fn from(value: FailOn) -> Self {
        match value {
            FailOn::Critical => Severity::Critical,
            FailOn::High => Severity::High,
            FailOn::Medium => Severity::Medium,
            FailOn::Low => Severity::Low,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(quiet(&cli));

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");

            // Print cause chain.
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = std::error::Error::source(cause);
            }

            process::exit(1);
        }
    }
}

fn quiet(cli: &Cli) -> bool {
    match &cli.command {
        Commands::Static { common } => common.quiet,
        #[cfg(feature = "http")]
        Commands::Live { common, .. } => common.quiet,
        Commands::Resolve { .. } => false,
    }
}

fn init_tracing(quiet: bool) {
    let default = if quiet {
        "ocsf_parser_check=warn"
    } else {
        "ocsf_parser_check=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Static { common } => {
            let config = load_config(&common)?;
            let catalog = Catalog::discover(&common.generators, &common.parsers)?;
            let results = ValidationContext::new(config, catalog).validate_static()?;
            finish(&results, &common)
        }

        #[cfg(feature = "http")]
        Commands::Live {
            common,
            ingest_url,
            ingest_token,
            query_url,
            query_token,
            deadline_secs,
            samples,
        } => {
            let mut config = load_config(&common)?;
            override_with(&mut config.ingest.url, ingest_url);
            override_with(&mut config.ingest.token, ingest_token);
            override_with(&mut config.query.endpoint.url, query_url);
            override_with(&mut config.query.endpoint.token, query_token);
            override_with(&mut config.polling.deadline_secs, deadline_secs);
            override_with(&mut config.samples_per_run, samples);
            config.validate()?;

            let catalog = Catalog::discover(&common.generators, &common.parsers)?;
            let context = ValidationContext::new(config, catalog).with_http_endpoints()?;
            let runtime = runtime()?;
            // The sender lives until validation returns, so runs end only by deadline.
            let (_cancel, cancelled) = tokio::sync::watch::channel(false);
            let results = runtime.block_on(context.validate(cancelled))?;
            finish(&results, &common)
        }

        Commands::Resolve {
            name,
            parsers,
            limit,
            #[cfg(feature = "http")]
            remote,
            #[cfg(feature = "http")]
            remote_url,
            #[cfg(feature = "http")]
            remote_token,
            config,
        } => {
            let config = ValidatorConfig::load(config.as_deref())?;

            #[cfg(feature = "http")]
            if remote {
                let mut config = config;
                override_with(&mut config.remote.endpoint.url, remote_url);
                override_with(&mut config.remote.endpoint.token, remote_token);
                return resolve_remote(&name, &config, limit);
            }

            let parsers = ocsf_parser_check::catalog::discover_parsers(&parsers)?;
            let ids: Vec<&str> = parsers.iter().map(|p| p.id.as_str()).collect();
            for m in ocsf_parser_check::fuzzy::resolve(&name, &ids).into_iter().take(limit) {
                println!(
                    "{:.3}\t{}\t{}",
                    m.similarity,
                    if m.exact_normalized { "exact" } else { "-" },
                    m.candidate
                );
            }
            Ok(0)
        }
    }
}

#[cfg(feature = "http")]
fn resolve_remote(name: &str, config: &ValidatorConfig, limit: usize) -> Result<i32> {
    use std::time::Duration;

    use ocsf_parser_check::error::Error;
    use ocsf_parser_check::remote::RemoteRepository;

    let remote = &config.remote;
    if remote.endpoint.url.is_empty() {
        return Err(Error::Config("remote search needs --remote-url or remote.url".to_string()));
    }
    let repo = RemoteRepository::http(
        &remote.endpoint.url,
        Some(remote.endpoint.token.as_str()),
        Duration::from_secs(remote.endpoint.timeout_secs),
        remote.max_pages,
        config.fuzzy_min_similarity,
    )?;
    let hits = runtime()?.block_on(repo.search(name))?;
    for hit in hits.into_iter().take(limit) {
        println!(
            "{:.3}\t{}\t{}\t{}",
            hit.similarity,
            if hit.exact_normalized { "exact" } else { "-" },
            hit.entry.name,
            hit.entry.config_url
        );
    }
    Ok(0)
}

fn load_config(common: &CommonArgs) -> Result<ValidatorConfig> {
    let mut config = ValidatorConfig::load(common.config.as_deref())?;
    override_with(&mut config.workers, common.workers);
    override_with(&mut config.thresholds.low_pct, common.low_pct);
    override_with(&mut config.thresholds.very_low_pct, common.very_low_pct);
    if !common.priority_vendors.is_empty() {
        config.priority_vendors = common.priority_vendors.clone();
    }
    config.validate()?;
    Ok(config)
}

fn override_with<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

#[cfg(feature = "http")]
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| ocsf_parser_check::error::Error::Config(format!("starting async runtime: {e}")))
}

fn finish(results: &ResultSet, common: &CommonArgs) -> Result<i32> {
    match &common.out {
        Some(dir) => results.write(dir)?,
        None => println!("{}", serde_json::to_string_pretty(results)?),
    }

    if !common.quiet {
        let counts: Vec<String> = Severity::ALL
            .iter()
            .map(|s| format!("{} {}", results.count(*s), s.as_str()))
            .collect();
        eprintln!(
            "Checked {} generators against {} parsers: {}",
            results.summary.generators,
            results.summary.parsers,
            counts.join(", ")
        );
    }

    let failing = common
        .fail_on
        .map(Severity::from)
        .is_some_and(|threshold| results.issues.iter().any(|i| i.severity <= threshold));
    Ok(if failing { 2 } else { 0 })
}
