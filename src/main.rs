use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use proxy_triage::{aggregate, CheckerConfig, DescriptorParser, IdentitySet, Pipeline, SortOrder};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Two-phase proxy endpoint checker with tunnel probing and geolocation
#[derive(Parser)]
#[command(name = "proxy-triage")]
#[command(version, about = "Two-phase proxy endpoint checker with tunnel probing and geolocation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe descriptors and save the working ones
    Check(CheckArgs),
    /// Parse and deduplicate descriptors without probing
    Parse {
        /// Input file containing descriptors
        input: PathBuf,
        /// Output file for unique canonical descriptors
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CheckArgs {
    /// Input file containing descriptors, one per line
    input: PathBuf,
    /// Output file for working descriptors
    output: PathBuf,
    /// Maximum accepted tunnel latency in milliseconds (exclusive)
    #[arg(long, default_value = "150")]
    threshold: u64,
    /// Transport connect timeout in milliseconds [default: threshold + 500]
    #[arg(long)]
    connect_timeout: Option<u64>,
    /// Tunnel request timeout in milliseconds [default: threshold + 500]
    #[arg(long)]
    probe_timeout: Option<u64>,
    /// Number of concurrent transport checks
    #[arg(short = 'n', long, default_value = "50")]
    threads: usize,
    /// Number of concurrent tunnel checks
    #[arg(long, default_value = "8")]
    tunnel_threads: usize,
    /// URL fetched through each tunnel
    #[arg(long, default_value = "http://www.gstatic.com/generate_204")]
    test_url: String,
    /// MMDB country database for geolocation
    #[arg(long)]
    mmdb: Option<PathBuf>,
    /// Tunnel executable
    #[arg(long, default_value = "xray")]
    xray: PathBuf,
    /// First local port used for tunnel listeners
    #[arg(long, default_value = "20800")]
    base_port: u16,
    /// Local ports tried per tunnel before giving up
    #[arg(long, default_value = "3")]
    port_attempts: usize,
    /// Milliseconds a tunnel has to start listening
    #[arg(long, default_value = "3000")]
    ready_timeout: u64,
    /// Milliseconds between tunnel readiness checks
    #[arg(long, default_value = "50")]
    ready_poll_interval: u64,
    /// Milliseconds between SIGTERM and SIGKILL when stopping a tunnel
    #[arg(long, default_value = "1000")]
    kill_grace: u64,
    /// Directory for generated tunnel configs [default: system temp dir]
    #[arg(long)]
    config_dir: Option<PathBuf>,
    /// Sort results by descriptor or latency
    #[arg(long, default_value = "descriptor")]
    sort: String,
    /// Also write results with full endpoint details as JSON
    #[arg(long)]
    json: Option<PathBuf>,
}

impl CheckArgs {
    fn to_config(&self) -> Result<CheckerConfig> {
        let mut config = CheckerConfig::new()
            .with_threshold(Duration::from_millis(self.threshold))
            .with_transport_concurrency(self.threads)
            .with_tunnel_concurrency(self.tunnel_threads)
            .with_test_url(self.test_url.clone())
            .with_tunnel_binary(self.xray.clone())
            .with_base_port(self.base_port)
            .with_port_attempts(self.port_attempts)
            .with_ready_timeout(Duration::from_millis(self.ready_timeout))
            .with_ready_poll_interval(Duration::from_millis(self.ready_poll_interval))
            .with_kill_grace(Duration::from_millis(self.kill_grace))
            .with_sort_order(parse_sort_order(&self.sort)?);
        if let Some(ms) = self.connect_timeout {
            config = config.with_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.probe_timeout {
            config = config.with_probe_timeout(Duration::from_millis(ms));
        }
        if let Some(path) = &self.mmdb {
            config = config.with_mmdb_path(path.clone());
        }
        if let Some(dir) = &self.config_dir {
            config = config.with_config_dir(dir.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.command {
        Commands::Check(args) => {
            let config = args.to_config()?;
            let pipeline = Pipeline::with_config(config);
            println!(
                "Checking descriptors from {:?} (threshold: {}ms)...",
                args.input, args.threshold
            );
            let report = pipeline.run_file(&args.input).await?;

            aggregate::save_to_file(&report.results, &args.output)?;
            if let Some(json_path) = &args.json {
                aggregate::save_json(&report.results, json_path)?;
                println!("Saved JSON report to {:?}", json_path);
            }

            println!("\nResults:");
            println!("{}", report);
            println!(
                "\nSaved {} working descriptors to {:?}",
                report.results.len(),
                args.output
            );
        }
        Commands::Parse { input, output } => {
            println!("Parsing descriptors from {:?}...", input);
            let batch = DescriptorParser::parse_file(&input)?;

            let seen = IdentitySet::new();
            let unique: Vec<_> = batch
                .descriptors
                .into_iter()
                .filter(|d| seen.try_accept(&d.identity()))
                .collect();

            println!(
                "Found {} unique descriptors ({} rejected lines)",
                unique.len(),
                batch.rejected
            );

            if let Some(output_path) = output {
                DescriptorParser::save_to_file(&unique, &output_path)
                    .with_context(|| format!("failed to write {:?}", output_path))?;
                println!("Saved descriptors to {:?}", output_path);
            } else {
                for descriptor in &unique {
                    println!("{}", descriptor);
                }
            }
        }
    }

    Ok(())
}

fn parse_sort_order(s: &str) -> Result<SortOrder> {
    match s.to_lowercase().as_str() {
        "descriptor" => Ok(SortOrder::Descriptor),
        "latency" => Ok(SortOrder::Latency),
        _ => Err(anyhow!("Invalid sort order: {}. Use: descriptor, latency", s)),
    }
}
