use std::path::PathBuf;
use std::time::{Duration, Instant};

use mqtt_scan_rs::output::{self, Format};
use mqtt_scan_rs::scanner::{self, Checker, ScanConfig};
use mqtt_scan_rs::types::{ScanResults, DEFAULT_MQTT_PORT};
use mqtt_scan_rs::{server, targets};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const BANNER: &str = r#"
  __  __  ___ _____ _____   ___  ___ __ _ _ __
 |  \/  |/ _ \_   _|_   _| / __|/ __/ _` | '_ \
 | |\/| | (_) || |   | |   \__ \ (_| (_| | | | |
 |_|  |_|\__\_\|_|   |_|   |___/\___\__,_|_| |_|
"#;

/// mqtt-scan-rs: find MQTT brokers that accept anonymous or default-credential logins.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mqtt-scan-rs",
    version,
    about = "Find MQTT brokers that accept anonymous or default-credential logins.",
    after_help = concat!(
        "Examples:\n",
        "  mqtt-scan-rs -t targets.txt -o results.txt -f txt\n",
        "  mqtt-scan-rs -t 192.168.1.1,192.168.1.2:1884 -o results.json -f json -v\n",
        "  mqtt-scan-rs -t 192.168.1.0/24 -o results.csv -f csv",
    )
)]
struct Cli {
    /// Target(s): IP, IP:PORT, CIDR, comma-separated list, or a file with one target per line.
    #[arg(short = 't', long, required_unless_present = "serve")]
    target: Option<String>,

    /// Output file to save results.
    #[arg(short = 'o', long, required_unless_present = "serve")]
    output: Option<PathBuf>,

    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value_t = Format::Txt)]
    format: Format,

    /// Enable verbose output.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Per-connection timeout in seconds.
    #[arg(short = 'T', long, default_value_t = 5)]
    timeout: u64,

    /// Port used for targets that do not specify one.
    #[arg(long, default_value_t = DEFAULT_MQTT_PORT)]
    port: u16,

    /// Speak MQTT over TLS (certificates are not verified).
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// Prefix for MQTT client identifiers.
    #[arg(long = "client-id", default_value = "mqtt-scan")]
    client_id: String,

    /// Run the HTTP API on this address instead of a one-shot scan (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("{BANNER}");

    if cli.timeout == 0 {
        bail!("--timeout must be at least 1 second");
    }
    let config = ScanConfig {
        timeout: Duration::from_secs(cli.timeout),
        tls: cli.tls,
        client_id: cli.client_id.clone(),
    };

    if let Some(bind) = cli.serve.as_deref() {
        let shutdown = CancellationToken::new();
        let on_ctrl_c = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            on_ctrl_c.cancel();
        });
        println!("API server starting at http://{bind} (Ctrl+C to stop)");
        return server::spawn_server(bind, config, shutdown).await;
    }

    let (Some(target_arg), Some(output_path)) = (cli.target.as_deref(), cli.output.as_deref())
    else {
        bail!("--target and --output are required unless --serve is given");
    };

    let targets = targets::load_targets(target_arg, cli.port).context("error reading targets")?;
    if targets.is_empty() {
        bail!("no valid targets found");
    }

    println!("[*] Loaded {} target(s) to scan", targets.len());
    if cli.verbose {
        for t in &targets {
            println!("    {t}");
        }
    }

    let checker = Checker::new(config)?;
    println!("[*] Starting scan...");
    let started = Instant::now();
    let results = scanner::scan_targets(&targets, &checker).await;
    let elapsed = started.elapsed();

    output::write_report(output_path, &results.entries, cli.format)?;
    println!(
        "[*] Results saved to {} in {} format",
        output_path.display(),
        format!("{:?}", cli.format).to_lowercase()
    );

    println!("[*] Scan completed in {:.2} seconds", elapsed.as_secs_f64());
    print_summary(&results);
    Ok(())
}

fn print_summary(results: &ScanResults) {
    println!("[*] Summary:");
    for (status, count) in results.status_counts() {
        println!("    {status}: {count}");
    }

    if results.vulnerable_count == 0 {
        return;
    }
    println!("\n[!] VULNERABLE TARGETS FOUND:");
    for r in results.vulnerable() {
        let creds = r
            .outcome
            .reported_credentials()
            .map(|c| format!(" ({c})"))
            .unwrap_or_default();
        println!("    {} - {}{}", r.target, r.outcome.status(), creds);
    }
}
