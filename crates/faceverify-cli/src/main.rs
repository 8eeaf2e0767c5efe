use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceverify_core::wire::{self, FaceVerifyResponse};
use faceverify_core::{MatchPolicy, MatchResult, DEFAULT_MATCH_THRESHOLD};
use faceverify_io::{HttpReferenceStore, ReferenceStore};
use std::path::PathBuf;
use std::time::Duration;

// Client side of the interface served by faceverifyd (see its dbus_interface.rs).
#[zbus::proxy(
    interface = "io.faceverify.Verifier1",
    default_service = "io.faceverify.Verifier1",
    default_path = "/io/faceverify/Verifier1"
)]
trait Verifier {
    async fn submit(&self, matric_number: &str) -> zbus::Result<()>;
    async fn set_identifier(&self, matric_number: &str) -> zbus::Result<()>;
    async fn clear(&self) -> zbus::Result<()>;
    async fn verdict(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceverify", about = "Face verification against stored reference images")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a matric number and start matching
    Submit {
        matric_number: String,
    },
    /// Change the matric number without starting capture
    Identifier {
        matric_number: String,
    },
    /// End the session and discard reference images
    Clear,
    /// Show the latest verdict
    Verdict,
    /// Show daemon status
    Status,
    /// Print the verdict every time it changes
    Watch {
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
    /// Fetch reference images directly from the service (bypasses the daemon)
    Fetch {
        matric_number: String,
        #[arg(
            long,
            env = "FACEVERIFY_API_BASE_URL",
            default_value = "https://pleasant-tie-deer.cyclic.app"
        )]
        api_base_url: String,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Evaluate a recorded detection set against a saved service response
    Compare {
        /// JSON array of detections
        #[arg(long)]
        detections: PathBuf,
        /// Reference service response (`{"images": [...]}`)
        #[arg(long)]
        references: PathBuf,
        #[arg(long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
        #[arg(long, default_value_t = MatchPolicy::First)]
        policy: MatchPolicy,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { matric_number } => {
            connect(cli.system).await?.submit(&matric_number).await?;
            println!("Submitted {matric_number}");
        }
        Commands::Identifier { matric_number } => {
            connect(cli.system).await?.set_identifier(&matric_number).await?;
            println!("Identifier set to {matric_number:?}");
        }
        Commands::Clear => {
            connect(cli.system).await?.clear().await?;
            println!("Session cleared");
        }
        Commands::Verdict => {
            let verdict = connect(cli.system).await?.verdict().await?;
            println!("{}", verdict_message(&verdict));
        }
        Commands::Status => {
            let raw = connect(cli.system).await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Watch { interval_ms } => {
            watch(&connect(cli.system).await?, Duration::from_millis(interval_ms)).await?;
        }
        Commands::Fetch {
            matric_number,
            api_base_url,
            timeout_secs,
        } => fetch(&matric_number, &api_base_url, timeout_secs).await?,
        Commands::Compare {
            detections,
            references,
            threshold,
            policy,
        } => {
            let detections = std::fs::read_to_string(&detections)
                .with_context(|| format!("reading {}", detections.display()))?;
            let references = std::fs::read_to_string(&references)
                .with_context(|| format!("reading {}", references.display()))?;
            let result = compare(&detections, &references, threshold, policy)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            let verdict = if result.matched { "matched" } else { "not_matched" };
            println!("{}", verdict_message(verdict));
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<VerifierProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("cannot connect to D-Bus")?;
    VerifierProxy::new(&conn)
        .await
        .context("faceverifyd is not reachable")
}

async fn watch(proxy: &VerifierProxy<'_>, interval: Duration) -> Result<()> {
    let mut last = String::new();
    loop {
        let verdict = proxy.verdict().await?;
        if verdict != last {
            let now = chrono::Local::now().format("%H:%M:%S");
            println!("[{now}] {}", verdict_message(&verdict));
            last = verdict;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn fetch(matric_number: &str, api_base_url: &str, timeout_secs: u64) -> Result<()> {
    let store = HttpReferenceStore::new(api_base_url, Duration::from_secs(timeout_secs))?;
    println!("POST {}", store.endpoint());

    let set = store.fetch(matric_number).await?;
    println!(
        "{}: {} reference image(s), {} with a usable descriptor",
        set.matric_number,
        set.len(),
        set.usable()
    );
    for (i, record) in set.records.iter().enumerate() {
        let url = record.image_url.as_deref().unwrap_or("-");
        match &record.descriptor {
            Some(d) => println!("  [{i}] {url} ({} components)", d.len()),
            None => println!("  [{i}] {url} (no usable descriptor)"),
        }
    }
    Ok(())
}

fn compare(
    detections: &str,
    references: &str,
    threshold: f32,
    policy: MatchPolicy,
) -> Result<MatchResult> {
    let detections = wire::parse_detection_set_str(detections).context("parsing detections")?;
    let response: FaceVerifyResponse =
        serde_json::from_str(references).context("parsing reference response")?;
    let references = response.into_reference_set("-", chrono::Utc::now());

    tracing::debug!(
        faces = detections.len(),
        references = references.len(),
        usable = references.usable(),
        "comparing"
    );

    Ok(policy.matcher().evaluate(&detections, &references, threshold)?)
}

fn verdict_message(verdict: &str) -> &'static str {
    match verdict {
        "matched" => "Face match found",
        "not_matched" => "No face match found",
        "unavailable" => "Reference images unavailable",
        "pending" => "Waiting for reference images or a camera frame",
        _ => "Unknown verdict",
    }
}
