use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face verification CLI")]
struct Cli {
    /// Base URL of the facegated server.
    #[arg(long, default_value = "http://127.0.0.1:5000", global = true)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new identity from a face photo
    Register {
        /// Identity name (letters, numbers, underscores, hyphens)
        name: String,
        /// Path to a JPEG or PNG face photo
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Verify a face photo against the registered gallery
    Verify {
        /// Path to a JPEG or PNG face photo
        #[arg(short, long)]
        image: PathBuf,
    },
    /// List registered identities
    List,
    /// Show server status
    Status,
}

/// Read an image file and return its base64 form for the JSON payload.
fn encode_image(path: &PathBuf) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn print_response(status: reqwest::StatusCode, body: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&body)?);
    if status.is_server_error() {
        anyhow::bail!("server error: HTTP {status}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Register { name, image } => {
            let payload = serde_json::json!({
                "name": name,
                "image": encode_image(&image)?,
            });
            let response = client
                .post(format!("{}/register", cli.server))
                .json(&payload)
                .send()
                .await
                .context("facegated unreachable")?;
            print_response(response.status(), response.json().await?)?;
        }
        Commands::Verify { image } => {
            let payload = serde_json::json!({ "image": encode_image(&image)? });
            let response = client
                .post(format!("{}/verify", cli.server))
                .json(&payload)
                .send()
                .await
                .context("facegated unreachable")?;
            print_response(response.status(), response.json().await?)?;
        }
        Commands::List => {
            let response = client
                .get(format!("{}/identities", cli.server))
                .send()
                .await
                .context("facegated unreachable")?;
            print_response(response.status(), response.json().await?)?;
        }
        Commands::Status => {
            let response = client
                .get(format!("{}/health", cli.server))
                .send()
                .await
                .context("facegated unreachable")?;
            print_response(response.status(), response.json().await?)?;
        }
    }

    Ok(())
}
