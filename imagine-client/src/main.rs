use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imagine_client::{
    sanitize_prompt, ClientConfig, GenerateRequest, ImagineClient, DEFAULT_BASE_URL,
    DEFAULT_OUTPUT_DIR,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Client for the imagine generation server")]
struct Args {
    /// Server base URL
    #[arg(long, env = "IMAGINE_URL", default_value = DEFAULT_BASE_URL)]
    url: String,

    /// Bearer token sent with every request
    #[arg(long, env = "VALID_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Directory for generated images and history
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 180)]
    timeout: u64,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show server health
    Health,
    /// Show models and system status
    Info,
    /// Show one model's status
    ModelInfo { model: String },
    /// Force a model reload
    Reload { model: String },
    /// Generate an image
    Generate {
        prompt: String,
        #[arg(long, default_value = "sdxl")]
        model: String,
        #[arg(long, default_value_t = 512)]
        img_size: u32,
        #[arg(long)]
        guidance_scale: Option<f64>,
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
        /// Models to try when the primary is unavailable or fails
        #[arg(long = "fallback", value_delimiter = ',')]
        fallbacks: Vec<String>,
    },
    /// List generation history
    History {
        /// Only entries whose prompt contains this text
        #[arg(long)]
        search: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("imagine_client={},imagine={}", args.log_level, args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let client = ImagineClient::new(ClientConfig {
        base_url: args.url,
        token: args.token.filter(|token| !token.is_empty()),
        output_dir: args.output_dir,
        timeout: Duration::from_secs(args.timeout),
        ..ClientConfig::default()
    })
    .context("failed to create client")?;

    match args.command {
        Command::Health => print_json(&client.check_health().await?)?,
        Command::Info => print_json(&client.server_info().await?)?,
        Command::ModelInfo { model } => print_json(&client.model_info(&model).await?)?,
        Command::Reload { model } => print_json(&client.reload_model(&model).await?)?,
        Command::Generate {
            prompt,
            model,
            img_size,
            guidance_scale,
            steps,
            seed,
            fallbacks,
        } => {
            let prompt = sanitize_prompt(&prompt)?;
            let request = GenerateRequest {
                img_size,
                guidance_scale,
                num_inference_steps: steps,
                seed,
                ..GenerateRequest::new(prompt, model).with_fallbacks(fallbacks)
            };
            let image = client.generate_image(&request).await?;
            println!("{} ({})", image.path.display(), image.model);
        }
        Command::History { search } => {
            let entries = match search {
                Some(term) => client.history_store().search(&term),
                None => client.history(),
            };
            print_json(&entries)?;
        }
    }

    Ok(())
}
