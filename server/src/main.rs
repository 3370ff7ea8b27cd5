use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usenetfs::{
    inspect_nzb_content, select_stream, stream_file, stream_file_by_name, Manager, Nzb,
    SegmentFetcher, Stream, StreamConfig, UsenetConfig,
};

mod settings;

#[derive(Parser, Debug)]
#[command(name = "usenet-stream", about = "Stream video straight out of Usenet posts", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Settings file holding the provider list
    #[arg(short, long, global = true, default_value = "settings.json")]
    settings: PathBuf,

    /// Password for encrypted archives
    #[arg(long, global = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content tree of an NZB as JSON
    Inspect {
        nzb: PathBuf,
    },
    /// Write the playable file of an NZB to a file or stdout
    Cat {
        nzb: PathBuf,

        /// Stream the file with this name instead of picking one
        #[arg(long, conflicts_with = "index")]
        name: Option<String>,

        /// Stream the file at this position in the NZB
        #[arg(long)]
        index: Option<usize>,

        /// Output path, stdout when omitted
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write a settings file with default values
    InitSettings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usenet_stream=info,usenetfs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Command::InitSettings => {
            settings::save_settings(&args.settings, &UsenetConfig::default()).await
        }
        Command::Inspect { ref nzb } => {
            let nzb = read_nzb(nzb).await?;
            let (manager, config) = connect(&args).await;
            let content = inspect_nzb_content(&nzb, manager.clone(), &config).await;
            manager.close().await;
            println!("{}", serde_json::to_string_pretty(&content)?);
            Ok(())
        }
        Command::Cat {
            ref nzb,
            ref name,
            index,
            ref out,
        } => {
            let nzb = read_nzb(nzb).await?;
            let (manager, config) = connect(&args).await;
            let result = cat(&nzb, manager.clone(), name.as_deref(), index, out.as_deref(), &config).await;
            manager.close().await;
            result
        }
    }
}

async fn cat(
    nzb: &Nzb,
    fetcher: Arc<dyn SegmentFetcher>,
    name: Option<&str>,
    index: Option<usize>,
    out: Option<&Path>,
    config: &StreamConfig,
) -> anyhow::Result<()> {
    let stream = match (name, index) {
        (Some(name), _) => stream_file_by_name(nzb, fetcher, name, config).await?,
        (None, Some(idx)) => stream_file(nzb, fetcher, idx, config).await?,
        (None, None) => select_stream(nzb, fetcher, config).await?,
    };
    copy_stream(stream, out).await
}

async fn read_nzb(path: &Path) -> anyhow::Result<Nzb> {
    usenetfs::nzb::parse_file(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

async fn connect(args: &Args) -> (Arc<Manager>, StreamConfig) {
    let settings = settings::load_settings(&args.settings);
    if settings.providers.is_empty() {
        tracing::warn!("no providers configured in {:?}", args.settings);
    }
    let config = StreamConfig {
        password: args.password.clone(),
        segment_buffer_size: settings.segment_buffer_size,
    };
    (Arc::new(Manager::from_config(&settings).await), config)
}

async fn copy_stream(mut stream: Stream, out: Option<&Path>) -> anyhow::Result<()> {
    tracing::info!(
        name = %stream.name,
        size = stream.size,
        content_type = stream.content_type,
        "streaming"
    );
    let copied = match out {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            let copied = tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            copied
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let copied = tokio::io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
            copied
        }
    };
    tracing::info!(bytes = copied, "done");
    Ok(())
}
