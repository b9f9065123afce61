use clap::Parser;
use tracing_subscriber::EnvFilter;
use waengine_server::{Args, ServerConfig, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "waengine=info,waengine_server=info,libwaengine=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args)?;
    server::run(config).await
}
