use anyhow::Result;
use clap::Parser;
use solace::cli::{Cli, Commands};
use solace::config::AppConfig;
use solace::store::{StoreHandle, TranscriptStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("solace=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    cli.apply_to(&mut config);

    match cli.command {
        Commands::Serve { .. } => {
            solace::server::run(config).await?;
        }

        Commands::History { session } => {
            let store = StoreHandle::new(TranscriptStore::open(&config.db_path)?);
            let messages = store.messages_for_session(&session).await?;
            if messages.is_empty() {
                println!("No messages in session '{}'", session);
            }
            for message in &messages {
                println!(
                    "[{}] {:>9}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.role.as_str(),
                    message.content
                );
            }
        }

        Commands::Clear { session } => {
            let store = StoreHandle::new(TranscriptStore::open(&config.db_path)?);
            let removed = store.clear_session(&session).await?;
            println!("Cleared {} message(s) from session '{}'", removed, session);
        }
    }

    Ok(())
}
