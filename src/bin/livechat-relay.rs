use clap::Parser;
use livechat_relay::{
    utils, ChannelId, ConfigManager, FeedClient, InnerTubeClient, ReplayFeedClient,
    SessionRegistry, SubscriberEvent,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

/// livechat-relay: follow a channel's live chat and print it as NDJSON
#[derive(Parser, Debug)]
#[command(name = "livechat-relay")]
#[command(about = "Follow a channel's live chat and print normalized messages as NDJSON", long_about = None)]
struct Cli {
    /// Channel id (UC...), @handle, video id or watch URL
    channel: String,

    /// Config file (defaults to the XDG config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay recorded batches from an NDJSON file instead of YouTube
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Log level override (trace/debug/info/warn/error)
    #[arg(long)]
    log_level: Option<String>,

    /// Minimum interval between polls in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = config_manager.load_config()?;
    if let Some(level) = &cli.log_level {
        config.log.log_level = level.clone();
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.engine.poll_interval_ms = interval;
    }

    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _guard = utils::init_logging(&config.log)?;

    let channel = ChannelId::new(cli.channel.clone());
    match &cli.replay {
        Some(path) => {
            tracing::info!("📼 Replaying {} as {}", path.display(), channel);
            // 録画の再生が終わったらすぐに終了する
            config.engine.backoff.max_not_found_attempts = 1;
            config.engine.backoff.not_found_delay_ms = 0;
            let client = Arc::new(ReplayFeedClient::from_file(path)?);
            run(client, config.engine, channel).await
        }
        None => {
            tracing::info!("🎬 Following live chat of {}", channel);
            run(Arc::new(InnerTubeClient::new()), config.engine, channel).await
        }
    }
}

async fn run<C: FeedClient>(
    client: Arc<C>,
    config: livechat_relay::EngineConfig,
    channel: ChannelId,
) -> anyhow::Result<()> {
    let registry = SessionRegistry::new(client, config);
    let subscriber = registry.subscriber();
    let handle = registry.attach(channel, &subscriber);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stdout = std::io::stdout().lock();
    loop {
        tokio::select! {
            event = subscriber.recv() => match event {
                Some(SubscriberEvent::Batch(batch)) => {
                    for message in batch.iter() {
                        serde_json::to_writer(&mut stdout, message)?;
                        stdout.write_all(b"\n")?;
                    }
                    stdout.flush()?;
                }
                Some(SubscriberEvent::Status(status)) => {
                    tracing::info!("📢 {}", status);
                }
                None => break,
            },
            _ = &mut ctrl_c => {
                tracing::info!("🛑 終了シグナルを受信しました");
                break;
            }
        }
    }

    registry.detach(&handle, &subscriber);
    registry.shutdown().await;
    tracing::info!("👋 livechat-relay shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_is_required() {
        assert!(Cli::try_parse_from(["livechat-relay"]).is_err());
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["livechat-relay", "@someone"]).unwrap();
        assert_eq!(cli.channel, "@someone");
        assert!(cli.config.is_none());
        assert!(cli.replay.is_none());
        assert!(cli.log_level.is_none());
        assert!(cli.poll_interval_ms.is_none());
    }

    #[test]
    fn test_replay_and_overrides() {
        let cli = Cli::try_parse_from([
            "livechat-relay",
            "C1",
            "--replay",
            "/tmp/chat.ndjson",
            "--log-level",
            "debug",
            "--poll-interval-ms",
            "100",
        ])
        .unwrap();
        assert_eq!(cli.replay, Some(PathBuf::from("/tmp/chat.ndjson")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.poll_interval_ms, Some(100));
    }
}
