/// ChatSync client - main entry point
use chatsync_core::{ChatClient, ChatEvent, Config};
use std::env;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let client = ChatClient::from_config(config)?;
    let me = client
        .sign_in()
        .await
        .map_err(|e| anyhow::anyhow!("Sign-in failed: {}", e))?;
    info!("Signed in as {} (id {})", me.username, me.id);

    let mut events = client.subscribe();
    client.start().await?;

    for summary in client.conversations().await {
        info!(
            "  {} [{}] unread={}",
            summary.display_name, summary.id, summary.unread_count
        );
    }

    let terminate = wait_for_shutdown();
    tokio::pin!(terminate);
    loop {
        tokio::select! {
            _ = &mut terminate => break,
            event = events.recv() => match event {
                Ok(ChatEvent::SessionExpired) => {
                    warn!("Session expired, sign in again");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

fn log_event(event: &ChatEvent) {
    match event {
        ChatEvent::MessageAdded { key, message } => info!(
            "[{}] {}: {}",
            key,
            message
                .sender
                .username
                .as_deref()
                .unwrap_or("?"),
            message.content
        ),
        ChatEvent::ConnectionChanged { state } => info!("Connection: {:?}", state),
        ChatEvent::PresenceChanged { user_id, presence } => {
            info!("User {} is now {:?}", user_id, presence)
        }
        ChatEvent::TypingChanged {
            key,
            entry: Some(entry),
        } => info!("[{}] {} is typing", key, entry.display_name),
        other => tracing::debug!("{:?}", other),
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
