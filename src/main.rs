use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;

mod utils;

use roshlingua::backend::{DeliveryService, PresenceTracker, RestPresenceSource, SendOutcome};
use roshlingua::config::ClientConfig;
use roshlingua::models::{MessageType, OutgoingMessage, PresenceStatus};
use roshlingua::notifications::PushNotification;
use roshlingua::session::{clear_session, load_session, save_session, Session, StoredSession};
use roshlingua::storage::{FileStorage, LocalStorage};

/// Command line arguments for roshlingua
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "roshlingua: send chat messages with offline queueing and check presence."
)]
struct Args {
    /// Directory holding the message queue and session
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the session used for authenticated requests
    Login {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        token: String,
        /// Seconds until the token expires
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Forget the stored session
    Logout,
    /// Send a message, queueing it if the backend cannot be reached
    Send {
        #[arg(long)]
        conversation: String,
        content: String,
        #[arg(long, value_enum, default_value = "text")]
        kind: Kind,
        #[arg(long)]
        media_url: Option<String>,
    },
    /// Retry every queued message once
    Flush,
    /// List queued messages
    Queue {
        /// Drop every queued message
        #[arg(long)]
        clear: bool,
    },
    /// Show who of the given users is online
    Presence {
        #[arg(required = true)]
        user_ids: Vec<String>,
    },
    /// Show how a push payload would be displayed
    Notify {
        payload: Option<String>,
        /// URLs of windows that are already open
        #[arg(long = "open")]
        open_windows: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Text,
    Image,
    Audio,
    File,
}

impl From<Kind> for MessageType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Text => MessageType::Text,
            Kind::Image => MessageType::Image,
            Kind::Audio => MessageType::Audio,
            Kind::File => MessageType::File,
        }
    }
}

/// Load configuration and open local storage and the stored session
fn open_context(data_dir: Option<PathBuf>) -> Result<(ClientConfig, Arc<dyn LocalStorage>, Arc<StoredSession>)> {
    let config = ClientConfig::load(data_dir)?;
    let storage: Arc<dyn LocalStorage> = Arc::new(FileStorage::new(&config.data_dir)?);
    let session = Arc::new(StoredSession::new(storage.clone()));
    Ok((config, storage, session))
}

fn status_label(status: PresenceStatus) -> &'static str {
    match status {
        PresenceStatus::Online => "online",
        PresenceStatus::Away => "away",
        PresenceStatus::Offline => "offline",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    utils::setup_logging(args.log_file.as_deref(), level)?;

    match args.command {
        Command::Login { user_id, token, expires_in } => {
            let (_, storage, _) = open_context(args.data_dir)?;
            let expires_at = expires_in.map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs));
            save_session(storage.as_ref(), &Session::new(&user_id, &token, expires_at))?;
            println!("Signed in as {}", user_id);
        }
        Command::Logout => {
            let (_, storage, _) = open_context(args.data_dir)?;
            clear_session(storage.as_ref())?;
            println!("Signed out");
        }
        Command::Send { conversation, content, kind, media_url } => {
            let (config, storage, session) = open_context(args.data_dir)?;
            let current = load_session(storage.as_ref())?.ok_or_else(|| anyhow!("Not signed in; run `login` first"))?;
            let mut message = OutgoingMessage::text(&conversation, &current.user_id, &content);
            if let Some(url) = media_url {
                message = message.with_media(kind.into(), &url);
            } else {
                message.message_type = kind.into();
            }

            let service = DeliveryService::from_config(&config, storage.clone(), session, true)?;
            // Anything left over from earlier runs goes first
            service.outbox().flush().await;

            match service.outbox().send(message).await {
                Ok(SendOutcome::Delivered(delivered)) => {
                    println!("Sent (message {}, via {} path)", delivered.row.id, delivered.path);
                }
                Ok(SendOutcome::Queued { message_id }) => {
                    println!("Backend unreachable; message {} queued for retry", message_id);
                }
                Err(e) => {
                    error!("Send failed: {}", e);
                    service.shutdown().await;
                    return Err(anyhow!("Message could not be sent. Please try again."));
                }
            }
            service.shutdown().await;
        }
        Command::Flush => {
            let (config, storage, session) = open_context(args.data_dir)?;
            let service = DeliveryService::from_config(&config, storage, session, true)?;
            let report = service.outbox().flush().await;
            println!(
                "{} delivered, {} still queued, {} dropped",
                report.delivered,
                service.outbox().pending_count().await,
                report.dropped
            );
            service.shutdown().await;
        }
        Command::Queue { clear } => {
            let (config, storage, session) = open_context(args.data_dir)?;
            let service = DeliveryService::from_config(&config, storage, session, false)?;
            if clear {
                service.outbox().clear().await;
                println!("Queue cleared");
            } else {
                let pending = service.outbox().pending().await;
                if pending.is_empty() {
                    println!("No queued messages");
                }
                for queued in pending {
                    println!(
                        "{}  {}  retries={}  {}",
                        queued.message.id, queued.message.created_at.to_rfc3339(), queued.retries, queued.message.content
                    );
                }
            }
            service.shutdown().await;
        }
        Command::Presence { user_ids } => {
            let (config, _, session) = open_context(args.data_dir)?;
            let source = Arc::new(RestPresenceSource::new(&config, session)?);
            let mut tracker = PresenceTracker::new(source, config.presence_stale_after);
            tracker.track(user_ids.iter().cloned()).await?;
            for user_id in &user_ids {
                let state = match tracker.record(user_id) {
                    Some(record) if tracker.is_user_online(user_id) => format!("online (updated {})", record.updated_at),
                    Some(record) => format!("{}, last seen {}", status_label(record.status), record.last_seen),
                    None => "unknown".to_string(),
                };
                println!("{}: {}", user_id, state);
            }
            tracker.stop();
        }
        Command::Notify { payload, open_windows } => {
            let notification = PushNotification::from_payload(payload.as_deref());
            println!("{}\n{}", notification.title, notification.body);
            println!("on click: {:?}", notification.resolve_click(&open_windows));
        }
    }

    info!("Done");
    Ok(())
}
