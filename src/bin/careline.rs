use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use careline::database::Database;
use careline::{
    MessageId, MessagingConfig, MessagingService, Role, SqliteUserDirectory, User, UserId,
};

/// Operator CLI for the careline messaging core
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data (falls back to CARELINE_DATA_DIR)
    #[clap(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Directory for application logs (falls back to CARELINE_LOGS_DIR)
    #[clap(long, value_name = "PATH")]
    logs_dir: Option<PathBuf>,

    /// Print results as JSON
    #[clap(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update a portal user
    AddUser {
        id: String,
        role: Role,
        display_name: String,
        #[clap(long)]
        avatar: Option<String>,
    },
    /// Send a message
    Send {
        from: String,
        to: String,
        content: String,
    },
    /// List a user's conversations, most recent first
    Conversations { user: String },
    /// Show the merged conversation between two users
    Messages { viewer: String, partner: String },
    /// Mark a message read
    Read { message_id: String },
    /// Users someone may message, optionally filtered by name
    Recipients {
        user: String,
        #[clap(default_value = "")]
        query: String,
    },
}

fn load_config(args: &Args) -> Result<MessagingConfig> {
    match &args.data_dir {
        Some(data_dir) => {
            let logs_dir = args
                .logs_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("logs"));
            Ok(MessagingConfig::new(data_dir, &logs_dir))
        }
        None => MessagingConfig::from_env()
            .context("Pass --data-dir or set CARELINE_DATA_DIR"),
    }
}

async fn add_user(config: &MessagingConfig, user: User) -> Result<()> {
    std::fs::create_dir_all(&config.logs_dir)
        .with_context(|| format!("Failed to create logs directory: {:?}", config.logs_dir))?;
    careline::init_tracing(&config.logs_dir)?;

    let database = Database::new(config.database_path()).await?;
    SqliteUserDirectory::new(Arc::new(database))
        .upsert_user(&user)
        .await?;
    Ok(())
}

/// Tracing may not be installed yet when this fails, so the error is
/// returned for `main` to print.
async fn open_service(config: MessagingConfig) -> Result<MessagingService> {
    let data_dir = config.data_dir.clone();
    MessagingService::initialize(config)
        .await
        .with_context(|| format!("Failed to initialize careline in {data_dir:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = load_config(&args)?;

    if let Command::AddUser {
        id,
        role,
        display_name,
        avatar,
    } = &args.command
    {
        let mut user = User::new(id.as_str(), *role, display_name.as_str());
        if let Some(avatar) = avatar {
            user = user.with_avatar(avatar.as_str());
        }
        add_user(&config, user.clone()).await?;
        println!("{} {} ({})", user.id, user.display_name, user.role);
        return Ok(());
    }

    let service = open_service(config).await?;

    match &args.command {
        Command::AddUser { .. } => {}
        Command::Send { from, to, content } => {
            let message = service
                .send_message(&UserId::from(from.as_str()), &UserId::from(to.as_str()), content)
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&message)?);
            } else {
                println!("{} sent at {}", message.id, message.created_at);
            }
        }
        Command::Conversations { user } => {
            let rows = service
                .list_conversations(&UserId::from(user.as_str()))
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!(
                        "{:<24} unread {:>3}  {}  {}",
                        row.counterparty.display_name,
                        row.unread_count,
                        row.last_message.created_at.format("%Y-%m-%d %H:%M"),
                        row.last_message.content
                    );
                }
            }
        }
        Command::Messages { viewer, partner } => {
            let view = service
                .get_messages(
                    &UserId::from(viewer.as_str()),
                    &UserId::from(partner.as_str()),
                )
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                for entry in view {
                    let marker = if entry.message.read { ' ' } else { '*' };
                    println!(
                        "{} {} {:?} {}: {}",
                        marker,
                        entry.message.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                        entry.direction,
                        entry.message.sender_id,
                        entry.message.content
                    );
                }
            }
        }
        Command::Read { message_id } => {
            let transition = service
                .mark_as_read(&MessageId::from(message_id.as_str()))
                .await?;
            println!("{transition:?}");
        }
        Command::Recipients { user, query } => {
            let recipients = service
                .search_recipients(&UserId::from(user.as_str()), query)
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&recipients)?);
            } else {
                for recipient in recipients {
                    println!(
                        "{:<16} {:<8} {}",
                        recipient.id.as_str(),
                        recipient.role.as_str(),
                        recipient.display_name
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_service_failure_names_the_data_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let config = MessagingConfig::new(&blocker, &temp_dir.path().join("logs"));

        let err = match open_service(config).await {
            Ok(_) => panic!("open_service should fail when the data dir is a file"),
            Err(err) => err,
        };

        let report = format!("{err:#}");
        assert!(report.contains("Failed to initialize careline"));
        assert!(report.contains("occupied"));
        assert!(report.contains("Failed to create data directory"));
    }

    #[test]
    fn data_dir_flag_defaults_logs_beside_it() {
        let args = Args::parse_from(["careline", "--data-dir", "/tmp/cl", "conversations", "p1"]);
        let config = load_config(&args).unwrap();
        let suffix = if cfg!(debug_assertions) { "dev" } else { "release" };

        assert_eq!(config.data_dir, PathBuf::from("/tmp/cl").join(suffix));
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/cl/logs").join(suffix));
    }
}
