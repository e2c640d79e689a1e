// monkey: command-line client for the Monkey messaging platform
//
// Thin host around monkey-core: loads credentials from the config dir, runs
// a client and prints what arrives.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use monkey_core::{Message, MonkeyClient, MonkeyEvent, PushSpec};
use serde_json::Value;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "monkey")]
#[command(about = "Monkey — encrypted messaging client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a session and remember its id
    Init,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Stay connected, printing events; read commands from stdin
    Listen,
    /// Send a single message
    Send {
        recipient: String,
        message: String,
        /// Encrypt with the session key
        #[arg(short, long)]
        encrypt: bool,
        /// Push notification text for offline recipients
        #[arg(short, long)]
        push: Option<String>,
    },
    /// Show the messages of a conversation
    History {
        conversation: String,
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Only messages older than this id
        #[arg(short, long)]
        since: Option<i64>,
    },
    /// List conversations
    Conversations,
    /// Show user or group (G:...) info
    Info { id: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config { action } => cmd_config(action).await,
        Commands::Listen => cmd_listen().await,
        Commands::Send {
            recipient,
            message,
            encrypt,
            push,
        } => cmd_send(recipient, message, encrypt, push).await,
        Commands::History {
            conversation,
            limit,
            since,
        } => cmd_history(conversation, limit, since).await,
        Commands::Conversations => cmd_conversations().await,
        Commands::Info { id } => cmd_info(id).await,
    }
}

/// Build a client from the config and run the handshake. The session id is
/// persisted so the next run resumes it.
async fn connect(config: &mut config::Config) -> Result<MonkeyClient> {
    let client = MonkeyClient::with_defaults(config.client_config()?)
        .context("Failed to create client")?;
    let session_id = client.init().await.context("Failed to start session")?;

    if config.session_id.as_deref() != Some(session_id.as_str()) {
        tracing::info!(session_id = %session_id, "New session assigned");
        config.session_id = Some(session_id);
        config.save()?;
    }
    Ok(client)
}

async fn cmd_init() -> Result<()> {
    println!("{}", "Initializing Monkey session...".bold());
    println!();

    let mut config = config::Config::load()?;
    println!("  {} Configuration", "✓".green());

    let client = connect(&mut config).await?;
    let session_id = client.session_id().unwrap_or_default();
    println!("  {} Session established", "✓".green());
    println!();

    println!("{}", "Session Information:".bold());
    println!("  Session ID: {}", session_id.bright_cyan());
    println!("  Domain:     {}", config.domain.bright_yellow());
    println!();

    println!("{}", "Next steps:".bold());
    println!("  • Send:   {}", "monkey send <recipient> <message>".bright_green());
    println!("  • Listen: {}", "monkey listen".bright_green());

    client.disconnect().await;
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {}", "✓".green(), key.bright_cyan());
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}

async fn cmd_listen() -> Result<()> {
    let mut config = config::Config::load()?;
    let client = Arc::new(connect(&mut config).await?);
    let mut events = client.subscribe_events();

    println!("{}", "Monkey — Listening".bold());
    println!();
    println!(
        "Session: {}",
        client.session_id().unwrap_or_default().bright_cyan()
    );
    println!();
    println!("{}", "Commands:".bold());
    println!("  {} <recipient> <message>", "send".bright_green());
    println!("  {} <recipient> <message>", "secure".bright_green());
    println!("  {} <conversation>", "open".bright_green());
    println!("  {} <channel>", "sub".bright_green());
    println!("  {}", "pending".bright_green());
    println!("  {}", "quit".bright_green());
    println!();

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
            prompt();
        }
    });

    let stdin_client = client.clone();
    let stdin_task = tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        prompt();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();

            if line.is_empty() {
                prompt();
                continue;
            }

            if line == "quit" || line == "exit" {
                println!("Shutting down...");
                break;
            }

            if let Err(e) = run_command(&stdin_client, line).await {
                println!("{} {:#}", "✗".red(), e);
            }
            prompt();
        }
    });

    tokio::select! {
        _ = event_task => {}
        _ = stdin_task => {}
    }

    client.disconnect().await;
    Ok(())
}

async fn run_command(client: &MonkeyClient, line: &str) -> Result<()> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    match parts.as_slice() {
        ["send", to, text] => {
            let sent = client.send_message(text, to, None, PushSpec::None).await?;
            println!("{} Sent ({})", "✓".green(), sent.id);
        }
        ["secure", to, text] => {
            let sent = client
                .send_encrypted_message(text, to, None, PushSpec::None)
                .await?;
            println!("{} Sent encrypted ({})", "✓".green(), sent.id);
        }
        ["open", conversation] => {
            client.open_conversation(conversation).await?;
            println!("{} Opened {}", "✓".green(), conversation.bright_cyan());
        }
        ["sub", channel] => {
            client.subscribe(channel).await?;
        }
        ["pending"] => {
            client.get_pending_messages().await?;
        }
        _ => println!("Try: send, secure, open, sub, pending, quit"),
    }
    Ok(())
}

async fn cmd_send(
    recipient: String,
    message: String,
    encrypt: bool,
    push: Option<String>,
) -> Result<()> {
    let mut config = config::Config::load()?;
    let client = connect(&mut config).await?;

    let push = push.as_deref().map(PushSpec::from).unwrap_or_default();
    let result = if encrypt {
        client
            .send_encrypted_message(&message, &recipient, None, push)
            .await
    } else {
        client.send_message(&message, &recipient, None, push).await
    };
    let sent = result.context("Failed to send message")?;

    if sent.is_confirmed() {
        println!("{} Message {} delivered to server", "✓".green(), sent.id);
    } else {
        println!("{} Message queued ({})", "✓".green(), sent.id);
    }

    client.disconnect().await;
    Ok(())
}

async fn cmd_history(conversation: String, limit: u32, since: Option<i64>) -> Result<()> {
    let mut config = config::Config::load()?;
    let client = connect(&mut config).await?;
    let me = client.session_id().unwrap_or_default();

    let messages = client
        .get_conversation_messages(&conversation, limit, since)
        .await
        .context("Failed to fetch history")?;

    if messages.is_empty() {
        println!("{}", "No messages found.".dimmed());
    } else {
        println!("{} ({} messages)", "Message History".bold(), messages.len());
        println!();

        for msg in &messages {
            let direction = if msg.sender_id == me {
                "→".bright_green()
            } else {
                "←".bright_blue()
            };
            println!(
                "{} {} [{}]",
                direction,
                msg.sender_id.bright_cyan(),
                format_timestamp(msg.datetime_creation).dimmed()
            );
            println!("   {}", display_text(msg));
            println!();
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn cmd_conversations() -> Result<()> {
    let mut config = config::Config::load()?;
    let client = connect(&mut config).await?;

    let conversations = client.get_conversations().await?;
    print_json(&conversations);

    client.disconnect().await;
    Ok(())
}

async fn cmd_info(id: String) -> Result<()> {
    let mut config = config::Config::load()?;
    let client = connect(&mut config).await?;

    let info = client.get_info(&id).await?;
    println!("{} {}", "Info".bold(), id.bright_cyan());
    print_json(&info);

    client.disconnect().await;
    Ok(())
}

fn print_event(event: &MonkeyEvent) {
    match event {
        MonkeyEvent::Session { session_id } => {
            println!("\n{} Session {}", "✓".green(), session_id.bright_cyan());
        }
        MonkeyEvent::Connect { .. } => println!("\n{} Connected", "✓".green()),
        MonkeyEvent::Disconnect { clean } => {
            if *clean {
                println!("\n{} Disconnected", "•".dimmed());
            } else {
                println!("\n{} Connection lost, reconnecting", "✗".red());
            }
        }
        MonkeyEvent::Message(msg) => {
            println!("\n{} {}: {}", "←".bright_blue(), msg.sender_id.bright_cyan(), display_text(msg));
        }
        MonkeyEvent::ChannelMessage(msg) => {
            println!(
                "\n{} [{}] {}: {}",
                "←".bright_blue(),
                msg.recipient_id.bright_yellow(),
                msg.sender_id.bright_cyan(),
                display_text(msg)
            );
        }
        MonkeyEvent::Notification(msg) => {
            println!("\n{} {} {}", "•".bright_magenta(), msg.sender_id.bright_cyan(), msg.params);
        }
        MonkeyEvent::Acknowledge(ack) => {
            let status = ack
                .delivery_status
                .map(|s| format!("{:?}", s).to_lowercase())
                .unwrap_or_else(|| "acknowledged".to_string());
            println!("\n{} {} {}", "✓".green(), ack.id, status.dimmed());
        }
        MonkeyEvent::Subscribe { channel, .. } => {
            println!("\n{} Subscribed to {}", "✓".green(), channel.bright_yellow());
        }
    }
}

fn display_text(msg: &Message) -> String {
    match (&msg.text, msg.props.filename.as_deref()) {
        (_, Some(filename)) => format!("<file {}>", filename),
        (Some(text), None) => text.clone(),
        (None, None) => "<encrypted>".to_string(),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn format_timestamp(timestamp: i64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}
