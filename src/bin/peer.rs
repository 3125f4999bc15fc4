//! # Peer Binary Entry Point
//!
//! Line-based chat front-end around [`PeerNode`].
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin peer -- --config config/alice.toml
//! cargo run --bin peer -- --username bob --port 5002
//! ```
//!
//! The peer will:
//! 1. Start listening on the configured address
//! 2. Announce itself as `online` and dial every configured peer address
//! 3. Read commands from stdin until `exit` or Ctrl-C
//! 4. Announce `offline` and close every connection

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, LevelFilter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use peer_chat::common::config::{load_config, NodeConfig};
use peer_chat::common::logging::init_logger;
use peer_chat::transfer;
use peer_chat::{Inbound, Message, PeerNode};

/// Command-line arguments for the peer binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a node configuration file (TOML format)
    ///
    /// Example: config/alice.toml
    #[arg(short, long)]
    config: Option<String>,

    /// Display name (overrides the configuration file)
    #[arg(short, long)]
    username: Option<String>,

    /// Address to listen on (overrides the configuration file; default 0.0.0.0)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at DEBUG level
    #[arg(short, long)]
    verbose: bool,
}

const DEFAULT_HOST: &str = "0.0.0.0";

const HELP: &str = "
Commands:
    connect <ip> <port>           Connect to a peer at the specified IP and port.
    send <username> <message>     Send a chat message to the specified user.
    group <group> <message>       Send a group message to every connected peer.
    sendfile <username> <path>    Send a file to the specified user.
    list                          List connected peers.
    exit                          Exit the application.
    help                          Show this help message.
";

/// One parsed line of user input.
#[derive(Debug, PartialEq)]
enum Command {
    Connect { host: String, port: u16 },
    Send { recipient: String, content: String },
    Group { group: String, content: String },
    SendFile { recipient: String, path: PathBuf },
    List,
    Help,
    Exit,
    Empty,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, rest)) = tokens.split_first() else {
            return Ok(Command::Empty);
        };

        match name {
            "connect" => {
                let [host, port] = rest else {
                    return Err("Usage: connect <ip> <port>".to_string());
                };
                let port = port
                    .parse()
                    .map_err(|_| "Invalid port number.".to_string())?;
                Ok(Command::Connect {
                    host: host.to_string(),
                    port,
                })
            }
            "send" if rest.len() >= 2 => Ok(Command::Send {
                recipient: rest[0].to_string(),
                content: rest[1..].join(" "),
            }),
            "send" => Err("Usage: send <username> <message>".to_string()),
            "group" if rest.len() >= 2 => Ok(Command::Group {
                group: rest[0].to_string(),
                content: rest[1..].join(" "),
            }),
            "group" => Err("Usage: group <group> <message>".to_string()),
            "sendfile" if rest.len() == 2 => Ok(Command::SendFile {
                recipient: rest[0].to_string(),
                path: PathBuf::from(rest[1]),
            }),
            "sendfile" => Err("Usage: sendfile <username> <path>".to_string()),
            "list" => Ok(Command::List),
            "help" => Ok(Command::Help),
            "exit" => Ok(Command::Exit),
            _ => Err("Unknown command. Type 'help' for a list of commands.".to_string()),
        }
    }
}

/// Build the node configuration from the file and/or command-line flags.
fn resolve_config(args: &Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => load_config::<NodeConfig>(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => {
            let (Some(username), Some(port)) = (&args.username, args.port) else {
                bail!("either --config or both --username and --port are required");
            };
            NodeConfig::new(username.clone(), DEFAULT_HOST, port)
        }
    };

    if let Some(username) = &args.username {
        config.identity.username = username.clone();
    }
    if let Some(host) = &args.host {
        config.identity.host = host.clone();
    }
    if let Some(port) = args.port {
        config.identity.port = port;
    }
    if config.identity.username.trim().is_empty() {
        bail!("username must not be empty");
    }
    Ok(config)
}

/// Render inbound events; file transfers are written to `download_dir`.
async fn print_inbound(mut inbound: mpsc::UnboundedReceiver<Inbound>, download_dir: PathBuf) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Message(Message::GroupChat {
                sender,
                group,
                content,
            }) => println!("[GROUP:{}] {}: {}", group, sender, content),
            Inbound::Message(message @ Message::FileTransfer { .. }) => {
                let dir = download_dir.clone();
                let saved =
                    tokio::task::spawn_blocking(move || transfer::save_file(&dir, &message)).await;
                match saved {
                    Ok(Ok(path)) => println!("[FILE] Received {}", path.display()),
                    Ok(Err(e)) => println!("[WARN] Could not save incoming file: {:#}", e),
                    Err(e) => error!("❌ File save task panicked: {}", e),
                }
            }
            other => println!("{}", other),
        }
    }
}

/// Run one command. Returns `false` when the user asked to exit.
async fn run_command(node: &PeerNode, command: Command) -> bool {
    match command {
        Command::Connect { host, port } => {
            // Failures are logged by the node.
            if let Ok(name) = node.connect_to_peer(&host, port).await {
                println!("Connected to {}.", name);
            }
        }
        Command::Send { recipient, content } => {
            let _ = node.send_chat_message(&recipient, &content).await;
        }
        Command::Group { group, content } => {
            let reached = node.broadcast_group_chat(&group, &content).await;
            println!("[GROUP:{}] {}: {} ({} peer(s))", group, node.username(), content, reached);
        }
        Command::SendFile { recipient, path } => send_file(node, &recipient, &path).await,
        Command::List => {
            let peers = node.list_peers().await;
            if peers.is_empty() {
                println!("No peers connected.");
            } else {
                println!("Connected peers:");
                for peer in peers {
                    println!(" - {}", peer);
                }
            }
        }
        Command::Help => println!("{}", HELP),
        Command::Exit => {
            println!("Exiting...");
            return false;
        }
        Command::Empty => {}
    }
    true
}

async fn send_file(node: &PeerNode, recipient: &str, path: &Path) {
    let limit = node.network().max_frame_bytes;
    match transfer::file_message(node.username(), recipient, path, limit).await {
        Ok(message) => {
            if node.send_structured(recipient, &message).await.is_ok() {
                println!("Sent {} to {}.", path.display(), recipient);
            }
        }
        Err(e) => error!("❌ Could not prepare {}: {:#}", path.display(), e),
    }
}

/// Dial a configured `host:port` string.
async fn dial_configured(node: &PeerNode, address: &str) {
    let Some((host, port)) = address.rsplit_once(':') else {
        error!("❌ Peer address {} is not host:port", address);
        return;
    };
    match port.parse::<u16>() {
        Ok(port) => {
            let _ = node.connect_to_peer(host, port).await;
        }
        Err(_) => error!("❌ Peer address {} has an invalid port", address),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logger(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let config = resolve_config(&args)?;
    let node = PeerNode::new(config.clone());

    let blocked = config.admission.blocked.clone();
    if !blocked.is_empty() {
        node.set_admission(move |name, _addr| !blocked.iter().any(|b| b == name));
    }

    let inbound = node.subscribe();
    tokio::spawn(print_inbound(
        inbound,
        PathBuf::from(&config.transfer.download_dir),
    ));

    // A bind failure aborts startup.
    node.start_server().await?;
    node.broadcast_presence("online").await;

    for address in &config.peers.addresses {
        dial_configured(&node, address).await;
    }

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(command) => {
                        if !run_command(&node, command).await {
                            break;
                        }
                    }
                    Err(usage) => println!("{}", usage),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Reading input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted. Exiting...");
                break;
            }
        }
    }

    node.shutdown().await;
    // Give writer tasks a moment to flush the offline notice.
    tokio::time::sleep(Duration::from_millis(500)).await;

    Ok(())
}
