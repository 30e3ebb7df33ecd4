//! `tabula`: relay server and headless board console.
//!
//! ```text
//! tabula serve --bind 127.0.0.1:9090 --data ./tabula_data
//! tabula join --server ws://127.0.0.1:9090 --room lobby --name Alice
//! ```
//!
//! Logging is controlled with `RUST_LOG`.

mod console;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use tabula_collab::server::{ServerConfig, SyncServer};
use tabula_collab::session::{BoardSnapshot, Command, Session, SessionConfig};
use tabula_core::MemorySurface;

use console::Input;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Collaborative whiteboard sync
#[derive(Parser, Debug)]
#[command(name = "tabula")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the websocket relay
    Serve {
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,
        /// Persist rooms in this directory
        #[arg(long, value_name = "DIR")]
        data: Option<PathBuf>,
        #[arg(long, default_value_t = 100)]
        max_peers: usize,
    },
    /// Join a room from the terminal
    Join {
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        server: String,
        #[arg(long, default_value = "default")]
        room: String,
        #[arg(long, default_value = "Anonymous")]
        name: String,
        /// Cursor color as #rrggbb (random if omitted)
        #[arg(long)]
        color: Option<String>,
        /// Keep a local copy of the room in this directory
        #[arg(long, value_name = "DIR")]
        cache: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve { bind, data, max_peers } => {
            let config = ServerConfig {
                bind_addr: bind,
                max_peers_per_room: max_peers,
                storage_path: data,
                ..ServerConfig::default()
            };
            let server = SyncServer::new(config)?;
            server.run().await
        }
        Mode::Join {
            server,
            room,
            name,
            color,
            cache,
        } => {
            let config = SessionConfig {
                server_url: server,
                room,
                name,
                color,
                cache_path: cache,
                ..SessionConfig::default()
            };
            join(config).await
        }
    }
}

async fn join(config: SessionConfig) -> Result<(), BoxError> {
    info!("Joining room {} at {}", config.room, config.server_url);
    let mut session = Session::new(config, MemorySurface::new())?;
    session.start().await?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(read_console(tx));
    session.run(rx).await;
    Ok(())
}

/// Forward console lines to the session until `quit`, EOF or Ctrl-C.
async fn read_console(tx: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", console::HELP);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => Ok(None),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Console read failed: {e}");
                break;
            }
        };

        let input = match console::parse(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(msg) => {
                println!("{msg}");
                continue;
            }
        };

        let command = match input {
            Input::Rect => Command::AddRectangle,
            Input::Circle => Command::AddCircle,
            Input::Delete => Command::DeleteLastAdded,
            Input::Move { key, left, top } => Command::MoveShape { key, left, top },
            Input::Cursor { x, y } => Command::Cursor { x, y },
            Input::Help => {
                println!("{}", console::HELP);
                continue;
            }
            Input::Quit => break,
            Input::List => {
                let Some(snapshot) = snapshot(&tx).await else {
                    break;
                };
                print_shapes(&snapshot);
                continue;
            }
            Input::Peers => {
                let Some(snapshot) = snapshot(&tx).await else {
                    break;
                };
                print_peers(&snapshot);
                continue;
            }
        };
        if tx.send(command).await.is_err() {
            return;
        }
    }

    let _ = tx.send(Command::Shutdown).await;
}

async fn snapshot(tx: &mpsc::Sender<Command>) -> Option<BoardSnapshot> {
    let (reply, rx) = oneshot::channel();
    tx.send(Command::Snapshot(reply)).await.ok()?;
    rx.await.ok()
}

fn print_shapes(snapshot: &BoardSnapshot) {
    if snapshot.entries.is_empty() {
        println!("(empty board)");
    }
    for (key, record) in &snapshot.entries {
        println!(
            "{key}  {:<9} at ({:.1}, {:.1})  {}",
            record.kind().to_string(),
            record.left,
            record.top,
            record.fill
        );
    }
}

fn print_peers(snapshot: &BoardSnapshot) {
    if snapshot.others.is_empty() {
        println!("(no one else here)");
    }
    for peer in &snapshot.others {
        match peer.cursor {
            Some(c) => println!("{}  {}  cursor ({:.1}, {:.1})", peer.peer_id, peer.color, c.x, c.y),
            None => println!("{}  {}", peer.peer_id, peer.color),
        }
    }
}
