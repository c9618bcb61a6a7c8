use clap::Parser;
use lan_social_lib::config::{DEFAULT_CHAT_PORT_BASE, DEFAULT_CHAT_PORT_SPAN, DEFAULT_DISCOVERY_PORT};
use lan_social_lib::{
    EngineConfig, Event, JsonFilePeerStore, ManualPeer, Peer, SocialEngine,
};
use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Headless LAN chat node: discovers peers on the local network and chats with them.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Display name shown to other peers (defaults to the hostname)
    #[arg(short, long, env = "LAN_SOCIAL_NAME")]
    name: Option<String>,

    /// UDP discovery port; must match on every node
    #[arg(long, env = "LAN_SOCIAL_DISCOVERY_PORT", default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// First TCP port to try for the chat server
    #[arg(long, env = "LAN_SOCIAL_CHAT_PORT", default_value_t = DEFAULT_CHAT_PORT_BASE)]
    chat_port: u16,

    /// How many chat ports to try
    #[arg(long, default_value_t = DEFAULT_CHAT_PORT_SPAN)]
    chat_port_span: u16,

    /// Address to bind sockets on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// File holding manually added peers
    #[arg(long, env = "LAN_SOCIAL_PEERS_FILE")]
    peers_file: Option<PathBuf>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, env = "LAN_SOCIAL_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lan_social_lib=info,lan_social=info"));
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lan-social.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn print_event(event: &Event) {
    match event {
        Event::PeerUp(p) => println!("+ {} ({}, {:?})", p.name, p.key(), p.source),
        Event::PeerDown(p) => println!("- {} ({})", p.name, p.key()),
        Event::Chat(m) => println!("<{}> {}", m.from, m.text),
        Event::Status(s) => println!("* {}", s),
    }
}

fn print_peers(peers: &[Peer], selected: Option<&Peer>) {
    if peers.is_empty() {
        println!("* no peers yet");
    }
    for (i, p) in peers.iter().enumerate() {
        let mark = if selected.is_some_and(|s| s.same_endpoint(p)) { ">" } else { " " };
        println!("{}{:>3}  {:<20} {:<22} {:?}", mark, i, p.name, p.key(), p.source);
    }
}

fn save(engine: &SocialEngine, store: &JsonFilePeerStore) {
    if let Err(e) = engine.save_manual_peers(store) {
        tracing::error!("Failed to save manual peers to {}: {}", store.path().display(), e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _guard = init_logging(args.log_dir.as_ref());

    let mut config = EngineConfig {
        discovery_port: args.discovery_port,
        chat_port_base: args.chat_port,
        chat_port_span: args.chat_port_span,
        bind_ip: args.bind,
        ..EngineConfig::default()
    };
    if let Some(name) = args.name {
        config = config.with_name(name);
    }

    let store = JsonFilePeerStore::new(args.peers_file.unwrap_or_else(JsonFilePeerStore::default_path));
    let engine = Arc::new(SocialEngine::new(config));
    match engine.load_manual_peers(&store) {
        Ok(n) if n > 0 => tracing::info!("Restored {} manual peers", n),
        Ok(_) => {}
        Err(e) => tracing::warn!("Ignoring manual peers file {}: {}", store.path().display(), e),
    }
    engine.start().await?;

    let printer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(event) = engine.events().recv().await {
                print_event(&event);
            }
        })
    };

    println!(
        "* {} ready. Commands: /peers, /to <n>, /add alias@host:port, /remove host:port, /quit",
        engine.display_name()
    );

    let mut selected: Option<Peer> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "/quit" | "/exit" => break,
            "/peers" => print_peers(&engine.peers(), selected.as_ref()),
            "/to" => {
                let peers = engine.peers();
                match rest.trim().parse::<usize>().ok().and_then(|i| peers.get(i)) {
                    Some(p) => {
                        println!("* talking to {} ({})", p.name, p.key());
                        selected = Some(p.clone());
                    }
                    None => println!("* no such peer; see /peers"),
                }
            }
            "/add" => match rest.parse::<ManualPeer>() {
                Ok(manual) => {
                    engine.add_manual_peer(manual);
                    save(&engine, &store);
                }
                Err(e) => println!("* {}", e),
            },
            "/remove" => match engine.remove_peer(rest.trim()) {
                Some(p) => {
                    if selected.as_ref().is_some_and(|s| s.same_endpoint(&p)) {
                        selected = None;
                    }
                    save(&engine, &store);
                }
                None => println!("* no peer at {}", rest.trim()),
            },
            _ if cmd.starts_with('/') => println!("* unknown command {}", cmd),
            _ => {
                let Some(target) = selected.clone() else {
                    println!("* pick a peer first with /to <n>");
                    continue;
                };
                match engine.send_to_peer(&target, line).await {
                    Ok(used) => {
                        if !used.same_endpoint(&target) {
                            println!("* {} is now at {}", used.name, used.key());
                        }
                        println!("<{}> {}", engine.display_name(), line);
                        selected = Some(used);
                    }
                    Err(e) => println!("* not delivered: {}", e),
                }
            }
        }
    }

    engine.stop().await;
    printer.abort();
    save(&engine, &store);
    Ok(())
}
