use crate::config::{CHAT_READ_TIMEOUT, MAX_CHAT_LINE, SEND_TIMEOUT};
use crate::error::{EngineError, Result};
use crate::events::{ChatMessage, Event, EventSender};
use crate::identity::NodeId;
use crate::peer::Peer;
use crate::protocol::{now_ts, ChatPayload, Packet};
use crate::resolver::Candidate;
use crate::state::PeerTable;
use futures::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Receiving side of chat: one JSON line (or a few) per inbound connection.
pub struct ChatInbox {
    pub node_id: NodeId,
    pub peers: PeerTable,
    pub events: EventSender,
}

impl ChatInbox {
    /// Handles one line of an inbound connection from `from`.
    /// Returns the message if it was a valid chat packet.
    pub fn receive_line(&self, line: &str, from: IpAddr) -> Option<ChatMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(Packet::Chat(chat)) = Packet::from_bytes(line.as_bytes()) else {
            tracing::debug!("Dropping non-chat line from {}", from);
            return None;
        };

        let host = from.to_string();
        // The reply port is the only way to learn where the sender's own chat server lives.
        if chat.reply_port > 0 && !self.node_id.is(&chat.node_id) {
            let peer = Peer::lan(chat.from.as_str(), host.as_str(), chat.reply_port, chat.node_id.as_str());
            self.peers.upsert(peer.clone()).notify(&peer, &self.events);
        }

        let from_name = if chat.from.trim().is_empty() {
            host.clone()
        } else {
            chat.from
        };
        let msg = ChatMessage {
            from: from_name,
            host,
            reply_port: chat.reply_port,
            node_id: chat.node_id,
            text: chat.text,
            ts: chat.ts,
        };
        tracing::info!("Chat from {} ({} chars)", msg.from, msg.text.len());
        self.events.send(Event::Chat(msg.clone()));
        Some(msg)
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_CHAT_LINE));
        let read_all = async {
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        self.receive_line(&line, addr.ip());
                    }
                    Err(e) => {
                        tracing::debug!("Bad chat stream from {}: {}", addr, e);
                        break;
                    }
                }
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => tracing::debug!("Dropping chat connection from {} on shutdown", addr),
            read = tokio::time::timeout(CHAT_READ_TIMEOUT, read_all) => {
                if read.is_err() {
                    tracing::debug!("Chat connection from {} timed out", addr);
                }
            }
        }
    }
}

pub async fn run_chat_server(listener: TcpListener, inbox: Arc<ChatInbox>, cancel: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Chat server listening on {}", addr);
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let inbox = inbox.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move { inbox.handle_connection(stream, addr, cancel).await });
                }
                Err(e) => {
                    tracing::warn!("Chat accept failed: {}", e);
                    // Don't spin on persistent errors such as fd exhaustion.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("Chat server stopped");
}

/// Sending side of chat. Holds what every outgoing payload says about us.
#[derive(Clone)]
pub struct ChatClient {
    pub node_id: NodeId,
    pub name: String,
    /// Our chat port, advertised as `reply_port`. 0 in degraded mode.
    pub reply_port: u16,
}

impl ChatClient {
    pub fn payload(&self, text: &str) -> Packet {
        Packet::Chat(ChatPayload {
            node_id: self.node_id.to_string(),
            from: self.name.clone(),
            text: text.to_string(),
            ts: now_ts(),
            reply_port: self.reply_port,
        })
    }

    /// One attempt, one connection, one line. Not retried.
    pub async fn send_chat(&self, host: &str, port: u16, text: &str) -> Result<()> {
        let target = format!("{}:{}", host, port);
        let mut line = self.payload(text).to_bytes()?;
        line.push(b'\n');

        let attempt = async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(&line).await?;
            stream.shutdown().await?;
            Ok::<_, EngineError>(())
        };
        match tokio::time::timeout(SEND_TIMEOUT, attempt).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!("Chat to {} failed: {}", target, e);
                }
                result
            }
            Err(_) => Err(EngineError::timeout(target)),
        }
    }

    /// Tries each candidate in order and returns the peer that took the message.
    pub async fn deliver(&self, candidates: &[Candidate], text: &str) -> Result<Peer> {
        let mut last = None;
        for candidate in candidates {
            let peer = &candidate.peer;
            match self.send_chat(&peer.host, peer.port, text).await {
                Ok(()) => {
                    tracing::info!("Chat delivered to {} (rank {})", peer.key(), candidate.rank);
                    return Ok(peer.clone());
                }
                Err(e) => last = Some(e),
            }
        }
        Err(EngineError::ChatDelivery {
            attempts: candidates.len(),
            last: Box::new(last.unwrap_or_else(|| {
                EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no endpoints to try",
                ))
            })),
        })
    }
}
