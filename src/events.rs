use crate::peer::Peer;
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A chat message received from a remote node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub from: String,
    pub host: String,
    /// The sender's own chat port, as it asked us to reply.
    pub reply_port: u16,
    pub node_id: String,
    pub text: String,
    pub ts: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    PeerUp(Peer),
    PeerDown(Peer),
    Chat(ChatMessage),
    Status(String),
}

/// Producer half handed to every worker. Sending never blocks and never fails
/// loudly: a dropped queue just means nobody is listening any more.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        tracing::trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn status(&self, msg: impl Into<String>) {
        self.send(Event::Status(msg.into()));
    }
}

/// Consumer half. Drained by the UI on its own schedule.
#[derive(Debug)]
pub struct EventQueue {
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
}

impl EventQueue {
    pub fn channel() -> (EventSender, EventQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSender { tx }, EventQueue { rx: Mutex::new(rx) })
    }

    /// Everything pending right now, oldest first. Never waits.
    pub fn drain(&self) -> Vec<Event> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn try_next(&self) -> Option<Event> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_recv()
            .ok()
    }

    /// Waits for the next event, polling so the lock is never held across an await.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
                match rx.try_recv() {
                    Ok(event) => return Some(event),
                    Err(mpsc::error::TryRecvError::Disconnected) => return None,
                    Err(mpsc::error::TryRecvError::Empty) => {}
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_fifo_and_non_blocking() {
        let (tx, queue) = EventQueue::channel();
        assert!(queue.drain().is_empty());

        tx.status("one");
        tx.status("two");
        tx.send(Event::PeerUp(Peer::lan("bob", "10.0.0.2", 38600, "n1")));

        let events = queue.drain();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::Status("one".into()));
        assert_eq!(events[1], Event::Status("two".into()));
        assert!(matches!(events[2], Event::PeerUp(ref p) if p.name == "bob"));
        assert!(queue.try_next().is_none());
    }

    #[tokio::test]
    async fn recv_ends_when_senders_drop() {
        let (tx, queue) = EventQueue::channel();
        tx.status("last");
        drop(tx);
        assert_eq!(queue.recv().await, Some(Event::Status("last".into())));
        assert_eq!(queue.recv().await, None);
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(Event::Status("ready".into())).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["data"], "ready");
    }
}
