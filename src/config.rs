use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_DISCOVERY_PORT: u16 = 38655;
pub const DEFAULT_CHAT_PORT_BASE: u16 = 38600;
pub const DEFAULT_CHAT_PORT_SPAN: u16 = 24;

/// How often announces go out. Every other tick also sends a probe.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(2500);
/// LAN peers silent for longer than this are dropped (about 4 missed announces).
pub const PEER_TIMEOUT: Duration = Duration::from_secs(10);
pub const GC_INTERVAL: Duration = Duration::from_secs(2);
/// Rescan interfaces every N announce ticks.
pub const INTERFACE_REFRESH_TICKS: u64 = 8;

pub const SEND_TIMEOUT: Duration = Duration::from_secs(4);
pub const CHAT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_CHAT_LINE: usize = 64 * 1024;
pub const MAX_DATAGRAM: usize = 16 * 1024;

/// Upper bound on how long `stop()` waits for workers before aborting them.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub display_name: String,
    pub discovery_port: u16,
    pub chat_port_base: u16,
    pub chat_port_span: u16,
    pub bind_ip: IpAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            chat_port_base: DEFAULT_CHAT_PORT_BASE,
            chat_port_span: DEFAULT_CHAT_PORT_SPAN,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl EngineConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.display_name = name.trim().to_string();
        }
        self
    }
}

/// System hostname, or a random two-word name when the OS won't tell us.
pub fn default_display_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| names::Generator::default().next())
        .unwrap_or_else(|| "anonymous".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_network_wide_ports() {
        let config = EngineConfig::default();
        assert_eq!(config.discovery_port, 38655);
        assert_eq!(config.chat_port_base, 38600);
        assert_eq!(config.chat_port_span, 24);
        assert!(!config.display_name.is_empty());
    }

    #[test]
    fn blank_name_keeps_default() {
        let config = EngineConfig::default().with_name("  ");
        assert_eq!(config.display_name, default_display_name());

        let config = EngineConfig::default().with_name(" alice ");
        assert_eq!(config.display_name, "alice");
    }

    #[test]
    fn staleness_spans_several_announces() {
        assert!(PEER_TIMEOUT > ANNOUNCE_INTERVAL * 3);
    }
}
