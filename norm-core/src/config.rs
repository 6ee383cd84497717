//! Serde-loadable session, sender and receiver settings.

use serde::Deserialize;

use crate::engine::{SenderParams, SessionOption};
use crate::error::Result;
use crate::protocol::{FecType, FlushMode};
use crate::session::Session;

/// Group address and per-session tuning. Unset options keep the engine default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Multicast group or unicast address (default 224.1.2.3).
    #[serde(default = "default_address")]
    pub address: String,
    /// Session port (default 6003).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub ttl: Option<u8>,
    #[serde(default)]
    pub tos: Option<u8>,
    #[serde(default)]
    pub loopback: Option<bool>,
    #[serde(default)]
    pub multicast_interface: Option<String>,
    /// Transmit rate in bits per second.
    #[serde(default)]
    pub tx_rate: Option<f64>,
    #[serde(default)]
    pub congestion_control: Option<bool>,
    #[serde(default)]
    pub message_trace: bool,
}

fn default_address() -> String {
    "224.1.2.3".to_string()
}
fn default_port() -> u16 {
    6003
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            ttl: None,
            tos: None,
            loopback: None,
            multicast_interface: None,
            tx_rate: None,
            congestion_control: None,
            message_trace: false,
        }
    }
}

impl SessionConfig {
    /// Options this config sets, in application order.
    pub fn options(&self) -> Vec<SessionOption> {
        let mut out = Vec::new();
        if let Some(ttl) = self.ttl {
            out.push(SessionOption::Ttl(ttl));
        }
        if let Some(tos) = self.tos {
            out.push(SessionOption::Tos(tos));
        }
        if let Some(loopback) = self.loopback {
            out.push(SessionOption::Loopback(loopback));
        }
        if let Some(name) = &self.multicast_interface {
            out.push(SessionOption::MulticastInterface(name.clone()));
        }
        if let Some(rate) = self.tx_rate {
            out.push(SessionOption::TxRate(rate));
        }
        if let Some(enable) = self.congestion_control {
            out.push(SessionOption::CongestionControl {
                enable,
                adjust_rate: true,
            });
        }
        if self.message_trace {
            out.push(SessionOption::MessageTrace(true));
        }
        out
    }

    pub fn apply(&self, session: &Session) -> Result<()> {
        for option in self.options() {
            session.set_option(option)?;
        }
        Ok(())
    }
}

/// Sender parameters plus the stream settings of an output adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SenderConfig {
    /// Fixed session id. When unset a random one is chosen per start.
    #[serde(default)]
    pub session_id: Option<u16>,
    #[serde(default = "default_buffer_space")]
    pub buffer_space: u64,
    #[serde(default = "default_segment_size")]
    pub segment_size: u16,
    #[serde(default = "default_block_size")]
    pub block_size: u16,
    #[serde(default = "default_num_parity")]
    pub num_parity: u16,
    #[serde(default)]
    pub fec: FecType,
    /// Stream repair buffer in bytes.
    #[serde(default = "default_buffer_space")]
    pub repair_window: u64,
    #[serde(default)]
    pub auto_flush: Option<FlushMode>,
    #[serde(default)]
    pub push_enable: bool,
}

fn default_buffer_space() -> u64 {
    1024 * 1024
}
fn default_segment_size() -> u16 {
    1400
}
fn default_block_size() -> u16 {
    64
}
fn default_num_parity() -> u16 {
    16
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            buffer_space: default_buffer_space(),
            segment_size: default_segment_size(),
            block_size: default_block_size(),
            num_parity: default_num_parity(),
            fec: FecType::default(),
            repair_window: default_buffer_space(),
            auto_flush: None,
            push_enable: false,
        }
    }
}

impl SenderConfig {
    pub fn params(&self) -> SenderParams {
        SenderParams {
            session_id: self.session_id.unwrap_or_else(rand::random),
            buffer_space: self.buffer_space,
            segment_size: self.segment_size,
            block_size: self.block_size,
            num_parity: self.num_parity,
            fec: self.fec,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    #[serde(default = "default_buffer_space")]
    pub buffer_space: u64,
    /// Receive without sending NACKs or acknowledgments.
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub default_unicast_nack: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            buffer_space: default_buffer_space(),
            silent: false,
            default_unicast_nack: false,
        }
    }
}

impl ReceiverConfig {
    pub fn apply(&self, session: &Session) -> Result<()> {
        if self.silent {
            session.set_silent_receiver(true, -1)?;
        }
        if self.default_unicast_nack {
            session.set_default_unicast_nack(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::NodeId;
    use crate::instance::Instance;
    use crate::sim::SimEngine;
    use std::sync::Arc;

    #[test]
    fn empty_tables_take_defaults() {
        let s: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(s.address, "224.1.2.3");
        assert_eq!(s.port, 6003);
        assert!(s.options().is_empty());
        let tx: SenderConfig = toml::from_str("").unwrap();
        assert_eq!(tx.segment_size, 1400);
        assert_eq!(tx.fec, FecType::Rs8);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<SessionConfig>("bogus = 1").is_err());
        assert!(toml::from_str::<ReceiverConfig>("bufferspace = 1").is_err());
    }

    #[test]
    fn fixed_session_id_is_kept() {
        let tx: SenderConfig = toml::from_str("session_id = 42\nfec = \"rs16\"").unwrap();
        let p = tx.params();
        assert_eq!(p.session_id, 42);
        assert_eq!(p.fec, FecType::Rs16);
    }

    #[test]
    fn apply_sets_options_on_session() {
        let sim = Arc::new(SimEngine::new());
        let instance = Instance::create(sim.clone(), false).unwrap();
        let session = instance.create_session("224.1.2.3", 6003, NodeId(1)).unwrap();
        let cfg: SessionConfig = toml::from_str("ttl = 4\nloopback = true\ntx_rate = 2e6").unwrap();
        cfg.apply(&session).unwrap();
        assert_eq!(
            sim.session_options(session.handle()),
            vec![
                SessionOption::Ttl(4),
                SessionOption::Loopback(true),
                SessionOption::TxRate(2e6)
            ]
        );
        let rx = ReceiverConfig {
            silent: true,
            ..ReceiverConfig::default()
        };
        rx.apply(&session).unwrap();
        assert_eq!(
            sim.session_options(session.handle()).last(),
            Some(&SessionOption::SilentReceiver {
                silent: true,
                max_delay: -1
            })
        );
    }
}
