pub mod parser;

use serde::{Deserialize, Serialize};

/// Latency value meaning "test in progress".
pub const LATENCY_TESTING: i32 = -1;

/// Latency value meaning "timed out or unreachable".
pub const LATENCY_UNREACHABLE: i32 = 999_999;

/// Traffic counters read from the engine's stats API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub uplink: u64,
    pub downlink: u64,
}

/// One remote proxy target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Freshly generated on every parse; de-duplication is keyed on
    /// `(host, port)` by the storage layer, never on this id.
    pub id: String,

    /// Owning subscription, if any.
    pub sub_id: Option<String>,

    /// The original share link.
    pub uri: String,

    pub name: String,
    pub host: String,
    pub port: u16,

    /// Milliseconds; -1 = testing, 0 = never tested, 999999 = unreachable.
    #[serde(default)]
    pub latency: i32,

    #[serde(default)]
    pub traffic: Option<Traffic>,

    pub protocol: Protocol,
}

/// Protocol-specific parameter bundle. Exactly one variant per endpoint;
/// the parser and the config compiler both match exhaustively, so adding
/// a protocol is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Protocol {
    Vmess(VmessParams),
    Vless(VlessParams),
    Trojan(TrojanParams),
    Shadowsocks(SsParams),
}

impl Protocol {
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Vmess(_) => "vmess",
            Protocol::Vless(_) => "vless",
            Protocol::Trojan(_) => "trojan",
            Protocol::Shadowsocks(_) => "shadowsocks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessParams {
    pub user_id: String,
    /// Cipher, `auto` when the link does not name one.
    pub security: String,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessParams {
    pub user_id: String,
    pub flow: String,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanParams {
    pub password: String,
    pub transport: Transport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsParams {
    pub method: String,
    pub password: String,
}

/// Stream overlay shared by vmess/vless/trojan links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    /// tcp, kcp, ws, http, h2, quic or grpc; tcp when the link is silent.
    pub network: String,
    pub security: Security,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub header_type: String,
    /// mKCP obfuscation seed.
    #[serde(default)]
    pub seed: String,
    /// gRPC service name.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub quic_security: String,
    #[serde(default)]
    pub quic_key: String,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            security: Security::None,
            host: String::new(),
            path: String::new(),
            header_type: String::new(),
            seed: String::new(),
            service_name: String::new(),
            quic_security: String::new(),
            quic_key: String::new(),
        }
    }
}

/// Security overlay of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Security {
    None,
    Tls {
        sni: Option<String>,
        alpn: Option<String>,
        fingerprint: Option<String>,
    },
    Reality {
        sni: String,
        fingerprint: String,
        public_key: String,
        short_id: String,
        spider_x: String,
    },
}
