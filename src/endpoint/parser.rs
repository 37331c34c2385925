use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use url::Url;

use super::{
    Endpoint, Protocol, Security, SsParams, Transport, TrojanParams, VlessParams, VmessParams,
};

#[derive(Debug, thiserror::Error)]
enum ParseError {
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] url::ParseError),
    #[error("failed to decode base64")]
    Base64,
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid utf-8 payload")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
}

/// Parse one trimmed subscription line or pasted share link.
///
/// Unknown schemes and malformed links yield `None`; nothing is ever
/// thrown across this boundary. Each call mints a fresh endpoint id, so
/// parsing the same line twice yields two distinct ids with identical
/// content.
pub fn parse(line: &str) -> Option<Endpoint> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    match parse_inner(line) {
        Ok(ep) => Some(ep),
        Err(err) => {
            warn!("skipping line {:?}: {}", truncate(line, 48), err);
            None
        }
    }
}

fn parse_inner(line: &str) -> Result<Endpoint, ParseError> {
    if let Some(rest) = line.strip_prefix("vmess://") {
        return parse_vmess(line, rest);
    }

    let url = Url::parse(line)?;
    match url.scheme() {
        "vless" => parse_vless(line, &url),
        "trojan" => parse_trojan(line, &url),
        "ss" => parse_ss(line, &url),
        other => Err(ParseError::UnsupportedScheme(other.to_string())),
    }
}

/// vmess links carry a base64 JSON document instead of URI components.
#[derive(Debug, Deserialize)]
struct VmessLink {
    #[serde(default)]
    ps: String,
    add: String,
    #[serde(default)]
    port: Value,
    id: String,
    #[serde(default)]
    net: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    tls: String,
    #[serde(default)]
    sni: Option<String>,
    #[serde(default)]
    alpn: Option<String>,
    #[serde(default)]
    fp: Option<String>,
    #[serde(default)]
    scy: Option<String>,
}

fn parse_vmess(line: &str, payload: &str) -> Result<Endpoint, ParseError> {
    let json = decode_base64(payload)?;
    let link: VmessLink = serde_json::from_slice(&json)?;

    let net = link.net.as_deref().unwrap_or("tcp");
    let security = if link.tls.is_empty() {
        Security::None
    } else {
        Security::Tls {
            sni: link.sni.clone(),
            alpn: link.alpn.clone(),
            fingerprint: link.fp.clone(),
        }
    };

    let transport = Transport {
        network: net.to_string(),
        security,
        host: link.host,
        path: link.path,
        ..Transport::default()
    };

    Ok(Endpoint {
        id: fresh_id(),
        sub_id: None,
        uri: line.to_string(),
        name: link.ps,
        host: link.add.clone(),
        port: port_number(&link.port),
        latency: 0,
        traffic: None,
        protocol: Protocol::Vmess(VmessParams {
            user_id: link.id,
            security: link.scy.unwrap_or_else(|| "auto".to_string()),
            transport,
        }),
    })
}

fn parse_vless(line: &str, url: &Url) -> Result<Endpoint, ParseError> {
    let query = query_map(url);
    let host = host_of(url)?;

    Ok(Endpoint {
        id: fresh_id(),
        sub_id: None,
        uri: line.to_string(),
        name: fragment_name(url),
        host,
        port: url.port().unwrap_or(0),
        latency: 0,
        traffic: None,
        protocol: Protocol::Vless(VlessParams {
            user_id: userinfo(url),
            flow: query.get("flow").cloned().unwrap_or_default(),
            transport: transport_from_query(&query),
        }),
    })
}

fn parse_trojan(line: &str, url: &Url) -> Result<Endpoint, ParseError> {
    let query = query_map(url);
    let host = host_of(url)?;

    Ok(Endpoint {
        id: fresh_id(),
        sub_id: None,
        uri: line.to_string(),
        name: fragment_name(url),
        host,
        port: url.port().unwrap_or(0),
        latency: 0,
        traffic: None,
        protocol: Protocol::Trojan(TrojanParams {
            password: userinfo(url),
            transport: transport_from_query(&query),
        }),
    })
}

fn parse_ss(line: &str, url: &Url) -> Result<Endpoint, ParseError> {
    let host = host_of(url)?;

    // Userinfo is either plain `method:password` or base64 of it.
    let userinfo = userinfo(url);
    let userinfo = if userinfo.contains(':') {
        userinfo
    } else {
        String::from_utf8(decode_base64(&userinfo)?)?
    };

    let pos = userinfo.find(':').unwrap_or_default();
    let method = userinfo[..pos].to_string();
    let password = userinfo[pos + 1..].to_string();

    Ok(Endpoint {
        id: fresh_id(),
        sub_id: None,
        uri: line.to_string(),
        name: fragment_name(url),
        host,
        port: url.port().unwrap_or(0),
        latency: 0,
        traffic: None,
        protocol: Protocol::Shadowsocks(SsParams { method, password }),
    })
}

/// Shared `?type=...&security=...` handling for vless and trojan links.
fn transport_from_query(query: &HashMap<String, String>) -> Transport {
    let get = |key: &str| query.get(key).cloned().unwrap_or_default();

    let security = match get("security").as_str() {
        "tls" => Security::Tls {
            sni: query.get("sni").cloned(),
            alpn: query.get("alpn").cloned(),
            fingerprint: query.get("fp").cloned(),
        },
        "reality" => Security::Reality {
            sni: get("sni"),
            fingerprint: get("fp"),
            public_key: get("pbk"),
            short_id: get("sid"),
            spider_x: get("spiderX"),
        },
        _ => Security::None,
    };

    let network = query
        .get("type")
        .cloned()
        .unwrap_or_else(|| "tcp".to_string());

    Transport {
        network,
        security,
        host: get("host"),
        path: get("path"),
        header_type: get("headerType"),
        seed: get("seed"),
        service_name: get("serviceName"),
        quic_security: get("quicSecurity"),
        quic_key: get("key"),
    }
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn host_of(url: &Url) -> Result<String, ParseError> {
    url.host_str()
        .map(|h| h.to_string())
        .ok_or(ParseError::MissingHost)
}

fn fragment_name(url: &Url) -> String {
    decode_component(url.fragment().unwrap_or_default())
}

/// The URL crate splits userinfo at the first ':'; rejoin it so
/// credentials that contain one survive.
fn userinfo(url: &Url) -> String {
    match url.password() {
        Some(password) => format!(
            "{}:{}",
            decode_component(url.username()),
            decode_component(password)
        ),
        None => decode_component(url.username()),
    }
}

fn decode_component(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .into_owned()
}

/// Subscription payloads are sloppy about alphabet and padding.
fn decode_base64(raw: &str) -> Result<Vec<u8>, ParseError> {
    let raw = raw.trim();
    STANDARD
        .decode(raw)
        .or_else(|_| STANDARD_NO_PAD.decode(raw))
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw.trim_end_matches('=')))
        .map_err(|_| ParseError::Base64)
}

/// Port fields in vmess JSON arrive as string or number.
fn port_number(value: &Value) -> u16 {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()).unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
