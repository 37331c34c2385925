use serde::Serialize;
use serde_json::{json, Value};

use crate::config::{AppConfig, RuleMode};
use crate::endpoint::{Endpoint, Protocol, Security, Transport};

/// A complete engine configuration document, serialized to the JSON file
/// the `xray` binary is pointed at.
///
/// Fully determined by (endpoint, settings, mode, control port); building
/// it twice from the same inputs yields an identical value. The control
/// port is supplied by the caller, never generated in here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub api: ApiObject,
    pub dns: Value,
    pub log: LogObject,
    pub policy: Value,
    pub routing: RoutingObject,
    pub stats: Value,
    pub inbounds: Vec<InboundObject>,
    pub outbounds: Vec<OutboundObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiObject {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogObject {
    pub access: String,
    pub error: String,
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingObject {
    #[serde(rename = "domainStrategy")]
    pub domain_strategy: String,
    pub rules: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundObject {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundObject {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
}

/// Compile one endpoint plus user settings and a rule profile into a
/// complete engine configuration. Pure: no I/O, no id generation.
pub fn compile(ep: &Endpoint, config: &AppConfig, mode: RuleMode, control_port: u16) -> EngineConfig {
    EngineConfig {
        api: ApiObject {
            tag: "api".to_string(),
            services: vec!["StatsService".to_string()],
        },
        dns: dns_block(),
        log: LogObject {
            access: String::new(),
            error: String::new(),
            loglevel: "warning".to_string(),
        },
        policy: json!({
            "system": {
                "statsOutboundDownlink": true,
                "statsOutboundUplink": true,
            }
        }),
        routing: RoutingObject {
            domain_strategy: "AsIs".to_string(),
            rules: routing_rules(mode),
        },
        stats: json!({}),
        inbounds: inbounds(config, mode, control_port),
        outbounds: vec![
            OutboundObject {
                tag: "direct".to_string(),
                protocol: "freedom".to_string(),
                settings: None,
                stream_settings: None,
            },
            OutboundObject {
                tag: "block".to_string(),
                protocol: "blackhole".to_string(),
                settings: Some(json!({
                    "response": { "type": "http" }
                })),
                stream_settings: None,
            },
            proxy_outbound(ep),
        ],
    }
}

/// Fixed resolver block with regional split-routing hints; not
/// user-configurable, so the engine's own resolution stays deterministic.
fn dns_block() -> Value {
    json!({
        "hosts": {
            "dns.google": "8.8.8.8",
            "dns.pub": "119.29.29.29",
            "dns.alidns.com": "223.5.5.5",
            "geosite:category-ads-all": "127.0.0.1",
        },
        "servers": [
            {
                "address": "https://1.1.1.1/dns-query",
                "domains": ["geosite:geolocation-!cn"],
                "expectIPs": ["geoip:!cn"],
            },
            "8.8.8.8",
            {
                "address": "223.5.5.5",
                "port": 53,
                "domains": ["geosite:cn", "geosite:category-games@cn"],
                "expectIPs": ["geoip:cn"],
                "skipFallback": true,
            },
            {
                "address": "localhost",
                "skipFallback": true,
            },
        ],
    })
}

fn routing_rules(mode: RuleMode) -> Vec<Value> {
    let mut rules = Vec::new();

    // Control traffic is matched ahead of every content rule.
    if !mode.is_test() {
        rules.push(json!({
            "type": "field",
            "inboundTag": ["api"],
            "outboundTag": "api",
        }));
    }

    match mode {
        RuleMode::Default => {
            rules.push(json!({
                "type": "field",
                "outboundTag": "block",
                "domain": [
                    "activity.meteor.com",
                    "geosite:category-ads-all",
                ],
            }));
            rules.push(json!({
                "type": "field",
                "outboundTag": "direct",
                "domain": [
                    "geosite:cn",
                    "geosite:private",
                    "geosite:apple-cn",
                    "geosite:google-cn",
                    "geosite:tld-cn",
                    "geosite:category-games@cn",
                ],
            }));
            rules.push(json!({
                "type": "field",
                "outboundTag": "direct",
                "ip": [
                    "8.8.8.8/32",
                    "223.5.5.5/32",
                    "119.29.29.29/32",
                    "180.76.76.76/32",
                    "114.114.114.114/32",
                    "geoip:private",
                    "geoip:cn",
                ],
            }));
        }

        RuleMode::All => {
            rules.push(json!({
                "type": "field",
                "outboundTag": "direct",
                "domain": ["geosite:private"],
            }));
            rules.push(json!({
                "type": "field",
                "outboundTag": "direct",
                "ip": [
                    "8.8.8.8/32",
                    "223.5.5.5/32",
                    "119.29.29.29/32",
                    "180.76.76.76/32",
                    "114.114.114.114/32",
                    "geoip:private",
                ],
            }));
        }

        // No content rules for probes.
        RuleMode::Test => {}
    }

    rules.push(json!({
        "type": "field",
        "port": "0-65535",
        "outboundTag": "proxy",
    }));

    rules
}

fn inbounds(config: &AppConfig, mode: RuleMode, control_port: u16) -> Vec<InboundObject> {
    let sniffing = json!({
        "enabled": true,
        "destOverride": ["http", "tls"],
        "routeOnly": false,
    });

    if mode.is_test() {
        // Probes need nothing but a loopback SOCKS inbound.
        return vec![InboundObject {
            tag: "socks".to_string(),
            port: control_port,
            listen: "127.0.0.1".to_string(),
            protocol: "socks".to_string(),
            settings: Some(json!({ "auth": "noauth", "udp": true })),
            sniffing: Some(sniffing),
        }];
    }

    let listen = if config.allow_lan {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };

    vec![
        InboundObject {
            tag: "socks".to_string(),
            port: config.socks_port,
            listen: listen.to_string(),
            protocol: "socks".to_string(),
            settings: Some(json!({ "auth": "noauth", "udp": true })),
            sniffing: Some(sniffing.clone()),
        },
        InboundObject {
            tag: "http".to_string(),
            port: config.http_port,
            listen: listen.to_string(),
            protocol: "http".to_string(),
            settings: Some(json!({ "allowTransparent": false })),
            sniffing: Some(sniffing),
        },
        InboundObject {
            tag: "api".to_string(),
            port: control_port,
            listen: "127.0.0.1".to_string(),
            protocol: "dokodemo-door".to_string(),
            settings: Some(json!({ "address": "127.0.0.1" })),
            sniffing: None,
        },
    ]
}

fn proxy_outbound(ep: &Endpoint) -> OutboundObject {
    match &ep.protocol {
        Protocol::Vmess(params) => OutboundObject {
            tag: "proxy".to_string(),
            protocol: "vmess".to_string(),
            settings: Some(json!({
                "vnext": [{
                    "address": ep.host,
                    "port": ep.port,
                    "users": [{
                        "id": params.user_id,
                        "security": params.security,
                    }],
                }],
            })),
            stream_settings: Some(stream_settings(&params.transport, &ep.host)),
        },

        Protocol::Vless(params) => OutboundObject {
            tag: "proxy".to_string(),
            protocol: "vless".to_string(),
            settings: Some(json!({
                "vnext": [{
                    "address": ep.host,
                    "port": ep.port,
                    "users": [{
                        "id": params.user_id,
                        "encryption": "none",
                        "flow": params.flow,
                    }],
                }],
            })),
            stream_settings: Some(stream_settings(&params.transport, &ep.host)),
        },

        Protocol::Trojan(params) => OutboundObject {
            tag: "proxy".to_string(),
            protocol: "trojan".to_string(),
            settings: Some(json!({
                "servers": [{
                    "address": ep.host,
                    "port": ep.port,
                    "password": params.password,
                }],
            })),
            stream_settings: Some(stream_settings(&params.transport, &ep.host)),
        },

        Protocol::Shadowsocks(params) => OutboundObject {
            tag: "proxy".to_string(),
            protocol: "shadowsocks".to_string(),
            settings: Some(json!({
                "servers": [{
                    "method": params.method,
                    "address": ep.host,
                    "port": ep.port,
                    "password": params.password,
                }],
            })),
            stream_settings: None,
        },
    }
}

fn stream_settings(transport: &Transport, ep_host: &str) -> Value {
    let mut sso = json!({ "network": transport.network });

    let network = match transport.network.as_str() {
        "tcp" => {
            if transport.header_type == "http" {
                json!({
                    "tcpSettings": {
                        "header": {
                            "type": "http",
                            "request": { "headers": { "host": [transport.host] } },
                            "response": {},
                        }
                    }
                })
            } else {
                json!({
                    "tcpSettings": {
                        "header": { "type": "none" }
                    }
                })
            }
        }

        "kcp" => json!({
            "kcpSettings": {
                "header": { "type": header_type_or_none(transport) },
                "seed": transport.seed,
            }
        }),

        "ws" => json!({
            "wsSettings": {
                "headers": { "host": transport.host },
                "path": path_or_root(transport),
            }
        }),

        "http" | "h2" => json!({
            "httpSettings": {
                "host": [transport.host],
                "path": path_or_root(transport),
            }
        }),

        "quic" => json!({
            "quicSettings": {
                "security": if transport.quic_security.is_empty() { "none" } else { transport.quic_security.as_str() },
                "header": { "type": header_type_or_none(transport) },
                "key": transport.quic_key,
            }
        }),

        "grpc" => json!({
            "grpcSettings": {
                "serviceName": transport.service_name,
            }
        }),

        _ => json!({}),
    };

    let security = match &transport.security {
        Security::None => json!({ "security": "none" }),

        Security::Tls {
            sni,
            alpn,
            fingerprint,
        } => json!({
            "security": "tls",
            "tlsSettings": {
                "serverName": sni.as_deref().unwrap_or(ep_host),
                "alpn": alpn.as_ref().map(|a| json!([a])),
                "fingerprint": fingerprint,
            }
        }),

        Security::Reality {
            sni,
            fingerprint,
            public_key,
            short_id,
            spider_x,
        } => json!({
            "security": "reality",
            "realitySettings": {
                "serverName": sni,
                "fingerprint": fingerprint,
                "publicKey": public_key,
                "shortID": short_id,
                "spiderX": spider_x,
            }
        }),
    };

    json_merge(&mut sso, network);
    json_merge(&mut sso, security);
    sso
}

fn header_type_or_none(transport: &Transport) -> &str {
    if transport.header_type.is_empty() {
        "none"
    } else {
        &transport.header_type
    }
}

fn path_or_root(transport: &Transport) -> &str {
    if transport.path.is_empty() {
        "/"
    } else {
        &transport.path
    }
}

/// Merge the second object into the first, recursively.
fn json_merge(a: &mut Value, b: Value) {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                json_merge(a.entry(k).or_insert(Value::Null), v);
            }
        }

        (a, b) => *a = b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parser::parse;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn sample_endpoint() -> Endpoint {
        let json = r#"{"ps":"A","add":"1.2.3.4","port":"443","id":"u1","net":"ws","path":"/tunnel","host":"cdn.example.com","tls":"tls"}"#;
        parse(&format!("vmess://{}", STANDARD.encode(json))).unwrap()
    }

    #[test]
    fn test_compile_is_deterministic() {
        let ep = sample_endpoint();
        let config = AppConfig::default();

        let a = compile(&ep, &config, RuleMode::Default, 12345);
        let b = compile(&ep, &config, RuleMode::Default, 12345);
        assert_eq!(a, b);

        let ja = serde_json::to_value(&a).unwrap();
        let jb = serde_json::to_value(&b).unwrap();
        assert_eq!(ja, jb);
    }

    #[test]
    fn test_test_mode_has_single_inbound_and_catch_all_only() {
        let ep = sample_endpoint();
        let config = AppConfig::default();

        let compiled = compile(&ep, &config, RuleMode::Test, 20000);
        assert_eq!(compiled.inbounds.len(), 1);
        assert_eq!(compiled.inbounds[0].tag, "socks");
        assert_eq!(compiled.inbounds[0].port, 20000);
        assert_eq!(compiled.inbounds[0].listen, "127.0.0.1");

        assert_eq!(compiled.routing.rules.len(), 1);
        assert_eq!(compiled.routing.rules[0]["outboundTag"], "proxy");
        assert_eq!(compiled.routing.rules[0]["port"], "0-65535");
    }

    #[test]
    fn test_default_mode_routes_control_traffic_first() {
        let ep = sample_endpoint();
        let config = AppConfig::default();

        let compiled = compile(&ep, &config, RuleMode::Default, 20000);

        let first = &compiled.routing.rules[0];
        assert_eq!(first["inboundTag"][0], "api");
        assert_eq!(first["outboundTag"], "api");

        let last = compiled.routing.rules.last().unwrap();
        assert_eq!(last["outboundTag"], "proxy");

        // block rule present in default mode only
        assert!(compiled
            .routing
            .rules
            .iter()
            .any(|r| r["outboundTag"] == "block"));
        let all = compile(&ep, &config, RuleMode::All, 20000);
        assert!(!all.routing.rules.iter().any(|r| r["outboundTag"] == "block"));
    }

    #[test]
    fn test_lan_exposure_controls_listen_address() {
        let ep = sample_endpoint();
        let mut config = AppConfig::default();

        let loopback = compile(&ep, &config, RuleMode::Default, 20000);
        assert!(loopback
            .inbounds
            .iter()
            .filter(|i| i.tag != "api")
            .all(|i| i.listen == "127.0.0.1"));

        config.allow_lan = true;
        let lan = compile(&ep, &config, RuleMode::Default, 20000);
        assert!(lan
            .inbounds
            .iter()
            .filter(|i| i.tag != "api")
            .all(|i| i.listen == "0.0.0.0"));
        // the control inbound never leaves loopback
        let api = lan.inbounds.iter().find(|i| i.tag == "api").unwrap();
        assert_eq!(api.listen, "127.0.0.1");
    }

    #[test]
    fn test_outbound_set_is_direct_block_proxy() {
        let ep = sample_endpoint();
        let config = AppConfig::default();

        let compiled = compile(&ep, &config, RuleMode::Default, 20000);
        let tags: Vec<&str> = compiled.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, ["direct", "block", "proxy"]);

        let proxy = &compiled.outbounds[2];
        assert_eq!(proxy.protocol, "vmess");
        assert_eq!(proxy.settings.as_ref().unwrap()["vnext"][0]["address"], "1.2.3.4");

        let stream = proxy.stream_settings.as_ref().unwrap();
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["wsSettings"]["path"], "/tunnel");
        assert_eq!(stream["security"], "tls");
    }

    #[test]
    fn test_trojan_sni_falls_back_to_host() {
        let ep = parse("trojan://pw@tr.example.com:443?security=tls#T").unwrap();
        let config = AppConfig::default();

        let compiled = compile(&ep, &config, RuleMode::Test, 20000);
        let stream = compiled.outbounds[2].stream_settings.as_ref().unwrap();
        assert_eq!(stream["tlsSettings"]["serverName"], "tr.example.com");
    }
}
