use serde::Deserialize;
use tokio::process::Command;

use crate::endpoint::Traffic;
use crate::error::Result;
use crate::xray::Engine;

#[derive(Debug, Deserialize)]
struct StatObject {
    #[serde(default)]
    stat: Vec<StatItem>,
}

#[derive(Debug, Deserialize)]
struct StatItem {
    name: String,
    #[serde(default)]
    value: String,
}

/// Query the proxy outbound's traffic counters through a running
/// instance's control port, using the engine's own stats client.
pub async fn query_stats(engine: &Engine, port: u16) -> Result<Traffic> {
    let output = Command::new(&engine.bin)
        .args(["api", "statsquery", &format!("--server=127.0.0.1:{}", port)])
        .output()
        .await?;

    parse_stats(&output.stdout)
}

fn parse_stats(raw: &[u8]) -> Result<Traffic> {
    let obj: StatObject = serde_json::from_slice(raw)?;
    let mut traffic = Traffic::default();

    for stat in &obj.stat {
        match stat.name.as_str() {
            "outbound>>>proxy>>>traffic>>>uplink" => {
                traffic.uplink = stat.value.parse().unwrap_or_default();
            }
            "outbound>>>proxy>>>traffic>>>downlink" => {
                traffic.downlink = stat.value.parse().unwrap_or_default();
            }
            _ => {}
        }
    }

    Ok(traffic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stats_picks_proxy_counters() {
        let raw = br#"{
            "stat": [
                {"name": "outbound>>>proxy>>>traffic>>>uplink", "value": "123"},
                {"name": "outbound>>>proxy>>>traffic>>>downlink", "value": "4567"},
                {"name": "outbound>>>direct>>>traffic>>>uplink", "value": "999"}
            ]
        }"#;

        let traffic = parse_stats(raw).unwrap();
        assert_eq!(traffic.uplink, 123);
        assert_eq!(traffic.downlink, 4567);
    }

    #[test]
    fn test_parse_stats_tolerates_empty_object() {
        let traffic = parse_stats(b"{}").unwrap();
        assert_eq!(traffic, Traffic::default());
    }
}
