use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::endpoint::{Endpoint, Traffic, LATENCY_TESTING};
use crate::error::Result;

/// A named remote list of endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Falls back to the name when a config entry omits it.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub disabled: bool,
}

/// What the control plane needs from whatever persists subscriptions and
/// endpoints. Endpoint reads come back in storage order; that order is
/// the tie-break everywhere lowest-latency selection happens.
#[async_trait]
pub trait Store: Send + Sync {
    async fn subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn endpoints(&self) -> Result<Vec<Endpoint>>;

    async fn insert_endpoints(&self, eps: Vec<Endpoint>) -> Result<()>;

    /// Returns how many endpoints were removed.
    async fn delete_endpoints_by_subscription(&self, sub_id: &str) -> Result<usize>;

    /// Atomic delete-then-insert of one subscription's endpoint set.
    async fn replace_subscription_endpoints(
        &self,
        sub_id: &str,
        eps: Vec<Endpoint>,
    ) -> Result<()>;

    async fn set_latency(&self, endpoint_id: &str, latency: i32) -> Result<()>;

    /// Single batch write of the "testing" marker.
    async fn mark_testing(&self, endpoint_ids: &[String]) -> Result<()>;

    async fn set_traffic(&self, endpoint_id: &str, traffic: Traffic) -> Result<()>;

    /// Lowest positive latency; storage order breaks ties.
    async fn fastest_endpoint(&self) -> Result<Option<Endpoint>>;
}

/// In-memory store backing the CLI session and the tests.
#[derive(Default)]
pub struct MemStore {
    subs: Mutex<Vec<Subscription>>,
    eps: Mutex<Vec<Endpoint>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, sub: Subscription) {
        self.subs.lock().unwrap().push(sub);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.subs.lock().unwrap().clone())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.eps.lock().unwrap().clone())
    }

    async fn insert_endpoints(&self, mut eps: Vec<Endpoint>) -> Result<()> {
        self.eps.lock().unwrap().append(&mut eps);
        Ok(())
    }

    async fn delete_endpoints_by_subscription(&self, sub_id: &str) -> Result<usize> {
        let mut eps = self.eps.lock().unwrap();
        let before = eps.len();
        eps.retain(|ep| ep.sub_id.as_deref() != Some(sub_id));
        Ok(before - eps.len())
    }

    async fn replace_subscription_endpoints(
        &self,
        sub_id: &str,
        mut new: Vec<Endpoint>,
    ) -> Result<()> {
        let mut eps = self.eps.lock().unwrap();
        eps.retain(|ep| ep.sub_id.as_deref() != Some(sub_id));
        eps.append(&mut new);
        Ok(())
    }

    async fn set_latency(&self, endpoint_id: &str, latency: i32) -> Result<()> {
        let mut eps = self.eps.lock().unwrap();
        if let Some(ep) = eps.iter_mut().find(|ep| ep.id == endpoint_id) {
            ep.latency = latency;
        }
        Ok(())
    }

    async fn mark_testing(&self, endpoint_ids: &[String]) -> Result<()> {
        let mut eps = self.eps.lock().unwrap();
        for ep in eps.iter_mut() {
            if endpoint_ids.iter().any(|id| *id == ep.id) {
                ep.latency = LATENCY_TESTING;
            }
        }
        Ok(())
    }

    async fn set_traffic(&self, endpoint_id: &str, traffic: Traffic) -> Result<()> {
        let mut eps = self.eps.lock().unwrap();
        if let Some(ep) = eps.iter_mut().find(|ep| ep.id == endpoint_id) {
            ep.traffic = Some(traffic);
        }
        Ok(())
    }

    async fn fastest_endpoint(&self) -> Result<Option<Endpoint>> {
        let eps = self.eps.lock().unwrap();
        Ok(eps
            .iter()
            .filter(|ep| ep.latency > 0)
            .min_by_key(|ep| ep.latency)
            .cloned())
    }
}

/// Network fetch, used only by subscription sync.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetch {
    async fn fetch(&self, url: &str) -> Result<String> {
        let body = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parser::parse;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    fn ep(name: &str, sub_id: &str, latency: i32) -> Endpoint {
        let json = format!(
            r#"{{"ps":"{}","add":"{}.example.com","port":"443","id":"u"}}"#,
            name, name
        );
        let mut ep = parse(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        ep.sub_id = Some(sub_id.to_string());
        ep.latency = latency;
        ep
    }

    #[tokio::test]
    async fn test_replace_only_touches_one_subscription() {
        let store = MemStore::new();
        store
            .insert_endpoints(vec![ep("a", "s1", 0), ep("b", "s2", 0)])
            .await
            .unwrap();

        store
            .replace_subscription_endpoints("s1", vec![ep("c", "s1", 0)])
            .await
            .unwrap();

        let names: Vec<String> = store
            .endpoints()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[tokio::test]
    async fn test_fastest_ignores_untested_and_breaks_ties_by_order() {
        let store = MemStore::new();
        store
            .insert_endpoints(vec![
                ep("never", "s1", 0),
                ep("first", "s1", 120),
                ep("second", "s1", 120),
                ep("slow", "s1", 480),
            ])
            .await
            .unwrap();

        let fastest = store.fastest_endpoint().await.unwrap().unwrap();
        assert_eq!(fastest.name, "first");
    }

    #[tokio::test]
    async fn test_mark_testing_batch() {
        let store = MemStore::new();
        let a = ep("a", "s1", 50);
        let b = ep("b", "s1", 60);
        let ids = vec![a.id.clone()];
        store.insert_endpoints(vec![a, b]).await.unwrap();

        store.mark_testing(&ids).await.unwrap();
        let eps = store.endpoints().await.unwrap();
        assert_eq!(eps[0].latency, LATENCY_TESTING);
        assert_eq!(eps[1].latency, 60);
    }
}
