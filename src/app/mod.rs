use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{AppConfig, RuleMode};
use crate::endpoint::{Endpoint, Traffic};
use crate::error::Result;
use crate::latency::LatencyTester;
use crate::store::{Fetch, Store};
use crate::subscription::SubscriptionSync;
use crate::xray::{stats, Engine, LogSink, Xray};

/// Top-level coordinator.
///
/// Owns the one supervisor allowed to carry live traffic; everything else
/// (testers, sync) only ever runs throwaway test-mode instances. The
/// live instance is stopped-then-restarted on every switch, never
/// hot-reloaded.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: AppConfig,
    pub engine: Engine,
    pub sink: LogSink,
    pub sync: SubscriptionSync,
    pub tester: Arc<LatencyTester>,
    current: Mutex<Option<Xray>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        fetch: Arc<dyn Fetch>,
        settings: AppConfig,
        engine: Engine,
    ) -> Self {
        let sink = LogSink::default();
        let tester = Arc::new(LatencyTester::new(
            store.clone(),
            settings.clone(),
            engine.clone(),
            sink.clone(),
        ));
        let sync = SubscriptionSync::new(store.clone(), fetch, tester.clone());

        Self {
            store,
            settings,
            engine,
            sink,
            sync,
            tester,
            current: Mutex::new(None),
        }
    }

    /// Make `ep` the live endpoint: stop whatever runs, start a fresh
    /// instance. Start failures surface to the caller; user connectivity
    /// depends on this instance, so there is no silent fallback.
    pub async fn set_current(&self, ep: Endpoint) -> Result<()> {
        info!("switching live endpoint to {}", ep.name);

        let mut guard = self.current.lock().await;
        if let Some(mut old) = guard.take() {
            old.stop().await;
        }

        // the test profile is probe-internal
        let mode = if self.settings.rule.is_test() {
            RuleMode::Default
        } else {
            self.settings.rule
        };

        let mut xray = Xray::new(
            ep,
            self.engine.clone(),
            self.settings.clone(),
            self.sink.clone(),
        );
        xray.start(mode).await?;
        *guard = Some(xray);

        Ok(())
    }

    pub async fn current_endpoint(&self) -> Option<Endpoint> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|xray| xray.endpoint().clone())
    }

    pub async fn stop_current(&self) {
        if let Some(mut xray) = self.current.lock().await.take() {
            xray.stop().await;
        }
    }

    /// Promote the endpoint with the lowest measured latency; storage
    /// order breaks ties. Returns the promoted endpoint, or None when
    /// nothing has a measured latency yet.
    pub async fn select_fastest(&self) -> Result<Option<Endpoint>> {
        let Some(ep) = self.store.fastest_endpoint().await? else {
            warn!("no endpoint with a measured latency to promote");
            return Ok(None);
        };

        self.set_current(ep.clone()).await?;
        Ok(Some(ep))
    }

    /// Full refresh: update every subscription, then promote the fastest
    /// endpoint found across all of them.
    pub async fn refresh_all(&self) -> Result<()> {
        self.sync.update_subscriptions().await?;
        self.select_fastest().await?;
        Ok(())
    }

    /// Re-test every stored endpoint.
    pub async fn test_all(&self) -> Result<()> {
        let eps = self.store.endpoints().await?;
        self.tester.test_latencies(&eps, None).await
    }

    /// Traffic counters of the live instance, recorded on its endpoint.
    pub async fn current_stats(&self) -> Result<Option<Traffic>> {
        let guard = self.current.lock().await;
        let Some(xray) = guard.as_ref() else {
            return Ok(None);
        };
        let Some(port) = xray.port() else {
            return Ok(None);
        };

        let traffic = stats::query_stats(&self.engine, port).await?;
        self.store
            .set_traffic(&xray.endpoint().id, traffic)
            .await?;

        Ok(Some(traffic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::parser::parse;
    use crate::store::MemStore;
    use crate::xray::process::tests::scratch_dir;
    #[cfg(unix)]
    use crate::xray::process::tests::stub_engine;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    struct NoFetch;

    #[async_trait]
    impl Fetch for NoFetch {
        async fn fetch(&self, _url: &str) -> Result<String> {
            Err(anyhow::anyhow!("no network in tests").into())
        }
    }

    fn ep(name: &str, latency: i32) -> Endpoint {
        let json = format!(
            r#"{{"ps":"{}","add":"{}.example.com","port":"443","id":"u"}}"#,
            name, name
        );
        let mut ep = parse(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        ep.latency = latency;
        ep
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_select_fastest_promotes_and_switch_replaces() {
        let dir = scratch_dir("appstate");
        let engine = stub_engine(&dir, "echo 'Xray 1.0.0 started'; sleep 30");

        let store = Arc::new(MemStore::new());
        store
            .insert_endpoints(vec![ep("slow", 300), ep("fast", 80)])
            .await
            .unwrap();

        let state = AppState::new(store, Arc::new(NoFetch), AppConfig::default(), engine);

        let promoted = state.select_fastest().await.unwrap().unwrap();
        assert_eq!(promoted.name, "fast");
        assert_eq!(state.current_endpoint().await.unwrap().name, "fast");

        // switching replaces the live instance instead of stacking a second one
        let other = ep("slow", 300);
        state.set_current(other).await.unwrap();
        assert_eq!(state.current_endpoint().await.unwrap().name, "slow");

        state.stop_current().await;
        assert!(state.current_endpoint().await.is_none());
        state.stop_current().await;

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_select_fastest_with_nothing_measured() {
        let dir = scratch_dir("appstate-empty");
        let engine = Engine {
            bin: dir.join("unused"),
            asset_dir: dir.clone(),
            instance_dir: dir.join("instances"),
        };

        let store = Arc::new(MemStore::new());
        store.insert_endpoints(vec![ep("a", 0)]).await.unwrap();

        let state = AppState::new(store, Arc::new(NoFetch), AppConfig::default(), engine);
        assert!(state.select_fastest().await.unwrap().is_none());
        assert!(state.current_endpoint().await.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
