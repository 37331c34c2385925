use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::endpoint::{parser, Endpoint};
use crate::error::Result;
use crate::latency::LatencyTester;
use crate::store::{Fetch, Store, Subscription};

/// Fetches subscription bodies, reconciles endpoint sets and kicks off
/// latency tests for whatever survived parsing.
///
/// The "currently updating" set is owned right here and cleared on every
/// exit path; it exists only to make concurrent updates of the same
/// subscription a no-op.
#[derive(Clone)]
pub struct SubscriptionSync {
    store: Arc<dyn Store>,
    fetch: Arc<dyn Fetch>,
    tester: Arc<LatencyTester>,
    updating: Arc<Mutex<HashSet<String>>>,
}

impl SubscriptionSync {
    pub fn new(store: Arc<dyn Store>, fetch: Arc<dyn Fetch>, tester: Arc<LatencyTester>) -> Self {
        Self {
            store,
            fetch,
            tester,
            updating: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Refresh one subscription: fetch, decode, parse, replace, test.
    ///
    /// Fetch failures surface to the caller; parse failures are dropped
    /// per line. Disabled subscriptions and subscriptions already being
    /// updated are no-ops.
    pub async fn update_subscription(&self, sub: &Subscription) -> Result<()> {
        if sub.disabled {
            debug!("subscription {} is disabled, skipping", sub.name);
            return Ok(());
        }

        {
            let mut updating = self.updating.lock().unwrap();
            if !updating.insert(sub.id.clone()) {
                warn!("subscription {} is already updating", sub.name);
                return Ok(());
            }
        }

        let result = self.update_inner(sub).await;
        self.updating.lock().unwrap().remove(&sub.id);
        result
    }

    async fn update_inner(&self, sub: &Subscription) -> Result<()> {
        info!("updating subscription {}", sub.name);

        let body = self.fetch.fetch(&sub.url).await?;
        let text = decode_body(&body);

        let eps: Vec<Endpoint> = text
            .lines()
            .filter_map(parser::parse)
            .map(|mut ep| {
                ep.sub_id = Some(sub.id.clone());
                ep
            })
            .collect();

        info!("{} endpoints parsed for {}", eps.len(), sub.name);
        self.store
            .replace_subscription_endpoints(&sub.id, eps.clone())
            .await?;

        self.tester.test_latencies(&eps, None).await?;
        Ok(())
    }

    /// Refresh everything: purge endpoints of disabled subscriptions,
    /// then update the enabled ones concurrently. One failing
    /// subscription never takes the others down.
    pub async fn update_subscriptions(&self) -> Result<()> {
        info!("updating all subscriptions");
        let subs = self.store.subscriptions().await?;

        let (enabled, disabled): (Vec<_>, Vec<_>) =
            subs.into_iter().partition(|sub| !sub.disabled);

        for sub in &disabled {
            let removed = self
                .store
                .delete_endpoints_by_subscription(&sub.id)
                .await?;
            if removed > 0 {
                info!("removed {} endpoints of disabled {}", removed, sub.name);
            }
        }

        join_all(enabled.iter().map(|sub| async move {
            if let Err(err) = self.update_subscription(sub).await {
                warn!("subscription {} update failed: {}", sub.name, err);
            }
        }))
        .await;

        info!("all subscriptions updated");
        Ok(())
    }
}

/// Subscription bodies are conventionally base64 of a line list, but some
/// providers serve the lines raw.
fn decode_body(body: &str) -> String {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();

    match STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
    {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::endpoint::{LATENCY_TESTING, LATENCY_UNREACHABLE};
    use crate::store::MemStore;
    use crate::xray::process::tests::scratch_dir;
    use crate::xray::{Engine, LogSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubFetch {
        body: String,
        calls: AtomicUsize,
    }

    impl StubFetch {
        fn new(body: impl Into<String>) -> Self {
            Self {
                body: body.into(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetch for StubFetch {
        async fn fetch(&self, _url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    struct FailFetch;

    #[async_trait]
    impl Fetch for FailFetch {
        async fn fetch(&self, _url: &str) -> Result<String> {
            Err(anyhow::anyhow!("boom").into())
        }
    }

    fn sub(id: &str, disabled: bool) -> Subscription {
        Subscription {
            id: id.to_string(),
            name: format!("sub-{}", id),
            url: "http://feed.example.com/sub".to_string(),
            disabled,
        }
    }

    /// Engine whose spawn always fails: latency tests settle on the
    /// sentinel without any real process.
    fn dead_engine(dir: &std::path::Path) -> Engine {
        Engine {
            bin: dir.join("does-not-exist"),
            asset_dir: dir.to_path_buf(),
            instance_dir: dir.join("instances"),
        }
    }

    fn sync_with(
        store: Arc<MemStore>,
        fetch: Arc<dyn Fetch>,
        dir: &std::path::Path,
    ) -> SubscriptionSync {
        let tester = Arc::new(LatencyTester::new(
            store.clone(),
            AppConfig::default(),
            dead_engine(dir),
            LogSink::default(),
        ));
        SubscriptionSync::new(store, fetch, tester)
    }

    fn vmess_body() -> String {
        use base64::engine::general_purpose::STANDARD;

        let line = format!(
            "vmess://{}",
            STANDARD.encode(r#"{"ps":"A","add":"1.2.3.4","port":"443","id":"u1"}"#)
        );
        STANDARD.encode(format!("{}\nnot a link\n\n", line))
    }

    #[tokio::test]
    async fn test_update_subscription_parses_and_tags() {
        let dir = scratch_dir("sync");
        let store = Arc::new(MemStore::new());
        store.add_subscription(sub("s1", false));
        let sync = sync_with(store.clone(), Arc::new(StubFetch::new(vmess_body())), &dir);

        sync.update_subscription(&sub("s1", false)).await.unwrap();

        let eps = store.endpoints().await.unwrap();
        assert_eq!(eps.len(), 1);
        assert_eq!(eps[0].name, "A");
        assert_eq!(eps[0].host, "1.2.3.4");
        assert_eq!(eps[0].port, 443);
        assert_eq!(eps[0].sub_id.as_deref(), Some("s1"));
        // the triggered latency test left a terminal value
        assert_ne!(eps[0].latency, LATENCY_TESTING);
        assert_eq!(eps[0].latency, LATENCY_UNREACHABLE);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_resync_replaces_previous_set() {
        let dir = scratch_dir("sync-replace");
        let store = Arc::new(MemStore::new());
        store.add_subscription(sub("s1", false));
        let sync = sync_with(store.clone(), Arc::new(StubFetch::new(vmess_body())), &dir);

        sync.update_subscription(&sub("s1", false)).await.unwrap();
        sync.update_subscription(&sub("s1", false)).await.unwrap();

        // still exactly one endpoint, not two
        assert_eq!(store.endpoints().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_disabled_subscription_loses_endpoints_for_good() {
        let dir = scratch_dir("sync-disabled");
        let store = Arc::new(MemStore::new());
        store.add_subscription(sub("s1", false));
        let sync = sync_with(store.clone(), Arc::new(StubFetch::new(vmess_body())), &dir);

        sync.update_subscription(&sub("s1", false)).await.unwrap();
        assert_eq!(store.endpoints().await.unwrap().len(), 1);

        // the user disables the subscription, then a global refresh runs
        let disabled_store = Arc::new(MemStore::new());
        disabled_store.add_subscription(sub("s1", true));
        disabled_store
            .insert_endpoints(store.endpoints().await.unwrap())
            .await
            .unwrap();
        let store = disabled_store;
        let sync = sync_with(store.clone(), Arc::new(StubFetch::new(vmess_body())), &dir);

        sync.update_subscriptions().await.unwrap();
        assert!(store.endpoints().await.unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_and_clears_updating_flag() {
        let dir = scratch_dir("sync-fail");
        let store = Arc::new(MemStore::new());
        store.add_subscription(sub("s1", false));

        let failing = sync_with(store.clone(), Arc::new(FailFetch), &dir);
        assert!(failing.update_subscription(&sub("s1", false)).await.is_err());

        // the flag was cleared: a retry with a healthy fetch goes through
        let healthy = SubscriptionSync {
            fetch: Arc::new(StubFetch::new(vmess_body())),
            ..failing
        };
        healthy.update_subscription(&sub("s1", false)).await.unwrap();
        assert_eq!(store.endpoints().await.unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_concurrent_updates_of_same_subscription_fetch_once() {
        let dir = scratch_dir("sync-reentry");
        let store = Arc::new(MemStore::new());
        store.add_subscription(sub("s1", false));
        let fetch = Arc::new(StubFetch::new(vmess_body()));
        let sync = sync_with(store.clone(), fetch.clone(), &dir);

        let s = sub("s1", false);
        let (a, b) = tokio::join!(sync.update_subscription(&s), sync.update_subscription(&s));
        a.unwrap();
        b.unwrap();

        assert_eq!(fetch.calls.load(Ordering::SeqCst), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_decode_body_handles_plain_and_base64() {
        assert_eq!(decode_body("aGVsbG8="), "hello");
        assert_eq!(decode_body("aGVsbG8"), "hello");
        assert_eq!(
            decode_body("vmess://abc\ntrojan://x@y:1#n"),
            "vmess://abc\ntrojan://x@y:1#n"
        );
    }
}
