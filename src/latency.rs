use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, RuleMode};
use crate::endpoint::{Endpoint, LATENCY_UNREACHABLE};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::xray::{Engine, LogSink, Xray};

/// Attempts around `start`; covers the ephemeral-port race and slow
/// engine boots.
const START_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes candidate endpoints by running one throwaway test-mode engine
/// instance each, under an admission-controlled concurrency cap.
pub struct LatencyTester {
    store: Arc<dyn Store>,
    settings: AppConfig,
    engine: Engine,
    sink: LogSink,
}

impl LatencyTester {
    pub fn new(store: Arc<dyn Store>, settings: AppConfig, engine: Engine, sink: LogSink) -> Self {
        Self {
            store,
            settings,
            engine,
            sink,
        }
    }

    /// Measure every candidate and write results to the store.
    ///
    /// All candidates are marked "testing" in one batch before anything
    /// starts; each then ends with a terminal value, either measured
    /// milliseconds or the unreachable sentinel. Instances are admitted
    /// in input order and never more than `limit` run at once; results
    /// may land out of order. Completion with instances still alive is a
    /// supervisor leak and comes back as a fatal error.
    pub async fn test_latencies(&self, eps: &[Endpoint], limit: Option<usize>) -> Result<()> {
        if eps.is_empty() {
            return Ok(());
        }

        let limit = limit
            .unwrap_or(self.settings.ep_test_concurrency as usize)
            .max(1);
        info!("testing {} endpoints, {} at a time", eps.len(), limit);

        let ids: Vec<String> = eps.iter().map(|ep| ep.id.clone()).collect();
        self.store.mark_testing(&ids).await?;

        let sem = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();

        for ep in eps.iter().cloned() {
            // Block here until a slot frees up: admission in input order.
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .expect("latency semaphore closed");

            let store = self.store.clone();
            let settings = self.settings.clone();
            let engine = self.engine.clone();
            let sink = self.sink.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let latency = probe_endpoint(&ep, engine, settings, sink).await;

                if let Err(err) = store.set_latency(&ep.id, latency).await {
                    warn!("failed to record latency for {}: {}", ep.name, err);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("latency task aborted: {}", err);
            }
        }

        // Every slot must be back by now; anything else means a test
        // instance outlived its task.
        let leaked = limit - sem.available_permits();
        if leaked > 0 {
            return Err(Error::SupervisorLeak(leaked));
        }

        Ok(())
    }
}

/// One endpoint, one throwaway instance, one probe. The instance is
/// stopped whatever the probe did.
async fn probe_endpoint(ep: &Endpoint, engine: Engine, settings: AppConfig, sink: LogSink) -> i32 {
    let test_url = settings.ep_test_url.clone();
    let mut xray = Xray::new(ep.clone(), engine, settings, sink);

    if let Err(err) = start_with_retry(&mut xray).await {
        warn!("giving up on {}: {}", ep.name, err);
        return LATENCY_UNREACHABLE;
    }

    let port = xray.port().unwrap_or_default();
    let latency = probe(port, &test_url).await;

    xray.stop().await;
    latency
}

async fn start_with_retry(xray: &mut Xray) -> Result<()> {
    let mut backoff = RETRY_BACKOFF;
    let mut last_err = None;

    for attempt in 1..=START_ATTEMPTS {
        match xray.start(RuleMode::Test).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                debug!(
                    "start attempt {}/{} for {} failed: {}",
                    attempt,
                    START_ATTEMPTS,
                    xray.endpoint().name,
                    err
                );
                last_err = Some(err);

                if attempt < START_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err.expect("at least one start attempt"))
}

/// HEAD the test URL through the instance's SOCKS inbound. Any failure
/// is the sentinel; a batch never aborts because one endpoint is dead.
async fn probe(port: u16, url: &str) -> i32 {
    match try_probe(port, url).await {
        Ok(latency) => latency,
        Err(err) => {
            debug!("probe on port {} failed: {}", port, err);
            LATENCY_UNREACHABLE
        }
    }
}

async fn try_probe(port: u16, url: &str) -> Result<i32> {
    let proxy_url = format!("socks5://127.0.0.1:{}", port);
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .proxy(reqwest::Proxy::all(&proxy_url)?)
        .build()?;

    let started = Instant::now();
    let status = client.head(url).send().await?.status();
    let elapsed = started.elapsed().as_millis() as i32;

    if status.is_success() {
        Ok(elapsed)
    } else {
        Ok(LATENCY_UNREACHABLE)
    }
}
