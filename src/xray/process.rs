use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, RuleMode};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::xray::config::compile;
use crate::xray::{Engine, LogSink};

/// How long we wait for a readiness or failure marker before giving up.
/// The marker contract is free-text and the engine has been observed to
/// print neither; a bounded wait turns that into a typed failure instead
/// of a hang.
pub const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Access-log lines for the engine's own control inbound.
const NOISE_MARKER: &str = "[api -> api]";

/// Runtime state of one running engine instance.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pub pid: u32,
    pub port: u16,
    pub endpoint_id: String,
    config_path: PathBuf,
}

/// Supervisor for one engine process.
///
/// Lifecycle is Idle -> Starting -> Running -> Stopping -> Idle; the
/// transient states live inside `start`/`stop`, so observable state is
/// just "handle present or not". One handle at most, never shared.
pub struct Xray {
    ep: Endpoint,
    engine: Engine,
    settings: AppConfig,
    sink: LogSink,
    handle: Option<ProcessHandle>,
}

impl Xray {
    pub fn new(ep: Endpoint, engine: Engine, settings: AppConfig, sink: LogSink) -> Self {
        Self {
            ep,
            engine,
            settings,
            sink,
            handle: None,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    /// Control port of the running instance, if any.
    pub fn port(&self) -> Option<u16> {
        self.handle.as_ref().map(|handle| handle.port)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the engine for this supervisor's endpoint.
    ///
    /// Returns once the engine has reported readiness on its output
    /// stream, or with a typed failure when it reported a start error,
    /// exited early, timed out, or could not be spawned at all. Starting
    /// a running supervisor is a warned no-op.
    pub async fn start(&mut self, mode: RuleMode) -> Result<()> {
        if self.handle.is_some() {
            warn!("xray for {} is already started", self.ep.name);
            return Ok(());
        }

        // Ask the kernel for a free port. The bind-then-release window is
        // an accepted race; callers retry the whole start on failure.
        let port = alloc_port()?;

        let compiled = compile(&self.ep, &self.settings, mode, port);
        tokio::fs::create_dir_all(&self.engine.instance_dir).await?;
        let config_path = self.engine.config_path(&self.ep.id);
        tokio::fs::write(&config_path, serde_json::to_string_pretty(&compiled)?).await?;

        let mut child = Command::new(&self.engine.bin)
            .arg("-config")
            .arg(&config_path)
            .env("XRAY_LOCATION_ASSET", &self.engine.asset_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                let _ = std::fs::remove_file(&config_path);
                Error::Io(err)
            })?;

        let pid = child.id().unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, self.sink.clone(), tx.clone(), pid);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, self.sink.clone(), tx.clone(), pid);
        }
        drop(tx);

        if let Err(err) = wait_for_started(rx).await {
            warn!("xray for {} did not come up: {}", self.ep.name, err);
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(&config_path).await;
            return Err(err);
        }

        info!("[{}] xray started for {}", pid, self.ep.name);
        self.sink
            .push(format!("[{}] xray started for {}", pid, self.ep.name));

        self.handle = Some(ProcessHandle {
            child,
            pid,
            port,
            endpoint_id: self.ep.id.clone(),
            config_path,
        });

        Ok(())
    }

    /// Stop the running instance, if any.
    ///
    /// Kills the child and deletes its config file concurrently; both are
    /// best-effort and failures are swallowed, so this is always safe to
    /// call and idempotent. State is Idle afterwards no matter what.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let ProcessHandle {
            mut child,
            pid,
            endpoint_id,
            config_path,
            ..
        } = handle;

        let kill = async {
            if let Err(err) = child.kill().await {
                warn!("[{}] failed to kill xray: {}", pid, err);
            }
        };

        let cleanup = async {
            if let Err(err) = tokio::fs::remove_file(&config_path).await {
                debug!("[{}] config file not removed: {}", pid, err);
            }
        };

        tokio::join!(kill, cleanup);
        debug!("[{}] xray stopped for endpoint {}", pid, endpoint_id);
    }
}

/// Race the readiness marker against the failure marker, bounded by
/// `START_TIMEOUT`. Channel closure means the child exited (or both
/// streams ended) before printing either.
async fn wait_for_started(mut rx: mpsc::UnboundedReceiver<String>) -> Result<()> {
    let outcome = tokio::time::timeout(START_TIMEOUT, async {
        while let Some(line) = rx.recv().await {
            if line.to_lowercase().contains("failed to start") {
                return Err(Error::EngineStart(line));
            }

            if line.contains("Xray") && line.contains("started") {
                return Ok(());
            }
        }

        Err(Error::EngineExited)
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::StartTimeout(START_TIMEOUT)),
    }
}

fn spawn_line_reader<R>(reader: R, sink: LogSink, tx: mpsc::UnboundedSender<String>, pid: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            if !line.contains(NOISE_MARKER) {
                sink.push(format!("[{}] {}", pid, line));
            }

            // Nobody listens after readiness resolves; that is fine.
            let _ = tx.send(line);
        }
    });
}

/// Bind an ephemeral listener, read the assigned port back, release it.
pub fn alloc_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
