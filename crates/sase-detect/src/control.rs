//! Control socket
//!
//! Line-delimited JSON commands over a unix socket, the same protocol the
//! Suricata socket client speaks:
//!
//! ```text
//! -> {"command": "reload-rules", "arguments": {"path": "/etc/sase/reload.yaml"}}
//! <- {"return_code": "OK", "message": {...}}
//! ```

use crate::engine::DetectEngine;
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Control socket request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Control socket response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketResponse {
    pub return_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl SocketResponse {
    pub fn ok(message: Value) -> Self {
        Self {
            return_code: "OK".to_string(),
            message: Some(message),
        }
    }

    pub fn nok(message: impl Into<String>) -> Self {
        Self {
            return_code: "NOK".to_string(),
            message: Some(Value::String(message.into())),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.return_code == "OK"
    }
}

/// Unix socket command server bound to one engine
pub struct ControlServer {
    engine: Arc<DetectEngine>,
    socket_path: PathBuf,
}

impl ControlServer {
    pub fn new(engine: Arc<DetectEngine>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("removing stale socket {}", self.socket_path.display()))?;
        }
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "Control socket listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, listener: UnixListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("accepting control connection")?;
                    let engine = self.engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(engine, stream).await {
                            warn!(error = %e, "Control connection failed");
                        }
                    });
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("Control socket stopped");
        Ok(())
    }
}

async fn handle_connection(engine: Arc<DetectEngine>, stream: UnixStream) -> anyhow::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<SocketCommand>(&line) {
            Ok(command) => execute(&engine, command).await,
            Err(e) => SocketResponse::nok(format!("invalid command: {}", e)),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

/// Run one command against the engine
pub async fn execute(engine: &Arc<DetectEngine>, command: SocketCommand) -> SocketResponse {
    debug!(command = %command.command, "Control command");
    match run_command(engine, &command).await {
        Ok(message) => SocketResponse::ok(message),
        Err(e) => {
            warn!(command = %command.command, error = %e, "Control command failed");
            SocketResponse::nok(format!("{:#}", e))
        }
    }
}

async fn run_command(engine: &Arc<DetectEngine>, command: &SocketCommand) -> anyhow::Result<Value> {
    match command.command.as_str() {
        "reload-rules" => {
            let path = command
                .arguments
                .as_ref()
                .and_then(|args| args.get("path"))
                .map(|p| {
                    p.as_str()
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow!("'path' must be a string"))
                })
                .transpose()?;

            let engine = engine.clone();
            let report = tokio::task::spawn_blocking(move || engine.reload(path.as_deref()))
                .await
                .context("reload task failed")??;
            Ok(serde_json::to_value(report)?)
        }
        "ruleset-reload-nonblocking" => {
            engine.request_reload()?;
            Ok(json!("reload requested"))
        }
        "ruleset-status" => Ok(serde_json::to_value(engine.status())?),
        other => bail!("unknown command '{}'", other),
    }
}

/// Send one command and read the response
pub async fn send_command(
    socket_path: &Path,
    command: &str,
    arguments: Option<Value>,
) -> anyhow::Result<SocketResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;

    let cmd = SocketCommand {
        command: command.to_string(),
        arguments,
    };
    let mut payload = serde_json::to_vec(&cmd)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await?;
    serde_json::from_str(&response).context("decoding control response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::dispatch::DispatchTableBuilder;
    use crate::generation::StaticRules;
    use crate::sync::SyncState;

    const RULES: &str = r#"alert tcp any any -> any any (content:"needle"; sid:7;)"#;

    fn engine() -> Arc<DetectEngine> {
        let config = Arc::new(
            ConfigStore::from_yaml("detect-engine:\n  reload:\n    poll-interval-ms: 2\n").unwrap(),
        );
        let engine = DetectEngine::new(
            config,
            Arc::new(StaticRules(RULES.into())),
            DispatchTableBuilder::with_default_engines().build(),
        )
        .unwrap();
        engine.init().unwrap();
        Arc::new(engine)
    }

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sase-detect-{}-{}.sock", name, std::process::id()))
    }

    fn command(name: &str, arguments: Option<Value>) -> SocketCommand {
        SocketCommand {
            command: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn test_execute_without_socket() {
        let engine = engine();

        let status = tokio_test::block_on(execute(&engine, command("ruleset-status", None)));
        assert!(status.is_ok());
        let message = status.message.unwrap();
        assert_eq!(message["signatures"], 1);
        assert_eq!(message["sync_state"], "idle");

        let unknown = tokio_test::block_on(execute(&engine, command("shutdown-now", None)));
        assert_eq!(unknown.return_code, "NOK");

        let bad_path = tokio_test::block_on(execute(
            &engine,
            command("reload-rules", Some(json!({ "path": 42 }))),
        ));
        assert_eq!(bad_path.return_code, "NOK");
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_over_socket() {
        let engine = engine();
        let before = engine.status().active.unwrap();
        let path = socket_path("reload");

        let server = ControlServer::new(engine.clone(), &path);
        let listener = server.bind().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.serve(listener, async {
            let _ = stop_rx.await;
        }));

        let response = send_command(&path, "reload-rules", None).await.unwrap();
        assert!(response.is_ok(), "{:?}", response.message);
        let report = response.message.unwrap();
        assert_eq!(report["previous"], before.0);

        let status = send_command(&path, "ruleset-status", None).await.unwrap();
        let status = status.message.unwrap();
        assert_eq!(status["active"], report["active"]);
        assert_eq!(status["retired"], json!([]));

        let missing = send_command(
            &path,
            "reload-rules",
            Some(json!({ "path": "/nonexistent/sase-reload.yaml" })),
        )
        .await
        .unwrap();
        assert_eq!(missing.return_code, "NOK");
        assert_eq!(engine.status().active, report["active"].as_u64().map(crate::GenerationId));

        let _ = stop_tx.send(());
        task.await.unwrap().unwrap();
        assert!(!path.exists());
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_nonblocking_request_requires_watcher() {
        let engine = engine();
        let response = execute(&engine, command("ruleset-reload-nonblocking", None)).await;
        assert_eq!(response.return_code, "NOK");
        assert_eq!(engine.syncer().state(), SyncState::Idle);

        let reload = execute(&engine, command("reload-rules", None)).await;
        assert!(reload.is_ok(), "{:?}", reload.message);
        engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reload_after_nonblocking_request() {
        let engine = engine();
        engine.spawn_reload_watcher().unwrap();
        let before = engine.status().active.unwrap();

        let response = execute(&engine, command("ruleset-reload-nonblocking", None)).await;
        assert!(response.is_ok(), "{:?}", response.message);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while engine.status().active == Some(before) || engine.syncer().state() != SyncState::Idle {
            assert!(std::time::Instant::now() < deadline, "watcher never serviced the request");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let serviced = engine.status().active.unwrap();

        let reload = execute(&engine, command("reload-rules", None)).await;
        assert!(reload.is_ok(), "{:?}", reload.message);
        assert_eq!(reload.message.unwrap()["previous"], serviced.0);

        let again = execute(&engine, command("ruleset-reload-nonblocking", None)).await;
        assert!(again.is_ok(), "{:?}", again.message);
        engine.shutdown();
    }
}
