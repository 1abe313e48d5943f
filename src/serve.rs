//! Newline-delimited JSON transport for the bridge.
//!
//! Requests arrive one per line as `{"id": n, "op": ..., ...}`. Each reply is
//! written as `{"id": n, "result": ...}`; job events are written as they
//! happen. A single task owns the output so lines never interleave.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, EventSink, Request};
use crate::runner::OutputEvent;

fn invalid(id: Value, err: impl std::fmt::Display) -> Value {
    json!({"id": id, "result": {"ok": false, "message": format!("Invalid request: {err}")}})
}

/// Parses one request line, runs it and builds the tagged response.
pub async fn handle_line(bridge: &Bridge, line: &str) -> Value {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return invalid(Value::Null, e),
    };
    let id = value
        .as_object_mut()
        .and_then(|fields| fields.remove("id"))
        .unwrap_or(Value::Null);

    match serde_json::from_value::<Request>(value) {
        Ok(request) => {
            debug!(%id, ?request, "request");
            json!({"id": id, "result": bridge.dispatch(request).await})
        }
        Err(e) => invalid(id, e),
    }
}

async fn write_lines<W>(mut output: W, mut lines: mpsc::UnboundedReceiver<Value>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = lines.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

/// Serves requests from `input` until it closes, then kills any running job
/// and waits for its terminal event to be written.
pub async fn serve<R, W, F>(input: R, output: W, make_bridge: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<dyn EventSink>) -> Bridge,
{
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(write_lines(output, rx));

    let events = tx.clone();
    let sink: Arc<dyn EventSink> = Arc::new(move |event: &OutputEvent| {
        match serde_json::to_value(event) {
            Ok(value) => {
                let _ = events.send(value);
            }
            Err(e) => warn!(error = %e, "failed to encode event"),
        }
    });
    let bridge = Arc::new(make_bridge(sink));
    info!("serving requests on stdin");

    let mut lines = BufReader::new(input).lines();
    let mut in_flight = JoinSet::new();
    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let bridge = Arc::clone(&bridge);
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handle_line(&bridge, &line).await;
            let _ = tx.send(response);
        });
    }

    debug!("input closed");
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "request task failed");
        }
    }
    bridge.shutdown();
    drop(bridge);
    drop(tx);

    writer
        .await
        .context("writer task failed")?
        .context("failed to write response")?;
    info!("serve finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArtifexConfig;
    use crate::desktop::SystemShell;
    use crate::discovery::{DiscoveryEngine, SearchRoots};
    use crate::settings::JsonSettingsStore;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn bridge_in(root: &Path) -> impl FnOnce(Arc<dyn EventSink>) -> Bridge + use<> {
        let root = root.to_path_buf();
        move |sink| {
            let config = ArtifexConfig::default();
            let engine = DiscoveryEngine::new(
                config.discovery.clone(),
                SearchRoots {
                    checkpoints: vec![root.clone()],
                    scripts: vec![root.clone()],
                    known_scripts: Vec::new(),
                },
            );
            Bridge::new(
                &config,
                engine,
                Box::new(JsonSettingsStore::new(root.join("settings.json"))),
                Box::new(SystemShell),
                sink,
            )
        }
    }

    async fn run_session(root: &Path, input: String) -> Vec<Value> {
        let (server_out, mut client_in) = tokio::io::duplex(64 * 1024);
        let read = async {
            let mut text = String::new();
            client_in.read_to_string(&mut text).await.unwrap();
            text
        };
        let (served, text) = tokio::join!(serve(input.as_bytes(), server_out, bridge_in(root)), read);
        served.unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    fn response(lines: &[Value], id: u64) -> &Value {
        lines
            .iter()
            .find(|l| l["id"] == json!(id))
            .unwrap_or_else(|| panic!("no response for id {id}"))
    }

    #[tokio::test]
    async fn replies_are_tagged_with_request_id() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("ref.png");
        std::fs::write(&file, vec![0u8; 16]).unwrap();

        let input = format!(
            "{}\n\n{}\n{}\n",
            json!({"id": 1, "op": "validate_file", "path": file}),
            json!({"id": 2, "op": "cancel_job"}),
            json!({"id": 3, "op": "discover_scripts"}),
        );
        let lines = run_session(tmp.path(), input).await;

        assert_eq!(lines.len(), 3);
        assert_eq!(response(&lines, 1)["result"], json!({"ok": true, "size": 16}));
        assert_eq!(
            response(&lines, 2)["result"],
            json!({"ok": false, "message": "No running job"})
        );
        assert_eq!(response(&lines, 3)["result"], json!([]));
    }

    #[tokio::test]
    async fn bad_lines_get_error_replies() {
        let tmp = tempfile::tempdir().unwrap();
        let input = format!("not json\n{}\n", json!({"id": 9, "op": "fly"}));
        let lines = run_session(tmp.path(), input).await;

        assert_eq!(lines.len(), 2);
        assert!(lines.iter().any(|l| l["id"].is_null() && l["result"]["ok"] == json!(false)));
        assert_eq!(response(&lines, 9)["result"]["ok"], json!(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn eof_kills_job_and_flushes_exit_event() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("slow.sh");
        std::fs::write(&script, "exec sleep 30\n").unwrap();

        let input = format!(
            "{}\n",
            json!({"id": 1, "op": "start_job", "executable": "sh", "script": script})
        );
        let lines = run_session(tmp.path(), input).await;

        let started = &response(&lines, 1)["result"];
        assert_eq!(started["ok"], json!(true));
        let job = started["job"].clone();

        let exits: Vec<_> = lines.iter().filter(|l| l["event"] == json!("exited")).collect();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0]["job"], job);
        assert!(exits[0]["code"].is_null());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn eof_kills_cancelled_worker_that_ignores_sigterm() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("stubborn.sh");
        std::fs::write(&script, "trap '' TERM\nwhile :; do sleep 1; done\n").unwrap();

        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, mut client_in) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(server_in, server_out, bridge_in(tmp.path())));

        let mut requests = client_out;
        let start = json!({"id": 1, "op": "start_job", "executable": "sh", "script": script});
        requests.write_all(format!("{start}\n").as_bytes()).await.unwrap();
        // Give the shell time to install its trap before the cancel arrives.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let cancel = json!({"id": 2, "op": "cancel_job"});
        requests.write_all(format!("{cancel}\n").as_bytes()).await.unwrap();
        drop(requests);

        let mut text = String::new();
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            client_in.read_to_string(&mut text).await.unwrap();
            server.await.unwrap()
        })
        .await;
        finished.expect("serve kept running after input closed").unwrap();

        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(response(&lines, 1)["result"]["ok"], json!(true));
        assert_eq!(response(&lines, 2)["result"], json!({"ok": true}));
        let exits: Vec<_> = lines.iter().filter(|l| l["event"] == json!("exited")).collect();
        assert_eq!(exits.len(), 1);
        assert!(exits[0]["code"].is_null());
    }
}
