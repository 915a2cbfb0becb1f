//! Unix-domain socket control adapter.
//!
//! Listens on `{work_dir}/chorus.sock` (or `control.socket_path`), accepts
//! concurrent connections, and answers newline-delimited JSON
//! [`ControlCommand`]s with [`WireResponse`] lines:
//!
//!   → `"Status"\n`
//!   ← `{"ok":{"Status":{...}}}\n`
//!
//! A connection stays open for any number of request/response pairs.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlCallError, ControlCommand, ControlError, ControlHandle, WireResponse};
use crate::core::error::AppError;

/// Bind the socket and spawn the accept loop. A stale socket file from a
/// previous run is replaced.
pub fn start(control: ControlHandle, socket_path: PathBuf, shutdown: CancellationToken) -> Result<JoinHandle<()>, AppError> {
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        AppError::Control(format!("control socket bind failed at '{}': {e}", socket_path.display()))
    })?;
    info!(socket = %socket_path.display(), "control socket listening");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("control socket shutting down");
                    let _ = std::fs::remove_file(&socket_path);
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(serve(stream, control.clone(), shutdown.clone()));
                    }
                    Err(e) => warn!(error = %e, "control socket accept error"),
                },
            }
        }
    }))
}

async fn serve(stream: UnixStream, control: ControlHandle, shutdown: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            line = lines.next_line() => match line {
                Ok(None) => break,
                Ok(Some(l)) if l.trim().is_empty() => continue,
                Ok(Some(l)) => {
                    let wire = dispatch(&l, &control).await;
                    let mut json = match serde_json::to_string(&wire) {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "control response serialise error");
                            continue;
                        }
                    };
                    json.push('\n');
                    if writer.write_all(json.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "control connection read error");
                    break;
                }
            },
        }
    }
}

async fn dispatch(line: &str, control: &ControlHandle) -> WireResponse {
    let cmd: ControlCommand = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return WireResponse::Err(ControlError::Invalid { message: format!("parse error: {e}") }),
    };

    match control.request(cmd).await {
        Ok(result) => WireResponse::from(result),
        Err(ControlCallError::Send) => WireResponse::Err(ControlError::Invalid { message: "aggregator not running".into() }),
        Err(e) => WireResponse::Err(ControlError::Invalid { message: e.to_string() }),
    }
}
