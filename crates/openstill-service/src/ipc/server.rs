//! Per-device socket server.
//!
//! One listener per camera. Connections speak the framed protocol from
//! [`super::codec`], strictly request/response: a client that sends
//! bytes while a request is outstanding is disconnected. Blocking
//! engine calls (reads, the trigger ioctl) run on the blocking thread
//! pool; if the client goes away mid-read, the session's reader is
//! interrupted so the engine thread does not linger.

use std::sync::Arc;

use anyhow::{Context, Result};
use openstill_engine::{CaptureHandle, StillDevice};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::codec::{
    IpcError, MessageCodec, Op, Request, Response, LEN_PREFIX, OPEN_NONBLOCK,
};

/// Serves one device's socket.
#[derive(Debug)]
pub struct DeviceServer {
    dev: Arc<StillDevice>,
    codec: MessageCodec,
}

impl DeviceServer {
    pub fn new(dev: Arc<StillDevice>) -> Self {
        Self {
            dev,
            codec: MessageCodec::new(),
        }
    }

    /// Accept loop. Runs until the listener is closed or the task is
    /// dropped at daemon shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (stream, _addr) = listener.accept().await.context("accepting connection")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let id = server.dev.id();
                if let Err(err) = server.handle_connection(stream).await {
                    debug!(device = id, error = %err, "connection closed");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut session: Option<Arc<CaptureHandle>> = None;

        loop {
            let mut len_buf = [0u8; LEN_PREFIX];
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                // Clean close between requests.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            let body_len = u32::from_le_bytes(len_buf) as usize;
            if body_len > self.codec.max_message_size() {
                warn!(body_len, "oversized request, closing connection");
                return Ok(());
            }
            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body).await?;

            let request = match self.codec.decode_request(&body) {
                Ok(request) => request,
                Err(IpcError::UnknownOp(op)) => {
                    debug!(op, "unknown op");
                    self.send(&mut writer, Response::error(-22)).await?;
                    continue;
                }
                Err(err) => {
                    debug!(error = %err, "bad request, closing connection");
                    return Ok(());
                }
            };

            let response = self
                .dispatch(request, &mut session, &mut reader)
                .await;
            match response {
                Some(response) => self.send(&mut writer, response).await?,
                // The client vanished mid-request.
                None => return Ok(()),
            }
        }
    }

    async fn send(
        &self,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        response: Response,
    ) -> Result<()> {
        let frame = self
            .codec
            .encode_response(&response)
            .context("encoding response")?;
        writer.write_all(&frame).await.context("writing response")
    }

    async fn dispatch(
        &self,
        request: Request,
        session: &mut Option<Arc<CaptureHandle>>,
        reader: &mut tokio::net::unix::OwnedReadHalf,
    ) -> Option<Response> {
        match request.op {
            Op::Open => {
                if session.is_some() {
                    return Some(Response::error(-16));
                }
                let nonblocking = request.arg & OPEN_NONBLOCK != 0;
                match self.dev.open(nonblocking) {
                    Ok(handle) => {
                        *session = Some(Arc::new(handle));
                        Some(Response::ok(Vec::new()))
                    }
                    Err(err) => Some(Response::error(err.errno())),
                }
            }
            Op::Release => {
                *session = None;
                Some(Response::ok(Vec::new()))
            }
            Op::Write => match session {
                Some(handle) => match handle.write(&request.payload) {
                    Ok(n) => Some(Response::ok((n as u32).to_le_bytes().to_vec())),
                    Err(err) => Some(Response::error(err.errno())),
                },
                None => Some(Response::error(-22)),
            },
            Op::Read => {
                let Some(handle) = session.as_ref().map(Arc::clone) else {
                    return Some(Response::error(-22));
                };
                let max_len = (request.arg as usize)
                    .min(self.codec.max_message_size().saturating_sub(64));
                let interrupter = handle.interrupter();
                let task = tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; max_len];
                    handle.read(&mut buf).map(|n| {
                        buf.truncate(n);
                        buf
                    })
                });
                self.await_blocking(task, reader, interrupter).await
            }
            Op::Ioctl => {
                let Some(handle) = session.as_ref().map(Arc::clone) else {
                    return Some(Response::error(-22));
                };
                let code = request.arg;
                let payload = request.payload;
                let interrupter = handle.interrupter();
                let task =
                    tokio::task::spawn_blocking(move || handle.ioctl(code, &payload));
                self.await_blocking(task, reader, interrupter).await
            }
        }
    }

    /// Await a blocking engine call while watching for the client to
    /// disappear; a vanished client interrupts the call so the engine
    /// thread is reclaimed. Returns `None` when the connection is dead.
    async fn await_blocking(
        &self,
        mut task: tokio::task::JoinHandle<openstill_errors::Result<Vec<u8>>>,
        reader: &mut tokio::net::unix::OwnedReadHalf,
        interrupter: openstill_engine::handle::ReadInterrupter,
    ) -> Option<Response> {
        let mut probe = [0u8; 1];
        tokio::select! {
            result = &mut task => Some(match result {
                Ok(Ok(payload)) => Response::ok(payload),
                Ok(Err(err)) => Response::error(err.errno()),
                Err(join_err) => {
                    warn!(error = %join_err, "engine task failed");
                    Response::error(-5)
                }
            }),
            peeked = reader.read(&mut probe) => {
                match peeked {
                    Ok(0) | Err(_) => debug!("client left mid-request"),
                    // Pipelining violates the protocol.
                    Ok(_) => warn!("unexpected bytes mid-request, closing"),
                }
                interrupter.interrupt();
                let _ = (&mut task).await;
                None
            }
        }
    }
}
