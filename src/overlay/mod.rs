pub mod io;
pub mod shell;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Content, Endpoint, Inbox, Message, Outbox, Signal};
use crate::sotp::router::WorkerLink;

/// Application payload source/sink on the client side.
///
/// `process_input` sees raw bytes captured from the local input (stdin or
/// a bridged socket); whatever it returns is handed to SOTP for
/// encryption and chunking. `process_sotp` sees each reassembled payload
/// delivered by SOTP; a return value is submitted back through the
/// tunnel (a shell overlay answers this way).
#[async_trait]
pub trait ClientOverlay: Send {
    fn name(&self) -> &str;
    fn tag(&self) -> u16;
    /// True when the overlay consumes the process stdin; the input
    /// capture task forwards stdin bytes only then.
    fn has_input(&self) -> bool;
    /// Hook for overlays that own sockets or other background sources;
    /// they send captured bytes to `overlay_tx` as Input traffic.
    async fn start(&mut self, _overlay_tx: Outbox) -> Result<()> {
        Ok(())
    }
    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>>;
    async fn process_sotp(&mut self, data: Bytes) -> Result<Option<Bytes>>;
}

/// Server-side payload sink/source, bound to one worker per session.
#[async_trait]
pub trait ServerOverlay: Send {
    fn name(&self) -> &str;
    fn tag(&self) -> u16;
    async fn start(&mut self, _overlay_tx: Outbox) -> Result<()> {
        Ok(())
    }
    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>>;
    async fn process_sotp(&mut self, worker_id: u32, data: Bytes) -> Result<Option<Bytes>>;
}

/// Client overlay actor: announces itself to SOTP with a Start signal,
/// then shuttles payloads between the input capture, the data-ingest
/// queue and the SOTP layer until the session ends.
pub async fn run_client_overlay(
    mut overlay: Box<dyn ClientOverlay>,
    mut rx: Inbox,
    qsotp_tx: Outbox,
    qdata_tx: Outbox,
) {
    let start = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Start);
    if qsotp_tx.send(start).await.is_err() {
        return;
    }
    while let Some(msg) = rx.recv().await {
        match &msg.content {
            Content::Signal(signal) => match signal {
                Signal::Terminate | Signal::CommsFinished | Signal::CommsBroken => {
                    debug!("[{}] {signal} received, shutting down", overlay.name());
                    let _ = qsotp_tx
                        .send(Message::signal(
                            Endpoint::Overlay,
                            0,
                            Endpoint::Sotp,
                            0,
                            Signal::Terminate,
                        ))
                        .await;
                    break;
                }
                _ => {}
            },
            Content::Stream(data) => {
                let produced = match msg.sender {
                    Endpoint::Input => overlay.process_input(data.clone()).await,
                    Endpoint::Sotp => overlay.process_sotp(data.clone()).await,
                    _ => Ok(None),
                };
                match produced {
                    Ok(Some(out)) => {
                        let forward =
                            Message::stream(Endpoint::Overlay, 0, Endpoint::DataTask, 0, out);
                        if qdata_tx.send(forward).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        error!("[{}] overlay failed: {err}", overlay.name());
                        let _ = qsotp_tx
                            .send(Message::signal(
                                Endpoint::Overlay,
                                0,
                                Endpoint::Sotp,
                                0,
                                Signal::Terminate,
                            ))
                            .await;
                        break;
                    }
                }
            }
        }
    }
    info!("[{}] terminated", overlay.name());
}

/// Server overlay actor. Workers are attached by the router through the
/// link channel; a module accepts exactly one worker (multi-handler
/// operation is not supported).
pub async fn run_server_overlay(
    mut overlay: Box<dyn ServerOverlay>,
    id: u32,
    mut rx: Inbox,
    mut link_rx: mpsc::Receiver<WorkerLink>,
    qsotp_tx: Outbox,
) {
    let mut worker: Option<WorkerLink> = None;
    loop {
        tokio::select! {
            link = link_rx.recv() => {
                let Some(link) = link else { break };
                if worker.is_some() {
                    error!(
                        "[{}] only accepts one worker, rejecting worker {}",
                        overlay.name(),
                        link.worker_id
                    );
                    continue;
                }
                info!(
                    "[{}] bound to worker {} (session {:#04x})",
                    overlay.name(),
                    link.worker_id,
                    link.session_id
                );
                worker = Some(link);
            }
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match &msg.content {
                    Content::Signal(Signal::Terminate) => {
                        debug!("[{}] terminate received", overlay.name());
                        if let Some(link) = &worker {
                            let _ = link
                                .data_tx
                                .send(Message::signal(
                                    Endpoint::Overlay,
                                    id,
                                    Endpoint::DataTask,
                                    link.worker_id,
                                    Signal::Terminate,
                                ))
                                .await;
                        }
                        break;
                    }
                    Content::Signal(Signal::CommsFinished) | Content::Signal(Signal::CommsBroken) => {
                        // Single-session operation: a finished or broken
                        // session takes the whole server down with it.
                        let _ = qsotp_tx
                            .send(Message::signal(
                                Endpoint::Overlay,
                                id,
                                Endpoint::Router,
                                0,
                                Signal::Terminate,
                            ))
                            .await;
                    }
                    Content::Signal(_) => {}
                    Content::Stream(data) => {
                        let produced = match msg.sender {
                            Endpoint::Input => overlay.process_input(data.clone()).await,
                            Endpoint::Worker => {
                                overlay.process_sotp(msg.sender_id, data.clone()).await
                            }
                            _ => Ok(None),
                        };
                        match produced {
                            Ok(Some(out)) => {
                                if let Some(link) = &worker {
                                    let forward = Message::stream(
                                        Endpoint::Overlay,
                                        id,
                                        Endpoint::DataTask,
                                        link.worker_id,
                                        out,
                                    );
                                    let _ = link.data_tx.send(forward).await;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                error!("[{}] overlay failed: {err}", overlay.name());
                                let _ = qsotp_tx
                                    .send(Message::signal(
                                        Endpoint::Overlay,
                                        id,
                                        Endpoint::Router,
                                        0,
                                        Signal::Terminate,
                                    ))
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
    info!("[{}] terminated", overlay.name());
}
