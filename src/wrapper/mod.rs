pub mod dns;
pub mod http;
pub mod icmp;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info};
use tokio::time::timeout;

use crate::error::Result;
use crate::message::{inbox, Content, Endpoint, Inbox, Message, Outbox, Signal};

/// Tunables every client wrapper publishes; the SOTP core reads them at
/// startup.
#[derive(Debug, Clone, Copy)]
pub struct WrapperOptions {
    pub max_size: usize,
    pub poll_delay: Duration,
    pub response_timeout: Duration,
    pub max_retries: u32,
}

/// Client-side carrier codec: one `wrap` call performs one carrier
/// transaction and returns the raw carrier response; `unwrap` extracts
/// the SOTP bytes from it.
#[async_trait]
pub trait ClientWrapper: Send {
    fn name(&self) -> &str;
    fn options(&self) -> WrapperOptions;
    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes>;
    fn unwrap(&mut self, response: Bytes) -> Result<Bytes>;
}

/// Tunables a server wrap module hands to every worker spawned behind it.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub max_size: usize,
    pub max_retries: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            max_size: 4096,
            max_retries: 20,
        }
    }
}

/// Server-side carrier codec hosted by a wrap server. `unwrap` returns
/// `None` when the PDU does not belong to this module (the wrap server
/// fans every request out to all of them).
#[async_trait]
pub trait ServerWrapper: Send {
    fn name(&self) -> &str;
    fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
    }
    async fn unwrap(&mut self, pdu: Bytes) -> Result<Option<Bytes>>;
    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes>;
}

/// Carrier-side listener hosting one or more wrap modules: accepts
/// carrier transactions and drives the request/response fan-out.
#[async_trait]
pub trait WrapServer: Send {
    fn name(&self) -> &str;
    async fn run(self: Box<Self>, id: u32, wrap_txs: Vec<Outbox>) -> Result<()>;
}

/// Client wrapper actor: performs one carrier round trip per outgoing
/// SOTP packet and feeds the peer's answer back into the sotp inbox. A
/// failed transaction surfaces as CommsBroken so the core can retry.
pub async fn run_client_wrapper(
    mut wrapper: Box<dyn ClientWrapper>,
    mut rx: Inbox,
    qsotp_tx: Outbox,
) {
    while let Some(msg) = rx.recv().await {
        match msg.content {
            Content::Signal(Signal::Terminate) => break,
            Content::Signal(_) => {}
            Content::Stream(data) => {
                let response = match wrapper.wrap(data).await {
                    Ok(pdu) => wrapper.unwrap(pdu),
                    Err(err) => Err(err),
                };
                let answer = match response {
                    Ok(sotp_bytes) => {
                        Message::stream(Endpoint::Wrapper, 0, Endpoint::Sotp, 0, sotp_bytes)
                    }
                    Err(err) => {
                        error!("[{}] carrier transaction failed: {err}", wrapper.name());
                        Message::signal(
                            Endpoint::Wrapper,
                            0,
                            Endpoint::Sotp,
                            0,
                            Signal::CommsBroken,
                        )
                    }
                };
                if qsotp_tx.send(answer).await.is_err() {
                    break;
                }
            }
        }
    }
    info!("[{}] terminated", wrapper.name());
}

/// Server wrap-module actor. Carrier PDUs arriving from a wrap server are
/// unwrapped and forwarded to the router; SOTP packets coming back from a
/// worker are wrapped and pushed into the request's rendezvous queue.
pub async fn run_server_wrapper(
    mut wrapper: Box<dyn ServerWrapper>,
    id: u32,
    mut rx: Inbox,
    router_tx: Outbox,
) {
    while let Some(msg) = rx.recv().await {
        match &msg.content {
            Content::Signal(Signal::Terminate) => break,
            Content::Signal(Signal::Error) => {
                // Router could not place the packet; unblock the listener.
                if let Some(reply_to) = &msg.reply_to {
                    let _ = reply_to.send(msg.clone()).await;
                }
            }
            Content::Signal(_) => {}
            Content::Stream(data) => match msg.sender {
                Endpoint::WrapServer => match wrapper.unwrap(data.clone()).await {
                    Ok(Some(sotp_bytes)) => {
                        let forward = Message::stream(
                            Endpoint::Wrapper,
                            id,
                            Endpoint::Router,
                            0,
                            sotp_bytes,
                        )
                        .with_reply_to(msg.reply_to.clone());
                        if router_tx.send(forward).await.is_err() {
                            break;
                        }
                    }
                    // Not ours: another wrap module will claim it.
                    Ok(None) => {}
                    Err(err) => {
                        debug!("[{}] cannot unwrap carrier PDU: {err}", wrapper.name());
                    }
                },
                Endpoint::Router | Endpoint::Worker => {
                    let Some(reply_to) = msg.reply_to.clone() else {
                        error!("[{}] response without rendezvous queue", wrapper.name());
                        continue;
                    };
                    match wrapper.wrap(data.clone()).await {
                        Ok(pdu) => {
                            let answer = Message::stream(
                                Endpoint::Wrapper,
                                id,
                                Endpoint::WrapServer,
                                0,
                                pdu,
                            );
                            let _ = reply_to.send(answer).await;
                        }
                        Err(err) => {
                            error!("[{}] cannot wrap response: {err}", wrapper.name());
                        }
                    }
                }
                _ => {}
            },
        }
    }
    info!("[{}] terminated", wrapper.name());
}

/// Wrap-server fan-out: offer one carrier request to every wrap module
/// and wait on a freshly minted queue for whichever one recognises it.
/// Returns `None` on timeout or when the router answered with an error.
pub async fn dispatch_to_wrappers(
    pdu: Bytes,
    server_id: u32,
    wrap_txs: &[Outbox],
    wait: Duration,
) -> Option<Bytes> {
    let (reply_tx, mut reply_rx) = inbox();
    for tx in wrap_txs {
        let offer = Message::stream(Endpoint::WrapServer, server_id, Endpoint::Wrapper, 0, pdu.clone())
            .with_reply_to(Some(reply_tx.clone()));
        if tx.send(offer).await.is_err() {
            return None;
        }
    }
    drop(reply_tx);
    match timeout(wait, reply_rx.recv()).await {
        Ok(Some(msg)) => match msg.content {
            Content::Stream(data) => Some(data),
            Content::Signal(_) => None,
        },
        _ => None,
    }
}
