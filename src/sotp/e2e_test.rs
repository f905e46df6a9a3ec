use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use super::client::{self, ClientWorker};
use super::packet::Packet;
use super::router::{OverlayHandle, Router, WorkerLink, WrapModuleHandle};
use super::{router, MAX_SEQ_NUMBER};
use crate::message::{inbox, Endpoint, Inbox, Message, Outbox, Signal};

const KEY: &[u8] = b"secret";
const TAG: u16 = 0xab01;
const MAX_SIZE: usize = 256;
const MAX_RETRIES: u32 = 3;
const POLL_DELAY: Duration = Duration::from_millis(40);
const RESPONSE_TIMEOUT: Duration = Duration::from_millis(80);

/// Which server-to-client messages the in-memory carrier swallows.
#[derive(Clone)]
enum DropPolicy {
    None,
    Indices(Arc<Mutex<HashSet<usize>>>),
    All,
}

impl DropPolicy {
    fn drops(&self, index: usize) -> bool {
        match self {
            DropPolicy::None => false,
            DropPolicy::Indices(set) => set.lock().unwrap().contains(&index),
            DropPolicy::All => true,
        }
    }
}

struct ServerHarness {
    router_tx: Outbox,
    /// Payloads delivered to the server overlay, tagged with worker id.
    deliveries: Inbox,
    links: mpsc::Receiver<WorkerLink>,
}

/// One router with one wrap module (id 1) and one overlay registered.
fn start_server(key: &[u8]) -> (ServerHarness, Inbox) {
    let mut r = Router::new(key);
    let (wrap_tx, wrap_rx) = inbox();
    r.register_wrap_module(WrapModuleHandle {
        id: 1,
        name: "loopback".to_owned(),
        tx: wrap_tx,
        max_size: MAX_SIZE,
        max_retries: MAX_RETRIES,
    });
    let (overlay_tx, deliveries) = inbox();
    let (link_tx, links) = mpsc::channel(8);
    r.register_overlay(OverlayHandle {
        id: 1,
        name: "recorder".to_owned(),
        tag: TAG,
        tx: overlay_tx,
        link_tx,
    });
    let (router_tx, router_rx) = inbox();
    tokio::spawn(router::run(r, router_rx, router_tx.clone()));
    (
        ServerHarness {
            router_tx,
            deliveries,
            links,
        },
        wrap_rx,
    )
}

/// The wrap-module side of the in-memory carrier: every reply the router
/// emits is pushed into the per-request rendezvous queue, exactly like a
/// wrap module answering its wrap server.
fn start_wrap_module(mut wrap_rx: Inbox) {
    tokio::spawn(async move {
        while let Some(msg) = wrap_rx.recv().await {
            if msg.is_terminate() {
                break;
            }
            if let Some(reply_to) = msg.reply_to.clone() {
                let _ = reply_to.send(msg).await;
            }
        }
    });
}

struct ClientHarness {
    qsotp_tx: Outbox,
    qdata_tx: Outbox,
    /// Payloads and signals the sotp layer sends to the client overlay.
    from_sotp: Inbox,
    /// Every client-to-server packet, in order.
    sent: Arc<Mutex<Vec<Packet>>>,
}

/// A full client stack bridged straight onto the router inbox: the
/// "wrapper" forwards marshalled packets as wrap-module traffic and pumps
/// carrier replies back into the sotp inbox.
fn start_client(server_tx: Outbox, drop_policy: DropPolicy, initial_seq: Option<u16>) -> ClientHarness {
    let mut worker = ClientWorker::new(KEY, MAX_RETRIES, MAX_SIZE, TAG).unwrap();
    if let Some(seq) = initial_seq {
        worker.force_seq_number(seq);
    }

    let (qsotp_tx, qsotp_rx) = inbox();
    let (qdata_tx, qdata_rx) = inbox();
    let (overlay_tx, from_sotp) = inbox();
    let (to_wrapper_tx, mut to_wrapper_rx) = inbox();
    let bootstrap = Arc::new(Semaphore::new(0));

    tokio::spawn(client::run(
        worker,
        qsotp_rx,
        to_wrapper_tx,
        overlay_tx,
        qdata_tx.clone(),
        POLL_DELAY,
        RESPONSE_TIMEOUT,
        bootstrap,
    ));
    tokio::spawn(client::run_data_task(qdata_rx, qsotp_tx.clone()));

    // Client-to-server direction, with packet capture.
    let sent = Arc::new(Mutex::new(Vec::new()));
    let (reply_tx, mut reply_rx) = inbox();
    {
        let sent = Arc::clone(&sent);
        tokio::spawn(async move {
            while let Some(msg) = to_wrapper_rx.recv().await {
                if msg.is_terminate() {
                    break;
                }
                let Some(data) = msg.stream_content() else {
                    continue;
                };
                if let Ok(packet) = Packet::unmarshal(data) {
                    sent.lock().unwrap().push(packet);
                }
                let forward =
                    Message::stream(Endpoint::Wrapper, 1, Endpoint::Router, 0, data.clone())
                        .with_reply_to(Some(reply_tx.clone()));
                if server_tx.send(forward).await.is_err() {
                    break;
                }
            }
        });
    }

    // Server-to-client direction, subject to the drop policy.
    {
        let qsotp_tx = qsotp_tx.clone();
        tokio::spawn(async move {
            let mut index = 0usize;
            while let Some(msg) = reply_rx.recv().await {
                let dropped = drop_policy.drops(index);
                index += 1;
                if dropped {
                    continue;
                }
                if let Some(data) = msg.stream_content() {
                    let forward =
                        Message::stream(Endpoint::Wrapper, 0, Endpoint::Sotp, 0, data.clone());
                    if qsotp_tx.send(forward).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    ClientHarness {
        qsotp_tx,
        qdata_tx,
        from_sotp,
        sent,
    }
}

async fn start_session(client: &ClientHarness) {
    let start = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Start);
    client.qsotp_tx.send(start).await.unwrap();
}

async fn submit_payload(client: &ClientHarness, payload: &[u8]) {
    let msg = Message::stream(
        Endpoint::Overlay,
        0,
        Endpoint::DataTask,
        0,
        Bytes::copy_from_slice(payload),
    );
    client.qdata_tx.send(msg).await.unwrap();
}

async fn next_delivery(rx: &mut Inbox) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed");
        if msg.is_stream() {
            return msg;
        }
    }
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let (mut server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    let mut client = start_client(server.router_tx.clone(), DropPolicy::None, None);

    start_session(&client).await;
    submit_payload(&client, b"hello\n").await;

    // Uplink: the payload surfaces at the server overlay in one piece.
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().as_ref(), b"hello\n");

    // Downlink: the overlay answers through the worker's data queue and
    // the client overlay receives the echo.
    let link = server.links.recv().await.unwrap();
    link.data_tx
        .send(Message::stream(
            Endpoint::Overlay,
            1,
            Endpoint::DataTask,
            link.worker_id,
            Bytes::from_static(b"hello\n"),
        ))
        .await
        .unwrap();

    let echoed = next_delivery(&mut client.from_sotp).await;
    assert_eq!(echoed.stream_content().unwrap().as_ref(), b"hello\n");
}

#[tokio::test]
async fn test_chunking_large_payload() {
    let (mut server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    let client = start_client(server.router_tx.clone(), DropPolicy::None, None);

    start_session(&client).await;
    let payload = vec![0x5a; 10_000];
    submit_payload(&client, &payload).await;

    // The whole payload arrives at the server overlay in one delivery.
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().len(), 10_000);

    // At the wrapper boundary: at least 40 data packets, exactly one PUSH.
    let sent = client.sent.lock().unwrap();
    let data_packets: Vec<_> = sent.iter().filter(|p| p.has_content() && p.session_id != 0).collect();
    assert!(data_packets.len() >= 40, "saw {} data packets", data_packets.len());
    assert_eq!(data_packets.iter().filter(|p| p.is_push()).count(), 1);
}

#[tokio::test]
async fn test_reinit_preserves_data_flow() {
    let (mut server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    // Start the counter near the top of the sequence space so the reinit
    // fires on the first working exchange.
    let client = start_client(
        server.router_tx.clone(),
        DropPolicy::None,
        Some(MAX_SEQ_NUMBER - 3),
    );

    start_session(&client).await;
    submit_payload(&client, b"first payload").await;
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().as_ref(), b"first payload");

    // The counter crosses the top of the sequence space around here; user
    // data must keep flowing across the reinit.
    tokio::time::sleep(RESPONSE_TIMEOUT * 2).await;
    submit_payload(&client, b"second payload").await;
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().as_ref(), b"second payload");

    let sent = client.sent.lock().unwrap();
    let reinit_idx = sent
        .iter()
        .position(|p| p.is_sync_type(super::packet::SyncType::Reinit))
        .expect("no reinit control observed");
    assert_eq!(sent[reinit_idx].seq_number, MAX_SEQ_NUMBER);
    assert_eq!(
        sent.iter()
            .filter(|p| p.is_sync_type(super::packet::SyncType::Reinit))
            .count(),
        1
    );
    // The counter restarted right after the reinit control.
    assert_eq!(sent[reinit_idx + 1].seq_number, 1);
}

#[tokio::test]
async fn test_retry_resends_with_same_seq_and_recovers() {
    let (mut server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    // Swallow the second server reply (the response to the first poll).
    let dropped = Arc::new(Mutex::new(HashSet::from([1usize])));
    let client = start_client(
        server.router_tx.clone(),
        DropPolicy::Indices(dropped),
        None,
    );

    start_session(&client).await;

    // Give the exchange time for: init, poll, (dropped), resend, reply.
    tokio::time::sleep(RESPONSE_TIMEOUT * 4).await;

    let sent = client.sent.lock().unwrap();
    let polls: Vec<_> = sent
        .iter()
        .filter(|p| p.is_sync_type(super::packet::SyncType::Poll))
        .collect();
    assert!(polls.len() >= 2);
    // The resent poll reuses the original sequence number.
    assert_eq!(polls[0].seq_number, polls[1].seq_number);
    drop(sent);

    // Recovery: the tunnel still works end to end.
    submit_payload(&client, b"still alive").await;
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().as_ref(), b"still alive");
}

#[tokio::test]
async fn test_retries_exhausted_emits_comms_broken() {
    let (server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    let mut client = start_client(server.router_tx.clone(), DropPolicy::All, None);

    start_session(&client).await;

    // All responses are swallowed: the init is resent max_retries times,
    // then the overlay hears exactly one CommsBroken.
    let msg = timeout(Duration::from_secs(5), client.from_sotp.recv())
        .await
        .expect("no CommsBroken before timeout")
        .unwrap();
    assert!(msg.is_signal(Signal::CommsBroken));

    let transmitted = client.sent.lock().unwrap().len();
    let inits = client
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.is_sync_type(super::packet::SyncType::RequestAuth))
        .count();
    assert_eq!(inits, 1 + MAX_RETRIES as usize);

    // After the report the core goes quiet: no resends, no second signal.
    tokio::time::sleep(RESPONSE_TIMEOUT * 3).await;
    assert_eq!(client.sent.lock().unwrap().len(), transmitted);
    assert!(
        timeout(Duration::from_millis(50), client.from_sotp.recv())
            .await
            .is_err(),
        "only one CommsBroken may be emitted"
    );
}

#[tokio::test]
async fn test_two_concurrent_clients_are_isolated() {
    let (mut server, wrap_rx) = start_server(KEY);
    start_wrap_module(wrap_rx);
    let client_a = start_client(server.router_tx.clone(), DropPolicy::None, None);
    let client_b = start_client(server.router_tx.clone(), DropPolicy::None, None);

    start_session(&client_a).await;
    start_session(&client_b).await;
    submit_payload(&client_a, b"from client a").await;
    submit_payload(&client_b, b"from client b").await;

    let first = next_delivery(&mut server.deliveries).await;
    let second = next_delivery(&mut server.deliveries).await;
    let mut payloads = vec![
        first.stream_content().unwrap().to_vec(),
        second.stream_content().unwrap().to_vec(),
    ];
    payloads.sort();
    assert_eq!(payloads, vec![b"from client a".to_vec(), b"from client b".to_vec()]);
    // Two distinct workers were spawned.
    assert_ne!(first.sender_id, second.sender_id);

    // Distinct session ids on the wire.
    let sid_a = client_a
        .sent
        .lock()
        .unwrap()
        .iter()
        .find_map(|p| (p.session_id != 0).then_some(p.session_id))
        .unwrap();
    let sid_b = client_b
        .sent
        .lock()
        .unwrap()
        .iter()
        .find_map(|p| (p.session_id != 0).then_some(p.session_id))
        .unwrap();
    assert_ne!(sid_a, sid_b);

    // Terminating one session leaves the other alive.
    client_a
        .qsotp_tx
        .send(Message::signal(
            Endpoint::Overlay,
            0,
            Endpoint::Sotp,
            0,
            Signal::Terminate,
        ))
        .await
        .unwrap();
    tokio::time::sleep(POLL_DELAY * 2).await;
    submit_payload(&client_b, b"b survives").await;
    let delivered = next_delivery(&mut server.deliveries).await;
    assert_eq!(delivered.stream_content().unwrap().as_ref(), b"b survives");
}
