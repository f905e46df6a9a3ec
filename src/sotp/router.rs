
use bytes::Bytes;
use log::{debug, error, info};
use rand::Rng;
use tokio::sync::mpsc;

use super::packet::{Packet, SyncType, FLAG_SYNC};
use super::server::{self, ServerWorker};
use super::{PENDING_INIT_MAX, TAG_SIZE};
use crate::error::{Error, Result};
use crate::message::{inbox, Content, Endpoint, Inbox, Message, Outbox, Signal};

/// Handle the router keeps for a registered wrap module; the tunables are
/// published by the wrapper and configure every worker spawned behind it.
pub struct WrapModuleHandle {
    pub id: u32,
    pub name: String,
    pub tx: Outbox,
    pub max_size: usize,
    pub max_retries: u32,
}

pub struct WrapServerHandle {
    pub id: u32,
    pub name: String,
    pub tx: Outbox,
}

/// Handle for a registered server overlay. `link_tx` is how the router
/// attaches a freshly spawned worker's data queue to the overlay.
pub struct OverlayHandle {
    pub id: u32,
    pub name: String,
    pub tag: u16,
    pub tx: Outbox,
    pub link_tx: mpsc::Sender<WorkerLink>,
}

/// Attachment of one worker to its overlay module.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    pub worker_id: u32,
    pub session_id: u8,
    pub data_tx: Outbox,
}

/// An established session: the 4-tuple binding a session id to its
/// worker, wrap module and overlay module.
struct Route {
    session_id: u8,
    worker_id: u32,
    worker_tx: Outbox,
    wrap_module_id: u32,
    overlay_id: u32,
}

/// Entry retained between Request-Auth and the first confirmed client
/// packet of a session.
struct PendingInit {
    session_id: u8,
    tag: u16,
    last_sent: Packet,
}

/// Maps packets to sessions, mints session ids, spawns workers and tears
/// everything down on Terminate. Owns all routing state; nothing here is
/// shared outside this actor.
pub struct Router {
    key: Vec<u8>,
    wrap_modules: Vec<WrapModuleHandle>,
    wrap_servers: Vec<WrapServerHandle>,
    overlays: Vec<OverlayHandle>,
    workers: Vec<(u32, Outbox)>,
    routes: Vec<Route>,
    pending_init: Vec<PendingInit>,
    next_worker_id: u32,
    exit: bool,
}

impl Router {
    pub fn new(key: &[u8]) -> Self {
        Router {
            key: key.to_vec(),
            wrap_modules: vec![],
            wrap_servers: vec![],
            overlays: vec![],
            workers: vec![],
            routes: vec![],
            pending_init: vec![],
            next_worker_id: 1,
            exit: false,
        }
    }

    pub fn register_wrap_module(&mut self, handle: WrapModuleHandle) {
        self.wrap_modules.push(handle);
    }

    pub fn register_wrap_server(&mut self, handle: WrapServerHandle) {
        self.wrap_servers.push(handle);
    }

    pub fn register_overlay(&mut self, handle: OverlayHandle) {
        self.overlays.push(handle);
    }

    fn error_message(&self, receiver_id: u32, reply_to: Option<Outbox>) -> Message {
        Message::signal(Endpoint::Router, 0, Endpoint::Wrapper, receiver_id, Signal::Error)
            .with_reply_to(reply_to)
    }

    fn session_exists(&self, session_id: u8) -> bool {
        self.routes.iter().any(|r| r.session_id == session_id)
            || self.pending_init.iter().any(|p| p.session_id == session_id)
    }

    fn new_session_id(&self) -> Result<u8> {
        if self.routes.len() + self.pending_init.len() >= super::SESSION_ID_SPACE - 1 {
            return Err(Error::ErrSessionSpaceExhausted);
        }
        let mut rng = rand::thread_rng();
        loop {
            let session_id: u8 = rng.gen_range(1..=u8::MAX);
            if !self.session_exists(session_id) {
                return Ok(session_id);
            }
        }
    }

    fn generate_auth_response(&self, request: &Packet, session_id: u8) -> Packet {
        Packet {
            session_id,
            seq_number: 1,
            ack: request.seq_number,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::ResponseAuth),
            content: Bytes::new(),
        }
    }

    fn valid_overlay_tag(&self, tag: u16) -> bool {
        self.overlays.iter().any(|o| o.tag == tag)
    }

    /// Session-initiation request (cleartext session id 0): validate the
    /// overlay tag, mint a session id, park it in pending_init and answer
    /// with Response-Auth through the originating wrap module.
    async fn initialize_sotp_session(&mut self, msg: Message) {
        let (sender_id, sender_tx, sender_name) =
            match self.wrap_modules.iter().find(|w| w.id == msg.sender_id) {
                Some(w) => (w.id, w.tx.clone(), w.name.clone()),
                None => {
                    error!("request from unregistered wrap module {}", msg.sender_id);
                    return;
                }
            };
        let data = match msg.stream_content() {
            Some(data) => data,
            None => return,
        };
        let packet = match Packet::unmarshal(data) {
            Ok(packet) => packet,
            Err(err) => {
                error!("cannot decode session request: {err}");
                let _ = sender_tx
                    .send(self.error_message(sender_id, msg.reply_to.clone()))
                    .await;
                return;
            }
        };
        if packet.content.len() != TAG_SIZE {
            let _ = sender_tx
                .send(self.error_message(sender_id, msg.reply_to.clone()))
                .await;
            return;
        }
        let tag = u16::from_be_bytes([packet.content[0], packet.content[1]]);
        if !self.valid_overlay_tag(tag) {
            error!("not a valid overlay tag: {tag:#06x}");
            let _ = sender_tx
                .send(self.error_message(sender_id, msg.reply_to.clone()))
                .await;
            return;
        }
        let session_id = match self.new_session_id() {
            Ok(session_id) => session_id,
            Err(err) => {
                error!("cannot mint session id: {err}");
                let _ = sender_tx
                    .send(self.error_message(sender_id, msg.reply_to.clone()))
                    .await;
                return;
            }
        };
        let response = self.generate_auth_response(&packet, session_id);
        let raw = match response.marshal() {
            Ok(raw) => raw,
            Err(err) => {
                error!("cannot marshal auth response: {err}");
                return;
            }
        };
        self.pending_init.push(PendingInit {
            session_id,
            tag,
            last_sent: response,
        });
        // Flood protection: evict the oldest pending entry beyond the cap.
        if self.pending_init.len() > PENDING_INIT_MAX {
            self.pending_init.remove(0);
        }
        debug!("session {session_id:#04x} pending, answering through wrap module {sender_name}");
        let reply = Message::stream(Endpoint::Router, 0, Endpoint::Wrapper, sender_id, raw)
            .with_reply_to(msg.reply_to.clone());
        let _ = sender_tx.send(reply).await;
    }

    /// First confirmed packet of a pending session: spawn the worker, wire
    /// it to its overlay and wrap module, and promote the pending entry to
    /// a route.
    async fn spawn_route(&mut self, msg: &Message, pending_idx: usize, router_tx: &Outbox) {
        let (session_id, tag, last_sent) = {
            let pending = &self.pending_init[pending_idx];
            (pending.session_id, pending.tag, pending.last_sent.clone())
        };
        let (overlay_id, overlay_name, overlay_tx, link_tx) =
            match self.overlays.iter().find(|o| o.tag == tag) {
                Some(o) => (o.id, o.name.clone(), o.tx.clone(), o.link_tx.clone()),
                None => {
                    error!("overlay module for tag {tag:#06x} no longer available");
                    return;
                }
            };
        let (wrap_module_id, wrap_name, max_retries, max_size) =
            match self.wrap_modules.iter().find(|w| w.id == msg.sender_id) {
                Some(w) => (w.id, w.name.clone(), w.max_retries, w.max_size),
                None => {
                    error!("wrap module {} no longer available", msg.sender_id);
                    return;
                }
            };

        let worker_id = self.next_worker_id;
        info!(
            "creating route for session {session_id:#04x} from {wrap_name} to {overlay_name}, spawning worker {worker_id}"
        );
        let worker = match ServerWorker::new(
            &self.key,
            max_retries,
            max_size,
            worker_id,
            session_id,
            overlay_id,
            last_sent,
        ) {
            Ok(worker) => worker,
            Err(err) => {
                error!("cannot create worker: {err}");
                return;
            }
        };

        let (worker_tx, worker_rx) = inbox();
        let (data_tx, data_rx) = inbox();
        tokio::spawn(server::run(worker, worker_rx, router_tx.clone(), overlay_tx));
        tokio::spawn(server::run_data_task(data_rx, worker_tx.clone(), worker_id));
        let _ = link_tx
            .send(WorkerLink {
                worker_id,
                session_id,
                data_tx,
            })
            .await;

        self.routes.push(Route {
            session_id,
            worker_id,
            worker_tx: worker_tx.clone(),
            wrap_module_id,
            overlay_id,
        });
        self.workers.push((worker_id, worker_tx));
        self.next_worker_id += 1;
        self.pending_init.remove(pending_idx);
    }

    /// Established-session traffic: worker-to-wrap goes to the route's
    /// wrap module, wrap-to-worker to the route's worker. With no match,
    /// answer the originating wrap module so its listener can unblock.
    async fn route_message(&mut self, msg: Message, session_id: u8) {
        if msg.sender == Endpoint::Worker {
            if let Some(route) = self.routes.iter().find(|r| r.session_id == session_id) {
                if let Some(wrapper) = self
                    .wrap_modules
                    .iter()
                    .find(|w| w.id == route.wrap_module_id)
                {
                    let forward = Message {
                        receiver: Endpoint::Wrapper,
                        receiver_id: wrapper.id,
                        ..msg
                    };
                    let _ = wrapper.tx.send(forward).await;
                }
            }
            return;
        }
        if let Some(route) = self.routes.iter().find(|r| r.session_id == session_id) {
            let forward = Message {
                receiver: Endpoint::Worker,
                receiver_id: route.worker_id,
                ..msg
            };
            let _ = route.worker_tx.send(forward).await;
            return;
        }
        error!("no route for session {session_id:#04x}");
        if let Some(wrapper) = self.wrap_modules.iter().find(|w| w.id == msg.sender_id) {
            let _ = wrapper
                .tx
                .send(self.error_message(wrapper.id, msg.reply_to.clone()))
                .await;
        }
    }

    async fn handle_signal(&mut self, msg: Message) {
        if !msg.is_terminate() {
            return;
        }
        info!("terminating all modules");
        for wm in &self.wrap_modules {
            let _ = wm
                .tx
                .send(Message::signal(Endpoint::Router, 0, Endpoint::Wrapper, wm.id, Signal::Terminate))
                .await;
        }
        for ws in &self.wrap_servers {
            let _ = ws
                .tx
                .send(Message::signal(Endpoint::Router, 0, Endpoint::WrapServer, ws.id, Signal::Terminate))
                .await;
        }
        for (id, tx) in &self.workers {
            let _ = tx
                .send(Message::signal(Endpoint::Router, 0, Endpoint::Worker, *id, Signal::Terminate))
                .await;
        }
        for overlay in &self.overlays {
            let _ = overlay
                .tx
                .send(Message::signal(Endpoint::Router, 0, Endpoint::Overlay, overlay.id, Signal::Terminate))
                .await;
        }
        self.exit = true;
    }

    async fn handle_stream(&mut self, msg: Message, router_tx: &Outbox) {
        let Some(data) = msg.stream_content() else {
            return;
        };
        let session_id = match Packet::peek_session_id(data) {
            Ok(session_id) => session_id,
            Err(err) => {
                error!("dropping unreadable packet: {err}");
                return;
            }
        };
        if session_id == 0 {
            info!("new session request, initializing");
            self.initialize_sotp_session(msg).await;
            return;
        }
        if msg.sender != Endpoint::Worker {
            if let Some(idx) = self
                .pending_init
                .iter()
                .position(|p| p.session_id == session_id)
            {
                self.spawn_route(&msg, idx, router_tx).await;
            }
        }
        self.route_message(msg, session_id).await;
    }
}

/// Router actor loop. `router_tx` is the sender side of `rx`, handed to
/// spawned workers as their outbox.
pub async fn run(mut router: Router, mut rx: Inbox, router_tx: Outbox) {
    info!("router starting up and waiting for messages");
    while let Some(msg) = rx.recv().await {
        match msg.content {
            Content::Signal(_) => router.handle_signal(msg).await,
            Content::Stream(_) => router.handle_stream(msg, &router_tx).await,
        }
        if router.exit {
            break;
        }
    }
    debug!("router terminated");
}
