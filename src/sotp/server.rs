
use bytes::Bytes;
use log::{debug, error, info};

use super::core::Core;
use super::packet::{Packet, SyncType, FLAG_NONE, FLAG_PUSH};
use super::Status;
use crate::error::{Error, Result};
use crate::message::{Content, Endpoint, Inbox, Message, Outbox, Signal};

/// Session lifecycle from the responder side. A worker starts in
/// `Working`: the Request-Auth/Response-Auth exchange is owned by the
/// router, which hands the worker the last packet it sent on its behalf.
pub struct ServerWorker {
    core: Core,
    pub id: u32,
    pub sid: u8,
    overlay_id: u32,
    seq_number: u16,
    pub exit: bool,
}

impl ServerWorker {
    pub fn new(
        key: &[u8],
        max_retries: u32,
        max_size: usize,
        id: u32,
        sid: u8,
        overlay_id: u32,
        last_sent: Packet,
    ) -> Result<Self> {
        let seq_number = last_sent.seq_number;
        let mut core = Core::new(key, max_retries, max_size)?;
        core.status = Status::Working;
        core.last_sent = Some(last_sent);
        Ok(ServerWorker {
            core,
            id,
            sid,
            overlay_id,
            seq_number,
            exit: false,
        })
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn seq_number(&self) -> u16 {
        self.seq_number
    }

    fn next_seq(&mut self) -> u16 {
        self.seq_number = self.seq_number.wrapping_add(1);
        self.seq_number
    }

    // ---- request shapes ------------------------------------------------

    fn seems_polling_request(&self, packet: &Packet) -> bool {
        packet.is_sync_type(SyncType::Poll) && !packet.has_content()
    }

    fn seems_data_chunk(&self, packet: &Packet) -> bool {
        packet.flags == FLAG_NONE && packet.has_content()
    }

    fn seems_data_push(&self, packet: &Packet) -> bool {
        packet.flags == FLAG_PUSH && packet.sync_type.is_none() && packet.has_content()
    }

    fn seems_confirmation(&self, packet: &Packet) -> bool {
        packet.flags == FLAG_NONE && !packet.has_content()
    }

    fn seems_reinit_request(&self, packet: &Packet) -> bool {
        packet.is_sync_type(SyncType::Reinit) && !packet.has_content()
    }

    /// A valid client frame is a poll, a confirmation, or a data chunk
    /// (with or without PUSH), all with the established-session shape.
    fn check_work_request(&self, packet: &Packet) -> bool {
        if !packet.has_main_fields() {
            return false;
        }
        self.seems_polling_request(packet)
            || self.seems_confirmation(packet)
            || self.seems_data_chunk(packet)
            || self.seems_data_push(packet)
    }

    fn check_reinitialization(&self, packet: &Packet) -> bool {
        self.seems_reinit_request(packet)
    }

    // ---- packet builders ----------------------------------------------

    fn generate_poll_response(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.sid,
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        }
    }

    /// Reinit response: our side of the sequence space starts over at 1.
    fn generate_reinit_response(&mut self, packet: &Packet) -> Packet {
        self.seq_number = 1;
        Packet {
            session_id: self.sid,
            seq_number: self.seq_number,
            ack: packet.seq_number,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        }
    }

    fn generate_transfer_packet(&mut self, packet: &Packet, content: Bytes, push: bool) -> Packet {
        Packet {
            session_id: self.sid,
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: if push { FLAG_PUSH } else { FLAG_NONE },
            sync_type: None,
            content,
        }
    }

    fn make_transfer_packet(&mut self, packet: &Packet) -> Result<Packet> {
        let (chunk, push) = self.core.overlay_buf.get_chunk()?;
        if push {
            debug!("worker {} transfer packet carries PUSH", self.id);
        }
        Ok(self.generate_transfer_packet(packet, chunk, push))
    }

    // ---- message helpers ----------------------------------------------

    fn to_router(&self, packet: &Packet, reply_to: Option<Outbox>) -> Result<Message> {
        Ok(
            Message::stream(Endpoint::Worker, self.id, Endpoint::Router, 0, packet.marshal()?)
                .with_reply_to(reply_to),
        )
    }

    fn to_overlay_stream(&self, data: Bytes) -> Message {
        Message::stream(Endpoint::Worker, self.id, Endpoint::Overlay, self.overlay_id, data)
    }

    fn to_overlay_signal(&self, signal: Signal) -> Message {
        Message::signal(Endpoint::Worker, self.id, Endpoint::Overlay, self.overlay_id, signal)
    }

    // ---- handlers ------------------------------------------------------

    /// One reply per request: deliver any pushed payload to the overlay,
    /// then answer with the next outbound chunk if one is queued (the only
    /// way the server can push data) or an empty poll response.
    fn do_work(&mut self, packet: Packet, reply_to: Option<Outbox>) -> Result<Vec<Message>> {
        let mut response = vec![];
        if packet.has_content() {
            self.core.extract_incoming_data(&packet);
            if packet.is_push() {
                let payload = self.core.decrypt_wrapper_data()?;
                response.push(self.to_overlay_stream(payload));
            }
        }
        let to_send = if self.core.some_overlay_data() {
            self.make_transfer_packet(&packet)?
        } else {
            self.generate_poll_response(&packet)
        };
        response.push(self.to_router(&to_send, reply_to)?);
        self.core.store_packets(Some(packet), Some(to_send));
        Ok(response)
    }

    fn do_termination(&mut self, packet: Packet, reply_to: Option<Outbox>) -> Result<Vec<Message>> {
        info!("worker {} starting termination", self.id);
        let response = self.generate_poll_response(&packet);
        self.core.status = Status::Terminating;
        let msg = self.to_router(&response, reply_to)?;
        self.core.store_packets(Some(packet), Some(response));
        Ok(vec![self.to_overlay_signal(Signal::CommsFinished), msg])
    }

    fn do_reinitialization(
        &mut self,
        packet: Packet,
        reply_to: Option<Outbox>,
    ) -> Result<Vec<Message>> {
        let response = self.generate_reinit_response(&packet);
        let msg = self.to_router(&response, reply_to)?;
        self.core.store_packets(Some(packet), Some(response));
        Ok(vec![msg])
    }

    fn resend_lost(&mut self, reply_to: Option<Outbox>) -> Result<Vec<Message>> {
        let packet = self.core.lost_packet()?;
        Ok(vec![self.to_router(&packet, reply_to)?])
    }

    // ---- pre-check pipeline -------------------------------------------

    fn initial_checks(&mut self, msg: &Message) -> Result<Vec<Message>> {
        let data = msg.stream_content().ok_or(Error::ErrInvalidSender)?;
        let reply_to = msg.reply_to.clone();
        let packet = match Packet::unmarshal(data) {
            Ok(packet) => packet,
            Err(err) => {
                error!("worker {}: malformed packet ({err}), re-sending", self.id);
                return self.resend_lost(reply_to);
            }
        };
        if self.check_reinitialization(&packet) {
            return self.do_reinitialization(packet, reply_to);
        }
        if self.core.check_termination(&packet) {
            debug!("worker {}: termination packet detected", self.id);
            return self.do_termination(packet, reply_to);
        }
        if !self.check_work_request(&packet) {
            error!("worker {}: request shape check failed, re-sending", self.id);
            return self.resend_lost(reply_to);
        }
        if !self.core.check_confirmation(&packet)? {
            error!("worker {}: cannot confirm our last packet, re-sending", self.id);
            return self.resend_lost(reply_to);
        }
        self.do_work(packet, reply_to)
    }

    // ---- entry points --------------------------------------------------

    fn handle_stream(&mut self, msg: &Message) -> Result<Vec<Message>> {
        if msg.sender == Endpoint::DataTask {
            let data = msg.stream_content().ok_or(Error::ErrInvalidSender)?;
            debug!("worker {}: storing {} bytes of overlay data", self.id, data.len());
            self.core.store_overlay_content(data);
            return Ok(vec![]);
        }
        match self.core.status {
            Status::Working => self.initial_checks(msg),
            Status::Terminating => Ok(vec![self.to_overlay_signal(Signal::CommsFinished)]),
            other => Err(Error::ErrInvalidState(format!(
                "server worker in status {other}"
            ))),
        }
    }

    fn handle_signal(&mut self, msg: &Message) -> Result<Vec<Message>> {
        if msg.is_terminate() {
            self.exit = true;
        }
        Ok(vec![])
    }

    pub fn entrypoint(&mut self, msg: &Message) -> Result<Vec<Message>> {
        match msg.content {
            Content::Signal(_) => self.handle_signal(msg),
            Content::Stream(_) => self.handle_stream(msg),
        }
    }
}

/// Per-session worker task. The router owns the inbox sender; the overlay
/// pushes outbound payloads through the data forwarder, which relabels
/// them so the worker remains the only mutator of its state.
pub async fn run(
    mut worker: ServerWorker,
    mut inbox: Inbox,
    router_tx: Outbox,
    overlay_tx: Outbox,
) {
    info!("worker {} started for session {:#04x}", worker.id, worker.sid);
    while let Some(msg) = inbox.recv().await {
        let answers = match worker.entrypoint(&msg) {
            Ok(answers) => answers,
            Err(err) => {
                error!("worker {} failed: {err}", worker.id);
                let _ = overlay_tx
                    .send(worker.to_overlay_signal(Signal::CommsBroken))
                    .await;
                break;
            }
        };
        for answer in answers {
            let tx = match answer.receiver {
                Endpoint::Router => &router_tx,
                Endpoint::Overlay => &overlay_tx,
                _ => {
                    error!("worker {}: invalid receiver {}", worker.id, answer.receiver);
                    continue;
                }
            };
            if tx.send(answer).await.is_err() {
                worker.exit = true;
            }
        }
        if worker.exit {
            break;
        }
    }
    debug!("worker {} terminated", worker.id);
}

/// Relabels payloads from the overlay's data queue into the worker inbox.
pub async fn run_data_task(mut data_inbox: Inbox, worker_tx: Outbox, worker_id: u32) {
    while let Some(msg) = data_inbox.recv().await {
        if msg.is_terminate() {
            break;
        }
        if let Content::Stream(data) = msg.content {
            let forward = Message::stream(Endpoint::DataTask, 0, Endpoint::Worker, worker_id, data);
            if worker_tx.send(forward).await.is_err() {
                break;
            }
        }
    }
    debug!("worker {worker_id} data task terminated");
}
