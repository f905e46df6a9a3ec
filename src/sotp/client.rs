#[cfg(test)]
mod client_test;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info};
use tokio::sync::Semaphore;
use tokio::time;

use super::core::Core;
use super::packet::{Packet, SyncType, FLAG_NONE, FLAG_PUSH, FLAG_SYNC};
use super::{Status, MAX_SEQ_NUMBER};
use crate::error::{Error, Result};
use crate::message::{Content, Endpoint, Inbox, Message, Outbox, Signal};

/// Session lifecycle from the initiator side.
///
/// The worker is a plain state machine: it consumes one message at a time
/// and returns the messages to emit. The async driver ([`run`]) owns the
/// inbox, the timeouts and the retry clock.
pub struct ClientWorker {
    core: Core,
    /// True while a response to our last transmission is outstanding.
    pub wait_reply: bool,
    /// Set when the first overlay payload has fully left the buffer;
    /// releases the input bootstrap gate.
    pub sotp_first_push: bool,
    transceiving: bool,
    old_status: Option<Status>,
    sid: Option<u8>,
    tag: u16,
    seq_number: u16,
    comms_broken: bool,
    pub exit: bool,
}

impl ClientWorker {
    pub fn new(key: &[u8], max_retries: u32, max_size: usize, tag: u16) -> Result<Self> {
        Ok(ClientWorker {
            core: Core::new(key, max_retries, max_size)?,
            wait_reply: false,
            sotp_first_push: false,
            transceiving: false,
            old_status: None,
            sid: None,
            tag,
            seq_number: 1,
            comms_broken: false,
            exit: false,
        })
    }

    pub fn status(&self) -> Status {
        self.core.status()
    }

    pub fn seq_number(&self) -> u16 {
        self.seq_number
    }

    #[cfg(test)]
    pub(crate) fn force_seq_number(&mut self, seq: u16) {
        self.seq_number = seq;
    }

    fn next_seq(&mut self) -> u16 {
        self.seq_number = self.seq_number.wrapping_add(1);
        self.seq_number
    }

    fn session_id(&self) -> u8 {
        self.sid.unwrap_or(0)
    }

    // ---- shape checks -------------------------------------------------

    fn check_init_response(&self, packet: &Packet) -> bool {
        packet.has_main_fields() && packet.is_sync_type(SyncType::ResponseAuth)
    }

    // The data-length/content agreement is already enforced by the codec,
    // so a work response only needs the session shape.
    fn check_work_response(&self, packet: &Packet) -> bool {
        packet.has_main_fields()
    }

    /// A reinit is due when the packet being acknowledged carried the
    /// next-to-last representable sequence number: the Reinit control
    /// itself then takes the last one instead of wrapping.
    fn check_reinitialization(&self, packet: &Packet) -> Result<bool> {
        let last_sent = self.core.last_sent.as_ref().ok_or(Error::ErrNoPacketSent)?;
        if last_sent.seq_number != packet.ack {
            return Ok(false);
        }
        if last_sent.seq_number != MAX_SEQ_NUMBER - 1 {
            return Ok(false);
        }
        info!("reinitialization is needed");
        Ok(true)
    }

    fn check_for_stop(&self, _packet: &Packet) -> bool {
        true
    }

    // ---- packet builders ----------------------------------------------

    /// Initial request: session 0, the 2-byte overlay tag as content.
    fn generate_init_packet(&self) -> Packet {
        Packet {
            session_id: 0,
            seq_number: self.seq_number,
            ack: 0,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::RequestAuth),
            content: Bytes::copy_from_slice(&self.tag.to_be_bytes()),
        }
    }

    fn generate_poll_packet(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::Poll),
            content: Bytes::new(),
        }
    }

    fn generate_term_response_packet(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        }
    }

    fn generate_reinit_packet(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::Reinit),
            content: Bytes::new(),
        }
    }

    fn generate_terminate_packet(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_SYNC,
            sync_type: Some(SyncType::Terminate),
            content: Bytes::new(),
        }
    }

    fn generate_transfer_packet(&mut self, packet: &Packet, content: Bytes, push: bool) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: if push { FLAG_PUSH } else { FLAG_NONE },
            sync_type: None,
            content,
        }
    }

    fn generate_ack_packet(&mut self, packet: &Packet) -> Packet {
        Packet {
            session_id: self.session_id(),
            seq_number: self.next_seq(),
            ack: packet.seq_number,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        }
    }

    // ---- message helpers ----------------------------------------------

    fn to_wrapper(&self, packet: &Packet) -> Result<Message> {
        Ok(Message::stream(
            Endpoint::Sotp,
            0,
            Endpoint::Wrapper,
            0,
            packet.marshal()?,
        ))
    }

    fn to_overlay_stream(&self, data: Bytes) -> Message {
        Message::stream(Endpoint::Sotp, 0, Endpoint::Overlay, 0, data)
    }

    fn to_overlay_signal(&self, signal: Signal) -> Message {
        Message::signal(Endpoint::Sotp, 0, Endpoint::Overlay, 0, signal)
    }

    // ---- timeout paths ------------------------------------------------

    /// Idle tick: poll the server for queued data.
    pub fn get_poll_request(&mut self) -> Result<Vec<Message>> {
        let last_recv = self
            .core
            .last_recv
            .clone()
            .ok_or(Error::ErrNoPacketReceived)?;
        let poll = self.generate_poll_packet(&last_recv);
        let msg = self.to_wrapper(&poll)?;
        self.core.store_packets(None, Some(poll));
        Ok(vec![msg])
    }

    /// Resends the last packet, or reports the session broken once the
    /// retry budget is spent.
    pub fn look_for_retries(&mut self) -> Result<Vec<Message>> {
        if self.comms_broken {
            // Already reported; the overlay decides what happens next.
            return Ok(vec![]);
        }
        if self.core.check_for_retries() {
            error!("exceeded the maximum number of retries");
            self.comms_broken = true;
            return Ok(vec![self.to_overlay_signal(Signal::CommsBroken)]);
        }
        let packet = self.core.lost_packet()?;
        let msg = self.to_wrapper(&packet)?;
        self.core.store_packets(None, Some(packet));
        Ok(vec![msg])
    }

    // ---- state handlers -----------------------------------------------

    /// Response-Auth received: adopt the session id, then either start
    /// transferring queued overlay data or fall back to polling.
    fn do_initialize(&mut self, packet: Packet) -> Result<Vec<Message>> {
        if self.sid.is_none() {
            self.sid = Some(packet.session_id);
        }
        let to_send = if self.core.some_overlay_data() {
            debug!("overlay data queued during initialization");
            self.transceiving = true;
            self.make_transfer_packet(&packet)?
        } else {
            debug!("no overlay data, generating poll request");
            self.transceiving = false;
            self.generate_poll_packet(&packet)
        };
        self.wait_reply = true;
        let msg = self.to_wrapper(&to_send)?;
        self.core.store_packets(Some(packet), Some(to_send));
        self.core.status = Status::Working;
        Ok(vec![msg])
    }

    /// Steady state: every response may carry data; every reply we emit
    /// either continues our own transfer or acknowledges/polls.
    fn do_work(&mut self, packet: Packet) -> Result<Vec<Message>> {
        let mut response = vec![];
        let to_send;
        if packet.has_content() {
            self.core.extract_incoming_data(&packet);
            if packet.is_push() {
                let payload = self.core.decrypt_wrapper_data()?;
                response.push(self.to_overlay_stream(payload));
            }
            to_send = if self.core.some_overlay_data() {
                self.make_transfer_packet(&packet)?
            } else if packet.is_push() {
                self.generate_poll_packet(&packet)
            } else {
                self.generate_ack_packet(&packet)
            };
            response.push(self.to_wrapper(&to_send)?);
            self.wait_reply = true;
            self.transceiving = true;
            self.core.store_packets(Some(packet), Some(to_send));
        } else if self.core.some_overlay_data() {
            to_send = self.make_transfer_packet(&packet)?;
            response.push(self.to_wrapper(&to_send)?);
            self.wait_reply = true;
            self.transceiving = true;
            self.core.store_packets(Some(packet), Some(to_send));
        } else {
            self.wait_reply = false;
            self.transceiving = false;
            self.core.store_packets(Some(packet), None);
        }
        Ok(response)
    }

    fn make_transfer_packet(&mut self, packet: &Packet) -> Result<Packet> {
        let (chunk, push) = self.core.overlay_buf.get_chunk()?;
        let transfer = self.generate_transfer_packet(packet, chunk, push);
        if push && !self.core.some_overlay_data() {
            self.sotp_first_push = true;
        }
        self.core.last_sent = Some(transfer.clone());
        Ok(transfer)
    }

    /// Server asked us to terminate: confirm and tell the overlay the
    /// conversation is over.
    fn do_termination(&mut self, packet: Packet) -> Result<Vec<Message>> {
        let term = self.generate_term_response_packet(&packet);
        self.core.status = Status::Terminating;
        let msg = self.to_wrapper(&term)?;
        self.core.store_packets(Some(packet), Some(term));
        Ok(vec![self.to_overlay_signal(Signal::CommsFinished), msg])
    }

    /// Sequence space nearly exhausted: emit the Reinit control and park
    /// the current status until the server confirms.
    fn do_reinitialization(&mut self, packet: Packet) -> Result<Vec<Message>> {
        let reinit = self.generate_reinit_packet(&packet);
        self.old_status = Some(self.core.status);
        self.core.status = Status::Reinitializing;
        let msg = self.to_wrapper(&reinit)?;
        self.core.store_packets(Some(packet), Some(reinit));
        self.seq_number = 0;
        Ok(vec![msg])
    }

    fn initialize_stop(&mut self, packet: Packet) -> Result<Vec<Message>> {
        let stop = self.generate_terminate_packet(&packet);
        self.core.status = Status::Terminating;
        let msg = self.to_wrapper(&stop)?;
        self.core.store_packets(Some(packet), Some(stop));
        Ok(vec![msg])
    }

    /// Reinit confirmed: restore the parked status and resume sending.
    fn reset_session(&mut self, packet: Packet) -> Result<Vec<Message>> {
        self.core.status = self.old_status.take().unwrap_or(Status::Working);
        if self.core.some_overlay_data() {
            debug!("overlay data queued, resuming transfer after reinit");
            let to_send = self.make_transfer_packet(&packet)?;
            let msg = self.to_wrapper(&to_send)?;
            self.wait_reply = true;
            self.transceiving = true;
            self.core.store_packets(Some(packet), Some(to_send));
            Ok(vec![msg])
        } else {
            debug!("no overlay data after reinit, idling");
            self.wait_reply = false;
            self.transceiving = false;
            self.core.store_packets(Some(packet), None);
            Ok(vec![])
        }
    }

    // ---- pre-check pipeline -------------------------------------------

    fn initial_checks(
        &mut self,
        data: &Bytes,
        checker: fn(&ClientWorker, &Packet) -> bool,
        handler: fn(&mut ClientWorker, Packet) -> Result<Vec<Message>>,
    ) -> Result<Vec<Message>> {
        let packet = match Packet::unmarshal(data) {
            Ok(packet) => packet,
            Err(err) => {
                error!("malformed packet from wrapper: {err}, re-sending");
                return self.look_for_retries();
            }
        };
        if self.core.status != Status::Reinitializing && self.check_reinitialization(&packet)? {
            debug!("reinitialization request detected");
            return self.do_reinitialization(packet);
        }
        if self.core.check_termination(&packet) {
            debug!("termination request detected");
            return self.do_termination(packet);
        }
        if !checker(self, &packet) {
            error!("shape check failed for {packet}, re-sending");
            return self.look_for_retries();
        }
        if !self.core.check_confirmation(&packet)? {
            error!("ack {} does not confirm our last packet, re-sending", packet.ack);
            return self.look_for_retries();
        }
        handler(self, packet)
    }

    fn wrapper_processing(&mut self, data: &Bytes) -> Result<Vec<Message>> {
        debug!("processing wrapper data in status {}", self.core.status);
        match self.core.status {
            Status::Initializing => self.initial_checks(
                data,
                ClientWorker::check_init_response,
                ClientWorker::do_initialize,
            ),
            Status::Working => self.initial_checks(
                data,
                ClientWorker::check_work_response,
                ClientWorker::do_work,
            ),
            Status::Terminating => {
                self.core.status = Status::NotInitializing;
                Ok(vec![self.to_overlay_signal(Signal::CommsFinished)])
            }
            Status::Reinitializing => self.initial_checks(
                data,
                ClientWorker::check_work_response,
                ClientWorker::reset_session,
            ),
            Status::Stopping => self.initial_checks(
                data,
                ClientWorker::check_for_stop,
                ClientWorker::initialize_stop,
            ),
            Status::NotInitializing => Err(Error::ErrInvalidState(
                "wrapper data before session start".to_owned(),
            )),
        }
    }

    /// Payload handed over by the data-ingest task: encrypt, chunk and
    /// queue it; if the machine is idle, send the first chunk right away.
    pub fn overlay_processing(&mut self, data: &Bytes) -> Result<Vec<Message>> {
        debug!("storing {} bytes of overlay data", data.len());
        self.core.store_overlay_content(data);
        if self.sid.is_some() && !self.wait_reply && !self.transceiving {
            return self.buffer_ready();
        }
        Ok(vec![])
    }

    fn buffer_ready(&mut self) -> Result<Vec<Message>> {
        if self.core.last_sent.is_none() || self.transceiving {
            return Ok(vec![]);
        }
        let last_recv = self
            .core
            .last_recv
            .clone()
            .ok_or(Error::ErrNoPacketReceived)?;
        self.transceiving = true;
        let transfer = self.make_transfer_packet(&last_recv)?;
        Ok(vec![self.to_wrapper(&transfer)?])
    }

    // ---- entry points --------------------------------------------------

    fn stream_entry(&mut self, msg: &Message) -> Result<Vec<Message>> {
        match msg.sender {
            Endpoint::Wrapper => {
                self.core.reset_retries();
                let data = msg.stream_content().ok_or(Error::ErrInvalidSender)?;
                self.wrapper_processing(data)
            }
            Endpoint::DataTask => {
                let data = msg.stream_content().ok_or(Error::ErrInvalidSender)?;
                self.overlay_processing(data)
            }
            _ => Err(Error::ErrInvalidSender),
        }
    }

    fn signal_entry(&mut self, msg: &Message) -> Result<Vec<Message>> {
        let signal = match msg.content {
            Content::Signal(signal) => signal,
            Content::Stream(_) => return Err(Error::ErrInvalidSignal),
        };
        let mut response = vec![];
        match signal {
            Signal::Terminate => {
                debug!("terminate signal received");
                if let Some(last_recv) = self.core.last_recv.clone() {
                    if self.sid.is_some() && !self.comms_broken {
                        let term = self.generate_terminate_packet(&last_recv);
                        debug!("session active, sending termination request");
                        response.push(self.to_wrapper(&term)?);
                        self.core.store_packets(None, Some(term));
                    }
                }
                response.push(Message::signal(
                    Endpoint::Sotp,
                    0,
                    Endpoint::Wrapper,
                    0,
                    Signal::Terminate,
                ));
                response.push(Message::signal(
                    Endpoint::Sotp,
                    0,
                    Endpoint::DataTask,
                    0,
                    Signal::Terminate,
                ));
                self.exit = true;
            }
            Signal::Start if self.core.status == Status::NotInitializing => {
                debug!("start signal received");
                let init = self.generate_init_packet();
                self.wait_reply = true;
                response.push(self.to_wrapper(&init)?);
                self.core.last_sent = Some(init);
                self.core.status = Status::Initializing;
            }
            Signal::Stop => {
                debug!("stop signal received");
                self.core.status = Status::Stopping;
            }
            Signal::CommsBroken => {
                debug!("carrier reported broken communications");
                response = self.look_for_retries()?;
            }
            Signal::BufferReady if self.core.last_sent.is_some() => {
                response = self.buffer_ready()?;
            }
            _ => return Err(Error::ErrInvalidSignal),
        }
        Ok(response)
    }

    /// Single entry point for the driver; consumes one message and
    /// returns the messages to dispatch.
    pub fn entrypoint(&mut self, msg: &Message) -> Result<Vec<Message>> {
        match msg.content {
            Content::Signal(_) => self.signal_entry(msg),
            Content::Stream(_) => self.stream_entry(msg),
        }
    }
}

/// Drives the client state machine: blocks on the sotp inbox with the
/// response timeout while a reply is outstanding, or with the poll delay
/// when idle; timeouts map to the retry and poll paths respectively.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut worker: ClientWorker,
    mut qsotp: Inbox,
    wrapper_tx: Outbox,
    overlay_tx: Outbox,
    qdata_tx: Outbox,
    poll_delay: Duration,
    response_timeout: Duration,
    bootstrap: Arc<Semaphore>,
) {
    let mut released = false;
    let mut iteration = 1u64;
    loop {
        debug!(
            "client iteration {} status: {} seq: {}/{}",
            iteration,
            worker.status(),
            worker.seq_number(),
            MAX_SEQ_NUMBER
        );
        let wait = if worker.wait_reply {
            response_timeout
        } else {
            poll_delay
        };
        let answers = match time::timeout(wait, qsotp.recv()).await {
            Ok(Some(msg)) => worker.entrypoint(&msg),
            Ok(None) => break,
            Err(_) if worker.wait_reply => worker.look_for_retries(),
            Err(_) => match worker.get_poll_request() {
                // Nothing received yet: nothing to poll against.
                Err(Error::ErrNoPacketReceived) => Ok(vec![]),
                other => other,
            },
        };
        let answers = match answers {
            Ok(answers) => answers,
            Err(err) => {
                error!("client worker failed: {err}");
                let _ = overlay_tx
                    .send(Message::signal(
                        Endpoint::Sotp,
                        0,
                        Endpoint::Overlay,
                        0,
                        Signal::Terminate,
                    ))
                    .await;
                let _ = wrapper_tx
                    .send(Message::signal(
                        Endpoint::Sotp,
                        0,
                        Endpoint::Wrapper,
                        0,
                        Signal::Terminate,
                    ))
                    .await;
                break;
            }
        };
        for answer in answers {
            let tx = match answer.receiver {
                Endpoint::Wrapper => &wrapper_tx,
                Endpoint::Overlay => &overlay_tx,
                Endpoint::DataTask => &qdata_tx,
                _ => {
                    error!("invalid answer receiver {} in client loop", answer.receiver);
                    continue;
                }
            };
            if tx.send(answer).await.is_err() {
                worker.exit = true;
            }
        }
        if !released && worker.sotp_first_push {
            debug!("first push completed, releasing input gate");
            bootstrap.add_permits(1);
            released = true;
        }
        if worker.exit {
            break;
        }
        iteration += 1;
    }
    if !released {
        bootstrap.add_permits(1);
    }
    info!("client sotp terminated");
}

/// Data-ingest task: relabels overlay payloads and forwards them into the
/// sotp inbox so that only the driver mutates the state machine.
pub async fn run_data_task(mut qdata: Inbox, qsotp_tx: Outbox) {
    while let Some(msg) = qdata.recv().await {
        if msg.is_terminate() && msg.sender == Endpoint::Sotp {
            break;
        }
        if let Content::Stream(data) = msg.content {
            let forward = Message::stream(Endpoint::DataTask, 0, Endpoint::Sotp, 0, data);
            if qsotp_tx.send(forward).await.is_err() {
                break;
            }
        }
    }
    debug!("data task terminated");
}
