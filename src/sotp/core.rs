
use bytes::Bytes;
use log::debug;

use super::buffer::{Index, OverlayBuffer, WrapperBuffer};
use super::cipher::StreamCipher;
use super::packet::{Packet, SyncType};
use super::Status;
use crate::error::{Error, Result};

/// State shared by the client state machine and the per-session server
/// worker: cipher handle, retry accounting, the last packet in each
/// direction and the two buffers.
pub struct Core {
    pub(crate) cipher: StreamCipher,
    pub(crate) status: Status,
    pub(crate) max_retries: u32,
    pub(crate) retries: u32,
    pub(crate) max_size: usize,
    pub(crate) last_sent: Option<Packet>,
    pub(crate) last_recv: Option<Packet>,
    pub(crate) overlay_buf: OverlayBuffer,
    pub(crate) wrapper_buf: WrapperBuffer,
}

impl Core {
    pub fn new(key: &[u8], max_retries: u32, max_size: usize) -> Result<Self> {
        if max_size > (1 << 16) {
            return Err(Error::ErrMaxSizeTooLarge(max_size));
        }
        Ok(Core {
            cipher: StreamCipher::new(key),
            status: Status::NotInitializing,
            max_retries,
            retries: 0,
            max_size,
            last_sent: None,
            last_recv: None,
            overlay_buf: OverlayBuffer::new(),
            wrapper_buf: WrapperBuffer::new(),
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Encrypts one overlay payload, splits the ciphertext into chunks of
    /// at most `max_size` bytes, and queues it for transmission.
    pub fn store_overlay_content(&mut self, data: &[u8]) {
        let ciphertext = self.cipher.crypt(data);
        let index = Index::split(ciphertext, self.max_size);
        debug!("queueing overlay payload: {} chunk(s)", index.len());
        self.overlay_buf.add_index(index);
    }

    pub fn some_overlay_data(&self) -> bool {
        self.overlay_buf.any_index()
    }

    /// Concatenates the chunks received since the last PUSH, decrypts and
    /// returns the reassembled payload.
    pub fn decrypt_wrapper_data(&mut self) -> Result<Bytes> {
        let ciphertext = self.wrapper_buf.drain()?;
        Ok(self.cipher.crypt(&ciphertext))
    }

    /// Buffers the content of a data-bearing packet for reassembly.
    pub fn extract_incoming_data(&mut self, packet: &Packet) {
        if !packet.has_content() {
            return;
        }
        self.wrapper_buf.add_chunk(packet.content.clone());
    }

    /// Returns true when the retry budget is exhausted (and resets the
    /// counter); otherwise counts the attempt.
    pub fn check_for_retries(&mut self) -> bool {
        if self.retries == self.max_retries {
            self.retries = 0;
            return true;
        }
        self.retries += 1;
        false
    }

    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }

    /// The packet to resend on a retry.
    pub fn lost_packet(&self) -> Result<Packet> {
        self.last_sent.clone().ok_or(Error::ErrNoPacketSent)
    }

    /// A valid response acknowledges our last transmission.
    pub fn check_confirmation(&self, packet: &Packet) -> Result<bool> {
        let last_sent = self.last_sent.as_ref().ok_or(Error::ErrNoPacketSent)?;
        Ok(last_sent.seq_number == packet.ack)
    }

    pub fn check_termination(&self, packet: &Packet) -> bool {
        packet.has_main_fields() && packet.is_sync_type(SyncType::Terminate)
    }

    pub fn store_packets(&mut self, recv: Option<Packet>, sent: Option<Packet>) {
        if let Some(sent) = sent {
            debug!(
                "storing sent packet seq: {} ack: {}",
                sent.seq_number, sent.ack
            );
            self.last_sent = Some(sent);
        }
        if let Some(recv) = recv {
            debug!(
                "storing recv packet seq: {} ack: {}",
                recv.seq_number, recv.ack
            );
            self.last_recv = Some(recv);
        }
    }
}
