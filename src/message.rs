use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Inbox capacity for every actor queue. Queues are bounded by policy, not
/// by protocol: one outstanding request per session keeps them shallow.
pub const INBOX_CAPACITY: usize = 64;

pub type Outbox = mpsc::Sender<Message>;
pub type Inbox = mpsc::Receiver<Message>;

pub fn inbox() -> (Outbox, Inbox) {
    mpsc::channel(INBOX_CAPACITY)
}

/// Control signals exchanged between actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Start,
    Terminate,
    Stop,
    Restart,
    CommsFinished,
    CommsBroken,
    Error,
    BufferReady,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Signal::Start => "Start",
            Signal::Terminate => "Terminate",
            Signal::Stop => "Stop",
            Signal::Restart => "Restart",
            Signal::CommsFinished => "CommsFinished",
            Signal::CommsBroken => "CommsBroken",
            Signal::Error => "Error",
            Signal::BufferReady => "BufferReady",
        };
        write!(f, "{s}")
    }
}

/// Message payload: either opaque stream bytes (usually one SOTP packet or
/// one overlay payload) or a control signal.
#[derive(Debug, Clone)]
pub enum Content {
    Stream(Bytes),
    Signal(Signal),
}

/// The actor roles addressable by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Input,
    Overlay,
    DataTask,
    Sotp,
    Wrapper,
    Router,
    Worker,
    WrapServer,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Endpoint::Input => "input",
            Endpoint::Overlay => "overlay",
            Endpoint::DataTask => "datatask",
            Endpoint::Sotp => "sotp",
            Endpoint::Wrapper => "wrapper",
            Endpoint::Router => "router",
            Endpoint::Worker => "worker",
            Endpoint::WrapServer => "wrapserver",
        };
        write!(f, "{s}")
    }
}

/// Envelope carried by every actor inbox. `reply_to` is the per-request
/// rendezvous queue minted by a wrap server so that whichever wrap module
/// recognises the carrier PDU can answer the blocked listener directly.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Endpoint,
    pub sender_id: u32,
    pub receiver: Endpoint,
    pub receiver_id: u32,
    pub content: Content,
    pub reply_to: Option<Outbox>,
}

impl Message {
    pub fn stream(
        sender: Endpoint,
        sender_id: u32,
        receiver: Endpoint,
        receiver_id: u32,
        data: Bytes,
    ) -> Self {
        Message {
            sender,
            sender_id,
            receiver,
            receiver_id,
            content: Content::Stream(data),
            reply_to: None,
        }
    }

    pub fn signal(
        sender: Endpoint,
        sender_id: u32,
        receiver: Endpoint,
        receiver_id: u32,
        signal: Signal,
    ) -> Self {
        Message {
            sender,
            sender_id,
            receiver,
            receiver_id,
            content: Content::Signal(signal),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<Outbox>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.content, Content::Stream(_))
    }

    pub fn is_signal(&self, signal: Signal) -> bool {
        matches!(self.content, Content::Signal(s) if s == signal)
    }

    pub fn is_terminate(&self) -> bool {
        self.is_signal(Signal::Terminate)
    }

    pub fn stream_content(&self) -> Option<&Bytes> {
        match &self.content {
            Content::Stream(data) => Some(data),
            Content::Signal(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_signal_predicates() {
        let m = Message::signal(Endpoint::Overlay, 0, Endpoint::Sotp, 0, Signal::Terminate);
        assert!(m.is_terminate());
        assert!(!m.is_stream());
        assert!(!m.is_signal(Signal::Start));
    }

    #[test]
    fn test_stream_content() {
        let m = Message::stream(
            Endpoint::Wrapper,
            0,
            Endpoint::Sotp,
            0,
            Bytes::from_static(b"abc"),
        );
        assert!(m.is_stream());
        assert_eq!(m.stream_content().unwrap().as_ref(), b"abc");
    }
}
