#[cfg(test)]
mod packet_test;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{HEADER_SIZE, SUB_HEADER_SIZE};
use crate::error::{Error, Result};

/// Flag values carried in the 8-bit flags field. SYNC marks a control
/// packet with a sub-header; PUSH marks the last chunk of one overlay
/// payload. They are mutually exclusive on the wire.
pub const FLAG_NONE: u8 = 0;
pub const FLAG_SYNC: u8 = 1;
pub const FLAG_PUSH: u8 = 2;

/// Sub-header selector, present iff the SYNC flag is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncType {
    RequestAuth,
    ResponseAuth,
    Reinit,
    Poll,
    Terminate,
}

impl SyncType {
    pub fn to_u8(self) -> u8 {
        match self {
            SyncType::RequestAuth => 0,
            SyncType::ResponseAuth => 1,
            SyncType::Reinit => 2,
            SyncType::Poll => 5,
            SyncType::Terminate => 6,
        }
    }
}

impl TryFrom<u8> for SyncType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(SyncType::RequestAuth),
            1 => Ok(SyncType::ResponseAuth),
            2 => Ok(SyncType::Reinit),
            5 => Ok(SyncType::Poll),
            6 => Ok(SyncType::Terminate),
            other => Err(Error::ErrUnknownSyncType(other)),
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            SyncType::RequestAuth => "RequestAuth",
            SyncType::ResponseAuth => "ResponseAuth",
            SyncType::Reinit => "Reinit",
            SyncType::Poll => "Poll",
            SyncType::Terminate => "Terminate",
        };
        write!(f, "{s}")
    }
}

/// One SOTP frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Session Id   |        Sequence Number        |      Ack      .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .     Ack       |          Data Length          |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  (Sync Type)  |                 Content ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// All multi-byte fields are big-endian. The sync-type byte is appended
/// only when the SYNC flag is set; `data_len` counts content bytes and
/// excludes the sub-header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub session_id: u8,
    pub seq_number: u16,
    pub ack: u16,
    pub flags: u8,
    pub sync_type: Option<SyncType>,
    pub content: Bytes,
}

impl Default for Packet {
    fn default() -> Self {
        Packet {
            session_id: 0,
            seq_number: 0,
            ack: 0,
            flags: FLAG_NONE,
            sync_type: None,
            content: Bytes::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sid: {}, seq: {}, ack: {}, len: {}, flags: {}, sync: {}",
            self.session_id,
            self.seq_number,
            self.ack,
            self.content.len(),
            self.flags,
            match self.sync_type {
                Some(t) => t.to_string(),
                None => "-".to_owned(),
            },
        )
    }
}

impl Packet {
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::ErrPacketTooSmall);
        }

        let reader = &mut raw.clone();

        let session_id = reader.get_u8();
        let seq_number = reader.get_u16();
        let ack = reader.get_u16();
        let data_len = reader.get_u16();
        let flags = reader.get_u8();

        let sync_type = if flags == FLAG_SYNC {
            if !reader.has_remaining() {
                return Err(Error::ErrSyncWithoutSubHeader);
            }
            Some(SyncType::try_from(reader.get_u8())?)
        } else {
            None
        };

        let content = reader.copy_to_bytes(reader.remaining());
        if data_len as usize != content.len() {
            return Err(Error::ErrDataLenMismatch {
                data_len,
                measured: content.len(),
            });
        }

        Ok(Packet {
            session_id,
            seq_number,
            ack,
            flags,
            sync_type,
            content,
        })
    }

    pub fn marshal_to(&self, writer: &mut BytesMut) -> Result<usize> {
        if self.content.len() > u16::MAX as usize {
            return Err(Error::ErrContentTooLarge);
        }

        writer.put_u8(self.session_id);
        writer.put_u16(self.seq_number);
        writer.put_u16(self.ack);
        writer.put_u16(self.content.len() as u16);
        writer.put_u8(self.flags);
        if self.flags == FLAG_SYNC {
            let sync_type = self.sync_type.ok_or(Error::ErrSyncWithoutSubHeader)?;
            writer.put_u8(sync_type.to_u8());
        }
        writer.extend_from_slice(&self.content);

        Ok(writer.len())
    }

    pub fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            HEADER_SIZE + SUB_HEADER_SIZE + self.content.len(),
        );
        self.marshal_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Reads the cleartext session id without decoding the whole frame.
    /// The router uses this to multiplex before any worker is involved.
    pub fn peek_session_id(raw: &[u8]) -> Result<u8> {
        if raw.is_empty() {
            return Err(Error::ErrPacketTooSmall);
        }
        Ok(raw[0])
    }

    pub fn is_sync(&self) -> bool {
        self.flags == FLAG_SYNC
    }

    pub fn is_push(&self) -> bool {
        self.flags == FLAG_PUSH
    }

    pub fn is_sync_type(&self, sync_type: SyncType) -> bool {
        self.is_sync() && self.sync_type == Some(sync_type)
    }

    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Non-zero session id, sequence number and ack: the shape every
    /// packet inside an established session must have.
    pub fn has_main_fields(&self) -> bool {
        self.session_id != 0 && self.seq_number != 0 && self.ack != 0
    }
}
