use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("raw is too small for a SOTP packet")]
    ErrPacketTooSmall,
    #[error("SYNC flag is set but no sub-header byte is present")]
    ErrSyncWithoutSubHeader,
    #[error("data_len `{data_len}` disagrees with measured content length `{measured}`")]
    ErrDataLenMismatch { data_len: u16, measured: usize },
    #[error("unknown sync type `{0}`")]
    ErrUnknownSyncType(u8),
    #[error("content larger than the 16-bit data_len field allows")]
    ErrContentTooLarge,

    #[error("max_size {0} exceeds the 16-bit data length space")]
    ErrMaxSizeTooLarge(usize),
    #[error("overlay buffer has no index to pop")]
    ErrOverlayBufferEmpty,
    #[error("wrapper buffer has no chunk to drain")]
    ErrWrapperBufferEmpty,

    #[error("no packet has been sent yet, cannot resend")]
    ErrNoPacketSent,
    #[error("no packet has been received yet, cannot poll")]
    ErrNoPacketReceived,
    #[error("received ack does not confirm the last sent packet")]
    ErrAckMismatch,
    #[error("maximum number of retries exceeded")]
    ErrRetriesExhausted,

    #[error("invalid state for this operation: {0}")]
    ErrInvalidState(String),
    #[error("unexpected sender on sotp entrypoint")]
    ErrInvalidSender,
    #[error("unexpected signal on sotp entrypoint")]
    ErrInvalidSignal,

    #[error("session id space exhausted")]
    ErrSessionSpaceExhausted,
    #[error("unknown session id `{0}`")]
    ErrUnknownSession(u8),
    #[error("no overlay registered for tag `{0:#06x}`")]
    ErrInvalidTag(u16),
    #[error("wrap module `{0}` is not registered")]
    ErrUnknownWrapper(u32),
    #[error("overlay module already has a bound worker")]
    ErrWorkerAlreadyBound,

    #[error("carrier transaction failed: {0}")]
    ErrCarrierFailure(String),
    #[error("carrier response has unexpected status `{0}`")]
    ErrCarrierStatus(u16),
    #[error("carrier PDU could not be decoded")]
    ErrCarrierDecode,
    #[error("encoded name exceeds the DNS length limits")]
    ErrDnsNameTooLong,
    #[error("ICMP data field exceeds 65507 bytes")]
    ErrIcmpDataTooLarge,

    #[error("configuration error: {0}")]
    ErrConfig(String),
    #[error("channel closed")]
    ErrChannelClosed,

    #[error("{0}")]
    Other(String),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, error.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::ErrCarrierFailure(error.to_string())
    }
}
