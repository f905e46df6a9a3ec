use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::{App, Arg};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{dispatch_to_wrappers, ClientWrapper, ServerWrapper, WrapServer, WrapperOptions};
use crate::error::{Error, Result};
use crate::message::Outbox;
use crate::registry;

/// Raw TCP carrier: each SOTP packet travels as one length-delimited
/// frame (2-byte big-endian length prefix) on a persistent stream.
pub struct TcpWrapper {
    address: String,
    options: WrapperOptions,
    stream: Option<TcpStream>,
}

/// The four tunables every client wrapper publishes, as shared arguments.
pub(crate) fn append_base_args(app: App<'static>) -> App<'static> {
    app.arg(
        Arg::with_name("max-size")
            .long("max-size")
            .takes_value(true)
            .default_value("4096")
            .help("Maximum size in bytes of the SOTP packet"),
    )
    .arg(
        Arg::with_name("poll-delay")
            .long("poll-delay")
            .takes_value(true)
            .default_value("5")
            .help("Time in seconds between pollings"),
    )
    .arg(
        Arg::with_name("response-timeout")
            .long("response-timeout")
            .takes_value(true)
            .default_value("3")
            .help("Waiting time in seconds for wrapper data"),
    )
    .arg(
        Arg::with_name("max-retries")
            .long("max-retries")
            .takes_value(true)
            .default_value("20")
            .help("Maximum number of re-synchronization retries"),
    )
}

pub(crate) fn parse_base_options(matches: &clap::ArgMatches) -> Result<WrapperOptions> {
    let max_size: usize = registry::parse_number(matches.value_of("max-size").unwrap())?;
    let poll_delay: u64 = registry::parse_number(matches.value_of("poll-delay").unwrap())?;
    let response_timeout: u64 =
        registry::parse_number(matches.value_of("response-timeout").unwrap())?;
    let max_retries: u32 = registry::parse_number(matches.value_of("max-retries").unwrap())?;
    Ok(WrapperOptions {
        max_size,
        poll_delay: Duration::from_secs(poll_delay),
        response_timeout: Duration::from_secs(response_timeout),
        max_retries,
    })
}

impl TcpWrapper {
    pub const NAME: &'static str = "tcp";
    pub const DESCRIPTION: &'static str =
        "Sends/receives SOTP packets as length-delimited frames on a raw TCP stream";

    fn arg_parser() -> App<'static> {
        append_base_args(App::new(Self::NAME).about(Self::DESCRIPTION)).arg(
            Arg::with_name("address")
                .long("address")
                .takes_value(true)
                .default_value("127.0.0.1:8998")
                .help("host:port of the far wrap server"),
        )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        Ok(TcpWrapper {
            address: matches.value_of("address").unwrap().to_owned(),
            options: parse_base_options(&matches)?,
            stream: None,
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    async fn ensure_connected(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.address).await?;
            info!("[{}] connected to {}", Self::NAME, self.address);
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap())
    }
}

pub(crate) async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(Error::ErrContentTooLarge);
    }
    let mut frame = BytesMut::with_capacity(2 + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Bytes> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = (&len_buf[..]).get_u16() as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

#[async_trait]
impl ClientWrapper for TcpWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> WrapperOptions {
        self.options
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        let result = async {
            let stream = self.ensure_connected().await?;
            write_frame(stream, &packet).await?;
            read_frame(stream).await
        }
        .await;
        if result.is_err() {
            // Reconnect on the next transaction.
            self.stream = None;
        }
        result
    }

    fn unwrap(&mut self, response: Bytes) -> Result<Bytes> {
        Ok(response)
    }
}

/// Server-side module: the frame payload already is the SOTP packet.
pub struct TcpServerWrapper;

impl TcpServerWrapper {
    pub const NAME: &'static str = "tcp";

    pub fn new(_args: &str) -> Result<Self> {
        Ok(TcpServerWrapper)
    }
}

#[async_trait]
impl ServerWrapper for TcpServerWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn unwrap(&mut self, pdu: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(pdu))
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        Ok(packet)
    }
}

/// TCP wrap server: accepts carrier connections and drives one
/// frame-in/frame-out transaction at a time against the wrap modules.
pub struct TcpWrapServer {
    address: String,
    response_timeout: Duration,
}

impl TcpWrapServer {
    pub const NAME: &'static str = "tcpserver";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about("Raw TCP listener hosting the tcp wrap module")
            .arg(
                Arg::with_name("address")
                    .long("address")
                    .takes_value(true)
                    .default_value("0.0.0.0:8998")
                    .help("host:port to listen on"),
            )
            .arg(
                Arg::with_name("response-timeout")
                    .long("response-timeout")
                    .takes_value(true)
                    .default_value("10")
                    .help("Seconds to wait for a worker response"),
            )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let response_timeout: u64 =
            registry::parse_number(matches.value_of("response-timeout").unwrap())?;
        Ok(TcpWrapServer {
            address: matches.value_of("address").unwrap().to_owned(),
            response_timeout: Duration::from_secs(response_timeout),
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    pub async fn run(self, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| Error::ErrConfig(format!("cannot bind {}: {e}", self.address)))?;
        info!("[{}] listening on {}", Self::NAME, self.address);
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("[{}] accept failed: {err}", Self::NAME);
                    continue;
                }
            };
            debug!("[{}] connection from {peer}", Self::NAME);
            let wrap_txs = wrap_txs.clone();
            let wait = self.response_timeout;
            tokio::spawn(async move {
                loop {
                    let request = match read_frame(&mut stream).await {
                        Ok(request) => request,
                        Err(_) => break,
                    };
                    match dispatch_to_wrappers(request, id, &wrap_txs, wait).await {
                        Some(response) => {
                            if write_frame(&mut stream, &response).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("[tcpserver] no module answered, dropping connection");
                            break;
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl WrapServer for TcpWrapServer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(self: Box<Self>, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        (*self).run(id, wrap_txs).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &frame).await.unwrap();
        });

        let mut wrapper = TcpWrapper::new(&format!("--address {addr}")).unwrap();
        let echoed = wrapper.wrap(Bytes::from_static(b"sotp frame")).await.unwrap();
        assert_eq!(wrapper.unwrap(echoed).unwrap().as_ref(), b"sotp frame");
    }

    #[test]
    fn test_default_tunables() {
        let wrapper = TcpWrapper::new("").unwrap();
        let options = wrapper.options();
        assert_eq!(options.max_size, 4096);
        assert_eq!(options.poll_delay, Duration::from_secs(5));
        assert_eq!(options.response_timeout, Duration::from_secs(3));
        assert_eq!(options.max_retries, 20);
    }
}
