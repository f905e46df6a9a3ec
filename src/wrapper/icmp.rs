use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::{App, Arg};
use log::{debug, error, info, warn};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::tcp::{append_base_args, parse_base_options};
use super::{dispatch_to_wrappers, ClientWrapper, ServerWrapper, WrapServer, WrapperOptions};
use crate::error::{Error, Result};
use crate::message::Outbox;
use crate::registry;

/// RFC 792 echo message types.
const ECHO_REPLY: u8 = 0;
const ECHO_REQUEST: u8 = 8;
const ICMP_HEADER_LEN: usize = 8;
/// Maximum ICMP data length (65535 - IP header - ICMP header).
const MAX_ICMP_DATA: usize = 65507;

fn encode(data: &[u8]) -> String {
    base64::encode(data)
}

fn decode(data: &[u8]) -> Result<Bytes> {
    base64::decode(data)
        .map(Bytes::from)
        .map_err(|_| Error::ErrCarrierDecode)
}

/// RFC 1071 one's-complement checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

struct EchoMessage {
    msg_type: u8,
    ident: u16,
    seq: u16,
    data: Bytes,
}

impl EchoMessage {
    fn marshal(&self) -> Result<Bytes> {
        if self.data.len() > MAX_ICMP_DATA {
            return Err(Error::ErrIcmpDataTooLarge);
        }
        let mut buf = BytesMut::with_capacity(ICMP_HEADER_LEN + self.data.len());
        buf.put_u8(self.msg_type);
        buf.put_u8(0); // code
        buf.put_u16(0); // checksum placeholder
        buf.put_u16(self.ident);
        buf.put_u16(self.seq);
        buf.extend_from_slice(&self.data);
        let sum = checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Parses an ICMP message; `raw` must start at the ICMP header (the
    /// IP header already stripped).
    fn unmarshal(raw: &[u8]) -> Result<Self> {
        if raw.len() < ICMP_HEADER_LEN {
            return Err(Error::ErrCarrierDecode);
        }
        let mut reader = raw;
        let msg_type = reader.get_u8();
        let _code = reader.get_u8();
        let _checksum = reader.get_u16();
        let ident = reader.get_u16();
        let seq = reader.get_u16();
        Ok(EchoMessage {
            msg_type,
            ident,
            seq,
            data: Bytes::copy_from_slice(reader),
        })
    }
}

/// Strips the IPv4 header from a raw-socket datagram.
fn strip_ip_header(raw: &[u8]) -> Result<&[u8]> {
    if raw.is_empty() {
        return Err(Error::ErrCarrierDecode);
    }
    let ihl = ((raw[0] & 0x0f) as usize) * 4;
    raw.get(ihl..).ok_or(Error::ErrCarrierDecode)
}

/// Opens a raw ICMP socket and dresses it up as a tokio UdpSocket so the
/// rest of the module stays async. Requires elevated privileges.
fn open_raw_socket(bind: &str) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .map_err(|e| Error::ErrConfig(format!("cannot open raw ICMP socket: {e}")))?;
    let addr: SocketAddr = format!("{bind}:0")
        .parse()
        .map_err(|_| Error::ErrConfig(format!("invalid bind address {bind}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::ErrConfig(format!("cannot bind raw socket: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::ErrConfig(e.to_string()))?;
    UdpSocket::from_std(socket.into()).map_err(|e| Error::ErrConfig(e.to_string()))
}

/// ICMP echo carrier: the encoded SOTP packet rides in the data field of
/// an Echo Request; the reply rides in the matching Echo Reply.
pub struct IcmpWrapper {
    host: IpAddr,
    ident: u16,
    seq: u16,
    socket: Option<UdpSocket>,
    options: WrapperOptions,
}

impl IcmpWrapper {
    pub const NAME: &'static str = "icmp";
    pub const DESCRIPTION: &'static str =
        "Encodes/decodes SOTP packets in the data field of ICMP echo messages";

    fn arg_parser() -> App<'static> {
        append_base_args(
            App::new(Self::NAME).about(Self::DESCRIPTION).arg(
                Arg::with_name("host")
                    .long("host")
                    .takes_value(true)
                    .default_value("127.0.0.1")
                    .help("IP address of the far wrap server"),
            ),
        )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let host: IpAddr = matches
            .value_of("host")
            .unwrap()
            .parse()
            .map_err(|_| Error::ErrConfig("invalid --host address".to_owned()))?;
        let mut options = parse_base_options(&matches)?;
        // Base64 expansion must stay inside the echo data field.
        let ceiling = (MAX_ICMP_DATA / 4) * 3;
        if options.max_size > ceiling {
            warn!(
                "[{}] max_size {} exceeds the ICMP data field, clamping to {ceiling}",
                Self::NAME,
                options.max_size
            );
            options.max_size = ceiling;
        }
        Ok(IcmpWrapper {
            host,
            ident: rand::thread_rng().gen(),
            seq: 0,
            socket: None,
            options,
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    fn socket(&mut self) -> Result<&UdpSocket> {
        if self.socket.is_none() {
            self.socket = Some(open_raw_socket("0.0.0.0")?);
        }
        Ok(self.socket.as_ref().unwrap())
    }
}

#[async_trait]
impl ClientWrapper for IcmpWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> WrapperOptions {
        self.options
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        self.seq = self.seq.wrapping_add(1);
        let request = EchoMessage {
            msg_type: ECHO_REQUEST,
            ident: self.ident,
            seq: self.seq,
            data: Bytes::from(encode(&packet)),
        }
        .marshal()?;

        let ident = self.ident;
        let seq = self.seq;
        let target = SocketAddr::new(self.host, 0);
        let wait = self.options.response_timeout;
        let socket = self.socket()?;
        socket.send_to(&request, target).await?;
        debug!("[{}] echo request sent, seq {seq}", Self::NAME);

        // The raw socket sees every inbound ICMP message; keep reading
        // until our reply shows up or the carrier timeout expires.
        let deadline = tokio::time::Instant::now() + wait;
        let mut buf = vec![0u8; 65535];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::ErrCarrierFailure("echo reply timed out".to_owned()));
            }
            let (n, _) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::ErrCarrierFailure("echo reply timed out".to_owned()))??;
            let Ok(icmp) = strip_ip_header(&buf[..n]) else {
                continue;
            };
            let Ok(reply) = EchoMessage::unmarshal(icmp) else {
                continue;
            };
            if reply.msg_type == ECHO_REPLY && reply.ident == ident && reply.seq == seq {
                return Ok(reply.data);
            }
        }
    }

    fn unwrap(&mut self, response: Bytes) -> Result<Bytes> {
        decode(&response)
    }
}

/// Server-side module: the wrap server hands over the echo data field.
pub struct IcmpServerWrapper;

impl IcmpServerWrapper {
    pub const NAME: &'static str = "icmp";
    pub const DESCRIPTION: &'static str =
        "Extracts SOTP packets from ICMP echo requests hosted by the icmp wrap server";

    pub fn new(_args: &str) -> Result<Self> {
        Ok(IcmpServerWrapper)
    }
}

#[async_trait]
impl ServerWrapper for IcmpServerWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn unwrap(&mut self, pdu: Bytes) -> Result<Option<Bytes>> {
        match decode(&pdu) {
            Ok(sotp) => Ok(Some(sotp)),
            // Not base64: some other ping wandering by.
            Err(_) => Ok(None),
        }
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(encode(&packet)))
    }
}

/// ICMP wrap server: answers encoded Echo Requests with Echo Replies
/// carrying the worker's response.
pub struct IcmpWrapServer {
    bind: String,
    response_timeout: Duration,
}

impl IcmpWrapServer {
    pub const NAME: &'static str = "icmpserver";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about("Raw ICMP listener hosting the icmp wrap module")
            .arg(
                Arg::with_name("bind")
                    .long("bind")
                    .takes_value(true)
                    .default_value("0.0.0.0")
                    .help("Address to bind the raw socket to"),
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
        Ok(IcmpWrapServer {
            bind: matches.value_of("bind").unwrap().to_owned(),
            response_timeout: Duration::from_secs(registry::parse_number(
                matches.value_of("response-timeout").unwrap(),
            )?),
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    pub async fn run(self, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        let socket = std::sync::Arc::new(open_raw_socket(&self.bind)?);
        info!("[{}] raw socket bound on {}", Self::NAME, self.bind);
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    error!("[{}] recv failed: {err}", Self::NAME);
                    continue;
                }
            };
            let Ok(icmp) = strip_ip_header(&buf[..n]) else {
                continue;
            };
            let Ok(request) = EchoMessage::unmarshal(icmp) else {
                continue;
            };
            if request.msg_type != ECHO_REQUEST {
                continue;
            }
            let wrap_txs = wrap_txs.clone();
            let socket = std::sync::Arc::clone(&socket);
            let wait = self.response_timeout;
            tokio::spawn(async move {
                let Some(payload) =
                    dispatch_to_wrappers(request.data.clone(), id, &wrap_txs, wait).await
                else {
                    return;
                };
                let reply = EchoMessage {
                    msg_type: ECHO_REPLY,
                    ident: request.ident,
                    seq: request.seq,
                    data: payload,
                };
                match reply.marshal() {
                    Ok(raw) => {
                        let _ = socket.send_to(&raw, peer).await;
                    }
                    Err(err) => error!("[icmpserver] cannot marshal reply: {err}"),
                }
            });
        }
    }
}

#[async_trait]
impl WrapServer for IcmpWrapServer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(self: Box<Self>, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        (*self).run(id, wrap_txs).await
    }
}
