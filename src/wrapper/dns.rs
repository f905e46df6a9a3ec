use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::{App, Arg};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::tcp::{append_base_args, parse_base_options};
use super::{dispatch_to_wrappers, ClientWrapper, ServerWrapper, WrapServer, WrapperOptions};
use crate::error::{Error, Result};
use crate::message::Outbox;
use crate::registry;

/// RFC 1035 limits, enforced at configure time.
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;
const MAX_TXT_STRING: usize = 255;
const DNS_HEADER_LEN: usize = 12;

const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;

const CLASS_IN: u16 = 1;

fn record_type_from_name(name: &str) -> Result<u16> {
    match name.to_ascii_uppercase().as_str() {
        "NS" => Ok(TYPE_NS),
        "CNAME" => Ok(TYPE_CNAME),
        "SOA" => Ok(TYPE_SOA),
        "MX" => Ok(TYPE_MX),
        "TXT" => Ok(TYPE_TXT),
        other => Err(Error::ErrConfig(format!("unsupported record type {other}"))),
    }
}

fn encode(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE)
}

fn decode(data: &str) -> Result<Bytes> {
    base64::decode_config(data, base64::URL_SAFE)
        .map(Bytes::from)
        .map_err(|_| Error::ErrCarrierDecode)
}

/// Splits an encoded payload into DNS labels of at most 63 bytes.
fn to_labels(encoded: &str) -> Vec<String> {
    encoded
        .as_bytes()
        .chunks(MAX_LABEL_LEN)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect()
}

fn put_name(buf: &mut BytesMut, labels: &[String]) {
    for label in labels {
        buf.put_u8(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.put_u8(0);
}

/// Reads a (possibly compressed) name starting at `offset`; returns the
/// labels and the offset just past the name in the original stream.
fn read_name(raw: &[u8], mut offset: usize) -> Result<(Vec<String>, usize)> {
    let mut labels = vec![];
    let mut jumped = false;
    let mut next = 0usize;
    let mut hops = 0;
    loop {
        let len = *raw.get(offset).ok_or(Error::ErrCarrierDecode)? as usize;
        if len & 0xc0 == 0xc0 {
            // Compression pointer.
            let low = *raw.get(offset + 1).ok_or(Error::ErrCarrierDecode)? as usize;
            if !jumped {
                next = offset + 2;
                jumped = true;
            }
            offset = ((len & 0x3f) << 8) | low;
            hops += 1;
            if hops > 16 {
                return Err(Error::ErrCarrierDecode);
            }
            continue;
        }
        if len == 0 {
            if !jumped {
                next = offset + 1;
            }
            return Ok((labels, next));
        }
        let label = raw
            .get(offset + 1..offset + 1 + len)
            .ok_or(Error::ErrCarrierDecode)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len;
    }
}

fn build_query(id: u16, labels: &[String], qtype: u16) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(id);
    buf.put_u16(0x0100); // standard query, recursion desired
    buf.put_u16(1); // qdcount
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    put_name(&mut buf, labels);
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);
    buf.freeze()
}

struct ParsedQuery {
    id: u16,
    labels: Vec<String>,
    qtype: u16,
}

fn parse_query(raw: &[u8]) -> Result<ParsedQuery> {
    if raw.len() < DNS_HEADER_LEN {
        return Err(Error::ErrCarrierDecode);
    }
    let mut header = &raw[..DNS_HEADER_LEN];
    let id = header.get_u16();
    let flags = header.get_u16();
    let qdcount = header.get_u16();
    if flags & 0x8000 != 0 || qdcount == 0 {
        return Err(Error::ErrCarrierDecode);
    }
    let (labels, offset) = read_name(raw, DNS_HEADER_LEN)?;
    let mut rest = raw.get(offset..offset + 4).ok_or(Error::ErrCarrierDecode)?;
    let qtype = rest.get_u16();
    Ok(ParsedQuery { id, labels, qtype })
}

/// Builds a response to `query` whose single answer record carries the
/// encoded payload in the RDATA of the negotiated type.
fn build_response(query_raw: &[u8], payload: Option<&str>) -> Result<Bytes> {
    let query = parse_query(query_raw)?;
    let mut buf = BytesMut::new();
    buf.put_u16(query.id);
    // Response, recursion desired+available; NXDOMAIN when empty-handed.
    buf.put_u16(if payload.is_some() { 0x8180 } else { 0x8183 });
    buf.put_u16(1); // question echoed
    buf.put_u16(u16::from(payload.is_some()));
    buf.put_u16(0);
    buf.put_u16(0);
    put_name(&mut buf, &query.labels);
    buf.put_u16(query.qtype);
    buf.put_u16(CLASS_IN);

    if let Some(payload) = payload {
        put_name(&mut buf, &query.labels);
        buf.put_u16(query.qtype);
        buf.put_u16(CLASS_IN);
        buf.put_u32(60); // ttl
        let rdata = build_rdata(query.qtype, payload)?;
        buf.put_u16(rdata.len() as u16);
        buf.extend_from_slice(&rdata);
    }
    Ok(buf.freeze())
}

fn build_rdata(qtype: u16, payload: &str) -> Result<Bytes> {
    let mut rdata = BytesMut::new();
    match qtype {
        TYPE_TXT => {
            for chunk in payload.as_bytes().chunks(MAX_TXT_STRING) {
                rdata.put_u8(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
        }
        TYPE_NS | TYPE_CNAME => {
            put_name(&mut rdata, &to_labels(payload));
        }
        TYPE_MX => {
            rdata.put_u16(10); // preference
            put_name(&mut rdata, &to_labels(payload));
        }
        TYPE_SOA => {
            put_name(&mut rdata, &to_labels(payload)); // mname carries data
            rdata.put_u8(0); // root rname
            for _ in 0..5 {
                rdata.put_u32(0);
            }
        }
        other => return Err(Error::ErrConfig(format!("unsupported record type {other}"))),
    }
    Ok(rdata.freeze())
}

/// Extracts the payload text from the first answer of a response.
fn parse_response(raw: &[u8]) -> Result<String> {
    if raw.len() < DNS_HEADER_LEN {
        return Err(Error::ErrCarrierDecode);
    }
    let mut header = &raw[..DNS_HEADER_LEN];
    let _id = header.get_u16();
    let flags = header.get_u16();
    let qdcount = header.get_u16();
    let ancount = header.get_u16();
    if flags & 0x8000 == 0 {
        return Err(Error::ErrCarrierDecode);
    }
    if ancount == 0 {
        return Err(Error::ErrCarrierFailure(format!(
            "dns answer missing, rcode {}",
            flags & 0x000f
        )));
    }
    let mut offset = DNS_HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(raw, offset)?;
        offset = next + 4;
    }
    let (_, next) = read_name(raw, offset)?;
    offset = next;
    let mut fixed = raw.get(offset..offset + 10).ok_or(Error::ErrCarrierDecode)?;
    let rtype = fixed.get_u16();
    let _class = fixed.get_u16();
    let _ttl = fixed.get_u32();
    let rdlength = fixed.get_u16() as usize;
    offset += 10;
    let rdata = raw
        .get(offset..offset + rdlength)
        .ok_or(Error::ErrCarrierDecode)?;

    match rtype {
        TYPE_TXT => {
            let mut text = String::new();
            let mut pos = 0usize;
            while pos < rdata.len() {
                let len = rdata[pos] as usize;
                let chunk = rdata
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(Error::ErrCarrierDecode)?;
                text.push_str(&String::from_utf8_lossy(chunk));
                pos += 1 + len;
            }
            Ok(text)
        }
        TYPE_NS | TYPE_CNAME => {
            let (labels, _) = read_name(raw, offset)?;
            Ok(labels.concat())
        }
        TYPE_MX => {
            let (labels, _) = read_name(raw, offset + 2)?;
            Ok(labels.concat())
        }
        TYPE_SOA => {
            let (labels, _) = read_name(raw, offset)?;
            Ok(labels.concat())
        }
        _ => Err(Error::ErrCarrierDecode),
    }
}

/// Usable SOTP packet size for a given domain suffix: what survives
/// base64url expansion, label dots and the suffix within the 253-byte
/// name limit.
fn derive_max_size(domain: &str) -> usize {
    let room = MAX_NAME_LEN.saturating_sub(domain.len() + 1);
    let b64_room = room - room / (MAX_LABEL_LEN + 1);
    (b64_room / 4) * 3
}

fn domain_labels(domain: &str) -> Vec<String> {
    domain
        .split('.')
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

/// DNS-shaped carrier: the encoded SOTP packet rides as QNAME labels
/// under a configured domain; the reply rides in the RDATA of the
/// negotiated record type.
pub struct DnsWrapper {
    server: String,
    domain: String,
    qtype: u16,
    options: WrapperOptions,
}

impl DnsWrapper {
    pub const NAME: &'static str = "dns";
    pub const DESCRIPTION: &'static str =
        "Encodes/decodes SOTP packets in DNS queries/responses of a configurable record type";

    fn arg_parser() -> App<'static> {
        append_base_args(
            App::new(Self::NAME)
                .about(Self::DESCRIPTION)
                .arg(
                    Arg::with_name("server")
                        .long("server")
                        .takes_value(true)
                        .default_value("127.0.0.1:53")
                        .help("DNS server host:port to query"),
                )
                .arg(
                    Arg::with_name("domain")
                        .long("domain")
                        .takes_value(true)
                        .default_value("example.com")
                        .help("Domain suffix appended to encoded queries"),
                )
                .arg(
                    Arg::with_name("record-type")
                        .long("record-type")
                        .takes_value(true)
                        .possible_values(["NS", "CNAME", "SOA", "MX", "TXT"])
                        .default_value("TXT")
                        .help("Record type carrying the response data"),
                ),
        )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let domain = matches.value_of("domain").unwrap().to_owned();
        if domain.len() + 2 > MAX_NAME_LEN {
            return Err(Error::ErrDnsNameTooLong);
        }
        if domain_labels(&domain).iter().any(|l| l.len() > MAX_LABEL_LEN) {
            return Err(Error::ErrDnsNameTooLong);
        }
        let mut options = parse_base_options(&matches)?;
        let ceiling = derive_max_size(&domain);
        if options.max_size > ceiling {
            warn!(
                "[{}] max_size {} exceeds what fits in a query name, clamping to {ceiling}",
                Self::NAME,
                options.max_size
            );
            options.max_size = ceiling;
        }
        Ok(DnsWrapper {
            server: matches.value_of("server").unwrap().to_owned(),
            domain,
            qtype: record_type_from_name(matches.value_of("record-type").unwrap())?,
            options,
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }
}

#[async_trait]
impl ClientWrapper for DnsWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> WrapperOptions {
        self.options
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        let mut labels = to_labels(&encode(&packet));
        labels.extend(domain_labels(&self.domain));

        let id: u16 = rand::thread_rng().gen();
        let query = build_query(id, &labels, self.qtype);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(&query, self.server.as_str()).await?;
        debug!("[{}] query sent, {} bytes", Self::NAME, query.len());

        let mut buf = vec![0u8; 4096];
        let (n, _) = timeout(self.options.response_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| Error::ErrCarrierFailure("dns response timed out".to_owned()))??;
        Ok(Bytes::copy_from_slice(&buf[..n]))
    }

    fn unwrap(&mut self, response: Bytes) -> Result<Bytes> {
        decode(&parse_response(&response)?)
    }
}

/// Server-side module: strips the domain suffix off the QNAME and
/// decodes the remaining labels; replies are handed back encoded for the
/// wrap server to fold into RDATA.
pub struct DnsServerWrapper {
    domain_labels: Vec<String>,
    worker_options: super::WorkerOptions,
}

impl DnsServerWrapper {
    pub const NAME: &'static str = "dns";
    pub const DESCRIPTION: &'static str =
        "Extracts SOTP packets from DNS queries hosted by the dns wrap server";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about(Self::DESCRIPTION)
            .arg(
                Arg::with_name("domain")
                    .long("domain")
                    .takes_value(true)
                    .default_value("example.com")
                    .help("Domain suffix expected on encoded queries"),
            )
            .arg(
                Arg::with_name("max-size")
                    .long("max-size")
                    .takes_value(true)
                    .default_value("1024")
                    .help("Maximum size in bytes of outbound SOTP packets"),
            )
            .arg(
                Arg::with_name("max-retries")
                    .long("max-retries")
                    .takes_value(true)
                    .default_value("20")
                    .help("Maximum number of re-synchronization retries"),
            )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        Ok(DnsServerWrapper {
            domain_labels: domain_labels(matches.value_of("domain").unwrap()),
            worker_options: super::WorkerOptions {
                max_size: registry::parse_number(matches.value_of("max-size").unwrap())?,
                max_retries: registry::parse_number(matches.value_of("max-retries").unwrap())?,
            },
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }
}

#[async_trait]
impl ServerWrapper for DnsServerWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn worker_options(&self) -> super::WorkerOptions {
        self.worker_options
    }

    async fn unwrap(&mut self, pdu: Bytes) -> Result<Option<Bytes>> {
        let query = parse_query(&pdu)?;
        if query.labels.len() <= self.domain_labels.len() {
            return Ok(None);
        }
        let (data_labels, suffix) = query
            .labels
            .split_at(query.labels.len() - self.domain_labels.len());
        if suffix != self.domain_labels.as_slice() {
            return Ok(None);
        }
        Ok(Some(decode(&data_labels.concat())?))
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(encode(&packet)))
    }
}

/// DNS wrap server: a UDP listener answering each encoded query with a
/// record of the queried type.
pub struct DnsWrapServer {
    address: String,
    response_timeout: Duration,
}

impl DnsWrapServer {
    pub const NAME: &'static str = "dnsserver";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about("UDP DNS listener hosting the dns wrap module")
            .arg(
                Arg::with_name("address")
                    .long("address")
                    .takes_value(true)
                    .default_value("0.0.0.0:53")
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
        Ok(DnsWrapServer {
            address: matches.value_of("address").unwrap().to_owned(),
            response_timeout: Duration::from_secs(registry::parse_number(
                matches.value_of("response-timeout").unwrap(),
            )?),
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    pub async fn run(self, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        let socket = UdpSocket::bind(&self.address)
            .await
            .map_err(|e| Error::ErrConfig(format!("cannot bind {}: {e}", self.address)))?;
        info!("[{}] listening on {}", Self::NAME, self.address);
        let socket = std::sync::Arc::new(socket);
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    error!("[{}] recv failed: {err}", Self::NAME);
                    continue;
                }
            };
            let query = Bytes::copy_from_slice(&buf[..n]);
            let wrap_txs = wrap_txs.clone();
            let socket = std::sync::Arc::clone(&socket);
            let wait = self.response_timeout;
            tokio::spawn(async move {
                let answer = dispatch_to_wrappers(query.clone(), id, &wrap_txs, wait).await;
                let payload = answer
                    .as_ref()
                    .and_then(|b| std::str::from_utf8(b).ok().map(str::to_owned));
                match build_response(&query, payload.as_deref()) {
                    Ok(response) => {
                        let _ = socket.send_to(&response, peer).await;
                    }
                    Err(err) => debug!("[dnsserver] unanswerable query: {err}"),
                }
            });
        }
    }
}

#[async_trait]
impl WrapServer for DnsWrapServer {
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

    #[test]
    fn test_query_roundtrip() {
        let mut labels = to_labels(&encode(b"sotp packet bytes"));
        labels.push("example".to_owned());
        labels.push("com".to_owned());
        let query = build_query(0x1234, &labels, TYPE_TXT);

        let parsed = parse_query(&query).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.qtype, TYPE_TXT);
        assert_eq!(parsed.labels, labels);
    }

    #[test]
    fn test_label_length_limit() {
        let long_payload = vec![0xaa; 300];
        for label in to_labels(&encode(&long_payload)) {
            assert!(label.len() <= MAX_LABEL_LEN);
        }
    }

    #[tokio::test]
    async fn test_server_module_roundtrip() {
        let mut module = DnsServerWrapper::new("--domain tunnel.example.com").unwrap();

        let mut labels = to_labels(&encode(b"\x01\x02\x03\x04"));
        labels.extend(domain_labels("tunnel.example.com"));
        let query = build_query(7, &labels, TYPE_TXT);

        let sotp = module.unwrap(Bytes::from(query)).await.unwrap().unwrap();
        assert_eq!(sotp.as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_server_module_rejects_foreign_domain() {
        let mut module = DnsServerWrapper::new("--domain tunnel.example.com").unwrap();
        let mut labels = to_labels(&encode(b"\x01"));
        labels.extend(domain_labels("other.org"));
        let query = build_query(7, &labels, TYPE_TXT);
        assert!(module.unwrap(Bytes::from(query)).await.unwrap().is_none());
    }

    #[test]
    fn test_response_rdata_roundtrip_all_types() {
        for qtype in [TYPE_TXT, TYPE_NS, TYPE_CNAME, TYPE_MX, TYPE_SOA] {
            let labels = vec!["query".to_owned(), "example".to_owned(), "com".to_owned()];
            let query = build_query(42, &labels, qtype);
            let payload = encode(b"the reply packet");

            let response = build_response(&query, Some(&payload)).unwrap();
            let text = parse_response(&response).unwrap();
            assert_eq!(text, payload, "qtype {qtype}");
        }
    }

    #[test]
    fn test_nxdomain_when_no_payload() {
        let query = build_query(42, &[String::from("x")], TYPE_TXT);
        let response = build_response(&query, None).unwrap();
        assert!(matches!(
            parse_response(&response),
            Err(Error::ErrCarrierFailure(_))
        ));
    }

    #[test]
    fn test_derived_max_size_respects_name_limit() {
        let domain = "tunnel.example.com";
        let max = derive_max_size(domain);
        // A worst-case packet of that size must still fit.
        let encoded = encode(&vec![0xffu8; max]);
        let dotted: usize =
            to_labels(&encoded).iter().map(|l| l.len() + 1).sum::<usize>() + domain.len();
        assert!(dotted <= MAX_NAME_LEN, "{dotted} > {MAX_NAME_LEN}");
    }

    #[test]
    fn test_compressed_name_parsing() {
        // Response with the answer name as a pointer to the question.
        let labels = vec!["abc".to_owned(), "example".to_owned(), "com".to_owned()];
        let query = build_query(9, &labels, TYPE_TXT);
        let mut raw = BytesMut::new();
        raw.put_u16(9);
        raw.put_u16(0x8180);
        raw.put_u16(1);
        raw.put_u16(1);
        raw.put_u16(0);
        raw.put_u16(0);
        put_name(&mut raw, &labels);
        raw.put_u16(TYPE_TXT);
        raw.put_u16(CLASS_IN);
        raw.put_u16(0xc00c); // pointer to offset 12
        raw.put_u16(TYPE_TXT);
        raw.put_u16(CLASS_IN);
        raw.put_u32(60);
        raw.put_u16(5);
        raw.put_u8(4);
        raw.extend_from_slice(b"data");
        let _ = query;

        assert_eq!(parse_response(&raw).unwrap(), "data");
    }
}
