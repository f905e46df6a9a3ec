use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use clap::{App, Arg};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::tcp::parse_base_options;
use super::{dispatch_to_wrappers, ClientWrapper, ServerWrapper, WrapServer, WrapperOptions};
use crate::error::{Error, Result};
use crate::message::Outbox;
use crate::registry;

/// Where the encoded SOTP packet rides inside the HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Embedding {
    Uri,
    Header(String),
    PostField(String),
}

fn encode(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE)
}

fn decode(data: &str) -> Result<Bytes> {
    base64::decode_config(data.trim(), base64::URL_SAFE)
        .map(Bytes::from)
        .map_err(|_| Error::ErrCarrierDecode)
}

/// A parsed HTTP/1.1 message head plus body; enough structure for the
/// carrier, nothing more.
struct ParsedHttp {
    start_line: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ParsedHttp {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Splits raw bytes into start line, headers and body. The body length is
/// taken from Content-Length when present, otherwise everything after the
/// blank line is the body.
fn parse_http(raw: &[u8]) -> Result<ParsedHttp> {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(Error::ErrCarrierDecode)?;
    let head = std::str::from_utf8(&raw[..head_end]).map_err(|_| Error::ErrCarrierDecode)?;
    let mut lines = head.split("\r\n");
    let start_line = lines.next().ok_or(Error::ErrCarrierDecode)?.to_owned();
    let mut headers = vec![];
    for line in lines {
        let (name, value) = line.split_once(':').ok_or(Error::ErrCarrierDecode)?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    let mut body = Bytes::copy_from_slice(&raw[head_end + 4..]);
    let parsed = ParsedHttp {
        start_line,
        headers,
        body: Bytes::new(),
    };
    if let Some(length) = parsed.header("content-length") {
        let length: usize = length.parse().map_err(|_| Error::ErrCarrierDecode)?;
        if length > body.len() {
            return Err(Error::ErrCarrierDecode);
        }
        body = body.slice(..length);
    }
    Ok(ParsedHttp { body, ..parsed })
}

/// HTTP(S)-shaped carrier: one request per transaction, the reply riding
/// base64url in the response body.
pub struct HttpWrapper {
    hostname: String,
    port: u16,
    method: String,
    uri: String,
    embedding: Embedding,
    success_code: u16,
    options: WrapperOptions,
}

impl HttpWrapper {
    pub const NAME: &'static str = "http";
    pub const DESCRIPTION: &'static str =
        "Encodes/decodes SOTP packets in HTTP requests/responses using different methods";

    fn arg_parser() -> App<'static> {
        let app = App::new(Self::NAME)
            .about(Self::DESCRIPTION)
            .arg(
                Arg::with_name("hostname")
                    .long("hostname")
                    .takes_value(true)
                    .default_value("localhost")
                    .help("Hostname or IP address of the HTTP server"),
            )
            .arg(
                Arg::with_name("port")
                    .long("port")
                    .takes_value(true)
                    .default_value("8080")
                    .help("Server port"),
            )
            .arg(
                Arg::with_name("method")
                    .long("method")
                    .takes_value(true)
                    .possible_values(["GET", "POST"])
                    .default_value("GET")
                    .help("HTTP method to use"),
            )
            .arg(
                Arg::with_name("uri")
                    .long("uri")
                    .takes_value(true)
                    .default_value("/")
                    .help("URI path before the embedded message"),
            )
            .arg(
                Arg::with_name("header")
                    .long("header")
                    .takes_value(true)
                    .help("Header field to embed the packets"),
            )
            .arg(
                Arg::with_name("post-field")
                    .long("post-field")
                    .takes_value(true)
                    .help("POST form field to embed the packets"),
            )
            .arg(
                Arg::with_name("success-code")
                    .long("success-code")
                    .takes_value(true)
                    .default_value("200")
                    .help("Status code expected on successful transactions"),
            );
        super::tcp::append_base_args(app)
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let embedding = if let Some(header) = matches.value_of("header") {
            Embedding::Header(header.to_owned())
        } else if let Some(field) = matches.value_of("post-field") {
            Embedding::PostField(field.to_owned())
        } else {
            Embedding::Uri
        };
        if matches!(embedding, Embedding::PostField(_)) && matches.value_of("method") != Some("POST")
        {
            return Err(Error::ErrConfig(
                "--post-field requires --method POST".to_owned(),
            ));
        }
        Ok(HttpWrapper {
            hostname: matches.value_of("hostname").unwrap().to_owned(),
            port: registry::parse_number(matches.value_of("port").unwrap())?,
            method: matches.value_of("method").unwrap().to_owned(),
            uri: matches.value_of("uri").unwrap().to_owned(),
            embedding,
            success_code: registry::parse_number(matches.value_of("success-code").unwrap())?,
            options: parse_base_options(&matches)?,
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    fn build_request(&self, packet: &[u8]) -> Bytes {
        let encoded = encode(packet);
        let mut head = String::new();
        let mut body = String::new();
        match &self.embedding {
            Embedding::Uri => {
                head.push_str(&format!("{} {}{} HTTP/1.1\r\n", self.method, self.uri, encoded));
            }
            Embedding::Header(header) => {
                head.push_str(&format!("{} {} HTTP/1.1\r\n", self.method, self.uri));
                head.push_str(&format!("{header}: {encoded}\r\n"));
            }
            Embedding::PostField(field) => {
                head.push_str(&format!("POST {} HTTP/1.1\r\n", self.uri));
                body = format!("{field}={encoded}");
            }
        }
        head.push_str(&format!("Host: {}:{}\r\n", self.hostname, self.port));
        head.push_str("User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:102.0) Gecko/20100101 Firefox/102.0\r\n");
        head.push_str("Accept: */*\r\n");
        if !body.is_empty() {
            head.push_str("Content-Type: application/x-www-form-urlencoded\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("Connection: close\r\n\r\n");

        let mut raw = BytesMut::from(head.as_bytes());
        raw.extend_from_slice(body.as_bytes());
        raw.freeze()
    }
}

#[async_trait]
impl ClientWrapper for HttpWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> WrapperOptions {
        self.options
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        let request = self.build_request(&packet);
        let mut stream = TcpStream::connect((self.hostname.as_str(), self.port)).await?;
        stream.write_all(&request).await?;

        let mut response = vec![];
        stream.read_to_end(&mut response).await?;
        let parsed = parse_http(&response)?;

        let status: u16 = parsed
            .start_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or(Error::ErrCarrierDecode)?;
        if status != self.success_code {
            return Err(Error::ErrCarrierStatus(status));
        }
        Ok(parsed.body)
    }

    fn unwrap(&mut self, response: Bytes) -> Result<Bytes> {
        decode(std::str::from_utf8(&response).map_err(|_| Error::ErrCarrierDecode)?)
    }
}

/// Server-side module: digs the encoded packet out of the request line,
/// a header or a POST field, and wraps worker replies as body payloads.
pub struct HttpServerWrapper {
    uri: String,
    embedding: Embedding,
    worker_options: super::WorkerOptions,
}

impl HttpServerWrapper {
    pub const NAME: &'static str = "http";
    pub const DESCRIPTION: &'static str =
        "Extracts SOTP packets from HTTP requests hosted by the http wrap server";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about(Self::DESCRIPTION)
            .arg(
                Arg::with_name("uri")
                    .long("uri")
                    .takes_value(true)
                    .default_value("/")
                    .help("URI path before the embedded message"),
            )
            .arg(
                Arg::with_name("header")
                    .long("header")
                    .takes_value(true)
                    .help("Header field carrying the packets"),
            )
            .arg(
                Arg::with_name("post-field")
                    .long("post-field")
                    .takes_value(true)
                    .help("POST form field carrying the packets"),
            )
            .arg(
                Arg::with_name("max-size")
                    .long("max-size")
                    .takes_value(true)
                    .default_value("4096")
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
        let embedding = if let Some(header) = matches.value_of("header") {
            Embedding::Header(header.to_owned())
        } else if let Some(field) = matches.value_of("post-field") {
            Embedding::PostField(field.to_owned())
        } else {
            Embedding::Uri
        };
        Ok(HttpServerWrapper {
            uri: matches.value_of("uri").unwrap().to_owned(),
            embedding,
            worker_options: super::WorkerOptions {
                max_size: registry::parse_number(matches.value_of("max-size").unwrap())?,
                max_retries: registry::parse_number(matches.value_of("max-retries").unwrap())?,
            },
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    fn parse_from_uri(&self, start_line: &str) -> Option<String> {
        let target = start_line.split_whitespace().nth(1)?;
        Some(target.strip_prefix(self.uri.as_str())?.to_owned())
    }

    fn parse_from_post_field(&self, body: &[u8], field: &str) -> Option<String> {
        let body = std::str::from_utf8(body).ok()?;
        body.split('&').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            (name == field).then(|| value.to_owned())
        })
    }
}

#[async_trait]
impl ServerWrapper for HttpServerWrapper {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn worker_options(&self) -> super::WorkerOptions {
        self.worker_options
    }

    async fn unwrap(&mut self, pdu: Bytes) -> Result<Option<Bytes>> {
        let parsed = parse_http(&pdu)?;
        let encoded = match &self.embedding {
            Embedding::Uri => self.parse_from_uri(&parsed.start_line),
            Embedding::Header(header) => parsed.header(header).map(str::to_owned),
            Embedding::PostField(field) => self.parse_from_post_field(&parsed.body, field),
        };
        match encoded {
            Some(encoded) => Ok(Some(decode(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn wrap(&mut self, packet: Bytes) -> Result<Bytes> {
        Ok(Bytes::from(encode(&packet)))
    }
}

/// Minimal HTTP/1.1 listener: reads one request per connection, fans it
/// out to the wrap modules and answers with the winning module's body.
pub struct HttpWrapServer {
    address: String,
    success_code: u16,
    response_timeout: Duration,
}

impl HttpWrapServer {
    pub const NAME: &'static str = "httpserver";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about("HTTP listener hosting the http wrap module")
            .arg(
                Arg::with_name("address")
                    .long("address")
                    .takes_value(true)
                    .default_value("0.0.0.0:8080")
                    .help("host:port to listen on"),
            )
            .arg(
                Arg::with_name("success-code")
                    .long("success-code")
                    .takes_value(true)
                    .default_value("200")
                    .help("Status code written on successful transactions"),
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
        Ok(HttpWrapServer {
            address: matches.value_of("address").unwrap().to_owned(),
            success_code: registry::parse_number(matches.value_of("success-code").unwrap())?,
            response_timeout: Duration::from_secs(registry::parse_number(
                matches.value_of("response-timeout").unwrap(),
            )?),
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
            debug!("[{}] request from {peer}", Self::NAME);
            let wrap_txs = wrap_txs.clone();
            let wait = self.response_timeout;
            let success_code = self.success_code;
            tokio::spawn(async move {
                let Ok(request) = read_request(&mut stream).await else {
                    return;
                };
                let answer = dispatch_to_wrappers(request, id, &wrap_txs, wait).await;
                let response = match answer {
                    Some(body) => format!(
                        "HTTP/1.1 {success_code} OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    )
                    .into_bytes()
                    .into_iter()
                    .chain(body.to_vec())
                    .collect::<Vec<u8>>(),
                    None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_vec(),
                };
                let _ = stream.write_all(&response).await;
            });
        }
    }
}

#[async_trait]
impl WrapServer for HttpWrapServer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(self: Box<Self>, id: u32, wrap_txs: Vec<Outbox>) -> Result<()> {
        (*self).run(id, wrap_txs).await
    }
}

/// Reads one HTTP request: head until the blank line, then as many body
/// bytes as Content-Length announces.
async fn read_request(stream: &mut TcpStream) -> Result<Bytes> {
    let mut raw = BytesMut::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(head_end) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            let parsed = parse_http(&raw)?;
            let needed: usize = parsed
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if raw.len() >= head_end + 4 + needed {
                break;
            }
        }
    }
    if raw.is_empty() {
        return Err(Error::ErrCarrierDecode);
    }
    Ok(raw.freeze())
}
