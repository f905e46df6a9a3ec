use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::{App, Arg};
use log::{debug, error, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::{ClientOverlay, ServerOverlay};
use crate::error::{Error, Result};
use crate::message::{Endpoint, Message, Outbox};
use crate::registry;

const READ_CHUNK: usize = 4096;

/// Pumps one socket's read half into an overlay inbox as Input traffic.
fn spawn_socket_reader(stream: TcpStream, overlay_tx: Outbox, sink: Arc<Mutex<Option<OwnedWriteHalf>>>) {
    let (mut read_half, write_half) = stream.into_split();
    tokio::spawn(async move {
        *sink.lock().await = Some(write_half);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let msg = Message::stream(
                        Endpoint::Input,
                        0,
                        Endpoint::Overlay,
                        0,
                        Bytes::copy_from_slice(&buf[..n]),
                    );
                    if overlay_tx.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("socket reader finished");
    });
}

/// Client-side TCP bridge: connects to a local service and tunnels its
/// byte stream. Typical pairing is tcpconnect on one end and tcplisten
/// on the other.
pub struct TcpConnectOverlay {
    tag: u16,
    address: String,
    sink: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl TcpConnectOverlay {
    pub const NAME: &'static str = "tcpconnect";
    pub const DESCRIPTION: &'static str =
        "Connects to a host:port and bridges the TCP stream through the tunnel";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about(Self::DESCRIPTION)
            .arg(
                Arg::with_name("tag")
                    .long("tag")
                    .takes_value(true)
                    .default_value("0x2020")
                    .help("Tag identifying this overlay at the server"),
            )
            .arg(
                Arg::with_name("address")
                    .long("address")
                    .takes_value(true)
                    .default_value("127.0.0.1:1234")
                    .help("host:port to connect to"),
            )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        Ok(TcpConnectOverlay {
            tag: registry::parse_tag(matches.value_of("tag").unwrap())?,
            address: matches.value_of("address").unwrap().to_owned(),
            sink: Arc::new(Mutex::new(None)),
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    /// Dials the bridged service and starts feeding its bytes into the
    /// overlay inbox.
    async fn connect(&mut self, overlay_tx: Outbox) -> Result<()> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| Error::ErrConfig(format!("cannot connect to {}: {e}", self.address)))?;
        info!("[{}] connected to {}", Self::NAME, self.address);
        spawn_socket_reader(stream, overlay_tx, Arc::clone(&self.sink));
        Ok(())
    }

    async fn write_socket(&self, data: &Bytes) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::Other("bridged socket is not connected".to_owned()));
        };
        sink.write_all(data)
            .await
            .map_err(|e| Error::Other(e.to_string()))
    }
}

#[async_trait]
impl ClientOverlay for TcpConnectOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    // Input comes from the bridged socket, not the process stdin.
    fn has_input(&self) -> bool {
        false
    }

    async fn start(&mut self, overlay_tx: Outbox) -> Result<()> {
        self.connect(overlay_tx).await
    }

    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(data))
    }

    async fn process_sotp(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        self.write_socket(&data).await?;
        Ok(None)
    }
}

/// Server-side TCP bridge: accepts one connection per session and feeds
/// it from the tunnel.
pub struct TcpListenOverlay {
    tag: u16,
    address: String,
    sink: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl TcpListenOverlay {
    pub const NAME: &'static str = "tcplisten";
    pub const DESCRIPTION: &'static str =
        "Listens on a host:port and bridges the accepted TCP stream through the tunnel";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME)
            .about(Self::DESCRIPTION)
            .arg(
                Arg::with_name("tag")
                    .long("tag")
                    .takes_value(true)
                    .default_value("0x2020")
                    .help("Tag identifying this overlay"),
            )
            .arg(
                Arg::with_name("address")
                    .long("address")
                    .takes_value(true)
                    .default_value("127.0.0.1:1234")
                    .help("host:port to listen on"),
            )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        Ok(TcpListenOverlay {
            tag: registry::parse_tag(matches.value_of("tag").unwrap())?,
            address: matches.value_of("address").unwrap().to_owned(),
            sink: Arc::new(Mutex::new(None)),
        })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    /// Binds the listener and accepts connections in the background; each
    /// accepted stream replaces the previous one.
    async fn listen(&mut self, overlay_tx: Outbox) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| Error::ErrConfig(format!("cannot bind {}: {e}", self.address)))?;
        info!("[{}] listening on {}", Self::NAME, self.address);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("[tcplisten] accepted connection from {peer}");
                        spawn_socket_reader(stream, overlay_tx.clone(), Arc::clone(&sink));
                    }
                    Err(err) => {
                        error!("[tcplisten] accept failed: {err}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn write_socket(&self, data: &Bytes) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::Other("no accepted connection yet".to_owned()));
        };
        sink.write_all(data)
            .await
            .map_err(|e| Error::Other(e.to_string()))
    }
}

#[async_trait]
impl ServerOverlay for TcpListenOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    async fn start(&mut self, overlay_tx: Outbox) -> Result<()> {
        self.listen(overlay_tx).await
    }

    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(data))
    }

    async fn process_sotp(&mut self, _worker_id: u32, data: Bytes) -> Result<Option<Bytes>> {
        self.write_socket(&data).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::inbox;

    #[tokio::test]
    async fn test_bridge_roundtrip() {
        // tcplisten on an ephemeral port, tcpconnect dialing it: bytes
        // written through process_sotp surface as Input on the peer.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut server =
            TcpListenOverlay::new(&format!("--address {addr}")).unwrap();
        let (server_tx, mut server_rx) = inbox();
        ServerOverlay::start(&mut server, server_tx).await.unwrap();

        let mut client =
            TcpConnectOverlay::new(&format!("--address {addr}")).unwrap();
        let (client_tx, mut client_rx) = inbox();
        ClientOverlay::start(&mut client, client_tx).await.unwrap();

        // Wait for the accept side to wire up its sink.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        ClientOverlay::process_sotp(&mut client, Bytes::from_static(b"c2s"))
            .await
            .unwrap();
        let msg = server_rx.recv().await.unwrap();
        assert_eq!(msg.sender, Endpoint::Input);
        assert_eq!(msg.stream_content().unwrap().as_ref(), b"c2s");

        ServerOverlay::process_sotp(&mut server, 1, Bytes::from_static(b"s2c"))
            .await
            .unwrap();
        let msg = client_rx.recv().await.unwrap();
        assert_eq!(msg.stream_content().unwrap().as_ref(), b"s2c");
    }
}
