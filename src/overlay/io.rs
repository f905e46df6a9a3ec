use async_trait::async_trait;
use bytes::Bytes;
use clap::{App, Arg};
use log::debug;
use tokio::io::AsyncWriteExt;

use super::{ClientOverlay, ServerOverlay};
use crate::error::{Error, Result};
use crate::registry;

/// Pass-through overlay: stdin in, stdout out. The default peer for
/// quick pipes and for driving a remote shell by hand.
pub struct IoOverlay {
    tag: u16,
}

impl IoOverlay {
    pub const NAME: &'static str = "io";
    pub const DESCRIPTION: &'static str =
        "Reads raw data from stdin and writes received data to stdout";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME).about(Self::DESCRIPTION).arg(
            Arg::with_name("tag")
                .long("tag")
                .takes_value(true)
                .default_value("0x0101")
                .help("Tag identifying this overlay at the server"),
        )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let tag = registry::parse_tag(matches.value_of("tag").unwrap())?;
        Ok(IoOverlay { tag })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    async fn write_stdout(&self, data: &Bytes) -> Result<()> {
        debug!("[{}] writing {} bytes to stdout", Self::NAME, data.len());
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(data)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        stdout.flush().await.map_err(|e| Error::Other(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ClientOverlay for IoOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    fn has_input(&self) -> bool {
        true
    }

    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        debug!("[{}] read {} bytes from stdin", Self::NAME, data.len());
        Ok(Some(data))
    }

    async fn process_sotp(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        self.write_stdout(&data).await?;
        Ok(None)
    }
}

#[async_trait]
impl ServerOverlay for IoOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    async fn process_input(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(data))
    }

    async fn process_sotp(&mut self, _worker_id: u32, data: Bytes) -> Result<Option<Bytes>> {
        self.write_stdout(&data).await?;
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_tag() {
        let overlay = IoOverlay::new("").unwrap();
        assert_eq!(ClientOverlay::tag(&overlay), 0x0101);
    }

    #[test]
    fn test_custom_tag() {
        let overlay = IoOverlay::new("--tag 0xab01").unwrap();
        assert_eq!(ClientOverlay::tag(&overlay), 0xab01);
    }

    #[test]
    fn test_unknown_argument_is_config_error() {
        assert!(IoOverlay::new("--bogus 1").is_err());
    }

    #[tokio::test]
    async fn test_input_passthrough() {
        let mut overlay = IoOverlay::new("").unwrap();
        let out = ClientOverlay::process_input(&mut overlay, Bytes::from_static(b"line\n"))
            .await
            .unwrap();
        assert_eq!(out.unwrap().as_ref(), b"line\n");
    }
}
