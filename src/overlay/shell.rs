use async_trait::async_trait;
use bytes::Bytes;
use clap::{App, Arg};
use log::{debug, error};
use tokio::process::Command;

use super::{ClientOverlay, ServerOverlay};
use crate::error::Result;
use crate::registry;

/// Executes each delivered payload as a shell command and submits the
/// combined stdout/stderr back through the tunnel. Compatible with the
/// io overlay on the far end.
pub struct ShellOverlay {
    tag: u16,
}

impl ShellOverlay {
    pub const NAME: &'static str = "shell";
    pub const DESCRIPTION: &'static str =
        "Executes received commands and returns their output through the tunnel";

    fn arg_parser() -> App<'static> {
        App::new(Self::NAME).about(Self::DESCRIPTION).arg(
            Arg::with_name("tag")
                .long("tag")
                .takes_value(true)
                .default_value("0x1010")
                .help("Tag identifying this overlay at the server"),
        )
    }

    pub fn new(args: &str) -> Result<Self> {
        let matches = registry::parse_module_args(Self::arg_parser(), Self::NAME, args)?;
        let tag = registry::parse_tag(matches.value_of("tag").unwrap())?;
        Ok(ShellOverlay { tag })
    }

    pub fn print_help() {
        let _ = Self::arg_parser().print_help();
    }

    async fn execute(&self, data: &Bytes) -> Option<Bytes> {
        let commandline = String::from_utf8_lossy(data).into_owned();
        debug!("[{}] executing: {}", Self::NAME, commandline.trim_end());
        let output = if cfg!(target_os = "windows") {
            Command::new("cmd").arg("/C").arg(&commandline).output().await
        } else {
            Command::new("sh").arg("-c").arg(&commandline).output().await
        };
        match output {
            Ok(output) => {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                if combined.is_empty() {
                    None
                } else {
                    Some(Bytes::from(combined))
                }
            }
            Err(err) => {
                error!("[{}] cannot execute command: {err}", Self::NAME);
                None
            }
        }
    }
}

#[async_trait]
impl ClientOverlay for ShellOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    fn has_input(&self) -> bool {
        false
    }

    async fn process_input(&mut self, _data: Bytes) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn process_sotp(&mut self, data: Bytes) -> Result<Option<Bytes>> {
        Ok(self.execute(&data).await)
    }
}

#[async_trait]
impl ServerOverlay for ShellOverlay {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tag(&self) -> u16 {
        self.tag
    }

    async fn process_input(&mut self, _data: Bytes) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn process_sotp(&mut self, _worker_id: u32, data: Bytes) -> Result<Option<Bytes>> {
        Ok(self.execute(&data).await)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_command_output_is_returned() {
        let mut overlay = ShellOverlay::new("").unwrap();
        let out = ClientOverlay::process_sotp(&mut overlay, Bytes::from_static(b"echo tunneled"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.as_ref(), b"tunneled\n");
    }

    #[tokio::test]
    async fn test_input_is_ignored() {
        let mut overlay = ShellOverlay::new("").unwrap();
        let out = ClientOverlay::process_input(&mut overlay, Bytes::from_static(b"typed"))
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
