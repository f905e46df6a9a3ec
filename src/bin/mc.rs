use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::{App, AppSettings, Arg};
use log::debug;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use mistica::message::{inbox, Endpoint, Message, Outbox, Signal};
use mistica::overlay::run_client_overlay;
use mistica::registry::{self, Side};
use mistica::sotp::client::{self, ClientWorker};
use mistica::wrapper::run_client_wrapper;

const INPUT_READ_SIZE: usize = 300_000;

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {} - {}",
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .filter(None, level)
        .init();
}

/// Reads raw stdin and forwards it to the overlay. EOF waits for the
/// bootstrap gate so a short piped input is not lost before the session
/// finishes initialising.
async fn capture_input(overlay_tx: Outbox, has_input: bool, bootstrap: Arc<Semaphore>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; INPUT_READ_SIZE];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = bootstrap.acquire().await;
                debug!("stdin EOF, terminating overlay");
                let _ = overlay_tx
                    .send(Message::signal(
                        Endpoint::Input,
                        0,
                        Endpoint::Overlay,
                        0,
                        Signal::Terminate,
                    ))
                    .await;
                break;
            }
            Ok(n) => {
                if has_input {
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
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::new("mc")
        .version("0.1.0")
        .about("Mistica client: tunnels a byte stream over an innocuous carrier protocol")
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(
            Arg::with_name("key")
                .short('k')
                .long("key")
                .takes_value(true)
                .required_unless_present("list")
                .help("Pre-shared key for the session stream cipher"),
        )
        .arg(
            Arg::with_name("modules")
                .short('m')
                .long("modules")
                .takes_value(true)
                .default_value("io:http")
                .help("overlay:wrapper pair to run"),
        )
        .arg(
            Arg::with_name("overlay-args")
                .long("overlay-args")
                .takes_value(true)
                .default_value("")
                .allow_hyphen_values(true)
                .help("Argument string passed to the overlay module"),
        )
        .arg(
            Arg::with_name("wrapper-args")
                .long("wrapper-args")
                .takes_value(true)
                .default_value("")
                .allow_hyphen_values(true)
                .help("Argument string passed to the wrapper module"),
        )
        .arg(
            Arg::with_name("list")
                .short('l')
                .long("list")
                .takes_value(true)
                .min_values(0)
                .max_values(1)
                .help("List modules, or the parameters of a named module"),
        )
        .arg(
            Arg::with_name("v")
                .short('v')
                .multiple_occurrences(true)
                .help("Verbosity level (-v through -vvv)"),
        );

    let matches = app.get_matches();

    if matches.is_present("list") {
        match matches.value_of("list") {
            Some(name) => registry::print_module_help(Side::Client, name)
                .map_err(|e| anyhow!(e.to_string()))?,
            None => registry::print_module_list(Side::Client),
        }
        return Ok(());
    }

    init_logging(matches.occurrences_of("v"));

    let key = matches.value_of("key").unwrap().to_owned();
    let modules = matches.value_of("modules").unwrap();
    let (overlay_name, wrapper_name) = modules
        .split_once(':')
        .ok_or_else(|| anyhow!("--modules expects overlay:wrapper, got `{modules}`"))?;
    let overlay_args = matches.value_of("overlay-args").unwrap();
    let wrapper_args = matches.value_of("wrapper-args").unwrap();

    if key.is_empty() {
        return Err(anyhow!("--key must not be empty"));
    }

    // Wrapper first: its published tunables configure the SOTP core.
    let wrapper = registry::build_client_wrapper(wrapper_name, wrapper_args)
        .map_err(|e| anyhow!(e.to_string()))?;
    let options = wrapper.options();

    let (qsotp_tx, qsotp_rx) = inbox();
    let (qdata_tx, qdata_rx) = inbox();
    let (wrapper_tx, wrapper_rx) = inbox();
    let (overlay_tx, overlay_rx) = inbox();
    let bootstrap = Arc::new(Semaphore::new(0));

    tokio::spawn(run_client_wrapper(wrapper, wrapper_rx, qsotp_tx.clone()));

    let overlay = registry::build_client_overlay(overlay_name, overlay_args, overlay_tx.clone())
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    let tag = overlay.tag();
    let has_input = overlay.has_input();
    tokio::spawn(run_client_overlay(
        overlay,
        overlay_rx,
        qsotp_tx.clone(),
        qdata_tx.clone(),
    ));

    tokio::spawn(client::run_data_task(qdata_rx, qsotp_tx.clone()));
    tokio::spawn(capture_input(
        overlay_tx.clone(),
        has_input,
        Arc::clone(&bootstrap),
    ));

    {
        let overlay_tx = overlay_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("SIGINT received, terminating overlay");
                let _ = overlay_tx
                    .send(Message::signal(
                        Endpoint::Input,
                        0,
                        Endpoint::Overlay,
                        0,
                        Signal::Terminate,
                    ))
                    .await;
            }
        });
    }

    let worker = ClientWorker::new(
        key.as_bytes(),
        options.max_retries,
        options.max_size,
        tag,
    )
    .map_err(|e| anyhow!(e.to_string()))?;

    client::run(
        worker,
        qsotp_rx,
        wrapper_tx,
        overlay_tx,
        qdata_tx,
        options.poll_delay,
        options.response_timeout,
        bootstrap,
    )
    .await;

    Ok(())
}
