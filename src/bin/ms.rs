use std::io::Write;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use clap::{App, AppSettings, Arg};
use log::{debug, error};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use mistica::message::{inbox, Endpoint, Message, Outbox, Signal};
use mistica::overlay::run_server_overlay;
use mistica::registry::{self, Side};
use mistica::sotp::router::{self, OverlayHandle, Router, WrapModuleHandle, WrapServerHandle};
use mistica::wrapper::run_server_wrapper;

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

/// Operator input: raw stdin forwarded to the overlay module.
async fn capture_input(overlay_tx: Outbox) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; INPUT_READ_SIZE];
    loop {
        match stdin.read(&mut buf).await {
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
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = App::new("ms")
        .version("0.1.0")
        .about("Mistica server: terminates covert tunnels behind carrier listeners")
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
                .help("Argument string passed to the wrap module"),
        )
        .arg(
            Arg::with_name("wrap-server-args")
                .long("wrap-server-args")
                .takes_value(true)
                .default_value("")
                .allow_hyphen_values(true)
                .help("Argument string passed to the wrap server"),
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
            Some(name) => registry::print_module_help(Side::Server, name)
                .map_err(|e| anyhow!(e.to_string()))?,
            None => registry::print_module_list(Side::Server),
        }
        return Ok(());
    }

    init_logging(matches.occurrences_of("v"));

    let key = matches.value_of("key").unwrap().to_owned();
    let modules = matches.value_of("modules").unwrap();
    let (overlay_name, wrapper_name) = modules
        .split_once(':')
        .ok_or_else(|| anyhow!("--modules expects overlay:wrapper, got `{modules}`"))?;

    if key.is_empty() {
        return Err(anyhow!("--key must not be empty"));
    }

    let mut r = Router::new(key.as_bytes());
    let (router_tx, router_rx) = inbox();

    // Wrap module: its worker options configure every spawned session.
    let wrap_module =
        registry::build_server_wrapper(wrapper_name, matches.value_of("wrapper-args").unwrap())
            .map_err(|e| anyhow!(e.to_string()))?;
    let worker_options = wrap_module.worker_options();
    let (wrap_tx, wrap_rx) = inbox();
    r.register_wrap_module(WrapModuleHandle {
        id: 1,
        name: wrap_module.name().to_owned(),
        tx: wrap_tx.clone(),
        max_size: worker_options.max_size,
        max_retries: worker_options.max_retries,
    });
    tokio::spawn(run_server_wrapper(wrap_module, 1, wrap_rx, router_tx.clone()));

    // Overlay module.
    let (overlay_tx, overlay_rx) = inbox();
    let (link_tx, link_rx) = mpsc::channel(4);
    let overlay = registry::build_server_overlay(
        overlay_name,
        matches.value_of("overlay-args").unwrap(),
        overlay_tx.clone(),
    )
    .await
    .map_err(|e| anyhow!(e.to_string()))?;
    r.register_overlay(OverlayHandle {
        id: 1,
        name: overlay.name().to_owned(),
        tag: overlay.tag(),
        tx: overlay_tx.clone(),
        link_tx,
    });
    tokio::spawn(run_server_overlay(
        overlay,
        1,
        overlay_rx,
        link_rx,
        router_tx.clone(),
    ));

    // Wrap server: the carrier listener feeding the wrap module.
    let wrap_server =
        registry::build_wrap_server(wrapper_name, matches.value_of("wrap-server-args").unwrap())
            .map_err(|e| anyhow!(e.to_string()))?;
    let (wrap_server_tx, mut wrap_server_rx) = inbox();
    r.register_wrap_server(WrapServerHandle {
        id: 1,
        name: wrap_server.name().to_owned(),
        tx: wrap_server_tx,
    });
    let listener = tokio::spawn(async move {
        if let Err(err) = wrap_server.run(1, vec![wrap_tx]).await {
            error!("wrap server failed: {err}");
        }
    });
    tokio::spawn(async move {
        // The listener owns blocking socket loops; terminate by abort.
        while let Some(msg) = wrap_server_rx.recv().await {
            if msg.is_terminate() {
                listener.abort();
                break;
            }
        }
    });

    tokio::spawn(capture_input(overlay_tx.clone()));

    {
        let router_tx = router_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("SIGINT received, terminating router");
                let _ = router_tx
                    .send(Message::signal(
                        Endpoint::Input,
                        0,
                        Endpoint::Router,
                        0,
                        Signal::Terminate,
                    ))
                    .await;
            }
        });
    }

    router::run(r, router_rx, router_tx).await;

    Ok(())
}
