use std::str::FromStr;

use clap::{App, ArgMatches};

use crate::error::{Error, Result};
use crate::message::Outbox;
use crate::overlay::io::IoOverlay;
use crate::overlay::shell::ShellOverlay;
use crate::overlay::tcp::{TcpConnectOverlay, TcpListenOverlay};
use crate::overlay::{ClientOverlay, ServerOverlay};
use crate::wrapper::dns::{DnsServerWrapper, DnsWrapServer, DnsWrapper};
use crate::wrapper::http::{HttpServerWrapper, HttpWrapServer, HttpWrapper};
use crate::wrapper::icmp::{IcmpServerWrapper, IcmpWrapServer, IcmpWrapper};
use crate::wrapper::tcp::{TcpServerWrapper, TcpWrapServer, TcpWrapper};
use crate::wrapper::{ClientWrapper, ServerWrapper, WrapServer};

/// Which side of the tunnel a module belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// One registered module: the explicit replacement for discovering
/// modules by subclass enumeration.
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub kind: &'static str,
    pub description: &'static str,
}

pub fn overlays(side: Side) -> Vec<ModuleDescriptor> {
    match side {
        Side::Client => vec![
            ModuleDescriptor {
                name: IoOverlay::NAME,
                kind: "overlay",
                description: IoOverlay::DESCRIPTION,
            },
            ModuleDescriptor {
                name: ShellOverlay::NAME,
                kind: "overlay",
                description: ShellOverlay::DESCRIPTION,
            },
            ModuleDescriptor {
                name: TcpConnectOverlay::NAME,
                kind: "overlay",
                description: TcpConnectOverlay::DESCRIPTION,
            },
        ],
        Side::Server => vec![
            ModuleDescriptor {
                name: IoOverlay::NAME,
                kind: "overlay",
                description: IoOverlay::DESCRIPTION,
            },
            ModuleDescriptor {
                name: ShellOverlay::NAME,
                kind: "overlay",
                description: ShellOverlay::DESCRIPTION,
            },
            ModuleDescriptor {
                name: TcpListenOverlay::NAME,
                kind: "overlay",
                description: TcpListenOverlay::DESCRIPTION,
            },
        ],
    }
}

// The wrapper set is symmetric across sides.
pub fn wrappers(_side: Side) -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor {
            name: HttpWrapper::NAME,
            kind: "wrapper",
            description: HttpWrapper::DESCRIPTION,
        },
        ModuleDescriptor {
            name: DnsWrapper::NAME,
            kind: "wrapper",
            description: DnsWrapper::DESCRIPTION,
        },
        ModuleDescriptor {
            name: IcmpWrapper::NAME,
            kind: "wrapper",
            description: IcmpWrapper::DESCRIPTION,
        },
        ModuleDescriptor {
            name: TcpWrapper::NAME,
            kind: "wrapper",
            description: TcpWrapper::DESCRIPTION,
        },
    ]
}

/// Prints the module table for `--list`.
pub fn print_module_list(side: Side) {
    println!("{:<12} {:<9} DESCRIPTION", "NAME", "KIND");
    for module in overlays(side).into_iter().chain(wrappers(side)) {
        println!("{:<12} {:<9} {}", module.name, module.kind, module.description);
    }
}

/// Prints one module's argument summary for `--list <module>`.
pub fn print_module_help(side: Side, name: &str) -> Result<()> {
    match (side, name) {
        (_, "io") => IoOverlay::print_help(),
        (_, "shell") => ShellOverlay::print_help(),
        (Side::Client, "tcpconnect") => TcpConnectOverlay::print_help(),
        (Side::Server, "tcplisten") => TcpListenOverlay::print_help(),
        (_, "http") => HttpWrapper::print_help(),
        (_, "dns") => DnsWrapper::print_help(),
        (_, "icmp") => IcmpWrapper::print_help(),
        (_, "tcp") => TcpWrapper::print_help(),
        (_, "httpserver") => HttpWrapServer::print_help(),
        (_, "dnsserver") => DnsWrapServer::print_help(),
        (_, "icmpserver") => IcmpWrapServer::print_help(),
        (_, "tcpserver") => TcpWrapServer::print_help(),
        _ => return Err(Error::ErrConfig(format!("unknown module `{name}`"))),
    }
    println!();
    Ok(())
}

/// Builds a client overlay by name and runs its start hook.
pub async fn build_client_overlay(
    name: &str,
    args: &str,
    overlay_tx: Outbox,
) -> Result<Box<dyn ClientOverlay>> {
    let mut overlay: Box<dyn ClientOverlay> = match name {
        "io" => Box::new(IoOverlay::new(args)?),
        "shell" => Box::new(ShellOverlay::new(args)?),
        "tcpconnect" => Box::new(TcpConnectOverlay::new(args)?),
        _ => return Err(Error::ErrConfig(format!("unknown overlay `{name}`"))),
    };
    overlay.start(overlay_tx).await?;
    Ok(overlay)
}

/// Builds a server overlay by name and runs its start hook.
pub async fn build_server_overlay(
    name: &str,
    args: &str,
    overlay_tx: Outbox,
) -> Result<Box<dyn ServerOverlay>> {
    let mut overlay: Box<dyn ServerOverlay> = match name {
        "io" => Box::new(IoOverlay::new(args)?),
        "shell" => Box::new(ShellOverlay::new(args)?),
        "tcplisten" => Box::new(TcpListenOverlay::new(args)?),
        _ => return Err(Error::ErrConfig(format!("unknown overlay `{name}`"))),
    };
    overlay.start(overlay_tx).await?;
    Ok(overlay)
}

pub fn build_client_wrapper(name: &str, args: &str) -> Result<Box<dyn ClientWrapper>> {
    Ok(match name {
        "http" => Box::new(HttpWrapper::new(args)?),
        "dns" => Box::new(DnsWrapper::new(args)?),
        "icmp" => Box::new(IcmpWrapper::new(args)?),
        "tcp" => Box::new(TcpWrapper::new(args)?),
        _ => return Err(Error::ErrConfig(format!("unknown wrapper `{name}`"))),
    })
}

pub fn build_server_wrapper(name: &str, args: &str) -> Result<Box<dyn ServerWrapper>> {
    Ok(match name {
        "http" => Box::new(HttpServerWrapper::new(args)?),
        "dns" => Box::new(DnsServerWrapper::new(args)?),
        "icmp" => Box::new(IcmpServerWrapper::new(args)?),
        "tcp" => Box::new(TcpServerWrapper::new(args)?),
        _ => return Err(Error::ErrConfig(format!("unknown wrapper `{name}`"))),
    })
}

/// The wrap server hosting a given wrapper module.
pub fn build_wrap_server(wrapper_name: &str, args: &str) -> Result<Box<dyn WrapServer>> {
    Ok(match wrapper_name {
        "http" => Box::new(HttpWrapServer::new(args)?),
        "dns" => Box::new(DnsWrapServer::new(args)?),
        "icmp" => Box::new(IcmpWrapServer::new(args)?),
        "tcp" => Box::new(TcpWrapServer::new(args)?),
        _ => return Err(Error::ErrConfig(format!("unknown wrapper `{wrapper_name}`"))),
    })
}

/// Parses a module argument string with the module's own clap parser.
pub fn parse_module_args(app: App<'static>, name: &str, args: &str) -> Result<ArgMatches> {
    let argv = std::iter::once(name.to_owned()).chain(args.split_whitespace().map(str::to_owned));
    app.try_get_matches_from(argv)
        .map_err(|e| Error::ErrConfig(format!("{name}: {e}")))
}

/// Accepts `0xab01` or `ab01`.
pub fn parse_tag(value: &str) -> Result<u16> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u16::from_str_radix(digits, 16).map_err(|_| Error::ErrConfig(format!("invalid tag `{value}`")))
}

pub fn parse_number<T: FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::ErrConfig(format!("invalid number `{value}`")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_tag_formats() {
        assert_eq!(parse_tag("0xab01").unwrap(), 0xab01);
        assert_eq!(parse_tag("AB01").unwrap(), 0xab01);
        assert!(parse_tag("zz").is_err());
    }

    #[test]
    fn test_unknown_module_is_config_error() {
        assert!(build_client_wrapper("smtp", "").is_err());
        assert!(build_server_wrapper("smtp", "").is_err());
        assert!(build_wrap_server("smtp", "").is_err());
    }

    #[tokio::test]
    async fn test_known_modules_build() {
        let (tx, _rx) = crate::message::inbox();
        assert!(build_client_overlay("io", "", tx.clone()).await.is_ok());
        assert!(build_client_overlay("shell", "", tx).await.is_ok());
        assert!(build_client_wrapper("http", "").is_ok());
        assert!(build_client_wrapper("dns", "").is_ok());
        assert!(build_client_wrapper("tcp", "").is_ok());
    }

    #[test]
    fn test_listings_cover_both_sides() {
        assert_eq!(overlays(Side::Client).len(), 3);
        assert_eq!(overlays(Side::Server).len(), 3);
        assert!(!wrappers(Side::Client).is_empty());
    }
}
