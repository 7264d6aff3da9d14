//! ptun-route: print the route the OS picks for each address
//!
//! ```text
//! ptun-route 1.1.1.1 2606:4700:4700::1111
//! ```

use anyhow::{Context, Result, bail};
use ptun_core::{RouteResolution, RouteResolver};
use std::net::IpAddr;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let addrs = parse_args(std::env::args().skip(1))?;
    debug!("Resolving {} addresses", addrs.len());

    let resolver = RouteResolver::shared();
    let mut failed = 0;
    for addr in addrs {
        match resolver.resolve(addr) {
            Ok(route) => println!("{}", describe(&route)),
            Err(e) => {
                error!("{}: {}", addr, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} lookups failed", failed);
    }
    Ok(())
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Vec<IpAddr>> {
    let addrs = args
        .map(|arg| {
            arg.parse::<IpAddr>()
                .with_context(|| format!("not an IP address: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;
    if addrs.is_empty() {
        bail!("usage: ptun-route <address>...");
    }
    Ok(addrs)
}

fn describe(route: &RouteResolution) -> String {
    let gateway = route
        .gateway
        .map_or_else(|| "-".to_string(), |gw| gw.to_string());
    let tunnel = if route.is_tunnel_interface() { " (tunnel)" } else { "" };
    format!(
        "{} via {} netmask {} dev {}#{}{}",
        route.destination,
        gateway,
        route.netmask.as_deref().unwrap_or("-"),
        route.interface_name,
        route.interface_index,
        tunnel
    )
}
