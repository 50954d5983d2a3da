//! Staged on a remote host by the port picker. Prints one free TCP port
//! number on stdout and nothing else.

use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

#[derive(Parser, Debug)]
#[command(name = "port-probe", version, about = "Print a free TCP port")]
struct Args {
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,
    /// Scan `LOW-HIGH` instead of asking the OS for an ephemeral port.
    #[arg(long, value_parser = parse_range)]
    range: Option<RangeInclusive<u16>>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let port = match args.range {
        Some(range) => scan(args.bind, range.clone()).with_context(|| {
            format!("no free port in {}-{}", range.start(), range.end())
        })?,
        None => ephemeral(args.bind)?,
    };
    println!("{port}");
    Ok(())
}

fn ephemeral(bind: IpAddr) -> anyhow::Result<u16> {
    let listener =
        TcpListener::bind((bind, 0)).with_context(|| format!("failed to bind {bind}:0"))?;
    Ok(listener.local_addr()?.port())
}

// The listener is dropped before returning; the port may be taken again
// before the caller binds it.
fn scan(bind: IpAddr, range: RangeInclusive<u16>) -> Option<u16> {
    range
        .into_iter()
        .find(|port| TcpListener::bind((bind, *port)).is_ok())
}

fn parse_range(raw: &str) -> Result<RangeInclusive<u16>, String> {
    let (low, high) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got {raw:?}"))?;
    let low: u16 = low
        .trim()
        .parse()
        .map_err(|err| format!("invalid low port {low:?}: {err}"))?;
    let high: u16 = high
        .trim()
        .parse()
        .map_err(|err| format!("invalid high port {high:?}: {err}"))?;
    if low == 0 || low > high {
        return Err(format!("invalid port range {low}-{high}"));
    }
    Ok(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_range("8000-8010").unwrap(), 8000..=8010);
        assert_eq!(parse_range(" 9000 - 9000 ").unwrap(), 9000..=9000);
        assert!(parse_range("8010-8000").is_err());
        assert!(parse_range("0-10").is_err());
        assert!(parse_range("8000").is_err());
        assert!(parse_range("a-b").is_err());
    }

    #[test]
    fn ephemeral_port_is_nonzero() {
        assert_ne!(ephemeral(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap(), 0);
    }

    #[test]
    fn scan_skips_ports_in_use() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        assert_eq!(scan(IpAddr::V4(Ipv4Addr::LOCALHOST), port..=port), None);
        drop(taken);
        assert_eq!(scan(IpAddr::V4(Ipv4Addr::LOCALHOST), port..=port), Some(port));
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from(["port-probe", "--range", "8000-8001"]).unwrap();
        assert_eq!(args.range, Some(8000..=8001));
        assert_eq!(args.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
