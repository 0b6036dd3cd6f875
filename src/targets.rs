use anyhow::{anyhow, bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::types::Target;

/// Shortest IPv4 prefix accepted for expansion (a /16 is 65 534 hosts).
pub const MIN_CIDR_PREFIX: u8 = 16;

/// Resolve the `--target` argument into an ordered list of targets.
///
/// If `input` names a readable file, each line is one entry. Otherwise the
/// input is a comma-separated list (a single value is a list of one).
pub fn load_targets(input: &str, default_port: u16) -> Result<Vec<Target>> {
    let path = Path::new(input);
    if path.is_file() {
        return load_targets_from_path(path, default_port);
    }
    let mut out = Vec::new();
    for item in input.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        out.extend(
            parse_target_entry(item, default_port)
                .with_context(|| format!("invalid target: {item}"))?,
        );
    }
    Ok(out)
}

/// Load targets from a file. Errors if the file cannot be read or an entry is malformed.
pub fn load_targets_from_path(path: impl AsRef<Path>, default_port: u16) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    parse_targets_str(&content, default_port)
}

/// Parse a targets file content, one entry per line.
///
/// Supported formats per line:
/// - host or IP: `192.168.1.10`, `broker.local`
/// - with port: `192.168.1.10:1884`, `[fe80::1]:8883`
/// - IPv4 CIDR, optionally with port: `10.0.0.0/30:1883`
/// - comments: everything after `#` is ignored
pub fn parse_targets_str(s: &str, default_port: u16) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let targets = parse_target_entry(line, default_port)
            .with_context(|| format!("line {line_no}: invalid target: {line}"))?;
        out.extend(targets);
    }
    Ok(out)
}

/// Parse one entry into one target, or several when it is a CIDR block.
pub fn parse_target_entry(entry: &str, default_port: u16) -> Result<Vec<Target>> {
    let (host, port) = split_host_port(entry, default_port)?;
    if host.is_empty() {
        bail!("empty host");
    }
    if host.contains('/') {
        let net: IpNet = host
            .parse()
            .map_err(|e| anyhow!("invalid CIDR {host}: {e}"))?;
        if let IpNet::V4(n4) = net {
            if n4.prefix_len() < MIN_CIDR_PREFIX {
                bail!("CIDR too large: {host} (prefix shorter than /{MIN_CIDR_PREFIX})");
            }
        }
        let ips = expand_cidr_to_ips(net);
        if ips.is_empty() {
            bail!("CIDR {host} has no scannable IPv4 hosts");
        }
        return Ok(ips
            .into_iter()
            .map(|ip| Target::new(ip.to_string(), port))
            .collect());
    }
    Ok(vec![Target::new(host, port)])
}

fn split_host_port(entry: &str, default_port: u16) -> Result<(String, u16)> {
    // `[v6]` or `[v6]:port`
    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("missing closing bracket"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port_str(p)?,
            None if tail.is_empty() => default_port,
            None => bail!("unexpected text after bracketed host: {tail}"),
        };
        return Ok((host.to_string(), port));
    }
    // A bare IPv6 address carries no port.
    if entry.parse::<Ipv6Addr>().is_ok() {
        return Ok((entry.to_string(), default_port));
    }
    match entry.rsplit_once(':') {
        Some((host, port)) => Ok((host.trim().to_string(), parse_port_str(port.trim())?)),
        None => Ok((entry.to_string(), default_port)),
    }
}

/// Expand a CIDR into individual IP addresses suitable for host scanning.
///
/// For IPv4, excludes the network and broadcast addresses except for /31 and /32.
/// IPv6 blocks are not expanded and return an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow!("invalid port {s:?}: {e}"))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
