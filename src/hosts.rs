use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::types::Target;

/// Parse a host list into targets, keeping input order.
///
/// Supported formats per line:
/// - bare host or IP: `mc.example.org`, `10.0.0.5`, `::1`
/// - host with port: `mc.example.org:25570`, `[::1]:25570`
/// - lines starting with `#` and blank lines are ignored
///
/// Hosts are not resolved or deduplicated here; a bad name fails later, at probe time.
pub fn parse_hosts_str(s: &str, default_port: u16) -> Result<Vec<Target>> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let target = parse_target(line, default_port).with_context(|| format!("line {}: {line}", idx + 1))?;
        out.push(target);
    }
    Ok(out)
}

/// Load a host list from a file. Errors if the file cannot be read or parsed.
pub fn load_hosts_from_path(path: impl AsRef<Path>, default_port: u16) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read hosts file: {}", path.as_ref().display()))?;
    parse_hosts_str(&content, default_port)
}

/// Parse one `host`, `host:port` or `[v6]:port` entry.
pub fn parse_target(line: &str, default_port: u16) -> Result<Target> {
    let line = line.trim();
    if line.is_empty() {
        bail!("empty host");
    }

    if let Some(rest) = line.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            bail!("unterminated IPv6 literal: {line}");
        };
        let port = match tail {
            "" => default_port,
            _ => match tail.strip_prefix(':') {
                Some(p) => parse_port_str(p)?,
                None => bail!("unexpected text after IPv6 literal: {tail}"),
            },
        };
        return non_empty(host, port);
    }

    match line.split_once(':') {
        // A single colon separates a port; more than one means a bare IPv6 literal.
        Some((host, port)) if !port.contains(':') => non_empty(host, parse_port_str(port)?),
        _ => Ok(Target::new(line, default_port)),
    }
}

fn non_empty(host: &str, port: u16) -> Result<Target> {
    if host.is_empty() {
        bail!("missing host before port {port}");
    }
    Ok(Target::new(host, port))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.trim().parse::<u32>().map_err(|e| anyhow::anyhow!("invalid port {s:?}: {e}"))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
