//! Address parsing for client subcommands

use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl RemoteAddr {
    /// `host:port` with IPv6 hosts bracketed, ready for `TcpStream::connect`
    pub fn socket_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Accepts `host`, `host:port`, `[v6]`, `[v6]:port`, bare `v6`, optionally
/// behind an `ecpipe://` scheme. A port inside `addr` wins over `default_port`.
pub fn parse_addr(addr: &str, default_port: u16) -> Result<RemoteAddr> {
    let s = addr.trim();
    let lower = s.to_ascii_lowercase();
    let mut rest = match lower.find("://") {
        Some(i) if &lower[..i] == "ecpipe" => &s[i + 3..],
        Some(_) => bail!("unsupported scheme in {:?}", addr),
        None => s,
    };
    if let Some((hp, _path)) = rest.split_once('/') {
        rest = hp;
    }
    if rest.is_empty() {
        bail!("missing host in {:?}", addr);
    }

    if let Some(v6) = rest.strip_prefix('[') {
        let (host, tail) = match v6.split_once(']') {
            Some(parts) => parts,
            None => bail!("unterminated IPv6 address in {:?}", addr),
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p, addr)?,
            None if tail.is_empty() => default_port,
            None => bail!("unexpected text after IPv6 address in {:?}", addr),
        };
        return Ok(RemoteAddr { host: host.to_string(), port });
    }

    match rest.matches(':').count() {
        0 => Ok(RemoteAddr {
            host: rest.to_string(),
            port: default_port,
        }),
        1 => {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            if host.is_empty() {
                bail!("missing host in {:?}", addr);
            }
            Ok(RemoteAddr {
                host: host.to_string(),
                port: parse_port(port, addr)?,
            })
        }
        // Bare IPv6 literal
        _ => Ok(RemoteAddr {
            host: rest.to_string(),
            port: default_port,
        }),
    }
}

fn parse_port(p: &str, addr: &str) -> Result<u16> {
    match p.parse::<u16>() {
        Ok(0) | Err(_) => bail!("invalid port in {:?}", addr),
        Ok(port) => Ok(port),
    }
}
