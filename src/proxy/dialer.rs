//! SOCKS5 v5 client: dials a target through an upstream proxy, with
//! username/password auth per RFC 1929 when the entry carries credentials.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{RotapoolError, RotapoolResult};
use crate::pool::Entry;

const VER: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dial `host:port` through the upstream described by `entry`, bounded by
/// `timeout` for the whole connect + negotiation.
pub async fn dial_through_socks5(
    entry: &Entry,
    host: &str,
    port: u16,
    timeout: Duration,
) -> RotapoolResult<TcpStream> {
    let auth = match (&entry.username, &entry.password) {
        (Some(u), Some(p)) if !u.is_empty() || !p.is_empty() => Some((u.as_str(), p.as_str())),
        _ => None,
    };
    tokio::time::timeout(timeout, socks5_connect(&entry.dial_addr, auth, host, port))
        .await
        .map_err(|_| RotapoolError::timeout(format!("socks5 dial via {}", entry.dial_addr)))?
}

/// Raw SOCKS5 CONNECT through `proxy_addr`; the caller owns the deadline.
pub async fn socks5_connect(
    proxy_addr: &str,
    auth: Option<(&str, &str)>,
    host: &str,
    port: u16,
) -> RotapoolResult<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.set_nodelay(true).ok();

    // Method negotiation.
    let greeting: &[u8] = if auth.is_some() {
        &[VER, 0x02, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[VER, 0x01, METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VER {
        return Err(RotapoolError::socks("bad version in method reply"));
    }
    match choice[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let (user, pass) = auth.ok_or_else(|| {
                RotapoolError::socks("upstream requires auth but no credentials configured")
            })?;
            if user.len() > 255 || pass.len() > 255 {
                return Err(RotapoolError::socks("credentials too long"));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(RotapoolError::socks("upstream rejected credentials"));
            }
        }
        _ => return Err(RotapoolError::socks("no acceptable auth method")),
    }

    // CONNECT request.
    let mut msg = Vec::with_capacity(22);
    msg.extend_from_slice(&[VER, CMD_CONNECT, 0x00]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            msg.push(ATYP_IPV4);
            msg.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            msg.push(ATYP_IPV6);
            msg.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(RotapoolError::socks("target hostname too long"));
            }
            msg.push(ATYP_DOMAIN);
            msg.push(host.len() as u8);
            msg.extend_from_slice(host.as_bytes());
        }
    }
    msg.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&msg).await?;

    // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VER {
        return Err(RotapoolError::socks("bad version in connect reply"));
    }
    if head[1] != 0x00 {
        return Err(RotapoolError::socks(format!(
            "connect failed, rep={:#04x}",
            head[1]
        )));
    }
    consume_bound_addr(&mut stream, head[3]).await?;

    Ok(stream)
}

async fn consume_bound_addr(stream: &mut TcpStream, atyp: u8) -> RotapoolResult<()> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 4 + 2];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 16 + 2];
            stream.read_exact(&mut buf).await?;
        }
        _ => return Err(RotapoolError::socks("bad atyp in connect reply")),
    }
    Ok(())
}

/// Split a `host:port` target; IPv6 literals keep their brackets stripped.
pub fn split_host_port(target: &str) -> RotapoolResult<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| RotapoolError::proxy(format!("missing port in {:?}", target)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| RotapoolError::proxy(format!("bad port in {:?}", target)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}
