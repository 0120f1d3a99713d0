//! The HTTP `CONNECT` front end: request-line parse, header skip, and the
//! 200/405/502 replies spec.md section 4.6 and 6 call for.
//!
//! Unlike the teacher's `proxy/connect.rs` (which rides on `hyper` because
//! its remote relay serves full HTTP), this front end only ever needs to
//! read one `CONNECT host:port HTTP/1.x` line and discard headers, so it
//! stays at the same manual byte-level register as [`crate::socks5`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Bound on any single request-line or header line, per spec.md section 5.
const MAX_LINE_LEN: usize = 8 * 1024;

pub const RESPONSE_200: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_405: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// Read the request line and header block from a `BufReader`-wrapped
/// connection. On success, caller opens a stream and replies 200/502; on
/// failure the 405 reply has already been written.
pub async fn read_connect_request<R>(reader: &mut BufReader<R>) -> Result<Target>
where
    R: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_bounded_line(reader).await?;
    let line = line.trim_end_matches(['\r', '\n']);

    let Some(rest) = line.strip_prefix("CONNECT ") else {
        let _ = reader.get_mut().write_all(RESPONSE_405).await;
        return Err(Error::LocalProtocol(format!(
            "unsupported http method in request line: {line}"
        )));
    };

    let authority = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::LocalProtocol("missing CONNECT authority".to_string()))?;
    let target = parse_authority(authority)?;

    // Drain headers until the blank line that ends the request.
    loop {
        let header_line = read_bounded_line(reader).await?;
        if header_line == "\r\n" || header_line == "\n" || header_line.is_empty() {
            break;
        }
    }

    Ok(target)
}

fn parse_authority(authority: &str) -> Result<Target> {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal: `[::1]:8443` or bare `[::1]`.
        let Some(end) = rest.find(']') else {
            return Err(Error::LocalProtocol(format!(
                "invalid CONNECT authority: {authority}"
            )));
        };
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::LocalProtocol(format!("invalid port in authority: {p}")))?,
            None => 443,
        };
        return Ok(Target { host, port });
    }

    match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse()
                .map_err(|_| Error::LocalProtocol(format!("invalid port: {port_str}")))?;
            Ok(Target {
                host: host.to_string(),
                port,
            })
        }
        None => Ok(Target {
            host: authority.to_string(),
            port: 443,
        }),
    }
}

/// Read one CR-LF terminated line byte by byte, bounded to
/// [`MAX_LINE_LEN`]. Byte-at-a-time avoids pulling in a second buffering
/// layer on top of `BufReader`, at the cost of one syscall-free read per
/// byte (the underlying reader is already buffered).
async fn read_bounded_line<R>(reader: &mut BufReader<R>) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| Error::LocalProtocol(format!("failed to read request line: {e}")))?;
        buf.push(byte);
        if byte == b'\n' {
            break;
        }
        if buf.len() > MAX_LINE_LEN {
            return Err(Error::LocalProtocol(format!(
                "request line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
    }
    String::from_utf8(buf).map_err(|_| Error::LocalProtocol("request line is not utf-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn happy_path_connect() {
        let (mut client, server) = duplex(512);
        let mut server = BufReader::new(server);
        let server_task = tokio::spawn(async move {
            let target = read_connect_request(&mut server).await.unwrap();
            server.get_mut().write_all(RESPONSE_200).await.unwrap();
            target
        });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut reply = [0u8; RESPONSE_200.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, RESPONSE_200);

        let target = server_task.await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn default_port_is_443() {
        let (mut client, server) = duplex(512);
        let mut server = BufReader::new(server);
        let server_task =
            tokio::spawn(async move { read_connect_request(&mut server).await.unwrap() });
        client
            .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let target = server_task.await.unwrap();
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn non_connect_method_gets_405() {
        let (mut client, server) = duplex(512);
        let mut server = BufReader::new(server);
        let server_task = tokio::spawn(async move { read_connect_request(&mut server).await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = [0u8; RESPONSE_405.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, RESPONSE_405);

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LocalProtocol(_)));
    }

    #[tokio::test]
    async fn ipv6_authority_parses() {
        let target = parse_authority("[::1]:8443").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 8443);
    }
}
