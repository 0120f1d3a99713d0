//! RFC 1928 SOCKS5 front end: no-auth method, `CONNECT` command only.
//!
//! Grounded on the manual byte-level handshake style of the pack's
//! `socks5.rs` reference implementation (greeting -> request -> address
//! decode -> reply), adapted to read straight off whatever `AsyncRead +
//! AsyncWrite` the caller hands in so it can be driven by `tokio::io::duplex`
//! in tests instead of a real `TcpStream`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// The `host:port` a client asked to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

/// Run the SOCKS5 greeting and CONNECT request, replying with the success
/// frame on success. Returns the decoded target; the caller is expected to
/// open a stream and then enter the bidirectional copy.
///
/// On any local-protocol failure, the appropriate SOCKS5 failure reply is
/// already written to `io` before this returns `Err`.
pub async fn handshake<IO>(io: &mut IO) -> Result<Target>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    read_greeting(io).await?;
    io.write_all(&[SOCKS_VERSION, 0x00])
        .await
        .map_err(io_err)?;

    let mut header = [0u8; 4];
    io.read_exact(&mut header)
        .await
        .map_err(|e| Error::LocalProtocol(format!("failed to read socks5 request: {e}")))?;

    if header[0] != SOCKS_VERSION {
        return Err(Error::LocalProtocol(format!(
            "invalid socks5 request version: {}",
            header[0]
        )));
    }

    if header[1] != CMD_CONNECT {
        write_reply(io, REP_COMMAND_NOT_SUPPORTED).await;
        return Err(Error::LocalProtocol(format!(
            "unsupported socks5 command: {}",
            header[1]
        )));
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            io.read_exact(&mut addr).await.map_err(io_err)?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            io.read_exact(&mut len_buf).await.map_err(io_err)?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            io.read_exact(&mut domain).await.map_err(io_err)?;
            String::from_utf8(domain)
                .map_err(|_| Error::LocalProtocol("domain name is not utf-8".to_string()))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            io.read_exact(&mut addr).await.map_err(io_err)?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            write_reply(io, REP_ADDRESS_TYPE_NOT_SUPPORTED).await;
            return Err(Error::LocalProtocol(format!(
                "unsupported socks5 address type: {other}"
            )));
        }
    };

    let mut port_buf = [0u8; 2];
    io.read_exact(&mut port_buf)
        .await
        .map_err(|e| Error::LocalProtocol(format!("failed to read socks5 port: {e}")))?;
    let port = u16::from_be_bytes(port_buf);

    debug!(host = %host, port, "socks5 CONNECT request");
    Ok(Target { host, port })
}

async fn read_greeting<IO>(io: &mut IO) -> Result<()>
where
    IO: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    io.read_exact(&mut header)
        .await
        .map_err(|e| Error::LocalProtocol(format!("failed to read socks5 greeting: {e}")))?;

    if header[0] != SOCKS_VERSION {
        return Err(Error::LocalProtocol(format!(
            "invalid socks5 version: {}",
            header[0]
        )));
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    io.read_exact(&mut methods)
        .await
        .map_err(|e| Error::LocalProtocol(format!("failed to read socks5 methods: {e}")))?;
    Ok(())
}

/// Write the success reply: `VER REP RSV ATYP BND.ADDR BND.PORT`, with the
/// bound address left as zeros per spec.md section 4.5.
pub async fn write_success<IO>(io: &mut IO) -> std::io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    io.write_all(&[SOCKS_VERSION, REP_SUCCESS, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Write the connection-refused reply used when `pool.open_stream` fails.
pub async fn write_refused<IO>(io: &mut IO) -> std::io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    write_reply(io, REP_CONNECTION_REFUSED).await;
    Ok(())
}

async fn write_reply<IO>(io: &mut IO, rep: u8)
where
    IO: AsyncWrite + Unpin,
{
    let _ = io
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await;
}

/// Translate an `open_stream` failure into the SOCKS5 reply code and write
/// it, per the propagation policy in spec.md section 7.
pub async fn write_failure_for<IO>(io: &mut IO, err: &Error)
where
    IO: AsyncWrite + Unpin,
{
    let rep = match err {
        Error::ConnectionRefused(_) | Error::StreamOpenTimeout | Error::InvalidResponse => {
            REP_CONNECTION_REFUSED
        }
        _ => REP_GENERAL_FAILURE,
    };
    write_reply(io, rep).await;
}

fn io_err(e: std::io::Error) -> Error {
    Error::LocalProtocol(format!("socks5 io error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn happy_path_domain_connect() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move {
            let target = handshake(&mut server).await.unwrap();
            write_success(&mut server).await.unwrap();
            target
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 0x0e];
        req.extend_from_slice(b"www.example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let target = server_task.await.unwrap();
        assert_eq!(target.host, "www.example.com");
        assert_eq!(target.port, 443);
    }

    #[tokio::test]
    async fn ipv4_target_decodes() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move {
            let target = handshake(&mut server).await.unwrap();
            write_success(&mut server).await.unwrap();
            target
        });
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();

        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&[93, 184, 216, 34]);
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        let target = server_task.await.unwrap();
        assert_eq!(target.host, "93.184.216.34");
        assert_eq!(target.port, 80);
    }

    #[tokio::test]
    async fn rejects_bind_command() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LocalProtocol(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let (mut client, mut server) = duplex(256);
        let server_task = tokio::spawn(async move { handshake(&mut server).await });
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let err = server_task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LocalProtocol(_)));
    }
}
