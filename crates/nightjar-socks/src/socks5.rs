//! Client side of the SOCKS5 protocol (RFC 1928, RFC 1929).
//!
//! Only the CONNECT command is implemented; that is all an HTTP client
//! tunneling through tor or lokinet needs.  Binary-format care: the reply
//! address length depends on the address type byte (4 for IPv4, 16 for
//! IPv6, length-prefixed for domains), and the two-byte port always
//! follows it.

use std::net::{IpAddr, ToSocketAddrs};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::err::FetchError;
use crate::proxy::{ProxyUrl, SocksFlavor};
use crate::Result;

/// SOCKS protocol version byte.
const SOCKS_V5: u8 = 0x05;
/// "No authentication" method.
const METHOD_NONE: u8 = 0x00;
/// "Username/password" method (RFC 1929).
const METHOD_USERPASS: u8 = 0x02;
/// "No acceptable methods" reply.
const METHOD_REJECTED: u8 = 0xFF;
/// The CONNECT command.
const CMD_CONNECT: u8 = 0x01;
/// Address type: IPv4.
const ATYP_V4: u8 = 0x01;
/// Address type: domain name.
const ATYP_DOMAIN: u8 = 0x03;
/// Address type: IPv6.
const ATYP_V6: u8 = 0x04;

/// Where a CONNECT should go.
#[derive(Debug, Clone)]
pub(crate) struct ConnectTarget {
    /// Hostname or IP literal.
    pub(crate) host: String,
    /// Destination port.
    pub(crate) port: u16,
}

/// Perform the full SOCKS5 client handshake over `stream`, leaving the
/// stream ready to carry the tunneled connection.
pub(crate) async fn connect_through<S>(
    stream: &mut S,
    proxy: &ProxyUrl,
    target: &ConnectTarget,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, proxy).await?;
    send_connect(stream, proxy.flavor(), target).await?;
    read_reply(stream).await
}

/// Greeting and (optionally) username/password sub-negotiation.
async fn negotiate_method<S>(stream: &mut S, proxy: &ProxyUrl) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wanted = match proxy.auth() {
        Some(_) => METHOD_USERPASS,
        None => METHOD_NONE,
    };
    stream
        .write_all(&[SOCKS_V5, 1, wanted])
        .await
        .map_err(|e| FetchError::unreachable("socks greeting", e))?;
    stream
        .flush()
        .await
        .map_err(|e| FetchError::unreachable("socks greeting", e))?;

    let mut reply = [0_u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| FetchError::unreachable("socks method reply", e))?;
    if reply[0] != SOCKS_V5 {
        return Err(FetchError::handshake(format!(
            "proxy spoke version {:#04x}, not SOCKS5",
            reply[0]
        )));
    }
    match reply[1] {
        m if m == wanted => {}
        METHOD_REJECTED => {
            return Err(FetchError::handshake(
                "proxy accepted none of our auth methods",
            ));
        }
        other => {
            return Err(FetchError::handshake(format!(
                "proxy chose unsupported auth method {other:#04x}"
            )));
        }
    }

    if let Some((user, pass)) = proxy.auth() {
        // RFC 1929 sub-negotiation.  Credential lengths were validated at
        // parse time.
        let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
        msg.push(0x01);
        msg.push(user.len() as u8);
        msg.extend_from_slice(user);
        msg.push(pass.len() as u8);
        msg.extend_from_slice(pass);
        stream
            .write_all(&msg)
            .await
            .map_err(|e| FetchError::unreachable("socks auth", e))?;
        stream
            .flush()
            .await
            .map_err(|e| FetchError::unreachable("socks auth", e))?;

        let mut reply = [0_u8; 2];
        stream
            .read_exact(&mut reply)
            .await
            .map_err(|e| FetchError::unreachable("socks auth reply", e))?;
        if reply[1] != 0 {
            return Err(FetchError::handshake("proxy rejected credentials"));
        }
    }

    Ok(())
}

/// Send the CONNECT request for `target`.
///
/// For `socks5h` the hostname goes to the proxy verbatim; for plain
/// `socks5` we resolve locally and send the IP.  Hidden-service suffixes
/// cannot be resolved locally, so they are rejected on `socks5`.
async fn send_connect<S>(stream: &mut S, flavor: SocksFlavor, target: &ConnectTarget) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut msg = vec![SOCKS_V5, CMD_CONNECT, 0x00];

    let ip = target.host.parse::<IpAddr>().ok();
    match (flavor, ip) {
        (_, Some(IpAddr::V4(v4))) => {
            msg.push(ATYP_V4);
            msg.extend_from_slice(&v4.octets());
        }
        (_, Some(IpAddr::V6(v6))) => {
            msg.push(ATYP_V6);
            msg.extend_from_slice(&v6.octets());
        }
        (SocksFlavor::Socks5h, None) => {
            let name = target.host.as_bytes();
            if name.is_empty() || name.len() > 255 {
                return Err(FetchError::upstream(format!(
                    "hostname length {} out of range for SOCKS",
                    name.len()
                )));
            }
            msg.push(ATYP_DOMAIN);
            msg.push(name.len() as u8);
            msg.extend_from_slice(name);
        }
        (SocksFlavor::Socks5, None) => {
            if is_anonymous_suffix(&target.host) {
                return Err(FetchError::handshake(format!(
                    "{} requires socks5h (remote resolution)",
                    target.host
                )));
            }
            let addr = (target.host.as_str(), target.port)
                .to_socket_addrs()
                .map_err(|e| FetchError::unreachable("local name resolution", e))?
                .next()
                .ok_or_else(|| {
                    FetchError::unreachable(
                        "local name resolution",
                        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
                    )
                })?;
            match addr.ip() {
                IpAddr::V4(v4) => {
                    msg.push(ATYP_V4);
                    msg.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    msg.push(ATYP_V6);
                    msg.extend_from_slice(&v6.octets());
                }
            }
        }
    }
    msg.extend_from_slice(&target.port.to_be_bytes());

    stream
        .write_all(&msg)
        .await
        .map_err(|e| FetchError::unreachable("socks connect", e))?;
    stream
        .flush()
        .await
        .map_err(|e| FetchError::unreachable("socks connect", e))?;
    Ok(())
}

/// Read and validate the CONNECT reply.
async fn read_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0_u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| FetchError::unreachable("socks connect reply", e))?;
    if head[0] != SOCKS_V5 {
        return Err(FetchError::handshake(format!(
            "reply version {:#04x} is not SOCKS5",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(FetchError::handshake(format!(
            "proxy refused connection: {}",
            reply_name(head[1])
        )));
    }

    // Consume the bound address, whose length depends on the type byte…
    let addr_len = match head[3] {
        ATYP_V4 => 4_usize,
        ATYP_V6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0_u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| FetchError::unreachable("socks connect reply", e))?;
            len[0] as usize
        }
        other => {
            return Err(FetchError::handshake(format!(
                "reply had unknown address type {other:#04x}"
            )));
        }
    };
    let mut rest = vec![0_u8; addr_len + 2]; // …plus the two-byte port, always.
    stream
        .read_exact(&mut rest)
        .await
        .map_err(|e| FetchError::unreachable("socks connect reply", e))?;

    Ok(())
}

/// Human-readable name for a SOCKS5 reply code.
fn reply_name(rep: u8) -> &'static str {
    match rep {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

/// Return true for name suffixes that only an anonymizing network can
/// resolve.
fn is_anonymous_suffix(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    host.ends_with(".onion") || host.ends_with(".loki") || host.ends_with(".i2p")
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    /// A bidirectional fake: reads come from `input`, writes land in
    /// `written`.
    struct Fake {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Fake {
        fn new(input: Vec<u8>) -> Self {
            Fake {
                input: Cursor::new(input),
                written: Vec::new(),
            }
        }
    }

    impl AsyncRead for Fake {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut [u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::pin::Pin::new(&mut self.input).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Fake {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.written.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn proxy(s: &str) -> ProxyUrl {
        s.parse().unwrap()
    }

    #[test]
    fn connect_domain_via_socks5h() {
        // method reply + success reply with an IPv4 bound address.
        let input = vec![0x05, 0x00, 0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x1f, 0x90];
        let mut fake = Fake::new(input);
        let target = ConnectTarget {
            host: "abcdefgh.onion".into(),
            port: 80,
        };
        block_on(connect_through(
            &mut fake,
            &proxy("socks5h://127.0.0.1:9050"),
            &target,
        ))
        .unwrap();

        // greeting
        assert_eq!(&fake.written[..3], &[0x05, 0x01, 0x00]);
        // connect: VER CMD RSV ATYP LEN host PORT
        let conn = &fake.written[3..];
        assert_eq!(&conn[..4], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(conn[4] as usize, "abcdefgh.onion".len());
        assert_eq!(&conn[5..5 + 14], b"abcdefgh.onion");
        assert_eq!(&conn[19..], &[0x00, 80]);
    }

    #[test]
    fn reply_with_domain_bound_addr() {
        // Success reply using a domain-typed bound address: the parser
        // must read the length byte, the name, and then the port.
        let mut input = vec![0x05, 0x00];
        input.extend_from_slice(&[0x05, 0x00, 0x00, 0x03, 4]);
        input.extend_from_slice(b"home");
        input.extend_from_slice(&[0x01, 0xbb]);
        let mut fake = Fake::new(input);
        let target = ConnectTarget {
            host: "1.2.3.4".into(),
            port: 443,
        };
        block_on(connect_through(
            &mut fake,
            &proxy("socks5://127.0.0.1:9050"),
            &target,
        ))
        .unwrap();
    }

    #[test]
    fn negative_reply_is_handshake_failure() {
        let input = vec![0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        let mut fake = Fake::new(input);
        let target = ConnectTarget {
            host: "1.2.3.4".into(),
            port: 80,
        };
        let err = block_on(connect_through(
            &mut fake,
            &proxy("socks5://127.0.0.1:9050"),
            &target,
        ))
        .unwrap_err();
        assert_eq!(err.code(), "handshake_failed");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn auth_subnegotiation() {
        let input = vec![
            0x05, 0x02, // choose userpass
            0x01, 0x00, // auth ok
            0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, // success
        ];
        let mut fake = Fake::new(input);
        let target = ConnectTarget {
            host: "1.2.3.4".into(),
            port: 80,
        };
        block_on(connect_through(
            &mut fake,
            &proxy("socks5://u:p@127.0.0.1:9050"),
            &target,
        ))
        .unwrap();
        // greeting advertises userpass
        assert_eq!(&fake.written[..3], &[0x05, 0x01, 0x02]);
        // RFC1929: version, ulen, 'u', plen, 'p'
        assert_eq!(&fake.written[3..8], &[0x01, 0x01, b'u', 0x01, b'p']);
    }

    #[test]
    fn auth_rejection() {
        let input = vec![0x05, 0x02, 0x01, 0x01];
        let mut fake = Fake::new(input);
        let target = ConnectTarget {
            host: "1.2.3.4".into(),
            port: 80,
        };
        let err = block_on(connect_through(
            &mut fake,
            &proxy("socks5://u:p@127.0.0.1:9050"),
            &target,
        ))
        .unwrap_err();
        assert_eq!(err.code(), "handshake_failed");
    }

    #[test]
    fn onion_requires_socks5h() {
        let mut fake = Fake::new(vec![0x05, 0x00]);
        let target = ConnectTarget {
            host: "abcdefgh.onion".into(),
            port: 80,
        };
        let err = block_on(connect_through(
            &mut fake,
            &proxy("socks5://127.0.0.1:9050"),
            &target,
        ))
        .unwrap_err();
        assert_eq!(err.code(), "handshake_failed");
        assert!(err.to_string().contains("socks5h"));
    }
}
