//! Routing-key extraction from the first bytes of a connection.
//!
//! TLS ports are keyed by the SNI host name in the ClientHello, plain HTTP
//! ports by the `Host` header of the first request. Bytes read while
//! sniffing are kept and replayed through [`PrefixedStream`], so whoever
//! consumes the connection next sees exactly the bytes the client sent.

use std::{io, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::TcpStream,
    time::timeout,
};

use crate::backend::normalize_host;
use crate::stream::PrefixedStream;

/// Deadline for a client to deliver its handshake or request head.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on bytes buffered while sniffing: one maximum-size TLS
/// record plus its header. A ClientHello spread over several records must
/// fit in this budget as a whole.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = TLS_RECORD_HEADER_LEN + TLS_MAX_RECORD_LEN;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const TLS_RECORD_HEADER_LEN: usize = 5;
const TLS_HANDSHAKE_HEADER_LEN: usize = 4;
const TLS_CLIENT_HELLO: u8 = 0x01;
const TLS_EXT_SERVER_NAME: u16 = 0x0000;
const TLS_SNI_HOST_NAME: u8 = 0x00;
// TLSPlaintext.length must not exceed 2^14 (RFC 8446, 5.1).
const TLS_MAX_RECORD_LEN: usize = 1 << 14;
const HTTP_MAX_HEADERS: usize = 96;

/// Which framing a listener expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http,
}

impl Protocol {
    #[must_use]
    pub const fn from_https(https: bool) -> Self {
        if https { Self::Tls } else { Self::Http }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffLimits {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for SniffLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// A sniffed connection together with its routing key.
///
/// `routing_key` is `None` when the prefix parsed cleanly but carried no
/// host name (no SNI extension, no `Host` header).
#[derive(Debug)]
pub struct SniffResult<S = TcpStream> {
    pub stream: PrefixedStream<S>,
    pub routing_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("no complete prefix within {0:?}")]
    Timeout(Duration),
    #[error("connection closed during sniffing")]
    Eof,
    #[error("not a TLS ClientHello")]
    NotTls,
    #[error("malformed TLS ClientHello")]
    MalformedHello,
    #[error("malformed HTTP request head: {0}")]
    MalformedHttp(httparse::Error),
    #[error("prefix exceeds {0} bytes")]
    TooLarge(usize),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Incomplete,
    Complete(Option<String>),
}

/// Reads the handshake or request prefix of `stream` and extracts its routing key.
///
/// The whole read is bounded by `limits.timeout`; a client that trickles a
/// partial prefix past the deadline gets [`SniffError::Timeout`].
pub async fn sniff<S: AsyncRead + Unpin>(
    mut stream: S,
    protocol: Protocol,
    limits: SniffLimits,
) -> Result<SniffResult<S>, SniffError> {
    let mut prefix = Vec::with_capacity(limits.max_bytes.min(2048));
    let routing_key = timeout(
        limits.timeout,
        read_prefix(&mut stream, &mut prefix, protocol, limits.max_bytes),
    )
    .await
    .map_err(|_| SniffError::Timeout(limits.timeout))??;

    Ok(SniffResult {
        stream: PrefixedStream::new(prefix, stream),
        routing_key: routing_key
            .map(|key| normalize_host(&key))
            .filter(|key| !key.is_empty()),
    })
}

async fn read_prefix<S: AsyncRead + Unpin>(
    stream: &mut S,
    prefix: &mut Vec<u8>,
    protocol: Protocol,
    max_bytes: usize,
) -> Result<Option<String>, SniffError> {
    let mut chunk = [0u8; 2048];
    loop {
        let room = max_bytes.saturating_sub(prefix.len());
        if room == 0 {
            return Err(SniffError::TooLarge(max_bytes));
        }

        let len = room.min(chunk.len());
        let n = stream.read(&mut chunk[..len]).await?;
        if n == 0 {
            return Err(SniffError::Eof);
        }
        prefix.extend_from_slice(&chunk[..n]);

        let parsed = match protocol {
            Protocol::Tls => parse_client_hello(prefix)?,
            Protocol::Http => parse_http_host(prefix)?,
        };
        if let Parsed::Complete(key) = parsed {
            return Ok(key);
        }
    }
}

/// Big-endian cursor over a byte slice. Every accessor returns `None` when
/// the slice is too short.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()?;
        self.take(usize::from(len))
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }
}

/// Reassembles the first handshake message from one or more records.
fn parse_client_hello(data: &[u8]) -> Result<Parsed, SniffError> {
    let mut rest = data;
    let mut handshake = Vec::new();

    loop {
        let Some(&content_type) = rest.first() else {
            return Ok(Parsed::Incomplete);
        };
        if content_type != TLS_HANDSHAKE_RECORD {
            return Err(if handshake.is_empty() {
                SniffError::NotTls
            } else {
                SniffError::MalformedHello
            });
        }
        if rest.len() >= 2 && rest[1] != 0x03 {
            return Err(SniffError::NotTls);
        }
        if rest.len() < TLS_RECORD_HEADER_LEN {
            return Ok(Parsed::Incomplete);
        }

        let record_len = usize::from(u16::from_be_bytes([rest[3], rest[4]]));
        if record_len == 0 || record_len > TLS_MAX_RECORD_LEN {
            return Err(SniffError::MalformedHello);
        }
        let end = TLS_RECORD_HEADER_LEN + record_len;
        let Some(fragment) = rest.get(TLS_RECORD_HEADER_LEN..end) else {
            return Ok(Parsed::Incomplete);
        };
        handshake.extend_from_slice(fragment);
        rest = &rest[end..];

        if handshake[0] != TLS_CLIENT_HELLO {
            return Err(SniffError::NotTls);
        }
        if handshake.len() < TLS_HANDSHAKE_HEADER_LEN {
            continue;
        }
        let hello_len = (usize::from(handshake[1]) << 16)
            | (usize::from(handshake[2]) << 8)
            | usize::from(handshake[3]);
        let total = TLS_HANDSHAKE_HEADER_LEN + hello_len;
        if handshake.len() < total {
            continue;
        }
        return server_name(&handshake[..total])
            .map(Parsed::Complete)
            .ok_or(SniffError::MalformedHello);
    }
}

/// Walks a complete ClientHello handshake message. Outer `None` means malformed.
fn server_name(message: &[u8]) -> Option<Option<String>> {
    let mut handshake = Reader::new(message);
    handshake.u8()?;
    let len = handshake.u24()?;
    let mut hello = Reader::new(handshake.take(len)?);

    hello.take(2 + 32)?; // legacy_version, random
    hello.vec8()?; // legacy_session_id
    hello.vec16()?; // cipher_suites
    hello.vec8()?; // legacy_compression_methods
    if hello.is_empty() {
        return Some(None);
    }

    let mut extensions = Reader::new(hello.vec16()?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let body = extensions.vec16()?;
        if ext_type == TLS_EXT_SERVER_NAME {
            return server_name_extension(body);
        }
    }
    Some(None)
}

fn server_name_extension(body: &[u8]) -> Option<Option<String>> {
    let mut ext = Reader::new(body);
    let mut names = Reader::new(ext.vec16()?);
    while !names.is_empty() {
        let name_type = names.u8()?;
        let name = names.vec16()?;
        if name_type == TLS_SNI_HOST_NAME {
            return std::str::from_utf8(name).ok().map(|s| Some(s.to_owned()));
        }
    }
    Some(None)
}

fn parse_http_host(data: &[u8]) -> Result<Parsed, SniffError> {
    let mut headers = [httparse::EMPTY_HEADER; HTTP_MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(data) {
        Ok(httparse::Status::Partial) => Ok(Parsed::Incomplete),
        Ok(httparse::Status::Complete(_)) => {
            let host = request
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(strip_port);
            Ok(Parsed::Complete(host.map(str::to_owned)))
        }
        Err(e) => Err(SniffError::MalformedHttp(e)),
    }
}

fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio_rustls::rustls::{self, pki_types::ServerName};

    /// First flight of a real rustls client connecting to `server_name`.
    pub(crate) fn client_hello(server_name: &str) -> Vec<u8> {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let name = ServerName::try_from(server_name.to_string()).unwrap();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut out = Vec::new();
        conn.write_tls(&mut out).unwrap();
        out
    }

    /// Minimal TLS 1.2 ClientHello that carries no extensions at all.
    fn bare_client_hello() -> Vec<u8> {
        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]);

        let mut record = vec![TLS_CLIENT_HELLO, 0, 0, body.len() as u8];
        record.extend_from_slice(&body);

        let mut out = vec![TLS_HANDSHAKE_RECORD, 0x03, 0x01, 0, record.len() as u8];
        out.extend_from_slice(&record);
        out
    }

    /// ClientHello handshake message carrying `server_name` and a padding
    /// extension of `padding` bytes.
    fn hello_handshake(server_name: &str, padding: usize) -> Vec<u8> {
        let name = server_name.as_bytes();
        let mut extensions = vec![0x00, 0x15];
        extensions.extend_from_slice(&(padding as u16).to_be_bytes());
        extensions.resize(extensions.len() + padding, 0);
        extensions.extend_from_slice(&[0x00, 0x00]);
        extensions.extend_from_slice(&((name.len() + 5) as u16).to_be_bytes());
        extensions.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        extensions.push(TLS_SNI_HOST_NAME);
        extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
        extensions.extend_from_slice(name);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f, 0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let len = body.len().to_be_bytes();
        let mut handshake = vec![TLS_CLIENT_HELLO];
        handshake.extend_from_slice(&len[len.len() - 3..]);
        handshake.extend_from_slice(&body);
        handshake
    }

    /// Wraps `handshake` in handshake records of at most `fragment` bytes each.
    fn into_records(handshake: &[u8], fragment: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in handshake.chunks(fragment) {
            out.extend_from_slice(&[TLS_HANDSHAKE_RECORD, 0x03, 0x01]);
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }

    fn limits(timeout: Duration) -> SniffLimits {
        SniffLimits {
            timeout,
            ..SniffLimits::default()
        }
    }

    mod hello_parsing {
        use super::*;

        #[test]
        fn extracts_sni_from_rustls_hello() {
            let hello = client_hello("a.example.com");
            assert_eq!(
                parse_client_hello(&hello).unwrap(),
                Parsed::Complete(Some("a.example.com".into()))
            );
        }

        #[test]
        fn ip_address_hello_has_no_sni() {
            let hello = client_hello("127.0.0.1");
            assert_eq!(parse_client_hello(&hello).unwrap(), Parsed::Complete(None));
        }

        #[test]
        fn hello_without_extensions_has_no_sni() {
            assert_eq!(
                parse_client_hello(&bare_client_hello()).unwrap(),
                Parsed::Complete(None)
            );
        }

        #[test]
        fn partial_record_is_incomplete() {
            let hello = client_hello("a.example.com");
            for cut in [1, 4, 5, 40, hello.len() - 1] {
                assert_eq!(parse_client_hello(&hello[..cut]).unwrap(), Parsed::Incomplete);
            }
        }

        #[test]
        fn rejects_plain_http() {
            let err = parse_client_hello(b"GET / HTTP/1.1\r\n").unwrap_err();
            assert!(matches!(err, SniffError::NotTls));
        }

        #[test]
        fn rejects_inconsistent_lengths() {
            let mut hello = bare_client_hello();
            // Handshake length too short for the fixed ClientHello fields.
            hello[8] -= 10;
            let err = parse_client_hello(&hello).unwrap_err();
            assert!(matches!(err, SniffError::MalformedHello));
        }

        #[test]
        fn reassembles_hello_split_across_records() {
            let handshake = hello_handshake("split.example.com", 300);
            let hello = into_records(&handshake, 100);
            assert!(hello.len() > handshake.len() + TLS_RECORD_HEADER_LEN);

            assert_eq!(
                parse_client_hello(&hello).unwrap(),
                Parsed::Complete(Some("split.example.com".into()))
            );
            let last_record = hello.len() - (handshake.len() % 100) - TLS_RECORD_HEADER_LEN;
            assert_eq!(parse_client_hello(&hello[..last_record]).unwrap(), Parsed::Incomplete);
        }

        #[test]
        fn rejects_non_handshake_record_mid_hello() {
            let handshake = hello_handshake("a.example.com", 0);
            let mut hello = into_records(&handshake[..20], 20);
            hello.extend_from_slice(&[0x17, 0x03, 0x03, 0x00, 0x01, 0x00]);
            let err = parse_client_hello(&hello).unwrap_err();
            assert!(matches!(err, SniffError::MalformedHello));
        }

        #[test]
        fn rejects_oversized_record() {
            let err = parse_client_hello(&[0x16, 0x03, 0x01, 0xff, 0xff]).unwrap_err();
            assert!(matches!(err, SniffError::MalformedHello));
        }
    }

    mod http_host {
        use super::*;

        #[test]
        fn extracts_host_without_port() {
            let head = b"GET / HTTP/1.1\r\nHost: b.example.com:8080\r\nAccept: */*\r\n\r\n";
            assert_eq!(
                parse_http_host(head).unwrap(),
                Parsed::Complete(Some("b.example.com".into()))
            );
        }

        #[test]
        fn header_name_is_case_insensitive() {
            let head = b"GET / HTTP/1.1\r\nhOsT: b.example.com\r\n\r\n";
            assert_eq!(
                parse_http_host(head).unwrap(),
                Parsed::Complete(Some("b.example.com".into()))
            );
        }

        #[test]
        fn missing_host_is_complete_without_key() {
            let head = b"GET / HTTP/1.0\r\n\r\n";
            assert_eq!(parse_http_host(head).unwrap(), Parsed::Complete(None));
        }

        #[test]
        fn unterminated_head_is_incomplete() {
            let head = b"GET / HTTP/1.1\r\nHost: b.example.com\r\n";
            assert_eq!(parse_http_host(head).unwrap(), Parsed::Incomplete);
        }

        #[test]
        fn rejects_binary_garbage() {
            let err = parse_http_host(&client_hello("a.example.com")).unwrap_err();
            assert!(matches!(err, SniffError::MalformedHttp(_)));
        }

        #[test]
        fn strips_ports_from_ipv6_literals() {
            assert_eq!(strip_port("[::1]:8080"), "[::1]");
            assert_eq!(strip_port("[::1]"), "[::1]");
            assert_eq!(strip_port("example.com"), "example.com");
        }
    }

    mod sniffing {
        use super::*;

        #[tokio::test]
        async fn fragmented_hello_is_replayed_verbatim() {
            let hello = client_hello("A.Example.COM");
            let mock = tokio_test::io::Builder::new()
                .read(&hello[..3])
                .read(&hello[3..40])
                .read(&hello[40..])
                .build();

            let mut result = sniff(mock, Protocol::Tls, SniffLimits::default())
                .await
                .unwrap();
            assert_eq!(result.routing_key.as_deref(), Some("a.example.com"));

            let mut replayed = Vec::new();
            result.stream.read_to_end(&mut replayed).await.unwrap();
            assert_eq!(replayed, hello);
        }

        #[tokio::test]
        async fn bytes_after_the_prefix_stay_in_order() {
            let head = b"GET / HTTP/1.1\r\nHost: b.example.com\r\n\r\n";
            let mock = tokio_test::io::Builder::new()
                .read(head)
                .read(b"body")
                .build();

            let mut result = sniff(mock, Protocol::Http, SniffLimits::default())
                .await
                .unwrap();
            assert_eq!(result.routing_key.as_deref(), Some("b.example.com"));

            let mut replayed = Vec::new();
            result.stream.read_to_end(&mut replayed).await.unwrap();
            assert_eq!(replayed, [&head[..], b"body"].concat());
        }

        #[tokio::test(start_paused = true)]
        async fn stalled_client_times_out() {
            let hello = client_hello("a.example.com");
            let mock = tokio_test::io::Builder::new()
                .read(&hello[..10])
                .wait(Duration::from_secs(60))
                .build();

            let err = sniff(mock, Protocol::Tls, limits(Duration::from_secs(10)))
                .await
                .unwrap_err();
            assert!(matches!(err, SniffError::Timeout(_)));
        }

        #[tokio::test]
        async fn hello_larger_than_one_buffer_fits_default_limits() {
            let handshake = hello_handshake("big.example.com", 12_000);
            let hello = into_records(&handshake, TLS_MAX_RECORD_LEN);
            assert!(hello.len() > 8192);
            let mock = tokio_test::io::Builder::new().read(&hello).build();

            let mut result = sniff(mock, Protocol::Tls, SniffLimits::default())
                .await
                .unwrap();
            assert_eq!(result.routing_key.as_deref(), Some("big.example.com"));

            let mut replayed = Vec::new();
            result.stream.read_to_end(&mut replayed).await.unwrap();
            assert_eq!(replayed, hello);
        }

        #[tokio::test]
        async fn early_close_is_reported() {
            let mock = tokio_test::io::Builder::new().read(b"GET / HT").build();
            let err = sniff(mock, Protocol::Http, SniffLimits::default())
                .await
                .unwrap_err();
            assert!(matches!(err, SniffError::Eof));
        }

        #[tokio::test]
        async fn oversized_head_is_rejected() {
            let mut head = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
            head.resize(32, b'a');
            let mock = tokio_test::io::Builder::new().read(&head).build();

            let err = sniff(
                mock,
                Protocol::Http,
                SniffLimits {
                    timeout: DEFAULT_SNIFF_TIMEOUT,
                    max_bytes: 32,
                },
            )
            .await
            .unwrap_err();
            assert!(matches!(err, SniffError::TooLarge(32)));
        }
    }
}
