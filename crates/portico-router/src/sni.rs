//! Just enough TLS to read the server name out of a ClientHello.
//!
//! The bytes are read off the socket, not peeked, and handed back to the
//! caller so they can be replayed to whichever upstream wins the routing
//! decision. Nothing past the ClientHello is consumed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::RouterError;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const EXTENSION_SERVER_NAME: u16 = 0;
const NAME_TYPE_HOST_NAME: u8 = 0;
/// Largest TLS plaintext record (2^14) plus slack for legacy stacks.
const MAX_RECORD_LEN: usize = 16384 + 2048;
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SniError {
    #[error("not a TLS handshake")]
    NotTls,

    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("ClientHello exceeds {0} bytes")]
    TooLarge(usize),
}

/// Outcome of parsing a buffer that may hold a partial ClientHello.
#[derive(Debug, PartialEq, Eq)]
pub enum Parse {
    Incomplete,
    /// Complete ClientHello; `None` when the client sent no server name.
    Complete(Option<String>),
}

/// A ClientHello read from a client, with the raw bytes consumed so far.
#[derive(Debug)]
pub struct ClientHello {
    pub server_name: Option<String>,
    pub buffered: Vec<u8>,
}

/// Read from `stream` until a full ClientHello is buffered.
///
/// Bounded by `timeout` in total and by `max_bytes` of input.
pub async fn read_client_hello<S>(
    stream: &mut S,
    timeout: Duration,
    max_bytes: usize,
) -> Result<ClientHello, RouterError>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_until_complete(stream, max_bytes))
        .await
        .map_err(|_| RouterError::SniTimeout(timeout))?
}

async fn read_until_complete<S>(stream: &mut S, max_bytes: usize) -> Result<ClientHello, RouterError>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Parse::Complete(server_name) = parse_client_hello(&buffered, max_bytes)? {
            return Ok(ClientHello {
                server_name,
                buffered,
            });
        }
        let room = max_bytes.saturating_sub(buffered.len());
        if room == 0 {
            return Err(SniError::TooLarge(max_bytes).into());
        }
        let n = stream.read(&mut chunk[..room.min(READ_CHUNK)]).await?;
        if n == 0 {
            return Err(RouterError::ClosedEarly);
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

/// Parse as much of `buf` as is present.
///
/// Handles a ClientHello split across several handshake records.
pub fn parse_client_hello(buf: &[u8], max_bytes: usize) -> Result<Parse, SniError> {
    let mut handshake = Vec::new();
    let mut offset = 0;

    loop {
        let Some(header) = buf.get(offset..offset + RECORD_HEADER_LEN) else {
            if offset == 0 && !buf.is_empty() && buf[0] != CONTENT_TYPE_HANDSHAKE {
                return Err(SniError::NotTls);
            }
            return Ok(Parse::Incomplete);
        };
        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(if offset == 0 {
                SniError::NotTls
            } else {
                SniError::Malformed("unexpected record type")
            });
        }
        if header[1] != 3 {
            return Err(SniError::NotTls);
        }
        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(SniError::Malformed("bad record length"));
        }
        let body_start = offset + RECORD_HEADER_LEN;
        let Some(body) = buf.get(body_start..body_start + record_len) else {
            // Partial record: keep what is here to learn the message length.
            handshake.extend_from_slice(&buf[body_start.min(buf.len())..]);
            return check_partial(&handshake, max_bytes);
        };
        handshake.extend_from_slice(body);
        offset = body_start + record_len;

        if handshake.len() >= 4 {
            if handshake[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(SniError::Malformed("first handshake message is not ClientHello"));
            }
            let msg_len = u24(&handshake[1..4]);
            if msg_len + 4 > max_bytes {
                return Err(SniError::TooLarge(max_bytes));
            }
            if handshake.len() >= msg_len + 4 {
                return server_name(&handshake[4..4 + msg_len]).map(Parse::Complete);
            }
        }
    }
}

fn check_partial(handshake: &[u8], max_bytes: usize) -> Result<Parse, SniError> {
    if handshake.len() >= 4 {
        if handshake[0] != HANDSHAKE_CLIENT_HELLO {
            return Err(SniError::Malformed("first handshake message is not ClientHello"));
        }
        if u24(&handshake[1..4]) + 4 > max_bytes {
            return Err(SniError::TooLarge(max_bytes));
        }
    }
    Ok(Parse::Incomplete)
}

fn u24(b: &[u8]) -> usize {
    ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SniError> {
        let end = self.pos.checked_add(n).ok_or(SniError::Malformed(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(SniError::Malformed(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// A vector with a one- or two-byte length prefix.
    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

/// Walk a ClientHello body to its server_name extension.
fn server_name(body: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(body);
    r.take(2, "client version")?;
    r.take(32, "random")?;
    r.vec8("session id")?;
    r.vec16("cipher suites")?;
    r.vec8("compression methods")?;
    if r.is_empty() {
        // Pre-extension hello.
        return Ok(None);
    }

    let mut extensions = Reader::new(r.vec16("extensions")?);
    while !extensions.is_empty() {
        let kind = extensions.u16("extension type")?;
        let data = extensions.vec16("extension body")?;
        if kind != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut list = Reader::new(Reader::new(data).vec16("server name list")?);
        while !list.is_empty() {
            let name_type = list.u8("server name type")?;
            let name = list.vec16("server name")?;
            if name_type == NAME_TYPE_HOST_NAME {
                return normalize_host(name).map(Some);
            }
        }
        return Ok(None);
    }
    Ok(None)
}

fn normalize_host(raw: &[u8]) -> Result<String, SniError> {
    let valid = !raw.is_empty()
        && raw
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'));
    if !valid {
        return Err(SniError::Malformed("server name is not a host name"));
    }
    let host = String::from_utf8_lossy(raw).to_ascii_lowercase();
    Ok(host.trim_end_matches('.').to_string())
}

/// Hand-built ClientHello records for tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    /// A minimal ClientHello in a single record, optionally with SNI.
    pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]);
        body.extend_from_slice(&[7u8; 32]);
        body.push(0); // session id
        body.extend_from_slice(&[0, 2, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[1, 0]); // null compression

        let mut extensions = Vec::new();
        // supported_versions, to have an extension before SNI
        extensions.extend_from_slice(&[0x00, 0x2b, 0, 3, 2, 3, 4]);
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let list_len = name.len() + 3;
            extensions.extend_from_slice(&[0, 0]);
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![1];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![22, 3, 1];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::testing::client_hello;
    use super::*;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    const BUDGET: usize = 16 * 1024;

    #[test]
    fn extracts_server_name() {
        let hello = client_hello(Some("MyBox.Local."));
        assert_eq!(
            parse_client_hello(&hello, BUDGET),
            Ok(Parse::Complete(Some("mybox.local".to_string())))
        );
    }

    #[test]
    fn hello_without_sni_is_complete_with_no_name() {
        let hello = client_hello(None);
        assert_eq!(parse_client_hello(&hello, BUDGET), Ok(Parse::Complete(None)));
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let hello = client_hello(Some("mybox.local"));
        for len in 0..hello.len() {
            assert_eq!(
                parse_client_hello(&hello[..len], BUDGET),
                Ok(Parse::Incomplete),
                "prefix of {len} bytes"
            );
        }
    }

    #[test]
    fn hello_split_across_records_is_reassembled() {
        let single = client_hello(Some("split.local"));
        let handshake = &single[RECORD_HEADER_LEN..];
        let (a, b) = handshake.split_at(20);
        let mut split = Vec::new();
        for part in [a, b] {
            split.extend_from_slice(&[22, 3, 1]);
            split.extend_from_slice(&(part.len() as u16).to_be_bytes());
            split.extend_from_slice(part);
        }
        assert_eq!(
            parse_client_hello(&split, BUDGET),
            Ok(Parse::Complete(Some("split.local".to_string())))
        );
    }

    #[test]
    fn plaintext_http_is_not_tls() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\n", BUDGET),
            Err(SniError::NotTls)
        );
        assert_eq!(parse_client_hello(b"G", BUDGET), Err(SniError::NotTls));
    }

    #[test]
    fn declared_length_over_budget_is_rejected_early() {
        let hello = client_hello(Some("mybox.local"));
        // Only the headers are needed to learn the declared size.
        assert_eq!(
            parse_client_hello(&hello[..12], 64),
            Err(SniError::TooLarge(64))
        );
    }

    #[test]
    fn truncated_extension_is_malformed() {
        let mut hello = client_hello(Some("mybox.local"));
        // Corrupt the server name length so it overruns the extension.
        let n = hello.len();
        hello[n - 12] = 0xff;
        assert!(matches!(
            parse_client_hello(&hello, BUDGET),
            Err(SniError::Malformed(_))
        ));
    }

    #[test]
    fn rustls_client_hello_is_understood() {
        use rustls::pki_types::ServerName;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let name = ServerName::try_from("devbox.local").unwrap().to_owned();
        let mut conn = rustls::ClientConnection::new(Arc::new(config), name).unwrap();
        let mut wire = Vec::new();
        conn.write_tls(&mut wire).unwrap();

        assert_eq!(
            parse_client_hello(&wire, BUDGET),
            Ok(Parse::Complete(Some("devbox.local".to_string())))
        );
    }

    #[tokio::test]
    async fn read_keeps_every_consumed_byte() {
        let hello = client_hello(Some("mybox.local"));
        let (mut client, mut server) = tokio::io::duplex(64);
        let sent = hello.clone();
        tokio::spawn(async move {
            for chunk in sent.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
            client.write_all(b"app data").await.unwrap();
            // Keep the pipe open until the reader is done.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let read = read_client_hello(&mut server, Duration::from_secs(2), BUDGET)
            .await
            .unwrap();
        assert_eq!(read.server_name.as_deref(), Some("mybox.local"));
        assert!(read.buffered.starts_with(&hello));
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_client_hello(&mut server, Duration::from_millis(50), BUDGET)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::SniTimeout(_)));
    }

    #[tokio::test]
    async fn early_close_is_reported() {
        let hello = client_hello(Some("mybox.local"));
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&hello[..10]).await.unwrap();
        drop(client);
        let err = read_client_hello(&mut server, Duration::from_secs(1), BUDGET)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ClosedEarly));
    }
}
