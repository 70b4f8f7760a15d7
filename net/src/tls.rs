//! TLS byte-wrapping hook for connections (feature `tls`).
//!
//! The runtime does not manage certificates or trust; callers pass pre-built
//! rustls configs and every callback on a TLS connection sees plaintext.
//! The session sits between the socket and the connection buffers: wire
//! bytes in, plaintext out on the read path; plaintext in, wire bytes onto
//! the send queue on the write path.

use std::io::{self, Read, Write};
use std::sync::{Arc, Once};

use rustls::pki_types::ServerName;

/// Pre-built TLS configuration attached to a connection via
/// [`crate::SocketOptions::tls_context`].
///
/// The config is shared read-only across every connection using it; the
/// caller loads certificates, keys, ALPN, and roots.
#[derive(Clone)]
pub enum TlsContext {
    Server(Arc<rustls::ServerConfig>),
    Client {
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
}

/// The TLS library's process-wide setup happens once, lazily, the first time
/// any context is turned into a session.
fn install_provider_once() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

pub(crate) struct TlsSession {
    conn: rustls::Connection,
}

impl TlsSession {
    pub(crate) fn new(ctx: &TlsContext) -> Result<TlsSession, rustls::Error> {
        install_provider_once();
        let conn = match ctx {
            TlsContext::Server(config) => {
                rustls::Connection::Server(rustls::ServerConnection::new(Arc::clone(config))?)
            }
            TlsContext::Client {
                config,
                server_name,
            } => rustls::Connection::Client(rustls::ClientConnection::new(
                Arc::clone(config),
                server_name.clone(),
            )?),
        };
        Ok(TlsSession { conn })
    }

    /// Feed wire bytes from the socket; decrypted plaintext is appended to
    /// `plaintext`. Handshake progress may queue wire output (see
    /// [`TlsSession::take_wire_output`]).
    pub(crate) fn read_wire(&mut self, mut wire: &[u8], plaintext: &mut Vec<u8>) -> io::Result<()> {
        while !wire.is_empty() {
            let n = self.conn.read_tls(&mut wire)?;
            if n == 0 {
                break;
            }
            let state = self
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let to_read = state.plaintext_bytes_to_read();
            if to_read > 0 {
                let start = plaintext.len();
                plaintext.resize(start + to_read, 0);
                self.conn.reader().read_exact(&mut plaintext[start..])?;
            }
            if state.peer_has_closed() {
                break;
            }
        }
        Ok(())
    }

    /// Encrypt plaintext into the session's outgoing record buffer.
    pub(crate) fn write_plaintext(&mut self, data: &[u8]) -> io::Result<()> {
        self.conn.writer().write_all(data)
    }

    /// Drain pending wire output (handshake records, encrypted data) into
    /// `out` for the send queue.
    pub(crate) fn take_wire_output(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        while self.conn.wants_write() {
            self.conn.write_tls(out)?;
        }
        Ok(())
    }

    pub(crate) fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
