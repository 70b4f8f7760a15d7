//! Per-session relay wiring: one backend connection per client, with client
//! bytes cached until the backend is up.
//!
//! The session state lives in the client connection's user-data slot. The
//! client side owns the strong backend reference; the backend's callbacks
//! hold only a weak client reference, so the reference cycle breaks at
//! whichever disconnect happens first.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use braid::{
    AsyncConnector, ConnectOptions, SocketOptions, TcpConnection, TcpService, TcpSocket, UserData,
};
use tracing::{debug, warn};

/// Shared relay endpoints and knobs, one per proxy instance.
pub(crate) struct RelayTarget {
    pub service: Arc<TcpService>,
    pub connector: Arc<AsyncConnector>,
    pub backend_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub max_recv_buffer_size: usize,
}

/// Bridges "client bytes arrived before the backend finished connecting".
struct RelaySession {
    inner: Mutex<SessionState>,
}

struct SessionState {
    backend: Option<Arc<TcpConnection>>,
    pending: Vec<Vec<u8>>,
    client_closed: bool,
}

/// Listener callback: hand the accepted client socket to the service.
pub(crate) fn accept_client(target: &Arc<RelayTarget>, socket: TcpSocket) {
    let enter_target = Arc::clone(target);
    let opts = SocketOptions::new()
        .max_recv_buffer_size(target.max_recv_buffer_size)
        .disable_nagle(true)
        .on_enter(move |client| on_client_enter(&enter_target, client));
    if let Err(e) = target.service.add_tcp_connection(socket, opts) {
        warn!(error = %e, "failed to add client connection");
    }
}

fn on_client_enter(target: &Arc<RelayTarget>, client: &Arc<TcpConnection>) {
    debug!(peer = ?client.peer_addr(), "client connected");

    let session = Arc::new(RelaySession {
        inner: Mutex::new(SessionState {
            backend: None,
            pending: Vec::new(),
            client_closed: false,
        }),
    });
    client.set_user_data(UserData::Shared(
        Arc::clone(&session) as Arc<dyn Any + Send + Sync>
    ));

    // Client bytes go to the backend once it exists; until then they are
    // cached in the session.
    let data_session = Arc::clone(&session);
    client.set_data_callback(move |data| {
        let mut state = data_session.inner.lock().unwrap();
        match &state.backend {
            Some(backend) => {
                backend.send(data);
            }
            None => state.pending.push(data.to_vec()),
        }
        data.len()
    });

    // Client close brings the backend down with it.
    let close_session = Arc::clone(&session);
    client.set_disconnect_callback(move |_conn, reason| {
        debug!(reason = ?reason, "client disconnected");
        let mut state = close_session.inner.lock().unwrap();
        state.client_closed = true;
        if let Some(backend) = state.backend.take() {
            backend.post_disconnect();
        }
    });

    // Matching backend connection for this client.
    let client_weak = Arc::downgrade(client);
    let success_target = Arc::clone(target);
    let success_session = Arc::clone(&session);
    let success_client = client_weak.clone();
    let result = target.connector.connect(ConnectOptions::new(
        target.backend_addr,
        target.connect_timeout,
        move |socket| on_backend_connected(&success_target, socket, success_session, success_client),
        move |err| {
            warn!(error = %err, "backend connect failed");
            if let Some(client) = client_weak.upgrade() {
                client.post_disconnect();
            }
        },
    ));
    if result.is_err() {
        client.post_disconnect();
    }
}

fn on_backend_connected(
    target: &Arc<RelayTarget>,
    socket: TcpSocket,
    session: Arc<RelaySession>,
    client: Weak<TcpConnection>,
) {
    // The client may already be gone; dropping the socket closes it.
    if session.inner.lock().unwrap().client_closed {
        debug!("client closed before backend connect completed");
        return;
    }

    let enter_session = Arc::clone(&session);
    let err_client = client.clone();
    let opts = SocketOptions::new().disable_nagle(true).on_enter(move |backend| {
        let mut state = enter_session.inner.lock().unwrap();
        if state.client_closed {
            drop(state);
            backend.post_disconnect();
            return;
        }

        // Backend bytes relay straight to the client.
        let up_client = client.clone();
        backend.set_data_callback(move |data| {
            if let Some(client) = up_client.upgrade() {
                client.send(data);
            }
            data.len()
        });

        // Backend close brings the client down, unless the client already
        // went first.
        let down_session = Arc::clone(&enter_session);
        let down_client = client.clone();
        backend.set_disconnect_callback(move |_conn, reason| {
            debug!(reason = ?reason, "backend disconnected");
            let mut state = down_session.inner.lock().unwrap();
            state.backend = None;
            if !state.client_closed {
                if let Some(client) = down_client.upgrade() {
                    client.post_disconnect();
                }
            }
        });

        // Flush everything the client sent while the backend was connecting.
        for block in state.pending.drain(..) {
            backend.send(&block);
        }
        state.backend = Some(Arc::clone(backend));
        debug!(peer = ?backend.peer_addr(), "backend connected");
    });

    if target.service.add_tcp_connection(socket, opts).is_err() {
        warn!("service rejected backend connection");
        if let Some(client) = err_client.upgrade() {
            client.post_disconnect();
        }
    }
}
