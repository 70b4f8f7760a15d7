use std::sync::Arc;

use braid::{Listener, ListenerOptions, SocketOptions, TcpService};

fn main() {
    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = bind_addr.parse().expect("invalid listen address");

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let service = Arc::new(TcpService::new());
    service.start(workers).expect("failed to start service");

    let svc = Arc::clone(&service);
    let listener = Listener::start(addr, ListenerOptions::default(), move |socket| {
        let opts = SocketOptions::new().disable_nagle(true).on_enter(|conn| {
            eprintln!("accepted {:?}", conn.peer_addr());
            let echo = Arc::downgrade(conn);
            conn.set_data_callback(move |data| {
                if let Some(conn) = echo.upgrade() {
                    conn.send(data);
                }
                data.len()
            });
            conn.set_disconnect_callback(|conn, reason| {
                eprintln!("closed {:?}: {reason:?}", conn.peer_addr());
            });
        });
        if let Err(e) = svc.add_tcp_connection(socket, opts) {
            eprintln!("failed to add connection: {e}");
        }
    })
    .expect("failed to bind");

    eprintln!("echo server on {}", listener.local_addr());
    loop {
        std::thread::park();
    }
}
