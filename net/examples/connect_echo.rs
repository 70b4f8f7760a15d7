use std::sync::Arc;
use std::time::Duration;

use braid::{AsyncConnector, ConnectOptions, SocketOptions, TcpService};

fn main() {
    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let addr = target.parse().expect("invalid target address");

    let service = Arc::new(TcpService::new());
    service.start(1).expect("failed to start service");
    let connector = AsyncConnector::new();
    connector.start().expect("failed to start connector");

    let svc = Arc::clone(&service);
    connector
        .connect(ConnectOptions::new(
            addr,
            Duration::from_secs(5),
            move |socket| {
                let opts = SocketOptions::new().on_enter(|conn| {
                    conn.set_data_callback(|data| {
                        eprintln!("received: {}", String::from_utf8_lossy(data));
                        data.len()
                    });
                    conn.set_disconnect_callback(|_conn, reason| {
                        eprintln!("disconnected: {reason:?}");
                    });
                    conn.send(b"hello from braid\n");
                });
                if let Err(e) = svc.add_tcp_connection(socket, opts) {
                    eprintln!("failed to add connection: {e}");
                }
            },
            |err| {
                eprintln!("connect failed: {err}");
                std::process::exit(1);
            },
        ))
        .expect("connector not running");

    std::thread::sleep(Duration::from_secs(2));
    connector.stop();
    service.stop();
}
