//! End-to-end relay tests: a real backend behind a real proxy, with the
//! backend deliberately slow to read.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use braid_proxy::config::{BackendSection, Config, LoggingSection, ProxySection, WorkersSection};
use braid_proxy::Proxy;

fn test_config(backend_addr: SocketAddr) -> Config {
    Config {
        proxy: ProxySection {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_recv_buffer_size: 32 * 1024,
        },
        backend: BackendSection {
            addr: backend_addr,
            connect_timeout_ms: 2_000,
        },
        workers: WorkersSection { threads: Some(2) },
        logging: LoggingSection::default(),
    }
}

#[test]
fn buffered_bytes_reach_a_slow_backend_then_relay_is_bidirectional() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();

    let backend = thread::spawn(move || {
        let (mut sock, _) = backend_listener.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // Stall before reading: the client's burst must sit buffered along
        // the way and arrive intact.
        thread::sleep(Duration::from_millis(200));
        let mut buf = vec![0u8; 4096];
        sock.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x41), "payload corrupted");

        sock.write_all(b"ack!").unwrap();

        // The client closing must propagate through the proxy as EOF here.
        let mut tail = [0u8; 1];
        let n = sock.read(&mut tail).unwrap();
        assert_eq!(n, 0, "expected EOF after client close");
    });

    let proxy = Proxy::start(&test_config(backend_addr)).unwrap();

    let mut client = TcpStream::connect(proxy.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(&vec![0x41u8; 4096]).unwrap();

    let mut ack = [0u8; 4];
    client.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"ack!");

    drop(client);
    backend.join().unwrap();
    proxy.shutdown();
}

#[test]
fn backend_close_disconnects_the_client() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();

    let backend = thread::spawn(move || {
        let (mut sock, _) = backend_listener.accept().unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 2];
        sock.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
        sock.write_all(b"bye").unwrap();
        // Closing here must ripple through to the client.
    });

    let proxy = Proxy::start(&test_config(backend_addr)).unwrap();

    let mut client = TcpStream::connect(proxy.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hi").unwrap();

    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"bye");

    backend.join().unwrap();

    // After the backend closed, the client sees EOF.
    let mut tail = [0u8; 1];
    let n = client.read(&mut tail).unwrap();
    assert_eq!(n, 0, "expected EOF after backend close");

    proxy.shutdown();
}

#[test]
fn unreachable_backend_disconnects_the_client() {
    // Bind a port, then free it: connects are refused.
    let dead_addr = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };

    let proxy = Proxy::start(&test_config(dead_addr)).unwrap();

    let mut client = TcpStream::connect(proxy.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"doomed").unwrap();

    // The proxy drops the session once the backend connect fails.
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "expected EOF after backend connect failure");

    proxy.shutdown();
}
