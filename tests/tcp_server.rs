use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{EventLoopThread, TcpConnection, TcpServer};

mod util;

use util::init;

#[test]
fn echo_round_trip() {
    init();

    let mut base_thread = EventLoopThread::new("echo-base", None);
    let base = base_thread.start().expect("unable to start base loop");
    let server = TcpServer::new(base, "127.0.0.1:0".parse().unwrap(), "echo", false)
        .expect("unable to bind");

    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let (down_tx, down_rx) = mpsc::channel();
    {
        let ups = Arc::clone(&ups);
        let downs = Arc::clone(&downs);
        // Mutex-wrapped because mpsc senders are Send but not Sync.
        let down_tx = Mutex::new(down_tx);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                ups.fetch_add(1, Ordering::SeqCst);
            } else {
                downs.fetch_add(1, Ordering::SeqCst);
                let _ = down_tx.lock().unwrap().send(());
            }
        }));
    }
    {
        let received = Arc::clone(&received);
        server.set_message_callback(Arc::new(move |conn, buf, _| {
            let bytes = buf.retrieve_as_bytes(buf.readable_bytes());
            received.lock().unwrap().extend_from_slice(&bytes);
            conn.send(&bytes);
        }));
    }
    server.start().expect("unable to start server");

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"hello\n").unwrap();
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello\n");
    drop(client);

    down_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no down edge");
    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().unwrap().as_slice(), b"hello\n");

    // The map entry goes away on the base loop, just after the down
    // edge; give it a moment.
    let deadline = Instant::now() + Duration::from_secs(1);
    while server.connection_count() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn pool_distributes_connections_round_robin() {
    init();

    let mut base_thread = EventLoopThread::new("rr-base", None);
    let base = base_thread.start().expect("unable to start base loop");
    let server = TcpServer::new(base, "127.0.0.1:0".parse().unwrap(), "rr", false)
        .expect("unable to bind");
    server.set_thread_num(4);

    let owners = Arc::new(Mutex::new(Vec::new()));
    let (up_tx, up_rx) = mpsc::channel();
    {
        let owners = Arc::clone(&owners);
        let up_tx = Mutex::new(up_tx);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                owners.lock().unwrap().push(thread::current().id());
                let _ = up_tx.lock().unwrap().send(());
            }
        }));
    }
    server.start().expect("unable to start server");

    const CONNECTIONS: usize = 100;
    let mut clients = Vec::with_capacity(CONNECTIONS);
    for _ in 0..CONNECTIONS {
        clients.push(TcpStream::connect(server.listen_addr()).unwrap());
    }
    for _ in 0..CONNECTIONS {
        up_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("missing up edge");
    }

    let owners = owners.lock().unwrap();
    let mut per_loop: HashMap<_, usize> = HashMap::new();
    for owner in owners.iter() {
        *per_loop.entry(*owner).or_insert(0) += 1;
    }
    assert_eq!(per_loop.len(), 4, "all four workers should own connections");
    for (_, count) in per_loop.iter() {
        assert_eq!(*count, CONNECTIONS / 4);
    }
    drop(clients);
}

#[test]
fn peer_half_close_delivers_bytes_then_down_edge() {
    init();

    let mut base_thread = EventLoopThread::new("hc-base", None);
    let base = base_thread.start().expect("unable to start base loop");
    let server = TcpServer::new(base, "127.0.0.1:0".parse().unwrap(), "hc", false)
        .expect("unable to bind");

    let (down_tx, down_rx) = mpsc::channel();
    let down_tx = Mutex::new(down_tx);
    server.set_connection_callback(Arc::new(move |conn| {
        if !conn.connected() {
            let _ = down_tx.lock().unwrap().send(());
        }
    }));
    // Echo whatever arrives; with the client's write side already shut
    // this exercises sending on a half-closed connection.
    server.set_message_callback(Arc::new(|conn, buf, _| {
        let bytes = buf.retrieve_as_bytes(buf.readable_bytes());
        conn.send(&bytes);
    }));
    server.start().expect("unable to start server");

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"ping").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    // The echo still arrives, then EOF once the server side is torn
    // down; read_to_end sees both.
    let mut returned = Vec::new();
    client.read_to_end(&mut returned).unwrap();
    assert_eq!(returned, b"ping");

    down_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no down edge");
}

#[test]
fn high_water_mark_fires_exactly_once_until_drained() {
    init();

    let mut base_thread = EventLoopThread::new("hwm-base", None);
    let base = base_thread.start().expect("unable to start base loop");
    let server = TcpServer::new(base, "127.0.0.1:0".parse().unwrap(), "hwm", false)
        .expect("unable to bind");
    server.set_thread_num(1);

    const MARK: usize = 64 * 1024;
    let crossings = Arc::new(AtomicUsize::new(0));
    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let (up_tx, up_rx) = mpsc::channel();
    let (hwm_tx, hwm_rx) = mpsc::channel();
    {
        let crossings = Arc::clone(&crossings);
        let conn_slot = Arc::clone(&conn_slot);
        let up_tx = Mutex::new(up_tx);
        let hwm_tx = Mutex::new(hwm_tx);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                let crossings = Arc::clone(&crossings);
                let hwm_tx = Mutex::new(hwm_tx.lock().unwrap().clone());
                conn.set_high_water_mark_callback(
                    Arc::new(move |_, buffered| {
                        crossings.fetch_add(1, Ordering::SeqCst);
                        let _ = hwm_tx.lock().unwrap().send(buffered);
                    }),
                    MARK,
                );
                *conn_slot.lock().unwrap() = Some(Arc::clone(conn));
                let _ = up_tx.lock().unwrap().send(());
            }
        }));
    }
    server.start().expect("unable to start server");

    // The client never reads, so the kernel buffers fill and writes
    // start landing in the connection's output buffer.
    let client = TcpStream::connect(server.listen_addr()).unwrap();
    up_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no up edge");
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    let chunk = vec![0u8; 64 * 1024];
    'outer: for _ in 0..64 {
        for _ in 0..16 {
            conn.send(&chunk);
        }
        if crossings.load(Ordering::SeqCst) > 0 {
            break 'outer;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let buffered = hwm_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("high-water mark never crossed");
    assert!(buffered >= MARK);

    // Still above the mark: further sends must not fire it again.
    for _ in 0..10 {
        conn.send(&chunk);
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(crossings.load(Ordering::SeqCst), 1);

    conn.force_close();
    drop(conn);
    drop(client);
}

#[test]
fn stop_read_pauses_message_delivery() {
    init();

    let mut base_thread = EventLoopThread::new("sr-base", None);
    let base = base_thread.start().expect("unable to start base loop");
    let server = TcpServer::new(base, "127.0.0.1:0".parse().unwrap(), "sr", false)
        .expect("unable to bind");

    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let (up_tx, up_rx) = mpsc::channel();
    let (msg_tx, msg_rx) = mpsc::channel();
    {
        let conn_slot = Arc::clone(&conn_slot);
        let up_tx = Mutex::new(up_tx);
        server.set_connection_callback(Arc::new(move |conn| {
            if conn.connected() {
                *conn_slot.lock().unwrap() = Some(Arc::clone(conn));
                let _ = up_tx.lock().unwrap().send(());
            }
        }));
    }
    let msg_tx = Mutex::new(msg_tx);
    server.set_message_callback(Arc::new(move |_, buf, _| {
        let _ = msg_tx.lock().unwrap().send(buf.retrieve_all_as_string());
    }));
    server.start().expect("unable to start server");

    let mut client = TcpStream::connect(server.listen_addr()).unwrap();
    up_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("no up edge");
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    conn.stop_read();
    thread::sleep(Duration::from_millis(50));
    client.write_all(b"paused").unwrap();
    assert!(
        msg_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "message delivered while reading was stopped"
    );

    conn.start_read();
    let delivered = msg_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("message lost after start_read");
    assert_eq!(delivered, "paused");
}
