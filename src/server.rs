use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::loop_thread::{EventLoopThreadPool, ThreadInitCallback};
use crate::sys;

/// A TCP server: acceptor on the base loop, a pool of worker loops, and
/// the map of every live connection.
///
/// The base loop accepts; each accepted socket is handed to a worker
/// loop (round-robin) which owns all further I/O for it. The connection
/// map is mutated only from the base loop. Dropping the server tears
/// down every remaining connection.
pub struct TcpServer {
    loop_: LoopHandle,
    name: String,
    listen_addr: SocketAddr,
    acceptor: Arc<Acceptor>,
    pool: EventLoopThreadPool,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    /// Bind `listen_addr` (port 0 picks a free port; see
    /// [`listen_addr`]). Listening starts with [`start`].
    ///
    /// [`listen_addr`]: TcpServer::listen_addr
    /// [`start`]: TcpServer::start
    pub fn new(
        base: LoopHandle,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base.clone(), listen_addr, reuse_port)?;
        let listen_addr = acceptor.local_addr()?;
        let pool = EventLoopThreadPool::new(base.clone(), format!("{}-worker", name));

        let server = Arc::new(TcpServer {
            loop_: base,
            name,
            listen_addr,
            acceptor,
            pool,
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |lp, fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(lp, fd, peer_addr);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actual bound address.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Number of worker loops; 0 (the default) serves every connection
    /// on the base loop. Must be called before [`start`].
    ///
    /// [`start`]: TcpServer::start
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init_callback.lock().unwrap() = Some(callback);
    }

    /// Start the worker pool and begin listening. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool
            .start(self.thread_init_callback.lock().unwrap().clone())?;

        let acceptor = Arc::clone(&self.acceptor);
        let name = self.name.clone();
        self.loop_.run_in_loop(move |lp| {
            debug_assert!(!acceptor.listening());
            if let Err(err) = acceptor.listen(lp) {
                error!("TcpServer [{}] failed to listen: {}", name, err);
            }
        });
        info!("TcpServer [{}] starts listening on {}", self.name, self.listen_addr);
        Ok(())
    }

    /// Tear down every live connection. Called implicitly on drop.
    pub fn stop(&self) {
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let destroyed = Arc::clone(&conn);
            conn.loop_handle()
                .run_in_loop(move |lp| destroyed.connect_destroyed(lp));
        }
    }

    /// Live connection count; instrumentation.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn new_connection(self: &Arc<Self>, lp: &EventLoop, fd: OwnedFd, peer_addr: SocketAddr) {
        lp.assert_in_loop_thread();
        let (index, worker) = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}#{}#{}", self.name, index, id);

        let local_addr = match sys::local_addr_of(&fd) {
            Ok(addr) => addr,
            Err(err) => {
                error!("getsockname for {} failed: {}", name, err);
                return;
            }
        };
        debug!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, name, peer_addr
        );

        let conn = TcpConnection::new(worker.clone(), name.clone(), fd, local_addr, peer_addr);
        if let Some(callback) = self.connection_callback.lock().unwrap().clone() {
            conn.set_connection_callback(callback);
        }
        if let Some(callback) = self.message_callback.lock().unwrap().clone() {
            conn.set_message_callback(callback);
        }
        if let Some(callback) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(callback);
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(name, Arc::clone(&conn));
        worker.run_in_loop(move |lp| conn.connect_established(lp));
    }

    /// Close path entry; called from the connection's loop.
    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = Arc::clone(self);
        let conn = Arc::clone(conn);
        self.loop_
            .run_in_loop(move |lp| server.remove_connection_in_loop(lp, &conn));
    }

    fn remove_connection_in_loop(&self, lp: &EventLoop, conn: &Arc<TcpConnection>) {
        lp.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            conn.name()
        );
        if self.connections.lock().unwrap().remove(conn.name()).is_none() {
            // stop() already claimed this connection and posted its
            // teardown; a second connect_destroyed would be wrong.
            return;
        }

        let destroyed = Arc::clone(conn);
        conn.loop_handle()
            .queue_in_loop(move |lp| destroyed.connect_destroyed(lp));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
