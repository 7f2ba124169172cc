use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;

/// Fired on the connection's up edge and again on its down edge; use
/// [`TcpConnection::connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Fired when bytes arrive, with the input buffer and the poll return
/// timestamp. The callback consumes what it wants with `retrieve`.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
/// Fired when the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
/// Fired when the output buffer crosses the high-water mark from below,
/// with the buffered size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            3 => State::Disconnecting,
            _ => unreachable!("invalid connection state {}", value),
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP connection, owned by exactly one loop.
///
/// Constructed by `TcpServer` around an accepted descriptor; user code
/// only ever sees it as an `Arc<TcpConnection>` inside callbacks. All
/// I/O and every state transition happen on the owning loop's thread;
/// the public mutators (`send`, `shutdown`, `force_close`, ...) are
/// safe from any thread and marshal themselves over.
///
/// Lifecycle: `Connecting` at construction, `Connected` after
/// `connect_established`, `Disconnecting` while a shutdown waits for
/// the output buffer to drain, `Disconnected` once the channel is gone.
/// The connection callback fires exactly twice: up edge, then down
/// edge.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    // Input and output buffers are locked only from the loop thread;
    // they are separate mutexes so the message callback, which runs
    // with the input buffer borrowed, can still call `send`.
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: LoopHandle,
        name: String,
        fd: OwnedFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        let socket = Socket::from_fd(fd);
        if let Err(err) = socket.set_keepalive(true) {
            warn!("SO_KEEPALIVE on {}: {}", name, err);
        }
        let channel = Arc::new(Channel::new(loop_.clone(), socket.as_raw_fd()));

        let conn = Arc::new(TcpConnection {
            loop_,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(false),
            socket,
            channel,
            local_addr,
            peer_addr,
            callbacks: Mutex::new(Callbacks::default()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            context: Mutex::new(None),
        });
        trace!("TcpConnection::new [{}] fd = {}", conn.name, conn.channel.fd());

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            move |lp, receive_time| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(lp, receive_time);
                }
            }
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            move |lp| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write(lp);
                }
            }
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            move |lp| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close(lp);
                }
            }
        });
        conn.channel.set_error_callback(move |_| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether read interest is currently enabled.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::SeqCst);
        self.callbacks.lock().unwrap().high_water_mark = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(callback);
    }

    /// Attach arbitrary per-connection state, e.g. codec buffers.
    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Borrow the context slot as `T`; `None` if empty or of another
    /// type.
    pub fn with_context<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.context.lock().unwrap();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub fn clear_context(&self) {
        *self.context.lock().unwrap() = None;
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_nodelay(on) {
            error!("TCP_NODELAY on {}: {}", self.name, err);
        }
    }

    /// Queue `data` for delivery. Safe from any thread; on the owning
    /// thread the kernel write is attempted immediately, elsewhere the
    /// bytes are copied and the write is marshalled over.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            warn!("send on disconnected connection {}", self.name);
            return;
        }
        let conn = Arc::clone(self);
        let sent = self
            .loop_
            .try_run_now(move |lp| conn.send_in_loop(lp, data))
            .is_some();
        if !sent {
            let conn = Arc::clone(self);
            let data = data.to_vec();
            self.loop_
                .run_in_loop(move |lp| conn.send_in_loop(lp, &data));
        }
    }

    /// Send the readable contents of `buffer`, consuming them.
    pub fn send_buffer(self: &Arc<Self>, buffer: &mut Buffer) {
        self.send(&buffer.retrieve_as_bytes(buffer.readable_bytes()));
    }

    /// Half-close: no more writes from this side, reading continues.
    /// Deferred until the output buffer has drained.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.loop_.run_in_loop(move |lp| conn.shutdown_in_loop(lp));
        }
    }

    /// Tear the connection down without waiting for pending output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = Arc::clone(self);
            self.loop_.queue_in_loop(move |lp| {
                if matches!(conn.state(), State::Connected | State::Disconnecting) {
                    conn.handle_close(lp);
                }
            });
        }
    }

    /// [`force_close`] after `delay`, unless the connection died first.
    ///
    /// [`force_close`]: TcpConnection::force_close
    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            let weak = Arc::downgrade(self);
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resume reading after [`stop_read`].
    ///
    /// [`stop_read`]: TcpConnection::stop_read
    pub fn start_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| {
            if !conn.reading.swap(true, Ordering::SeqCst) || !conn.channel.is_reading() {
                conn.channel.enable_reading(lp);
            }
        });
    }

    /// Drop read interest; the kernel buffers (and eventually its flow
    /// control stalls the peer) until [`start_read`].
    ///
    /// [`start_read`]: TcpConnection::start_read
    pub fn stop_read(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.loop_.run_in_loop(move |lp| {
            if conn.reading.swap(false, Ordering::SeqCst) || conn.channel.is_reading() {
                conn.channel.disable_reading(lp);
            }
        });
    }

    /// Called once by the server after construction, on the owning loop.
    pub(crate) fn connect_established(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        self.channel.tie(self);
        self.channel.enable_reading(lp);
        self.reading.store(true, Ordering::SeqCst);

        match self.connection_callback() {
            Some(callback) => callback(self),
            None => debug!("{} -> {} is up", self.peer_addr, self.local_addr),
        }
    }

    /// Called once by the server after the connection left its map, on
    /// the owning loop. Last member function ever invoked.
    pub(crate) fn connect_destroyed(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == State::Connected {
            // The peer never closed; this is a server-side teardown.
            self.set_state(State::Disconnected);
            self.channel.disable_all(lp);
            match self.connection_callback() {
                Some(callback) => callback(self),
                None => debug!("{} -> {} is down", self.peer_addr, self.local_addr),
            }
        }
        self.channel.remove(lp);
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn handle_read(self: &Arc<Self>, lp: &EventLoop, receive_time: Instant) {
        lp.assert_in_loop_thread();
        let mut input = self.input.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close(lp);
            }
            Ok(n) => {
                trace!("{} received {} bytes", self.name, n);
                let message = self.callbacks.lock().unwrap().message.clone();
                match message {
                    Some(callback) => callback(self, &mut input, receive_time),
                    None => input.retrieve_all(),
                }
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection {} is down, no more writing", self.name);
            return;
        }
        let mut output = self.output.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing(lp);
                    if let Some(callback) = self.callbacks.lock().unwrap().write_complete.clone() {
                        let conn = Arc::clone(self);
                        lp.queue_in_loop(move |_| callback(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop(lp);
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TcpConnection::handle_write [{}]: {}", self.name, err),
        }
    }

    fn handle_close(self: &Arc<Self>, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        trace!("fd = {} state = {:?}", self.channel.fd(), self.state());
        assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        // Transition first so callbacks observe the down edge.
        self.set_state(State::Disconnected);
        self.channel.disable_all(lp);

        let (connection, close) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        match connection {
            Some(callback) => callback(self),
            None => debug!("{} -> {} is down", self.peer_addr, self.local_addr),
        }
        // Must be last: the server drops its reference in here.
        if let Some(callback) = close {
            callback(self);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(err)) => err,
            Ok(None) => return,
            Err(err) => err,
        };
        error!("TcpConnection::handle_error [{}]: {}", self.name, err);
    }

    fn send_in_loop(self: &Arc<Self>, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("{} disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        // Try the kernel directly when nothing is queued ahead of us.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if n == data.len() {
                        drop(output);
                        if let Some(callback) =
                            self.callbacks.lock().unwrap().write_complete.clone()
                        {
                            let conn = Arc::clone(self);
                            lp.queue_in_loop(move |_| callback(&conn));
                        }
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && nwrote < data.len() {
            let remaining = &data[nwrote..];
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            if old_len + remaining.len() >= mark && old_len < mark {
                if let Some(callback) = self.callbacks.lock().unwrap().high_water_mark.clone() {
                    let conn = Arc::clone(self);
                    let buffered = old_len + remaining.len();
                    lp.queue_in_loop(move |_| callback(&conn, buffered));
                }
            }
            output.append(remaining);
            if !self.channel.is_writing() {
                self.channel.enable_writing(lp);
            }
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("shutdown(SHUT_WR) on {}: {}", self.name, err);
            }
        }
        // Otherwise handle_write issues the shutdown once the output
        // buffer drains.
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(
            "TcpConnection::drop [{}] state = {:?}",
            self.name,
            self.state()
        );
        debug_assert_eq!(self.state(), State::Disconnected);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
