use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::{self, TcpListenerSock};

pub(crate) type NewConnectionCallback =
    Box<dyn Fn(&EventLoop, OwnedFd, SocketAddr) + Send + Sync>;

/// Listening socket plus the channel watching it for readability.
///
/// Owned by `TcpServer` and driven entirely on the base loop. The
/// socket is bound at construction; listening starts with [`listen`].
///
/// [`listen`]: Acceptor::listen
pub(crate) struct Acceptor {
    socket: TcpListenerSock,
    channel: Arc<Channel>,
    new_connection: OnceLock<NewConnectionCallback>,
    listening: AtomicBool,
    // Reserved descriptor for EMFILE recovery: closed to free a slot,
    // used to accept-and-drop the pending connection, then reopened.
    spare: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    pub(crate) fn new(
        owner: LoopHandle,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = TcpListenerSock::bind(listen_addr, reuse_port)?;
        let spare = sys::spare_fd()?;
        let channel = Arc::new(Channel::new(owner, socket.as_raw_fd()));

        let acceptor = Arc::new(Acceptor {
            socket,
            channel,
            new_connection: OnceLock::new(),
            listening: AtomicBool::new(false),
            spare: Mutex::new(Some(spare)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |lp, _| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read(lp);
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        let set = self.new_connection.set(callback);
        assert!(set.is_ok(), "new-connection callback set twice");
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) fn listen(&self, lp: &EventLoop) -> io::Result<()> {
        lp.assert_in_loop_thread();
        self.listening.store(true, Ordering::SeqCst);
        self.socket.listen()?;
        self.channel.enable_reading(lp);
        Ok(())
    }

    fn handle_read(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((fd, peer_addr)) => match self.new_connection.get() {
                    Some(callback) => callback(lp, fd, peer_addr),
                    None => drop(fd),
                },
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("accept hit EMFILE, draining backlog through the spare fd");
                    self.drain_one_over_emfile();
                }
                Err(err) => {
                    error!("Acceptor::handle_read accept failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Out of descriptors: give the spare back to the kernel, accept and
    /// immediately close the pending connection (so the peer sees a
    /// clean close instead of a hung handshake), then re-open the spare.
    fn drain_one_over_emfile(&self) {
        let mut spare = self.spare.lock().unwrap();
        drop(spare.take());
        if let Err(err) = self.socket.accept_and_drop() {
            warn!("EMFILE recovery accept failed: {}", err);
        }
        match sys::spare_fd() {
            Ok(fd) => *spare = Some(fd),
            Err(err) => error!("failed to re-open the spare fd: {}", err),
        }
    }
}
