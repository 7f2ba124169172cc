use std::io::{self, IoSliceMut};
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A connected, non-blocking stream socket.
///
/// Thin owner of the descriptor; all state above it (buffers, interest,
/// lifecycle) belongs to `TcpConnection`.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub(crate) fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ))
        .map(|n| n as usize)
    }

    /// Close the write half, leaving the read half open.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        set_opt(
            self.fd.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            on as libc::c_int,
        )
    }

    pub(crate) fn set_keepalive(&self, on: bool) -> io::Result<()> {
        set_opt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            on as libc::c_int,
        )
    }

    /// Fetch and clear the pending `SO_ERROR`.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut val: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if val == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(val)))
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A bound, non-blocking listening socket.
#[derive(Debug)]
pub(crate) struct TcpListenerSock {
    fd: OwnedFd,
}

impl TcpListenerSock {
    /// Create, configure and bind the listen socket. Listening itself is
    /// deferred to [`listen`].
    ///
    /// [`listen`]: TcpListenerSock::listen
    pub(crate) fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListenerSock> {
        let domain = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` just returned this fd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        set_opt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        if reuse_port {
            set_opt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }

        let (raw_addr, raw_addr_length) = socket_addr(&addr);
        syscall!(bind(fd.as_raw_fd(), raw_addr.as_ptr(), raw_addr_length))?;

        Ok(TcpListenerSock { fd })
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accept one pending connection, non-blocking and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut length = mem::size_of_val(&storage) as libc::socklen_t;

        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut length,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` just returned this fd and nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: `accept4` initialised the storage with the peer address.
        let addr = unsafe { to_socket_addr(&storage)? };
        Ok((fd, addr))
    }

    /// Accept and immediately drop a connection, without the cost of the
    /// peer-address conversion. Used to drain the backlog under `EMFILE`.
    pub(crate) fn accept_and_drop(&self) -> io::Result<()> {
        let fd = syscall!(accept4(
            self.fd.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: as above; dropping the owner closes it.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(())
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.fd.as_raw_fd())
    }
}

impl AsRawFd for TcpListenerSock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// `getsockname` for a descriptor not yet wrapped in a [`Socket`].
pub(crate) fn local_addr_of(fd: &impl AsRawFd) -> io::Result<SocketAddr> {
    sockname(fd.as_raw_fd())
}

/// Scatter read into two buffers with one system call.
pub(crate) fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    syscall!(readv(
        fd,
        bufs.as_mut_ptr() as *mut libc::iovec,
        bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
    ))
    .map(|n| n as usize)
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> io::Result<()> {
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const _ as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

fn sockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut length = mem::size_of_val(&storage) as libc::socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut length,
    ))?;
    // SAFETY: the kernel initialised the storage with a valid address.
    unsafe { to_socket_addr(&storage) }
}

/// Raw representation of a socket address, valid for either family.
#[repr(C)]
union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    fn as_ptr(&self) -> *const libc::sockaddr {
        self as *const _ as *const libc::sockaddr
    }
}

/// Convert a `std` address into its C representation plus length.
fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(addr.ip().octets()),
            };
            let sockaddr_in = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: addr.port().to_be(),
                sin_addr,
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sockaddr_in },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(ref addr) => {
            let sockaddr_in6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: addr.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: addr.ip().octets(),
                },
                sin6_flowinfo: addr.flowinfo(),
                sin6_scope_id: addr.scope_id(),
            };
            (
                SocketAddrCRepr { v6: sockaddr_in6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// # Safety
///
/// `storage` must hold an address the kernel initialised for `AF_INET`
/// or `AF_INET6`.
unsafe fn to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = &*(storage as *const _ as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(std::net::SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = &*(storage as *const _ as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}
