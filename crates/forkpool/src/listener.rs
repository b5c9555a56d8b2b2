//! Listener binder: attaches a worker to the pool's shared logical port.
//!
//! Two distribution models:
//! - **ReusePort**: every worker binds its own socket with SO_REUSEPORT and
//!   the kernel balances new connections across them. The primary binds
//!   nothing.
//! - **Inherited**: the primary binds a single socket, leaves it open across
//!   exec, and every worker accepts on that same kernel socket. Fallback for
//!   platforms without load-balanced reuseport.

use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket};

const LISTEN_BACKLOG: u32 = 1024;

/// How a worker obtains its listening socket. Sent to the worker in `Init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ListenSpec {
    ReusePort { addr: SocketAddr },
    Inherited { fd: i32, addr: SocketAddr },
}

impl ListenSpec {
    pub fn addr(&self) -> SocketAddr {
        match self {
            ListenSpec::ReusePort { addr } | ListenSpec::Inherited { addr, .. } => *addr,
        }
    }
}

/// Bind (or adopt) the worker's listener. Must be called inside a tokio runtime.
pub fn bind_listener(spec: &ListenSpec) -> io::Result<TcpListener> {
    match spec {
        ListenSpec::ReusePort { addr } => bind_reuse_port(*addr),
        ListenSpec::Inherited { fd, .. } => adopt_inherited(*fd),
    }
}

fn bind_reuse_port(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

#[cfg(unix)]
fn adopt_inherited(fd: i32) -> io::Result<TcpListener> {
    use std::os::fd::FromRawFd;

    if fd <= 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to adopt stdio descriptor {fd} as listener"),
        ));
    }

    // SAFETY: the primary bound this descriptor and cleared FD_CLOEXEC so it
    // survives exec; nothing else in this process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

#[cfg(not(unix))]
fn adopt_inherited(_fd: i32) -> io::Result<TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "inherited listeners require a unix platform",
    ))
}

/// Primary-side socket for the inherited distribution model.
///
/// Held by the primary for the lifetime of the pool. The primary never
/// accepts on it.
#[cfg(unix)]
pub struct SharedSocket {
    listener: std::net::TcpListener,
    addr: SocketAddr,
}

#[cfg(unix)]
impl SharedSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        use nix::fcntl::{FcntlArg, FdFlag, fcntl};
        use std::os::fd::AsFd;

        let listener = std::net::TcpListener::bind(addr)?;
        let flags = FdFlag::from_bits_truncate(fcntl(listener.as_fd(), FcntlArg::F_GETFD)?);
        fcntl(
            listener.as_fd(),
            FcntlArg::F_SETFD(flags.difference(FdFlag::FD_CLOEXEC)),
        )?;
        let addr = listener.local_addr()?;

        tracing::debug!(%addr, "Bound shared listener for workers to inherit");
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn spec(&self) -> ListenSpec {
        use std::os::fd::AsRawFd;

        ListenSpec::Inherited {
            fd: self.listener.as_raw_fd(),
            addr: self.addr,
        }
    }
}
