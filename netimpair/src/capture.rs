//! Linux `AF_PACKET` sockets bridged onto the tunnel's ports

use anyhow::Context;
use impairment_pipeline::{Frame, PortPeer};
use std::ffi::CString;
use std::io::{self, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Large enough for any frame the kernel hands to a packet socket without GRO
const MAX_FRAME_SIZE: usize = 65536;

/// A raw socket bound to one interface in promiscuous mode
///
/// Frames the host itself transmits on the interface (including the ones the tunnel injects)
/// are filtered out on receive.
pub struct PacketSocket {
    device: String,
    inner: AsyncFd<OwnedFd>,
}

impl PacketSocket {
    pub fn bind(device: &str) -> anyhow::Result<Self> {
        let name = CString::new(device).context("device name contains a NUL byte")?;
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("no such interface `{device}`"));
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error())
                .context("failed to open a packet socket (CAP_NET_RAW is required)");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut address: libc::sockaddr_ll = unsafe { mem::zeroed() };
        address.sll_family = libc::AF_PACKET as libc::c_ushort;
        address.sll_protocol = protocol;
        address.sll_ifindex = index as libc::c_int;
        let result = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &address as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to bind to `{device}`"));
        }

        let mut membership: libc::packet_mreq = unsafe { mem::zeroed() };
        membership.mr_ifindex = index as libc::c_int;
        membership.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
        let result = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &membership as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to enable promiscuous mode on `{device}`"));
        }

        Ok(Self {
            device: device.to_string(),
            inner: AsyncFd::new(fd).context("failed to register the packet socket")?,
        })
    }

    /// Receives the next frame that arrived from the wire
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| recv_inbound(inner.as_raw_fd(), buf)) {
                Ok(Ok(Some(len))) => return Ok(len),
                // Our own transmission, seen on the way out
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| send_frame(inner.as_raw_fd(), frame)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn recv_inbound(fd: libc::c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut source: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut source_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let received = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut source as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut source_len,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    if source.sll_pkttype == libc::PACKET_OUTGOING {
        Ok(None)
    } else {
        Ok(Some(received as usize))
    }
}

fn send_frame(fd: libc::c_int, frame: &[u8]) -> io::Result<()> {
    let sent = unsafe { libc::send(fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// The tasks moving frames between one interface and its port
pub struct Bridge {
    capture: JoinHandle<()>,
    inject: JoinHandle<()>,
}

impl Bridge {
    pub fn spawn(socket: Arc<PacketSocket>, peer: PortPeer) -> Self {
        let PortPeer {
            to_tunnel,
            mut from_tunnel,
        } = peer;

        let capture_socket = socket.clone();
        let capture = tokio::spawn(async move {
            let mut buf = vec![0; MAX_FRAME_SIZE];
            loop {
                let len = match capture_socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(device = %capture_socket.device, "capture failed: {e}");
                        break;
                    }
                };

                if to_tunnel.send(Frame::from(&buf[..len])).await.is_err() {
                    break;
                }
            }

            debug!(device = %capture_socket.device, "capture stopped");
        });

        // Runs until the tunnel closes the port after shutting down
        let inject = tokio::spawn(async move {
            while let Some(frame) = from_tunnel.recv().await {
                if let Err(e) = socket.send(frame.as_bytes()).await {
                    warn!(device = %socket.device, len = frame.len(), "injection failed: {e}");
                }
            }

            debug!(device = %socket.device, "injection stopped");
        });

        Self { capture, inject }
    }

    /// Stops capturing and waits until every frame the tunnel emitted has been injected
    pub async fn close(self) {
        self.capture.abort();
        if let Err(e) = self.inject.await {
            if e.is_panic() {
                warn!("injection task panicked: {e}");
            }
        }
    }
}
