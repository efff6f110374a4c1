use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, trace};
use mac_address::MacAddress;
use thiserror::Error;

use crate::hci::{self, HciError};

/// Reported to observers when there is no measurement. Never a real reading.
pub const NO_SIGNAL_DBM: i8 = -99;

const BTPROTO_L2CAP: libc::c_int = 0;
const BTPROTO_HCI: libc::c_int = 1;
const SOL_HCI: libc::c_int = 0;
const HCI_FILTER: libc::c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const SDP_PSM: u16 = 1;

/// `_IOR('H', 213, int)`
const HCIGETCONNINFO: libc::c_ulong = 0x8004_48d5;

const HCI_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("no usable bluetooth adapter: {0}")]
    NoAdapter(#[source] io::Error),

    #[error("device unreachable: {0}")]
    Unreachable(#[source] io::Error),

    #[error("no active connection to device: {0}")]
    NotConnected(#[source] io::Error),

    #[error("malformed controller response: {0}")]
    Protocol(#[from] HciError),

    #[error("timed out waiting for controller reply")]
    ReplyTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SampleError {
    /// Out-of-range devices produce these constantly; they are not worth
    /// more than a debug line.
    pub fn is_expected(&self) -> bool {
        matches!(self, SampleError::Unreachable(_) | SampleError::NotConnected(_))
    }
}

pub trait SignalSampler {
    /// Returns the current RSSI in dBm for `address`.
    fn sample(&mut self, address: &MacAddress) -> Result<i8, SampleError>;

    /// Drops any open session.
    fn release(&mut self);

    /// Applies adapter and timeout settings to the next session opened.
    fn reconfigure(&mut self, _adapter_index: u16, _connect_timeout: Duration) {}
}

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// The radio primitives a sampler needs: open a session to a device and
/// read its RSSI over that session.
pub trait HciTransport {
    type Link;

    fn open(
        &mut self,
        adapter_index: u16,
        address: &MacAddress,
        connect_timeout: Duration,
    ) -> Result<Self::Link, SampleError>;

    fn read_rssi(
        &mut self,
        link: &mut Self::Link,
        address: &MacAddress,
    ) -> Result<i8, SampleError>;
}

enum Session<L> {
    Uninitialized,
    Live { address: MacAddress, link: L },
    Invalidated,
}

/// Samples RSSI over an [`HciTransport`], keeping one session open between
/// ticks for as long as the target stays the same and reads succeed.
pub struct HciSampler<T: HciTransport> {
    transport: T,
    adapter_index: u16,
    connect_timeout: Duration,
    session: Session<T::Link>,
}

impl<T: HciTransport> HciSampler<T> {
    pub fn new(transport: T, adapter_index: u16, connect_timeout: Duration) -> Self {
        HciSampler {
            transport,
            adapter_index,
            connect_timeout,
            session: Session::Uninitialized,
        }
    }

    /// Takes the link out of the session, opening a new one unless the
    /// current session is live and for the same address. The session is
    /// left `Invalidated` until the caller puts a working link back.
    fn take_link(&mut self, address: &MacAddress) -> Result<T::Link, SampleError> {
        match mem::replace(&mut self.session, Session::Invalidated) {
            Session::Live { address: current, link } if current == *address => Ok(link),
            previous => {
                if let Session::Live { address: old, .. } = &previous {
                    debug!("Target changed from {} to {}, reopening session", old, address);
                }
                // Close the old link before opening a new one.
                drop(previous);
                let link = self
                    .transport
                    .open(self.adapter_index, address, self.connect_timeout)?;
                trace!("Opened session to {}", address);
                Ok(link)
            }
        }
    }
}

impl<T: HciTransport> SignalSampler for HciSampler<T> {
    fn sample(&mut self, address: &MacAddress) -> Result<i8, SampleError> {
        let mut link = self.take_link(address)?;
        let rssi = self.transport.read_rssi(&mut link, address)?;
        self.session = Session::Live {
            address: *address,
            link,
        };
        Ok(rssi)
    }

    fn release(&mut self) {
        if matches!(self.session, Session::Live { .. }) {
            debug!("Releasing sampling session");
        }
        self.session = Session::Uninitialized;
    }

    fn reconfigure(&mut self, adapter_index: u16, connect_timeout: Duration) {
        if adapter_index != self.adapter_index {
            self.release();
        }
        self.adapter_index = adapter_index;
        self.connect_timeout = connect_timeout;
    }
}

/// Raw HCI socket plus an L2CAP link that keeps the ACL connection up.
pub struct KernelLink {
    hci: OwnedFd,
    // Held open so the ACL link stays up between samples.
    _l2cap: OwnedFd,
    handle: Option<u16>,
}

/// Talks to the kernel Bluetooth stack through `AF_BLUETOOTH` sockets.
#[derive(Debug, Default)]
pub struct KernelTransport;

impl HciTransport for KernelTransport {
    type Link = KernelLink;

    fn open(
        &mut self,
        adapter_index: u16,
        address: &MacAddress,
        connect_timeout: Duration,
    ) -> Result<KernelLink, SampleError> {
        let hci = open_hci(adapter_index).map_err(SampleError::NoAdapter)?;
        let l2cap = connect_l2cap(address, connect_timeout)?;
        Ok(KernelLink {
            hci,
            _l2cap: l2cap,
            handle: None,
        })
    }

    fn read_rssi(
        &mut self,
        link: &mut KernelLink,
        address: &MacAddress,
    ) -> Result<i8, SampleError> {
        let fd = link.hci.as_raw_fd();
        let handle = match link.handle {
            Some(handle) => handle,
            None => {
                let handle = conn_handle(fd, address)?;
                trace!("Connection handle for {} is {}", address, handle);
                link.handle = Some(handle);
                handle
            }
        };

        let opcode = hci::read_rssi_opcode();
        set_event_filter(fd, opcode)?;
        write_all(fd, &hci::read_rssi_command(handle))?;

        let deadline = Instant::now() + HCI_REPLY_TIMEOUT;
        let mut buf = [0u8; 260];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !poll_fd(fd, libc::POLLIN, remaining)? {
                return Err(SampleError::ReplyTimeout);
            }
            let len = read_some(fd, &mut buf)?;
            if let Some(params) = hci::command_complete(&buf[..len], opcode)? {
                return Ok(hci::read_rssi_result(params, handle)?);
            }
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn socket(kind: libc::c_int, protocol: libc::c_int) -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the returned fd is owned immediately.
    let fd = cvt(unsafe {
        libc::socket(libc::AF_BLUETOOTH, kind | libc::SOCK_CLOEXEC, protocol)
    })?;
    // SAFETY: fd is a freshly created, valid descriptor not owned elsewhere.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_hci(adapter_index: u16) -> io::Result<OwnedFd> {
    let fd = socket(libc::SOCK_RAW, BTPROTO_HCI)?;
    let addr = SockaddrHci {
        hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        hci_dev: adapter_index,
        hci_channel: HCI_CHANNEL_RAW,
    };
    // SAFETY: addr is a properly initialized sockaddr_hci and the length
    // matches its size.
    cvt(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    })?;
    Ok(fd)
}

fn connect_l2cap(address: &MacAddress, timeout: Duration) -> Result<OwnedFd, SampleError> {
    let fd = socket(libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK, BTPROTO_L2CAP)
        .map_err(SampleError::NoAdapter)?;
    let addr = SockaddrL2 {
        l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: SDP_PSM.to_le(),
        l2_bdaddr: hci::bdaddr(address),
        l2_cid: 0,
        l2_bdaddr_type: 0,
    };
    // SAFETY: addr is a properly initialized sockaddr_l2 and the length
    // matches its size.
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const SockaddrL2 as *const libc::sockaddr,
            mem::size_of::<SockaddrL2>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(fd);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(SampleError::Unreachable(err));
    }

    if !poll_fd(fd.as_raw_fd(), libc::POLLOUT, timeout)? {
        return Err(SampleError::Unreachable(io::Error::from(io::ErrorKind::TimedOut)));
    }
    let mut so_error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: so_error and len are valid for writes of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    if so_error != 0 {
        return Err(SampleError::Unreachable(io::Error::from_raw_os_error(so_error)));
    }
    Ok(fd)
}

fn conn_handle(fd: RawFd, address: &MacAddress) -> Result<u16, SampleError> {
    let mut request = hci::conn_info_request(address);
    // SAFETY: the buffer is sized for hci_conn_info_req plus one
    // hci_conn_info, which is what the kernel writes back.
    let ret = unsafe { libc::ioctl(fd, HCIGETCONNINFO as _, request.as_mut_ptr()) };
    if ret < 0 {
        return Err(SampleError::NotConnected(io::Error::last_os_error()));
    }
    Ok(hci::conn_info_handle(&request)?)
}

fn set_event_filter(fd: RawFd, opcode: u16) -> io::Result<()> {
    let filter = HciFilter {
        type_mask: 1 << hci::HCI_EVENT_PKT,
        event_mask: [
            (1 << hci::EVT_CMD_COMPLETE) | (1 << hci::EVT_CMD_STATUS),
            0,
        ],
        opcode,
    };
    // SAFETY: filter is a properly initialized hci_filter.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            SOL_HCI,
            HCI_FILTER,
            &filter as *const HciFilter as *const libc::c_void,
            mem::size_of::<HciFilter>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    loop {
        // SAFETY: pfd points to exactly one valid pollfd.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret > 0);
    }
}

fn write_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let rest = &buf[written..];
        // SAFETY: rest is a valid readable slice for its length.
        let ret = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        written += ret as usize;
    }
    Ok(())
}

fn read_some(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: buf is a valid writable slice for its length.
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(ret as usize);
    }
}
