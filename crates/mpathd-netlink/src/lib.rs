use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use tracing::{trace, warn};

use mpathd_uevent::{PollStatus, RawUevent, UeventSource};

/// Kernel multicast group carrying kobject uevents.
const KERNEL_GROUP: u32 = 1;
/// One datagram; kernel uevents are bounded well below this.
const DATAGRAM_LEN: usize = 8192;
/// Default socket receive buffer target, sized to ride out device storms.
pub const DEFAULT_RECEIVE_BUFFER: usize = 128 * 1024 * 1024;

/// Subsystem/devtype pair applied to each parsed datagram.
#[derive(Clone, Debug)]
pub struct Subscription {
    subsystem: String,
    devtype: String,
}

impl Subscription {
    pub fn new(subsystem: impl Into<String>, devtype: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            devtype: devtype.into(),
        }
    }

    fn matches(&self, properties: &[(String, String)]) -> bool {
        let field = |name: &str| {
            properties
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        field("SUBSYSTEM") == Some(self.subsystem.as_str())
            && field("DEVTYPE") == Some(self.devtype.as_str())
    }
}

/// Blocking monitor on the kernel's uevent netlink socket.
pub struct NetlinkMonitor {
    fd: OwnedFd,
    subscription: Subscription,
}

impl NetlinkMonitor {
    /// Open the kernel uevent socket with a receive buffer large enough
    /// to ride out a SAN rescan, and subscribe to one subsystem/devtype
    /// pair.
    pub fn open(subscription: Subscription, receive_buffer: usize) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkKObjectUEvent,
        )
        .context("open netlink uevent socket")?;
        // SO_RCVBUFFORCE needs CAP_NET_ADMIN; fall back to the soft limit.
        if let Err(err) = setsockopt(&fd, sockopt::RcvBufForce, &receive_buffer) {
            warn!(error = %err, "SO_RCVBUFFORCE failed, falling back to SO_RCVBUF");
            setsockopt(&fd, sockopt::RcvBuf, &receive_buffer)
                .context("size socket receive buffer")?;
        }
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, KERNEL_GROUP))
            .context("bind netlink uevent socket")?;
        Ok(Self { fd, subscription })
    }
}

impl UeventSource for NetlinkMonitor {
    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(PollStatus::TimedOut),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLIN) {
                    Ok(PollStatus::Ready)
                } else if revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    Err(anyhow!("netlink socket poll error: {revents:?}"))
                } else {
                    Ok(PollStatus::TimedOut)
                }
            }
            Err(Errno::EINTR) => Ok(PollStatus::Interrupted),
            Err(err) => Err(err).context("poll netlink uevent socket"),
        }
    }

    fn recv(&mut self) -> Result<Option<RawUevent>> {
        let mut buf = [0u8; DATAGRAM_LEN];
        let len = match recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(len) => len,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => return Ok(None),
            Err(err) => return Err(err).context("receive uevent datagram"),
        };
        let Some(properties) = parse_datagram(&buf[..len]) else {
            trace!(len, "ignoring non-kernel datagram");
            return Ok(None);
        };
        if !self.subscription.matches(&properties) {
            trace!("ignoring uevent outside subscription");
            return Ok(None);
        }
        Ok(Some(RawUevent::new(properties)))
    }
}

/// Parse one kernel uevent datagram: an `action@devpath` header followed
/// by NUL-separated `KEY=VALUE` properties. Datagrams re-broadcast by
/// udevd carry a `libudev` magic header instead and are ignored, as is
/// anything else that does not look like a kernel notification.
fn parse_datagram(data: &[u8]) -> Option<Vec<(String, String)>> {
    let mut segments = data.split(|byte| *byte == 0);
    let header = std::str::from_utf8(segments.next()?).ok()?;
    if header.starts_with("libudev") || !header.contains('@') {
        return None;
    }
    let mut properties = Vec::new();
    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(segment) else {
            continue;
        };
        let Some((name, value)) = text.split_once('=') else {
            continue;
        };
        properties.push((name.to_string(), value.to_string()));
    }
    if properties.is_empty() {
        None
    } else {
        Some(properties)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(header: &str, properties: &[(&str, &str)]) -> Vec<u8> {
        let mut data = header.as_bytes().to_vec();
        data.push(0);
        for (name, value) in properties {
            data.extend_from_slice(format!("{name}={value}").as_bytes());
            data.push(0);
        }
        data
    }

    #[test]
    fn parses_kernel_datagram_preserving_order() {
        let data = datagram(
            "add@/devices/pci0000:00/block/sdb",
            &[
                ("ACTION", "add"),
                ("DEVPATH", "/devices/pci0000:00/block/sdb"),
                ("SUBSYSTEM", "block"),
                ("DEVTYPE", "disk"),
                ("SEQNUM", "4711"),
            ],
        );
        let properties = parse_datagram(&data).expect("kernel datagram");
        assert_eq!(properties[0], ("ACTION".to_string(), "add".to_string()));
        assert_eq!(properties[4], ("SEQNUM".to_string(), "4711".to_string()));
    }

    #[test]
    fn ignores_udevd_rebroadcasts() {
        let mut data = b"libudev".to_vec();
        data.push(0);
        data.extend_from_slice(&[0xfe, 0xed, 0xca, 0xfe]);
        assert!(parse_datagram(&data).is_none());
    }

    #[test]
    fn ignores_garbage() {
        assert!(parse_datagram(b"").is_none());
        assert!(parse_datagram(b"no header separator\0FOO=bar\0").is_none());
        assert!(parse_datagram(&[0xff, 0xfe, 0x00, 0x41]).is_none());
    }

    #[test]
    fn segments_without_separator_are_skipped() {
        let data = datagram("change@/devices/virtual/block/dm-0", &[("ACTION", "change")]);
        let mut data = data;
        data.extend_from_slice(b"NOEQUALS");
        data.push(0);
        let properties = parse_datagram(&data).expect("kernel datagram");
        assert_eq!(properties.len(), 1);
    }

    #[test]
    fn subscription_matches_on_subsystem_and_devtype() {
        let subscription = Subscription::new("block", "disk");
        let disk = vec![
            ("SUBSYSTEM".to_string(), "block".to_string()),
            ("DEVTYPE".to_string(), "disk".to_string()),
        ];
        let partition = vec![
            ("SUBSYSTEM".to_string(), "block".to_string()),
            ("DEVTYPE".to_string(), "partition".to_string()),
        ];
        let net = vec![("SUBSYSTEM".to_string(), "net".to_string())];
        assert!(subscription.matches(&disk));
        assert!(!subscription.matches(&partition));
        assert!(!subscription.matches(&net));
    }
}
