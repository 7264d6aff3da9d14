//! Routing socket messages
//!
//! Encodes `RTM_GET` queries and decodes the kernel's replies. The byte
//! layout is the Darwin one (`struct rt_msghdr` followed by a packed list
//! of `sockaddr` records), kept free of platform types so the codec can be
//! exercised anywhere.
//!
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────────┬─────────┐
//! │ rt_msghdr    │ RTA_DST │ RTA_GW  │ RTA_MASK│ RTA_IFP │ ...
//! │ (92 bytes)   │ sockaddr│ sockaddr│ sockaddr│ sockaddr│
//! └──────────────┴─────────┴─────────┴─────────┴─────────┘
//!                 each record padded to a 4-byte boundary
//! ```

use super::{RouteResolution, RouteResolutionError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// `sizeof(struct rt_msghdr)`
pub const RT_MSGHDR_LEN: usize = 92;

pub const RTM_VERSION: u8 = 5;
pub const RTM_GET: u8 = 4;

pub const RTF_UP: i32 = 0x1;
pub const RTF_GATEWAY: i32 = 0x2;
pub const RTF_STATIC: i32 = 0x800;

pub const RTA_DST: i32 = 0x1;
pub const RTA_GATEWAY: i32 = 0x2;
pub const RTA_NETMASK: i32 = 0x4;
pub const RTA_IFP: i32 = 0x10;

/// Number of address slots that can follow the header (`RTAX_MAX`)
const RTAX_MAX: u32 = 8;

pub const AF_INET: u8 = 2;
pub const AF_LINK: u8 = 18;
pub const AF_INET6: u8 = 30;

const SOCKADDR_IN_LEN: usize = 16;
const SOCKADDR_IN6_LEN: usize = 28;
/// Offset of `sdl_data` within `struct sockaddr_dl`
const SDL_DATA_OFFSET: usize = 8;

/// Round a sockaddr length up to the record alignment. Empty records
/// still occupy one word.
pub fn align_sockaddr_len(len: usize) -> usize {
    const WORD: usize = std::mem::size_of::<u32>();
    if len == 0 {
        WORD
    } else {
        (len + WORD - 1) & !(WORD - 1)
    }
}

/// Fixed fields of `struct rt_msghdr` this module cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteHeader {
    pub msglen: u16,
    pub version: u8,
    pub kind: u8,
    pub index: u16,
    pub flags: i32,
    pub addrs: i32,
    pub pid: i32,
    pub seq: i32,
    pub errno: i32,
}

impl RouteHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.resize(start + RT_MSGHDR_LEN, 0);
        let hdr = &mut buf[start..];
        hdr[0..2].copy_from_slice(&self.msglen.to_ne_bytes());
        hdr[2] = self.version;
        hdr[3] = self.kind;
        hdr[4..6].copy_from_slice(&self.index.to_ne_bytes());
        hdr[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        hdr[12..16].copy_from_slice(&self.addrs.to_ne_bytes());
        hdr[16..20].copy_from_slice(&self.pid.to_ne_bytes());
        hdr[20..24].copy_from_slice(&self.seq.to_ne_bytes());
        hdr[24..28].copy_from_slice(&self.errno.to_ne_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RouteResolutionError> {
        if buf.len() < RT_MSGHDR_LEN {
            return Err(RouteResolutionError::InvalidMessageLength);
        }
        Ok(Self {
            msglen: u16::from_ne_bytes([buf[0], buf[1]]),
            version: buf[2],
            kind: buf[3],
            index: u16::from_ne_bytes([buf[4], buf[5]]),
            flags: read_i32(buf, 8),
            addrs: read_i32(buf, 12),
            pid: read_i32(buf, 16),
            seq: read_i32(buf, 20),
            errno: read_i32(buf, 24),
        })
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_ne_bytes(bytes)
}

/// Encode a `sockaddr_in` / `sockaddr_in6` for `addr` with port 0.
pub fn encode_sockaddr(addr: IpAddr, buf: &mut Vec<u8>) {
    match addr {
        IpAddr::V4(v4) => {
            let mut sa = [0u8; SOCKADDR_IN_LEN];
            sa[0] = SOCKADDR_IN_LEN as u8;
            sa[1] = AF_INET;
            sa[4..8].copy_from_slice(&v4.octets());
            buf.extend_from_slice(&sa);
        }
        IpAddr::V6(v6) => {
            let mut sa = [0u8; SOCKADDR_IN6_LEN];
            sa[0] = SOCKADDR_IN6_LEN as u8;
            sa[1] = AF_INET6;
            sa[8..24].copy_from_slice(&v6.octets());
            buf.extend_from_slice(&sa);
        }
    }
}

/// Build an `RTM_GET` query for `destination`.
pub fn encode_query(destination: IpAddr, pid: i32, seq: i32) -> Vec<u8> {
    let mut sockaddr = Vec::with_capacity(SOCKADDR_IN6_LEN);
    encode_sockaddr(destination, &mut sockaddr);
    sockaddr.resize(align_sockaddr_len(sockaddr.len()), 0);

    let header = RouteHeader {
        msglen: (RT_MSGHDR_LEN + sockaddr.len()) as u16,
        version: RTM_VERSION,
        kind: RTM_GET,
        flags: RTF_UP | RTF_GATEWAY | RTF_STATIC,
        addrs: RTA_DST | RTA_GATEWAY | RTA_IFP,
        pid,
        seq,
        ..Default::default()
    };

    let mut msg = Vec::with_capacity(usize::from(header.msglen));
    header.encode(&mut msg);
    msg.extend_from_slice(&sockaddr);
    msg
}

/// What to do with one message read from the routing socket
#[derive(Debug)]
pub enum ReplyOutcome {
    /// Somebody else's message; keep reading
    Skip,
    /// Reply to our query
    Resolved(RouteResolution),
}

/// Interpret one message read from the routing socket as a reply to the
/// query tagged `(pid, seq)` for `destination`.
pub fn decode_reply(
    buf: &[u8],
    pid: i32,
    seq: i32,
    destination: IpAddr,
) -> Result<ReplyOutcome, RouteResolutionError> {
    let header = RouteHeader::decode(buf)?;

    if header.version != RTM_VERSION {
        return Err(RouteResolutionError::InvalidVersion);
    }
    if header.pid != pid || header.seq != seq {
        return Ok(ReplyOutcome::Skip);
    }
    if header.errno != 0 {
        return Err(RouteResolutionError::MessageWithError(header.errno));
    }
    if header.addrs == 0 {
        return Err(RouteResolutionError::NoAddresses);
    }

    let end = usize::from(header.msglen).clamp(RT_MSGHDR_LEN, buf.len());
    let records = AddressRecords::collect(&buf[RT_MSGHDR_LEN..end], header.addrs)?;

    let mut resolution = RouteResolution {
        destination,
        gateway: None,
        netmask: None,
        interface_name: String::new(),
        interface_index: 0,
    };

    if let Some(dst) = records.destination {
        resolution.destination =
            parse_ip_address(dst).ok_or(RouteResolutionError::ParseDestination)?;
    }

    if let Some(gateway) = records.gateway {
        if header.flags & RTF_GATEWAY != 0 {
            resolution.gateway =
                Some(parse_ip_address(gateway).ok_or(RouteResolutionError::ParseGateway)?);
        }
    }

    if let (Some(mask), Some(dst)) = (records.netmask, records.destination) {
        let family = dst.get(1).copied().unwrap_or(0);
        resolution.netmask =
            Some(parse_netmask(mask, family).ok_or(RouteResolutionError::ParseNetmask)?);
    }

    if let Some(ifp) = records.interface {
        let name_len = usize::from(ifp[5]);
        let name = ifp
            .get(SDL_DATA_OFFSET..SDL_DATA_OFFSET + name_len)
            .ok_or(RouteResolutionError::InvalidMessageLength)?;
        resolution.interface_name = String::from_utf8_lossy(name).into_owned();
        resolution.interface_index = u16::from_ne_bytes([ifp[2], ifp[3]]);
    }

    Ok(ReplyOutcome::Resolved(resolution))
}

/// Sockaddr records found after the header, by kind
#[derive(Default)]
struct AddressRecords<'a> {
    destination: Option<&'a [u8]>,
    gateway: Option<&'a [u8]>,
    netmask: Option<&'a [u8]>,
    interface: Option<&'a [u8]>,
}

impl<'a> AddressRecords<'a> {
    fn collect(payload: &'a [u8], addrs: i32) -> Result<Self, RouteResolutionError> {
        let mut records = Self::default();
        let mut cursor = 0usize;

        for bit in (0..RTAX_MAX).map(|i| 1i32 << i) {
            if addrs & bit == 0 {
                continue;
            }

            let rest = payload
                .get(cursor..)
                .filter(|rest| !rest.is_empty())
                .ok_or(RouteResolutionError::InvalidMessageLength)?;
            let sa_len = usize::from(rest[0]);
            let record = &rest[..sa_len.min(rest.len())];
            let family = record.get(1).copied().unwrap_or(0);

            match bit {
                RTA_DST => records.destination = Some(record),
                RTA_GATEWAY => records.gateway = Some(record),
                RTA_NETMASK => records.netmask = Some(record),
                RTA_IFP => {
                    if family == AF_LINK && record.len() >= SDL_DATA_OFFSET && record[5] > 0 {
                        records.interface = Some(record);
                    }
                }
                _ => {}
            }

            cursor += align_sockaddr_len(sa_len);
        }

        Ok(records)
    }
}

fn parse_ip_address(sa: &[u8]) -> Option<IpAddr> {
    match *sa.get(1)? {
        AF_INET => {
            let octets: [u8; 4] = sa.get(4..8)?.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        AF_INET6 => {
            let octets: [u8; 16] = sa.get(8..24)?.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Netmask records are often truncated to their significant bytes, so
/// missing trailing bytes read as zero.
fn parse_netmask(sa: &[u8], family: u8) -> Option<String> {
    fn copy_bytes<const N: usize>(sa: &[u8], offset: usize) -> [u8; N] {
        let mut octets = [0u8; N];
        if let Some(available) = sa.get(offset..) {
            let n = available.len().min(N);
            octets[..n].copy_from_slice(&available[..n]);
        }
        octets
    }

    match family {
        AF_INET => Some(Ipv4Addr::from(copy_bytes::<4>(sa, 4)).to_string()),
        AF_INET6 => Some(Ipv6Addr::from(copy_bytes::<16>(sa, 8)).to_string()),
        _ => None,
    }
}
