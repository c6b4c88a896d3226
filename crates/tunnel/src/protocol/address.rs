//! Destination address encoding shared by the framers
//!
//! Both protocols carry a one byte address type followed by the address, but
//! they disagree on the type codes, so each framer passes its own
//! [`AddressCodes`].

use crate::common::error::FrameError;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::io::Cursor;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Address type codes used by one protocol
#[derive(Debug, Clone, Copy)]
pub struct AddressCodes {
    pub ipv4: u8,
    pub domain: u8,
    pub ipv6: u8,
}

/// Destination host as carried in a request header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{ip}"),
            Host::Ipv6(ip) => write!(f, "[{ip}]"),
            Host::Domain(name) => f.write_str(name),
        }
    }
}

/// Destination host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    pub host: Host,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self::new(Host::Domain(name.into()), port)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Fail with `Truncated` unless `n` more bytes are available
pub(crate) fn need(cursor: &Cursor<&[u8]>, n: usize) -> Result<(), FrameError> {
    if cursor.remaining() < n {
        Err(FrameError::Truncated)
    } else {
        Ok(())
    }
}

/// Decode the host that follows an address type byte
///
/// Domains carry a one byte length prefix in both protocols.
pub(crate) fn decode_host(
    cursor: &mut Cursor<&[u8]>,
    address_type: u8,
    codes: AddressCodes,
) -> Result<Host, FrameError> {
    if address_type == codes.ipv4 {
        need(cursor, 4)?;
        Ok(Host::Ipv4(Ipv4Addr::from(cursor.get_u32())))
    } else if address_type == codes.ipv6 {
        need(cursor, 16)?;
        Ok(Host::Ipv6(Ipv6Addr::from(cursor.get_u128())))
    } else if address_type == codes.domain {
        need(cursor, 1)?;
        let len = cursor.get_u8() as usize;
        if len == 0 {
            return Err(FrameError::Malformed("empty domain name".into()));
        }
        need(cursor, len)?;

        let mut name = vec![0u8; len];
        cursor.copy_to_slice(&mut name);
        String::from_utf8(name)
            .map(Host::Domain)
            .map_err(|_| FrameError::Malformed("domain name is not valid UTF-8".into()))
    } else {
        Err(FrameError::UnsupportedAddressType(address_type))
    }
}

/// Append the address type byte and host
pub(crate) fn encode_host(
    host: &Host,
    codes: AddressCodes,
    out: &mut BytesMut,
) -> Result<(), FrameError> {
    match host {
        Host::Ipv4(ip) => {
            out.put_u8(codes.ipv4);
            out.put_slice(&ip.octets());
        }
        Host::Ipv6(ip) => {
            out.put_u8(codes.ipv6);
            out.put_slice(&ip.octets());
        }
        Host::Domain(name) => {
            let len = u8::try_from(name.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| {
                    FrameError::Malformed(format!("domain length {} out of range", name.len()))
                })?;
            out.put_u8(codes.domain);
            out.put_u8(len);
            out.put_slice(name.as_bytes());
        }
    }
    Ok(())
}
