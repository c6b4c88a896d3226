//! VLESS request framing
//!
//! ```text
//! +---------+-----------+-----------+-------+---------+------+------+---------+
//! | version | user id   | addon len | addon | command | port | atyp | address |
//! | 1       | 16        | 1         | n     | 1       | 2 BE | 1    | var     |
//! +---------+-----------+-----------+-------+---------+------+------+---------+
//! ```
//!
//! Everything after the address is payload. The server answers with
//! `[version, 0]` before relaying backend bytes.

use super::address::{AddressCodes, decode_host, encode_host, need};
use super::{Command, ConnectionRequest, Credential, Framer, ProtocolKind};
use crate::common::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use uuid::Uuid;

/// The only version accepted on the wire
pub const VERSION: u8 = 0;

const COMMAND_TCP: u8 = 1;
const COMMAND_UDP: u8 = 2;
const COMMAND_MUX: u8 = 3;

const CODES: AddressCodes = AddressCodes {
    ipv4: 1,
    domain: 2,
    ipv6: 3,
};

const RESPONSE: [u8; 2] = [VERSION, 0];

/// Framer for protocol A
#[derive(Debug, Clone, Copy, Default)]
pub struct Vless;

impl Framer for Vless {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Vless
    }

    fn parse(&self, buf: &[u8]) -> Result<ConnectionRequest, FrameError> {
        let mut cursor = Cursor::new(buf);

        need(&cursor, 1)?;
        let version = cursor.get_u8();
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }

        need(&cursor, 16)?;
        let mut id = [0u8; 16];
        cursor.copy_to_slice(&mut id);

        // Addons (flow control hints) are not interpreted
        need(&cursor, 1)?;
        let addon_len = cursor.get_u8() as usize;
        need(&cursor, addon_len)?;
        cursor.advance(addon_len);

        need(&cursor, 1)?;
        let command = match cursor.get_u8() {
            COMMAND_TCP => Command::Connect,
            COMMAND_UDP => Command::Associate,
            COMMAND_MUX => {
                return Err(FrameError::Malformed("mux command is not supported".into()));
            }
            other => return Err(FrameError::Malformed(format!("unknown command {other}"))),
        };

        need(&cursor, 3)?;
        let port = cursor.get_u16();
        let address_type = cursor.get_u8();
        let host = decode_host(&mut cursor, address_type, CODES)?;

        let header_len = usize::try_from(cursor.position())
            .map_err(|_| FrameError::Malformed("header offset overflow".into()))?;

        Ok(ConnectionRequest {
            protocol: ProtocolKind::Vless,
            credential: Credential::Uuid(Uuid::from_bytes(id)),
            target: super::TargetAddr::new(host, port),
            command,
            leftover: Bytes::copy_from_slice(&buf[header_len..]),
        })
    }

    fn encode(&self, request: &ConnectionRequest) -> Result<BytesMut, FrameError> {
        let Credential::Uuid(id) = &request.credential else {
            return Err(FrameError::Malformed(
                "VLESS requests carry a UUID credential".into(),
            ));
        };

        let mut out = BytesMut::with_capacity(22 + 256);
        out.put_u8(VERSION);
        out.put_slice(id.as_bytes());
        out.put_u8(0);
        out.put_u8(match request.command {
            Command::Connect => COMMAND_TCP,
            Command::Associate => COMMAND_UDP,
        });
        out.put_u16(request.target.port);
        encode_host(&request.target.host, CODES, &mut out)?;
        Ok(out)
    }

    fn response_header(&self) -> &'static [u8] {
        &RESPONSE
    }
}
