//! Trojan request framing
//!
//! ```text
//! +-----------------------+------+---------+------+---------+------+------+
//! | hex(SHA224(password)) | CRLF | command | atyp | address | port | CRLF |
//! | 56                    | 2    | 1       | 1    | var     | 2 BE | 2    |
//! +-----------------------+------+---------+------+---------+------+------+
//! ```
//!
//! Address types follow SOCKS5: 1 = IPv4, 3 = domain, 4 = IPv6.

use super::address::{AddressCodes, decode_host, encode_host, need};
use super::{Command, ConnectionRequest, Credential, Framer, ProtocolKind, TargetAddr};
use crate::common::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha224};
use std::io::Cursor;

/// Length of the hex encoded SHA-224 digest
pub const HASH_LEN: usize = 56;

const CRLF: &[u8; 2] = b"\r\n";

const COMMAND_CONNECT: u8 = 1;
const COMMAND_UDP_ASSOCIATE: u8 = 3;

const CODES: AddressCodes = AddressCodes {
    ipv4: 1,
    domain: 3,
    ipv6: 4,
};

/// Hex digest a password is carried as on the wire
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

fn expect_crlf(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<(), FrameError> {
    need(cursor, 2)?;
    let mut pair = [0u8; 2];
    cursor.copy_to_slice(&mut pair);
    if &pair == CRLF {
        Ok(())
    } else {
        Err(FrameError::Malformed(format!("expected CRLF after {what}")))
    }
}

/// Framer for protocol B
#[derive(Debug, Clone, Copy, Default)]
pub struct Trojan;

impl Framer for Trojan {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Trojan
    }

    fn parse(&self, buf: &[u8]) -> Result<ConnectionRequest, FrameError> {
        // Reject non-hex input as soon as it shows up, even in a partial read
        let available = buf.len().min(HASH_LEN);
        if !buf[..available].iter().all(u8::is_ascii_hexdigit) {
            return Err(FrameError::Malformed(
                "credential is not a hex digest".into(),
            ));
        }

        let mut cursor = Cursor::new(buf);
        need(&cursor, HASH_LEN)?;
        let mut digest = [0u8; HASH_LEN];
        cursor.copy_to_slice(&mut digest);
        let digest = String::from_utf8_lossy(&digest).to_ascii_lowercase();

        expect_crlf(&mut cursor, "credential")?;

        need(&cursor, 2)?;
        let command = match cursor.get_u8() {
            COMMAND_CONNECT => Command::Connect,
            COMMAND_UDP_ASSOCIATE => Command::Associate,
            other => return Err(FrameError::Malformed(format!("unknown command {other}"))),
        };
        let address_type = cursor.get_u8();
        let host = decode_host(&mut cursor, address_type, CODES)?;

        need(&cursor, 2)?;
        let port = cursor.get_u16();

        expect_crlf(&mut cursor, "request")?;

        let header_len = usize::try_from(cursor.position())
            .map_err(|_| FrameError::Malformed("header offset overflow".into()))?;

        Ok(ConnectionRequest {
            protocol: ProtocolKind::Trojan,
            credential: Credential::PasswordHash(digest),
            target: TargetAddr::new(host, port),
            command,
            leftover: Bytes::copy_from_slice(&buf[header_len..]),
        })
    }

    fn encode(&self, request: &ConnectionRequest) -> Result<BytesMut, FrameError> {
        let digest = match &request.credential {
            Credential::PasswordHash(hash)
                if hash.len() == HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit()) =>
            {
                hash.to_ascii_lowercase()
            }
            Credential::Token(password) => password_hash(password),
            _ => {
                return Err(FrameError::Malformed(
                    "Trojan requests carry a password digest".into(),
                ));
            }
        };

        let mut out = BytesMut::with_capacity(HASH_LEN + 10 + 256);
        out.put_slice(digest.as_bytes());
        out.put_slice(CRLF);
        out.put_u8(match request.command {
            Command::Connect => COMMAND_CONNECT,
            Command::Associate => COMMAND_UDP_ASSOCIATE,
        });
        encode_host(&request.target.host, CODES, &mut out)?;
        out.put_u16(request.target.port);
        out.put_slice(CRLF);
        Ok(out)
    }
}
