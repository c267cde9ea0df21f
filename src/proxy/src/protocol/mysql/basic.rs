use crate::protocol::mysql::constants::{
    AUTH_PLUGIN_DATA_PART_1_LENGTH, PROTOCOL_VERSION, SCRAMBLE_SIZE,
};

use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::Write;
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information
    pub session_state_info: String,
}

/// The alternating key/value var-string list carried in the
/// connect-attributes blob. Kept raw so a blob the router cannot decode is
/// still forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectAttributes(Vec<u8>);

impl ConnectAttributes {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the list. Fails on a dangling key or trailing garbage.
    pub fn verify(&self) -> Result<Vec<(String, String)>, std::io::Error> {
        let mut out = Vec::new();
        let mut input = &self.0[..];
        while !input.is_empty() {
            let (rest, key) = read_length_encoded_string(input).map_err(invalid_attrs)?;
            let (rest, value) = read_length_encoded_string(rest).map_err(invalid_attrs)?;
            out.push((
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            ));
            input = rest;
        }
        Ok(out)
    }

    pub fn append(&mut self, key: &str, value: &str) {
        let mut w = Vec::new();
        let _ = w.write_lenenc_str(key.as_bytes());
        let _ = w.write_lenenc_str(value.as_bytes());
        self.0.extend_from_slice(&w);
    }
}

/// COM_CHANGE_USER: `0x11 || user NUL || auth-data || schema NUL ||
/// charset(2) || auth-plugin NUL || attributes blob`, capability-dependent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeUserRequest {
    pub username: Vec<u8>,
    pub auth_response: Vec<u8>,
    pub schema: Option<Vec<u8>>,
    pub collation: u16,
    pub auth_plugin: Vec<u8>,
    pub connect_attributes: Option<ConnectAttributes>,
}

impl ChangeUserRequest {
    pub fn encode(&self, capabilities: CapabilityFlags) -> Vec<u8> {
        let mut out = vec![0x11];
        out.extend_from_slice(&self.username);
        out.push(0);

        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let _ = out.write_lenenc_str(&self.auth_response);
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            out.push(self.auth_response.len() as u8);
            out.extend_from_slice(&self.auth_response);
        } else {
            out.extend_from_slice(&self.auth_response);
            out.push(0);
        }

        out.extend_from_slice(self.schema.as_deref().unwrap_or_default());
        out.push(0);
        out.extend_from_slice(&self.collation.to_le_bytes());
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            out.extend_from_slice(&self.auth_plugin);
            out.push(0);
        }
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            let attrs = self
                .connect_attributes
                .as_ref()
                .map(|a| a.as_bytes())
                .unwrap_or_default();
            let _ = out.write_lenenc_str(attrs);
        }
        out
    }
}

pub fn change_user_request(
    i: &[u8],
    capabilities: CapabilityFlags,
) -> IResult<&[u8], ChangeUserRequest> {
    let (i, _cmd) = literal([0x11]).parse_peek(i)?;
    let (i, username) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;

    let (i, auth_response) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            read_length_encoded_string(i)?
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let (i, len) = le_u8.parse_peek(i)?;
            take(len).parse_peek(i)?
        } else {
            let (i, auth) = take_until(0.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, auth)
        };

    let (i, schema) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;

    let (i, collation) = if i.len() >= 2 {
        le_u16.parse_peek(i)?
    } else {
        (i, 0)
    };

    let (i, auth_plugin) =
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, plugin) = take_until(0.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, plugin)
        } else {
            (i, &b""[..])
        };

    let (i, connect_attributes) =
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
            let (i, len) = read_length_encoded_number(i)?;
            let (i, blob) = take(len).parse_peek(i)?;
            (i, Some(ConnectAttributes::from_raw(blob.to_vec())))
        } else {
            (i, None)
        };

    Ok((
        i,
        ChangeUserRequest {
            username: username.to_vec(),
            auth_response: auth_response.to_vec(),
            schema: if schema.is_empty() {
                None
            } else {
                Some(schema.to_vec())
            },
            collation,
            auth_plugin: auth_plugin.to_vec(),
            connect_attributes,
        },
    ))
}

fn invalid_attrs<E: std::fmt::Debug>(e: E) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed connection attributes: {e:?}"),
    )
}

/// The client's reply to the server greeting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<ConnectAttributes>,
}

impl HandshakeResponse {
    pub fn db_user_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }

    /// A short-form response carrying only caps + max-packet + collation:
    /// the TLS upgrade request that precedes the real greeting.
    pub fn is_ssl_request(&self) -> bool {
        self.username.is_none() && self.client_flag.contains(CapabilityFlags::CLIENT_SSL)
    }

    pub fn attributes_map(&self) -> Option<HashMap<String, String>> {
        self.connect_attributes
            .as_ref()
            .and_then(|attrs| attrs.verify().ok())
            .map(|kvs| kvs.into_iter().collect())
    }
}

/// The v10 server greeting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub version: Vec<u8>,
    pub connection_id: u32,
    pub capabilities: CapabilityFlags,
    pub collation: u8,
    pub status_flags: StatusFlags,
    /// nonce, trailing NUL stripped.
    pub auth_method_data: Vec<u8>,
    pub auth_method_name: Vec<u8>,
}

fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    std::str::from_utf8(session_state_info).unwrap_or("")
                } else {
                    ""
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_string(),
            )
        } else {
            (
                String::from_utf8_lossy(i).to_string(),
                "".to_string(),
            )
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

/// AuthSwitchRequest: `0xfe || plugin-name NUL || plugin-data`.
pub fn auth_switch_request(i: &[u8]) -> IResult<&[u8], (Vec<u8>, Vec<u8>)> {
    let (i, _) = literal([0xfe]).parse_peek(i)?;
    let (i, plugin_name) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let mut data = i.to_vec();
    // servers terminate the switch nonce with a NUL.
    if data.last() == Some(&0) {
        data.pop();
    }
    Ok((&b""[..], (plugin_name.to_vec(), data)))
}

pub fn server_greeting(i: &[u8]) -> IResult<&[u8], ServerGreeting> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, version) = take_until(0.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, connection_id) = le_u32.parse_peek(i)?;
    let (i, auth_data_1) = take(AUTH_PLUGIN_DATA_PART_1_LENGTH).parse_peek(i)?;
    let (i, _filler) = le_u8.parse_peek(i)?;
    let (i, caps_lo) = le_u16.parse_peek(i)?;
    let (i, collation) = le_u8.parse_peek(i)?;
    let (i, status_flags) = le_u16.parse_peek(i)?;
    let (i, caps_hi) = le_u16.parse_peek(i)?;
    let capabilities =
        CapabilityFlags::from_bits_truncate(((caps_hi as u32) << 16) | caps_lo as u32);
    let (i, auth_data_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let mut auth_method_data = auth_data_1.to_vec();
    let (i, auth_method_name) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION)
    {
        // rest-of-auth-plugin-data: max(13, auth_data_len - 8) bytes.
        let rest_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let (i, auth_data_2) = take(rest_len.min(i.len())).parse_peek(i)?;
        auth_method_data.extend_from_slice(auth_data_2);
        if auth_method_data.last() == Some(&0) {
            auth_method_data.pop();
        }
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let (i, name) = take_until(0.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, name.to_vec())
        } else {
            (i, Vec::new())
        }
    } else {
        (i, Vec::new())
    };

    Ok((
        i,
        ServerGreeting {
            protocol_version,
            version: version.to_vec(),
            connection_id,
            capabilities,
            collation,
            status_flags: StatusFlags::from_bits_truncate(status_flags),
            auth_method_data,
            auth_method_name,
        },
    ))
}

impl ServerGreeting {
    /// Encodes the greeting payload (no frame header).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(PROTOCOL_VERSION);
        out.extend_from_slice(&self.version);
        out.push(0);
        out.extend_from_slice(&self.connection_id.to_le_bytes());

        let mut nonce = self.auth_method_data.clone();
        nonce.resize(SCRAMBLE_SIZE, 0);
        out.extend_from_slice(&nonce[..AUTH_PLUGIN_DATA_PART_1_LENGTH]);
        out.push(0);

        let caps = self.capabilities.bits().to_le_bytes();
        out.extend_from_slice(&caps[..2]);
        out.push(self.collation);
        out.extend_from_slice(&self.status_flags.bits().to_le_bytes());
        out.extend_from_slice(&caps[2..4]);
        out.push((SCRAMBLE_SIZE + 1) as u8);
        out.extend_from_slice(&[0u8; 10]);
        out.extend_from_slice(&nonce[AUTH_PLUGIN_DATA_PART_1_LENGTH..]);
        out.push(0);
        if self
            .capabilities
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
        {
            out.extend_from_slice(&self.auth_method_name);
            out.push(0);
        }
        out
    }
}

pub fn client_handshake_response(
    i: &[u8],
    is_after_tls: bool,
) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse41
        let (i, cap2) = le_u16.parse_peek(i)?;
        let cap = (cap2 as u32) << 16 | capability_flags as u32;

        let capabilities = CapabilityFlags::from_bits_truncate(cap);

        let (i, max_packet_len) = le_u32.parse_peek(i)?;
        let (i, collation) = take(1u8).parse_peek(i)?;

        let (i, _) = take(23u8).parse_peek(i)?;

        if !is_after_tls && capabilities.contains(CapabilityFlags::CLIENT_SSL) && i.is_empty() {
            // short-form SSLRequest; the real response follows after the
            // TLS handshake.
            return Ok((
                i,
                HandshakeResponse {
                    client_flag: capabilities,
                    max_packet_len,
                    collation: u16::from(collation[0]),
                    username: None,
                    auth_response: vec![],
                    auth_plugin: vec![],
                    database: None,
                    connect_attributes: None,
                },
            ));
        }

        let (i, username) = {
            let (i, user) = take_until(0.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(user.to_owned()))
        };
        let (i, auth_response) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                let (i, size) = read_length_encoded_number(i)?;
                take(size).parse_peek(i)?
            } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let (i, size) = le_u8.parse_peek(i)?;
                take(size).parse_peek(i)?
            } else {
                let (i, auth) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;
                (i, auth)
            };

        let (i, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
                let (i, db) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;
                (i, Some(db))
            } else {
                (i, None)
            };

        let (i, auth_plugin) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
                let (i, auth_plugin) = take_until(0.., "\0").parse_peek(i)?;

                let (i, _) = literal("\0").parse_peek(i)?;
                (i, auth_plugin)
            } else {
                (i, &b""[..])
            };

        let (i, connect_attributes) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
                let (i, data_len) = read_length_encoded_number(i)?;
                let (i, data) = take(data_len).parse_peek(i)?;
                (i, Some(ConnectAttributes::from_raw(data.to_vec())))
            } else {
                (i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username,
                auth_response: auth_response.to_vec(),
                auth_plugin: auth_plugin.to_vec(),
                database: db.map(|c| c.to_vec()),
                connect_attributes,
            },
        ))
    } else {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(0.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;

        let (i, auth_response, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                let (i, auth_response) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                let (i, db) = take_until(0.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;

                (i, auth_response, Some(db))
            } else {
                (&b""[..], i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: auth_response.to_vec(),
                auth_plugin: vec![],
                database: db.map(|c| c.to_vec()),
                connect_attributes: None,
            },
        ))
    }
}

impl HandshakeResponse {
    /// Encodes the protocol-41 response payload with the given capability
    /// set (the server-leg shared caps may differ from the client's).
    pub fn encode(&self, capabilities: CapabilityFlags) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&capabilities.bits().to_le_bytes());
        out.extend_from_slice(&self.max_packet_len.to_le_bytes());
        out.push(self.collation as u8);
        out.extend_from_slice(&[0u8; 23]);

        out.extend_from_slice(self.username.as_deref().unwrap_or_default());
        out.push(0);

        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
            let _ = out.write_lenenc_str(&self.auth_response);
        } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            out.push(self.auth_response.len() as u8);
            let _ = out.write_all(&self.auth_response);
        } else {
            out.extend_from_slice(&self.auth_response);
            out.push(0);
        }

        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
            out.extend_from_slice(self.database.as_deref().unwrap_or_default());
            out.push(0);
        }
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            out.extend_from_slice(&self.auth_plugin);
            out.push(0);
        }
        if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
            if let Some(attrs) = &self.connect_attributes {
                let _ = out.write_lenenc_str(attrs.as_bytes());
            } else {
                let _ = out.write_lenenc_str(b"");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::charset::collation_names;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;

    #[tokio::test]
    pub async fn test_handshake_parse() {
        let bytes = &[
            0x5b, 0x00, 0x00, 0x01, 0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c,
            0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d,
            0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75,
            0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76,
            0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let mut packet_reader = PacketReader::new(&bytes[..]);
        let (seq, packet) = packet_reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 1);

        let handshake_rs = client_handshake_response(&packet, false);
        assert!(handshake_rs.is_ok());
        let handshake = handshake_rs.unwrap().1;
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(
            handshake.collation,
            *collation_names().get("utf8_general_ci").unwrap() as u16
        );
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.auth_plugin, b"mysql_native_password");
        assert_eq!(handshake.max_packet_len, 16777216);
    }

    #[tokio::test]
    pub async fn test_handshake_parse_ssl_request() {
        let binary = &[
            0x20, 0x00, 0x00, 0x01, 0x85, 0xae, 0x3f, 0x20, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut packet_reader = PacketReader::new(&binary[..]);
        let (_, packet) = packet_reader.next_async().await.unwrap().unwrap();
        let (_, handshake) = client_handshake_response(&packet, false).unwrap();
        assert!(handshake.client_flag.contains(CapabilityFlags::CLIENT_SSL));
        assert!(handshake.is_ssl_request());
        assert!(handshake.username.is_none());
    }

    #[test]
    fn greeting_round_trip() {
        let greeting = ServerGreeting {
            protocol_version: PROTOCOL_VERSION,
            version: b"8.4.0-router".to_vec(),
            connection_id: 42,
            capabilities: CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_SECURE_CONNECTION
                | CapabilityFlags::CLIENT_PLUGIN_AUTH,
            collation: 33,
            status_flags: StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            auth_method_data: (1..=20).collect(),
            auth_method_name: b"caching_sha2_password".to_vec(),
        };
        let encoded = greeting.encode();
        let (_, decoded) = server_greeting(&encoded).unwrap();
        assert_eq!(decoded, greeting);
    }

    #[test]
    fn greeting_decode_rejects_error_packet() {
        // a pre-handshake error packet starts with 0xff, never 0x0a; the
        // caller branches on the header, and the greeting decoder refuses
        // the malformed remainder.
        let bytes = [0xff, 0x15, 0x04, b'm', b's', b'g'];
        assert!(server_greeting(&bytes).is_err());
    }

    #[test]
    fn handshake_response_round_trip() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_ATTRS;
        let mut attrs = ConnectAttributes::default();
        attrs.append("_client_name", "libmysql");
        let response = HandshakeResponse {
            client_flag: caps,
            max_packet_len: 1 << 24,
            collation: 45,
            username: Some(b"app".to_vec()),
            auth_response: vec![0xaa; 20],
            auth_plugin: b"mysql_native_password".to_vec(),
            database: Some(b"sbtest".to_vec()),
            connect_attributes: Some(attrs),
        };
        let encoded = response.encode(caps);
        let (_, decoded) = client_handshake_response(&encoded, true).unwrap();
        assert_eq!(decoded.username, response.username);
        assert_eq!(decoded.auth_response, response.auth_response);
        assert_eq!(decoded.database, response.database);
        assert_eq!(decoded.auth_plugin, response.auth_plugin);
        assert_eq!(
            decoded.attributes_map().unwrap().get("_client_name"),
            Some(&"libmysql".to_string())
        );
    }

    #[test]
    fn attributes_verify_rejects_trailing_garbage() {
        let mut attrs = ConnectAttributes::default();
        attrs.append("k", "v");
        assert_eq!(attrs.verify().unwrap(), vec![("k".into(), "v".into())]);

        let mut raw = attrs.as_bytes().to_vec();
        raw.push(0x05); // dangling key length
        assert!(ConnectAttributes::from_raw(raw).verify().is_err());
    }

    #[test]
    fn change_user_round_trip() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_ATTRS;
        let mut attrs = ConnectAttributes::default();
        attrs.append("program_name", "mysql");
        let request = ChangeUserRequest {
            username: b"bob".to_vec(),
            auth_response: vec![0x5a; 20],
            schema: Some(b"orders".to_vec()),
            collation: 255,
            auth_plugin: b"mysql_native_password".to_vec(),
            connect_attributes: Some(attrs),
        };
        let encoded = request.encode(caps);
        assert_eq!(encoded[0], 0x11);
        let (rest, decoded) = change_user_request(&encoded, caps).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, request);
    }

    #[test]
    fn auth_switch_request_parse() {
        let mut payload = vec![0xfe];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(&[1u8; 20]);
        payload.push(0);
        let (_, (name, data)) = auth_switch_request(&payload).unwrap();
        assert_eq!(name, b"mysql_native_password");
        assert_eq!(data, vec![1u8; 20]);
    }

    #[test]
    fn ok_packet_with_session_track() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_SESSION_TRACK;
        // ok, 0 rows, 0 insert-id, SESSION_STATE_CHANGED|AUTOCOMMIT, 0 warnings,
        // empty info, one tracked system variable.
        let mut payload = vec![0x00, 0x00, 0x00];
        let status = StatusFlags::SERVER_STATUS_AUTOCOMMIT | StatusFlags::SERVER_SESSION_STATE_CHANGED;
        payload.extend_from_slice(&status.bits().to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload.push(0); // info
        let tracked = b"\x00\x0e\x0aautocommit\x02ON";
        payload.push(tracked.len() as u8);
        payload.extend_from_slice(tracked);

        let (_, ok) = ok_packet(&payload, caps).unwrap();
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED));
        assert!(ok.session_state_info.contains("autocommit"));
    }
}
