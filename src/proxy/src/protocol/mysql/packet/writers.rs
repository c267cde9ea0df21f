use crate::protocol::mysql::basic::{OkPacket, ServerGreeting};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use tokio::io::AsyncWrite;

/// Post-handshake error payload, for callers that frame it themselves.
pub fn err_payload(err: ErrorKind, msg: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&(err as u16).to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(err.sqlstate());
    out.extend_from_slice(msg.as_bytes());
    out
}

/// Post-handshake error: `0xff || code(2) || '#' || sqlstate(5) || msg`.
pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Pre-handshake error in the legacy 3.21 layout: no sqlstate marker. The
/// caller reports these with sqlstate 08004 in its own diagnostics.
pub async fn write_pre_handshake_err_packet<W: AsyncWrite + Unpin>(
    code: u16,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(code)?;
    w.write_all(msg)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_eof_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_all(&[0xfe, 0x00, 0x00])?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.end_packet().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    client_capabilities: CapabilityFlags,
    ok_packet: OkPacket,
) -> io::Result<()> {
    w.write_u8(ok_packet.header)?;
    w.write_lenenc_int(ok_packet.affected_rows)?;
    w.write_lenenc_int(ok_packet.last_insert_id)?;
    if client_capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
        w.write_u16::<LittleEndian>(ok_packet.warnings)?;
    } else if client_capabilities.contains(CapabilityFlags::CLIENT_TRANSACTIONS) {
        w.write_u16::<LittleEndian>(ok_packet.status_flags.bits())?;
    }

    if client_capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
        w.write_lenenc_str(ok_packet.info.as_bytes())?;
        if ok_packet
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED)
        {
            w.write_lenenc_str(ok_packet.session_state_info.as_bytes())?;
        }
    } else {
        w.write_all(ok_packet.info.as_bytes())?;
    }
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_server_greeting<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    greeting: &ServerGreeting,
) -> io::Result<()> {
    w.write_all(&greeting.encode())?;
    w.end_packet().await?;
    w.flush_all().await
}

/// AuthSwitchRequest: `0xfe || plugin NUL || nonce NUL`.
pub async fn write_auth_switch_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    plugin_name: &[u8],
    nonce: &[u8],
) -> io::Result<()> {
    w.write_u8(0xfe)?;
    w.write_all(plugin_name)?;
    w.write_u8(0x00)?;
    w.write_all(nonce)?;
    w.write_u8(0x00)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// AuthMoreData: `0x01 || data` (caching-sha2 tags, public keys).
pub async fn write_auth_more_data<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    data: &[u8],
) -> io::Result<()> {
    w.write_u8(0x01)?;
    w.write_all(data)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// Bare auth data, e.g. a scramble or a NUL-terminated cleartext password.
pub async fn write_auth_data<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    data: &[u8],
) -> io::Result<()> {
    w.write_all(data)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_quit<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    w.reset_seq();
    w.write_u8(CommandCode::ComQuit as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn err_packet_layout() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(2);
        write_err_packet(ErrorKind::ER_ACCESS_DENIED_ERROR, b"denied", &mut writer)
            .await
            .unwrap();
        let bytes = writer.inner_writer;
        // header
        assert_eq!(&bytes[..4], &[15, 0, 0, 2]);
        // 0xff code '#' sqlstate msg
        assert_eq!(bytes[4], 0xff);
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 1045);
        assert_eq!(bytes[7], b'#');
        assert_eq!(&bytes[8..13], b"28000");
        assert_eq!(&bytes[13..], b"denied");
    }

    #[tokio::test]
    async fn pre_handshake_err_has_no_sqlstate() {
        let mut writer = PacketWriter::new(Vec::new());
        write_pre_handshake_err_packet(1043, b"bad handshake", &mut writer)
            .await
            .unwrap();
        let bytes = writer.inner_writer;
        assert_eq!(bytes[4], 0xff);
        assert_eq!(u16::from_le_bytes([bytes[5], bytes[6]]), 1043);
        assert_eq!(&bytes[7..], b"bad handshake");
    }

    #[tokio::test]
    async fn quit_is_single_byte() {
        let mut writer = PacketWriter::new(Vec::new());
        write_quit(&mut writer).await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x01, 0, 0, 0, 0x01]);
    }

    #[tokio::test]
    async fn auth_switch_layout() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(2);
        write_auth_switch_request(&mut writer, b"mysql_native_password", &[7u8; 20])
            .await
            .unwrap();
        let bytes = writer.inner_writer;
        assert_eq!(bytes[4], 0xfe);
        assert_eq!(&bytes[5..26], b"mysql_native_password");
        assert_eq!(bytes[26], 0);
        assert_eq!(&bytes[27..47], &[7u8; 20]);
        assert_eq!(bytes[47], 0);
    }
}
