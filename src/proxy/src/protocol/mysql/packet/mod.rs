pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

use winnow::binary::le_u24;
use winnow::error::{ContextError, ErrMode, ErrorKind, ParserError};
use winnow::token::take;
use winnow::Parser;

pub type IResult<I, O> = Result<(I, O), ErrMode<ContextError>>;

/// A reassembled protocol message: the payload of one frame, or of a
/// `0xFFFFFF` continuation chain. The 16M split is re-applied on write.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet(Vec<u8>);

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet(vec)
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.0.extend(bytes);
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() <= 5
    }

    /// Ok packet after a result set when CLIENT_DEPRECATE_EOF is on: header
    /// 0xfe but length outside the EOF range.
    pub fn is_result_set_eof_packet(&self) -> bool {
        !self.0.is_empty()
            && self.0[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&self.0.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_auth_more_data(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::AuthMoreDataHeader as u8)
    }

    /// AuthSwitchRequest shares 0xfe with EOF; length disambiguates.
    pub fn is_auth_switch_request(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::EOFHeader as u8) && self.0.len() > 5
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.0.is_empty() && self.0[0] == (HeaderInfo::LocalInFileHeader as u8)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

/// One frame: `len(3 LE) || seq(1) || payload(len)`.
#[inline]
pub fn one_packet(i: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (i, length) = le_u24.parse_peek(i)?;
    let (i, seq) = take(1u8).parse_peek(i)?;
    let (i, bytes) = take(length).parse_peek(i)?;
    Ok((i, (seq[0], bytes)))
}

/// A full message: any number of `0xFFFFFF` continuation frames followed by
/// the closing short frame. Returns the seq-id of the last frame.
pub fn packet(i: &[u8]) -> IResult<&[u8], (u8, Packet)> {
    let mut rest = i;
    let mut assembled: Option<(u8, Packet)> = None;
    loop {
        let (r, (seq, payload)) = one_packet(rest)?;
        let is_full = payload.len() == constants::MAX_PAYLOAD_LEN;
        match &mut assembled {
            Some((prev_seq, pkt)) => {
                if seq != prev_seq.wrapping_add(1) {
                    // continuation frames must be seq-contiguous.
                    return Err(ErrMode::Cut(ContextError::from_error_kind(
                        &rest,
                        ErrorKind::Verify,
                    )));
                }
                *prev_seq = seq;
                pkt.extend(payload);
            }
            None => {
                assembled = Some((seq, Packet(payload.to_vec())));
            }
        }
        rest = r;
        if !is_full {
            let (seq, pkt) = assembled.expect("assembled after at least one frame");
            return Ok((rest, (seq, pkt)));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::packet::*;

    #[test]
    fn test_one_ping() {
        let one_pkg_rs = one_packet(&[0x01, 0, 0, 0, 0x10]);
        assert!(one_pkg_rs.is_ok());
        let pkg = one_pkg_rs.unwrap().1;
        assert_eq!(pkg.1, &[0x10]);
    }

    #[test]
    fn test_ping() {
        let p = packet(&[0x01, 0, 0, 0, 0x10]).unwrap().1;
        assert_eq!(p.0, 0);
        assert_eq!(&*p.1, &[0x10][..]);
    }

    #[test]
    fn test_incomplete_needs_more() {
        assert!(packet(&[0x05, 0, 0, 0, 0x10]).is_err());
    }

    #[test]
    fn test_long_exact() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x00);
        data.push(0x00);
        data.push(0x00);
        data.push(1);

        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_long_more() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x01);
        data.push(0x00);
        data.push(0x00);
        data.push(1);
        data.push(0x10);

        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN + 1);
        assert_eq!(
            &p.1[..constants::MAX_PAYLOAD_LEN],
            &[0; constants::MAX_PAYLOAD_LEN][..]
        );
        assert_eq!(&p.1[constants::MAX_PAYLOAD_LEN..], &[0x10]);
    }

    #[test]
    fn test_continuation_seq_gap_is_fatal() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x00);
        data.push(0x00);
        data.push(0x00);
        data.push(3); // expected seq 1

        match packet(&data[..]) {
            Err(ErrMode::Cut(_)) => {}
            other => panic!("expected hard error, got {other:?}"),
        }
    }

    #[test]
    fn test_seq_wraps() {
        let data = [0x01, 0, 0, 0xff, 0x10];
        let (_, (seq, _)) = packet(&data[..]).unwrap();
        assert_eq!(seq, 0xff);
    }
}
