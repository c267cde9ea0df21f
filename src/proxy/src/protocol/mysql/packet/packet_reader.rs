use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use winnow::error::ErrMode;

use tokio::io::{AsyncRead, AsyncReadExt};

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("Router read pkt err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// Reads bytes from an async transport and reassembles them into protocol
/// [`Packet`]s, buffering partial frames between calls.
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    start: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            start: 0,
            r,
        }
    }

    /// Bytes buffered but not yet consumed by a frame.
    pub fn pending(&self) -> usize {
        self.bytes.len() - self.start
    }

    /// Gives the transport back. Must only be called between messages.
    pub fn into_inner(self) -> io::Result<R> {
        if self.pending() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} unconsumed bytes in packet buffer", self.pending()),
            ));
        }
        Ok(self.r)
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Ensures a full message is buffered, then pops it. `Ok(None)` is a
    /// clean EOF on a message boundary.
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if self.pending() != 0 {
                let buffered = self.bytes.len() - self.start;
                match packet(&self.bytes[self.start..]) {
                    Ok((rest, msg)) => {
                        let consumed = buffered - rest.len();
                        self.start += consumed;
                        if self.start == self.bytes.len() {
                            self.bytes.clear();
                            self.start = 0;
                        }
                        return Ok(Some(msg));
                    }
                    // not enough bytes buffered for the frame yet.
                    Err(ErrMode::Incomplete(_)) | Err(ErrMode::Backtrack(_)) => {}
                    Err(ErrMode::Cut(ctx)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{ctx:?}"),
                        ));
                    }
                }
            }

            // we need to read some more.
            self.bytes.drain(0..self.start);
            self.start = 0;
            let end = self.bytes.len();
            self.bytes.resize(std::cmp::max(end + buffer_size, end * 2), 0);
            let read = self.r.read(&mut self.bytes[end..]).await?;
            self.bytes.truncate(end + read);
            // use a larger buffer size to reduce resize churn on big rows.
            buffer_size = PACKET_LARGE_BUFFER_SIZE;
            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.bytes.len()),
                ));
            }
        }
    }

    /// Ensures the frame header plus the first payload byte are buffered and
    /// returns that type byte without consuming anything. `Ok(None)` for an
    /// empty-payload frame.
    pub async fn peek_msg_type(&mut self) -> io::Result<Option<u8>> {
        loop {
            let buffered = &self.bytes[self.start..];
            if buffered.len() >= 4 {
                let payload_len =
                    u32::from_le_bytes([buffered[0], buffered[1], buffered[2], 0]) as usize;
                if payload_len == 0 {
                    return Ok(None);
                }
                if buffered.len() >= 5 {
                    return Ok(Some(buffered[4]));
                }
            }

            self.bytes.drain(0..self.start);
            self.start = 0;
            let end = self.bytes.len();
            self.bytes.resize(end + PACKET_BUFFER_SIZE, 0);
            let read = self.r.read(&mut self.bytes[end..]).await?;
            self.bytes.truncate(end + read);
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message prefix",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;

    #[tokio::test]
    async fn reads_single_frame() {
        let bytes: &[u8] = &[0x01, 0, 0, 0, 0x10];
        let mut reader = PacketReader::new(bytes);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x10]);
        assert!(reader.next_async().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_back_to_back_frames() {
        let bytes: &[u8] = &[0x01, 0, 0, 0, 0x10, 0x02, 0, 0, 1, 0xaa, 0xbb];
        let mut reader = PacketReader::new(bytes);
        let (seq1, pkt1) = reader.next_async().await.unwrap().unwrap();
        assert_eq!((seq1, &*pkt1), (0, &[0x10][..]));
        let (seq2, pkt2) = reader.next_async().await.unwrap().unwrap();
        assert_eq!((seq2, &*pkt2), (1, &[0xaa, 0xbb][..]));
    }

    #[tokio::test]
    async fn reassembles_continuation() {
        let mut bytes = vec![0xff, 0xff, 0xff, 0x02];
        bytes.extend(std::iter::repeat(0x61).take(MAX_PAYLOAD_LEN));
        bytes.extend([0x01, 0x00, 0x00, 0x03, 0x62]);
        let mut reader = PacketReader::new(&bytes[..]);
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 3);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(pkt[MAX_PAYLOAD_LEN], 0x62);
    }

    #[tokio::test]
    async fn truncated_frame_is_unexpected_eof() {
        let bytes: &[u8] = &[0x05, 0, 0, 0, 0x10];
        let mut reader = PacketReader::new(bytes);
        let err = reader.next_async().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let bytes: &[u8] = &[0x01, 0, 0, 0, 0x10];
        let mut reader = PacketReader::new(bytes);
        assert_eq!(reader.peek_msg_type().await.unwrap(), Some(0x10));
        let (_, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(&*pkt, &[0x10]);
    }

    #[tokio::test]
    async fn peek_empty_payload() {
        let bytes: &[u8] = &[0x00, 0, 0, 0x02];
        let mut reader = PacketReader::new(bytes);
        assert_eq!(reader.peek_msg_type().await.unwrap(), None);
    }
}
