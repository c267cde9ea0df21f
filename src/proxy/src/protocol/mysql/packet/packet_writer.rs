use crate::protocol::mysql::constants;
use byteorder::{ByteOrder, LittleEndian};

use pin_project::pin_project;
use std::io;
use std::io::prelude::*;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one outgoing message, then frames it on `end_packet`: the payload
/// is split at MAX_PAYLOAD_LEN boundaries and each frame gets the next
/// seq-id. An exact-16M payload is closed with an empty terminator frame.
#[pin_project]
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    #[pin]
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Gives the transport back. Must only be called between messages.
    pub fn into_inner(self) -> io::Result<W> {
        if !self.buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsent bytes in packet buffer",
            ));
        }
        Ok(self.inner_writer)
    }
}

impl<W: AsyncWrite> AsyncWrite for PacketWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().inner_writer, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(self.project().inner_writer, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        AsyncWrite::poll_shutdown(self.project().inner_writer, cx)
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        let raw_packet = self.take_buffer();

        let mut chunks = raw_packet.chunks(constants::MAX_PAYLOAD_LEN);
        let mut needs_terminator = true;
        loop {
            let chunk = match chunks.next() {
                Some(chunk) => chunk,
                // an empty message, or an exact-multiple payload, still needs
                // a closing frame.
                None if needs_terminator => &[][..],
                None => break,
            };
            needs_terminator = chunk.len() == constants::MAX_PAYLOAD_LEN;

            LittleEndian::write_u24(&mut header, chunk.len() as u32);
            header[3] = self.seq();
            self.increase_seq();

            // depending on the AsyncWrite provided, this may trigger a real
            // system call or not (e.g. if AsyncWrite is a buffered stream).
            let written = self
                .inner_writer
                .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                .await?;

            // if the vectored write was short, fall back to write_all.
            if written != constants::PACKET_HEADER_LEN + chunk.len() {
                let remaining: Vec<u8> = header
                    .iter()
                    .chain(chunk.iter())
                    .skip(written)
                    .cloned()
                    .collect();
                self.inner_writer.write_all(&remaining).await?;
            }
            if chunk.is_empty() {
                break;
            }
        }
        Ok(())
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;
    use crate::protocol::mysql::packet::packet;

    #[tokio::test]
    async fn frames_one_message() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(1);
        std::io::Write::write_all(&mut writer, &[0x10]).unwrap();
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x01, 0, 0, 1, 0x10]);
        assert_eq!(writer.seq(), 2);
    }

    #[tokio::test]
    async fn empty_payload_still_framed() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(3);
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x00, 0, 0, 3]);
    }

    #[tokio::test]
    async fn seq_wraps_mod_256() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(0xff);
        std::io::Write::write_all(&mut writer, &[0xaa]).unwrap();
        writer.end_packet().await.unwrap();
        std::io::Write::write_all(&mut writer, &[0xbb]).unwrap();
        writer.end_packet().await.unwrap();
        assert_eq!(
            writer.inner_writer,
            vec![0x01, 0, 0, 0xff, 0xaa, 0x01, 0, 0, 0x00, 0xbb]
        );
    }

    #[tokio::test]
    async fn splits_large_payload_with_terminator() {
        let mut writer = PacketWriter::new(Vec::new());
        std::io::Write::write_all(&mut writer, &vec![0x61; MAX_PAYLOAD_LEN]).unwrap();
        writer.end_packet().await.unwrap();

        // exactly 16M-1 payload: one full frame plus the empty terminator.
        let bytes = &writer.inner_writer;
        assert_eq!(bytes.len(), 4 + MAX_PAYLOAD_LEN + 4);
        assert_eq!(&bytes[..4], &[0xff, 0xff, 0xff, 0x00]);
        assert_eq!(&bytes[4 + MAX_PAYLOAD_LEN..], &[0x00, 0x00, 0x00, 0x01]);

        // and the reader reassembles it back.
        let (rest, (seq, pkt)) = packet(bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN);
    }
}
