//! A duplex byte pipe with optional TLS.
//!
//! One channel per leg. The plaintext views are the packet reader/writer;
//! `is_tls` is tracked separately from handshake completion so that
//! PASSTHROUGH can mark a leg as TLS without the router driving any TLS
//! logic itself.

use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};

#[cfg(feature = "tls")]
use tokio_rustls::rustls;
#[cfg(feature = "tls")]
use tokio_rustls::rustls::pki_types::ServerName;
#[cfg(feature = "tls")]
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxedStream = Box<dyn Stream>;

pub enum MaybeTlsStream {
    Plain(BoxedStream),
    #[cfg(feature = "tls")]
    ServerTls(Box<tokio_rustls::server::TlsStream<BoxedStream>>),
    #[cfg(feature = "tls")]
    ClientTls(Box<tokio_rustls::client::TlsStream<BoxedStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            MaybeTlsStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Cipher and protocol version of a completed TLS handshake; injected into
/// the connection attributes forwarded to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub cipher: String,
    pub version: String,
}

struct ChannelIo {
    reader: PacketReader<ReadHalf<MaybeTlsStream>>,
    writer: PacketWriter<WriteHalf<MaybeTlsStream>>,
}

impl ChannelIo {
    fn new(stream: MaybeTlsStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: PacketReader::new(r),
            writer: PacketWriter::new(w),
        }
    }

    fn into_stream(self) -> io::Result<MaybeTlsStream> {
        let r = self.reader.into_inner()?;
        let w = self.writer.into_inner()?;
        Ok(r.unsplit(w))
    }
}

pub struct Channel {
    io: Option<ChannelIo>,
    is_tls: bool,
    tls_info: Option<TlsInfo>,
}

impl Channel {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            io: Some(ChannelIo::new(MaybeTlsStream::Plain(stream))),
            is_tls: false,
            tls_info: None,
        }
    }

    pub fn reader(&mut self) -> &mut PacketReader<ReadHalf<MaybeTlsStream>> {
        &mut self.io.as_mut().expect("channel io present").reader
    }

    pub fn writer(&mut self) -> &mut PacketWriter<WriteHalf<MaybeTlsStream>> {
        &mut self.io.as_mut().expect("channel io present").writer
    }

    pub async fn recv_msg(&mut self) -> io::Result<(u8, Packet)> {
        let (seq, pkt) = crate::async_packet_read!(self.reader());
        Ok((seq, pkt))
    }

    /// `is_tls` is independent of handshake completion: PASSTHROUGH marks
    /// both legs as TLS while the handshake runs end-to-end through us.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn mark_passthrough_tls(&mut self) {
        self.is_tls = true;
    }

    pub fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls_info.as_ref()
    }

    /// Recovers the underlying stream for raw forwarding. Fails if packet
    /// buffers are non-empty (mid-message).
    pub fn into_stream(mut self) -> io::Result<MaybeTlsStream> {
        self.io
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel already consumed"))?
            .into_stream()
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.writer().inner_writer.shutdown().await
    }

    #[cfg(feature = "tls")]
    pub async fn tls_accept(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let io = self
            .io
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel already consumed"))?;
        let stream = io.into_stream()?;
        let plain = match stream {
            MaybeTlsStream::Plain(s) => s,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "channel is already TLS",
                ))
            }
        };
        let tls_stream = acceptor.accept(plain).await?;
        self.tls_info = Some(tls_info_of(tls_stream.get_ref().1));
        self.io = Some(ChannelIo::new(MaybeTlsStream::ServerTls(Box::new(
            tls_stream,
        ))));
        self.is_tls = true;
        Ok(())
    }

    #[cfg(feature = "tls")]
    pub async fn tls_connect(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> io::Result<()> {
        let io = self
            .io
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "channel already consumed"))?;
        let stream = io.into_stream()?;
        let plain = match stream {
            MaybeTlsStream::Plain(s) => s,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "channel is already TLS",
                ))
            }
        };
        let tls_stream = connector.connect(server_name, plain).await?;
        self.tls_info = Some(tls_info_of(tls_stream.get_ref().1));
        self.io = Some(ChannelIo::new(MaybeTlsStream::ClientTls(Box::new(
            tls_stream,
        ))));
        self.is_tls = true;
        Ok(())
    }
}

#[cfg(feature = "tls")]
fn tls_info_of(conn: &rustls::CommonState) -> TlsInfo {
    let cipher = conn
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_default();
    let version = match conn.protocol_version() {
        Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
        Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
        Some(other) => format!("{other:?}"),
        None => String::new(),
    };
    TlsInfo { cipher, version }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn plain_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = Channel::new(Box::new(client));
        let mut b = Channel::new(Box::new(server));

        a.writer().set_seq(0);
        a.writer().write_all(&[0x03, b'S', b'E', b'L']).unwrap();
        a.writer().end_packet().await.unwrap();
        a.writer().flush_all().await.unwrap();

        let (seq, pkt) = b.recv_msg().await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x03, b'S', b'E', b'L']);
        assert!(!b.is_tls());
    }

    #[tokio::test]
    async fn passthrough_marks_tls_without_handshake() {
        let (client, _server) = tokio::io::duplex(64);
        let mut channel = Channel::new(Box::new(client));
        assert!(!channel.is_tls());
        channel.mark_passthrough_tls();
        assert!(channel.is_tls());
        assert!(channel.tls_info().is_none());
    }

    #[tokio::test]
    async fn into_stream_rejects_pending_bytes() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = Channel::new(Box::new(client));
        let b = Channel::new(Box::new(server));

        // write a frame and a half.
        std::io::Write::write_all(&mut a.writer(), &[0x10]).unwrap();
        a.writer().end_packet().await.unwrap();
        use tokio::io::AsyncWriteExt;
        a.writer().inner_writer.write_all(&[0xff, 0x00]).await.unwrap();
        a.writer().flush_all().await.unwrap();

        let mut b = b;
        let _ = b.recv_msg().await.unwrap();
        // trailing partial frame is buffered; the stream cannot be recovered.
        let err = match b.into_stream() {
            Ok(_) => None,
            Err(e) => Some(e),
        };
        // depending on read timing the partial header may not be buffered
        // yet; only assert when it was.
        if let Some(err) = err {
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }
    }
}
