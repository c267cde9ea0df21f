//! The server-side connection unit, as pooled and routed.

use crate::channel::Channel;
use crate::destinations::Endpoint;
use crate::state::ProtocolState;

use nanoid::nanoid;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

pub struct ServerConnection {
    pub id: String,
    pub endpoint: String,
    pub channel: Channel,
    pub state: ProtocolState,
    pub authenticated: bool,
}

impl ServerConnection {
    pub fn new(endpoint: String, channel: Channel) -> Self {
        Self {
            id: nanoid!(),
            endpoint,
            channel,
            state: ProtocolState::default(),
            authenticated: false,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.channel.is_tls()
    }

    /// Opens the transport; the greeting/auth exchange is the server-side
    /// greetor's job.
    pub async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> io::Result<Self> {
        let channel = match endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {endpoint} timed out"),
                    )
                })??;
                stream.set_nodelay(true)?;
                Channel::new(Box::new(stream))
            }
            Endpoint::Local { path } => {
                #[cfg(unix)]
                {
                    let stream = tokio::time::timeout(
                        connect_timeout,
                        tokio::net::UnixStream::connect(path),
                    )
                    .await
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("connecting to {path} timed out"),
                        )
                    })??;
                    Channel::new(Box::new(stream))
                }
                #[cfg(not(unix))]
                {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        format!("unix sockets are not supported here: {path}"),
                    ));
                }
            }
        };
        Ok(Self::new(endpoint.to_string(), channel))
    }
}
