use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

pub trait ProtocolStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> ProtocolStream for T {}

/// Boxed IO stream passed from listeners to MQTT sessions.
pub type ProtocolIo = Box<dyn ProtocolStream + Unpin + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolTransport {
    Tcp,
    Tls,
    WebSocket,
}

impl ProtocolTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolTransport::Tcp => "tcp",
            ProtocolTransport::Tls => "tls",
            ProtocolTransport::WebSocket => "ws",
        }
    }
}

impl fmt::Display for ProtocolTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
