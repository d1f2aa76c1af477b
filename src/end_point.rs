use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// Identity of the receive endpoint a connection belongs to: the channel as originally
///  configured plus the bound local address. Connections borrow this handle - the
///  endpoint (socket, dispatcher) outlives every connection attached to it.
pub struct ReceiveChannelEndpoint {
    channel: String,
    local_addr: SocketAddr,
}

impl ReceiveChannelEndpoint {
    pub fn new(channel: impl Into<String>, local_addr: SocketAddr) -> ReceiveChannelEndpoint {
        ReceiveChannelEndpoint {
            channel: channel.into(),
            local_addr,
        }
    }

    /// the channel as originally configured, used to attribute diagnostics
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Display for ReceiveChannelEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.channel, self.local_addr)
    }
}
