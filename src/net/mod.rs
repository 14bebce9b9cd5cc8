mod buffered;
mod socket;

pub use buffered::{BufferedSocket, BACKPRESSURE_LIMIT, DEFAULT_BUF_SIZE};
pub use socket::{connect_tcp, connect_uds, BoxSocket, Socket};

#[cfg(feature = "tls-native-tls")]
pub use socket::upgrade_tls;
