mod server;

pub use self::server::{
    Http1Config, Http2Config, Http2KeepaliveConfig, IpConfig, ServerBuilder, ServerBuilderError,
    TcpConfig, TcpKeepaliveConfig,
};
