#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod builder;
mod config;
mod config_store;
mod errors;
mod handle;
pub mod http;
mod logging;
mod metrics;
pub mod query;
mod registrar;
mod runtime;
mod signal;
mod util;
pub mod zmq;

pub use self::{
    builder::{
        Http1Config, Http2Config, Http2KeepaliveConfig, IpConfig, ServerBuilder,
        ServerBuilderError, TcpConfig, TcpKeepaliveConfig,
    },
    config::{
        AppConfig, ConfigStoreSettings, ServiceConfigBuilder, ServiceConfigError, ZmqConfig,
    },
    config_store::{ApplicationChangeEvent, ConfigStore, ConfigStoreError},
    errors::{error_body, IoError},
    handle::{Handle, HandleError},
    http::{http_router, HttpState},
    logging::LoggingConfig,
    metrics::{
        metrics_router, Counter, DataList, Histogram, Meter, MetricsConfig, MetricsError,
        MetricsRegistry,
    },
    registrar::{AppRegistry, Registrar, RegistrarError},
    runtime::{RuntimeConfig, RuntimeType},
    signal::{Signal, SignalError, SignalStream},
    zmq::{ZmqError, ZmqFrontend},
};
