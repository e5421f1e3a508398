//! Handle object to start, stop and control the service.

use std::{net::SocketAddr, time::Duration};

use axum_server::{service::MakeService, Handle as AxumHandle};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{builder::ServerBuilder, config::AppConfig, errors::IoError};

/// Error type returned by the service handle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HandleError {
    /// Error while setting up logging.
    #[error(transparent)]
    Logging(#[from] crate::logging::LoggingError),
    /// Error while building HTTP server.
    #[error(transparent)]
    ServerBuilder(#[from] crate::builder::ServerBuilderError),
    /// Error running HTTP server.
    #[error("HTTP server error: {0}")]
    Server(IoError),
    /// Server task error.
    #[error("Server task error: {0}")]
    ServerTask(#[from] tokio::task::JoinError),
    /// No server is currently running.
    #[error("No server is currently running")]
    NotRunning,
    /// Error starting the UNIX signal handler.
    #[error(transparent)]
    Signal(#[from] crate::signal::SignalError),
}

/// Handle for starting and controlling the HTTP server.
///
/// Unwritten logs will be flushed when dropping this object. This might help even in case of a
/// panic.
#[non_exhaustive]
pub struct Handle {
    /// Guards for [`tracing_appender::non_blocking::NonBlocking`].
    ///
    /// Held only for their `Drop` impl, which flushes buffered log lines.
    #[allow(dead_code)]
    buf_guards: Vec<WorkerGuard>,
    /// Internal [`axum_server`] control handle.
    handle: AxumHandle,
    /// UNIX signal handler task.
    signal_handler: Option<JoinHandle<()>>,
    /// HTTP server task.
    http_task: Option<JoinHandle<Result<(), HandleError>>>,
}

impl Handle {
    /// Set up background service tasks.
    fn prepare(&mut self, server: &ServerBuilder) -> Result<(), HandleError> {
        if self.signal_handler.is_none() {
            self.signal_handler = Some(server.spawn_signal_handler(self.handle.clone())?);
        }
        Ok(())
    }

    /// Start the server in the background.
    ///
    /// # Errors
    ///
    /// Returns `Err` if caught an error when initializing server tasks.
    pub async fn start<A>(&mut self, server: ServerBuilder, app: A) -> Result<(), HandleError>
    where
        A: MakeService<SocketAddr, http::Request<hyper::body::Incoming>>
            + tower::Service<SocketAddr>
            + Clone
            + Send
            + 'static,
        A::Response: tower::Service<http::Request<hyper::body::Incoming>>,
        A::MakeFuture: Send,
    {
        self.prepare(&server)?;
        let built = server.build().await?;
        let axum_handle = self.handle.clone();
        self.http_task = Some(tokio::spawn(async move {
            built
                .handle(axum_handle)
                .serve(app)
                .await
                .map_err(|err| HandleError::Server(err.into()))
        }));
        Ok(())
    }

    /// Immediately shutdown the server.
    pub fn shutdown(&mut self) {
        self.handle.shutdown();
    }

    /// Gracefully shutdown the server, waiting for in-progress requests to finish.
    pub fn graceful_shutdown(&mut self, graceful: Option<Duration>) {
        self.handle.graceful_shutdown(graceful);
    }

    /// Block execution until the server task exits.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the server task finished with an error.
    pub async fn wait(&mut self) -> Result<(), HandleError> {
        match self.http_task.take() {
            Some(task) => task.await?,
            None => Err(HandleError::NotRunning),
        }
    }
}

impl AppConfig {
    /// Initialize logging and construct a service [`Handle`].
    ///
    /// Returns a guard that shouldn't be dropped as long as there is a need for logging.
    ///
    /// # Errors
    ///
    /// Returns `Err` if initializing the logging subsystem fails.
    pub fn handle(&self) -> Result<Handle, HandleError> {
        let (registry, buf_guards) = self.logging.make_registry()?;
        registry.init();
        Ok(Handle {
            buf_guards,
            handle: AxumHandle::new(),
            signal_handler: None,
            http_task: None,
        })
    }
}
