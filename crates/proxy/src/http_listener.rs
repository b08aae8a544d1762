//! TCP listeners and per-connection HTTP serving
//!
//! One accept loop per listening socket. Every accepted connection runs in
//! its own task; on shutdown the loop stops accepting, open connections are
//! asked to finish gracefully and whatever is still open after the grace
//! period is aborted.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::proxy::ProxyBody;
use crate::shutdown::ConnectionDrain;

/// A bound listening socket with a name for logs
#[derive(Debug)]
pub struct Listener {
    name: &'static str,
    listener: TcpListener,
}

impl Listener {
    /// Bind `addr`
    ///
    /// # Errors
    ///
    /// Fails if the address is in use or not permitted.
    pub async fn bind(name: &'static str, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(listener = name, address = %listener.local_addr()?, "Listening");
        Ok(Self { name, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Each connection is handed to `on_connection` in its own task. Returns
    /// once every connection has finished or been aborted after the drain
    /// period.
    pub async fn run<F, Fut>(
        self,
        shutdown: CancellationToken,
        drain: ConnectionDrain,
        on_connection: F,
    ) where
        F: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        trace!(listener = self.name, peer = %peer, "Accepted connection");
                        let guard = drain.track();
                        let task = on_connection(stream, peer, shutdown.clone());
                        connections.spawn(async move {
                            task.await;
                            drop(guard);
                        });
                    }
                    Err(e) => {
                        warn!(listener = self.name, error = %e, "Accept failed");
                    }
                },
                // Reap finished connections so the set stays small
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        info!(
            listener = self.name,
            open_connections = connections.len(),
            "Stopped accepting connections"
        );

        let drained = tokio::time::timeout(drain.max_drain_time(), async {
            while connections.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                listener = self.name,
                aborted = connections.len(),
                "Grace period expired, aborting open connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        debug!(listener = self.name, "Listener stopped");
    }
}

/// Serve HTTP/1.1 or HTTP/2 on one connection until it closes
///
/// When `shutdown` is cancelled the connection finishes its in-flight
/// requests and then closes.
pub async fn serve_connection<IO, H, Fut>(
    io: IO,
    peer: SocketAddr,
    shutdown: CancellationToken,
    handler: H,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    let service = service_fn(move |req| {
        let response = handler(req);
        async move { Ok::<_, Infallible>(response.await) }
    });

    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection closed with error");
    }
}
