use std::{
    io,
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    sync::Arc,
};

use threadpool::ThreadPool;
use tracing::{debug, warn};

use crate::{serve, Handler};

/// Serves a [`Handler`] over HTTP/1.x, one pool thread per connection.
pub struct Server {
    thread_pool: ThreadPool,
    listener: TcpListener,
}

impl Server {
    /// Blocks accepting connections until the listener fails.
    pub fn serve<H>(self, handler: H) -> io::Result<()>
    where
        H: Handler,
        H: Send + Sync + 'static,
    {
        let handler = Arc::new(handler);

        for conn in self.listener.incoming() {
            let conn = match conn {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(cause = %err, "failed to accept connection");
                    continue;
                }
            };

            let handler = Arc::clone(&handler);
            self.thread_pool.execute(move || {
                let peer = conn.peer_addr().ok();
                if let Err(err) = serve(conn, handler.as_ref()) {
                    debug!(cause = %err, ?peer, "connection closed with error");
                }
            });
        }

        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn builder() -> ServerBuilder {
        Default::default()
    }

    pub fn bind<A: ToSocketAddrs>(addr: A) -> Server {
        Self::builder().bind(addr)
    }
}

impl From<TcpListener> for Server {
    fn from(listener: TcpListener) -> Self {
        Self::builder().from_listener(listener)
    }
}

pub struct ServerBuilder {
    max_threads: usize,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self { max_threads: 512 }
    }
}

impl ServerBuilder {
    pub fn max_threads(self, max_threads: usize) -> Self {
        Self { max_threads }
    }

    pub fn from_listener(self, listener: TcpListener) -> Server {
        Server {
            thread_pool: ThreadPool::new(self.max_threads),
            listener,
        }
    }

    /// # Panics
    ///
    /// If the address can't be bound, see [`ServerBuilder::try_bind`].
    pub fn bind<A: ToSocketAddrs>(self, addr: A) -> Server {
        self.try_bind(addr).unwrap()
    }

    pub fn try_bind<A: ToSocketAddrs>(self, addr: A) -> io::Result<Server> {
        let listener = TcpListener::bind(addr)?;
        Ok(self.from_listener(listener))
    }
}
