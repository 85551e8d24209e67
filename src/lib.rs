#![doc = include_str!("../README.md")]

pub mod accept;
mod compress;
pub mod encoder;
mod level;
#[cfg(feature = "server")]
mod request;
pub mod response;
#[cfg(feature = "server")]
pub mod server;

#[cfg(feature = "server")]
use std::{
    io::{self, BufReader, BufWriter, Write},
    net::TcpStream,
};

pub use compress::{Compress, CompressBuilder, DEFAULT_MIN_LENGTH};
pub use encoder::{Encoder, EncoderError, Gzip, MakeEncoder};
#[cfg(feature = "server")]
use headers::HeaderMapExt;
pub use http::{header, Method, Request, Response, StatusCode, Uri, Version};
pub use level::{CompressionLevel, LevelError};
#[cfg(feature = "server")]
pub use request::ParseError;
pub use response::{ConnectionWriter, Recorder, ResponseWriter};
#[cfg(feature = "server")]
pub use server::Server;
#[cfg(feature = "server")]
use tracing::debug;

pub type IncomingRequest = Request<Vec<u8>>;

/// Produces a response for a request by writing it into a [`ResponseWriter`].
///
/// Usually you don't need to implement this trait, closures taking the writer and the request
/// already are handlers.
///
/// ```no_run
/// # use std::io::Write;
/// # use squeeze::{Request, ResponseWriter, Server, StatusCode};
/// fn app(res: &mut dyn ResponseWriter, _req: &Request<Vec<u8>>) {
///     res.set_status(StatusCode::OK);
///     res.write_all(b"Hello, world!").ok();
/// }
///
/// fn main() -> std::io::Result<()> {
///     Server::bind("0.0.0.0:4444").serve(app)
/// }
/// ```
///
/// Handlers have no return value: failures are reported to the client through the writer, and
/// write errors are theirs to handle.
pub trait Handler {
    fn serve(&self, res: &mut dyn ResponseWriter, req: &IncomingRequest);
}

impl<F> Handler for F
where
    F: Fn(&mut dyn ResponseWriter, &IncomingRequest),
    F: Sync + Send,
{
    fn serve(&self, res: &mut dyn ResponseWriter, req: &IncomingRequest) {
        self(res, req)
    }
}

#[cfg(feature = "server")]
pub(crate) fn serve<H: Handler>(stream: TcpStream, handler: &H) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        match request::parse_request(&mut reader) {
            Ok(req) => {
                let asks_for_close = req
                    .headers()
                    .typed_get::<headers::Connection>()
                    .filter(|conn| conn.contains("close"))
                    .is_some();

                let asks_for_keep_alive = req
                    .headers()
                    .typed_get::<headers::Connection>()
                    .filter(|conn| conn.contains("keep-alive"))
                    .is_some();

                let version = req.version();

                let demands_close = match version {
                    Version::HTTP_10 => !asks_for_keep_alive,
                    _ => asks_for_close,
                };

                let mut res = ConnectionWriter::new(&mut writer, version).with_method(req.method());

                if demands_close {
                    res.headers_mut()
                        .typed_insert(headers::Connection::close());
                }

                handler.serve(&mut res, &req);

                debug!(method = %req.method(), uri = %req.uri(), status = %res.status(), "served request");

                match res.finish()? {
                    response::Outcome::KeepAlive if demands_close => break,
                    response::Outcome::KeepAlive => writer.flush()?,
                    response::Outcome::Close => break,
                }
            }
            Err(ParseError::ConnectionClosed) => break,
            Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err)),
        }
    }

    writer.flush()
}
