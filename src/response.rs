use std::io::{self, Write};

use headers::HeaderMapExt;
use http::{
    header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING},
    HeaderMap, HeaderValue, Method, Response, StatusCode, Version,
};

/// The capability handlers use to produce a response.
///
/// Body bytes go through [`Write`]. Status and headers may be changed until the first body byte
/// is committed to the client; after that, changes are silently ignored by wire writers.
pub trait ResponseWriter: Write {
    fn status(&self) -> StatusCode;

    fn set_status(&mut self, status: StatusCode);

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;
}

impl<T: ResponseWriter + ?Sized> ResponseWriter for &mut T {
    fn status(&self) -> StatusCode {
        (**self).status()
    }

    fn set_status(&mut self, status: StatusCode) {
        (**self).set_status(status)
    }

    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }
}

/// Keeps a whole response in memory.
///
/// Useful to capture what a handler produces before deciding what to do with it, and in tests.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Vec<u8>) {
        (self.status, self.headers, self.body)
    }

    pub fn into_response(self) -> Response<Vec<u8>> {
        let mut res = Response::new(self.body);
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

impl Write for Recorder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseWriter for Recorder {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Encoding {
    FixedLength(u64),
    Chunked,
    CloseDelimited,
    // Responses to HEAD, and 1xx, 204 and 304 responses, never carry a body
    Bodiless,
}

/// What should happen to the connection once a response is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    KeepAlive,
    Close,
}

/// Serializes a single HTTP/1.x response into a stream.
///
/// The head is written lazily, right before the first body byte, so handlers are free to tweak
/// status and headers until then. Framing is picked when the head is committed: a
/// `content-length` header wins, otherwise HTTP/1.1 responses are chunked and HTTP/1.0 ones are
/// delimited by closing the connection.
///
/// Responses that can't have a body (answers to `HEAD`, `1xx`, `204` and `304`) keep their
/// headers but any body bytes written to them are discarded.
#[derive(Debug)]
pub struct ConnectionWriter<W: Write> {
    stream: W,
    version: Version,
    head: bool,
    status: StatusCode,
    headers: HeaderMap,
    encoding: Option<Encoding>,
}

impl<W: Write> ConnectionWriter<W> {
    pub fn new(stream: W, version: Version) -> Self {
        Self {
            stream,
            version,
            head: false,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            encoding: None,
        }
    }

    /// Sets the method of the request being answered.
    pub fn with_method(self, method: &Method) -> Self {
        Self {
            head: method == Method::HEAD,
            ..self
        }
    }

    pub fn is_committed(&self) -> bool {
        self.encoding.is_some()
    }

    fn is_bodiless(&self) -> bool {
        self.head
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    fn commit(&mut self) -> io::Result<Encoding> {
        if let Some(encoding) = self.encoding {
            return Ok(encoding);
        }

        let content_length = self.headers.typed_get::<headers::ContentLength>();

        let encoding = match content_length {
            _ if self.is_bodiless() => Encoding::Bodiless,
            Some(len) => Encoding::FixedLength(len.0),
            None if self.version == Version::HTTP_11 => {
                self.headers
                    .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Encoding::Chunked
            }
            None => {
                self.headers
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                Encoding::CloseDelimited
            }
        };

        let version = if self.version == Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };

        self.stream
            .write_all(format!("{version} {}\r\n", self.status).as_bytes())?;

        for (name, val) in self.headers.iter() {
            self.stream
                .write_all(&[format!("{name}: ").as_bytes(), val.as_bytes(), b"\r\n"].concat())?;
        }

        self.stream.write_all(b"\r\n")?;
        self.encoding = Some(encoding);

        Ok(encoding)
    }

    /// Commits the head if nothing was written yet and terminates the body.
    pub fn finish(mut self) -> io::Result<Outcome> {
        if !self.is_committed() && !self.is_bodiless() && !self.headers.contains_key(CONTENT_LENGTH)
        {
            self.headers
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }

        let encoding = self.commit()?;

        if encoding == Encoding::Chunked {
            self.stream.write_all(b"0\r\n\r\n")?;
        }

        self.stream.flush()?;

        let asks_for_close = self
            .headers
            .typed_get::<headers::Connection>()
            .filter(|conn| conn.contains("close"))
            .is_some();

        match encoding {
            Encoding::CloseDelimited => Ok(Outcome::Close),
            _ if asks_for_close => Ok(Outcome::Close),
            _ => Ok(Outcome::KeepAlive),
        }
    }
}

impl<W: Write> Write for ConnectionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // An empty chunk would terminate a chunked body
        if buf.is_empty() {
            return Ok(0);
        }

        match self.commit()? {
            Encoding::Chunked => {
                self.stream
                    .write_all(format!("{:x}\r\n", buf.len()).as_bytes())?;
                self.stream.write_all(buf)?;
                self.stream.write_all(b"\r\n")?;
            }
            Encoding::FixedLength(_) | Encoding::CloseDelimited => {
                self.stream.write_all(buf)?;
            }
            Encoding::Bodiless => {}
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl<W: Write> ResponseWriter for ConnectionWriter<W> {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}
