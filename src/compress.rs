use std::{
    io::{self, Write},
    marker::PhantomData,
};

use http::{
    header::{CONTENT_ENCODING, CONTENT_LENGTH},
    HeaderMap, HeaderValue, StatusCode,
};
use tracing::{error, trace, warn};

use crate::{
    accept::accepts_gzip,
    encoder::{Encoder, Gzip, MakeEncoder},
    level::{CompressionLevel, LevelError},
    response::{Recorder, ResponseWriter},
    Handler, IncomingRequest,
};

/// Below this many bytes the gzip header and trailer tend to eat whatever compression saves.
pub const DEFAULT_MIN_LENGTH: usize = 860;

/// Gzip-compresses the responses of the wrapped [`Handler`] for clients that accept it.
///
/// Clients that don't advertise gzip in `Accept-Encoding` get the inner handler's response
/// untouched. Otherwise `Content-Encoding: gzip` is set and the body is compressed, unless a
/// minimum length is configured and the body turns out to be shorter.
///
/// ```no_run
/// # use squeeze::{Compress, CompressionLevel, Request, ResponseWriter, Server};
/// # use std::io::Write;
/// fn main() -> std::io::Result<()> {
///     let app = |res: &mut dyn ResponseWriter, _req: &Request<Vec<u8>>| {
///         res.write_all(b"Hello, world!").ok();
///     };
///
///     let app = Compress::builder()
///         .level(CompressionLevel::BestSpeed)
///         .min_length(860)
///         .build(app)
///         .expect("valid compression level");
///
///     Server::bind("0.0.0.0:4444").serve(app)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Compress<H, M = Gzip> {
    inner: H,
    level: CompressionLevel,
    min_length: Option<usize>,
    make_encoder: M,
}

impl<H: Handler> Compress<H> {
    /// Compresses every response of `inner` for clients accepting gzip.
    pub fn new(inner: H, level: CompressionLevel) -> Result<Self, LevelError> {
        CompressBuilder::default().level(level).build(inner)
    }
}

impl Compress<()> {
    /// Starts configuring a middleware, the handler is only given to [`CompressBuilder::build`].
    ///
    /// Same as [`CompressBuilder::new`].
    pub fn builder() -> CompressBuilder {
        CompressBuilder::new()
    }
}

impl<H, M> Compress<H, M> {
    /// The validated level every compressed response uses.
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Bodies shorter than this are served uncompressed. `None` streams everything.
    pub fn min_length(&self) -> Option<usize> {
        self.min_length
    }

    /// The wrapped handler.
    pub fn get_ref(&self) -> &H {
        &self.inner
    }
}

impl<H: Handler, M: MakeEncoder> Compress<H, M> {
    fn serve_streaming(&self, res: &mut dyn ResponseWriter, req: &IncomingRequest) {
        match self.make_encoder.make_encoder(&mut *res, self.level) {
            Ok(encoder) => {
                let mut writer = GzipResponseWriter::new(encoder);
                writer
                    .headers_mut()
                    .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

                self.inner.serve(&mut writer, req);

                if let Err(err) = writer.finish() {
                    error!(cause = %err, "failed to finish gzip stream");
                }
                return;
            }
            Err(err) => {
                warn!(cause = %err, level = %self.level, "failed to create gzip encoder, serving uncompressed");
            }
        }

        self.inner.serve(res, req)
    }

    fn serve_buffered(&self, res: &mut dyn ResponseWriter, req: &IncomingRequest, min_length: usize) {
        let mut recorder = Recorder::new();
        self.inner.serve(&mut recorder, req);

        let (status, headers, body) = recorder.into_parts();

        res.set_status(status);
        res.headers_mut().extend(headers);

        if body.len() < min_length || !is_compressible(status, res.headers()) {
            trace!(len = body.len(), min_length, "serving response uncompressed");
            return write_raw(res, &body);
        }

        match self.make_encoder.make_encoder(&mut *res, self.level) {
            Ok(mut encoder) => {
                let headers = encoder.get_mut().headers_mut();
                headers.remove(CONTENT_LENGTH);
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

                let compressed = encoder.write_all(&body).and_then(|()| encoder.finish());

                if let Err(err) = compressed {
                    error!(cause = %err, "failed to write gzip response");
                }
                return;
            }
            Err(err) => {
                warn!(cause = %err, level = %self.level, "failed to create gzip encoder, serving uncompressed");
            }
        }

        write_raw(res, &body)
    }
}

impl<H, M> Handler for Compress<H, M>
where
    H: Handler,
    M: MakeEncoder,
{
    fn serve(&self, res: &mut dyn ResponseWriter, req: &IncomingRequest) {
        if !accepts_gzip(req.headers()) {
            return self.inner.serve(res, req);
        }

        match self.min_length {
            None => self.serve_streaming(res, req),
            Some(min_length) => self.serve_buffered(res, req, min_length),
        }
    }
}

fn is_compressible(status: StatusCode, headers: &HeaderMap) -> bool {
    !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
        && !headers.contains_key(CONTENT_ENCODING)
}

fn write_raw(res: &mut dyn ResponseWriter, body: &[u8]) {
    if let Err(err) = res.write_all(body) {
        error!(cause = %err, "failed to write response");
    }
}

#[derive(Debug, Clone)]
pub struct CompressBuilder<M = Gzip> {
    level: CompressionLevel,
    min_length: Option<usize>,
    make_encoder: M,
}

impl Default for CompressBuilder {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Default,
            min_length: None,
            make_encoder: Gzip,
        }
    }
}

impl CompressBuilder {
    /// A builder with the default level, no minimum length and the [`Gzip`] encoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: MakeEncoder> CompressBuilder<M> {
    /// Defaults to [`CompressionLevel::Default`]. Validated by [`CompressBuilder::build`].
    pub fn level(self, level: CompressionLevel) -> Self {
        Self { level, ..self }
    }

    /// Skips compression of bodies shorter than `min_length` bytes.
    ///
    /// The length of a body is only known once the handler is done writing it, so with this
    /// option every response to a gzip-capable client is held in memory before anything is
    /// sent. Memory usage grows with the largest response served.
    pub fn min_length(self, min_length: usize) -> Self {
        Self {
            min_length: Some(min_length),
            ..self
        }
    }

    /// Replaces how compression streams are created.
    pub fn encoder<E: MakeEncoder>(self, make_encoder: E) -> CompressBuilder<E> {
        CompressBuilder {
            level: self.level,
            min_length: self.min_length,
            make_encoder,
        }
    }

    /// Wraps `inner`, failing if the configured level is out of range.
    pub fn build<H: Handler>(self, inner: H) -> Result<Compress<H, M>, LevelError> {
        Ok(Compress {
            inner,
            level: self.level.validate()?,
            min_length: self.min_length,
            make_encoder: self.make_encoder,
        })
    }
}

/// Routes body writes through the encoder while status and headers go to the real writer.
///
/// The encoder is finished when this writer is dropped, so the gzip trailer is written even if
/// the handler unwinds halfway through the body.
struct GzipResponseWriter<W: ResponseWriter, E: Encoder<W>> {
    encoder: Option<E>,
    _writer: PhantomData<fn(W)>,
}

impl<W: ResponseWriter, E: Encoder<W>> GzipResponseWriter<W, E> {
    fn new(encoder: E) -> Self {
        Self {
            encoder: Some(encoder),
            _writer: PhantomData,
        }
    }

    fn encoder(&self) -> &E {
        match self.encoder {
            Some(ref encoder) => encoder,
            None => unreachable!("encoder is only taken by finish"),
        }
    }

    fn encoder_mut(&mut self) -> &mut E {
        match self.encoder {
            Some(ref mut encoder) => encoder,
            None => unreachable!("encoder is only taken by finish"),
        }
    }

    // The length the handler may have set describes the uncompressed body.
    fn strip_content_length(&mut self) {
        let headers = self.encoder_mut().get_mut().headers_mut();
        if headers.contains_key(CONTENT_LENGTH) {
            headers.remove(CONTENT_LENGTH);
        }
    }

    fn finish(mut self) -> io::Result<()> {
        self.strip_content_length();
        match self.encoder.take() {
            Some(encoder) => encoder.finish().map(drop),
            None => Ok(()),
        }
    }
}

impl<W: ResponseWriter, E: Encoder<W>> Write for GzipResponseWriter<W, E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.strip_content_length();
        self.encoder_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.strip_content_length();
        self.encoder_mut().flush()
    }
}

impl<W: ResponseWriter, E: Encoder<W>> ResponseWriter for GzipResponseWriter<W, E> {
    fn status(&self) -> StatusCode {
        self.encoder().get_ref().status()
    }

    fn set_status(&mut self, status: StatusCode) {
        self.encoder_mut().get_mut().set_status(status)
    }

    fn headers(&self) -> &HeaderMap {
        self.encoder().get_ref().headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.encoder_mut().get_mut().headers_mut()
    }
}

impl<W: ResponseWriter, E: Encoder<W>> Drop for GzipResponseWriter<W, E> {
    fn drop(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.get_mut().headers_mut().remove(CONTENT_LENGTH);
            if let Err(err) = encoder.finish() {
                error!(cause = %err, "failed to finish gzip stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
    };

    use flate2::read::GzDecoder;
    use http::{header::ACCEPT_ENCODING, Request};

    use super::*;
    use crate::encoder::{EncoderError, GzipEncoder};

    fn request(accept_encoding: Option<&'static str>) -> IncomingRequest {
        let mut req = Request::builder().uri("/");
        if let Some(encoding) = accept_encoding {
            req = req.header(ACCEPT_ENCODING, encoding);
        }
        req.body(Vec::new()).unwrap()
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        GzDecoder::new(data).read_to_end(&mut buf).unwrap();
        buf
    }

    fn respond_with(body: Vec<u8>) -> impl Handler + Clone {
        move |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
            res.headers_mut()
                .insert("content-type", HeaderValue::from_static("text/plain"));
            res.write_all(&body).unwrap();
        }
    }

    fn serve(handler: &impl Handler, req: &IncomingRequest) -> Recorder {
        let mut rec = Recorder::new();
        handler.serve(&mut rec, req);
        rec
    }

    fn large_body() -> Vec<u8> {
        b"0123456789abcdefghij".repeat(100)
    }

    #[test]
    fn passes_through_when_gzip_is_not_accepted() {
        let app = Compress::new(respond_with(large_body()), CompressionLevel::Default).unwrap();

        for accept in [None, Some("identity"), Some("deflate, br"), Some("gzip;q=0")] {
            let rec = serve(&app, &request(accept));

            assert!(rec.headers().get(CONTENT_ENCODING).is_none());
            assert_eq!(rec.headers()["content-type"], "text/plain");
            assert_eq!(rec.body(), large_body());
        }
    }

    #[test]
    fn compresses_everything_without_a_threshold() {
        let app = Compress::new(respond_with(b"hello world".to_vec()), CompressionLevel::BestSpeed)
            .unwrap();

        let rec = serve(&app, &request(Some("gzip, deflate")));

        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(rec.headers()["content-type"], "text/plain");
        assert_eq!(gunzip(rec.body()), b"hello world");
    }

    #[test]
    fn finishes_the_stream_when_the_handler_writes_nothing() {
        let app = Compress::new(
            |_res: &mut dyn ResponseWriter, _req: &IncomingRequest| {},
            CompressionLevel::Default,
        )
        .unwrap();

        let rec = serve(&app, &request(Some("gzip")));

        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");
        assert!(gunzip(rec.body()).is_empty());
    }

    #[test]
    fn every_level_round_trips() {
        for level in [
            CompressionLevel::NoCompression,
            CompressionLevel::BestSpeed,
            CompressionLevel::BestCompression,
            CompressionLevel::Default,
            CompressionLevel::HuffmanOnly,
            CompressionLevel::Level(3),
        ] {
            let app = Compress::new(respond_with(large_body()), level).unwrap();
            let rec = serve(&app, &request(Some("gzip")));

            assert_eq!(gunzip(rec.body()), large_body(), "level {level}");
        }
    }

    #[test]
    fn rejects_invalid_levels_at_construction() {
        let app = Compress::new(respond_with(Vec::new()), CompressionLevel::Level(11));
        assert_eq!(app.err(), Some(LevelError::OutOfRange(11)));
    }

    #[test]
    fn builders_start_from_the_defaults() {
        let app = CompressBuilder::new()
            .build(respond_with(Vec::new()))
            .unwrap();
        assert_eq!(app.level(), CompressionLevel::Default);
        assert_eq!(app.min_length(), None);

        let app = Compress::builder()
            .level(CompressionLevel::BestSpeed)
            .min_length(DEFAULT_MIN_LENGTH)
            .build(respond_with(Vec::new()))
            .unwrap();
        assert_eq!(app.level(), CompressionLevel::BestSpeed);
        assert_eq!(app.min_length(), Some(DEFAULT_MIN_LENGTH));
    }

    #[test]
    fn leaves_small_bodies_alone_under_the_threshold() {
        let app = Compress::builder()
            .min_length(DEFAULT_MIN_LENGTH)
            .build(respond_with(b"hello world".to_vec()))
            .unwrap();

        let rec = serve(&app, &request(Some("gzip")));

        assert!(rec.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(rec.headers()["content-type"], "text/plain");
        assert_eq!(rec.body(), b"hello world");
    }

    #[test]
    fn compresses_bodies_over_the_threshold() {
        let body: Vec<u8> = (0..2000).map(|i| (i % 251) as u8).collect();
        let app = Compress::builder()
            .min_length(DEFAULT_MIN_LENGTH)
            .build(respond_with(body.clone()))
            .unwrap();

        let rec = serve(&app, &request(Some("gzip")));

        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(gunzip(rec.body()), body);
    }

    #[test]
    fn threshold_applies_to_the_whole_body() {
        let app = Compress::builder()
            .min_length(100)
            .build(|res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
                for _ in 0..10 {
                    res.write_all(b"0123456789abcdef").unwrap();
                }
            })
            .unwrap();

        let rec = serve(&app, &request(Some("gzip")));

        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(gunzip(rec.body()), b"0123456789abcdef".repeat(10));
    }

    #[test]
    fn bodies_exactly_at_the_threshold_are_compressed() {
        let app = Compress::builder()
            .min_length(20)
            .build(respond_with(vec![b'a'; 20]))
            .unwrap();

        let rec = serve(&app, &request(Some("gzip")));
        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");

        let app = Compress::builder()
            .min_length(21)
            .build(respond_with(vec![b'a'; 20]))
            .unwrap();

        let rec = serve(&app, &request(Some("gzip")));
        assert!(rec.headers().get(CONTENT_ENCODING).is_none());
    }

    #[test]
    fn ignores_the_threshold_for_clients_without_gzip() {
        let app = Compress::builder()
            .min_length(DEFAULT_MIN_LENGTH)
            .build(respond_with(large_body()))
            .unwrap();

        let rec = serve(&app, &request(Some("identity")));

        assert!(rec.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(rec.body(), large_body());
    }

    #[test]
    fn runs_the_handler_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let handler = move |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            res.write_all(&large_body()).unwrap();
        };

        for min_length in [None, Some(10), Some(1_000_000)] {
            let builder = Compress::builder();
            let builder = match min_length {
                Some(len) => builder.min_length(len),
                None => builder,
            };
            let app = builder.build(handler.clone()).unwrap();

            calls.store(0, Ordering::SeqCst);
            serve(&app, &request(Some("gzip")));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn keeps_status_and_drops_stale_content_length() {
        let handler = |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
            res.set_status(StatusCode::CREATED);
            res.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("2000"));
            res.write_all(&large_body()).unwrap();
        };

        let streaming = Compress::new(handler, CompressionLevel::Default).unwrap();
        let buffered = Compress::builder().min_length(10).build(handler).unwrap();

        for rec in [
            serve(&streaming, &request(Some("gzip"))),
            serve(&buffered, &request(Some("gzip"))),
        ] {
            assert_eq!(rec.status(), StatusCode::CREATED);
            assert!(rec.headers().get(CONTENT_LENGTH).is_none());
            assert_eq!(gunzip(rec.body()), large_body());
        }
    }

    #[test]
    fn does_not_encode_twice_or_encode_empty_statuses() {
        let already_encoded = |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
            res.headers_mut()
                .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
            res.write_all(&large_body()).unwrap();
        };

        let app = Compress::builder().min_length(1).build(already_encoded).unwrap();
        let rec = serve(&app, &request(Some("gzip, br")));

        assert_eq!(rec.headers()[CONTENT_ENCODING], "br");
        assert_eq!(rec.body(), large_body());

        let not_modified = |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
            res.set_status(StatusCode::NOT_MODIFIED);
        };

        let app = Compress::builder().min_length(0).build(not_modified).unwrap();
        let rec = serve(&app, &request(Some("gzip")));

        assert_eq!(rec.status(), StatusCode::NOT_MODIFIED);
        assert!(rec.headers().get(CONTENT_ENCODING).is_none());
        assert!(rec.body().is_empty());
    }

    #[test]
    fn propagates_write_errors_to_the_handler() {
        struct Broken(HeaderMap);

        impl Write for Broken {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        impl ResponseWriter for Broken {
            fn status(&self) -> StatusCode {
                StatusCode::OK
            }

            fn set_status(&mut self, _status: StatusCode) {}

            fn headers(&self) -> &HeaderMap {
                &self.0
            }

            fn headers_mut(&mut self) -> &mut HeaderMap {
                &mut self.0
            }
        }

        let error = Arc::new(Mutex::new(None));
        let seen = error.clone();

        let app = Compress::new(
            move |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
                let result = res.write_all(&large_body()).and_then(|_| res.flush());
                *seen.lock().unwrap() = result.err().map(|err| err.kind());
            },
            CompressionLevel::NoCompression,
        )
        .unwrap();

        app.serve(&mut Broken(HeaderMap::new()), &request(Some("gzip")));

        assert_eq!(*error.lock().unwrap(), Some(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn finishes_the_stream_when_the_handler_panics() {
        let app = Compress::new(
            |res: &mut dyn ResponseWriter, _req: &IncomingRequest| {
                res.write_all(b"partial body").unwrap();
                panic!("handler blew up");
            },
            CompressionLevel::Default,
        )
        .unwrap();

        let mut rec = Recorder::new();
        let req = request(Some("gzip"));
        let result = panic::catch_unwind(AssertUnwindSafe(|| app.serve(&mut rec, &req)));

        assert!(result.is_err());
        assert_eq!(rec.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(gunzip(rec.body()), b"partial body");
    }

    #[derive(Clone, Copy)]
    struct Unavailable;

    impl MakeEncoder for Unavailable {
        type Encoder<W: Write> = GzipEncoder<W>;

        fn make_encoder<W: Write>(
            &self,
            _out: W,
            _level: CompressionLevel,
        ) -> Result<Self::Encoder<W>, EncoderError> {
            Err(EncoderError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "no room for a compressor",
            )))
        }
    }

    #[derive(Clone, Default)]
    struct Logs(Arc<Mutex<Vec<u8>>>);

    impl Write for Logs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Logs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let logs = Logs::default();
        let writer = logs.clone();

        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);
        logs.contents()
    }

    #[test]
    fn falls_back_to_plain_responses_when_the_encoder_fails() {
        let streaming = Compress::builder()
            .encoder(Unavailable)
            .build(respond_with(large_body()))
            .unwrap();

        let buffered = Compress::builder()
            .encoder(Unavailable)
            .min_length(DEFAULT_MIN_LENGTH)
            .build(respond_with(large_body()))
            .unwrap();

        for app in [streaming, buffered] {
            let mut rec = Recorder::new();
            let logs = capture_logs(|| app.serve(&mut rec, &request(Some("gzip"))));

            assert!(rec.headers().get(CONTENT_ENCODING).is_none());
            assert_eq!(rec.headers()["content-type"], "text/plain");
            assert_eq!(rec.body(), large_body());
            assert!(logs.contains("WARN"), "logs: {logs}");
            assert!(logs.contains("no room for a compressor"), "logs: {logs}");
        }
    }
}
