use std::io::{self, BufRead, Read};

use headers::HeaderMapExt;
use http::{Method, Request, Version};
use thiserror::Error;

use crate::IncomingRequest;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("invalid request")]
    Invalid(#[from] httparse::Error),
    #[error("incomplete request")]
    IncompleteRequest,
    #[error("unsupported http version: {0}")]
    UnsupportedHttpVersion(u8),
    #[error("invalid Transfer-Encoding header")]
    InvalidTransferEncoding,
    #[error("invalid header")]
    InvalidHeader(#[from] headers::Error),
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("failed to parse http request")]
    Unknown,
}

/// Largest body accepted from a client, chunked or not.
pub(crate) const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

/// Reads a whole request, body included, from the stream.
pub(crate) fn parse_request(stream: &mut impl BufRead) -> Result<IncomingRequest, ParseError> {
    let mut buf = Vec::with_capacity(800);

    loop {
        if stream.read_until(b'\n', &mut buf)? == 0 {
            break;
        }

        match buf.as_slice() {
            [.., b'\r', b'\n', b'\r', b'\n'] => break,
            [.., b'\n', b'\n'] => break,
            _ => continue,
        }
    }

    if buf.is_empty() {
        return Err(ParseError::ConnectionClosed);
    }

    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(&buf)?.is_partial() {
        return Err(ParseError::IncompleteRequest);
    }

    let method = req
        .method
        .map(|method| method.as_bytes())
        .ok_or(ParseError::IncompleteRequest)?;

    let path = req.path.ok_or(ParseError::IncompleteRequest)?;

    let version = match req.version.ok_or(ParseError::IncompleteRequest)? {
        0 => Version::HTTP_10,
        1 => Version::HTTP_11,
        version => return Err(ParseError::UnsupportedHttpVersion(version)),
    };

    let request = Request::builder()
        .method(Method::from_bytes(method).map_err(|_| ParseError::IncompleteRequest)?)
        .uri(path)
        .version(version);

    let request = req
        .headers
        .iter()
        .map(|header| (header.name, header.value))
        .fold(request, |req, (name, value)| req.header(name, value));

    let headers = request.headers_ref().ok_or(ParseError::Unknown)?;

    let body = if let Some(encoding) = headers.typed_try_get::<headers::TransferEncoding>()? {
        if !encoding.is_chunked() {
            // https://datatracker.ietf.org/doc/html/rfc2616#section-3.6
            return Err(ParseError::InvalidTransferEncoding);
        }
        read_chunked(stream)?
    } else if let Some(len) = headers.typed_try_get::<headers::ContentLength>()? {
        if len.0 > MAX_BODY_LENGTH as u64 {
            return Err(ParseError::BodyTooLarge);
        }
        let mut body = Vec::with_capacity(len.0.min(64 * 1024) as usize);
        stream.by_ref().take(len.0).read_to_end(&mut body)?;
        if body.len() as u64 != len.0 {
            return Err(ParseError::IncompleteRequest);
        }
        body
    } else {
        Vec::new()
    };

    request.body(body).map_err(|_| ParseError::Unknown)
}

fn read_chunked(stream: &mut impl BufRead) -> Result<Vec<u8>, ParseError> {
    let mut body = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line)? == 0 {
            return Err(ParseError::IncompleteRequest);
        }

        match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_pos, 0))) => break,
            Ok(httparse::Status::Complete((_pos, size))) => {
                let expected = usize::try_from(size)
                    .ok()
                    .and_then(|size| body.len().checked_add(size))
                    .filter(|len| *len <= MAX_BODY_LENGTH)
                    .ok_or(ParseError::InvalidChunkSize)?;

                stream.by_ref().take(size).read_to_end(&mut body)?;
                if body.len() != expected {
                    return Err(ParseError::IncompleteRequest);
                }

                line.clear();
                stream.read_until(b'\n', &mut line)?;
            }
            Ok(httparse::Status::Partial) | Err(_) => return Err(ParseError::InvalidChunkSize),
        }
    }

    // Trailers are read and discarded
    loop {
        line.clear();
        if stream.read_until(b'\n', &mut line)? == 0 || line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    Ok(body)
}
