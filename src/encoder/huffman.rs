use std::io::{self, Write};

use flate2::Crc;
use miniz_oxide::deflate::core::{
    compress_to_output, create_comp_flags_from_zip_params, CompressionStrategy, CompressorOxide,
    TDEFLFlush, TDEFLStatus,
};

use super::Encoder;

// ID1, ID2, CM = deflate, no flags, no mtime, no extra flags, unknown OS
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];

// Negative window bits means a raw deflate stream, the gzip framing is written by hand.
const RAW_DEFLATE_WINDOW_BITS: i32 = -15;

/// A gzip stream whose deflate body only uses Huffman coding, without looking for repeated
/// strings.
pub struct HuffmanEncoder<W: Write> {
    inner: Option<W>,
    compressor: Box<CompressorOxide>,
    crc: Crc,
    header_written: bool,
    finished: bool,
}

impl<W: Write> HuffmanEncoder<W> {
    pub fn new(inner: W) -> Self {
        let flags = create_comp_flags_from_zip_params(
            1,
            RAW_DEFLATE_WINDOW_BITS,
            CompressionStrategy::HuffmanOnly as i32,
        );

        Self {
            inner: Some(inner),
            compressor: Box::new(CompressorOxide::new(flags)),
            crc: Crc::new(),
            header_written: false,
            finished: false,
        }
    }

    fn inner_mut(&mut self) -> io::Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder already finished"))
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.inner_mut()?.write_all(&GZIP_HEADER)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn deflate(&mut self, input: &[u8], flush: TDEFLFlush) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "encoder already finished",
            ));
        }

        self.write_header()?;

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder already finished"))?;

        let mut error = None;
        let (status, consumed) = compress_to_output(&mut self.compressor, input, flush, |out| {
            match inner.write_all(out) {
                Ok(()) => true,
                Err(err) => {
                    error = Some(err);
                    false
                }
            }
        });

        if let Some(err) = error {
            return Err(err);
        }

        match status {
            TDEFLStatus::Okay | TDEFLStatus::Done => Ok(consumed),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "failed to deflate response body",
            )),
        }
    }

    fn try_finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }

        self.deflate(&[], TDEFLFlush::Finish)?;
        self.finished = true;

        let trailer = [self.crc.sum().to_le_bytes(), self.crc.amount().to_le_bytes()].concat();
        let inner = self.inner_mut()?;
        inner.write_all(&trailer)?;
        inner.flush()
    }
}

impl<W: Write> Write for HuffmanEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let consumed = self.deflate(buf, TDEFLFlush::None)?;
        self.crc.update(&buf[..consumed]);
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.deflate(&[], TDEFLFlush::Sync)?;
        self.inner_mut()?.flush()
    }
}

impl<W: Write> Encoder<W> for HuffmanEncoder<W> {
    fn get_ref(&self) -> &W {
        match self.inner {
            Some(ref inner) => inner,
            None => unreachable!("inner writer is only taken by finish"),
        }
    }

    fn get_mut(&mut self) -> &mut W {
        match self.inner {
            Some(ref mut inner) => inner,
            None => unreachable!("inner writer is only taken by finish"),
        }
    }

    fn finish(mut self) -> io::Result<W> {
        self.try_finish()?;
        self.inner
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "encoder already finished"))
    }
}

impl<W: Write> Drop for HuffmanEncoder<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            let _ = self.try_finish();
        }
    }
}
