use std::io::BufRead;

use super::error::UnpickleError;

/// Primitive reads the opcode machine is built on.
///
/// `read_exact` returns exactly `n` bytes or fails with
/// [`UnpickleError::Eof`]. `read_line` returns bytes up to and including the
/// first 0x0A, or whatever remains if the source ends first; an empty
/// return is the EOF signal, never an error.
pub trait ByteSource {
    fn read_exact(
        &mut self,
        n: usize,
    ) -> Result<Vec<u8>, UnpickleError>;

    fn read_line(&mut self) -> Result<Vec<u8>, UnpickleError>;
}

/// Byte source over an in-memory buffer.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
        }
    }
}

impl ByteSource for SliceSource<'_> {
    fn read_exact(
        &mut self,
        n: usize,
    ) -> Result<Vec<u8>, UnpickleError> {
        if self.pos + n > self.data.len() {
            return Err(UnpickleError::Eof);
        }
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, UnpickleError> {
        let rest = &self.data[self.pos..];
        let end = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => rest.len(),
        };
        let out = rest[..end].to_vec();
        self.pos += end;
        Ok(out)
    }
}

/// Byte source over any buffered reader, for file-backed streams.
pub struct IoSource<R: BufRead> {
    inner: R,
}

impl<R: BufRead> IoSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
        }
    }
}

impl<R: BufRead> ByteSource for IoSource<R> {
    fn read_exact(
        &mut self,
        n: usize,
    ) -> Result<Vec<u8>, UnpickleError> {
        let mut out = vec![0u8; n];
        self.inner.read_exact(&mut out).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                UnpickleError::Eof
            } else {
                UnpickleError::malformed(format!("i/o failure: {e}"))
            }
        })?;
        Ok(out)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, UnpickleError> {
        let mut out = Vec::new();
        self.inner
            .read_until(b'\n', &mut out)
            .map_err(|e| UnpickleError::malformed(format!("i/o failure: {e}")))?;
        Ok(out)
    }
}

/// Protocol-5 framing layer.
///
/// Holds at most one current frame. Reads are served from the frame while
/// one is active and fall through to the inner source once it is drained;
/// a read that would cross the frame boundary fails instead of splicing.
pub struct Unframer<S: ByteSource> {
    inner: S,
    frame: Vec<u8>,
    frame_pos: usize,
}

impl<S: ByteSource> Unframer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            frame: Vec::new(),
            frame_pos: 0,
        }
    }

    fn frame_remaining(&self) -> usize {
        self.frame.len() - self.frame_pos
    }

    /// Installs a new frame of `size` bytes read from the inner source.
    /// Only legal once the previous frame is fully drained.
    pub fn load_frame(
        &mut self,
        size: usize,
    ) -> Result<(), UnpickleError> {
        if self.frame_remaining() != 0 {
            return Err(UnpickleError::UnexpectedFrameState);
        }
        self.frame = self.inner.read_exact(size)?;
        self.frame_pos = 0;
        Ok(())
    }
}

impl<S: ByteSource> ByteSource for Unframer<S> {
    fn read_exact(
        &mut self,
        n: usize,
    ) -> Result<Vec<u8>, UnpickleError> {
        let remaining = self.frame_remaining();
        if remaining == 0 {
            if n == 0 {
                return Ok(Vec::new());
            }
            return self.inner.read_exact(n);
        }
        if remaining < n {
            return Err(UnpickleError::FrameExhausted);
        }
        let out = self.frame[self.frame_pos..self.frame_pos + n].to_vec();
        self.frame_pos += n;
        Ok(out)
    }

    fn read_line(&mut self) -> Result<Vec<u8>, UnpickleError> {
        if self.frame_remaining() == 0 {
            return self.inner.read_line();
        }
        let rest = &self.frame[self.frame_pos..];
        let Some(i) = rest.iter().position(|&b| b == b'\n') else {
            // A line inside a frame must terminate inside it.
            return Err(UnpickleError::FrameExhausted);
        };
        let out = rest[..=i].to_vec();
        self.frame_pos += i + 1;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_source_exact_and_eof() {
        let mut src = SliceSource::new(b"abcd");
        assert_eq!(src.read_exact(2).unwrap(), b"ab");
        assert!(matches!(src.read_exact(3), Err(UnpickleError::Eof)));
        assert_eq!(src.read_exact(2).unwrap(), b"cd");
        assert_eq!(src.read_exact(0).unwrap(), b"");
    }

    #[test]
    fn test_slice_source_lines() {
        let mut src = SliceSource::new(b"one\ntwo");
        assert_eq!(src.read_line().unwrap(), b"one\n");
        assert_eq!(src.read_line().unwrap(), b"two");
        assert_eq!(src.read_line().unwrap(), b"");
    }

    #[test]
    fn test_unframer_serves_from_frame_then_falls_through() {
        let mut r = Unframer::new(SliceSource::new(b"abcdef"));
        r.load_frame(4).unwrap();
        assert_eq!(r.read_exact(4).unwrap(), b"abcd");
        assert_eq!(r.read_exact(2).unwrap(), b"ef");
    }

    #[test]
    fn test_unframer_partial_read_fails() {
        let mut r = Unframer::new(SliceSource::new(b"abcdef"));
        r.load_frame(4).unwrap();
        assert_eq!(r.read_exact(2).unwrap(), b"ab");
        assert!(matches!(
            r.read_exact(3),
            Err(UnpickleError::FrameExhausted)
        ));
    }

    #[test]
    fn test_unframer_rejects_nested_frame() {
        let mut r = Unframer::new(SliceSource::new(b"abcdef"));
        r.load_frame(4).unwrap();
        r.read_exact(2).unwrap();
        assert!(matches!(
            r.load_frame(2),
            Err(UnpickleError::UnexpectedFrameState)
        ));
    }

    #[test]
    fn test_unframer_line_must_end_inside_frame() {
        let mut r = Unframer::new(SliceSource::new(b"ab\ncdef"));
        r.load_frame(4).unwrap();
        assert_eq!(r.read_line().unwrap(), b"ab\n");
        assert!(matches!(r.read_line(), Err(UnpickleError::FrameExhausted)));
    }

    #[test]
    fn test_unframer_zero_read_on_empty_frame() {
        let mut r = Unframer::new(SliceSource::new(b""));
        assert_eq!(r.read_exact(0).unwrap(), b"");
    }
}
