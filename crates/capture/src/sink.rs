use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use strobe_core::prelude::CaptureError;

use crate::frame::Frame;

/// Raw output file: plane payloads concatenated in delivery order, no framing.
///
/// An absent or empty path disables the sink; writes then do nothing.
#[derive(Debug)]
pub struct FrameSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FrameSink {
    /// Create (truncating) the output file.
    pub fn open(path: Option<&Path>) -> Result<Self, CaptureError> {
        let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(Self::disabled());
        };
        let file = File::create(path).map_err(|source| CaptureError::Sink {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "sink opened");
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            writer: None,
            written: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Bytes appended so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append every plane payload of `frame`.
    pub fn write(&mut self, frame: &Frame<'_>) -> Result<(), CaptureError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        for plane in frame.planes() {
            writer.write_all(plane).map_err(|source| CaptureError::Sink {
                path: self.path.clone(),
                source,
            })?;
            self.written += plane.len() as u64;
        }
        Ok(())
    }

    /// Flush and close. Later writes are ignored.
    pub fn finish(&mut self) -> Result<(), CaptureError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush().map_err(|source| CaptureError::Sink {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), bytes = self.written, "sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn writes_planes_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = FrameSink::open(Some(&path)).unwrap();
        let (a, b) = ([1u8, 2], [3u8]);
        let frame = Frame::new(0, 0, Duration::ZERO, smallvec::smallvec![&a[..], &b[..]]);
        sink.write(&frame).unwrap();
        sink.write(&frame).unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), [1, 2, 3, 1, 2, 3]);
        assert_eq!(sink.written(), 6);
        // Closed sinks swallow writes.
        sink.write(&frame).unwrap();
        assert_eq!(sink.written(), 6);
    }

    #[test]
    fn empty_path_disables() {
        let sink = FrameSink::open(Some(Path::new(""))).unwrap();
        assert!(!sink.is_enabled());
        assert!(!FrameSink::open(None).unwrap().is_enabled());
    }

    #[test]
    fn unwritable_location_is_a_sink_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FrameSink::open(Some(&dir.path().join("missing/out.raw"))).unwrap_err();
        assert_eq!(err.code(), "V010");
    }
}
