use std::time::Duration;

use strobe_core::prelude::PlaneVec;

/// A completed buffer lent to the consumer for the duration of one callback.
///
/// Plane slices are the `data_offset..bytes_used` window of each plane; the slot goes
/// back to the driver once the callback returns.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use strobe_capture::prelude::*;
///
/// let luma = [1u8; 6];
/// let chroma = [2u8; 3];
/// let frame = Frame::new(0, 7, Duration::ZERO, smallvec::smallvec![&luma[..], &chroma[..]]);
/// assert_eq!(frame.len(), 6);
/// assert_eq!(frame.total_len(), 9);
/// ```
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    index: u32,
    sequence: u32,
    timestamp: Duration,
    planes: PlaneVec<&'a [u8]>,
}

impl<'a> Frame<'a> {
    pub fn new(index: u32, sequence: u32, timestamp: Duration, planes: PlaneVec<&'a [u8]>) -> Self {
        Self {
            index,
            sequence,
            timestamp,
            planes,
        }
    }

    /// Payload of the first plane.
    pub fn data(&self) -> &'a [u8] {
        self.planes.first().copied().unwrap_or_default()
    }

    /// Length of [`Frame::data`].
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.planes.iter().all(|p| p.is_empty())
    }

    /// Sum of every plane payload.
    pub fn total_len(&self) -> usize {
        self.planes.iter().map(|p| p.len()).sum()
    }

    pub fn planes(&self) -> &[&'a [u8]] {
        &self.planes
    }

    /// Slot the frame was captured into.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Driver-reported sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Driver-reported capture timestamp.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }
}

/// Receives every delivered frame. Returning `false` stops the session cleanly.
///
/// Closures of the form `|frame: &Frame<'_>| -> bool` implement this trait.
pub trait FrameConsumer {
    fn consume(&mut self, frame: &Frame<'_>) -> bool;
}

impl<F> FrameConsumer for F
where
    F: FnMut(&Frame<'_>) -> bool,
{
    fn consume(&mut self, frame: &Frame<'_>) -> bool {
        self(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<u32>);

    impl FrameConsumer for Collect {
        fn consume(&mut self, frame: &Frame<'_>) -> bool {
            self.0.push(frame.sequence());
            self.0.len() < 2
        }
    }

    #[test]
    fn struct_consumer_controls_continuation() {
        let bytes = [0u8; 4];
        let frame = Frame::new(1, 10, Duration::from_millis(3), smallvec::smallvec![&bytes[..]]);
        let mut sink = Collect(Vec::new());
        assert!(sink.consume(&frame));
        assert!(!sink.consume(&frame));
        assert_eq!(sink.0, [10, 10]);
    }

    #[test]
    fn closure_consumer() {
        let mut seen = 0;
        let mut consumer = |frame: &Frame<'_>| {
            seen += frame.len();
            true
        };
        let bytes = [0u8; 5];
        let frame = Frame::new(0, 0, Duration::ZERO, smallvec::smallvec![&bytes[..]]);
        assert!(FrameConsumer::consume(&mut consumer, &frame));
        assert_eq!(seen, 5);
    }

    #[test]
    fn planeless_frame_is_empty() {
        let frame = Frame::new(0, 0, Duration::ZERO, PlaneVec::new());
        assert!(frame.is_empty());
        assert_eq!(frame.len(), 0);
        assert!(frame.data().is_empty());
    }
}
