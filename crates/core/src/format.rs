use std::{fmt, str::FromStr};

/// Four-character code describing a pixel format as reported by the driver.
///
/// # Example
/// ```rust
/// use strobe_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"YUYV");
/// assert_eq!(fcc.to_string(), "YUYV");
/// assert_eq!(FourCc::from(fcc.to_u32()), fcc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Wrap the four code bytes in wire order.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding, as stored in `pixelformat`.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// The code as text, or `None` when the bytes are not UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "{s}"),
            None => write!(f, "0x{:08x}", self.to_u32()),
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| "fourcc must be four ASCII bytes".to_string())?;
        Ok(FourCc(bytes))
    }
}

/// Current format of a queue (G_FMT), reduced to what buffer accounting needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    /// Planes per buffer; always 1 for single-planar queues.
    pub planes: usize,
}

impl fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} plane{})",
            self.width,
            self.height,
            self.fourcc,
            self.planes,
            if self.planes == 1 { "" } else { "s" }
        )
    }
}
