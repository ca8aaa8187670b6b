//! Capability bits and device-node classification.

const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
const CAP_VIDEO_OUTPUT: u32 = 0x0000_0002;
const CAP_VIDEO_OVERLAY: u32 = 0x0000_0004;
const CAP_VBI_CAPTURE: u32 = 0x0000_0010;
const CAP_VBI_OUTPUT: u32 = 0x0000_0020;
const CAP_SLICED_VBI_CAPTURE: u32 = 0x0000_0040;
const CAP_SLICED_VBI_OUTPUT: u32 = 0x0000_0080;
const CAP_RDS_CAPTURE: u32 = 0x0000_0100;
const CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
const CAP_VIDEO_OUTPUT_MPLANE: u32 = 0x0000_2000;
const CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
const CAP_VIDEO_M2M: u32 = 0x0000_8000;
const CAP_TUNER: u32 = 0x0001_0000;
const CAP_AUDIO: u32 = 0x0002_0000;
const CAP_RADIO: u32 = 0x0004_0000;
const CAP_READWRITE: u32 = 0x0100_0000;
const CAP_ASYNCIO: u32 = 0x0200_0000;
const CAP_STREAMING: u32 = 0x0400_0000;

/// Named capability flags decoded from the QUERYCAP bit-set.
///
/// # Example
/// ```rust
/// use strobe_core::prelude::CapabilityInfo;
///
/// let caps = CapabilityInfo::from_bits(0x0400_0001);
/// assert!(caps.capture && caps.streaming);
/// assert!(!caps.capture_mplane);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilityInfo {
    pub capture: bool,
    pub capture_mplane: bool,
    pub output: bool,
    pub output_mplane: bool,
    pub video_m2m: bool,
    pub video_m2m_mplane: bool,
    pub overlay: bool,
    pub vbi_capture: bool,
    pub vbi_output: bool,
    pub sliced_vbi_capture: bool,
    pub sliced_vbi_output: bool,
    pub rds_capture: bool,
    pub tuner: bool,
    pub audio: bool,
    pub radio: bool,
    pub read_write: bool,
    pub async_io: bool,
    pub streaming: bool,
}

impl CapabilityInfo {
    pub fn from_bits(bits: u32) -> Self {
        let has = |flag: u32| bits & flag != 0;
        Self {
            capture: has(CAP_VIDEO_CAPTURE),
            capture_mplane: has(CAP_VIDEO_CAPTURE_MPLANE),
            output: has(CAP_VIDEO_OUTPUT),
            output_mplane: has(CAP_VIDEO_OUTPUT_MPLANE),
            video_m2m: has(CAP_VIDEO_M2M),
            video_m2m_mplane: has(CAP_VIDEO_M2M_MPLANE),
            overlay: has(CAP_VIDEO_OVERLAY),
            vbi_capture: has(CAP_VBI_CAPTURE),
            vbi_output: has(CAP_VBI_OUTPUT),
            sliced_vbi_capture: has(CAP_SLICED_VBI_CAPTURE),
            sliced_vbi_output: has(CAP_SLICED_VBI_OUTPUT),
            rds_capture: has(CAP_RDS_CAPTURE),
            tuner: has(CAP_TUNER),
            audio: has(CAP_AUDIO),
            radio: has(CAP_RADIO),
            read_write: has(CAP_READWRITE),
            async_io: has(CAP_ASYNCIO),
            streaming: has(CAP_STREAMING),
        }
    }

    /// Whether the node can stream captured video at all.
    pub fn can_stream_capture(&self) -> bool {
        self.streaming && (self.capture || self.capture_mplane)
    }

    /// Flag names paired with their values, in QUERYCAP bit order.
    pub fn flags(&self) -> [(&'static str, bool); 18] {
        [
            ("capture", self.capture),
            ("capture_mplane", self.capture_mplane),
            ("output", self.output),
            ("output_mplane", self.output_mplane),
            ("video_m2m", self.video_m2m),
            ("video_m2m_mplane", self.video_m2m_mplane),
            ("overlay", self.overlay),
            ("vbi_capture", self.vbi_capture),
            ("vbi_output", self.vbi_output),
            ("sliced_vbi_capture", self.sliced_vbi_capture),
            ("sliced_vbi_output", self.sliced_vbi_output),
            ("rds_capture", self.rds_capture),
            ("tuner", self.tuner),
            ("audio", self.audio),
            ("radio", self.radio),
            ("read_write", self.read_write),
            ("async_io", self.async_io),
            ("streaming", self.streaming),
        ]
    }
}

/// Identity record of an opened node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: CapabilityInfo,
}

impl DeviceInfo {
    /// Kernel version triple encoded in `version`.
    pub fn version_triple(&self) -> (u8, u8, u8) {
        (
            (self.version >> 16) as u8,
            (self.version >> 8) as u8,
            self.version as u8,
        )
    }
}

/// Device-node classes a `DEVNAME=` entry can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Subdevice,
    Video,
    Vbi,
    Radio,
    SoftwareRadio,
    Touch,
}

// Order matters: first match wins.
const NODE_PREFIXES: [(&str, NodeClass); 6] = [
    ("v4l-subdev", NodeClass::Subdevice),
    ("video", NodeClass::Video),
    ("vbi", NodeClass::Vbi),
    ("radio", NodeClass::Radio),
    ("swradio", NodeClass::SoftwareRadio),
    ("v4l-touch", NodeClass::Touch),
];

impl NodeClass {
    /// Classify a device name such as `video0` or `v4l-subdev3`.
    ///
    /// A prefix only matches when the next character is a digit.
    ///
    /// # Example
    /// ```rust
    /// use strobe_core::prelude::NodeClass;
    ///
    /// assert_eq!(NodeClass::from_devname("v4l-subdev2"), Some(NodeClass::Subdevice));
    /// assert_eq!(NodeClass::from_devname("video"), None);
    /// assert_eq!(NodeClass::from_devname("null"), None);
    /// ```
    pub fn from_devname(name: &str) -> Option<Self> {
        NODE_PREFIXES.iter().find_map(|(prefix, class)| {
            name.strip_prefix(prefix)
                .filter(|rest| rest.as_bytes().first().is_some_and(u8::is_ascii_digit))
                .map(|_| *class)
        })
    }

    /// Scan a uevent record for `DEVNAME=` lines and classify the first recognised one.
    ///
    /// Returns the last `DEVNAME` value seen when none is recognised, for reporting.
    pub fn from_uevent(record: &str) -> Result<Self, Option<String>> {
        let mut seen = None;
        for line in record.lines() {
            let Some(name) = line.strip_prefix("DEVNAME=") else {
                continue;
            };
            if let Some(class) = Self::from_devname(name) {
                return Ok(class);
            }
            seen = Some(name.to_string());
        }
        Err(seen)
    }

    pub fn is_subdevice(self) -> bool {
        self == NodeClass::Subdevice
    }
}
