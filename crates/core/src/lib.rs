#![doc = include_str!("../README.md")]

pub mod capability;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod format;
pub mod metrics;

pub mod prelude {
    pub use crate::{
        capability::{CapabilityInfo, DeviceInfo, NodeClass},
        diagnostics::{Diagnostic, Diagnostics, Severity},
        driver::{
            Dequeued, Driver, DriverEvent, EventKind, MapSource, Mapping, MemoryMode, PlaneInfo,
            MAX_PLANES, PlaneMapping, PlaneSubmit, PlaneUsage, PlaneVec, QueueRequest, QueueType,
            Readiness, TimingStatus,
        },
        error::{CaptureError, ControlError},
        format::{FormatInfo, FourCc},
        metrics::{FpsMeter, FpsSample, Metrics},
    };
}
