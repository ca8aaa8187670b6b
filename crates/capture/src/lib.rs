#![doc = include_str!("../README.md")]

pub mod engine;
pub mod frame;
pub mod options;
pub mod pool;
pub mod sink;
pub mod virtual_backend;

pub use strobe_core;

pub mod prelude {
    pub use crate::{
        engine::{CaptureEngine, EngineState, SessionSummary, StopReason},
        frame::{Frame, FrameConsumer},
        options::CaptureOptions,
        pool::BufferPool,
        sink::FrameSink,
        virtual_backend::{VirtualDriver, VirtualStats},
    };
    pub use strobe_core::prelude::*;
}
