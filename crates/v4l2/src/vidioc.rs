//! Request numbers `v4l` does not define: event and DV timing requests.
//!
//! Built with the kernel `_IOC` encoding, like the constants in `v4l::v4l2::vidioc`.

use std::mem::size_of;

use v4l::v4l_sys::{v4l2_dv_timings, v4l2_event, v4l2_event_subscription};

use crate::Request;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const SIZE_SHIFT: u32 = 16;
const DIR_SHIFT: u32 = 30;

const WRITE: u32 = 1;
const READ: u32 = 2;

/// `_IOC(dir, 'V', nr, size)`.
const fn ioc(dir: u32, nr: u32, size: usize) -> Request {
    ((dir << DIR_SHIFT)
        | ((b'V' as u32) << TYPE_SHIFT)
        | (nr << NR_SHIFT)
        | ((size as u32) << SIZE_SHIFT)) as Request
}

pub const VIDIOC_S_DV_TIMINGS: Request = ioc(READ | WRITE, 87, size_of::<v4l2_dv_timings>());
pub const VIDIOC_DQEVENT: Request = ioc(READ, 89, size_of::<v4l2_event>());
pub const VIDIOC_SUBSCRIBE_EVENT: Request = ioc(WRITE, 90, size_of::<v4l2_event_subscription>());
pub const VIDIOC_QUERY_DV_TIMINGS: Request = ioc(READ, 99, size_of::<v4l2_dv_timings>());
