//! A command-submission library for the NVIDIA Tegra `host1x` graphics
//! co-processor, talking to the `tegra_drm` kernel driver over its ioctl
//! ABI.
//!
//! The entry point is [`Device::new`] or [`Device::wrap`], from which a
//! client opens one [`Channel`] per hardware class it intends to drive,
//! allocates [`Bo`] buffer objects to hold command data and payloads,
//! builds command streams with [`Pushbuf`] against a [`Job`], and submits
//! the job to receive a [`Fence`] it can later wait on.
//!
//! ```no_run
//! use host1x::{bo::BoInfo, channel::ClientClass, device::Device, job::Job, pushbuf::Pushbuf};
//! use std::sync::Arc;
//!
//! # fn run() -> Result<(), host1x::error::DriverError> {
//! let device = Arc::new(Device::new(3)?);
//! let channel = device.open_channel(ClientClass::Gr2d as u32)?;
//! let mut job = Job::new(&channel);
//! let mut pushbuf = Pushbuf::new();
//!
//! pushbuf.push(&device, &mut job, 0xdead_beef)?;
//!
//! let fence = job.submit(Some(&mut pushbuf))?;
//! fence.wait(-1)?;
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![allow(dead_code)]

#[macro_use]
extern crate log;

pub mod bo;
pub mod cache;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod ioctl;
pub mod job;
pub mod pushbuf;

/// Commonly imported types, re-exported for convenience.
pub mod prelude {
    pub use crate::{
        bo::{Bo, BoFlags, BoInfo, BoTiling},
        channel::{Channel, ClientClass, Syncpoint},
        device::Device,
        error::DriverError,
        fence::Fence,
        job::Job,
        pushbuf::{Pushbuf, SyncptCond},
    };
}

pub use self::{
    bo::{Bo, BoFlags, BoInfo, BoTiling},
    channel::{Channel, ClientClass, Syncpoint},
    device::Device,
    error::DriverError,
    fence::Fence,
    job::Job,
    pushbuf::{Pushbuf, SyncptCond},
};
