//! # PCO Camera Driver Core Library
//!
//! This crate drives PCO scientific cameras (pco.edge, pco.dimax, pco.pixelfly)
//! through their acquisition lifecycle and turns raw hardware frames into
//! numbered, timestamped images. The vendor SDK sits behind the
//! [`sdk::CameraSdk`] trait so the whole driver runs against
//! [`mock::MockCamera`] in tests and in the `pco-sim` binary.
//!
//! ## Crate Structure
//!
//! - **`state_machine`**: A generic event-driven state machine: named states and
//!   events, a bounded FIFO event queue, single-shot timers and branch-selected
//!   transitions.
//! - **`controller`**: The camera lifecycle built on the state machine: connect,
//!   arm, acquire, stop, disarm, reboot and status polling.
//! - **`pipeline`**: Per-frame processing. Frame counter checks, software ROI and
//!   binning, multi-exposure accumulation, and delivery to the gang boundary or
//!   the image sink.
//! - **`driver`**: One running driver instance: its thread, the host handle and
//!   the hardware notification path.
//! - **`registry`**: Driver instances by port name.
//! - **`sdk`** / **`mock`**: The camera SDK boundary and its in-memory
//!   implementation.
//! - **`buffers`**, **`frame_queue`**, **`pool`**: Hardware buffer slots, the
//!   pending frame queue and the bounded image pool.
//! - **`image`**, **`bcd`**, **`geometry`**, **`timing`**: Image data and
//!   conversion, BCD stamp decoding, ROI/binning planning and exposure timing.
//! - **`gang`**, **`sink`**: Output boundaries.
//! - **`status`**: Settings and observable status shared between threads.
//! - **`config`**, **`logging`**, **`error`**: Figment configuration, tracing
//!   setup and the crate error type.

pub mod bcd;
pub mod buffers;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod frame_queue;
pub mod gang;
pub mod geometry;
pub mod image;
pub mod logging;
pub mod mock;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod sdk;
pub mod sink;
pub mod state_machine;
pub mod status;
pub mod timing;

pub use driver::{DriverHandle, FrameReceiver, PcoDriver};
pub use error::{AppResult, DriverError, SdkError};
pub use image::Image;
pub use pipeline::Outputs;
pub use registry::DriverRegistry;
pub use status::{Settings, Status};
