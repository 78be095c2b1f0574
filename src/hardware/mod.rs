//! Hardware boundary: capability traits and mock devices.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    Capture, CaptureBatch, Spectrometer, Stage, StreamCapture, StreamHandle, StreamSource,
    TriggerCommand,
};
