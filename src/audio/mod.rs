//! Audio subsystem: buffers, frames and device collaborators

pub mod buffer;
pub mod device;
pub mod frame;
pub mod jitter;
pub mod sink;
pub mod source;

pub use buffer::{Consumer, ItemBuffer, ItemRef, RingBuffer, StreamBuffer};
pub use device::{list_devices, CpalInput, CpalOutput, DeviceInfo};
pub use frame::AudioFormat;
pub use jitter::{JitterBuffer, JitterState, Playout};
pub use sink::{AudioSink, NullSink};
pub use source::{AudioSource, InputMode, SourceSet, ToneSource};
