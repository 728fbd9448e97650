//! Append-only streaming hub for per-dataset sequences of binary frames.
//!
//! Producers create a dataset, append opaque binary frames to it, and
//! optionally mark it closed. Consumers subscribe over a WebSocket and
//! receive every frame produced after the point they requested, optionally
//! preceded by a historical replay from a given sequence number. The hub
//! guarantees per-dataset total ordering, strictly increasing delivery per
//! subscriber, and best-effort durability bounded by a time-to-live.
//!
//! The storage and notification plane is pluggable behind the [`Backend`]
//! trait; [`MemoryBackend`] is the in-process implementation.

pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod producer;
pub mod registry;
pub mod server;
pub mod subscriber;

pub use backend::{Backend, StoredFrame, Subscription};
pub use config::Settings;
pub use envelope::{Envelope, EnvelopeFormat, FramePayload, WireFrame};
pub use error::{BackendError, HubError};
pub use memory::MemoryBackend;
pub use producer::Producer;
pub use registry::Registry;
pub use server::{router, serve, HubState};
pub use subscriber::{FrameSink, SinkClosed, StreamEnd, Subscriber};
