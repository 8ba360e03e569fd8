//! Stream processing layer
//!
//! Everything between the raw parsed tags and whoever consumes them: region
//! routing, per-stream buffers, the event bus and the async pipeline that
//! drives them. Nothing in here touches the network or the terminal.

pub mod buffers;
pub mod events;
pub mod pipeline;
pub mod publisher;
pub mod router;

pub use buffers::StreamBufferManager;
pub use events::{EventBus, SubscriptionId};
pub use pipeline::{ParserHandle, Pipeline};
pub use publisher::TagPublisher;
pub use router::StreamRouter;
