//! Archive retrieval engine.
//!
//! Retrieves historical time-series samples for named data channels from a
//! remote archiving HTTP service and maintains a sliding time-window buffer
//! of samples per channel for live plotting. Concurrent update requests that
//! normalize to the same retrieval identity share one fetch; results are
//! merged incrementally into the host's buffer store under its locking
//! discipline.

pub mod config;
pub mod dispatcher;
pub mod key;
pub mod perf;
pub mod store;
pub mod transport;
pub mod window;
pub mod worker;

pub use config::{ChannelConfig, EngineConfig};
pub use dispatcher::{ArchiveEngine, UpdateRequest};
pub use key::{AxisRole, ChannelKey, RetrievalKey, WidgetId};
pub use store::{BufferRef, BufferStore, MemoryBufferStore};
