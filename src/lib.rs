//! Reactor-style TCP networking core.
//!
//! kiln runs one event loop per thread. Each loop multiplexes readiness for
//! many non-blocking sockets, fires timers, expires idle connections, and
//! drains a cross-thread task inbox woken through an internal descriptor.
//! Connections, timers, and idle watches belonging to a loop are mutated only
//! by that loop's thread; the only cross-thread entry points are
//! [`LoopHandle::post`] and [`ConnHandle::close`].

pub mod addr;
pub mod buffer;
mod clock;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod event_loop;
pub mod group;
pub mod logging;
pub mod metrics;
pub mod poller;
pub mod queue;
pub mod server;
pub mod signal;
pub mod source;

// Public API re-exports
pub use addr::Addr;
pub use buffer::Buffer;
pub use codec::{Codec, Frame, LengthCodec, LineCodec, ParseError};
pub use config::Config;
pub use conn::{ConnHandle, ConnState, TcpConn};
pub use error::Error;
pub use event_loop::{EventLoop, IdleId, LoopHandle, LoopSeed, TimerId};
pub use group::{LoopAllocator, LoopGroup};
pub use poller::{Poller, SourceId};
pub use queue::{TaskQueue, WorkerPool};
pub use server::{ServerBuilder, TcpServer};
pub use source::EventSource;
