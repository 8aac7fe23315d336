//! Hermes: an RPC transport core with asynchronous dispatch and zero-copy
//! bulk data movement over a pluggable network abstraction.
//!
//! The core spawns no threads. Caller threads drive it through
//! [`Context::progress`] (poll the transports for completions) and
//! [`Context::trigger`] (dispatch completion callbacks):
//!
//! ```ignore
//! let class = Class::new(transport, ClassOptions::default())?;
//! class.register(42, Arc::new(|h| { /* handle request, respond */ Ok(()) }));
//! let context = Context::create(&class, 0)?;
//! loop {
//!     let _ = context.trigger(0, 16);
//!     match context.progress(100) {
//!         Ok(()) | Err(Error::Timeout) => {}
//!         Err(e) => return Err(e),
//!     }
//! }
//! ```
//!
//! Bulk transfers ([`bulk`]) describe exposed memory as segment lists and
//! move payloads with one-sided put/get, decoupled from the RPC messages
//! themselves.

pub mod bulk;

mod addr;
mod class;
mod context;
mod error;
mod handle;
mod header;
mod multirecv;
mod pool;
mod queue;
mod registry;

pub use addr::Address;
pub use class::{
    Class, ClassOptions, CounterSnapshot, IoDir, MoreDataCb, MoreDataDone, SlotKind, TransportSlot,
};
pub use context::Context;
pub use error::{Error, Result, RetCode};
pub use handle::{ForwardCallback, Handle, RespondCallback};
pub use header::MsgFlags;
pub use pool::PoolStats;
pub use queue::LookupCallback;
pub use registry::{RpcHandler, RpcId};

pub use hermes_na as na;
