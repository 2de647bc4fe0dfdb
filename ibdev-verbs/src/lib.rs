//! libibverbs backend for `ibdev`.
//!
//! [`IbvDevice`] implements [`ibdev::Verbs`] over an opened `ibv_context`,
//! [`TokioEventLoop`] watches its async event descriptor from a tokio
//! runtime, and [`IbvQp`] exposes bare queue-pair state changes.

mod context;
mod event_loop;
mod qp;

pub use context::{IbvAh, IbvDevice, device_names};
pub use event_loop::TokioEventLoop;
pub use qp::IbvQp;
