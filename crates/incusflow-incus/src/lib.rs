//! Incus adapters for incusflow
//!
//! Each resource kind the incus client manages has a request type in
//! [`request`] and an adapter in [`resources`]; the adapters plug into
//! [`incusflow_core::Reconciler`]. [`query`] holds the read-only lookups.
//!
//! ```no_run
//! use incusflow_core::{ProcessExecutor, Reconciler};
//! use incusflow_incus::{Context, parse_requests};
//!
//! # fn main() -> incusflow_core::Result<()> {
//! let exec = ProcessExecutor::default();
//! let ctx = Context::default();
//! for envelope in parse_requests("kind: profile\nname: web\n")? {
//!     let adapter = envelope.request.adapter(&ctx)?;
//!     let outcome = Reconciler::new(&exec)
//!         .check_mode(envelope.check_mode)
//!         .reconcile(adapter.as_ref())?;
//!     println!("{}", outcome.msg);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod query;
pub mod request;
pub mod resources;

pub use client::Incus;
pub use query::ListFilter;
pub use request::{Common, Context, REQUEST_VERSION, Request, RequestEnvelope, parse_requests};
