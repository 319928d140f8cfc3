//! Adaptive polling of a REST management API with conditional fetches.
//!
//! [`api::FetchClient`] performs ETag-aware requests and routes failures
//! through a single error policy. [`poller::PollTask`] repeatedly fetches one
//! endpoint and slows itself down when the server cannot keep up, and
//! [`poller::Registry`] owns one task per endpoint. [`hooks::HookBus`]
//! carries deferred notifications between them.

pub mod api;
pub mod core;
pub mod daemon;
pub mod hooks;
pub mod poller;
