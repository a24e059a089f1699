//! Callback scheduling and priority injection
//!
//! A callback is a promise to call a subject back at a given time. Shortly
//! before that time (and on every tick after it, until someone accepts or
//! completes it) the injector gives the subject a queue entry at an override
//! priority that sorts ahead of every computed score. Accepting a callback
//! tightens that priority further.

pub mod injector;

pub use injector::{CallbackInjector, InjectedCallback, InjectionReport, Routing};
