//! Staged event-driven execution runtime.
//!
//! Requests move through a pipeline of [`stage::Stage`]s as
//! [`event::StageEvent`]s. Each stage runs on a [`thread_pool::ThreadPool`]
//! and either forwards an event to a next stage or completes it, running the
//! [`callback::CompletionCallback`]s pushed onto it by earlier stages.
//!
//! Pipelines are normally built from [`settings::SedaSettings`] through
//! [`seda_config::SedaConfig`], with stage classes looked up in a
//! [`registry::StageRegistry`].
pub mod callback;
pub mod dispatcher;
pub mod event;
pub mod history;
pub mod metrics;
pub mod registry;
pub mod seda_config;
pub mod settings;
pub mod stage;
pub mod thread_pool;
pub mod timer;
