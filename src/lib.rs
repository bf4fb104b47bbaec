//! Client-side feature flag and experiment assignment engine for Mixpanel.
//!
//! Given a project's flag definitions and a per-request [EvaluationContext],
//! the engine deterministically assigns each eligible context to a rollout
//! and, within it, to a variant. Assignment needs no server coordination and
//! is reproducible across processes and SDK languages, because it reduces to
//! a fixed FNV-1a bucketing scheme over the context's identifier.
//!
//! Two providers are offered, each in a blocking and an async flavor:
//!
//! - [LocalFlagsProvider] / [AsyncLocalFlagsProvider] cache the project's
//!   definitions (fetched once at start, optionally refreshed by polling) and
//!   evaluate entirely in-process.
//! - [RemoteFlagsProvider] / [AsyncRemoteFlagsProvider] delegate every
//!   evaluation to the server.
//!
//! Both report an exposure event through the host-supplied [Tracker] whenever
//! a variant is actually served; evaluation failures of any kind resolve to
//! the caller's fallback instead of raising.
//!
//! ```no_run
//! use mixpanel_flags::{
//!     EvaluationContext, LocalFlagsConfig, LocalFlagsProvider, NoOpTracker,
//! };
//!
//! # fn main() -> Result<(), mixpanel_flags::FlagsError> {
//! let mut provider =
//!     LocalFlagsProvider::new("project-token", LocalFlagsConfig::default(), NoOpTracker)?;
//! provider.start();
//!
//! let context = EvaluationContext::new("user-42").with_custom_property("plan", "premium");
//! if provider.is_enabled("checkout_redesign", &context) {
//!     // serve the redesigned checkout
//! }
//! # Ok(())
//! # }
//! ```

mod bucketing;
mod config;
mod context;
mod error;
mod eval;
mod exposure;
mod flag;
mod flag_value;
mod local;
mod remote;
mod store;
mod test_common;
mod transport;

pub use bucketing::normalized_hash;
pub use config::{FlagsConfig, LocalFlagsConfig, RemoteFlagsConfig};
pub use context::EvaluationContext;
pub use error::FlagsError;
pub use eval::{evaluate, SelectedVariant};
pub use exposure::{NoOpTracker, Tracker, EXPOSURE_EVENT};
pub use flag::{Flag, Variant};
pub use flag_value::FlagValue;
pub use local::{AsyncLocalFlagsProvider, LocalFlagsProvider};
pub use remote::{AsyncRemoteFlagsProvider, RemoteFlagsProvider};
