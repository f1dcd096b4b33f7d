//! Entry points the rest of an application talks to.
//!
//! [`RateLimitGuard`] is the facade feature code calls; [`Console`] exposes
//! every limiter operation as line-delimited JSON for operators.

mod console;
mod guard;

pub use console::{Command, Console, Reply};
pub use guard::{GuardResponse, RateLimitGuard};
