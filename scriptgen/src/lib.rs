//! Turn a natural-language description into a verified shell script.
//!
//! A model writes a script and a test for it; the test runs in a throwaway
//! sandbox, and failures are fed back for repair until the test passes or
//! the attempt budget runs out. Verified scripts are cached by description.
//!
//! - **[`core`]**: Pure logic (cache keys, deny-list, shell flags, budgets).
//! - **[`io`]**: Side effects (sandboxed processes, cache files, config, HTTP).
//!   Each has a trait seam so tests can substitute scripted fakes.
//!
//! [`pipeline`] ties them together into the bounded generate, test, fix loop.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
