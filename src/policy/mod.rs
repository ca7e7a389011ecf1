//! Request/response policy decisions.
//!
//! Everything here is pure: each function looks at a request, a stored
//! entry, and a clock instant, and returns a decision. The executor in
//! [`crate::exec`] is the only place those decisions are acted on.

pub mod conditional;
pub mod merge;
pub mod request;
pub mod response;
pub mod suitability;
pub mod validity;
