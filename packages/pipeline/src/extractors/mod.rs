//! Extractor wrappers. Concrete extraction adapters live outside the
//! core; the wrappers here compose with any of them.

pub mod rate_limited;

pub use rate_limited::{ExtractorExt, RateLimitedExtractor};
