//! Core trait abstractions: storage seams and the extraction contract.

pub mod extractor;
pub mod store;
