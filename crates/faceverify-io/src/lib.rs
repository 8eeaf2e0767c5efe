//! faceverify-io — Collaborators that feed the match evaluator.
//!
//! Provides the HTTP client for the reference-image service and the
//! capture sources that yield one detection set per polling tick.

pub mod capture;
pub mod reference_store;

pub use capture::{CaptureError, CaptureSource, ModelInfo, ReplaySource};
pub use reference_store::{AcquisitionError, HttpReferenceStore, ReferenceStore};
