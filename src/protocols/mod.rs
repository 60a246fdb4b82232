//! The wire protocols this crate must speak. Only graphite's plaintext metric
//! protocol is implemented here; the events API body lives with
//! `metric::Annotation`.

pub mod graphite;
