//! Per-technology location sources built on top of [`crate::source::SourceBase`]
//! and [`crate::web_source::WebSourceEngine`].

pub mod threeg;
pub mod wifi;
