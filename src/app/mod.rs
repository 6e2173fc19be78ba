//! HTTP review API served by `chapterflow-app`.

pub mod api;
pub mod queue;
