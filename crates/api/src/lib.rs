//! Operational HTTP surface: health and queue visibility.

pub mod app;
