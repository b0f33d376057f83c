//! # personlink API
//!
//! HTTP surface over a [`LinkerContext`](personlink_engine::LinkerContext).
//! Every route takes and returns JSON; engine errors become status codes.

pub mod rest;

pub use rest::RestApi;
