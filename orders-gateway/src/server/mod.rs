//! サーバー層

pub mod http;
