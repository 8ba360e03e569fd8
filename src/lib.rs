//! tagstream - incremental parser and router for the GemStone IV game stream
//!
//! The server (usually via a Lich proxy) sends an XML-like stream in chunks of
//! any size. [`parser::StreamParser`] turns those chunks into tag trees,
//! [`core::StreamRouter`] splits stream regions into per-stream buffers, and
//! [`core::EventBus`] lets interested parties react to specific tags.

pub mod config;
pub mod core;
pub mod data;
pub mod network;
pub mod parser;
