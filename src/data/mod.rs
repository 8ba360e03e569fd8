//! Data layer - plain values produced by the parser
//!
//! Tag trees and buffered messages. No parsing or routing logic lives here.

pub mod tag;

pub use tag::*;
