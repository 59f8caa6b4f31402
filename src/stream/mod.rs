//! Notification chunks in, byte stream out.

pub mod adapter;
pub mod queue;

pub use adapter::{ByteStreamAdapter, ReadTimeout};
pub use queue::EventQueue;
