//! Client side of a TWAIN Direct local scanner session.
//!
//! A [`Session`] opens a scanner session, long-polls for events, downloads the
//! image blocks the scanner announces and delivers complete image files in
//! block order through [`SessionEvent`]s.

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod source;

pub use config::ClientConfig;
pub use engine::events::{DeliveredImage, EventReceiver, SessionEvent};
pub use engine::session::{Session, SessionSnapshot};
pub use error::{Result, ScanError};
pub use source::http_source::HttpTransport;
pub use source::traits::ScannerTransport;
