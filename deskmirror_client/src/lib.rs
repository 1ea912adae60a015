#![forbid(unsafe_code)]
//! HTTP transport for the remote helpdesk, implementing
//! `deskmirror_core::RemoteApi` on top of reqwest.

mod client;
mod config;
mod error;

pub use client::HelpdeskClient;
pub use config::RemoteConfig;
pub use error::classify;
