#![cfg_attr(any(nightly, docsrs), feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod carrier;
pub mod client;
pub mod event;
pub mod server;
pub mod signal;
pub mod slot_pool;

mod link;

pub use {client::Client, event::SubmitError, server::Server};
