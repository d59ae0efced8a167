#![cfg_attr(any(nightly, docsrs), feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod header;
pub mod packet;
pub mod queue;
pub mod reliable;
pub mod rtt;
pub mod seq;
pub mod stats;
pub mod unreliable;
pub mod window;
