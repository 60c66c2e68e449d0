//! hzlink: the listener and invocation layer of a cluster client.
//!
//! Listeners registered through [`Client`] stay registered across
//! connection loss: every open connection receives every live registration,
//! connections that come back get them re-sent, and removal undoes them
//! everywhere. [`ReferenceIdGenerator`] hands out the monotonic reference
//! ids lock-style invocations carry.
//!
//! Connection management is not part of this crate. It is consumed through
//! the [`connection`] traits; [`loopback`] provides an in-process
//! implementation.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod logging;
pub mod loopback;
pub mod protocol;
pub mod reference_id;
pub mod registration;
pub mod time_unit;

pub use client::Client;
pub use codec::{EntryEvent, EntryListenerCodec, EntryListenerOptions, ListenerCodec};
pub use config::Config;
pub use error::{HzlinkError, Result};
pub use listener::ListenerService;
pub use reference_id::{ReferenceId, ReferenceIdGenerator};
pub use registration::{DistributedObjectKey, RegistrationState, UserRegistrationId};
pub use time_unit::{to_millis, TimeUnit, TimeValue};
