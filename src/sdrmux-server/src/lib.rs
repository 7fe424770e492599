// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Multiplex core of the SDR web gateway.
//!
//! Many concurrent clients share one radio front end over two multicast
//! groups: commands and status flow on the control group, RTP audio and
//! spectrum frames on the data group. This crate owns channel control,
//! RTP demultiplexing, session lifecycle and rate limiting; protocol
//! front ends consume it through [`manager::SessionManager`] and
//! [`controller::RadioController`].

pub mod config;
pub mod controller;
pub mod error;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod net;
pub mod receiver;
pub mod session;

pub use config::GatewayConfig;
pub use controller::{RadioController, Squelch};
pub use error::{ControlError, SessionError};
pub use limiter::Limiters;
pub use manager::{CreateRequest, SessionManager, TuningUpdate};
pub use metrics::GatewayMetrics;
pub use session::{Session, SessionKind, Tuning};
