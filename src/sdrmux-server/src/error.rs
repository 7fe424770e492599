// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors from the control-plane send path. All of these are transient:
/// the current command fails, the process continues.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control send timed out")]
    Timeout,

    #[error("short control write ({sent} of {len} bytes)")]
    ShortWrite { sent: usize, len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors reported to callers of the session manager.
///
/// Admission rejections carry no side effects; `NotFound` covers lookups
/// of unknown ids as well as updates racing a destroy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("server at capacity ({0} sessions)")]
    CapacityExhausted(usize),

    #[error("too many sessions for {0}")]
    PerIpLimit(IpAddr),

    #[error("too many sessions for this user")]
    PerUserLimit,

    #[error("command rate limit exceeded")]
    RateLimited,

    #[error("unknown session {0}")]
    NotFound(String),

    #[error("session {0} belongs to another user")]
    NotOwner(String),

    #[error("update does not match the session kind")]
    KindMismatch,

    #[error("radio control failed: {0}")]
    Control(#[from] ControlError),
}
