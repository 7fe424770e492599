// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

mod config;

pub use config::{ConfigError, ConfigFile};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber. Anything that does not parse
/// as a level runs at INFO.
pub fn init_logging(log_level: Option<&str>) {
    let level = match log_level.map(str::parse::<Level>) {
        Some(Ok(level)) => level,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();
}
