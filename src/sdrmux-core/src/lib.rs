// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod frame;
pub mod multicast;
pub mod rtp;
pub mod status;
pub mod tlv;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use frame::{AudioFramer, FrameFormat, PcmFrame};
pub use multicast::{Interface, MulticastError};
pub use rtp::{RtpError, RtpHeader};
pub use status::{ChannelStatus, DemodType, FrontendStatus};
pub use tlv::{PacketBuilder, PacketType, TlvError, TlvReader};
