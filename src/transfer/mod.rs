//! Chunked file transfer over established data channels

mod engine;

pub use engine::{format_bytes, ActiveTransfer, Direction, TransferEngine, TransferReport};

use crate::p2p::wire::WireError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("remote peer reported: {0}")]
    Remote(String),

    #[error("channel closed before the transfer completed")]
    ChannelClosed,

    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),

    #[error("transfer protocol violation: {0}")]
    Protocol(String),
}
