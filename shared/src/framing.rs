//! Transport framing: one logical packet is the gzip-compressed byte form of
//! one encoded mapping, sent as a single opaque frame over a numbered
//! channel. Channel 1 carries ping traffic, channel 2 everything else.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::wire::{self, WireError, WireValue};

/// Channel reserved for ping request/reply traffic.
pub const CHANNEL_PING: u8 = 1;
/// Channel carrying all other game traffic.
pub const CHANNEL_GAME: u8 = 2;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid gzip data: {0}")]
    Compression(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Encode and gzip one packet.
pub fn pack(value: &WireValue) -> Result<Vec<u8>, FrameError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&wire::encode(value))?;
    Ok(encoder.finish()?)
}

/// Gunzip and decode one packet. The decoded root must be a mapping.
pub fn unpack(frame: &[u8]) -> Result<WireValue, FrameError> {
    let mut decoder = GzDecoder::new(frame);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    Ok(wire::decode(&bytes)?)
}
