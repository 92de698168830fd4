//! OTA firmware packetization and transfer.
//!
//! The firmware image is cut into fixed 16-byte chunks, each framed
//! with its address and a per-packet checksum:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ u16 index or │ u16 CRC-16/  │ 16-byte payload              │
//! │ byte offset  │ CCITT(payload)│ (final packet zero-padded)  │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! The address field carries the packet index when the image does not
//! fit u16 byte offsets, the byte offset otherwise. A running
//! CRC-16/CCITT over all (padded) payload bytes forms the
//! whole-transfer checksum announced in the command line.
//!
//! Transfer flow: `ota -s=<totalPacketBytes> -c=<transferCRC>`, wait
//! for status `0` (device ready, no prior transfer in progress),
//! stream the packet buffer with bootloader-friendly pacing, complete
//! on status `3`. Any other status, or the literal `crc error`, is
//! fatal and is never retried at this layer.

use serde::{Deserialize, Serialize};

use crate::config::OtaTuning;
use crate::crc::{CRC_INIT, crc16_ccitt, crc16_ccitt_update};
use crate::error::{DecodeError, Error, ProtocolError, Result};
use crate::shell::{
    CRC_ERROR_LITERAL, STATUS_OK, STATUS_READY, ShellCommand, Transfer, Verdict,
    parse_status_line,
};
use crate::writer::FlowControl;

/// Payload bytes per packet.
pub const OTA_CHUNK_SIZE: usize = 16;
/// Address + checksum framing per packet.
pub const OTA_PACKET_OVERHEAD: usize = 4;
/// Full packet size on the wire.
pub const OTA_PACKET_SIZE: usize = OTA_CHUNK_SIZE + OTA_PACKET_OVERHEAD;

/// Byte order of the packet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtaEndian {
    Big,
    Little,
}

impl OtaEndian {
    fn put(self, out: &mut Vec<u8>, value: u16) {
        match self {
            Self::Big => out.extend_from_slice(&value.to_be_bytes()),
            Self::Little => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

// ── Packetizer ────────────────────────────────────────────────

/// A firmware image cut into checksummed packets.
pub struct OtaImage {
    packets: Vec<u8>,
    packet_count: u32,
    transfer_crc: u16,
    firmware_len: usize,
}

impl OtaImage {
    /// Build the full packet buffer for `firmware`.
    pub fn build(firmware: &[u8], endian: OtaEndian) -> Self {
        let packet_count = firmware.len().div_ceil(OTA_CHUNK_SIZE);
        let index_addressing = firmware.len() > usize::from(u16::MAX);

        let mut packets = Vec::with_capacity(packet_count * OTA_PACKET_SIZE);
        let mut transfer_crc = CRC_INIT;
        for index in 0..packet_count {
            let start = index * OTA_CHUNK_SIZE;
            let end = (start + OTA_CHUNK_SIZE).min(firmware.len());

            let mut payload = [0u8; OTA_CHUNK_SIZE];
            payload[..end - start].copy_from_slice(&firmware[start..end]);

            let address = if index_addressing {
                index as u16
            } else {
                start as u16
            };
            endian.put(&mut packets, address);
            endian.put(&mut packets, crc16_ccitt(&payload));
            packets.extend_from_slice(&payload);

            transfer_crc = crc16_ccitt_update(transfer_crc, &payload);
        }

        Self {
            packets,
            packet_count: packet_count as u32,
            transfer_crc,
            firmware_len: firmware.len(),
        }
    }

    /// The whole framed packet buffer, ready to stream.
    pub fn packets(&self) -> &[u8] {
        &self.packets
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// One framed packet.
    pub fn packet(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * OTA_PACKET_SIZE;
        self.packets.get(start..start + OTA_PACKET_SIZE)
    }

    /// Whole-transfer CRC-16/CCITT over the padded payload bytes.
    pub fn transfer_crc(&self) -> u16 {
        self.transfer_crc
    }

    pub fn firmware_len(&self) -> usize {
        self.firmware_len
    }
}

// ── Updater ───────────────────────────────────────────────────

/// The `ota` shell command: announce size and checksum, wait for the
/// device-ready status, stream every packet, complete on status `3`.
pub struct OtaUpdate {
    image: OtaImage,
    flow: FlowControl,
    streaming_started: bool,
}

impl OtaUpdate {
    pub fn new(firmware: &[u8], tuning: &OtaTuning) -> Self {
        Self {
            image: OtaImage::build(firmware, tuning.endian),
            flow: FlowControl {
                page_size: Some(tuning.page_size),
                page_interval: Some(tuning.page_interval()),
            },
            streaming_started: false,
        }
    }

    pub fn image(&self) -> &OtaImage {
        &self.image
    }
}

impl ShellCommand for OtaUpdate {
    fn command_line(&self) -> String {
        format!(
            "ota -s={} -c={}",
            self.image.packets.len(),
            self.image.transfer_crc
        )
    }

    fn gated_transfer(&self) -> Option<Transfer<'_>> {
        Some(Transfer {
            data: &self.image.packets,
            flow: self.flow,
        })
    }

    fn on_line(&mut self, line: &str) -> Result<Verdict> {
        if line.trim() == CRC_ERROR_LITERAL {
            return Err(Error::ProtocolFailure(ProtocolError::CrcReported));
        }
        match parse_status_line(line) {
            Some((STATUS_READY, _)) if !self.streaming_started => {
                self.streaming_started = true;
                Ok(Verdict::BeginTransfer)
            }
            Some((STATUS_OK, _)) if self.streaming_started => Ok(Verdict::Complete),
            Some((code, payload)) => {
                log::warn!("ota rejected: {code}:{payload}");
                Err(Error::ProtocolFailure(ProtocolError::Status(code)))
            }
            None => Err(Error::Decoding(DecodeError::MalformedLine(line.into()))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
