//! FLV tag-header inspection: just enough parsing of audio/video payload
//! headers to classify frames without decoding media.

use crate::core::error::ProtocolError;
use crate::rtmp::{Message, TYPE_AUDIO, TYPE_VIDEO};

// Video frame types
pub const FRAME_KEYFRAME: u8 = 1;
pub const FRAME_INTERFRAME: u8 = 2;

// Video codec ids
pub const VIDEO_AVC: u8 = 7;
pub const VIDEO_HEVC: u8 = 12;

// AVC packet types
pub const AVC_SEQUENCE_HEADER: u8 = 0;
pub const AVC_NALU: u8 = 1;
pub const AVC_END_OF_SEQUENCE: u8 = 2;

// Audio formats
pub const AUDIO_MP3: u8 = 2;
pub const AUDIO_AAC: u8 = 10;

/// FLV audio sample rates indexed by the 2-bit rate field.
const SAMPLE_RATES: [u32; 4] = [5500, 11000, 22000, 44100];

/// Parsed leading bytes of a video payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTagHeader {
    pub frame_type: u8,
    pub codec_id: u8,
    /// Only meaningful when `codec_id == VIDEO_AVC`.
    pub avc_packet_type: u8,
    /// Signed 24-bit composition time offset, AVC only.
    pub composition_time: i32,
}

/// Parsed leading bytes of an audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTagHeader {
    pub format: u8,
    pub sample_rate: u32,
    pub sample_size: u8,
    pub stereo: bool,
    /// Only meaningful when `format == AUDIO_AAC`.
    pub aac_packet_type: u8,
}

pub fn parse_video_header(payload: &[u8]) -> Result<VideoTagHeader, ProtocolError> {
    let Some(&b) = payload.first() else {
        return Err(ProtocolError::Truncated);
    };

    let mut header = VideoTagHeader {
        frame_type: (b >> 4) & 0x0F,
        codec_id: b & 0x0F,
        avc_packet_type: 0,
        composition_time: 0,
    };

    if header.codec_id == VIDEO_AVC {
        if payload.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        header.avc_packet_type = payload[1];

        if payload.len() >= 5 {
            let mut cts =
                i32::from(payload[2]) << 16 | i32::from(payload[3]) << 8 | i32::from(payload[4]);
            // Sign extension for the 24-bit field.
            if cts & 0x80_0000 != 0 {
                cts |= !0xFF_FFFF;
            }
            header.composition_time = cts;
        }
    }

    Ok(header)
}

pub fn parse_audio_header(payload: &[u8]) -> Result<AudioTagHeader, ProtocolError> {
    let Some(&b) = payload.first() else {
        return Err(ProtocolError::Truncated);
    };

    let format = (b >> 4) & 0x0F;
    let rate_idx = ((b >> 2) & 0x03) as usize;
    let size_idx = (b >> 1) & 0x01;
    let stereo = b & 0x01 == 1;

    let mut header = AudioTagHeader {
        format,
        sample_rate: SAMPLE_RATES[rate_idx],
        sample_size: if size_idx == 1 { 16 } else { 8 },
        stereo,
        aac_packet_type: 0,
    };

    if format == AUDIO_AAC {
        if payload.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        header.aac_packet_type = payload[1];
    }

    Ok(header)
}

impl Message {
    pub fn is_video_keyframe(&self) -> bool {
        self.header.type_id == TYPE_VIDEO
            && parse_video_header(&self.payload)
                .map(|h| h.frame_type == FRAME_KEYFRAME)
                .unwrap_or(false)
    }

    pub fn is_avc_sequence_header(&self) -> bool {
        self.header.type_id == TYPE_VIDEO
            && parse_video_header(&self.payload)
                .map(|h| h.codec_id == VIDEO_AVC && h.avc_packet_type == AVC_SEQUENCE_HEADER)
                .unwrap_or(false)
    }

    pub fn is_aac_sequence_header(&self) -> bool {
        self.header.type_id == TYPE_AUDIO
            && parse_audio_header(&self.payload)
                .map(|h| h.format == AUDIO_AAC && h.aac_packet_type == 0)
                .unwrap_or(false)
    }
}
