//! FLV file framing for the transcode passthrough: the inbound RTMP message
//! stream is reframed into FLV tags the encoder consumes on stdin.

use crate::rtmp::{Message, TYPE_AUDIO, TYPE_VIDEO};

/// FLV tag types.
pub const TAG_AUDIO: u8 = 8;
pub const TAG_VIDEO: u8 = 9;
pub const TAG_SCRIPT: u8 = 18;

/// Length of the FLV file header including the leading PreviousTagSize0.
pub const FILE_HEADER_LEN: usize = 13;

/// Build the 13-byte FLV file header: signature, version 1, A/V presence
/// flags, header size 9, and the zero PreviousTagSize that precedes the
/// first tag.
pub fn file_header(has_audio: bool, has_video: bool) -> [u8; FILE_HEADER_LEN] {
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    [
        b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    ]
}

/// Reframe an RTMP message as one FLV tag.
///
/// Audio and video keep their type; AMF command messages become script tags;
/// protocol control messages return `None` and must not reach the file.
pub fn encode_tag(msg: &Message) -> Option<Vec<u8>> {
    let tag_type = match msg.header.type_id {
        TYPE_AUDIO => TAG_AUDIO,
        TYPE_VIDEO => TAG_VIDEO,
        t if crate::rtmp::is_command_type(t) => TAG_SCRIPT,
        _ => return None,
    };

    let data_size = msg.payload.len();
    let timestamp = msg.header.timestamp;

    let mut out = Vec::with_capacity(11 + data_size + 4);
    out.push(tag_type);
    out.extend_from_slice(&[
        (data_size >> 16) as u8,
        (data_size >> 8) as u8,
        data_size as u8,
    ]);
    // 24-bit timestamp, then the extended byte carrying bits 24-31.
    out.extend_from_slice(&[
        (timestamp >> 16) as u8,
        (timestamp >> 8) as u8,
        timestamp as u8,
        (timestamp >> 24) as u8,
    ]);
    // StreamID, always zero in FLV files.
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&msg.payload);
    out.extend_from_slice(&((data_size as u32 + 11).to_be_bytes()));

    Some(out)
}
