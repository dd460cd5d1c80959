//! Minimal ID3v2.3 writer for recording downloads.
//!
//! Supports plain text frames (`T***`), including `TXXX` user text frames.
//! Operates on raw in-memory audio buffers so tags can be rewritten before
//! the bytes are handed to the download manager.

const ID3_HEADER_SIZE: usize = 10;
const FRAME_HEADER_SIZE: usize = 10;
const TEXT_ENCODING_UTF16: u8 = 0x01;
const UTF16_BOM: [u8; 2] = [0xff, 0xfe];
const SYNC_SAFE_MAX: u32 = 0x0fff_ffff;

/// A text frame to embed. `Text` covers the regular `T***` frames keyed by
/// their 4-character id; `UserText` is the `TXXX` description/value form.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSpec {
    Text { id: String, value: String },
    UserText { description: String, value: String },
}

/// Removes any existing ID3v2 tag from the front of the buffer.
/// Returns the input unchanged when no well-formed tag is present.
pub fn strip_id3(audio: &[u8]) -> &[u8] {
    if audio.len() < ID3_HEADER_SIZE {
        return audio;
    }

    if audio[0] != 0x49 || audio[1] != 0x44 || audio[2] != 0x33 {
        return audio;
    }

    let tag_size = ID3_HEADER_SIZE
        + (((audio[6] & 0x7f) as usize) << 21)
        + (((audio[7] & 0x7f) as usize) << 14)
        + (((audio[8] & 0x7f) as usize) << 7)
        + ((audio[9] & 0x7f) as usize);

    if tag_size >= audio.len() {
        return audio;
    }

    &audio[tag_size..]
}

/// Attaches a fresh ID3v2.3 tag with the provided text frames, replacing
/// any tag already present. When no spec survives validation the stripped
/// audio comes back without an empty tag in front of it.
pub fn write_id3_tag(audio: &[u8], frame_specs: &[FrameSpec]) -> Vec<u8> {
    let sanitized = strip_id3(audio);
    let frames: Vec<Vec<u8>> = frame_specs.iter().filter_map(build_frame).collect();

    if frames.is_empty() {
        return sanitized.to_vec();
    }

    let frame_bytes_total: usize = frames.iter().map(Vec::len).sum();

    let mut output = Vec::with_capacity(ID3_HEADER_SIZE + frame_bytes_total + sanitized.len());
    output.extend_from_slice(&[0x49, 0x44, 0x33, 0x03, 0x00, 0x00]); // ID3, v2.3.0, no flags
    output.extend_from_slice(&to_sync_safe(frame_bytes_total));

    for frame in &frames {
        output.extend_from_slice(frame);
    }

    output.extend_from_slice(sanitized);
    output
}

fn build_frame(spec: &FrameSpec) -> Option<Vec<u8>> {
    match spec {
        FrameSpec::UserText { description, value } => {
            Some(create_user_text_frame(description, value))
        }
        FrameSpec::Text { id, value } => {
            let id = normalize_frame_id(id)?;
            if id == "TXXX" {
                return Some(create_user_text_frame("", value));
            }
            if !id.starts_with('T') {
                return None;
            }
            Some(create_text_frame(&id, value))
        }
    }
}

fn normalize_frame_id(id: &str) -> Option<String> {
    let id = id.trim().to_ascii_uppercase();
    if id.len() == 4 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(id)
    } else {
        None
    }
}

fn create_text_frame(id: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + UTF16_BOM.len() + value.len() * 2);
    body.push(TEXT_ENCODING_UTF16);
    body.extend_from_slice(&encode_utf16(value));
    wrap_frame(id, &body)
}

fn create_user_text_frame(description: &str, value: &str) -> Vec<u8> {
    let description_bytes = encode_utf16(description);
    let value_bytes = encode_utf16(value);

    let mut body = Vec::with_capacity(1 + description_bytes.len() + 2 + value_bytes.len());
    body.push(TEXT_ENCODING_UTF16);
    body.extend_from_slice(&description_bytes);
    body.extend_from_slice(&[0x00, 0x00]);
    body.extend_from_slice(&value_bytes);

    wrap_frame("TXXX", &body)
}

fn wrap_frame(id: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(id.as_bytes());

    let size = body.len() as u32;
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(body);
    frame
}

fn encode_utf16(value: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(UTF16_BOM.len() + value.len() * 2);
    buffer.extend_from_slice(&UTF16_BOM);
    for unit in value.encode_utf16() {
        buffer.extend_from_slice(&unit.to_le_bytes());
    }
    buffer
}

fn to_sync_safe(value: usize) -> [u8; 4] {
    let safe = (value.min(SYNC_SAFE_MAX as usize)) as u32;
    [
        ((safe >> 21) & 0x7f) as u8,
        ((safe >> 14) & 0x7f) as u8,
        ((safe >> 7) & 0x7f) as u8,
        (safe & 0x7f) as u8,
    ]
}
