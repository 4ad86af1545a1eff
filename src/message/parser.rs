// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::*;
use crate::option::{OptionIterator, OptionNumber};
use crate::util::try_decode_u16;

/// Peeks at the fixed four-byte header of an encoded message without
/// decoding the rest of it.
///
/// Returns `None` if the buffer is too short or carries an unknown protocol
/// version. This is what decides whether a datagram that failed full
/// decoding is answered with a reset (recognizable header) or dropped
/// silently (not even a CoAP header).
pub fn peek_message_header(buffer: &[u8]) -> Option<(MsgType, MsgId)> {
    if buffer.len() < 4 {
        return None;
    }

    if (buffer[0] & COAP_MSG_VER_MASK) >> COAP_MSG_VER_OFFS != COAP_MSG_VERSION {
        return None;
    }

    let msg_type = MsgType::from((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS);
    let msg_id = buffer[3] as u16 | ((buffer[2] as u16) << 8);

    Some((msg_type, msg_id))
}

/// A class representing an immutable heap-allocated UDP CoAP message.
///
/// Construction fully validates the encoding: the header, the token length,
/// every option, and the payload-marker rule. A value of this type is
/// always a well-formed message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OwnedImmutableMessage {
    buffer: Vec<u8>,
    msg_code: MsgCode,
    msg_type: MsgType,
    msg_id: u16,
    token: MsgToken,
    content_format: Option<ContentFormat>,
    accept: Option<ContentFormat>,
    option_start: usize,
    payload_start: usize,
}

impl std::fmt::Display for OwnedImmutableMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        MessageDisplay(self).fmt(f)
    }
}

impl OwnedImmutableMessage {
    /// The minimum size of a buffer that can be passed into `new()`.
    pub const MIN_MESSAGE_BUFFER_LEN: usize = 4;

    /// Creates a new `OwnedImmutableMessage` instance with the given `buffer`.
    pub fn new(buffer: Vec<u8>) -> Result<OwnedImmutableMessage, Error> {
        if buffer.len() < OwnedImmutableMessage::MIN_MESSAGE_BUFFER_LEN {
            return Err(Error::ParseFailure);
        }

        if (buffer[0] & COAP_MSG_VER_MASK) >> COAP_MSG_VER_OFFS != COAP_MSG_VERSION {
            return Err(Error::ParseFailure);
        }

        let msg_code = MsgCode::try_from(buffer[1]).ok_or(Error::UnknownMessageCode)?;
        let msg_type = MsgType::from((buffer[0] & COAP_MSG_T_MASK) >> COAP_MSG_T_OFFS);
        let msg_id = buffer[3] as u16 | ((buffer[2] as u16) << 8);

        let token_len = (buffer[0] & COAP_MSG_TKL_MASK) as usize;
        if token_len > 8 || 4 + token_len > buffer.len() {
            return Err(Error::ParseFailure);
        }
        let token = MsgToken::new(&buffer[4..4 + token_len]);

        let mut content_format = None;
        let mut accept = None;

        let mut iter = OptionIterator::new(&buffer[4 + token_len..]);

        for result in &mut iter {
            match result {
                Ok((OptionNumber::CONTENT_FORMAT, value)) => {
                    content_format = Some(ContentFormat(
                        try_decode_u16(value).ok_or(Error::ParseFailure)?,
                    ));
                }
                Ok((OptionNumber::ACCEPT, value)) => match try_decode_u16(value) {
                    Some(x) => accept = Some(ContentFormat(x)),
                    None => return Err(Error::ParseFailure),
                },
                Ok((_key, _value)) => {
                    // Skip.
                }
                Err(e) => {
                    return Err(e);
                }
            }
        }

        if iter.hit_payload_marker() && iter.as_slice().is_empty() {
            // A payload marker followed by a zero-length payload is a
            // format error (RFC 7252 §3).
            return Err(Error::ParseFailure);
        }

        let payload_start = buffer.len() - iter.as_slice().len();
        let option_start = 4 + token_len;

        if msg_code.is_empty()
            && (token_len != 0 || payload_start != buffer.len() || option_start != buffer.len())
        {
            // An empty message is nothing but the four-byte header.
            return Err(Error::ParseFailure);
        }

        let ret = OwnedImmutableMessage {
            buffer,
            msg_code,
            msg_type,
            msg_id,
            token,
            content_format,
            accept,
            option_start,
            payload_start,
        };

        Ok(ret)
    }

    /// Returns a byte slice containing the encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

impl MessageRead for OwnedImmutableMessage {
    fn msg_code(&self) -> MsgCode {
        self.msg_code
    }

    fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    fn msg_id(&self) -> u16 {
        self.msg_id
    }

    fn msg_token(&self) -> MsgToken {
        self.token
    }

    fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_start..]
    }

    fn content_format(&self) -> Option<ContentFormat> {
        self.content_format
    }

    fn accept(&self) -> Option<ContentFormat> {
        self.accept
    }

    fn options(&self) -> OptionIterator<'_> {
        OptionIterator::new(&self.buffer[self.option_start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option::OptionInsert;

    fn encode_get(path: &str, msg_id: MsgId, token: &[u8]) -> Vec<u8> {
        let mut encoder = VecMessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::MethodGet);
        encoder.set_msg_id(msg_id);
        encoder.set_msg_token(MsgToken::new(token));
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            encoder
                .insert_option_with_str(OptionNumber::URI_PATH, segment)
                .unwrap();
        }
        encoder.into()
    }

    #[test]
    fn parses_request() {
        let message = OwnedImmutableMessage::new(encode_get("/sensors/temp", 0x1001, &[0xAB]))
            .expect("parse failed");
        assert_eq!(message.msg_type(), MsgType::Con);
        assert_eq!(message.msg_code(), MsgCode::MethodGet);
        assert_eq!(message.msg_id(), 0x1001);
        assert_eq!(message.msg_token(), MsgToken::new(&[0xAB]));
        assert!(message.payload().is_empty());
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x40, 0x01]),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x80, 0x01, 0x00, 0x01]),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn rejects_unknown_code() {
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x40, 0x1F, 0x00, 0x01]),
            Err(Error::UnknownMessageCode)
        );
    }

    #[test]
    fn rejects_oversized_token_length() {
        // TKL of 9 is reserved.
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x49, 0x01, 0x00, 0x01]),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn rejects_marker_without_payload() {
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x40, 0x01, 0x00, 0x01, 0xFF]),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn rejects_nonempty_empty_message() {
        // An empty-code message with a token is a format error.
        assert_eq!(
            OwnedImmutableMessage::new(vec![0x41, 0x00, 0x00, 0x01, 0xAB]),
            Err(Error::ParseFailure)
        );
    }

    #[test]
    fn accepts_bare_ack() {
        let message = OwnedImmutableMessage::new(vec![0x60, 0x00, 0x10, 0x01]).unwrap();
        assert_eq!(message.msg_type(), MsgType::Ack);
        assert!(message.msg_code().is_empty());
        assert_eq!(message.msg_id(), 0x1001);
    }

    #[test]
    fn header_peek_matches_parser() {
        let bytes = encode_get("/x", 0x2002, &[]);
        let (msg_type, msg_id) = peek_message_header(&bytes).unwrap();
        assert_eq!(msg_type, MsgType::Con);
        assert_eq!(msg_id, 0x2002);
        assert_eq!(peek_message_header(&[0u8; 3]), None);
    }
}
