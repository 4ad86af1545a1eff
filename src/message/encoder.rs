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

use super::codec::*;
use super::*;
use crate::option::{OptionInsert, OptionNumber};

/// A class for writing stand-alone messages to a mutable byte slice.
///
/// Options must be inserted in ascending order; the payload comes last.
#[derive(Debug)]
pub struct BufferMessageEncoder<'buf> {
    buffer: &'buf mut [u8],
    len: usize,
    option_start: usize,
    payload_start: usize,
    last_option: OptionNumber,
}

impl<'buf> BufferMessageEncoder<'buf> {
    /// The minimum size buffer that can be passed into `new`.
    pub const MIN_MESSAGE_BUFFER_LEN: usize = 12;

    /// Creates a new `BufferMessageEncoder` using the given buffer.
    pub fn new(buffer: &'buf mut [u8]) -> BufferMessageEncoder<'buf> {
        if buffer.len() < BufferMessageEncoder::MIN_MESSAGE_BUFFER_LEN {
            panic!("Buffer too small");
        }

        // Set version on first byte.
        buffer[0] = COAP_MSG_VERSION << COAP_MSG_VER_OFFS;

        BufferMessageEncoder {
            buffer,
            len: 4,
            option_start: 4,
            payload_start: 4,
            last_option: Default::default(),
        }
    }

    /// Returns a byte slice containing the encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Returns the token set for this message.
    pub fn msg_token(&self) -> MsgToken {
        let token_len = (self.buffer[0] & COAP_MSG_TKL_MASK) as usize;
        MsgToken::new(&self.buffer[4..4 + token_len])
    }
}

impl<'buf> std::fmt::Display for BufferMessageEncoder<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        CoapByteDisplayFormatter(self.as_bytes()).fmt(f)
    }
}

impl<'buf> core::ops::Deref for BufferMessageEncoder<'buf> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl<'buf> MessageWrite for BufferMessageEncoder<'buf> {
    fn set_msg_type(&mut self, tt: MsgType) {
        self.buffer[0] = (self.buffer[0] & !COAP_MSG_T_MASK) | ((tt as u8) << COAP_MSG_T_OFFS);
    }

    fn set_msg_id(&mut self, msg_id: u16) {
        self.buffer[2] = (msg_id >> 8) as u8;
        self.buffer[3] = msg_id as u8;
    }

    fn set_msg_code(&mut self, code: MsgCode) {
        self.buffer[1] = code as u8;
    }

    fn set_msg_token(&mut self, token: MsgToken) {
        if self.option_start != 4 + token.len() {
            self.len = 4 + token.len();
            self.option_start = self.len;
            self.payload_start = self.option_start;

            self.buffer[0] = (self.buffer[0] & !COAP_MSG_TKL_MASK) | token.len() as u8;
        }

        self.buffer[4..4 + token.len()].copy_from_slice(token.as_bytes());
    }

    fn append_payload_bytes(&mut self, body: &[u8]) -> Result<(), Error> {
        if self.len == self.payload_start {
            if self.payload_start >= self.buffer.len() {
                return Err(Error::OutOfSpace);
            }
            // Append an end-of-options marker.
            self.buffer[self.payload_start] = 0xFF;
            self.len += 1;
        }

        let new_body_end = self.len + body.len();

        if new_body_end > self.buffer.len() {
            return Err(Error::OutOfSpace);
        }

        self.buffer[self.len..new_body_end].copy_from_slice(body);
        self.len = new_body_end;

        Ok(())
    }

    fn clear(&mut self) {
        self.buffer[0] = COAP_MSG_VERSION << COAP_MSG_VER_OFFS;
        self.len = 4;
        self.option_start = 4;
        self.payload_start = 4;
        self.last_option = Default::default();
    }
}

impl<'buf> OptionInsert for BufferMessageEncoder<'buf> {
    fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error> {
        if self.len > self.payload_start {
            // Payload has already been started.
            return Err(Error::InvalidArgument);
        }
        if self.last_option == key && !key.is_repeatable() {
            return Err(Error::OptionNotRepeatable);
        }
        let len = self.len;
        let written = encode_option(&mut self.buffer[len..], self.last_option, key, value)?;

        self.last_option = key;
        self.len = len + written;
        self.payload_start = self.len;

        Ok(())
    }
}

/// A class for writing stand-alone messages to a heap-allocated [`Vec`].
#[derive(Debug)]
pub struct VecMessageEncoder {
    buffer: Vec<u8>,
    option_start: usize,
    payload_start: usize,
    last_option: OptionNumber,
}

impl VecMessageEncoder {
    /// Creates a new `VecMessageEncoder` instance.
    pub fn new() -> VecMessageEncoder {
        Self::with_payload_capacity(16)
    }

    /// Creates a new `VecMessageEncoder` instance with a specific capacity.
    pub fn with_payload_capacity(capacity: usize) -> VecMessageEncoder {
        let mut buffer = Vec::with_capacity(16 + capacity);

        // Set version on first byte.
        buffer.push(COAP_MSG_VERSION << COAP_MSG_VER_OFFS);
        buffer.resize(4, 0);

        VecMessageEncoder {
            buffer,
            option_start: 4,
            payload_start: 4,
            last_option: Default::default(),
        }
    }

    /// Returns a byte slice containing the encoded message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Returns the token set for this message.
    pub fn msg_token(&self) -> MsgToken {
        let token_len = (self.buffer[0] & COAP_MSG_TKL_MASK) as usize;
        MsgToken::new(&self.buffer[4..4 + token_len])
    }
}

impl std::convert::From<VecMessageEncoder> for Vec<u8> {
    fn from(x: VecMessageEncoder) -> Self {
        x.buffer
    }
}

impl std::convert::From<VecMessageEncoder> for OwnedImmutableMessage {
    fn from(x: VecMessageEncoder) -> Self {
        OwnedImmutableMessage::new(x.buffer).expect("Encoding corrupt")
    }
}

impl Default for VecMessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VecMessageEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        CoapByteDisplayFormatter(self.as_bytes()).fmt(f)
    }
}

impl core::ops::Deref for VecMessageEncoder {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl MessageWrite for VecMessageEncoder {
    fn set_msg_type(&mut self, tt: MsgType) {
        self.buffer[0] = (self.buffer[0] & !COAP_MSG_T_MASK) | ((tt as u8) << COAP_MSG_T_OFFS);
    }

    fn set_msg_id(&mut self, msg_id: u16) {
        self.buffer[2] = (msg_id >> 8) as u8;
        self.buffer[3] = msg_id as u8;
    }

    fn set_msg_code(&mut self, code: MsgCode) {
        self.buffer[1] = code as u8;
    }

    fn set_msg_token(&mut self, token: MsgToken) {
        if self.option_start != 4 + token.len() {
            self.buffer.resize(4 + token.len(), 0);
            self.option_start = self.buffer.len();
            self.payload_start = self.option_start;

            self.buffer[0] = (self.buffer[0] & !COAP_MSG_TKL_MASK) | token.len() as u8;
        }
        self.buffer[4..4 + token.len()].copy_from_slice(token.as_bytes());
    }

    fn append_payload_bytes(&mut self, body: &[u8]) -> Result<(), Error> {
        if self.buffer.len() == self.payload_start {
            // Append an end-of-options marker.
            self.buffer.push(0xFF);
        }

        self.buffer.extend_from_slice(body);

        Ok(())
    }

    fn clear(&mut self) {
        self.buffer.truncate(4);
        self.buffer[0] = COAP_MSG_VERSION << COAP_MSG_VER_OFFS;
        self.option_start = 4;
        self.payload_start = 4;
        self.last_option = Default::default();
    }
}

impl OptionInsert for VecMessageEncoder {
    fn insert_option_with_bytes(&mut self, key: OptionNumber, value: &[u8]) -> Result<(), Error> {
        if self.buffer.len() > self.payload_start {
            // Payload has already been started.
            return Err(Error::InvalidArgument);
        }
        if self.last_option > key {
            // Options are delta-encoded; a descending key cannot be appended.
            return Err(Error::InvalidArgument);
        }
        if self.last_option == key && !key.is_repeatable() {
            return Err(Error::OptionNotRepeatable);
        }

        let len = self.buffer.len();
        let needed = calc_option_size(self.last_option, key, value.len());
        self.buffer.resize(len + needed, 0);

        let written = encode_option(&mut self.buffer[len..], self.last_option, key, value)?;
        debug_assert_eq!(written, needed);

        self.last_option = key;
        self.payload_start = self.buffer.len();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_header_fields() {
        let mut buffer = [0u8; 64];
        let mut encoder = BufferMessageEncoder::new(&mut buffer);
        encoder.set_msg_type(MsgType::Ack);
        encoder.set_msg_code(MsgCode::SuccessContent);
        encoder.set_msg_id(0x1001);
        encoder.set_msg_token(MsgToken::new(&[0xAB]));
        encoder.append_payload_bytes(b"23").unwrap();

        let bytes = encoder.as_bytes();
        assert_eq!(bytes[0], 0b0110_0001); // version 1, ACK, TKL 1
        assert_eq!(bytes[1], 0x45);
        assert_eq!(bytes[2], 0x10);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(bytes[4], 0xAB);
        assert_eq!(bytes[5], 0xFF);
        assert_eq!(&bytes[6..], b"23");
    }

    #[test]
    fn empty_message_is_four_bytes() {
        let mut buffer = [0u8; 12];
        let mut encoder = BufferMessageEncoder::new(&mut buffer);
        encoder.set_msg_type(MsgType::Rst);
        encoder.set_msg_id(0x2002);
        assert_eq!(encoder.as_bytes().len(), 4);
    }

    #[test]
    fn vec_encoder_options_round_trip() {
        let mut encoder = VecMessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(MsgCode::MethodGet);
        encoder.set_msg_id(1);
        encoder.set_msg_token(MsgToken::new(b"tk"));
        encoder
            .insert_option_with_str(OptionNumber::URI_PATH, "sensors")
            .unwrap();
        encoder
            .insert_option_with_str(OptionNumber::URI_PATH, "temp")
            .unwrap();
        encoder
            .insert_option_with_u32(OptionNumber::ACCEPT, 0)
            .unwrap();

        let message = OwnedImmutableMessage::new(encoder.into()).unwrap();

        let decoded: Vec<(OptionNumber, Vec<u8>)> = message
            .options()
            .map(|r| r.map(|(k, v)| (k, v.to_vec())))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            decoded,
            vec![
                (OptionNumber::URI_PATH, b"sensors".to_vec()),
                (OptionNumber::URI_PATH, b"temp".to_vec()),
                (OptionNumber::ACCEPT, vec![]),
            ]
        );
        assert_eq!(message.msg_token(), MsgToken::new(b"tk"));
    }

    #[test]
    fn non_repeatable_option_is_rejected() {
        let mut encoder = VecMessageEncoder::new();
        encoder
            .insert_option_with_u32(OptionNumber::MAX_AGE, 60)
            .unwrap();
        assert_eq!(
            encoder.insert_option_with_u32(OptionNumber::MAX_AGE, 90),
            Err(Error::OptionNotRepeatable)
        );
    }

    #[test]
    fn descending_option_order_is_rejected() {
        let mut encoder = VecMessageEncoder::new();
        encoder
            .insert_option_with_u32(OptionNumber::MAX_AGE, 60)
            .unwrap();
        assert_eq!(
            encoder.insert_option_with_str(OptionNumber::URI_PATH, "x"),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn options_after_payload_are_rejected() {
        let mut encoder = VecMessageEncoder::new();
        encoder.append_payload_bytes(b"x").unwrap();
        assert_eq!(
            encoder.insert_option_with_str(OptionNumber::URI_PATH, "a"),
            Err(Error::InvalidArgument)
        );
    }
}
