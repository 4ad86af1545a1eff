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
use crate::util::try_decode_u16;
use core::fmt::{Display, Formatter};

/// Provides an implementation of [`core::fmt::Debug`] and [`core::fmt::Display`] for
/// any type implementing [`MessageRead`].
#[derive(Debug)]
pub struct MessageDisplay<'a, T: MessageRead + ?Sized>(pub &'a T);

impl<'a, T: MessageRead + ?Sized> Display for MessageDisplay<'a, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "<{:?} {:?}", self.0.msg_type(), self.0.msg_code())?;
        write!(f, " MID:{:04X}", self.0.msg_id())?;

        let mut content_format: Option<u16> = None;

        let token = self.0.msg_token();
        if !token.is_empty() {
            write!(f, " TOK:{}", token)?;
        }

        for option in self.0.options() {
            match option {
                Ok((number, bytes)) => {
                    if number == OptionNumber::CONTENT_FORMAT {
                        content_format = try_decode_u16(bytes);
                    }
                    f.write_str(" ")?;
                    number.fmt_with_value(f, bytes)?;
                }
                Err(e) => return write!(f, " ERR:{:?}>", e),
            }
        }

        let payload = self.0.payload();
        if !payload.is_empty() {
            let payload_str_opt = if let Some(i) = content_format {
                if ContentFormat(i).is_utf8() {
                    std::str::from_utf8(payload).ok()
                } else {
                    None
                }
            } else {
                std::str::from_utf8(payload).ok()
            };

            if let Some(payload_str) = payload_str_opt {
                write!(f, " {:?}", payload_str)?;
            } else {
                write!(f, " {:?}", payload)?;
            }
        }

        write!(f, ">")
    }
}

/// Formats an encoded datagram for the transmission logs.
///
/// Well-formed bytes render through [`MessageDisplay`]. Bytes the parser
/// rejects still show whatever the fixed header reveals (the same header
/// peek the reset-on-malformed path relies on), followed by a hex dump, so
/// a rejected datagram can be matched to the reset it provoked.
#[derive(Copy, Clone)]
pub struct CoapByteDisplayFormatter<'buf>(pub &'buf [u8]);

impl<'buf> std::fmt::Display for CoapByteDisplayFormatter<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match OwnedImmutableMessage::new(self.0.to_vec()) {
            Ok(message) => MessageDisplay(&message).fmt(f),
            Err(e) => match peek_message_header(self.0) {
                Some((msg_type, msg_id)) => write!(
                    f,
                    "<{:?} MID:{:04X} {:?} {:02x?}>",
                    msg_type, msg_id, e, self.0
                ),
                None => write!(f, "<NOT-COAP {:02x?}>", self.0),
            },
        }
    }
}

impl<'buf> std::fmt::Debug for CoapByteDisplayFormatter<'buf> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CoapByteDisplayFormatter({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_bytes_still_show_their_header() {
        // TKL 9 is reserved, so the parse fails, but the header is readable.
        let rendered = format!("{}", CoapByteDisplayFormatter(&[0x49, 0x01, 0x12, 0x34]));
        assert!(rendered.contains("MID:1234"), "{}", rendered);
    }

    #[test]
    fn non_coap_bytes_are_hex_dumped() {
        let rendered = format!("{}", CoapByteDisplayFormatter(&[0x00]));
        assert!(rendered.contains("NOT-COAP"), "{}", rendered);
    }
}
