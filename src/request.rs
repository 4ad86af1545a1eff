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

/// Builder for an outbound CoAP request.
///
/// The caller picks the method, the path, and whether the request travels
/// confirmable (the default, retransmitted until acknowledged) or
/// non-confirmable. Message id and token are assigned by the endpoint when
/// the request is sent.
///
/// ```
/// use coap_exchange::CoapRequest;
///
/// let request = CoapRequest::get().path("/sensors/temp");
/// let noisy = CoapRequest::post()
///     .path("/actuators/led")
///     .payload("on")
///     .nonconfirmable();
/// ```
#[derive(Debug, Clone)]
pub struct CoapRequest {
    method: MsgCode,
    msg_type: MsgType,
    path: String,
    query: Vec<String>,
    payload: Vec<u8>,
    content_format: Option<ContentFormat>,
    accept: Option<ContentFormat>,
}

impl CoapRequest {
    fn new(method: MsgCode) -> CoapRequest {
        CoapRequest {
            method,
            msg_type: MsgType::Con,
            path: String::new(),
            query: Vec::new(),
            payload: Vec::new(),
            content_format: None,
            accept: None,
        }
    }

    /// Creates a GET request.
    pub fn get() -> CoapRequest {
        CoapRequest::new(MsgCode::MethodGet)
    }

    /// Creates a POST request.
    pub fn post() -> CoapRequest {
        CoapRequest::new(MsgCode::MethodPost)
    }

    /// Creates a PUT request.
    pub fn put() -> CoapRequest {
        CoapRequest::new(MsgCode::MethodPut)
    }

    /// Creates a DELETE request.
    pub fn delete() -> CoapRequest {
        CoapRequest::new(MsgCode::MethodDelete)
    }

    /// Sends this request non-confirmable: one transmission, no
    /// retransmission, the response correlated by token only.
    pub fn nonconfirmable(mut self) -> CoapRequest {
        self.msg_type = MsgType::Non;
        self
    }

    /// Sets the request path. Segments are separated by `/`; a leading `/`
    /// is accepted and ignored.
    pub fn path<P: Into<String>>(mut self, path: P) -> CoapRequest {
        self.path = path.into();
        self
    }

    /// Adds a Uri-Query option.
    pub fn query<Q: Into<String>>(mut self, query: Q) -> CoapRequest {
        self.query.push(query.into());
        self
    }

    /// Sets the request payload.
    pub fn payload<P: Into<Vec<u8>>>(mut self, payload: P) -> CoapRequest {
        self.payload = payload.into();
        self
    }

    /// Sets the Content-Format option describing the payload.
    pub fn content_format(mut self, content_format: ContentFormat) -> CoapRequest {
        self.content_format = Some(content_format);
        self
    }

    /// Sets the Accept option.
    pub fn accept(mut self, accept: ContentFormat) -> CoapRequest {
        self.accept = Some(accept);
        self
    }

    /// Returns the message type this request will be sent with.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Serializes this request with the given message id and token.
    pub(crate) fn encode(&self, msg_id: MsgId, token: MsgToken) -> Result<Vec<u8>, Error> {
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(self.msg_type);
        builder.set_msg_code(self.method);
        builder.set_msg_token(token);

        for segment in self.path.split('/').filter(|s| !s.is_empty()) {
            builder.insert_option_with_str(OptionNumber::URI_PATH, segment)?;
        }
        if let Some(content_format) = self.content_format {
            builder.insert_option_with_u32(OptionNumber::CONTENT_FORMAT, content_format.0 as u32)?;
        }
        for query in &self.query {
            builder.insert_option_with_str(OptionNumber::URI_QUERY, query)?;
        }
        if let Some(accept) = self.accept {
            builder.insert_option_with_u32(OptionNumber::ACCEPT, accept.0 as u32)?;
        }

        if !self.payload.is_empty() {
            builder.append_payload_bytes(&self.payload)?;
        }

        builder.set_msg_id(msg_id);
        Ok(builder.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_expected_wire_form() {
        let request = CoapRequest::get()
            .path("/sensors/temp")
            .accept(ContentFormat::TEXT_PLAIN_UTF8);
        let bytes = request
            .encode(0x1001, MsgToken::new(&[0xAB]))
            .expect("encode failed");

        let message = OwnedImmutableMessage::new(bytes).expect("parse failed");
        assert_eq!(message.msg_type(), MsgType::Con);
        assert_eq!(message.msg_code(), MsgCode::MethodGet);
        assert_eq!(message.msg_id(), 0x1001);
        assert_eq!(message.msg_token(), MsgToken::new(&[0xAB]));
        assert_eq!(message.accept(), Some(ContentFormat::TEXT_PLAIN_UTF8));
        assert_eq!(crate::request_path(&message), "/sensors/temp");
    }

    #[test]
    fn nonconfirmable_flag_sticks() {
        let request = CoapRequest::put().path("x").nonconfirmable().payload("1");
        let bytes = request.encode(7, MsgToken::EMPTY).unwrap();
        let message = OwnedImmutableMessage::new(bytes).unwrap();
        assert_eq!(message.msg_type(), MsgType::Non);
        assert_eq!(message.payload(), b"1");
    }
}
