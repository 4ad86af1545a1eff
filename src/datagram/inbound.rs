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

//! Servicing of inbound requests: the acknowledgement-delay race and the
//! piggy-backed/separate response decision.

use super::*;
use futures::prelude::*;
use futures_timer::Delay;
use std::sync::Arc;

/// Serializes a [`Response`] into wire bytes with the given message type,
/// id, and token.
pub(super) fn encode_response(
    response: &Response,
    msg_type: MsgType,
    msg_id: MsgId,
    token: MsgToken,
) -> Result<Vec<u8>, Error> {
    let mut builder = VecMessageEncoder::new();
    builder.set_msg_type(msg_type);
    builder.set_msg_token(token);
    response.write_to(&mut builder)?;
    builder.set_msg_id(msg_id);
    Ok(builder.into())
}

/// Serializes a bare acknowledgement for `msg_id`.
pub(super) fn encode_empty_ack(msg_id: MsgId) -> Vec<u8> {
    let mut buffer = [0u8; BufferMessageEncoder::MIN_MESSAGE_BUFFER_LEN];
    let mut builder = BufferMessageEncoder::new(&mut buffer);
    builder.set_msg_id(msg_id);
    let _ = AckMessage.write_msg_to(&mut builder);
    builder.as_bytes().to_vec()
}

/// Serializes a reset for `msg_id`.
pub(super) fn encode_reset(msg_id: MsgId) -> Vec<u8> {
    let mut buffer = [0u8; BufferMessageEncoder::MIN_MESSAGE_BUFFER_LEN];
    let mut builder = BufferMessageEncoder::new(&mut buffer);
    builder.set_msg_id(msg_id);
    let _ = ResetMessage.write_msg_to(&mut builder);
    builder.as_bytes().to_vec()
}

/// Returns true if the request carries a critical option this layer does
/// not understand, which forces a 4.02 Bad Option response.
fn has_unknown_critical_option(request: &OwnedImmutableMessage) -> bool {
    request.options().any(|result| match result {
        Ok((number, _)) => number.is_critical() && !number.is_understood_in_request(),
        Err(_) => false,
    })
}

/// Drives one inbound request from registry insertion to transmitted
/// response.
///
/// For a confirmable request, the service's response races a
/// `Delay(ACK_DELAY)`:
///
/// * response first: it is sent as a piggy-backed acknowledgement, with the
///   request's message id and token;
/// * delay first: a bare acknowledgement goes out (claimed through the
///   registry's atomic phase transition, so the two outcomes are mutually
///   exclusive) and the response later travels as a separate confirmable
///   exchange with a fresh message id, retransmitted until the remote
///   acknowledges it.
///
/// Either way the serialized response is attached to the registry entry so
/// that duplicates of the request are answered verbatim without invoking
/// the service again.
pub(super) async fn service_request<US, TP>(
    endpoint: Arc<LocalEndpointInner<US, TP>>,
    request: OwnedImmutableMessage,
    src: US::SocketAddr,
    epoch: u64,
) where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    let params = endpoint.trans_params();
    let request_mid = request.msg_id();
    let token = request.msg_token();
    let confirmable = request.msg_type().is_con();

    let mut response_future = if has_unknown_critical_option(&request) {
        debug!("Request {:04X} carries an unknown critical option", request_mid);
        future::ready(Response::bad_option()).boxed().fuse()
    } else {
        endpoint
            .services()
            .dispatch(&request, src, params.coap_max_transmit_span())
            .fuse()
    };

    let early_response = if confirmable {
        let mut ack_delay = Delay::new(params.coap_ack_delay()).fuse();
        futures::select! {
            response = response_future => Some(response),
            _ = ack_delay => None,
        }
    } else {
        Some((&mut response_future).await)
    };

    let response = match early_response {
        Some(response) => {
            if confirmable {
                // The service beat the acknowledgement timer; try to answer
                // piggy-backed.
                let bytes = match encode_response(&response, MsgType::Ack, request_mid, token) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to encode response: {}", e);
                        return;
                    }
                };

                if endpoint
                    .registry()
                    .claim_piggyback(src, request_mid, epoch, bytes.clone())
                {
                    debug!("Responding piggy-backed to {:04X}", request_mid);
                    endpoint.send_bytes(&bytes, src).await;
                    return;
                }
                // The entry is gone; fall through to a non-confirmable
                // response with a fresh message id.
            }
            response
        }
        None => {
            // The acknowledgement timer won the race: confirm now, respond
            // separately once the service resolves.
            if endpoint.registry().mark_confirmed(src, request_mid, epoch) {
                debug!("Sending delayed empty ack for {:04X}", request_mid);
                endpoint.send_bytes(&encode_empty_ack(request_mid), src).await;
            }

            response_future.await
        }
    };

    let response_mid = match endpoint.msg_id_factory().allocate() {
        Ok(response_mid) => response_mid,
        Err(e) => {
            warn!("Dropping response for {:04X}: {}", request_mid, e);
            return;
        }
    };

    // A confirmed exchange gets its response as a separate confirmable,
    // retransmitted until acknowledged; a non-confirmable request gets a
    // non-confirmable response. The cached copy answers later duplicates.
    let mut msg_type = if confirmable {
        MsgType::Con
    } else {
        MsgType::Non
    };

    let mut bytes = match encode_response(&response, msg_type, response_mid, token) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode response: {}", e);
            return;
        }
    };

    if !endpoint
        .registry()
        .attach_response(src, request_mid, epoch, bytes.clone())
        && msg_type.is_con()
    {
        // The exchange was evicted while the service was working; the late
        // response is downgraded to non-confirmable.
        msg_type = MsgType::Non;
        bytes = match encode_response(&response, msg_type, response_mid, token) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode response: {}", e);
                return;
            }
        };
    }

    debug!(
        "Responding separately to {:04X} as {:?} {:04X}",
        request_mid, msg_type, response_mid
    );

    let result = ExchangeFuture::new(
        &endpoint,
        src,
        bytes,
        response_mid,
        None,
        msg_type.is_con(),
        ReplyExpectation::Acknowledgement,
    )
    .await;

    match result {
        Ok(_) => debug!("Separate response {:04X} acknowledged", response_mid),
        Err(Error::Reset) => info!("Separate response {:04X} was reset by peer", response_mid),
        Err(e) => warn!("Separate response {:04X} failed: {}", response_mid, e),
    }
}
