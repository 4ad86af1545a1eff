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

//! End-to-end exchanges over an in-memory socket pair, with shrunk
//! transmission timescales.

use coap_exchange::datagram::{
    AsyncRecvFrom, AsyncSendTo, DatagramLocalEndpoint, NullSocket, PairSocket, PairSocketAddr,
};
use coap_exchange::message::{BufferMessageEncoder, VecMessageEncoder};
use coap_exchange::option::OptionNumber;
use coap_exchange::prelude::*;

use futures::executor::block_on;
use futures::future::{select, Either};
use futures::pin_mut;
use futures::prelude::*;
use futures_timer::Delay;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Transmission parameters shrunk by a factor of twenty so a full
/// retransmission schedule fits in a few seconds of test time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
struct FastParams;

impl TransParams for FastParams {
    const COAP_ACK_TIMEOUT: Duration = Duration::from_millis(100);
    const COAP_MAX_LATENCY: Duration = Duration::from_millis(200);
}

type TestEndpoint = DatagramLocalEndpoint<PairSocket, FastParams>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The raw side of the pair: hand-encoded datagrams in, captured bytes out.
struct Wire {
    socket: PairSocket,
}

impl Wire {
    async fn recv(&self) -> Vec<u8> {
        let mut buffer = [0u8; 1152];
        let (len, _) = self
            .socket
            .recv_from(&mut buffer)
            .await
            .expect("wire recv failed");
        buffer[..len].to_vec()
    }

    async fn recv_msg(&self) -> OwnedImmutableMessage {
        OwnedImmutableMessage::new(self.recv().await).expect("wire got unparseable bytes")
    }

    /// Receives with a timeout; `None` means the wire stayed quiet.
    async fn recv_within(&self, window: Duration) -> Option<Vec<u8>> {
        let recv = self.recv();
        pin_mut!(recv);
        match select(recv, Delay::new(window)).await {
            Either::Left((bytes, _)) => Some(bytes),
            Either::Right(_) => None,
        }
    }

    async fn send(&self, bytes: &[u8]) {
        self.socket
            .send_to(bytes, PairSocketAddr::North)
            .await
            .expect("wire send failed");
    }
}

/// Creates an endpoint on the north end of a pair, handing the south end
/// to the test as the raw wire.
fn endpoint_and_wire() -> (TestEndpoint, Wire) {
    let (north, south) = PairSocket::pair();
    (
        DatagramLocalEndpoint::with_trans_params(north, FastParams),
        Wire { socket: south },
    )
}

/// Runs a scenario future against the endpoint's serve loop, returning the
/// scenario's result.
fn run_scenario<F, R>(endpoint: &TestEndpoint, scenario: F) -> R
where
    F: Future<Output = R>,
{
    let serve = endpoint.serve();
    pin_mut!(scenario, serve);

    match block_on(select(scenario, serve)) {
        Either::Left((result, _)) => result,
        Either::Right((err, _)) => panic!("Serve loop finished unexpectedly: {:?}", err),
    }
}

fn encode_request(
    method: MsgCode,
    msg_type: MsgType,
    path: &str,
    msg_id: MsgId,
    token: &[u8],
) -> Vec<u8> {
    let mut builder = VecMessageEncoder::new();
    builder.set_msg_type(msg_type);
    builder.set_msg_code(method);
    builder.set_msg_token(MsgToken::new(token));
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        builder
            .insert_option_with_str(OptionNumber::URI_PATH, segment)
            .unwrap();
    }
    builder.set_msg_id(msg_id);
    builder.into()
}

fn encode_empty(msg_type: MsgType, msg_id: MsgId) -> Vec<u8> {
    let mut buffer = [0u8; 12];
    let mut builder = BufferMessageEncoder::new(&mut buffer);
    builder.set_msg_type(msg_type);
    builder.set_msg_id(msg_id);
    builder.as_bytes().to_vec()
}

/// Resource answering GET with "23", either immediately or after a delay.
struct TempSensor {
    delay: Option<Duration>,
    invocations: AtomicUsize,
}

impl TempSensor {
    fn immediate() -> Arc<TempSensor> {
        Arc::new(TempSensor {
            delay: None,
            invocations: AtomicUsize::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<TempSensor> {
        Arc::new(TempSensor {
            delay: Some(delay),
            invocations: AtomicUsize::new(0),
        })
    }
}

impl Webservice<PairSocketAddr> for TempSensor {
    fn path(&self) -> &str {
        "/sensors/temp"
    }

    fn etag(&self) -> ETag {
        ETag::from(0x23u32)
    }

    fn handle(
        &self,
        _request: &OwnedImmutableMessage,
        _remote: &PairSocketAddr,
        promise: ResponsePromise,
    ) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let response =
            Response::content("23").with_content_format(ContentFormat::TEXT_PLAIN_UTF8);
        match self.delay {
            None => promise.resolve(response),
            Some(delay) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    promise.resolve(response);
                });
            }
        }
    }
}

#[test]
fn piggybacked_response() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    endpoint.register_service(TempSensor::immediate());

    run_scenario(&endpoint, async {
        wire.send(&encode_request(
            MsgCode::MethodGet,
            MsgType::Con,
            "/sensors/temp",
            0x1001,
            &[0xAB],
        ))
        .await;

        let response = wire.recv_msg().await;
        assert_eq!(response.msg_type(), MsgType::Ack);
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        assert_eq!(response.msg_id(), 0x1001);
        assert_eq!(response.msg_token(), MsgToken::new(&[0xAB]));
        assert_eq!(response.payload(), b"23");

        // The piggy-backed acknowledgement is the whole story: no empty
        // ACK, no separate response.
        assert_eq!(wire.recv_within(Duration::from_millis(400)).await, None);
    });
}

#[test]
fn separate_response() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    endpoint.register_service(TempSensor::slow(Duration::from_millis(400)));

    run_scenario(&endpoint, async {
        let started = Instant::now();
        wire.send(&encode_request(
            MsgCode::MethodGet,
            MsgType::Con,
            "/sensors/temp",
            0x1001,
            &[0xAB],
        ))
        .await;

        // First an empty acknowledgement, at roughly the ACK delay.
        let ack = wire.recv_msg().await;
        assert_eq!(ack.msg_type(), MsgType::Ack);
        assert!(ack.msg_code().is_empty());
        assert_eq!(ack.msg_id(), 0x1001);
        assert!(ack.msg_token().is_empty());
        assert!(started.elapsed() >= Duration::from_millis(80));

        // Then the response as a fresh confirmable exchange, correlated by
        // token.
        let response = wire.recv_msg().await;
        assert_eq!(response.msg_type(), MsgType::Con);
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        assert_ne!(response.msg_id(), 0x1001);
        assert_eq!(response.msg_token(), MsgToken::new(&[0xAB]));
        assert_eq!(response.payload(), b"23");

        // Acknowledge it and verify the exchange closes: nothing new on
        // the wire (a retransmission that crossed our ACK is tolerated).
        let response_bytes = response.as_bytes().to_vec();
        wire.send(&encode_empty(MsgType::Ack, response.msg_id())).await;
        while let Some(extra) = wire.recv_within(Duration::from_millis(500)).await {
            assert_eq!(extra, response_bytes);
        }
    });
}

#[test]
fn duplicate_request_is_answered_from_cache() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    let sensor = TempSensor::immediate();
    endpoint.register_service(sensor.clone());

    run_scenario(&endpoint, async {
        let request = encode_request(
            MsgCode::MethodGet,
            MsgType::Con,
            "/sensors/temp",
            0x1001,
            &[0xAB],
        );

        wire.send(&request).await;
        let first = wire.recv().await;

        wire.send(&request).await;
        let second = wire.recv().await;

        // The duplicate is answered byte-for-byte from the cache.
        assert_eq!(first, second);
        let decoded = OwnedImmutableMessage::new(first).unwrap();
        assert_eq!(decoded.msg_id(), 0x1001);
        assert_eq!(decoded.payload(), b"23");
    });

    assert_eq!(sensor.invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_of_inflight_request_is_dropped() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    endpoint.register_service(TempSensor::slow(Duration::from_millis(300)));

    run_scenario(&endpoint, async {
        let request = encode_request(
            MsgCode::MethodGet,
            MsgType::Con,
            "/sensors/temp",
            0x1001,
            &[0xAB],
        );

        wire.send(&request).await;
        // Duplicate arrives while the service is still thinking.
        wire.send(&request).await;

        // Exactly one empty ACK, then exactly one separate response.
        let ack = wire.recv_msg().await;
        assert!(ack.msg_code().is_empty());
        assert_eq!(ack.msg_type(), MsgType::Ack);

        let response = wire.recv_msg().await;
        assert_eq!(response.msg_type(), MsgType::Con);
        wire.send(&encode_empty(MsgType::Ack, response.msg_id())).await;

        assert_eq!(wire.recv_within(Duration::from_millis(250)).await, None);
    });
}

#[test]
fn unknown_path_yields_piggybacked_not_found() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    endpoint.register_service(TempSensor::immediate());

    run_scenario(&endpoint, async {
        wire.send(&encode_request(
            MsgCode::MethodGet,
            MsgType::Con,
            "/missing",
            0x3001,
            &[0x01],
        ))
        .await;

        let response = wire.recv_msg().await;
        assert_eq!(response.msg_type(), MsgType::Ack);
        assert_eq!(response.msg_code(), MsgCode::ClientErrorNotFound);
        assert_eq!(response.msg_id(), 0x3001);
        assert_eq!(response.msg_token(), MsgToken::new(&[0x01]));
    });
}

#[test]
fn unknown_critical_option_yields_bad_option() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();
    endpoint.register_service(TempSensor::immediate());

    run_scenario(&endpoint, async {
        // Uri-Path plus an unknown critical option (35, Proxy-Uri).
        let mut builder = VecMessageEncoder::new();
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::MethodGet);
        builder.set_msg_token(MsgToken::new(&[0x44]));
        builder
            .insert_option_with_str(OptionNumber::URI_PATH, "sensors")
            .unwrap();
        builder
            .insert_option_with_str(OptionNumber::URI_PATH, "temp")
            .unwrap();
        builder
            .insert_option_with_str(OptionNumber::PROXY_URI, "coap://elsewhere/x")
            .unwrap();
        builder.set_msg_id(0x3002);
        let bytes: Vec<u8> = builder.into();
        wire.send(&bytes).await;

        let response = wire.recv_msg().await;
        assert_eq!(response.msg_type(), MsgType::Ack);
        assert_eq!(response.msg_code(), MsgCode::ClientErrorBadOption);
        assert_eq!(response.msg_id(), 0x3002);
    });
}

#[test]
fn ping_is_ponged() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();

    run_scenario(&endpoint, async {
        wire.send(&encode_empty(MsgType::Con, 0x0F0F)).await;

        let pong = wire.recv_msg().await;
        assert_eq!(pong.msg_type(), MsgType::Rst);
        assert!(pong.msg_code().is_empty());
        assert_eq!(pong.msg_id(), 0x0F0F);
    });
}

#[test]
fn malformed_confirmable_is_reset() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();

    run_scenario(&endpoint, async {
        // Valid header, truncated token.
        wire.send(&[0x48, 0x01, 0x20, 0x20, 0xAA]).await;

        let reset = wire.recv_msg().await;
        assert_eq!(reset.msg_type(), MsgType::Rst);
        assert_eq!(reset.msg_id(), 0x2020);
    });
}

#[test]
fn confirmable_request_times_out_against_silence() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();

    let packets: RefCell<Vec<(Instant, Vec<u8>)>> = RefCell::new(Vec::new());

    let result = run_scenario(&endpoint, async {
        let send = endpoint.send(
            PairSocketAddr::South,
            CoapRequest::get().path("/unreachable"),
        );

        let collector = async {
            loop {
                let bytes = wire.recv().await;
                packets.borrow_mut().push((Instant::now(), bytes));
            }
        };

        pin_mut!(send, collector);
        match select(send, collector).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => unreachable!("collector never finishes"),
        }
    });

    assert_eq!(result.unwrap_err(), Error::ResponseTimeout);

    let packets = packets.into_inner();

    // Initial transmission plus MAX_RETRANSMIT retransmissions, all
    // byte-identical.
    assert_eq!(packets.len(), 5);
    for (_, bytes) in &packets[1..] {
        assert_eq!(bytes, &packets[0].1);
    }

    // Inter-transmission gaps double.
    let gaps: Vec<Duration> = packets
        .windows(2)
        .map(|pair| pair[1].0.duration_since(pair[0].0))
        .collect();
    for pair in gaps.windows(2) {
        assert!(
            pair[1] >= pair[0].mul_f32(1.5),
            "gaps are not doubling: {:?}",
            gaps
        );
    }
}

#[test]
fn peer_reset_closes_exchange_immediately() {
    init_logging();
    let (endpoint, wire) = endpoint_and_wire();

    let result = run_scenario(&endpoint, async {
        let send = endpoint.send(PairSocketAddr::South, CoapRequest::get().path("/x"));
        pin_mut!(send);

        let request = {
            let recv = wire.recv_msg();
            pin_mut!(recv);
            match select(recv, send.as_mut()).await {
                Either::Left((request, _)) => request,
                Either::Right((result, _)) => panic!("send finished early: {:?}", result),
            }
        };

        wire.send(&encode_empty(MsgType::Rst, request.msg_id())).await;

        let result = send.await;

        // No retransmission follows a reset.
        assert_eq!(wire.recv_within(Duration::from_millis(400)).await, None);
        result
    });

    assert_eq!(result.unwrap_err(), Error::Reset);
}

#[test]
fn client_pings_server() {
    init_logging();
    let (north, south) = PairSocket::pair();
    let server = DatagramLocalEndpoint::with_trans_params(north, FastParams);
    let client = DatagramLocalEndpoint::with_trans_params(south, FastParams);

    let scenario = client.ping(PairSocketAddr::North);
    let serve_client = client.serve();
    let serve_server = server.serve();
    pin_mut!(scenario, serve_client, serve_server);

    let serving = select(serve_client, serve_server);
    let result = match block_on(select(scenario, serving)) {
        Either::Left((result, _)) => result,
        Either::Right(_) => panic!("a serve loop finished unexpectedly"),
    };

    assert_eq!(result, Ok(()));
}

fn end_to_end(sensor: Arc<TempSensor>, request: CoapRequest) -> Result<OwnedImmutableMessage, Error> {
    let (north, south) = PairSocket::pair();
    let server = DatagramLocalEndpoint::with_trans_params(north, FastParams);
    let client = DatagramLocalEndpoint::with_trans_params(south, FastParams);

    server.register_service(sensor);

    let scenario = client.send(PairSocketAddr::North, request);
    let serve_client = client.serve();
    let serve_server = server.serve();
    pin_mut!(scenario, serve_client, serve_server);

    let serving = select(serve_client, serve_server);
    match block_on(select(scenario, serving)) {
        Either::Left((result, _)) => result,
        Either::Right(_) => panic!("a serve loop finished unexpectedly"),
    }
}

#[test]
fn end_to_end_piggybacked() {
    init_logging();
    let sensor = TempSensor::immediate();
    let response = end_to_end(
        sensor.clone(),
        CoapRequest::get().path("/sensors/temp"),
    )
    .expect("request failed");

    assert_eq!(response.msg_code(), MsgCode::SuccessContent);
    assert_eq!(response.payload(), b"23");
    assert_eq!(sensor.invocations.load(Ordering::SeqCst), 1);
}

#[test]
fn end_to_end_separate_response() {
    init_logging();
    let sensor = TempSensor::slow(Duration::from_millis(400));
    let response = end_to_end(
        sensor.clone(),
        CoapRequest::get().path("/sensors/temp"),
    )
    .expect("request failed");

    // The response came later, as its own confirmable exchange, and the
    // client matched it to the request by token.
    assert_eq!(response.msg_type(), MsgType::Con);
    assert_eq!(response.msg_code(), MsgCode::SuccessContent);
    assert_eq!(response.payload(), b"23");
}

#[test]
fn end_to_end_nonconfirmable() {
    init_logging();
    let sensor = TempSensor::immediate();
    let response = end_to_end(
        sensor.clone(),
        CoapRequest::get().path("/sensors/temp").nonconfirmable(),
    )
    .expect("request failed");

    assert_eq!(response.msg_type(), MsgType::Non);
    assert_eq!(response.payload(), b"23");
}

#[test]
fn timeout_against_null_socket() {
    init_logging();
    let endpoint = DatagramLocalEndpoint::with_trans_params(NullSocket::new(), FastParams);

    let started = Instant::now();
    let scenario = endpoint.send(
        coap_exchange::datagram::NullSocketAddr,
        CoapRequest::get().path("/nowhere"),
    );
    let serve = endpoint.serve();
    pin_mut!(scenario, serve);

    let result = match block_on(select(scenario, serve)) {
        Either::Left((result, _)) => result,
        Either::Right((err, _)) => panic!("serve loop finished: {:?}", err),
    };

    assert_eq!(result.unwrap_err(), Error::ResponseTimeout);

    // The schedule spans at least T * (1 + 2 + 4 + 8 + 16) for T >= ACK_TIMEOUT.
    assert!(started.elapsed() >= Duration::from_millis(31 * 100));
}
