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
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::stream::FuturesUnordered;
use futures_timer::Delay;
use std::sync::Arc;
use std::time::Instant;

/// Generic, datagram-based CoAP local endpoint: the reliability layer
/// wrapped around one socket.
///
/// One instance serves both roles. As a server, [`serve`] decodes inbound
/// datagrams, suppresses duplicates, acknowledges confirmables, and routes
/// requests to the registered [`Webservice`]s. As a client, [`send`] and
/// [`ping`] produce futures that resolve when the remote answers (or the
/// retransmission schedule is exhausted). The [`serve`] future must be
/// running for either role: it is the only reader of the socket.
///
/// [`serve`]: DatagramLocalEndpoint::serve
/// [`send`]: DatagramLocalEndpoint::send
/// [`ping`]: DatagramLocalEndpoint::ping
#[derive(Debug)]
pub struct DatagramLocalEndpoint<US, TP = StandardCoapConstants>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    inner: Arc<LocalEndpointInner<US, TP>>,
}

#[derive(Debug)]
pub(crate) struct LocalEndpointInner<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    socket: US,
    trans_params: TP,
    msg_id_factory: MsgIdFactory,
    registry: ExchangeRegistry<US::SocketAddr>,
    services: ServiceRegistry<US::SocketAddr>,
}

impl<US, TP> LocalEndpointInner<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    pub(crate) fn socket(&self) -> &US {
        &self.socket
    }

    pub(crate) fn trans_params(&self) -> TP {
        self.trans_params
    }

    pub(crate) fn registry(&self) -> &ExchangeRegistry<US::SocketAddr> {
        &self.registry
    }

    pub(crate) fn services(&self) -> &ServiceRegistry<US::SocketAddr> {
        &self.services
    }

    pub(crate) fn msg_id_factory(&self) -> &MsgIdFactory {
        &self.msg_id_factory
    }

    /// Writes one datagram to the socket, logging rather than propagating
    /// errors: transmission failures are handled by the retransmission
    /// schedule, never by tearing anything down.
    pub(crate) async fn send_bytes(&self, bytes: &[u8], dest: US::SocketAddr) {
        debug!("OUTBOUND: {} {}", dest, CoapByteDisplayFormatter(bytes));
        if let Err(e) = self.socket.send_to(bytes, dest).await {
            error!("send_to: io error: {} (dest={:?})", e, dest);
        }
    }
}

impl<US> DatagramLocalEndpoint<US, StandardCoapConstants>
where
    US: AsyncDatagramSocket,
{
    /// Creates a new [`DatagramLocalEndpoint`] with the standard RFC 7252
    /// transmission parameters.
    pub fn new(socket: US) -> DatagramLocalEndpoint<US, StandardCoapConstants> {
        Self::with_trans_params(socket, StandardCoapConstants)
    }
}

impl<US, TP> DatagramLocalEndpoint<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    /// Creates a new [`DatagramLocalEndpoint`] with specific transmission
    /// parameters. The message-id reservation window follows the
    /// parameters' `EXCHANGE_LIFETIME`.
    pub fn with_trans_params(socket: US, trans_params: TP) -> DatagramLocalEndpoint<US, TP> {
        DatagramLocalEndpoint {
            inner: Arc::new(LocalEndpointInner {
                socket,
                trans_params,
                msg_id_factory: MsgIdFactory::with_lifetime(
                    trans_params.coap_exchange_lifetime(),
                ),
                registry: ExchangeRegistry::new(),
                services: ServiceRegistry::new(),
            }),
        }
    }

    /// Borrows a reference to the underlying socket.
    pub fn socket(&self) -> &US {
        self.inner.socket()
    }

    /// Returns the transmission parameters in use.
    pub fn trans_params(&self) -> TP {
        self.inner.trans_params()
    }

    /// Registers a service under its own path, returning the displaced
    /// service, if any.
    pub fn register_service(
        &self,
        service: Arc<dyn Webservice<US::SocketAddr>>,
    ) -> Option<Arc<dyn Webservice<US::SocketAddr>>> {
        self.inner.services.register(service)
    }

    /// Unregisters the service at `path`, invoking its shutdown callback.
    pub fn unregister_service(&self, path: &str) -> bool {
        self.inner.services.unregister(path)
    }

    /// Performs a blocking hostname lookup, filtering out addresses the
    /// local socket cannot reach.
    pub fn lookup(&self, hostname: &str, mut port: u16) -> Result<std::vec::IntoIter<US::SocketAddr>, Error> {
        if port == 0 {
            port = DEFAULT_PORT_COAP_UDP;
        }

        match US::lookup_host(hostname, port) {
            Ok(iter) => {
                if let Ok(local) = self.socket().local_addr() {
                    let filtered: Vec<US::SocketAddr> = iter
                        .filter_map(|sockaddr| sockaddr.conforming_to(local))
                        .collect();
                    Ok(filtered.into_iter())
                } else {
                    Ok(iter)
                }
            }
            Err(_) => Err(Error::HostLookupFailure),
        }
    }

    /// Sends a request, returning a future that resolves with the response.
    ///
    /// For a confirmable request the future retransmits per §4.2 and fails
    /// with [`Error::ResponseTimeout`] once the schedule is exhausted, or
    /// [`Error::Reset`] if the peer rejects the message. The response may
    /// arrive piggy-backed or as a separate exchange; either way the future
    /// resolves with the decoded response message.
    ///
    /// [`serve`][DatagramLocalEndpoint::serve] must be running for the
    /// response to be noticed.
    pub fn send<S>(
        &self,
        dest: S,
        request: CoapRequest,
    ) -> BoxFuture<'static, Result<OwnedImmutableMessage, Error>>
    where
        S: ToSocketAddrs<SocketAddr = US::SocketAddr, Error = US::Error>,
    {
        let addr = match dest.to_socket_addrs() {
            Ok(mut iter) => match iter.next() {
                Some(addr) => addr,
                None => return future::ready(Err(Error::HostNotFound)).boxed(),
            },
            Err(_) => return future::ready(Err(Error::HostLookupFailure)).boxed(),
        };

        let msg_id = match self.inner.msg_id_factory.allocate() {
            Ok(msg_id) => msg_id,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        let token = MsgToken::from(msg_id);

        let bytes = match request.encode(msg_id, token) {
            Ok(bytes) => bytes,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        ExchangeFuture::new(
            &self.inner,
            addr,
            bytes,
            msg_id,
            Some(token),
            request.msg_type().is_con(),
            ReplyExpectation::Response,
        )
        .map(|result| match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::Unspecified),
            Err(e) => Err(e),
        })
        .boxed()
    }

    /// Sends a CoAP ping (empty confirmable message) to the given address.
    /// The returned future resolves once the remote answers with a reset,
    /// proving it is reachable and alive.
    pub fn ping<S>(&self, dest: S) -> BoxFuture<'static, Result<(), Error>>
    where
        S: ToSocketAddrs<SocketAddr = US::SocketAddr, Error = US::Error>,
    {
        let addr = match dest.to_socket_addrs() {
            Ok(mut iter) => match iter.next() {
                Some(addr) => addr,
                None => return future::ready(Err(Error::HostNotFound)).boxed(),
            },
            Err(_) => return future::ready(Err(Error::HostLookupFailure)).boxed(),
        };

        let msg_id = match self.inner.msg_id_factory.allocate() {
            Ok(msg_id) => msg_id,
            Err(e) => return future::ready(Err(e)).boxed(),
        };

        let mut buffer = [0u8; BufferMessageEncoder::MIN_MESSAGE_BUFFER_LEN];
        let mut builder = BufferMessageEncoder::new(&mut buffer);
        builder.set_msg_type(MsgType::Con);
        builder.set_msg_code(MsgCode::Empty);
        builder.set_msg_id(msg_id);
        let bytes = builder.as_bytes().to_vec();

        ExchangeFuture::new(
            &self.inner,
            addr,
            bytes,
            msg_id,
            None,
            true,
            ReplyExpectation::ResetPong,
        )
        .map(|result| result.map(|_| ()))
        .boxed()
    }

    /// Runs the reactor: reads datagrams, drives in-flight request
    /// servicing, and evicts expired exchange state.
    ///
    /// This future only completes on a socket-level receive error. It is
    /// intended to be raced (`select`) against the client futures it
    /// services, or spawned on an executor.
    pub async fn serve(&self) -> Result<(), Error> {
        let mut tasks: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
        let mut buffer = vec![0u8; self.inner.trans_params.max_outbound_packet_length()];

        loop {
            let next_eviction = self
                .inner
                .registry
                .next_expiry()
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_else(|| self.inner.trans_params.coap_exchange_lifetime());

            let received = {
                let mut recv = self.inner.socket.recv_from(&mut buffer).fuse();
                let mut eviction = Delay::new(next_eviction).fuse();
                let mut next_task = tasks.select_next_some();

                futures::select! {
                    result = recv => match result {
                        Ok((len, src)) => Some((len, src)),
                        Err(e) => {
                            error!("recv_from: io error: {}", e);
                            return Err(Error::IOError);
                        }
                    },
                    _ = next_task => None,
                    _ = eviction => {
                        self.inner.registry.evict_expired();
                        None
                    },
                }
            };

            if let Some((len, src)) = received {
                if let Some(task) = self.handle_datagram(&buffer[..len], src).await {
                    tasks.push(task);
                }
            }
        }
    }

    /// Classifies one inbound datagram per the message-layer rules,
    /// returning the servicing future for a fresh request.
    async fn handle_datagram(
        &self,
        packet: &[u8],
        src: US::SocketAddr,
    ) -> Option<BoxFuture<'static, ()>> {
        debug!("INBOUND: {} {}", src, CoapByteDisplayFormatter(packet));

        let params = self.inner.trans_params();

        let message = match OwnedImmutableMessage::new(packet.to_vec()) {
            Ok(message) => message,
            Err(e) => {
                // A recognizable header with an invalid body earns a reset;
                // anything less is dropped without a trace on the wire.
                if let Some((msg_type, msg_id)) = peek_message_header(packet) {
                    if msg_type.is_con() {
                        debug!("Rejecting malformed confirmable {:04X}: {}", msg_id, e);
                        self.inner.send_bytes(&encode_reset(msg_id), src).await;
                        return None;
                    }
                }
                debug!("Dropping unparseable datagram: {}", e);
                return None;
            }
        };

        let msg_type = message.msg_type();
        let msg_code = message.msg_code();
        let msg_id = message.msg_id();

        if msg_code.is_method() {
            // Inbound request.
            if !msg_type.is_con() && !msg_type.is_non() {
                debug!("Ignoring request code carried in {:?}", msg_type);
                return None;
            }

            let lifetime = if msg_type.is_con() {
                params.coap_exchange_lifetime()
            } else {
                params.coap_non_lifetime()
            };

            match self
                .inner
                .registry
                .insert_if_absent(src, msg_id, Instant::now() + lifetime)
            {
                InsertOutcome::Replay(bytes) => {
                    debug!("Replaying cached response for duplicate {:04X}", msg_id);
                    self.inner.send_bytes(&bytes, src).await;
                    None
                }
                InsertOutcome::InFlight => {
                    debug!("Dropping duplicate of in-flight request {:04X}", msg_id);
                    None
                }
                InsertOutcome::Inserted(epoch) => {
                    Some(service_request(self.inner.clone(), message, src, epoch).boxed())
                }
            }
        } else if msg_code.is_empty() {
            match msg_type {
                MsgType::Con => {
                    // CoAP ping; answer with a reset (pong).
                    debug!("Ping {:04X}; ponging", msg_id);
                    self.inner.send_bytes(&encode_reset(msg_id), src).await;
                }
                MsgType::Ack | MsgType::Rst => {
                    if !self.inner.registry.deliver_by_mid(src, &message) {
                        debug!("Ignoring unmatched {:?} {:04X}", msg_type, msg_id);
                    }
                }
                MsgType::Non => {
                    debug!("Ignoring empty non-confirmable {:04X}", msg_id);
                }
            }
            None
        } else {
            // Inbound response.
            match msg_type {
                MsgType::Ack => {
                    // Piggy-backed response; matched by message id.
                    if !self.inner.registry.deliver_by_mid(src, &message) {
                        debug!("Ignoring unmatched piggy-backed response {:04X}", msg_id);
                    }
                    None
                }
                MsgType::Non => {
                    if !self.inner.registry.deliver_by_token(src, &message) {
                        debug!("Ignoring unmatched non-confirmable response {:04X}", msg_id);
                    }
                    None
                }
                MsgType::Con => {
                    // Separate response: acknowledge it, match it by token,
                    // and remember the acknowledgement so a retransmission
                    // is answered without a second delivery.
                    let deadline = Instant::now() + params.coap_exchange_lifetime();
                    match self.inner.registry.insert_if_absent(src, msg_id, deadline) {
                        InsertOutcome::Replay(bytes) => {
                            debug!("Re-acknowledging duplicate separate response {:04X}", msg_id);
                            self.inner.send_bytes(&bytes, src).await;
                        }
                        InsertOutcome::InFlight => {}
                        InsertOutcome::Inserted(epoch) => {
                            let handled = self.inner.registry.deliver_by_token(src, &message);
                            let reply = if handled {
                                encode_empty_ack(msg_id)
                            } else {
                                debug!("Resetting unmatched separate response {:04X}", msg_id);
                                encode_reset(msg_id)
                            };
                            self.inner
                                .registry
                                .claim_piggyback(src, msg_id, epoch, reply.clone());
                            self.inner.send_bytes(&reply, src).await;
                        }
                    }
                    None
                }
                MsgType::Rst => {
                    debug!("Ignoring response code carried in a reset");
                    None
                }
            }
        }
    }
}
