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
use futures::prelude::*;
use futures::task::{Poll, Waker};
use futures_timer::Delay;
use std::fmt::{Display, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// What kind of reply completes an [`ExchangeFuture`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum ReplyExpectation {
    /// A bare acknowledgement closes the exchange: used when sending a
    /// separate response, where the remote's empty ACK is all we wait for.
    Acknowledgement,

    /// A response message (piggy-backed or separate) closes the exchange; a
    /// bare acknowledgement merely stops retransmission.
    Response,

    /// A reset closes the exchange successfully: CoAP ping.
    ResetPong,
}

/// State of one outbound exchange.
///
/// `Armed` is the retransmitting phase: the timer doubles on each firing,
/// starting from a per-exchange random initial interval. `AwaitSeparate`
/// is entered on a bare acknowledgement and performs no retransmission.
#[derive(Debug)]
pub(super) enum ExchangeState {
    /// Not yet polled.
    Uninit,

    /// A transmission (first or repeat) is being written to the socket.
    Transmitting,

    /// Waiting for a reply; will retransmit when the timer fires.
    Armed,

    /// Acknowledged; waiting for the separate response. No retransmission.
    AwaitSeparate,

    /// Finished, waiting for the final result to be polled.
    Finished(Result<Option<OwnedImmutableMessage>, Error>),

    /// The final result has been handed out.
    Expired,
}

impl ExchangeState {
    fn is_waiting(&self) -> bool {
        match self {
            ExchangeState::Uninit
            | ExchangeState::Transmitting
            | ExchangeState::Armed
            | ExchangeState::AwaitSeparate => true,
            _ => false,
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            ExchangeState::Finished(_) | ExchangeState::Expired => true,
            _ => false,
        }
    }
}

impl Display for ExchangeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ExchangeState::Uninit => f.write_str("Uninit"),
            ExchangeState::Transmitting => f.write_str("Transmitting"),
            ExchangeState::Armed => f.write_str("Armed"),
            ExchangeState::AwaitSeparate => f.write_str("AwaitSeparate"),
            ExchangeState::Finished(Ok(_)) => f.write_str("Finished"),
            ExchangeState::Finished(Err(e)) => write!(f, "Errored({:?})", e),
            ExchangeState::Expired => f.write_str("Expired"),
        }
    }
}

pub(super) struct ExchangeFutureInner<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    endpoint: Weak<LocalEndpointInner<US, TP>>,
    dest: US::SocketAddr,

    /// The serialized message; retransmissions are byte-for-byte identical.
    bytes: Vec<u8>,

    msg_id: MsgId,
    token: Option<MsgToken>,
    confirmable: bool,
    expect: ReplyExpectation,

    state: ExchangeState,
    waker: Option<Waker>,
    delay: Option<Delay>,

    /// Give-up time: `MAX_TRANSMIT_WAIT` after the first transmission.
    deadline: Option<Instant>,

    /// Chosen once, uniformly in `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`;
    /// the n-th interval is this doubled n times.
    initial_timeout: Duration,

    /// Number of retransmissions performed so far.
    attempt: u32,

    /// How long to wait in `AwaitSeparate` before giving up.
    passive_timeout: Duration,

    trans_params: TP,
}

impl<US, TP> ExchangeFutureInner<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    fn change_state(&mut self, mut state: ExchangeState) -> ExchangeState {
        if state.is_finished() {
            self.delay = None;
        }
        std::mem::swap(&mut self.state, &mut state);
        state
    }

    fn update_waker(&mut self, waker_ref: &Waker) {
        if let Some(waker) = self.waker.take() {
            self.waker = Some(if waker_ref.will_wake(&waker) {
                waker
            } else {
                waker_ref.clone()
            });
        } else {
            self.waker = Some(waker_ref.clone());
        }
    }

    fn update_timeout(&mut self, d: Duration) {
        if let Some(delay) = self.delay.as_mut() {
            delay.reset(d);
        } else {
            self.delay = Some(Delay::new(d));
        }
    }

    fn poll_timeout(&mut self, cx: &mut futures::task::Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            Pin::new(delay).poll(cx)
        } else {
            Poll::Pending
        }
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl<US, TP> HandleReply for ExchangeFutureInner<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    fn handle_reply(&mut self, message: &OwnedImmutableMessage) -> bool {
        if !self.state.is_waiting() {
            // A stale delivery after completion; nothing left to do.
            return true;
        }

        let msg_type = message.msg_type();
        let msg_code = message.msg_code();

        if msg_type.is_rst() {
            debug!("Exchange {:04X}: got reset", self.msg_id);
            let result = match self.expect {
                ReplyExpectation::ResetPong => Ok(None),
                _ => Err(Error::Reset),
            };
            self.change_state(ExchangeState::Finished(result));
            self.wake();
            return true;
        }

        if msg_type.is_ack() && msg_code.is_empty() {
            debug!("Exchange {:04X}: got ack", self.msg_id);
            match self.expect {
                ReplyExpectation::Acknowledgement => {
                    self.change_state(ExchangeState::Finished(Ok(None)));
                    self.wake();
                    return true;
                }
                ReplyExpectation::Response => {
                    // A late ACK, after retransmissions, still stops the
                    // retransmission clock; the exchange stays open for the
                    // separate response.
                    self.change_state(ExchangeState::AwaitSeparate);
                    let d = self.passive_timeout;
                    self.update_timeout(d);
                    self.wake();
                    return false;
                }
                ReplyExpectation::ResetPong => {
                    // Not the pong we asked for; keep waiting.
                    return false;
                }
            }
        }

        if msg_code.is_response() && self.expect == ReplyExpectation::Response {
            debug!("Exchange {:04X}: got response", self.msg_id);
            self.change_state(ExchangeState::Finished(Ok(Some(message.clone()))));
            self.wake();
            return true;
        }

        false
    }
}

/// Future driving one outbound message through the §4.2 reliability rules:
/// transmission, exponential-backoff retransmission for confirmables, and
/// resolution via acknowledgement, reset, response, or timeout.
pub(super) struct ExchangeFuture<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    inner: Arc<Mutex<ExchangeFutureInner<US, TP>>>,
}

impl<US, TP> ExchangeFuture<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    pub(super) fn new(
        endpoint: &Arc<LocalEndpointInner<US, TP>>,
        dest: US::SocketAddr,
        bytes: Vec<u8>,
        msg_id: MsgId,
        token: Option<MsgToken>,
        confirmable: bool,
        expect: ReplyExpectation,
    ) -> ExchangeFuture<US, TP> {
        let trans_params = endpoint.trans_params();

        let passive_timeout = if confirmable {
            // An acknowledged confirmable stays open until the separate
            // response arrives or EXCHANGE_LIFETIME passes.
            trans_params.coap_exchange_lifetime()
        } else {
            trans_params.coap_max_rtt()
        };

        ExchangeFuture {
            inner: Arc::new(Mutex::new(ExchangeFutureInner {
                endpoint: Arc::downgrade(endpoint),
                dest,
                bytes,
                msg_id,
                token,
                confirmable,
                expect,
                state: ExchangeState::Uninit,
                waker: None,
                delay: None,
                deadline: None,
                initial_timeout: trans_params.calc_initial_retransmit_timeout(),
                attempt: 0,
                passive_timeout,
                trans_params,
            })),
        }
    }

    fn poll(
        &mut self,
        cx: &mut futures::task::Context<'_>,
    ) -> Poll<Result<Option<OwnedImmutableMessage>, Error>> {
        let mut inner = self
            .inner
            .lock()
            .expect("ExchangeFuture inner mutex poisoned");

        loop {
            match inner.state {
                ExchangeState::Uninit => {
                    let endpoint = match inner.endpoint.upgrade() {
                        Some(endpoint) => endpoint,
                        None => {
                            inner.change_state(ExchangeState::Finished(Err(Error::Cancelled)));
                            continue;
                        }
                    };

                    inner.deadline =
                        Some(Instant::now() + inner.trans_params.coap_max_transmit_wait());

                    let token = match inner.expect {
                        ReplyExpectation::Response => inner.token,
                        _ => None,
                    };
                    let handler: Arc<Mutex<dyn HandleReply>> = self.inner.clone();
                    endpoint
                        .registry()
                        .add_pending(inner.dest, inner.msg_id, token, &handler);

                    inner.change_state(ExchangeState::Transmitting);
                }

                ExchangeState::Transmitting => {
                    let endpoint = match inner.endpoint.upgrade() {
                        Some(endpoint) => endpoint,
                        None => {
                            inner.change_state(ExchangeState::Finished(Err(Error::Cancelled)));
                            continue;
                        }
                    };

                    let sent = Pin::new(endpoint.socket()).poll_send_to(
                        cx,
                        &inner.bytes,
                        inner.dest,
                    );

                    match sent {
                        Poll::Pending => {
                            inner.update_waker(cx.waker());
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(e)) => {
                            error!("send_to: io error: {} (dest={:?})", e, inner.dest);
                            inner.change_state(ExchangeState::Finished(Err(Error::IOError)));
                        }
                        Poll::Ready(Ok(_)) => {
                            debug!(
                                "OUTBOUND[{}]: {} {}",
                                inner.attempt,
                                inner.dest,
                                CoapByteDisplayFormatter(&inner.bytes)
                            );

                            if inner.confirmable {
                                let d = inner
                                    .trans_params
                                    .calc_retransmit_timeout(inner.initial_timeout, inner.attempt);
                                inner.update_timeout(d);
                                inner.change_state(ExchangeState::Armed);
                            } else if inner.expect == ReplyExpectation::Acknowledgement {
                                // Nothing to wait for.
                                inner.change_state(ExchangeState::Finished(Ok(None)));
                            } else {
                                let d = inner.passive_timeout;
                                inner.update_timeout(d);
                                inner.change_state(ExchangeState::AwaitSeparate);
                            }
                        }
                    }
                }

                ExchangeState::Armed => {
                    if inner.poll_timeout(cx).is_ready() {
                        let deadline_passed = inner
                            .deadline
                            .map(|deadline| Instant::now() >= deadline)
                            .unwrap_or(false);

                        if deadline_passed
                            || inner.attempt >= inner.trans_params.coap_max_retransmit()
                        {
                            debug!("Exchange {:04X}: transmit attempts exhausted", inner.msg_id);
                            inner
                                .change_state(ExchangeState::Finished(Err(Error::ResponseTimeout)));
                        } else {
                            inner.attempt += 1;
                            inner.change_state(ExchangeState::Transmitting);
                        }
                    } else {
                        inner.update_waker(cx.waker());
                        return Poll::Pending;
                    }
                }

                ExchangeState::AwaitSeparate => {
                    if inner.poll_timeout(cx).is_ready() {
                        inner.change_state(ExchangeState::Finished(Err(Error::ResponseTimeout)));
                    } else {
                        inner.update_waker(cx.waker());
                        return Poll::Pending;
                    }
                }

                ExchangeState::Finished(_) => {
                    let ret = match inner.change_state(ExchangeState::Expired) {
                        ExchangeState::Finished(x) => x,
                        _ => unreachable!(),
                    };
                    return Poll::Ready(ret);
                }

                ExchangeState::Expired => {
                    // Polled after completion.
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<US, TP> Drop for ExchangeFuture<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    fn drop(&mut self) {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("ExchangeFuture inner mutex was poisoned, locking anyway to drop");
                poisoned.into_inner()
            }
        };

        if let Some(endpoint) = inner.endpoint.upgrade() {
            endpoint
                .registry()
                .remove_pending(inner.dest, inner.msg_id, inner.token);
        }
    }
}

impl<US, TP> Future for ExchangeFuture<US, TP>
where
    US: AsyncDatagramSocket,
    TP: TransParams,
{
    type Output = Result<Option<OwnedImmutableMessage>, Error>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut futures::task::Context<'_>,
    ) -> futures::task::Poll<Self::Output> {
        self.get_mut().poll(cx)
    }
}
