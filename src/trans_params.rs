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

use std::time::Duration;

/// Trait defining [CoAP transmission parameters][tp].
///
/// All values default to those recommended by RFC 7252; implementations
/// override individual constants (typically to shrink the timescales in
/// tests). The derived values (`MAX_TRANSMIT_SPAN`, `EXCHANGE_LIFETIME`, ...)
/// are computed from the overridden constants.
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
pub trait TransParams: Default + Copy + Sync + Send + Unpin + 'static {
    fn max_outbound_packet_length(&self) -> usize {
        Self::MAX_OUTBOUND_PACKET_LENGTH
    }

    fn coap_max_retransmit(&self) -> u32 {
        Self::COAP_MAX_RETRANSMIT
    }

    fn coap_ack_timeout(&self) -> Duration {
        Self::COAP_ACK_TIMEOUT
    }

    fn coap_ack_random_factor(&self) -> f32 {
        Self::COAP_ACK_RANDOM_FACTOR
    }

    fn coap_nstart(&self) -> u32 {
        Self::COAP_NSTART
    }

    fn coap_default_leisure(&self) -> Duration {
        Self::COAP_DEFAULT_LEISURE
    }

    fn coap_probing_rate(&self) -> u32 {
        Self::COAP_PROBING_RATE
    }

    fn coap_max_latency(&self) -> Duration {
        Self::COAP_MAX_LATENCY
    }

    /// How long an inbound confirmable request may sit without a response
    /// before an empty acknowledgement is sent and the response becomes a
    /// separate exchange. Bounded above by `ACK_TIMEOUT` so the sender does
    /// not start retransmitting.
    fn coap_ack_delay(&self) -> Duration {
        self.coap_ack_timeout()
    }

    fn coap_max_transmit_span(&self) -> Duration {
        Self::COAP_MAX_TRANSMIT_SPAN
    }

    fn coap_max_transmit_wait(&self) -> Duration {
        Self::COAP_MAX_TRANSMIT_WAIT
    }

    fn coap_max_rtt(&self) -> Duration {
        Self::COAP_MAX_RTT
    }

    fn coap_exchange_lifetime(&self) -> Duration {
        Self::COAP_EXCHANGE_LIFETIME
    }

    fn coap_non_lifetime(&self) -> Duration {
        Self::COAP_NON_LIFETIME
    }

    const MAX_OUTBOUND_PACKET_LENGTH: usize = 1152;

    const COAP_MAX_RETRANSMIT: u32 = 4;

    const COAP_ACK_TIMEOUT: Duration = Duration::from_secs(2);

    const COAP_ACK_RANDOM_FACTOR: f32 = 1.5;

    const COAP_NSTART: u32 = 1;

    const COAP_DEFAULT_LEISURE: Duration = Duration::from_secs(5);

    /// CoAP probing rate, measured in bytes per second.
    const COAP_PROBING_RATE: u32 = 1;

    /// From RFC7252:
    ///
    /// > `MAX_LATENCY` is the maximum time a datagram is expected to take
    /// > from the start of its transmission to the completion of its
    /// > reception. We, arbitrarily, define `MAX_LATENCY` to be 100 seconds.
    const COAP_MAX_LATENCY: Duration = Duration::from_secs(100);

    /// From RFC7252:
    ///
    /// > `PROCESSING_DELAY` is the time a node takes to turn around a
    /// > Confirmable message into an acknowledgement. We assume the node
    /// > will attempt to send an ACK before having the sender time out, so as
    /// > a conservative assumption we set it equal to `ACK_TIMEOUT`.
    const COAP_PROCESSING_DELAY: Duration = Self::COAP_ACK_TIMEOUT;

    /// From RFC7252:
    ///
    /// > `MAX_TRANSMIT_SPAN` is the maximum time from the first transmission
    /// > of a Confirmable message to its last retransmission. For the
    /// > default transmission parameters, the value is (2+4+8+16)*1.5 = 45
    /// > seconds, or more generally:
    /// >
    /// >> `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`
    const COAP_MAX_TRANSMIT_SPAN: Duration = Duration::from_millis(
        (Self::COAP_ACK_TIMEOUT.as_millis() as f32
            * ((1u32 << Self::COAP_MAX_RETRANSMIT) - 1) as f32
            * Self::COAP_ACK_RANDOM_FACTOR) as u64,
    );

    /// From RFC7252:
    ///
    /// > `MAX_TRANSMIT_WAIT` is the maximum time from the first transmission
    /// > of a Confirmable message to the time when the sender gives up on
    /// > receiving an acknowledgement or reset. For the default
    /// > transmission parameters, the value is (2+4+8+16+32)*1.5 = 93
    /// > seconds, or more generally:
    /// >
    /// >> `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`
    const COAP_MAX_TRANSMIT_WAIT: Duration = Duration::from_millis(
        (Self::COAP_ACK_TIMEOUT.as_millis() as f32
            * ((1u32 << (Self::COAP_MAX_RETRANSMIT + 1)) - 1) as f32
            * Self::COAP_ACK_RANDOM_FACTOR) as u64,
    );

    /// From RFC7252:
    ///
    /// > `MAX_RTT` is the maximum round-trip time, or:
    /// >
    /// >> `(2 * MAX_LATENCY) + PROCESSING_DELAY`
    ///
    /// Default value is 202 seconds.
    const COAP_MAX_RTT: Duration = Duration::from_millis(
        2 * Self::COAP_MAX_LATENCY.as_millis() as u64
            + Self::COAP_PROCESSING_DELAY.as_millis() as u64,
    );

    /// From RFC7252:
    ///
    /// > `EXCHANGE_LIFETIME` is the time from starting to send a Confirmable
    /// > message to the time when an acknowledgement is no longer expected,
    /// > i.e., message-layer information about the message exchange can be
    /// > purged. `EXCHANGE_LIFETIME` simplifies to:
    /// >
    /// >> `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) + PROCESSING_DELAY`
    /// >
    /// > or 247 seconds with the default transmission parameters.
    const COAP_EXCHANGE_LIFETIME: Duration = Duration::from_millis(
        Self::COAP_MAX_TRANSMIT_SPAN.as_millis() as u64
            + 2 * Self::COAP_MAX_LATENCY.as_millis() as u64
            + Self::COAP_PROCESSING_DELAY.as_millis() as u64,
    );

    /// From RFC7252:
    ///
    /// > `NON_LIFETIME` is the time from sending a Non-confirmable message to
    /// > the time its Message ID can be safely reused. [...] it is safer to
    /// > use the value:
    /// >
    /// >> `MAX_TRANSMIT_SPAN + MAX_LATENCY`
    /// >
    /// > or 145 seconds with the default transmission parameters.
    const COAP_NON_LIFETIME: Duration = Duration::from_millis(
        Self::COAP_MAX_TRANSMIT_SPAN.as_millis() as u64 + Self::COAP_MAX_LATENCY.as_millis() as u64,
    );

    /// Picks the timeout before the first retransmission of a confirmable
    /// message: uniformly random in
    /// `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`, per RFC 7252 §4.2.
    ///
    /// The value is chosen once per exchange; each subsequent interval is
    /// double the previous one, so the retransmission schedule is
    /// `T, 2T, 4T, ...` for the returned `T`.
    fn calc_initial_retransmit_timeout(&self) -> Duration {
        let base = self.coap_ack_timeout().as_millis() as u64;

        const JDIV: u64 = 512u64;
        let rmod: u64 = (JDIV as f32 * (self.coap_ack_random_factor() - 1.0)) as u64;
        let jmul = if rmod == 0 {
            JDIV
        } else {
            JDIV + rand::random::<u64>() % (rmod + 1)
        };

        Duration::from_millis(base * jmul / JDIV)
    }

    /// Calculates the timeout armed after transmission number `attempt`
    /// (zero-based), given the initial timeout chosen by
    /// [`calc_initial_retransmit_timeout`][TransParams::calc_initial_retransmit_timeout].
    fn calc_retransmit_timeout(&self, initial: Duration, attempt: u32) -> Duration {
        let shift = attempt.min(self.coap_max_retransmit());
        Duration::from_millis((initial.as_millis() as u64) << shift)
    }
}

/// Set of the standard transmission parameters as recommended by [IETF-RFC7252 Section 4.8].
///
/// [IETF-RFC7252 Section 4.8]: https://tools.ietf.org/html/rfc7252#section-4.8
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StandardCoapConstants;

impl TransParams for StandardCoapConstants {}

impl Default for StandardCoapConstants {
    fn default() -> Self {
        StandardCoapConstants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_constants_match_rfc() {
        assert_eq!(
            StandardCoapConstants::COAP_MAX_TRANSMIT_SPAN,
            Duration::from_secs(45)
        );
        assert_eq!(
            StandardCoapConstants::COAP_MAX_TRANSMIT_WAIT,
            Duration::from_secs(93)
        );
        assert_eq!(
            StandardCoapConstants::COAP_EXCHANGE_LIFETIME,
            Duration::from_secs(247)
        );
        assert_eq!(
            StandardCoapConstants::COAP_NON_LIFETIME,
            Duration::from_secs(145)
        );
    }

    #[test]
    fn initial_timeout_within_rfc_bounds() {
        let params = StandardCoapConstants;
        for _ in 0..256 {
            let t = params.calc_initial_retransmit_timeout();
            assert!(t >= Duration::from_secs(2), "{:?}", t);
            assert!(t <= Duration::from_secs(3), "{:?}", t);
        }
    }

    #[test]
    fn retransmit_timeouts_double() {
        let params = StandardCoapConstants;
        let initial = Duration::from_millis(2500);
        assert_eq!(
            params.calc_retransmit_timeout(initial, 0),
            Duration::from_millis(2500)
        );
        assert_eq!(
            params.calc_retransmit_timeout(initial, 1),
            Duration::from_millis(5000)
        );
        assert_eq!(
            params.calc_retransmit_timeout(initial, 4),
            Duration::from_millis(40000)
        );
    }
}
