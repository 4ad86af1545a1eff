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

//! An asynchronous implementation of the message-layer reliability rules of
//! the Constrained Application Protocol (CoAP, [RFC 7252]).
//!
//! This crate turns an unreliable datagram socket into the CoAP message
//! abstraction: confirmable and non-confirmable exchanges, duplicate
//! suppression, empty and piggy-backed acknowledgements, separate responses,
//! exponential-backoff retransmission, and message-id allocation — the
//! machinery described in sections 4 and 5 of the RFC. Application
//! resources plug in through the [`Webservice`] trait and never see any of
//! it: they receive a decoded request and a one-shot [`ResponsePromise`],
//! and the layer decides how the response travels.
//!
//! [RFC 7252]: https://tools.ietf.org/html/rfc7252
//!
//! ## Serving resources
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::executor::block_on;
//! use coap_exchange::prelude::*;
//! use coap_exchange::datagram::{AllowStdUdpSocket, DatagramLocalEndpoint};
//!
//! struct Hello;
//!
//! impl Webservice<std::net::SocketAddr> for Hello {
//!     fn path(&self) -> &str {
//!         "/hello"
//!     }
//!
//!     fn handle(
//!         &self,
//!         _request: &OwnedImmutableMessage,
//!         _remote: &std::net::SocketAddr,
//!         promise: ResponsePromise,
//!     ) {
//!         promise.resolve(Response::content("hi there"));
//!     }
//! }
//!
//! let socket = AllowStdUdpSocket::bind("[::]:5683").expect("UDP bind failed");
//! let endpoint = DatagramLocalEndpoint::new(socket);
//! endpoint.register_service(Arc::new(Hello));
//!
//! // The serve future reads the socket, acknowledges confirmables,
//! // suppresses duplicates, and routes requests to `Hello`.
//! let _ = block_on(endpoint.serve());
//! ```
//!
//! ## Sending requests
//!
//! The serve future is the only reader of the socket, so client futures are
//! raced against it:
//!
//! ```no_run
//! use futures::executor::block_on;
//! use futures::future::{select, Either};
//! use futures::pin_mut;
//! use coap_exchange::prelude::*;
//! use coap_exchange::datagram::{AllowStdUdpSocket, DatagramLocalEndpoint};
//!
//! let socket = AllowStdUdpSocket::bind("[::]:0").expect("UDP bind failed");
//! let endpoint = DatagramLocalEndpoint::new(socket);
//!
//! let request = endpoint.send("coap.me:5683", CoapRequest::get().path("/test"));
//! let serve = endpoint.serve();
//! pin_mut!(serve);
//!
//! let response = match block_on(select(request, serve)) {
//!     Either::Left((response, _)) => response.expect("request failed"),
//!     Either::Right(_) => unreachable!("serve loop ended"),
//! };
//!
//! println!("Got: {}", response);
//! ```
//!
//! A confirmable request is retransmitted with doubling, jittered intervals
//! until the peer acknowledges, resets, or the schedule is exhausted
//! (`MAX_TRANSMIT_WAIT`, about 93 seconds, surfacing as
//! [`Error::ResponseTimeout`]). Responses arriving piggy-backed on the
//! acknowledgement and responses arriving minutes later as separate
//! confirmable exchanges resolve the same future the same way.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod message;
pub mod option;

mod content_format;
pub use content_format::ContentFormat;

mod socketaddr;
pub use socketaddr::SocketAddrExt;
pub use socketaddr::ToSocketAddrs;

mod trans_params;
pub use trans_params::*;

mod msg_id;
pub use msg_id::MsgIdFactory;

mod exchange;
pub(crate) use exchange::*;

mod service;
pub use service::request_path;
pub use service::RegisteredService;
pub use service::Response;
pub use service::ResponsePromise;
pub use service::ServiceRegistry;
pub use service::Webservice;

mod request;
pub use request::CoapRequest;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::*;

mod etag;
pub use etag::ETag;

mod util;
use util::*;

pub mod datagram;

#[doc(hidden)]
pub mod prelude {
    //! Commonly used types, re-exported in one place.

    pub use super::message::MessageRead;
    pub use super::message::MessageWrite;
    pub use super::message::MsgCode;
    pub use super::message::MsgCodeClass;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;
    pub use super::message::OwnedImmutableMessage;

    pub use super::option;
    pub use option::OptionInsert;
    pub use option::OptionIterator;
    pub use option::OptionIteratorExt;
    pub use option::OptionNumber;

    pub use super::CoapRequest;
    pub use super::ContentFormat;
    pub use super::ETag;
    pub use super::Error;
    pub use super::Response;
    pub use super::ResponsePromise;
    pub use super::SocketAddrExt;
    pub use super::Webservice;

    pub use super::StandardCoapConstants;
    pub use super::TransParams;
}

use futures::prelude::*;
use message::*;
use prelude::*;
