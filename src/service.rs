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

//! The webservice surface: the contract a served resource implements and
//! the dispatcher that routes decoded requests to it.
//!
//! A resource never deals with message ids, acknowledgements, or
//! retransmission. It is handed a decoded request and a one-shot
//! [`ResponsePromise`], and fulfilling that promise is its entire
//! obligation; whether the response travels piggy-backed or as a separate
//! confirmable exchange is decided by the reliability layer, and duplicates
//! are answered from the response cache without the resource being invoked
//! again.

use super::*;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::future::{select, Either};
use futures::prelude::*;
use futures_timer::Delay;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A response produced by a [`Webservice`].
///
/// Carries only what the reliability layer passes through: code, payload,
/// and the freshness options (Content-Format, Max-Age, ETag). The message
/// type, id, and token are chosen by the layer below.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    code: MsgCode,
    payload: Vec<u8>,
    content_format: Option<ContentFormat>,
    max_age: Option<u32>,
    etag: Option<ETag>,
}

impl Response {
    /// Creates a new response with the given code and no payload.
    pub fn new(code: MsgCode) -> Response {
        Response {
            code,
            payload: Vec::new(),
            content_format: None,
            max_age: None,
            etag: None,
        }
    }

    /// Creates a 2.05 Content response with the given payload.
    pub fn content<P: Into<Vec<u8>>>(payload: P) -> Response {
        Response::new(MsgCode::SuccessContent).with_payload(payload)
    }

    /// Creates a 2.04 Changed response.
    pub fn changed() -> Response {
        Response::new(MsgCode::SuccessChanged)
    }

    /// Creates a 2.02 Deleted response.
    pub fn deleted() -> Response {
        Response::new(MsgCode::SuccessDeleted)
    }

    /// Creates a 4.04 Not Found response.
    pub fn not_found() -> Response {
        Response::new(MsgCode::ClientErrorNotFound)
    }

    /// Creates a 4.05 Method Not Allowed response.
    pub fn method_not_allowed() -> Response {
        Response::new(MsgCode::ClientErrorMethodNotAllowed)
    }

    /// Creates a 4.02 Bad Option response.
    pub fn bad_option() -> Response {
        Response::new(MsgCode::ClientErrorBadOption)
    }

    /// Creates a 5.00 Internal Server Error response.
    pub fn internal_server_error() -> Response {
        Response::new(MsgCode::ServerErrorInternalServerError)
    }

    /// Creates a 5.03 Service Unavailable response.
    pub fn service_unavailable() -> Response {
        Response::new(MsgCode::ServerErrorServiceUnavailable)
    }

    /// Replaces the payload.
    pub fn with_payload<P: Into<Vec<u8>>>(mut self, payload: P) -> Response {
        self.payload = payload.into();
        self
    }

    /// Sets the Content-Format option.
    pub fn with_content_format(mut self, content_format: ContentFormat) -> Response {
        self.content_format = Some(content_format);
        self
    }

    /// Sets the Max-Age option.
    pub fn with_max_age(mut self, max_age: u32) -> Response {
        self.max_age = Some(max_age);
        self
    }

    /// Sets the ETag option.
    pub fn with_etag(mut self, etag: ETag) -> Response {
        self.etag = Some(etag);
        self
    }

    /// Returns the message code of this response.
    pub fn msg_code(&self) -> MsgCode {
        self.code
    }

    /// Returns the payload of this response.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Writes the code, options, and payload of this response into `target`.
    /// The caller is responsible for the message type, id, and token.
    pub(crate) fn write_to(&self, target: &mut dyn MessageWrite) -> Result<(), Error> {
        target.set_msg_code(self.code);

        if let Some(etag) = self.etag {
            if !etag.is_empty() {
                target.insert_option_with_bytes(OptionNumber::ETAG, etag.as_bytes())?;
            }
        }
        if let Some(content_format) = self.content_format {
            target.insert_option_with_u32(OptionNumber::CONTENT_FORMAT, content_format.0 as u32)?;
        }
        if let Some(max_age) = self.max_age {
            target.insert_option_with_u32(OptionNumber::MAX_AGE, max_age)?;
        }

        if !self.payload.is_empty() {
            target.append_payload_bytes(&self.payload)?;
        }
        Ok(())
    }
}

/// One-shot promise through which a [`Webservice`] delivers its response.
///
/// Resolving the promise is mandatory: a promise that is dropped
/// unfulfilled, rejected, or left pending beyond the dispatcher's hard
/// deadline turns into a 5.03 Service Unavailable on the wire.
#[derive(Debug)]
pub struct ResponsePromise {
    tx: oneshot::Sender<Result<Response, Error>>,
}

impl ResponsePromise {
    pub(crate) fn new() -> (ResponsePromise, oneshot::Receiver<Result<Response, Error>>) {
        let (tx, rx) = oneshot::channel();
        (ResponsePromise { tx }, rx)
    }

    /// Fulfills the promise with a response.
    pub fn resolve(self, response: Response) {
        let _ = self.tx.send(Ok(response));
    }

    /// Rejects the promise. The requester receives 5.00 Internal Server Error.
    pub fn reject(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// The contract a served resource implements.
///
/// Two services are considered interchangeable when their paths are equal;
/// registering a service displaces any previous service at the same path.
pub trait Webservice<SA>: Send + Sync {
    /// The path this service is served under, with a leading `/`.
    fn path(&self) -> &str;

    /// Freshness lifetime, in seconds, advertised on successful `GET`
    /// responses that don't set their own.
    fn max_age(&self) -> u32 {
        60
    }

    /// Version tag computed over the current resource state (not over any
    /// particular response payload).
    fn etag(&self) -> ETag {
        ETag::EMPTY
    }

    /// Whether `DELETE` is permitted on this resource. Disallowed by
    /// default; a `DELETE` against such a service yields 4.05.
    fn allows_delete(&self) -> bool {
        false
    }

    /// Handles one decoded request.
    ///
    /// Called at most once per exchange, no matter how many times the
    /// request datagram arrives. This callback must not block; it hands the
    /// promise off to whatever will eventually fulfill it.
    fn handle(&self, request: &OwnedImmutableMessage, remote: &SA, promise: ResponsePromise);

    /// Called when the service is unregistered.
    fn shutdown(&self) {}
}

/// A registered service, comparing equal iff the underlying paths are equal.
pub struct RegisteredService<SA>(pub Arc<dyn Webservice<SA>>);

impl<SA> Clone for RegisteredService<SA> {
    fn clone(&self) -> Self {
        RegisteredService(self.0.clone())
    }
}

impl<SA> PartialEq for RegisteredService<SA> {
    fn eq(&self, other: &Self) -> bool {
        self.0.path() == other.0.path()
    }
}

impl<SA> Eq for RegisteredService<SA> {}

impl<SA> Hash for RegisteredService<SA> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.path().hash(state)
    }
}

impl<SA> core::fmt::Debug for RegisteredService<SA> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("RegisteredService").field(&self.0.path()).finish()
    }
}

/// Rebuilds the request path from the Uri-Path options: a leading `/`,
/// components joined by `/`. Matching against registered paths is exact.
pub fn request_path(request: &OwnedImmutableMessage) -> String {
    let mut path = String::new();

    for option in request.options() {
        if let Ok((OptionNumber::URI_PATH, value)) = option {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(value));
        }
    }

    if path.is_empty() {
        path.push('/');
    }

    path
}

/// Path-keyed registry of [`Webservice`] implementations, plus the
/// dispatcher that turns a decoded request into a response future.
pub struct ServiceRegistry<SA> {
    services: Mutex<HashMap<String, Arc<dyn Webservice<SA>>>>,
}

impl<SA> core::fmt::Debug for ServiceRegistry<SA> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let services = self.services.lock().expect("Lock failed");
        f.debug_struct("ServiceRegistry")
            .field("paths", &services.keys())
            .finish()
    }
}

impl<SA> Default for ServiceRegistry<SA>
where
    SA: SocketAddrExt,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<SA> ServiceRegistry<SA>
where
    SA: SocketAddrExt,
{
    /// Creates an empty registry.
    pub fn new() -> ServiceRegistry<SA> {
        ServiceRegistry {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a service under its own path, returning the service it
    /// displaced, if any.
    pub fn register(&self, service: Arc<dyn Webservice<SA>>) -> Option<Arc<dyn Webservice<SA>>> {
        let path = service.path().to_string();
        info!("Registering service at {:?}", path);
        self.services
            .lock()
            .expect("Lock failed")
            .insert(path, service)
    }

    /// Unregisters the service at `path`, invoking its
    /// [`shutdown`][Webservice::shutdown] callback. Returns false if no
    /// service was registered there.
    pub fn unregister(&self, path: &str) -> bool {
        let removed = self.services.lock().expect("Lock failed").remove(path);
        match removed {
            Some(service) => {
                info!("Unregistered service at {:?}", path);
                service.shutdown();
                true
            }
            None => false,
        }
    }

    fn lookup(&self, path: &str) -> Option<Arc<dyn Webservice<SA>>> {
        self.services.lock().expect("Lock failed").get(path).cloned()
    }

    /// Routes a decoded request to the matching service and returns a
    /// future for the response.
    ///
    /// The future always yields a response: 4.04 on a path miss, 4.05 on a
    /// disallowed method, and 5.xx if the service rejects, drops, or
    /// outwaits its promise. `hard_deadline` bounds how long the service
    /// may take; `MAX_TRANSMIT_SPAN` is the customary value.
    pub(crate) fn dispatch(
        &self,
        request: &OwnedImmutableMessage,
        remote: SA,
        hard_deadline: Duration,
    ) -> BoxFuture<'static, Response> {
        let path = request_path(request);

        let service = match self.lookup(&path) {
            Some(service) => service,
            None => {
                debug!("No service at {:?}", path);
                return future::ready(Response::not_found()).boxed();
            }
        };

        let method = request.msg_code();
        match method {
            MsgCode::MethodGet | MsgCode::MethodPost | MsgCode::MethodPut => (),
            MsgCode::MethodDelete if service.allows_delete() => (),
            _ => {
                debug!("Method {:?} not allowed at {:?}", method, path);
                return future::ready(Response::method_not_allowed()).boxed();
            }
        }

        let (promise, rx) = ResponsePromise::new();
        service.handle(request, &remote, promise);

        let is_get = method == MsgCode::MethodGet;
        async move {
            match select(rx, Delay::new(hard_deadline)).await {
                Either::Left((Ok(Ok(mut response)), _)) => {
                    if is_get && response.code.is_success() {
                        if response.etag.is_none() && !service.etag().is_empty() {
                            response.etag = Some(service.etag());
                        }
                        if response.max_age.is_none() {
                            response.max_age = Some(service.max_age());
                        }
                    }
                    response
                }
                Either::Left((Ok(Err(error)), _)) => {
                    warn!("Service at {:?} rejected its promise: {}", path, error);
                    Response::internal_server_error()
                }
                Either::Left((Err(oneshot::Canceled), _)) => {
                    warn!("Service at {:?} dropped its promise", path);
                    Response::service_unavailable()
                }
                Either::Right(_) => {
                    warn!("Service at {:?} outwaited its deadline", path);
                    Response::service_unavailable()
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagram::PairSocketAddr;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TempSensor {
        invocations: AtomicUsize,
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
            promise.resolve(
                Response::content("23").with_content_format(ContentFormat::TEXT_PLAIN_UTF8),
            );
        }
    }

    struct SilentService;

    impl Webservice<PairSocketAddr> for SilentService {
        fn path(&self) -> &str {
            "/slow"
        }

        fn handle(
            &self,
            _request: &OwnedImmutableMessage,
            _remote: &PairSocketAddr,
            promise: ResponsePromise,
        ) {
            // Never resolves.
            drop(promise);
        }
    }

    fn make_request(method: MsgCode, path: &str) -> OwnedImmutableMessage {
        let mut encoder = VecMessageEncoder::new();
        encoder.set_msg_type(MsgType::Con);
        encoder.set_msg_code(method);
        encoder.set_msg_id(0x1001);
        encoder.set_msg_token(MsgToken::new(&[0xAB]));
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            encoder
                .insert_option_with_str(OptionNumber::URI_PATH, segment)
                .unwrap();
        }
        encoder.into()
    }

    fn registry_with_sensor() -> (ServiceRegistry<PairSocketAddr>, Arc<TempSensor>) {
        let registry = ServiceRegistry::new();
        let sensor = Arc::new(TempSensor {
            invocations: AtomicUsize::new(0),
        });
        registry.register(sensor.clone());
        (registry, sensor)
    }

    #[test]
    fn path_reconstruction() {
        assert_eq!(
            request_path(&make_request(MsgCode::MethodGet, "/sensors/temp")),
            "/sensors/temp"
        );
        assert_eq!(request_path(&make_request(MsgCode::MethodGet, "/")), "/");
    }

    #[test]
    fn dispatch_invokes_service() {
        let (registry, sensor) = registry_with_sensor();
        let request = make_request(MsgCode::MethodGet, "/sensors/temp");

        let response = block_on(registry.dispatch(
            &request,
            PairSocketAddr::North,
            Duration::from_secs(45),
        ));

        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        assert_eq!(response.payload(), b"23");
        assert_eq!(sensor.invocations.load(Ordering::SeqCst), 1);

        // GET responses inherit the service's freshness metadata.
        assert_eq!(response.etag, Some(ETag::from(0x23u32)));
        assert_eq!(response.max_age, Some(60));
    }

    #[test]
    fn unknown_path_yields_not_found() {
        let (registry, _) = registry_with_sensor();
        let request = make_request(MsgCode::MethodGet, "/missing");

        let response = block_on(registry.dispatch(
            &request,
            PairSocketAddr::North,
            Duration::from_secs(45),
        ));
        assert_eq!(response.msg_code(), MsgCode::ClientErrorNotFound);
    }

    #[test]
    fn delete_is_rejected_by_default() {
        let (registry, sensor) = registry_with_sensor();
        let request = make_request(MsgCode::MethodDelete, "/sensors/temp");

        let response = block_on(registry.dispatch(
            &request,
            PairSocketAddr::North,
            Duration::from_secs(45),
        ));
        assert_eq!(response.msg_code(), MsgCode::ClientErrorMethodNotAllowed);
        assert_eq!(sensor.invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropped_promise_yields_service_unavailable() {
        let registry: ServiceRegistry<PairSocketAddr> = ServiceRegistry::new();
        registry.register(Arc::new(SilentService));
        let request = make_request(MsgCode::MethodGet, "/slow");

        let response = block_on(registry.dispatch(
            &request,
            PairSocketAddr::North,
            Duration::from_secs(45),
        ));
        assert_eq!(
            response.msg_code(),
            MsgCode::ServerErrorServiceUnavailable
        );
    }

    #[test]
    fn unregister_invokes_shutdown() {
        let (registry, _) = registry_with_sensor();
        assert!(registry.unregister("/sensors/temp"));
        assert!(!registry.unregister("/sensors/temp"));

        let request = make_request(MsgCode::MethodGet, "/sensors/temp");
        let response = block_on(registry.dispatch(
            &request,
            PairSocketAddr::North,
            Duration::from_secs(45),
        ));
        assert_eq!(response.msg_code(), MsgCode::ClientErrorNotFound);
    }

    #[test]
    fn services_compare_by_path() {
        let a = RegisteredService(Arc::new(TempSensor {
            invocations: AtomicUsize::new(0),
        }) as Arc<dyn Webservice<PairSocketAddr>>);
        let b = RegisteredService(Arc::new(TempSensor {
            invocations: AtomicUsize::new(7),
        }) as Arc<dyn Webservice<PairSocketAddr>>);
        let c = RegisteredService(Arc::new(SilentService) as Arc<dyn Webservice<PairSocketAddr>>);

        assert_eq!(a, b);
        assert!(a != c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
