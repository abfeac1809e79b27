//! Request shaping for the `initialize` and `log_event` endpoints.
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::runtime::Handle;
use url::Url;

use crate::{
    config::StatsigMetadata,
    transport::{Request, Transport},
    Error, EvaluationSnapshot, Event, LocalValueStore, NetworkDispatcher, Result, StatsigOptions,
    UserIdentity,
};

const INITIALIZE_ENDPOINT: &str = "initialize";
const LOG_EVENT_ENDPOINT: &str = "log_event";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeBody<'a> {
    user: &'a UserIdentity,
    statsig_metadata: StatsigMetadata<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogEventBody<'a> {
    user: &'a UserIdentity,
    events: &'a [Event],
    statsig_metadata: StatsigMetadata<'a>,
}

/// Talks to the backend through a [`NetworkDispatcher`].
pub struct NetworkService {
    sdk_key: String,
    options: StatsigOptions,
    initialize_url: Url,
    log_event_url: Url,
    dispatcher: NetworkDispatcher,
}

impl NetworkService {
    /// Create a service sending requests through `transport` on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBaseUrl`] if `options.api` is not a valid URL.
    pub fn new(
        sdk_key: impl Into<String>,
        options: StatsigOptions,
        transport: Arc<dyn Transport>,
        runtime: Handle,
    ) -> Result<NetworkService> {
        let initialize_url = endpoint_url(&options.api, INITIALIZE_ENDPOINT)?;
        let log_event_url = endpoint_url(&options.api, LOG_EVENT_ENDPOINT)?;
        let dispatcher =
            NetworkDispatcher::new(transport, options.max_concurrent_requests, runtime);

        Ok(NetworkService {
            sdk_key: sdk_key.into(),
            options,
            initialize_url,
            log_event_url,
            dispatcher,
        })
    }

    /// The dispatcher all requests go through.
    pub fn dispatcher(&self) -> &NetworkDispatcher {
        &self.dispatcher
    }

    /// Options the service was created with.
    pub fn options(&self) -> &StatsigOptions {
        &self.options
    }

    /// Fetch the evaluation snapshot for `user`.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if the backend rejects the SDK key.
    /// - [`Error::UnexpectedStatus`] or [`Error::Transport`] if the request failed.
    /// - [`Error::Serialization`] if the response is not a snapshot.
    pub async fn fetch_initial_values(&self, user: &UserIdentity) -> Result<EvaluationSnapshot> {
        let body = serde_json::to_vec(&InitializeBody {
            user,
            statsig_metadata: self.metadata(user),
        })?;

        let user_key = user.stable_key();
        log::debug!(target: "statsig", user = user_key.as_str(); "fetching initial values");
        let request = self.request(self.initialize_url.clone(), body);
        let response = match self.send_one(request).await {
            Ok(response) => response,
            Err(Error::UnexpectedStatus(401 | 403)) => {
                log::warn!(target: "statsig", "client is not authorized. Check your SDK key");
                return Err(Error::Unauthorized);
            }
            Err(err) => return Err(err),
        };

        let snapshot = EvaluationSnapshot::from_json(response)?;
        log::debug!(target: "statsig", "successfully fetched initial values");
        Ok(snapshot)
    }

    /// Fetch values for the store's user and replace its snapshot.
    ///
    /// On error the store keeps serving its current snapshot.
    pub async fn refresh(&self, store: &LocalValueStore) -> Result<()> {
        let snapshot = self.fetch_initial_values(store.user()).await?;
        store.replace_snapshot(snapshot).await;
        Ok(())
    }

    /// Send a batch of events.
    ///
    /// On failure, returns the serialized request body exactly as it was sent, so it can be
    /// retried later with [`NetworkService::send_requests_with_data`].
    pub async fn send_events(
        &self,
        user: &UserIdentity,
        events: &[Event],
    ) -> std::result::Result<(), Vec<u8>> {
        let body = match serde_json::to_vec(&LogEventBody {
            user,
            events,
            statsig_metadata: self.metadata(user),
        }) {
            Ok(body) => body,
            Err(err) => {
                // Nothing to hand back: the payload never existed.
                log::warn!(
                    target: "statsig",
                    "failed to serialize events, dropping them: {:?}", err
                );
                return Ok(());
            }
        };

        let request = self.request(self.log_event_url.clone(), body.clone());
        let mut results = self.dispatcher.dispatch_all(vec![request]).await;
        match results.pop() {
            Some((_, Ok(_))) => Ok(()),
            Some((_, Err(failure))) => Err(failure.body),
            None => {
                log::warn!(target: "statsig", "event request was dropped before completing");
                Err(body)
            }
        }
    }

    /// Send already-serialized `log_event` payloads. Returns the payloads that failed, in the
    /// order they were given.
    pub async fn send_requests_with_data(&self, payloads: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let requests = payloads
            .into_iter()
            .map(|body| self.request(self.log_event_url.clone(), body))
            .collect();

        self.dispatcher
            .dispatch_all(requests)
            .await
            .into_iter()
            .filter_map(|(_, result)| result.err().map(|failure| failure.body))
            .collect()
    }

    fn request(&self, url: Url, body: Vec<u8>) -> Request {
        Request::post_json(url, body)
            .with_header("STATSIG-API-KEY", self.sdk_key.as_str())
            .with_header("STATSIG-CLIENT-TIME", Utc::now().timestamp_millis().to_string())
            .with_header("STATSIG-SDK-TYPE", self.options.sdk_metadata.name)
            .with_header("STATSIG-SDK-VERSION", self.options.sdk_metadata.version)
    }

    fn metadata<'a>(&self, user: &'a UserIdentity) -> StatsigMetadata<'a> {
        StatsigMetadata::new(&self.options.sdk_metadata, user.device_id.as_deref())
    }

    async fn send_one(&self, request: Request) -> Result<Vec<u8>> {
        let mut results = self.dispatcher.dispatch_all(vec![request]).await;
        match results.pop() {
            Some((_, Ok(response))) => Ok(response.body),
            Some((_, Err(failure))) => Err(failure.error),
            None => Err(Error::Transport("request was dropped".into())),
        }
    }
}

fn endpoint_url(api: &str, endpoint: &str) -> Result<Url> {
    Url::parse(&format!("{}/{}", api.trim_end_matches('/'), endpoint))
        .map_err(Error::InvalidBaseUrl)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::runtime::Handle;

    use super::NetworkService;
    use crate::{
        transport::{Method, Request, Response, Transport},
        Error, Event, HashedName, InMemoryStore, LocalValueStore, Result, StatsigOptions,
        UserIdentity,
    };

    /// Records requests and answers each with a scripted status.
    struct RecordingTransport {
        status: u16,
        body: Vec<u8>,
        requests: Mutex<Vec<Request>>,
    }

    impl RecordingTransport {
        fn new(status: u16, body: Value) -> Arc<RecordingTransport> {
            Arc::new(RecordingTransport {
                status,
                body: serde_json::to_vec(&body).unwrap(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: &Request) -> Result<Response> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(Response {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    fn service(transport: Arc<dyn Transport>) -> NetworkService {
        NetworkService::new(
            "client-api-key",
            StatsigOptions::default(),
            transport,
            Handle::current(),
        )
        .unwrap()
    }

    fn body_of(request: &Request) -> Value {
        serde_json::from_slice(&request.body).unwrap()
    }

    #[tokio::test]
    async fn fetch_initial_values_shapes_request() {
        let transport = RecordingTransport::new(200, json!({}));
        let service = service(transport.clone());

        let snapshot = service
            .fetch_initial_values(&UserIdentity::new("jkw").with_device_id("device"))
            .await
            .unwrap();
        assert!(snapshot.is_empty());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, Method::Post);
        assert_eq!(
            request.url.as_str(),
            "https://api.statsig.com/v1/initialize"
        );
        assert_eq!(request.header("STATSIG-API-KEY"), Some("client-api-key"));

        let body = body_of(request);
        assert_eq!(body["user"], json!({"userID": "jkw"}));
        assert_eq!(body["statsigMetadata"]["stableID"], json!("device"));
    }

    #[tokio::test]
    async fn fetch_initial_values_maps_auth_failures() {
        let service = service(RecordingTransport::new(401, json!({})));
        let result = service.fetch_initial_values(&UserIdentity::new("jkw")).await;
        assert!(matches!(result, Err(Error::Unauthorized)));

        let service = super::NetworkService::new(
            "key",
            StatsigOptions::default(),
            RecordingTransport::new(500, json!({})),
            Handle::current(),
        )
        .unwrap();
        let result = service.fetch_initial_values(&UserIdentity::new("jkw")).await;
        assert!(matches!(result, Err(Error::UnexpectedStatus(500))));
    }

    #[tokio::test]
    async fn refresh_replaces_store_snapshot() {
        let gate = HashedName::of("gate");
        let transport = RecordingTransport::new(
            200,
            json!({"feature_gates": {gate.as_str(): {"value": true, "rule_id": "rule_id_2"}}}),
        );
        let service = service(transport);
        let store =
            LocalValueStore::load(UserIdentity::new("jkw"), Arc::new(InMemoryStore::new())).await;

        service.refresh(&store).await.unwrap();

        let result = store.get_gate(&gate);
        assert!(result.bool_value);
        assert_eq!(result.rule_id, "rule_id_2");
    }

    #[tokio::test]
    async fn send_events_returns_exact_bytes_on_failure() {
        let transport = RecordingTransport::new(403, json!({}));
        let service = service(transport.clone());
        let user = UserIdentity::new("jkw");

        let returned = service
            .send_events(&user, &[Event::new(&user, "test_event").with_value(9.99)])
            .await
            .unwrap_err();

        let requests = transport.requests();
        assert_eq!(requests[0].body, returned);
        assert_eq!(
            requests[0].url.as_str(),
            "https://api.statsig.com/v1/log_event"
        );

        let body = body_of(&requests[0]);
        assert!(body.get("user").is_some());
        assert!(body.get("statsigMetadata").is_some());
        assert_eq!(body["events"][0]["eventName"], json!("test_event"));
    }

    #[tokio::test]
    async fn send_events_succeeds_on_2xx() {
        let service = service(RecordingTransport::new(202, json!({})));
        let user = UserIdentity::new("jkw");
        assert!(service
            .send_events(&user, &[Event::new(&user, "test_event")])
            .await
            .is_ok());
    }

    /// Fails every request, answering later requests sooner.
    struct ReversedFailures;

    #[async_trait]
    impl Transport for ReversedFailures {
        async fn send(&self, request: &Request) -> Result<Response> {
            let index: u64 = serde_json::from_slice::<Value>(&request.body).unwrap()["index"]
                .as_u64()
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100 - index * 10)).await;
            Err(Error::Transport("timed out".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_requests_with_data_returns_failed_payloads_in_order() {
        let service = service(Arc::new(ReversedFailures));
        let payloads: Vec<Vec<u8>> = (0..10)
            .map(|index| serde_json::to_vec(&json!({"index": index, "events": []})).unwrap())
            .collect();

        let failed = service.send_requests_with_data(payloads.clone()).await;

        assert_eq!(failed, payloads);
    }

    #[tokio::test]
    async fn send_events_returns_body_when_request_is_dropped() {
        // Tasks spawned onto a runtime that has shut down are dropped without running.
        let stopped = std::thread::spawn(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.handle().clone()
        })
        .join()
        .unwrap();
        let transport = RecordingTransport::new(200, json!({}));
        let service = NetworkService::new(
            "client-api-key",
            StatsigOptions::default(),
            transport.clone(),
            stopped,
        )
        .unwrap();
        let user = UserIdentity::new("jkw");

        let returned = service
            .send_events(&user, &[Event::new(&user, "test_event")])
            .await
            .unwrap_err();

        assert!(transport.requests().is_empty());
        let body: Value = serde_json::from_slice(&returned).unwrap();
        assert_eq!(body["events"][0]["eventName"], json!("test_event"));
        assert_eq!(service.dispatcher().in_flight(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_api() {
        let result = NetworkService::new(
            "key",
            StatsigOptions::default().with_api("not a url"),
            RecordingTransport::new(200, json!({})),
            Handle::current(),
        );
        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }
}
