//! Bounded network dispatcher: sends requests with a hard cap on concurrently open requests.
//!
//! Requests beyond the cap wait in a FIFO queue and are admitted one by one as earlier requests
//! complete. The dispatcher never retries: a failed request is reported to the caller together
//! with its original body so it can be buffered for a later attempt.
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::runtime::Handle;

use crate::{
    transport::{Request, Response, Transport},
    Error,
};

/// Outcome of one dispatched request.
pub type DispatchResult = std::result::Result<Response, DispatchError>;

type Callback = Arc<dyn Fn(Request, DispatchResult) + Send + Sync>;

/// A request that failed (transport error or non-2xx status).
#[derive(thiserror::Error, Debug, Clone)]
#[error("request failed")]
pub struct DispatchError {
    /// Body of the failed request, byte-for-byte as it was sent.
    pub body: Vec<u8>,
    /// Why the request failed.
    #[source]
    pub error: Error,
}

/// Sends requests through a [`Transport`], keeping at most `max_in_flight` of them open.
///
/// Cloning is cheap; clones share the same limit and queue.
#[derive(Clone)]
pub struct NetworkDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    runtime: Handle,
    max_in_flight: usize,
    queue: Mutex<DispatchQueue>,
}

/// Admission state. Only ever touched under `Inner::queue`.
#[derive(Default)]
struct DispatchQueue {
    in_flight: usize,
    pending: VecDeque<Job>,
}

struct Job {
    request: Request,
    on_each: Callback,
}

impl DispatchQueue {
    /// Pop jobs from the front of the queue while there is capacity, counting them as in flight.
    fn admit(&mut self, max_in_flight: usize) -> Vec<Job> {
        let mut admitted = Vec::new();
        while self.in_flight < max_in_flight {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.in_flight += 1;
            admitted.push(job);
        }
        admitted
    }
}

impl NetworkDispatcher {
    /// Default cap on concurrently open requests.
    pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

    /// Create a dispatcher that spawns requests onto `runtime`. `max_in_flight` is at least 1.
    pub fn new(
        transport: Arc<dyn Transport>,
        max_in_flight: usize,
        runtime: Handle,
    ) -> NetworkDispatcher {
        NetworkDispatcher {
            inner: Arc::new(Inner {
                transport,
                runtime,
                max_in_flight: max_in_flight.max(1),
                queue: Mutex::new(DispatchQueue::default()),
            }),
        }
    }

    /// Queue `requests` in order and return immediately.
    ///
    /// `on_each` is invoked exactly once per request, from the runtime, in completion order.
    pub fn dispatch<F>(&self, requests: impl IntoIterator<Item = Request>, on_each: F)
    where
        F: Fn(Request, DispatchResult) + Send + Sync + 'static,
    {
        let on_each: Callback = Arc::new(on_each);

        let admitted = {
            let mut queue = self.inner.lock_queue();
            queue.pending.extend(requests.into_iter().map(|request| Job {
                request,
                on_each: on_each.clone(),
            }));
            queue.admit(self.inner.max_in_flight)
        };

        for job in admitted {
            Inner::spawn(&self.inner, job);
        }
    }

    /// Dispatch `requests` and wait for all of them to complete.
    ///
    /// Results are returned in submission order, whatever order the requests completed in.
    pub async fn dispatch_all(&self, requests: Vec<Request>) -> Vec<(Request, DispatchResult)> {
        let count = requests.len();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();

        for (index, request) in requests.into_iter().enumerate() {
            let sender = sender.clone();
            self.dispatch([request], move |request, result| {
                // Receiver is only dropped if the caller stopped waiting.
                let _ = sender.send((index, request, result));
            });
        }
        // The channel closes once every callback has run and been dropped.
        drop(sender);

        let mut results = Vec::with_capacity(count);
        while let Some(result) = receiver.recv().await {
            results.push(result);
        }
        results.sort_by_key(|(index, _, _)| *index);
        results
            .into_iter()
            .map(|(_, request, result)| (request, result))
            .collect()
    }

    /// Number of requests currently open.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_queue().in_flight
    }

    /// Number of requests waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.inner.lock_queue().pending.len()
    }

    /// Cap on concurrently open requests.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight
    }
}

impl Inner {
    fn lock_queue(&self) -> std::sync::MutexGuard<'_, DispatchQueue> {
        self.queue
            .lock()
            .expect("thread holding dispatch queue lock should not panic")
    }

    fn spawn(this: &Arc<Inner>, job: Job) {
        let slot = Slot {
            inner: Arc::clone(this),
        };
        let transport = Arc::clone(&this.transport);
        log::debug!(target: "statsig", url = job.request.url.as_str(); "sending request");

        this.runtime.spawn(async move {
            let request = job.request.clone();
            let sending = slot
                .inner
                .runtime
                .spawn(async move { send(transport.as_ref(), &request).await });

            let result = match sending.await {
                Ok(result) => result,
                Err(err) => {
                    log::warn!(
                        target: "statsig", url = job.request.url.as_str();
                        "request task failed: {:?}", err
                    );
                    Err(DispatchError {
                        body: job.request.body.clone(),
                        error: Error::Transport(err.to_string().into()),
                    })
                }
            };

            // Release the slot before the callback runs.
            drop(slot);
            (job.on_each)(job.request, result);
        });
    }
}

/// One admitted request. Dropping it frees the slot and admits the next queued requests, so a
/// slot is released even if the request task is cancelled.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let next = {
            let mut queue = self.inner.lock_queue();
            queue.in_flight -= 1;
            queue.admit(self.inner.max_in_flight)
        };
        for job in next {
            Inner::spawn(&self.inner, job);
        }
    }
}

async fn send(transport: &dyn Transport, request: &Request) -> DispatchResult {
    let error = match transport.send(request).await {
        Ok(response) if response.is_success() => return Ok(response),
        Ok(response) => Error::UnexpectedStatus(response.status),
        Err(err) => err,
    };

    log::warn!(target: "statsig", url = request.url.as_str(); "request failed: {:?}", error);
    Err(DispatchError {
        body: request.body.clone(),
        error,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::runtime::Handle;
    use url::Url;

    use super::NetworkDispatcher;
    use crate::{
        transport::{Request, Response, Transport},
        Error, Result,
    };

    /// Transport that holds every request open for `delay` and records peak concurrency.
    #[derive(Default)]
    struct SlowTransport {
        delay: Duration,
        open: AtomicUsize,
        peak: AtomicUsize,
        sent: AtomicUsize,
        fail_status: Option<u16>,
        order: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(&self, request: &Request) -> Result<Response> {
            let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(open, Ordering::SeqCst);
            self.sent.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(request.body.clone());

            tokio::time::sleep(self.delay).await;

            self.open.fetch_sub(1, Ordering::SeqCst);
            Ok(Response {
                status: self.fail_status.unwrap_or(200),
                body: b"{}".to_vec(),
            })
        }
    }

    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn send(&self, _request: &Request) -> Result<Response> {
            Err(Error::Transport("connection refused".into()))
        }
    }

    fn requests(count: usize) -> Vec<Request> {
        (0..count)
            .map(|i| {
                Request::post_json(
                    Url::parse("https://api.statsig.com/v1/log_event").unwrap(),
                    format!("{{\"index\":{i}}}").into_bytes(),
                )
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_in_flight() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(200),
            ..SlowTransport::default()
        });
        let dispatcher = NetworkDispatcher::new(transport.clone(), 10, Handle::current());

        let results = dispatcher.dispatch_all(requests(20)).await;

        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 20);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 10);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn burst_fills_slots_and_queues_the_rest() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_secs(1),
            ..SlowTransport::default()
        });
        let dispatcher = NetworkDispatcher::new(transport.clone(), 10, Handle::current());
        let completed = Arc::new(AtomicUsize::new(0));

        {
            let completed = completed.clone();
            dispatcher.dispatch(requests(20), move |_, _| {
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(dispatcher.in_flight(), 10);
        assert_eq!(dispatcher.queued(), 10);

        // Let the admitted requests reach the transport.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent.load(Ordering::SeqCst), 10);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_requests_are_admitted_in_submission_order() {
        let transport = Arc::new(SlowTransport {
            delay: Duration::from_millis(10),
            ..SlowTransport::default()
        });
        let dispatcher = NetworkDispatcher::new(transport.clone(), 1, Handle::current());

        dispatcher.dispatch_all(requests(5)).await;

        let order = transport.order.lock().unwrap().clone();
        let expected: Vec<Vec<u8>> = requests(5).into_iter().map(|r| r.body).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn failures_return_original_body() {
        let dispatcher = NetworkDispatcher::new(Arc::new(BrokenTransport), 10, Handle::current());

        let results = dispatcher.dispatch_all(requests(3)).await;

        assert_eq!(results.len(), 3);
        for (request, result) in results {
            let err = result.unwrap_err();
            assert_eq!(err.body, request.body);
            assert!(matches!(err.error, Error::Transport(_)));
        }
    }

    #[tokio::test]
    async fn non_2xx_is_a_failure() {
        let transport = Arc::new(SlowTransport {
            fail_status: Some(403),
            ..SlowTransport::default()
        });
        let dispatcher = NetworkDispatcher::new(transport, 10, Handle::current());

        let results = dispatcher.dispatch_all(requests(1)).await;

        let err = results[0].1.as_ref().unwrap_err();
        assert!(matches!(err.error, Error::UnexpectedStatus(403)));
    }

    /// Panics on requests whose body is `panic`, answers 200 otherwise.
    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn send(&self, request: &Request) -> Result<Response> {
            if request.body == b"panic" {
                panic!("transport bug");
            }
            Ok(Response {
                status: 200,
                body: vec![],
            })
        }
    }

    #[tokio::test]
    async fn panicking_transport_releases_its_slot() {
        let dispatcher = NetworkDispatcher::new(Arc::new(PanickingTransport), 1, Handle::current());
        let url = Url::parse("https://api.statsig.com/v1/log_event").unwrap();
        let requests = vec![
            Request::post_json(url.clone(), b"panic".to_vec()),
            Request::post_json(url, b"{}".to_vec()),
        ];

        let results = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.dispatch_all(requests),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 2);
        let err = results[0].1.as_ref().unwrap_err();
        assert_eq!(err.body, b"panic".to_vec());
        assert!(matches!(err.error, Error::Transport(_)));
        assert!(results[1].1.is_ok());
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.queued(), 0);
    }

    #[tokio::test]
    async fn zero_limit_is_raised_to_one() {
        let dispatcher = NetworkDispatcher::new(Arc::new(BrokenTransport), 0, Handle::current());
        assert_eq!(dispatcher.max_in_flight(), 1);
        assert_eq!(dispatcher.dispatch_all(requests(2)).await.len(), 2);
    }
}
