//! Client side of `/api/events`: keeps one SSE connection open and reconnects
//! with exponential backoff when it drops.

use std::time::Duration;

use reqwest_eventsource::retry::ExponentialBackoff;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notify::Notification;

/// Reconnect schedule: `initial`, then multiplied by `factor` per attempt up to `max`.
/// The retry count resets once a connection is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Consecutive failed reconnects before giving up.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2,
            max_retries: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.initial,
            f64::from(self.factor),
            Some(self.max),
            Some(self.max_retries as usize),
        )
    }
}

pub struct EventSubscriber {
    url: String,
    token: Option<String>,
    policy: ReconnectPolicy,
    client: reqwest::Client,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EventSubscriber {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8420`.
    pub fn new(base_url: &str, token: Option<String>, policy: ReconnectPolicy) -> Self {
        Self {
            url: format!("{}/api/events", base_url.trim_end_matches('/')),
            token,
            policy,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the background connection. The receiver yields notifications until
    /// `close()` is called or reconnecting gives up.
    pub fn connect(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(task) = self.task.take() {
            self.cancel.cancel();
            task.abort();
        }
        self.cancel = CancellationToken::new();

        let mut request = self.client.get(&self.url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }
        let connection = Connection {
            url: self.url.clone(),
            tx,
        };
        self.task = Some(tokio::spawn(connection.run(request, self.policy, self.cancel.clone())));
        rx
    }

    pub async fn close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Connection {
    url: String,
    tx: mpsc::UnboundedSender<Notification>,
}

impl Connection {
    async fn run(self, request: reqwest::RequestBuilder, policy: ReconnectPolicy, cancel: CancellationToken) {
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                warn!(url = %self.url, error = %e, "cannot open event stream");
                return;
            }
        };
        source.set_retry_policy(Box::new(policy.backoff()));

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = source.next() => event,
            };
            match event {
                Some(Ok(Event::Open)) => debug!(url = %self.url, "event stream connected"),
                Some(Ok(Event::Message(message))) => {
                    self.forward(&message.event, &message.data);
                    if self.tx.is_closed() {
                        break;
                    }
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                    info!(url = %self.url, "event stream ended, reconnecting");
                }
                Some(Err(e)) => warn!(url = %self.url, error = %e, "event stream failed"),
                None => {
                    warn!(url = %self.url, retries = policy.max_retries, "giving up on event stream");
                    break;
                }
            }
        }
        source.close();
    }

    fn forward(&self, event: &str, data: &str) {
        match serde_json::from_str::<Notification>(data) {
            Ok(notification) => {
                let _ = self.tx.send(notification);
            }
            Err(e) => warn!(event, error = %e, "ignoring undecodable notification"),
        }
    }
}
