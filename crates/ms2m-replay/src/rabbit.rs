//! ---
//! ms2m_section: "06-replay"
//! ms2m_subsection: "module"
//! ms2m_type: "source"
//! ms2m_scope: "code"
//! ms2m_description: "RabbitMQ management HTTP API client."
//! ms2m_version: "v0.0.0-prealpha"
//! ms2m_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ms2m_api::MessageQueueConfig;
use ms2m_common::ReplayConfig;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::admin::{BrokerConnector, ControlSignal, QueueAdmin, QueueDepth};
use crate::error::{ReplayError, Result};

const MANAGEMENT_PORT: u16 = 15672;
const DEFAULT_EXCHANGE: &str = "amq.default";
const DEFAULT_USER: &str = "guest";

/// Talks to the broker's management plugin.
#[derive(Debug, Clone)]
pub struct RabbitManagementClient {
    client: Client,
    base: Url,
    vhost: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    #[serde(default)]
    messages: Option<u64>,
    #[serde(default)]
    messages_ready: Option<u64>,
    #[serde(default)]
    messages_unacknowledged: Option<u64>,
    #[serde(default)]
    consumers: u64,
}

#[derive(Debug, Deserialize)]
struct PublishResult {
    routed: bool,
}

impl RabbitManagementClient {
    pub fn new(client: Client, base: Url, vhost: &str, username: &str, password: &str) -> Self {
        Self {
            client,
            base,
            vhost: vhost.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
        }
    }

    /// Build a client for `broker_url`. Explicit settings in `config` win;
    /// otherwise host, credentials and vhost come from the AMQP URL and the
    /// management API is assumed on port 15672 of the broker host.
    pub fn for_broker(client: Client, broker_url: &str, config: &ReplayConfig) -> Result<Self> {
        let amqp = Url::parse(broker_url)
            .map_err(|err| ReplayError::InvalidConfig(format!("brokerURL {broker_url:?}: {err}")))?;

        let base = match &config.management_url {
            Some(explicit) => Url::parse(explicit)
                .map_err(|err| ReplayError::InvalidConfig(format!("management url: {err}")))?,
            None => {
                let host = amqp.host_str().ok_or_else(|| {
                    ReplayError::InvalidConfig(format!("brokerURL {broker_url:?} has no host"))
                })?;
                let scheme = if amqp.scheme() == "amqps" { "https" } else { "http" };
                Url::parse(&format!("{scheme}://{host}:{MANAGEMENT_PORT}/"))
                    .map_err(|err| ReplayError::InvalidConfig(err.to_string()))?
            }
        };

        let username = config.username.clone().unwrap_or_else(|| {
            if amqp.username().is_empty() {
                DEFAULT_USER.to_owned()
            } else {
                amqp.username().to_owned()
            }
        });
        let password = config
            .password
            .clone()
            .or_else(|| amqp.password().map(str::to_owned))
            .unwrap_or_else(|| DEFAULT_USER.to_owned());
        let url_vhost = amqp.path().trim_start_matches('/');
        let vhost = if config.management_url.is_none() && !url_vhost.is_empty() {
            url_vhost.to_owned()
        } else {
            config.vhost.clone()
        };

        Ok(Self::new(client, base, &vhost, &username, &password))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ReplayError::InvalidConfig(format!("management url {} cannot be a base", self.base))
            })?;
            path.pop_if_empty().push("api");
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }
}

async fn check(
    operation: &'static str,
    sent: reqwest::Result<reqwest::Response>,
    accepted: &[StatusCode],
) -> Result<reqwest::Response> {
    let response = sent.map_err(|err| ReplayError::Management {
        operation,
        reason: err.to_string(),
    })?;
    if accepted.contains(&response.status()) {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(ReplayError::Management {
        operation,
        reason: format!("{status}: {}", body.trim()),
    })
}

#[async_trait]
impl QueueAdmin for RabbitManagementClient {
    async fn declare_queue(&self, queue: &str, expiry: Duration) -> Result<()> {
        let url = self.endpoint(&["queues", &self.vhost, queue])?;
        let body = json!({
            "durable": true,
            "auto_delete": false,
            "arguments": { "x-expires": expiry.as_millis() as u64 },
        });
        check(
            "declare queue",
            self.request(Method::PUT, url).json(&body).send().await,
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        debug!(%queue, "secondary queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let url = self.endpoint(&["bindings", &self.vhost, "e", exchange, "q", queue])?;
        check(
            "bind queue",
            self.request(Method::POST, url)
                .json(&json!({ "routing_key": routing_key, "arguments": {} }))
                .send()
                .await,
            &[StatusCode::CREATED, StatusCode::NO_CONTENT],
        )
        .await?;
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth> {
        let url = self.endpoint(&["queues", &self.vhost, queue])?;
        let response = check(
            "queue depth",
            self.request(Method::GET, url).send().await,
            &[StatusCode::OK, StatusCode::NOT_FOUND],
        )
        .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ReplayError::QueueMissing(queue.to_owned()));
        }
        let info: QueueInfo = response.json().await.map_err(|err| ReplayError::Management {
            operation: "queue depth",
            reason: err.to_string(),
        })?;
        // Freshly declared queues report no stats until the first sample.
        let messages = info.messages.unwrap_or_else(|| {
            info.messages_ready.unwrap_or(0) + info.messages_unacknowledged.unwrap_or(0)
        });
        Ok(QueueDepth {
            messages,
            consumers: info.consumers,
        })
    }

    async fn publish_control(&self, queue: &str, signal: ControlSignal, migration: &str) -> Result<()> {
        let url = self.endpoint(&["exchanges", &self.vhost, DEFAULT_EXCHANGE, "publish"])?;
        let body = json!({
            "properties": {
                "headers": { "ms2m-control": signal.as_str(), "ms2m-migration": migration },
                "delivery_mode": 2,
            },
            "routing_key": queue,
            "payload": signal.as_str(),
            "payload_encoding": "string",
        });
        let response = check(
            "publish control",
            self.request(Method::POST, url).json(&body).send().await,
            &[StatusCode::OK],
        )
        .await?;
        let result: PublishResult = response.json().await.map_err(|err| ReplayError::Management {
            operation: "publish control",
            reason: err.to_string(),
        })?;
        if !result.routed {
            return Err(ReplayError::QueueMissing(queue.to_owned()));
        }
        debug!(%queue, %signal, "control signal published");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str, if_empty: bool) -> Result<bool> {
        let mut url = self.endpoint(&["queues", &self.vhost, queue])?;
        if if_empty {
            url.query_pairs_mut().append_pair("if-empty", "true");
        }
        let response = check(
            "delete queue",
            self.request(Method::DELETE, url).send().await,
            &[StatusCode::NO_CONTENT, StatusCode::OK, StatusCode::NOT_FOUND, StatusCode::BAD_REQUEST],
        )
        .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::BAD_REQUEST if if_empty => Ok(false),
            StatusCode::BAD_REQUEST => Err(ReplayError::Management {
                operation: "delete queue",
                reason: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(true),
        }
    }
}

/// Builds a management client per migration from its broker URL.
#[derive(Debug, Clone)]
pub struct RabbitConnector {
    client: Client,
    config: ReplayConfig,
}

impl RabbitConnector {
    pub fn new(config: ReplayConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ReplayError::InvalidConfig(format!("http client: {err}")))?;
        Ok(Self { client, config })
    }
}

impl BrokerConnector for RabbitConnector {
    fn connect(&self, mq: &MessageQueueConfig) -> Result<Arc<dyn QueueAdmin>> {
        let admin = RabbitManagementClient::for_broker(self.client.clone(), &mq.broker_url, &self.config)?;
        Ok(Arc::new(admin))
    }
}
