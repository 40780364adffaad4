//! KeyDB / Redis backend.
//!
//! Builds a [`fred::clients::Pool`] for commands and opens one dedicated
//! [`SubscriberClient`] per channel subscription, so that tearing down one
//! channel never disturbs another channel's feed. Each subscriber runs
//! fred's subscription manager, which replays SUBSCRIBE after a reconnect.

use std::time::Duration;

use async_trait::async_trait;
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{ClientLike, EventInterface, KeysInterface, LuaInterface, PubsubInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{SharedStore, StoreError, Subscription, COMPARE_AND_DELETE_SCRIPT};
use crate::config::StoreConfig;

/// Default port when the endpoint omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Redis-compatible store shared by every relay process.
#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    /// Connects a pool described by `config` and verifies it with PING.
    ///
    /// If `config.tls` is set (or the endpoint uses the `rediss://` scheme)
    /// the connection uses `rustls`. The password is read from the
    /// environment variable named by `config.auth_token_env`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let auth_token = std::env::var(&config.auth_token_env).ok();
        let tls = config.tls || config.endpoint.starts_with("rediss://");

        let endpoint = config
            .endpoint
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");
        let (host, port) = parse_host_port(endpoint)?;

        let mut fred_config = FredConfig {
            server: ServerConfig::new_centralized(host, port),
            ..FredConfig::default()
        };

        if tls {
            let connector =
                TlsConnector::default_rustls().map_err(|e| StoreError::InvalidEndpoint {
                    endpoint: config.endpoint.clone(),
                    message: e.to_string(),
                })?;
            fred_config.tls = Some(connector.into());
        }

        if let Some(token) = auth_token.filter(|t| !t.is_empty()) {
            fred_config.password = Some(token);
        }

        let mut builder = Builder::from_config(fred_config);
        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let pool = builder
            .build_pool(config.pool_size)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        pool.init()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let _: String = pool
            .ping(None)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(
            host = host,
            port = port,
            tls = tls,
            pool_size = config.pool_size,
            "KeyDB pool created and verified"
        );

        Ok(Self { pool })
    }

    /// Wraps an already initialised pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    async fn open_subscription(&self, channel: &str) -> Result<KeyDbSubscription, StoreError> {
        let subscribe_error = |message: String| StoreError::Subscribe {
            channel: channel.to_string(),
            message,
        };

        let client = self.pool.next();
        let subscriber = SubscriberClient::new(
            client.client_config(),
            None,
            None,
            client.client_reconnect_policy(),
        );
        let _connect = subscriber.connect();
        subscriber
            .wait_for_connect()
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        // Take the receiver before SUBSCRIBE so no early message is missed.
        let messages = subscriber.message_rx();

        if let Err(e) = subscriber.subscribe(channel).await {
            let _ = subscriber.quit().await;
            return Err(subscribe_error(e.to_string()));
        }
        // Replays the subscription on every reconnect until aborted.
        let resubscriber = subscriber.manage_subscriptions();

        debug!(%channel, "KeyDB subscription opened");
        Ok(KeyDbSubscription {
            channel: channel.to_string(),
            subscriber,
            messages,
            resubscriber,
        })
    }
}

#[async_trait]
impl SharedStore for KeyDbStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let result: Option<String> = self
            .pool
            .set(
                key,
                value,
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(|e| StoreError::Command {
                op: "SET NX",
                message: e.to_string(),
            })?;
        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .pool
            .eval(
                COMPARE_AND_DELETE_SCRIPT,
                vec![key.to_string()],
                vec![expected.to_string()],
            )
            .await
            .map_err(|e| StoreError::Command {
                op: "EVAL",
                message: e.to_string(),
            })?;
        Ok(deleted == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // Pool does not implement PubsubInterface; publish through one client.
        let _: () = self
            .pool
            .next()
            .publish(channel, payload)
            .await
            .map_err(|e| StoreError::Command {
                op: "PUBLISH",
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let subscription = self.open_subscription(channel).await?;
        Ok(Box::new(subscription))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self
            .pool
            .ping(None)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "keydb"
    }
}

/// Feed backed by a dedicated subscriber connection.
struct KeyDbSubscription {
    channel: String,
    subscriber: SubscriberClient,
    messages: broadcast::Receiver<fred::types::Message>,
    resubscriber: JoinHandle<()>,
}

#[async_trait]
impl Subscription for KeyDbSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn next_message(&mut self) -> Option<String> {
        loop {
            match self.messages.recv().await {
                Ok(message) => {
                    if &*message.channel != self.channel.as_str() {
                        continue;
                    }
                    match message.value.as_string() {
                        Some(payload) => return Some(payload),
                        None => {
                            debug!(channel = %self.channel, "Skipping non-text pub/sub payload");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscription lagged, skipped messages");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(self: Box<Self>) {
        self.resubscriber.abort();
        if let Err(e) = self.subscriber.unsubscribe(self.channel.as_str()).await {
            debug!(channel = %self.channel, error = %e, "UNSUBSCRIBE failed");
        }
        if let Err(e) = self.subscriber.quit().await {
            debug!(channel = %self.channel, error = %e, "Subscriber QUIT failed");
        }
        debug!(channel = %self.channel, "KeyDB subscription closed");
    }
}

/// Parse a `host:port` string. If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16), StoreError> {
    // Strip trailing path segments (e.g. a database index from a URI).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if endpoint.is_empty() {
        return Err(StoreError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: "missing host".to_string(),
        });
    }

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str.parse().map_err(|_| StoreError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: format!("invalid port '{port_str}'"),
        })?;
        Ok((host, port))
    } else {
        Ok((endpoint, DEFAULT_PORT))
    }
}
