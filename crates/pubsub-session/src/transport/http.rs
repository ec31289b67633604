//! [`reqwest`]-backed [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{Envelope, PollBatch, PollRequest, PublishRequest, Transport};
use crate::crypto::sign_publish;
use crate::types::{Error, PublishAck, SessionConfig, Timetoken};

const PROTOCOL_VERSION: &str = "3.1";
const AGENT_STRING: &str = "pubsub-session-rs/0.1";

/// HTTP long-poll transport.
///
/// Every operation is a `GET` whose path carries the keys, channel and
/// payload; responses are JSON arrays.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: url::Url,
    publish_key: String,
    subscribe_key: String,
    secret_key: String,
    instance_id: String,
    poll_timeout: Duration,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        let scheme = if config.ssl { "https" } else { "http" };
        let origin = config.origin();
        let base = url::Url::parse(&format!("{scheme}://{origin}/"))
            .map_err(|e| Error::Configuration(format!("invalid origin {origin:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Configuration(format!("invalid origin {origin:?}")));
        }
        let client = reqwest::Client::builder()
            .user_agent(AGENT_STRING)
            .build()
            .map_err(|e| Error::Configuration(format!("HTTP client: {e}")))?;
        let timing = config.timing();
        Ok(Self {
            client,
            base,
            publish_key: config.publish_key.clone(),
            subscribe_key: config.subscribe_key.clone(),
            secret_key: config.secret_key.clone(),
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            poll_timeout: timing.poll_timeout,
            request_timeout: timing.request_timeout,
        })
    }

    /// `segments` must already be percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(segment);
        }
        let mut u = self.base.clone();
        u.set_path(&path);
        u.query_pairs_mut().append_pair("uuid", &self.instance_id);
        u
    }

    /// Channel names are encoded one by one so a comma inside a name stays
    /// distinct from the separator.
    fn subscribe_url(&self, request: &PollRequest) -> url::Url {
        let channels = request
            .channels
            .iter()
            .map(|c| encode_segment(c))
            .collect::<Vec<_>>()
            .join(",");
        let cursor = request.cursor.to_string();
        self.endpoint(&[
            "subscribe",
            &encode_segment(&self.subscribe_key),
            &channels,
            "0",
            &cursor,
        ])
    }

    async fn get_json(&self, u: url::Url, timeout: Duration) -> Result<Value, Error> {
        tracing::trace!(path = u.path(), "GET");
        let resp = self
            .client
            .get(u)
            .header("V", PROTOCOL_VERSION)
            .timeout(timeout)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Server {
                status: status.as_u16(),
                message: body,
            });
        }
        serde_json::from_str(&body).map_err(|e| Error::Server {
            status: status.as_u16(),
            message: format!("malformed response body: {e}"),
        })
    }
}

/// Percent-encode everything outside the unreserved set, UTF-8 byte by byte.
fn encode_segment(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn malformed(what: &str) -> Error {
    Error::Server {
        status: 200,
        message: format!("malformed {what} response"),
    }
}

/// Timetokens arrive as JSON numbers or numeric strings.
fn parse_timetoken(value: &Value) -> Option<Timetoken> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(Timetoken),
        Value::String(s) => s.parse().ok().map(Timetoken),
        _ => None,
    }
}

/// `[[msg, …], "<timetoken>"]`, optionally followed by a comma-separated list
/// naming the channel of each message.
fn parse_poll_response(body: Value, channels: &[String]) -> Result<PollBatch, Error> {
    let Value::Array(parts) = body else {
        return Err(malformed("subscribe"));
    };
    let mut parts = parts.into_iter();
    let Some(Value::Array(payloads)) = parts.next() else {
        return Err(malformed("subscribe"));
    };
    let cursor = parts
        .next()
        .as_ref()
        .and_then(parse_timetoken)
        .ok_or_else(|| malformed("subscribe"))?;

    let routing: Vec<String> = match parts.next() {
        Some(Value::String(list)) if !list.is_empty() => split_routing(&list, channels),
        _ => match channels {
            [only] => vec![only.clone(); payloads.len()],
            _ if payloads.is_empty() => Vec::new(),
            _ => {
                return Err(Error::Server {
                    status: 200,
                    message: "multiplexed response without channel list".into(),
                });
            }
        },
    };
    if routing.len() != payloads.len() {
        return Err(malformed("subscribe"));
    }

    let messages = routing
        .into_iter()
        .zip(payloads)
        .map(|(channel, payload)| Envelope { channel, payload })
        .collect();
    Ok(PollBatch { messages, cursor })
}

/// Split the routing list on commas, matching polled names first so a name
/// that itself contains a comma stays whole.
fn split_routing(list: &str, channels: &[String]) -> Vec<String> {
    let mut routing = Vec::new();
    let mut rest = list;
    loop {
        let known = channels
            .iter()
            .filter_map(|c| {
                let tail = rest.strip_prefix(c.as_str())?;
                (tail.is_empty() || tail.starts_with(',')).then_some((c, tail))
            })
            .max_by_key(|(c, _)| c.len());
        let (name, tail) = match known {
            Some((c, tail)) => (c.clone(), tail),
            None => match rest.split_once(',') {
                Some((head, _)) => (head.to_string(), rest.get(head.len()..).unwrap_or_default()),
                None => (rest.to_string(), ""),
            },
        };
        routing.push(name);
        match tail.strip_prefix(',') {
            Some(next) => rest = next,
            None => return routing,
        }
    }
}

/// `[1, "Sent", "<timetoken>"]` on success, `[0, "<reason>"]` on refusal.
fn parse_publish_response(body: Value) -> Result<PublishAck, Error> {
    let Value::Array(parts) = body else {
        return Err(malformed("publish"));
    };
    let mut parts = parts.iter();
    let status = parts.next().and_then(Value::as_i64);
    let info = parts
        .next()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match status {
        Some(1) => {
            let timetoken = parts
                .next()
                .and_then(parse_timetoken)
                .ok_or_else(|| malformed("publish"))?;
            Ok(PublishAck { timetoken, info })
        }
        Some(_) => Err(Error::Server {
            status: 200,
            message: if info.is_empty() {
                "publish refused".into()
            } else {
                info
            },
        }),
        None => Err(malformed("publish")),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn subscribe(&self, request: PollRequest) -> Result<PollBatch, Error> {
        let u = self.subscribe_url(&request);
        let body = self.get_json(u, self.poll_timeout).await?;
        parse_poll_response(body, &request.channels)
    }

    async fn publish(&self, request: PublishRequest) -> Result<PublishAck, Error> {
        if self.publish_key.is_empty() {
            return Err(Error::Configuration("publish key is required".into()));
        }
        let signature = sign_publish(
            &self.publish_key,
            &self.subscribe_key,
            &self.secret_key,
            &request.channel,
            &request.payload,
        )?;
        let u = self.endpoint(&[
            "publish",
            &encode_segment(&self.publish_key),
            &encode_segment(&self.subscribe_key),
            &signature,
            &encode_segment(&request.channel),
            "0",
            &encode_segment(&request.payload),
        ]);
        let body = self.get_json(u, self.request_timeout).await?;
        parse_publish_response(body)
    }

    async fn history(&self, channel: &str, limit: u32) -> Result<Vec<Value>, Error> {
        let limit = limit.to_string();
        let u = self.endpoint(&[
            "history",
            &encode_segment(&self.subscribe_key),
            &encode_segment(channel),
            "0",
            &limit,
        ]);
        match self.get_json(u, self.request_timeout).await? {
            Value::Array(items) => Ok(items),
            _ => Err(malformed("history")),
        }
    }

    async fn time(&self) -> Result<Timetoken, Error> {
        let u = self.endpoint(&["time", "0"]);
        let body = self.get_json(u, self.request_timeout).await?;
        body.as_array()
            .and_then(|parts| parts.first())
            .and_then(parse_timetoken)
            .ok_or_else(|| malformed("time"))
    }
}
