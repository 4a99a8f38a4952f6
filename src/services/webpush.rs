//! WebPush subscriptions and delivery.
//!
//! Endpoints must be HTTPS and must not resolve to loopback or private
//! address space. DNS resolution and the HTTP POST both leave the
//! protocol boundary, so they run on spawned tasks and report back to
//! the engine as events; the POST retries with bounded exponential
//! backoff.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::Event;
use crate::state::ConnId;

/// DNS lookup deadline during endpoint validation.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// POST attempts before giving up.
const DELIVERY_ATTEMPTS: u32 = 3;

/// One push subscription, as persisted in the KV store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// HTTPS push endpoint.
    pub endpoint: String,
    /// Client public key (`p256dh`).
    pub p256dh: String,
    /// Client auth secret.
    pub auth: String,
}

/// Stable hash of an endpoint, used in the KV key.
pub fn endpoint_hash(endpoint: &str) -> String {
    let digest = Sha256::digest(endpoint.as_bytes());
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Address ranges a push endpoint may never resolve to.
fn forbidden_ranges() -> Vec<IpNet> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "100.64.0.0/10",
        "0.0.0.0/8",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
        "::/128",
    ]
    .iter()
    .filter_map(|s| s.parse().ok())
    .collect()
}

fn addr_is_public(addr: IpAddr) -> bool {
    !forbidden_ranges().iter().any(|net| net.contains(&addr))
}

/// Validate an endpoint: HTTPS scheme, and every resolved address
/// public.
pub async fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let url = reqwest::Url::parse(endpoint).map_err(|e| format!("invalid URL: {e}"))?;
    if url.scheme() != "https" {
        return Err("endpoint must be https".to_owned());
    }
    let Some(host) = url.host_str() else {
        return Err("endpoint has no host".to_owned());
    };

    if let Ok(literal) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if !addr_is_public(literal) {
            return Err("endpoint resolves to a private address".to_owned());
        }
        return Ok(());
    }

    let resolver = TokioResolver::builder_tokio()
        .map(|b| b.build())
        .unwrap_or_else(|_| {
            TokioResolver::builder_with_config(
                ResolverConfig::default(),
                TokioConnectionProvider::default(),
            )
            .build()
        });

    let lookup = resolver.lookup_ip(host);
    let response = tokio::time::timeout(RESOLVE_TIMEOUT, lookup)
        .await
        .map_err(|_| "endpoint resolution timed out".to_owned())?
        .map_err(|e| format!("endpoint does not resolve: {e}"))?;

    let mut any = false;
    for addr in response.iter() {
        any = true;
        if !addr_is_public(addr) {
            return Err("endpoint resolves to a private address".to_owned());
        }
    }
    if !any {
        return Err("endpoint does not resolve".to_owned());
    }
    Ok(())
}

/// Validate off the engine task, reporting the outcome as an event.
pub fn spawn_validation(
    events: mpsc::Sender<Event>,
    conn: ConnId,
    endpoint: String,
    p256dh: String,
    auth: String,
) {
    tokio::spawn(async move {
        let result = validate_endpoint(&endpoint).await;
        let _ = events
            .send(Event::WebPushValidated {
                conn,
                subscription: Subscription {
                    endpoint,
                    p256dh,
                    auth,
                },
                result,
            })
            .await;
    });
}

/// Deliver one push message with bounded exponential backoff.
pub fn spawn_delivery(
    events: mpsc::Sender<Event>,
    account: String,
    subscription: Subscription,
    payload: String,
) {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut delay = Duration::from_secs(1);
        let mut result: Result<u16, String> = Err("not attempted".to_owned());
        for attempt in 1..=DELIVERY_ATTEMPTS {
            let response = client
                .post(&subscription.endpoint)
                .header("TTL", "86400")
                .header("Content-Encoding", "aes128gcm")
                .body(payload.clone())
                .timeout(Duration::from_secs(10))
                .send()
                .await;
            match response {
                Ok(r) => {
                    let status = r.status().as_u16();
                    result = Ok(status);
                    // Gone subscriptions and client errors do not retry.
                    if r.status().is_success() || r.status().is_client_error() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(attempt, error = %e, "webpush POST failed");
                    result = Err(e.to_string());
                }
            }
            if attempt < DELIVERY_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        if let Err(e) = &result {
            warn!(endpoint = %subscription.endpoint, error = %e, "webpush delivery gave up");
        }
        let _ = events
            .send(Event::WebPushDelivered {
                account,
                endpoint: subscription.endpoint,
                result,
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_hash_is_stable_and_short() {
        let a = endpoint_hash("https://push.example/sub/1");
        let b = endpoint_hash("https://push.example/sub/1");
        let c = endpoint_hash("https://push.example/sub/2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn private_addresses_are_rejected() {
        for bad in ["127.0.0.1", "10.1.2.3", "192.168.1.1", "172.20.0.1", "::1", "fe80::1"] {
            let addr: IpAddr = bad.parse().unwrap();
            assert!(!addr_is_public(addr), "{bad}");
        }
        let good: IpAddr = "93.184.216.34".parse().unwrap();
        assert!(addr_is_public(good));
    }

    #[tokio::test]
    async fn http_scheme_is_rejected() {
        let err = validate_endpoint("http://push.example/x").await.unwrap_err();
        assert!(err.contains("https"));
    }

    #[tokio::test]
    async fn literal_loopback_is_rejected() {
        let err = validate_endpoint("https://127.0.0.1/x").await.unwrap_err();
        assert!(err.contains("private"));
    }
}
