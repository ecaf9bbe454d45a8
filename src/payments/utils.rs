use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Copy)]
pub enum HttpAuth<'a> {
    None,
    Bearer(&'a str),
    Basic(&'a str, &'a str),
}

#[derive(Clone, Copy)]
pub enum HttpBody<'a> {
    Empty,
    Json(&'a JsonValue),
    /// `application/x-www-form-urlencoded` pairs.
    Form(&'a [(String, String)]),
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
            max_retries,
        })
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis(250u64 << attempt.min(6))
    }

    /// Send a request and decode a JSON response. 429s, 5xxs and transport
    /// failures are retried up to `max_retries` times, so side-effecting
    /// calls must carry the rail's idempotency header.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: HttpAuth<'_>,
        body: HttpBody<'_>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut attempt = 0;
        loop {
            let outcome = self
                .send_once::<T>(method.clone(), url, auth, body, additional_headers)
                .await;
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !err.is_retryable() {
                return Err(err);
            }

            let wait = match &err {
                PaymentError::RateLimitError {
                    retry_after_seconds: Some(secs),
                    ..
                } => Duration::from_secs(*secs).min(self.timeout),
                _ => Self::backoff(attempt),
            };
            warn!(
                provider = self.provider,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "rail call failed, retrying"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        auth: HttpAuth<'_>,
        body: HttpBody<'_>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let mut request = self.client.request(method, url).timeout(self.timeout);
        request = match auth {
            HttpAuth::None => request,
            HttpAuth::Bearer(token) => request.bearer_auth(token),
            HttpAuth::Basic(user, pass) => request.basic_auth(user, Some(pass)),
        };
        for (name, value) in additional_headers {
            request = request.header(*name, *value);
        }
        request = match body {
            HttpBody::Empty => request,
            HttpBody::Json(payload) => request.json(payload),
            HttpBody::Form(pairs) => request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(form_encode(pairs)),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PaymentError::TimeoutError {
                    timeout_secs: self.timeout.as_secs(),
                }
            } else {
                PaymentError::NetworkError {
                    message: format!("{} unreachable: {}", self.provider, e),
                }
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response.text().await.unwrap_or_default();

        if (200..300).contains(&status) {
            return serde_json::from_str::<T>(&text).map_err(|e| {
                PaymentError::provider(
                    self.provider,
                    format!("unreadable {} response: {}", self.provider, e),
                    false,
                )
            });
        }
        Err(status_error(self.provider, status, text, retry_after))
    }
}

/// Map a non-2xx rail response onto the adapter error taxonomy.
fn status_error(
    provider: &str,
    status: u16,
    body: String,
    retry_after: Option<u64>,
) -> PaymentError {
    match status {
        402 => PaymentError::PaymentDeclinedError {
            message: body,
            provider_code: Some(status.to_string()),
        },
        429 => PaymentError::RateLimitError {
            message: format!("{} throttled the request", provider),
            retry_after_seconds: retry_after,
        },
        _ => PaymentError::ProviderError {
            provider: provider.to_string(),
            message: format!("HTTP {}: {}", status, body),
            provider_code: Some(status.to_string()),
            retryable: status >= 500,
        },
    }
}

/// Percent-encode form pairs, leaving only RFC 3986 unreserved bytes as-is.
pub fn form_encode(pairs: &[(String, String)]) -> String {
    fn encode(value: &str, out: &mut String) {
        for byte in value.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                _ => out.push_str(&format!("%{:02X}", byte)),
            }
        }
    }

    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        encode(key, &mut out);
        out.push('=');
        encode(value, &mut out);
    }
    out
}

pub fn hmac_sha256_hex(payload: &[u8], secret: &str) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn hmac_sha512_hex(payload: &[u8], secret: &str) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_hmac_sha512_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    match hmac_sha512_hex(payload, secret) {
        Some(computed) => secure_eq(computed.as_bytes(), signature.trim().as_bytes()),
        None => false,
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Header value as `&str`, if present and valid UTF-8.
pub fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Minor units rendered as a major-unit decimal, e.g. `12345` with exponent 2
/// becomes `123.45`. Used for rails that quote amounts in major units.
pub fn minor_to_major(amount_minor: i64, exponent: u32) -> Decimal {
    Decimal::new(amount_minor, exponent)
}

/// Major-unit amount reported by a rail converted back to minor units,
/// flooring any precision beyond the currency's exponent.
pub fn major_to_minor(amount: Decimal, exponent: u32) -> Option<i64> {
    let scaled = amount.checked_mul(Decimal::from(10_i64.checked_pow(exponent)?))?;
    scaled.floor().to_i64()
}

/// Parse a JSON amount that a rail may send as a number or a string.
pub fn json_major_amount(value: &JsonValue) -> Option<Decimal> {
    match value {
        JsonValue::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        JsonValue::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn webhook_hmac_verification_detects_invalid_signature() {
        let payload = br#"{"event":"charge.success"}"#;
        assert!(!verify_hmac_sha512_hex(payload, "secret", "not-a-valid-signature"));

        let valid = hmac_sha512_hex(payload, "secret").unwrap();
        assert!(verify_hmac_sha512_hex(payload, "secret", &valid));
    }

    #[test]
    fn hmac_sha256_matches_known_vector() {
        // RFC 4231 test case 2
        let digest = hmac_sha256_hex(b"what do ya want for nothing?", "Jefe").unwrap();
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn major_minor_conversions_floor_excess_precision() {
        assert_eq!(minor_to_major(12345, 2).to_string(), "123.45");
        assert_eq!(minor_to_major(100, 2).to_string(), "1.00");
        assert_eq!(minor_to_major(1500, 0).to_string(), "1500");
        assert_eq!(major_to_minor(Decimal::new(123456, 3), 2), Some(12345));
        assert_eq!(
            json_major_amount(&serde_json::json!(1500.5)).and_then(|d| major_to_minor(d, 2)),
            Some(150050)
        );
        assert_eq!(
            json_major_amount(&serde_json::json!("20.00")).and_then(|d| major_to_minor(d, 2)),
            Some(2000)
        );
    }

    #[test]
    fn rail_status_codes_map_onto_the_error_taxonomy() {
        let declined = status_error("stripe", 402, "card_declined".to_string(), None);
        assert!(matches!(declined, PaymentError::PaymentDeclinedError { .. }));
        assert!(!declined.is_retryable());

        match status_error("paystack", 429, String::new(), Some(7)) {
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => assert_eq!(retry_after_seconds, Some(7)),
            other => panic!("unexpected {:?}", other),
        }

        assert!(status_error("paypal", 503, String::new(), None).is_retryable());
        assert!(!status_error("paypal", 400, String::new(), None).is_retryable());
    }

    #[test]
    fn form_encoding_escapes_reserved_characters() {
        let pairs = vec![
            ("amount".to_string(), "1000".to_string()),
            ("metadata[vendor_id]".to_string(), "hotel & co".to_string()),
        ];
        assert_eq!(
            form_encode(&pairs),
            "amount=1000&metadata%5Bvendor_id%5D=hotel%20%26%20co"
        );
    }
}
