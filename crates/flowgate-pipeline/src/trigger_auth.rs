use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::flow::TriggerAuth;

type HmacSha256 = Hmac<Sha256>;

/// Check an externally triggered request against the flow's auth mode.
///
/// Header names are matched case-insensitively. Secrets are compared in
/// constant time.
pub fn verify(auth: &TriggerAuth, headers: &HashMap<String, String>, body: &[u8]) -> Result<()> {
    match auth {
        TriggerAuth::None => Ok(()),
        TriggerAuth::Bearer { token } => {
            let value = header(headers, "authorization")
                .ok_or_else(|| unauthorized("missing Authorization header"))?;
            let presented = value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
                .ok_or_else(|| unauthorized("Authorization is not a bearer token"))?;
            check(presented.trim().as_bytes(), token.as_bytes(), "bearer token mismatch")
        }
        TriggerAuth::ApiKey { header: name, key } => {
            let presented = header(headers, name)
                .ok_or_else(|| unauthorized(&format!("missing {} header", name)))?;
            check(presented.trim().as_bytes(), key.as_bytes(), "api key mismatch")
        }
        TriggerAuth::HmacSha256 { secret, header: name } => {
            let presented = header(headers, name)
                .ok_or_else(|| unauthorized(&format!("missing {} header", name)))?;
            let presented = presented.trim();
            let presented = presented.strip_prefix("sha256=").unwrap_or(presented);
            let expected = sign(secret, body);
            check(
                presented.to_ascii_lowercase().as_bytes(),
                expected.as_bytes(),
                "signature mismatch",
            )
        }
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn check(presented: &[u8], expected: &[u8], reason: &str) -> Result<()> {
    if expected.is_empty() || !bool::from(presented.ct_eq(expected)) {
        return Err(unauthorized(reason));
    }
    Ok(())
}

fn unauthorized(reason: &str) -> FlowgateError {
    FlowgateError::Unauthorized(reason.to_string())
}
