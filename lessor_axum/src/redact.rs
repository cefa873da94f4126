//! Keeping the auto-auth token out of responses
//!
//! Callers borrowing the auto-auth token may look it up or renew it, but the
//! response must not hand them the token itself or its accessor.

use bytes::Bytes;
use lessor_cache::SendRequest;
use serde_json::Value;

use crate::AutoAuthToken;

const LOOKUP_SELF: &str = "/v1/auth/token/lookup-self";
const RENEW_SELF: &str = "/v1/auth/token/renew-self";
const LOOKUP: &str = "/v1/auth/token/lookup";
const RENEW: &str = "/v1/auth/token/renew";

/// Fields removed from each section of the response
const REDACTED: [(&str, &[&str]); 2] = [
    ("data", &["id", "accessor"]),
    ("auth", &["client_token", "accessor"]),
];

fn body_token(body: &[u8]) -> Option<String> {
    let body: Value = serde_json::from_slice(body).ok()?;
    body.get("token")?.as_str().map(str::to_owned)
}

/// Whether the response to `req` would describe the auto-auth token
pub(crate) fn describes_auto_auth_token(req: &SendRequest, auto_auth: &AutoAuthToken) -> bool {
    match req.path.as_str() {
        LOOKUP_SELF | RENEW_SELF => auto_auth.is_current(&req.token),
        LOOKUP | RENEW => body_token(&req.body).map_or(false, |t| auto_auth.is_current(&t)),
        _ => false,
    }
}

/// Strips token identifiers from a JSON response body
///
/// Bodies that are not JSON objects are returned unchanged.
pub(crate) fn redact(body: Bytes) -> Bytes {
    let mut value: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return body,
    };

    for (section, fields) in REDACTED {
        if let Some(section) = value.get_mut(section).and_then(Value::as_object_mut) {
            for field in fields {
                section.remove(*field);
            }
        }
    }

    match serde_json::to_vec(&value) {
        Ok(redacted) => Bytes::from(redacted),
        Err(error) => {
            tracing::warn!(%error, "failed to re-encode redacted response");
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use lessor_tokens::Token;
    use serde_json::json;

    use super::*;

    fn auto_auth() -> AutoAuthToken {
        let holder = AutoAuthToken::new();
        holder.set(Token::from_static("s.auto"));
        holder
    }

    fn request(path: &str, token: &str, body: Value) -> SendRequest {
        let mut req = SendRequest::new(Method::POST, path);
        req.token = token.to_owned();
        req.body = Bytes::from(body.to_string());
        req
    }

    #[test]
    fn self_lookups_with_the_auto_auth_token_are_redacted() {
        let holder = auto_auth();

        assert!(describes_auto_auth_token(&request(LOOKUP_SELF, "s.auto", Value::Null), &holder));
        assert!(describes_auto_auth_token(&request(RENEW_SELF, "s.auto", Value::Null), &holder));
        assert!(!describes_auto_auth_token(&request(LOOKUP_SELF, "s.other", Value::Null), &holder));
    }

    #[test]
    fn lookups_naming_the_auto_auth_token_are_redacted() {
        let holder = auto_auth();

        assert!(describes_auto_auth_token(&request(LOOKUP, "s.other", json!({ "token": "s.auto" })), &holder));
        assert!(describes_auto_auth_token(&request(RENEW, "s.other", json!({ "token": "s.auto" })), &holder));
        assert!(!describes_auto_auth_token(&request(LOOKUP, "s.auto", json!({ "token": "s.other" })), &holder));
        assert!(!describes_auto_auth_token(&request("/v1/secret/foo", "s.auto", Value::Null), &holder));
    }

    #[test]
    fn identifiers_are_removed() {
        let body = json!({
            "data": { "id": "s.auto", "accessor": "acc", "policies": ["default"] },
            "auth": { "client_token": "s.auto", "accessor": "acc", "lease_duration": 60 },
        });

        let redacted: Value = serde_json::from_slice(&redact(Bytes::from(body.to_string()))).unwrap();

        assert_eq!(
            redacted,
            json!({
                "data": { "policies": ["default"] },
                "auth": { "lease_duration": 60 },
            })
        );
    }

    #[test]
    fn non_json_bodies_pass_through() {
        assert_eq!(redact(Bytes::from_static(b"not json")), Bytes::from_static(b"not json"));
    }
}
