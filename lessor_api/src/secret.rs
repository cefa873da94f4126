use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A response from the upstream service
///
/// Only the fields the proxy inspects are modelled. Anything else in a
/// response is preserved byte-for-byte by the proxy, which never re-encodes
/// a response it returns to a caller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Secret {
    /// Identifier assigned to the request by the upstream
    #[serde(default)]
    pub request_id: String,
    /// Identifier of the lease attached to this secret, if any
    #[serde(default)]
    pub lease_id: String,
    /// Lease duration in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the lease may be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Arbitrary secret payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    /// Warnings attached by the upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    /// Token information, present on login and token creation responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SecretAuth>,
    /// Wrapping information, present when the response was wrapped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrap_info: Option<WrapInfo>,
    /// The type of mount that served the response
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_type: String,
}

/// Token information carried in a [`Secret`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SecretAuth {
    /// The issued token
    #[serde(default)]
    pub client_token: String,
    /// The accessor of the issued token
    #[serde(default)]
    pub accessor: String,
    /// Policies attached to the token
    #[serde(default)]
    pub policies: Vec<String>,
    /// Token lifetime in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the token may be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Whether the token was created without a parent
    #[serde(default)]
    pub orphan: bool,
    /// Entity the token is bound to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entity_id: String,
}

/// Response-wrapping information carried in a [`Secret`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct WrapInfo {
    /// Single-use token that unwraps the response
    #[serde(default)]
    pub token: String,
    /// Accessor of the wrapping token
    #[serde(default)]
    pub accessor: String,
    /// Lifetime of the wrapping token in seconds
    #[serde(default)]
    pub ttl: u64,
    /// Time the wrapping token was created
    #[serde(default)]
    pub creation_time: String,
    /// Path of the request that was wrapped
    #[serde(default)]
    pub creation_path: String,
}

impl Secret {
    /// Parses a response body
    ///
    /// An empty body, or a body of JSON `null`, yields `None`.
    pub fn parse(body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(body)
    }

    /// The token described by this secret
    ///
    /// Login responses carry it in `auth`, token lookups in `data.id`.
    pub fn token_id(&self) -> Option<&str> {
        if let Some(auth) = &self.auth {
            if !auth.client_token.is_empty() {
                return Some(&auth.client_token);
            }
        }

        self.data_str("id")
    }

    /// The accessor of the token described by this secret
    pub fn token_accessor(&self) -> Option<&str> {
        if let Some(auth) = &self.auth {
            if !auth.accessor.is_empty() {
                return Some(&auth.accessor);
            }
        }

        self.data_str("accessor")
    }

    /// Whether the token described by this secret may be renewed
    pub fn token_is_renewable(&self) -> bool {
        if let Some(auth) = &self.auth {
            return auth.renewable;
        }

        self.data
            .as_ref()
            .and_then(|d| d.get("renewable"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Remaining lifetime of the token described by this secret, in seconds
    pub fn token_ttl(&self) -> u64 {
        if let Some(auth) = &self.auth {
            return auth.lease_duration;
        }

        self.data
            .as_ref()
            .and_then(|d| d.get("ttl"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}
