//! Client Identity
//!
//! The IKEv2 tunnel authenticates with a client certificate issued by
//! the account service. The controller only checks that the identity is
//! usable; a failure here is the fatal auth case that grounds the tunnel.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated client identity (local identifier + PKCS#12 certificate)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// IKEv2 local identifier (the account's client id)
    local_identifier: String,
    /// Certificate payload, base64 on the wire
    #[serde(with = "base64_bytes")]
    certificate: Vec<u8>,
}

impl ClientIdentity {
    /// Create from raw certificate bytes
    pub fn new(local_identifier: impl Into<String>, certificate: Vec<u8>) -> Result<Self, IdentityError> {
        let local_identifier = local_identifier.into();
        if local_identifier.trim().is_empty() {
            return Err(IdentityError::MissingIdentifier);
        }
        if certificate.is_empty() {
            return Err(IdentityError::MissingCertificate);
        }
        Ok(Self {
            local_identifier,
            certificate,
        })
    }

    /// Create from a base64-encoded certificate, as handed over by the auth client
    pub fn from_base64(local_identifier: impl Into<String>, certificate: &str) -> Result<Self, IdentityError> {
        let bytes = BASE64.decode(certificate.trim())
            .map_err(|_| IdentityError::InvalidBase64)?;
        Self::new(local_identifier, bytes)
    }

    /// IKEv2 local identifier
    pub fn local_identifier(&self) -> &str {
        &self.local_identifier
    }

    /// Raw certificate bytes
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Encode certificate as base64
    pub fn certificate_base64(&self) -> String {
        BASE64.encode(&self.certificate)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientIdentity({}, {} byte certificate)",
            self.local_identifier,
            self.certificate.len()
        )
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Identity errors (fatal: require re-authentication)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Client identifier missing")]
    MissingIdentifier,

    #[error("Client certificate missing")]
    MissingCertificate,

    #[error("Client certificate is not valid base64")]
    InvalidBase64,
}
