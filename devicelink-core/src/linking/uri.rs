//! Provisioning URI shown to the primary device.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use url::Url;

use crate::crypto::PublicIdentityKey;
use crate::{LinkError, Result};

pub const SCHEME: &str = "tsdevice";

/// `tsdevice:/?uuid=<handle>&pub_key=<unpadded base64 key>`, form encoded.
pub fn provisioning_uri(handle: &str, public_key: &PublicIdentityKey) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("uuid", handle)
        .append_pair("pub_key", &STANDARD_NO_PAD.encode(public_key.as_bytes()))
        .finish();
    format!("{}:/?{}", SCHEME, query)
}

/// Decoded contents of a provisioning URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningUri {
    pub handle: String,
    pub public_key: PublicIdentityKey,
}

impl ProvisioningUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)
            .map_err(|e| LinkError::InvalidInput(format!("provisioning uri: {}", e)))?;
        if url.scheme() != SCHEME {
            return Err(LinkError::InvalidInput(format!(
                "unexpected scheme '{}'",
                url.scheme()
            )));
        }

        let mut handle = None;
        let mut key = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "uuid" => handle = Some(value.into_owned()),
                "pub_key" => key = Some(value.into_owned()),
                _ => {}
            }
        }

        let handle = handle
            .filter(|h| !h.is_empty())
            .ok_or_else(|| LinkError::InvalidInput("provisioning uri without uuid".to_string()))?;
        let key = key
            .ok_or_else(|| LinkError::InvalidInput("provisioning uri without pub_key".to_string()))?;
        let key = STANDARD_NO_PAD
            .decode(key)
            .map_err(|e| LinkError::InvalidInput(format!("pub_key: {}", e)))?;

        Ok(Self {
            handle,
            public_key: PublicIdentityKey::from_bytes(&key)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn uri_shape() {
        let key = IdentityKeyPair::generate().unwrap().public_key();
        let uri = provisioning_uri("a1b2/c3+d4", &key);
        assert!(uri.starts_with("tsdevice:/?uuid=a1b2%2Fc3%2Bd4&pub_key="));
        let pub_key = uri.split("pub_key=").nth(1).unwrap();
        // 32 bytes unpadded is 43 base64 characters; '+' and '/' get escaped.
        assert!(!pub_key.contains("%3D"));
        assert!(!pub_key.contains('/') && !pub_key.contains('+'));
    }

    #[test]
    fn parse_recovers_handle_and_key() {
        let key = IdentityKeyPair::generate().unwrap().public_key();
        let parsed = ProvisioningUri::parse(&provisioning_uri("handle-123", &key)).unwrap();
        assert_eq!(parsed.handle, "handle-123");
        assert_eq!(parsed.public_key, key);
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        assert!(matches!(
            ProvisioningUri::parse("https://example.org/?uuid=a&pub_key=b"),
            Err(LinkError::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(ProvisioningUri::parse("tsdevice:/?uuid=abc").is_err());
    }
}
