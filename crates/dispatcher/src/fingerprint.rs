use std::{
    borrow::Borrow,
    fmt,
};

use errors::ErrorMetadata;
use sha1::{
    Digest,
    Sha1,
};

/// Content address of an invocation, used as the key of the result cache,
/// the fingerprint-keyed placement cache and the batch probe.
///
/// Normally the lowercase hex SHA-1 of `function_name || body`. In
/// file-caching mode the body already names a cached artifact and is used
/// verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn digest(function_name: &str, body: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(function_name.as_bytes());
        hasher.update(body);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn raw(body: &[u8]) -> anyhow::Result<Self> {
        let s = std::str::from_utf8(body).map_err(|e| {
            anyhow::anyhow!(ErrorMetadata::bad_request(
                "InvalidContentIdentifier",
                format!("Request body must be a UTF-8 content identifier in file caching mode: {e}"),
            ))
        })?;
        Ok(Self(s.to_owned()))
    }

    pub fn compute(function_name: &str, body: &[u8], file_caching_mode: bool) -> anyhow::Result<Self> {
        if file_caching_mode {
            Self::raw(body)
        } else {
            Ok(Self::digest(function_name, body))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Fingerprint {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use proptest::prelude::*;

    use super::Fingerprint;

    #[test]
    fn test_known_digest() {
        let fingerprint = Fingerprint::digest("echo", b"hi");
        assert_eq!(fingerprint.as_str().len(), 40);
        assert_eq!(fingerprint, Fingerprint::digest("echoh", b"i"));
        assert_eq!(
            Fingerprint::digest("", b"").as_str(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert!(fingerprint
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_empty_body_hashes_function_name() {
        assert_eq!(
            Fingerprint::digest("echo", b""),
            Fingerprint::digest("", b"echo")
        );
        assert_ne!(Fingerprint::digest("echo", b""), Fingerprint::digest("cat", b""));
    }

    #[test]
    fn test_file_caching_uses_raw_body() -> anyhow::Result<()> {
        let fingerprint = Fingerprint::compute("resize", b"blob-1234", true)?;
        assert_eq!(fingerprint.as_str(), "blob-1234");
        let err = Fingerprint::compute("resize", &[0xff, 0xfe], true).unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.short_msg(), "InvalidContentIdentifier");
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_digest_is_deterministic(name in ".{0,16}", body in prop::collection::vec(any::<u8>(), 0..256)) {
            let a = Fingerprint::digest(&name, &body);
            let b = Fingerprint::digest(&name, &body);
            prop_assert_eq!(a.as_str().len(), 40);
            prop_assert_eq!(a, b);
        }
    }
}
