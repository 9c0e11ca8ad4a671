use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Number of components in a face descriptor.
pub const DESCRIPTOR_LEN: usize = 128;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor must have {DESCRIPTOR_LEN} components, got {0}")]
    WrongLength(usize),
    #[error("descriptor component {index} is not finite ({value})")]
    NonFinite { index: usize, value: f32 },
}

/// Face descriptor: exactly [`DESCRIPTOR_LEN`] finite components.
///
/// Descriptors are immutable once built. Re-enrollment replaces the whole
/// value rather than editing components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(DescriptorError::WrongLength(values.len()));
        }
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index, value });
        }
        Ok(Self(values))
    }

    /// Build from double-precision input (D-Bus `ad`, JSON numbers).
    pub fn from_f64(values: &[f64]) -> Result<Self, DescriptorError> {
        Self::new(values.iter().map(|&v| v as f32).collect())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.0.iter().map(|&v| f64::from(v)).collect()
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0
    }
}

/// A stored descriptor for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Embedding {
    pub identity_id: String,
    pub descriptor: Descriptor,
    pub updated_at: Timestamp,
}

/// Account metadata and enrollment state for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRecord {
    pub identity_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub enrolled: bool,
    pub updated_at: Timestamp,
}

impl RegistryRecord {
    /// Fresh record for an identity seen for the first time.
    pub fn new(identity_id: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            identity_id: identity_id.into(),
            email: None,
            display_name: None,
            photo_url: None,
            enrolled: false,
            updated_at,
        }
    }

    /// Overlay the fields present in `patch`. Does not touch `updated_at`.
    pub fn apply(&mut self, patch: &RegistryPatch) {
        if let Some(email) = &patch.email {
            self.email = email.clone();
        }
        if let Some(name) = &patch.display_name {
            self.display_name = name.clone();
        }
        if let Some(photo) = &patch.photo_url {
            self.photo_url = photo.clone();
        }
        if let Some(enrolled) = patch.enrolled {
            self.enrolled = enrolled;
        }
    }
}

/// Partial registry record keyed by identity.
///
/// Each optional field has three states: absent (keep the stored value),
/// `Some(None)` (clear it), or `Some(Some(v))` (set it). In JSON an omitted
/// key means absent and `null` means clear.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPatch {
    pub identity_id: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub email: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Option<String>>,
    #[serde(
        default,
        rename = "photoURL",
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub photo_url: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled: Option<bool>,
    /// Explicit freshness stamp. When absent the store stamps the write itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl RegistryPatch {
    pub fn new(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            ..Default::default()
        }
    }

    pub fn email(mut self, email: Option<String>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn display_name(mut self, name: Option<String>) -> Self {
        self.display_name = Some(name);
        self
    }

    pub fn photo_url(mut self, url: Option<String>) -> Self {
        self.photo_url = Some(url);
        self
    }

    pub fn enrolled(mut self, enrolled: bool) -> Self {
        self.enrolled = Some(enrolled);
        self
    }

    pub fn updated_at(mut self, at: Timestamp) -> Self {
        self.updated_at = Some(at);
        self
    }
}

/// Maps a present JSON key (including `null`) to `Some(..)`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Single-slot session written after an offline biometric match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSession {
    pub identity_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "now_millis")]
    pub created_at: Timestamp,
}

impl OfflineSession {
    /// Session for `identity_id`, stamped now.
    pub fn new(
        identity_id: impl Into<String>,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            identity_id: identity_id.into(),
            email,
            display_name,
            created_at: now_millis(),
        }
    }
}

/// Verified account handle delivered by the identity provider on sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedAccount {
    pub identity_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_rejects_wrong_length() {
        let err = Descriptor::new(vec![0.0; 127]).unwrap_err();
        assert_eq!(err, DescriptorError::WrongLength(127));
    }

    #[test]
    fn test_descriptor_rejects_nan() {
        let mut values = vec![0.0; DESCRIPTOR_LEN];
        values[7] = f32::NAN;
        match Descriptor::new(values) {
            Err(DescriptorError::NonFinite { index, .. }) => assert_eq!(index, 7),
            other => panic!("expected NonFinite, got {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_json_is_plain_array() {
        let d = Descriptor::new(vec![0.5; DESCRIPTOR_LEN]).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.starts_with("[0.5,"));

        let short = serde_json::from_str::<Descriptor>("[1.0, 2.0]");
        assert!(short.is_err());
    }

    #[test]
    fn test_registry_record_wire_names() {
        let record = RegistryRecord {
            photo_url: Some("https://example.com/a.png".into()),
            ..RegistryRecord::new("u1", 42)
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["identityId"], "u1");
        assert_eq!(value["photoURL"], "https://example.com/a.png");
        assert_eq!(value["updatedAt"], 42);
        assert_eq!(value["enrolled"], false);
    }

    #[test]
    fn test_session_without_created_at_is_stamped() {
        let before = now_millis();
        let session: OfflineSession = serde_json::from_str(r#"{"identityId":"u1"}"#).unwrap();
        assert!(session.created_at >= before);
        assert_eq!(session.email, None);
    }

    #[test]
    fn test_patch_distinguishes_absent_from_null() {
        let patch: RegistryPatch =
            serde_json::from_str(r#"{"identityId":"u1","email":null,"displayName":"Ada"}"#)
                .unwrap();
        assert_eq!(patch.email, Some(None));
        assert_eq!(patch.display_name, Some(Some("Ada".into())));
        assert_eq!(patch.photo_url, None);

        let mut record = RegistryRecord {
            email: Some("old@example.com".into()),
            photo_url: Some("keep".into()),
            ..RegistryRecord::new("u1", 1)
        };
        record.apply(&patch);
        assert_eq!(record.email, None);
        assert_eq!(record.display_name.as_deref(), Some("Ada"));
        assert_eq!(record.photo_url.as_deref(), Some("keep"));
    }
}
