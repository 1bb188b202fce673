//! Identities of rule instances and the messages they drive.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{fields, COUNTER_NAMESPACE};

/// Namespace for deriving message references.
const MESSAGE_REF_NAMESPACE: Uuid = Uuid::from_u128(0x7a1c_5e0b_93d4_4f0e_8b2a_c61f_0d3e_9a47);

/// Kind of a rule, e.g. `cycle`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleKind(pub String);

impl RuleKind {
    /// The cycle accumulator rule.
    pub fn cycle() -> Self {
        Self("cycle".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuleKind {
    fn default() -> Self {
        Self::cycle()
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of one rule instance: a rule kind bound to one target signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub kind: RuleKind,
    pub target: String,
}

impl InstanceKey {
    pub fn new(kind: impl Into<RuleKind>, target: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
        }
    }

    /// Key of the persisted counter record inside [`COUNTER_NAMESPACE`].
    pub fn storage_key(&self) -> String {
        format!("{}.{}", self.kind, self.target)
    }

    /// Externally observable id of one persisted field.
    pub fn field_id(&self, field: &str) -> String {
        format!("{}.{}.{}.{}", COUNTER_NAMESPACE, self.kind, self.target, field)
    }

    /// Id of the `subCounter` mirror, the field external resets are written to.
    pub fn mirror_id(&self) -> String {
        self.field_id(fields::SUB_COUNTER)
    }

    /// Reference of the message this instance drives.
    pub fn message_ref(&self) -> MessageRef {
        MessageRef::for_instance(self)
    }

    /// Parse a key from its storage form (`<kind>.<target>`).
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (kind, target) = key.split_once('.')?;
        if kind.is_empty() || target.is_empty() {
            return None;
        }
        Some(Self::new(kind, target))
    }
}

impl From<String> for RuleKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.target)
    }
}

/// Opaque reference of a message in the external lifecycle store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageRef(pub Uuid);

impl MessageRef {
    /// Derive the reference deterministically from `(kind, target)`.
    pub fn for_instance(key: &InstanceKey) -> Self {
        let name = format!("{}/{}", key.kind, key.target);
        Self(Uuid::new_v5(&MESSAGE_REF_NAMESPACE, name.as_bytes()))
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ref_is_deterministic() {
        let a = InstanceKey::new("cycle", "washer.0.energy");
        let b = InstanceKey::new("cycle", "washer.0.energy");
        let c = InstanceKey::new("cycle", "dryer.0.energy");

        assert_eq!(a.message_ref(), b.message_ref());
        assert_ne!(a.message_ref(), c.message_ref());
    }

    #[test]
    fn test_mirror_id() {
        let key = InstanceKey::new("cycle", "washer.0.energy");
        assert_eq!(
            key.mirror_id(),
            "tally.counters.cycle.washer.0.energy.subCounter"
        );
    }

    #[test]
    fn test_storage_key_roundtrip() {
        let key = InstanceKey::new("cycle", "washer.0.energy");
        assert_eq!(key.storage_key(), "cycle.washer.0.energy");
        assert_eq!(InstanceKey::from_storage_key(&key.storage_key()), Some(key));
        assert_eq!(InstanceKey::from_storage_key("nodot"), None);
    }

    #[test]
    fn test_message_ref_parse() {
        let key = InstanceKey::new("cycle", "pump");
        let parsed = MessageRef::from_string(&key.message_ref().to_string()).unwrap();
        assert_eq!(parsed, key.message_ref());
    }
}
