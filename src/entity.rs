//! The minimal entity shape the sync layer needs: a type tag and an id.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Remote collection an entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
  Goal,
  Event,
  Note,
  Achievement,
  Review,
  Preference,
  Intention,
  /// Tag written by a newer client; kept verbatim so it survives a reload.
  Other(String),
}

impl EntityType {
  pub fn as_str(&self) -> &str {
    match self {
      EntityType::Goal => "goal",
      EntityType::Event => "event",
      EntityType::Note => "note",
      EntityType::Achievement => "achievement",
      EntityType::Review => "review",
      EntityType::Preference => "preference",
      EntityType::Intention => "intention",
      EntityType::Other(tag) => tag,
    }
  }
}

impl FromStr for EntityType {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "goal" => EntityType::Goal,
      "event" => EntityType::Event,
      "note" => EntityType::Note,
      "achievement" => EntityType::Achievement,
      "review" => EntityType::Review,
      "preference" => EntityType::Preference,
      "intention" => EntityType::Intention,
      other => EntityType::Other(other.to_string()),
    })
  }
}

impl From<&str> for EntityType {
  fn from(s: &str) -> Self {
    match s.parse() {
      Ok(t) => t,
      Err(never) => match never {},
    }
  }
}

impl fmt::Display for EntityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for EntityType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for EntityType {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let tag = String::deserialize(deserializer)?;
    Ok(EntityType::from(tag.as_str()))
  }
}

/// Identity of one entity across the sync layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
  pub entity_type: EntityType,
  pub id: String,
}

impl EntityKey {
  pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
    Self {
      entity_type,
      id: id.into(),
    }
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.entity_type, self.id)
  }
}
