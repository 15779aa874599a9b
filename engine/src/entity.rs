//! Entity types synchronized by the engine.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A named collection of entities synchronized as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketName {
    Note,
    Tag,
    Preferences,
}

impl BucketName {
    /// Every bucket, in subscription order.
    pub const ALL: [BucketName; 3] = [BucketName::Note, BucketName::Tag, BucketName::Preferences];

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketName::Note => "note",
            BucketName::Tag => "tag",
            BucketName::Preferences => "preferences",
        }
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags stored in a note's system tag list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemTag {
    Pinned,
    Markdown,
    Published,
    Shared,
}

/// A note.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Note {
    /// Note body
    pub content: String,
    /// Tag names, in insertion order, without case-insensitive duplicates
    pub tags: Vec<String>,
    /// Flags such as pinned or markdown
    pub system_tags: Vec<SystemTag>,
    /// Seconds since epoch
    pub creation_date: f64,
    /// Seconds since epoch
    pub modification_date: f64,
    /// In the trash
    pub deleted: bool,
    #[serde(rename = "shareURL")]
    pub share_url: String,
    #[serde(rename = "publishURL")]
    pub publish_url: String,
}

impl Note {
    /// Create an empty note stamped with `now` (seconds since epoch).
    pub fn new(now: f64) -> Self {
        Self {
            creation_date: now,
            modification_date: now,
            ..Self::default()
        }
    }

    pub fn has_system_tag(&self, tag: SystemTag) -> bool {
        self.system_tags.contains(&tag)
    }

    /// Add or remove a system tag. Returns whether the note changed.
    pub fn set_system_tag(&mut self, tag: SystemTag, enabled: bool) -> bool {
        if self.has_system_tag(tag) == enabled {
            return false;
        }
        if enabled {
            self.system_tags.push(tag);
        } else {
            self.system_tags.retain(|t| *t != tag);
        }
        true
    }

    /// Case-insensitive tag membership.
    pub fn has_tag(&self, name: &str) -> bool {
        let key = name.to_lowercase();
        self.tags.iter().any(|t| t.to_lowercase() == key)
    }

    /// Append a tag name unless already present. Returns whether the note changed.
    pub fn add_tag(&mut self, name: &str) -> bool {
        if self.has_tag(name) {
            return false;
        }
        self.tags.push(name.to_string());
        true
    }

    /// Remove a tag name, ignoring case. Returns whether the note changed.
    pub fn remove_tag(&mut self, name: &str) -> bool {
        let key = name.to_lowercase();
        let before = self.tags.len();
        self.tags.retain(|t| t.to_lowercase() != key);
        self.tags.len() != before
    }
}

/// Partial note fields carried by edit and create intents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_tags: Option<Vec<SystemTag>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification_date: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(rename = "shareURL", skip_serializing_if = "Option::is_none")]
    pub share_url: Option<String>,
    #[serde(rename = "publishURL", skip_serializing_if = "Option::is_none")]
    pub publish_url: Option<String>,
}

impl NotePatch {
    /// Patch that only replaces the content.
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Overwrite every field present in the patch.
    pub fn apply_to(&self, note: &mut Note) {
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(tags) = &self.tags {
            note.tags.clear();
            for tag in tags {
                note.add_tag(tag);
            }
        }
        if let Some(system_tags) = &self.system_tags {
            note.system_tags = system_tags.clone();
        }
        if let Some(date) = self.creation_date {
            note.creation_date = date;
        }
        if let Some(date) = self.modification_date {
            note.modification_date = date;
        }
        if let Some(deleted) = self.deleted {
            note.deleted = deleted;
        }
        if let Some(url) = &self.share_url {
            note.share_url = url.clone();
        }
        if let Some(url) = &self.publish_url {
            note.publish_url = url.clone();
        }
    }
}

/// A tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Display name; unique across tags ignoring case
    pub name: String,
    /// Position in the user's custom tag ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl Tag {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }
}

/// Account-wide preferences. Unknown fields are kept verbatim.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics_enabled: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Preferences {
    /// Merge a JSON object of preference fields into this entity.
    pub fn merge(&mut self, changes: &Map<String, Value>) -> Result<()> {
        let mut value = serde_json::to_value(&*self).map_err(invalid)?;
        if let Value::Object(fields) = &mut value {
            for (key, field) in changes {
                fields.insert(key.clone(), field.clone());
            }
        }
        *self = serde_json::from_value(value).map_err(invalid)?;
        Ok(())
    }
}

/// Payload of any bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Note(Note),
    Tag(Tag),
    Preferences(Preferences),
}

impl Entity {
    /// The bucket this entity belongs to.
    pub fn bucket(&self) -> BucketName {
        match self {
            Entity::Note(_) => BucketName::Note,
            Entity::Tag(_) => BucketName::Tag,
            Entity::Preferences(_) => BucketName::Preferences,
        }
    }

    pub fn as_note(&self) -> Option<&Note> {
        match self {
            Entity::Note(note) => Some(note),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Entity::Tag(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn as_preferences(&self) -> Option<&Preferences> {
        match self {
            Entity::Preferences(prefs) => Some(prefs),
            _ => None,
        }
    }

    /// The bare JSON object the remote stores (no bucket tag).
    pub fn to_value(&self) -> Result<Value> {
        match self {
            Entity::Note(note) => serde_json::to_value(note),
            Entity::Tag(tag) => serde_json::to_value(tag),
            Entity::Preferences(prefs) => serde_json::to_value(prefs),
        }
        .map_err(invalid)
    }

    /// Parse a bare JSON object received for `bucket`.
    pub fn from_value(bucket: BucketName, value: Value) -> Result<Self> {
        let entity = match bucket {
            BucketName::Note => Entity::Note(serde_json::from_value(value).map_err(invalid)?),
            BucketName::Tag => Entity::Tag(serde_json::from_value(value).map_err(invalid)?),
            BucketName::Preferences => {
                Entity::Preferences(serde_json::from_value(value).map_err(invalid)?)
            }
        };
        Ok(entity)
    }
}

fn invalid(err: serde_json::Error) -> Error {
    Error::InvalidEntity(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_note_is_stamped() {
        let note = Note::new(1000.0);
        assert_eq!(note.creation_date, 1000.0);
        assert_eq!(note.modification_date, 1000.0);
        assert!(note.content.is_empty());
        assert!(!note.deleted);
    }

    #[test]
    fn system_tags_toggle() {
        let mut note = Note::default();
        assert!(note.set_system_tag(SystemTag::Pinned, true));
        assert!(!note.set_system_tag(SystemTag::Pinned, true));
        assert!(note.has_system_tag(SystemTag::Pinned));
        assert!(note.set_system_tag(SystemTag::Pinned, false));
        assert!(note.system_tags.is_empty());
    }

    #[test]
    fn tags_are_case_insensitive_set() {
        let mut note = Note::default();
        assert!(note.add_tag("Work"));
        assert!(!note.add_tag("work"));
        assert!(note.has_tag("WORK"));
        assert_eq!(note.tags, vec!["Work".to_string()]);

        assert!(note.remove_tag("wOrK"));
        assert!(!note.remove_tag("work"));
        assert!(note.tags.is_empty());
    }

    #[test]
    fn patch_overwrites_present_fields() {
        let mut note = Note::new(10.0);
        note.content = "old".into();

        let patch = NotePatch {
            content: Some("new".into()),
            tags: Some(vec!["a".into(), "A".into(), "b".into()]),
            deleted: Some(true),
            ..NotePatch::default()
        };
        patch.apply_to(&mut note);

        assert_eq!(note.content, "new");
        assert_eq!(note.tags, vec!["a".to_string(), "b".to_string()]);
        assert!(note.deleted);
        assert_eq!(note.creation_date, 10.0);
    }

    #[test]
    fn note_wire_format() {
        let mut note = Note::new(5.0);
        note.share_url = "https://share".into();
        note.system_tags.push(SystemTag::Markdown);

        let value = Entity::Note(note).to_value().unwrap();
        assert_eq!(value["shareURL"], "https://share");
        assert_eq!(value["systemTags"], json!(["markdown"]));
        assert_eq!(value["creationDate"], json!(5.0));
    }

    #[test]
    fn from_value_uses_bucket() {
        let entity = Entity::from_value(BucketName::Tag, json!({"name": "Work"})).unwrap();
        assert_eq!(entity.bucket(), BucketName::Tag);
        assert_eq!(entity.as_tag().unwrap().name, "Work");

        let partial = Entity::from_value(BucketName::Note, json!({"content": "x"})).unwrap();
        assert_eq!(partial.as_note().unwrap().content, "x");

        let bad = Entity::from_value(BucketName::Tag, json!({"name": 3}));
        assert!(matches!(bad, Err(Error::InvalidEntity(_))));
    }

    #[test]
    fn preferences_keep_unknown_fields() {
        let mut prefs = Preferences::default();
        let changes = json!({"analyticsEnabled": true, "theme": "dark"});
        prefs.merge(changes.as_object().unwrap()).unwrap();

        assert_eq!(prefs.analytics_enabled, Some(true));
        assert_eq!(prefs.extra.get("theme"), Some(&json!("dark")));

        let value = Entity::Preferences(prefs).to_value().unwrap();
        assert_eq!(value, json!({"analyticsEnabled": true, "theme": "dark"}));
    }

    #[test]
    fn bucket_names() {
        assert_eq!(BucketName::Preferences.to_string(), "preferences");
        let json = serde_json::to_string(&BucketName::Tag).unwrap();
        assert_eq!(json, r#""tag""#);
    }
}
