use super::reference::ReferenceImage;
use serde::{Deserialize, Deserializer, Serialize};

/// Axis-aligned box `(x, y, w, h)` in source-frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// 检测器单帧输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class: impl Into<String>, score: f32, bbox: BoundingBox) -> Self {
        Self {
            class: class.into(),
            score,
            bbox,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Person,
    #[default]
    Object,
}

/// A caregiver-registered person or object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub category: Category,
    #[serde(rename = "imageData")]
    pub reference_image: ReferenceImage,
    #[serde(rename = "detectedObjects", default, deserialize_with = "null_as_empty")]
    pub coarse_tags: Vec<String>,
    /// Epoch millis. Stored as an RFC 3339 string; epoch numbers are accepted too.
    #[serde(rename = "lastSeenAt", default, with = "last_seen")]
    pub last_seen_at_ms: Option<u64>,
}

impl Label {
    /// Loose pre-filter: any tag and the detector class contain one another,
    /// ignoring case.
    pub fn matches_class(&self, class: &str) -> bool {
        let class = class.to_lowercase();
        self.coarse_tags.iter().any(|tag| {
            let tag = tag.to_lowercase();
            tag.contains(&class) || class.contains(&tag)
        })
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

mod last_seen {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let Some(ms) = *value else {
            return serializer.serialize_none();
        };
        match i64::try_from(ms).ok().and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_u64(ms),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(LastSeenVisitor)
    }

    struct LastSeenVisitor;

    impl<'de> Visitor<'de> for LastSeenVisitor {
        type Value = Option<u64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("null, epoch milliseconds or an RFC 3339 timestamp")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
            deserializer.deserialize_any(self)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("negative lastSeenAt {}", v)))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v.is_finite() && v >= 0.0 {
                Ok(Some(v as u64))
            } else {
                Err(E::custom(format!("invalid lastSeenAt {}", v)))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let at = DateTime::parse_from_rfc3339(v).map_err(|e| E::custom(format!("lastSeenAt {:?}: {}", v, e)))?;
            self.visit_i64(at.timestamp_millis())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: Label,
    pub similarity: f32,
    /// The detection that claimed the label.
    pub detection: Detection,
}

/// Candidate labels for one detection, in registration order.
pub fn candidate_labels<'a>(detection: &Detection, labels: &'a [Label]) -> Vec<&'a Label> {
    labels
        .iter()
        .filter(|label| label.matches_class(&detection.class))
        .collect()
}

/// Unique detector classes in first-seen order; used to pre-fill a new label's
/// coarse tags from its reference photo.
pub fn coarse_tags_from_detections(detections: &[Detection]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for detection in detections {
        if !tags.iter().any(|t| t == &detection.class) {
            tags.push(detection.class.clone());
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(id: &str, tags: &[&str]) -> Label {
        Label {
            id: id.to_string(),
            name: id.to_string(),
            category: Category::Object,
            reference_image: ReferenceImage::new(format!("ref-{}", id)),
            coarse_tags: tags.iter().map(|t| t.to_string()).collect(),
            last_seen_at_ms: None,
        }
    }

    fn detection(class: &str) -> Detection {
        Detection::new(class, 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    #[test]
    fn test_coarse_filter_case_insensitive() {
        let cat = label("L1", &["Cat", "feline"]);
        assert!(cat.matches_class("cat"));
        assert!(!cat.matches_class("dog"));
    }

    #[test]
    fn test_coarse_filter_both_directions() {
        let cup = label("L1", &["cup"]);
        assert!(cup.matches_class("teacup"));
        let phone = label("L2", &["cell phone"]);
        assert!(phone.matches_class("phone"));
    }

    #[test]
    fn test_label_without_tags_never_matches() {
        assert!(!label("L1", &[]).matches_class("person"));
    }

    #[test]
    fn test_candidates_keep_registration_order() {
        let labels = vec![label("A", &["dog"]), label("B", &["person"]), label("C", &["Person"])];
        let ids: Vec<_> = candidate_labels(&detection("person"), &labels)
            .into_iter()
            .map(|l| l.id.as_str())
            .collect();
        assert_eq!(ids, vec!["B", "C"]);
    }

    #[test]
    fn test_coarse_tags_unique_in_order() {
        let detections = vec![detection("person"), detection("cup"), detection("person")];
        assert_eq!(coarse_tags_from_detections(&detections), vec!["person", "cup"]);
    }

    #[test]
    fn test_label_deserializes_registry_shape() {
        let json = r#"{
            "id": "abc",
            "name": "Dad",
            "category": "person",
            "imageData": "data:image/png;base64,AAAA",
            "detectedObjects": ["person"],
            "lastSeenAt": null
        }"#;
        let label: Label = serde_json::from_str(json).unwrap();
        assert_eq!(label.category, Category::Person);
        assert_eq!(label.coarse_tags, vec!["person"]);
        assert!(label.last_seen_at_ms.is_none());
    }

    #[test]
    fn test_null_tags_become_empty() {
        let json = r#"{
            "id": "x",
            "name": "Keys",
            "category": "object",
            "imageData": "/tmp/keys.png",
            "detectedObjects": null
        }"#;
        let label: Label = serde_json::from_str(json).unwrap();
        assert!(label.coarse_tags.is_empty());
    }

    fn with_last_seen(value: &str) -> Result<Label, serde_json::Error> {
        let json = format!(
            r#"{{"id":"k","name":"Keys","category":"object","imageData":"/tmp/keys.png","lastSeenAt":{}}}"#,
            value
        );
        serde_json::from_str(&json)
    }

    #[test]
    fn test_last_seen_accepts_iso_string() {
        let label = with_last_seen(r#""2024-05-01T10:00:00.000Z""#).unwrap();
        assert_eq!(label.last_seen_at_ms, Some(1_714_557_600_000));

        let offset = with_last_seen(r#""2024-05-01T12:00:00+02:00""#).unwrap();
        assert_eq!(offset.last_seen_at_ms, Some(1_714_557_600_000));
    }

    #[test]
    fn test_last_seen_accepts_epoch_millis() {
        assert_eq!(with_last_seen("4200").unwrap().last_seen_at_ms, Some(4_200));
        assert!(with_last_seen(r#""yesterday""#).is_err());
        assert!(with_last_seen("-5").is_err());
    }

    #[test]
    fn test_last_seen_written_as_iso_string() {
        let mut label = with_last_seen("null").unwrap();
        assert_eq!(serde_json::to_value(&label).unwrap()["lastSeenAt"], serde_json::Value::Null);

        label.last_seen_at_ms = Some(1_714_557_600_000);
        let value = serde_json::to_value(&label).unwrap();
        assert_eq!(value["lastSeenAt"], "2024-05-01T10:00:00.000Z");

        let back: Label = serde_json::from_value(value).unwrap();
        assert_eq!(back.last_seen_at_ms, Some(1_714_557_600_000));
    }
}
