//! Structured inference results attached to frames.

use std::collections::HashMap;
use std::sync::Mutex;

/// Normalized bounding box for one detected object.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    /// Left edge, in `0.0..=1.0` of frame width.
    pub x: f32,
    /// Top edge, in `0.0..=1.0` of frame height.
    pub y: f32,
    /// Width fraction.
    pub w: f32,
    /// Height fraction.
    pub h: f32,
}

/// A classification attribute attached to an object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    /// Classifier id; -1 means invalid.
    pub id: i32,
    /// Label value; -1 means invalid.
    pub value: i32,
    /// Confidence score.
    pub score: f32,
}

impl Default for Attr {
    fn default() -> Self {
        Self {
            id: -1,
            value: -1,
            score: 0.0,
        }
    }
}

/// Structured information for one detected object.
///
/// The identity fields (`id`, `track_id`, `score`, `bbox`) are set by the
/// detecting module before the object is shared. The attribute maps and
/// feature list are individually lockable so downstream modules running on
/// different workers can annotate the same object concurrently.
#[derive(Debug, Default)]
pub struct InferObject {
    /// Label id of the object's class.
    pub id: String,
    /// Tracker-assigned id, empty until a tracking module fills it.
    pub track_id: String,
    /// Detection confidence.
    pub score: f32,
    /// Normalized object coordinates.
    pub bbox: BoundingBox,

    attributes: Mutex<HashMap<String, Attr>>,
    extra_attributes: Mutex<HashMap<String, String>>,
    features: Mutex<Vec<Vec<f32>>>,
}

impl InferObject {
    /// Create an object with the given label id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Add a classification attribute under `key`.
    ///
    /// Returns false (and leaves the map unchanged) when `key` is already
    /// present.
    pub fn add_attribute(&self, key: impl Into<String>, value: Attr) -> bool {
        let mut attributes = self.attributes.lock().unwrap();
        match attributes.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(value);
                true
            }
        }
    }

    /// Get a classification attribute by key.
    pub fn attribute(&self, key: &str) -> Option<Attr> {
        self.attributes.lock().unwrap().get(key).copied()
    }

    /// Add a free-form string attribute under `key`.
    ///
    /// Returns false when `key` is already present.
    pub fn add_extra_attribute(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let mut extra = self.extra_attributes.lock().unwrap();
        match extra.entry(key.into()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(value.into());
                true
            }
        }
    }

    /// Get a free-form string attribute by key.
    pub fn extra_attribute(&self, key: &str) -> Option<String> {
        self.extra_attributes.lock().unwrap().get(key).cloned()
    }

    /// Append a feature vector.
    pub fn add_feature(&self, feature: Vec<f32>) {
        self.features.lock().unwrap().push(feature);
    }

    /// Snapshot of all feature vectors.
    pub fn features(&self) -> Vec<Vec<f32>> {
        self.features.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn duplicate_attribute_keys_rejected() {
        let obj = InferObject::new("person");
        assert!(obj.add_attribute("age", Attr { id: 0, value: 3, score: 0.9 }));
        assert!(!obj.add_attribute("age", Attr::default()));
        assert_eq!(obj.attribute("age").unwrap().value, 3);
    }

    #[test]
    fn missing_attribute_is_none() {
        let obj = InferObject::new("car");
        assert!(obj.attribute("color").is_none());
        assert!(obj.extra_attribute("plate").is_none());
    }

    #[test]
    fn concurrent_annotation() {
        let obj = Arc::new(InferObject::new("person"));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let obj = obj.clone();
                thread::spawn(move || {
                    obj.add_extra_attribute(format!("k{i}"), format!("v{i}"));
                    obj.add_feature(vec![i as f32]);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(obj.features().len(), 8);
        for i in 0..8 {
            assert_eq!(obj.extra_attribute(&format!("k{i}")).unwrap(), format!("v{i}"));
        }
    }
}
