//! Scene record serialization
//!
//! The boundary format between the grammar/physics core and every other
//! collaborator: a YAML mapping from scene name to a record of typed, posed
//! objects. Each record carries `n_objects` plus `obj_%04d` entries with
//! class, shape parameters and pose (3 floats planar x z theta; 7 floats
//! spatial wxyz quaternion + xyz).
//!
//! Files are append-only: new scenes are appended as new top-level keys.
//! Records written by this core round-trip exactly. Loading is strict:
//! `n_objects` and per-object class/pose are mandatory, never defaulted.

use crate::error::SceneError;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// One posed, typed object in a scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub class: String,
    #[serde(default)]
    pub params: Vec<f64>,
    #[serde(default)]
    pub params_names: Vec<String>,
    pub pose: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_path: Option<String>,
}

impl SceneObject {
    pub fn is_planar(&self) -> bool {
        self.pose.len() == 3
    }
}

/// A flat, ordered set of scene objects
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SceneRecord {
    pub objects: Vec<SceneObject>,
}

impl SceneRecord {
    pub fn new(objects: Vec<SceneObject>) -> Self {
        Self { objects }
    }

    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }
}

impl Serialize for SceneRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.objects.len() + 1))?;
        map.serialize_entry("n_objects", &self.objects.len())?;
        for (k, obj) in self.objects.iter().enumerate() {
            map.serialize_entry(&format!("obj_{:04}", k), obj)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SceneRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = SceneRecord;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a scene record with n_objects and obj_%04d entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut declared: Option<usize> = None;
                // BTreeMap keeps obj_%04d keys in object-index order
                let mut objects: BTreeMap<String, SceneObject> = BTreeMap::new();

                while let Some(key) = map.next_key::<String>()? {
                    if key == "n_objects" {
                        declared = Some(map.next_value()?);
                    } else if key.starts_with("obj_") {
                        let obj: SceneObject = map.next_value()?;
                        objects.insert(key, obj);
                    } else {
                        return Err(de::Error::unknown_field(&key, &["n_objects", "obj_%04d"]));
                    }
                }

                let declared = declared.ok_or_else(|| de::Error::missing_field("n_objects"))?;
                if declared != objects.len() {
                    return Err(de::Error::custom(format!(
                        "scene declares {} objects but contains {}",
                        declared,
                        objects.len()
                    )));
                }
                Ok(SceneRecord {
                    objects: objects.into_values().collect(),
                })
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

/// Validate pose lengths across a loaded mapping
fn validate(scenes: &BTreeMap<String, SceneRecord>) -> Result<(), SceneError> {
    for record in scenes.values() {
        for (k, obj) in record.objects.iter().enumerate() {
            if obj.pose.len() != 3 && obj.pose.len() != 7 {
                return Err(SceneError::BadPoseLength {
                    object: format!("obj_{:04}", k),
                    len: obj.pose.len(),
                });
            }
        }
    }
    Ok(())
}

/// Load every scene in a file
pub fn load_scenes(path: &Path) -> Result<BTreeMap<String, SceneRecord>, SceneError> {
    let text = std::fs::read_to_string(path)?;
    let scenes: BTreeMap<String, SceneRecord> = serde_yaml::from_str(&text)?;
    validate(&scenes)?;
    Ok(scenes)
}

/// Save a full scene mapping, replacing the file
pub fn save_scenes(path: &Path, scenes: &BTreeMap<String, SceneRecord>) -> Result<(), SceneError> {
    let yaml = serde_yaml::to_string(scenes)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Append one scene as a new top-level key
///
/// The on-disk file stays one growing YAML mapping, so concatenated
/// appends load back with [`load_scenes`].
pub fn append_scene(path: &Path, name: &str, record: &SceneRecord) -> Result<(), SceneError> {
    let mut single = BTreeMap::new();
    single.insert(name.to_string(), record);
    let yaml = serde_yaml::to_string(&single)?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(yaml.as_bytes())?;
    Ok(())
}
