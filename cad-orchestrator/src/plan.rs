//! Geometry plan model
//!
//! A plan is a flat, tree-free description of the part: an ordered list of
//! primitive objects and an ordered list of operations applied to them. It is
//! produced per request (parsed from the LLM completion or synthesized by the
//! fallback generator) and never persisted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Row-major homogeneous 4x4 affine transform
pub type Transform = [[f64; 4]; 4];

pub const IDENTITY: Transform = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn identity() -> Transform {
    IDENTITY
}

/// Structural invariant violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan contains no objects")]
    Empty,

    #[error("Duplicate object name: {0}")]
    DuplicateName(String),

    #[error("Operation {index} ({action}) targets unknown object '{target}'")]
    DanglingTarget {
        index: usize,
        action: Action,
        target: String,
    },
}

/// Primitive kinds a plan object can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Box,
    Cylinder,
    Sphere,
    Cone,
    Torus,
    Pyramid,
    Loft,
    Extrude,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectType::Box => "Box",
            ObjectType::Cylinder => "Cylinder",
            ObjectType::Sphere => "Sphere",
            ObjectType::Cone => "Cone",
            ObjectType::Torus => "Torus",
            ObjectType::Pyramid => "Pyramid",
            ObjectType::Loft => "Loft",
            ObjectType::Extrude => "Extrude",
        };
        f.write_str(name)
    }
}

/// Operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    FilletEdges,
    Translate,
    Rotate,
    Union,
    Subtract,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::FilletEdges => "fillet_edges",
            Action::Translate => "translate",
            Action::Rotate => "rotate",
            Action::Union => "union",
            Action::Subtract => "subtract",
        };
        f.write_str(name)
    }
}

/// A single named primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanObject {
    /// Unique within the plan
    pub name: String,

    #[serde(rename = "type")]
    pub object_type: ObjectType,

    /// Type-specific dimensions, e.g. Box -> width/height/depth
    #[serde(default)]
    pub params: BTreeMap<String, f64>,

    #[serde(default = "identity")]
    pub transform: Transform,
}

impl PlanObject {
    pub fn new<'a>(
        name: impl Into<String>,
        object_type: ObjectType,
        params: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Self {
        Self {
            name: name.into(),
            object_type,
            params: params
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
            transform: IDENTITY,
        }
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params.get(key).copied()
    }
}

/// An operation applied to a named object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub action: Action,

    /// Name of the object this operation applies to
    pub target: String,

    /// Edge selector for fillets ("all", "vertical", "top", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<[f64; 3]>,

    /// Rotation angle in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<[f64; 3]>,
}

/// Flat structural description of a part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryPlan {
    pub objects: Vec<PlanObject>,

    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl GeometryPlan {
    /// Plan with a single object and no operations
    pub fn single(object: PlanObject) -> Self {
        Self {
            objects: vec![object],
            operations: Vec::new(),
        }
    }

    /// Look up an object by name
    pub fn object(&self, name: &str) -> Option<&PlanObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    /// Check the plan invariants: at least one object, unique names, and
    /// every operation target resolving to an object.
    pub fn check(&self) -> Result<(), PlanError> {
        if self.objects.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut names = HashSet::with_capacity(self.objects.len());
        for object in &self.objects {
            if !names.insert(object.name.as_str()) {
                return Err(PlanError::DuplicateName(object.name.clone()));
            }
        }

        for (index, op) in self.operations.iter().enumerate() {
            if !names.contains(op.target.as_str()) {
                return Err(PlanError::DanglingTarget {
                    index,
                    action: op.action,
                    target: op.target.clone(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_object_plan() -> serde_json::Value {
        json!({
            "objects": [
                {"name": "base", "type": "Box", "params": {"width": 50, "height": 10, "depth": 30}},
                {"name": "hole", "type": "Cylinder", "params": {"radius": 4, "height": 12}}
            ],
            "operations": [
                {"action": "subtract", "target": "hole"},
                {"action": "fillet_edges", "target": "base", "edges": "vertical", "radius": 2}
            ]
        })
    }

    #[test]
    fn test_deserialize_defaults_transform_to_identity() {
        let plan: GeometryPlan = serde_json::from_value(two_object_plan()).unwrap();
        assert_eq!(plan.objects.len(), 2);
        assert_eq!(plan.objects[0].transform, IDENTITY);
        assert_eq!(plan.objects[0].param("width"), Some(50.0));
        assert_eq!(plan.operations[1].action, Action::FilletEdges);
        assert_eq!(plan.operations[1].edges.as_deref(), Some("vertical"));
        assert!(plan.check().is_ok());
    }

    #[test]
    fn test_missing_operations_is_empty_list() {
        let plan: GeometryPlan = serde_json::from_value(json!({
            "objects": [{"name": "ball", "type": "Sphere", "params": {"radius": 5}}]
        }))
        .unwrap();
        assert!(plan.operations.is_empty());
    }

    #[test]
    fn test_unknown_object_type_is_rejected() {
        let result: Result<GeometryPlan, _> = serde_json::from_value(json!({
            "objects": [{"name": "w", "type": "Wedge", "params": {}}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_dangling_target_is_rejected() {
        let mut plan: GeometryPlan = serde_json::from_value(two_object_plan()).unwrap();
        plan.operations[0].target = "ghost".to_string();
        assert_eq!(
            plan.check(),
            Err(PlanError::DanglingTarget {
                index: 0,
                action: Action::Subtract,
                target: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let plan = GeometryPlan {
            objects: vec![
                PlanObject::new("part", ObjectType::Box, [("width", 1.0)]),
                PlanObject::new("part", ObjectType::Sphere, [("radius", 1.0)]),
            ],
            operations: Vec::new(),
        };
        assert_eq!(
            plan.check(),
            Err(PlanError::DuplicateName("part".to_string()))
        );
    }

    #[test]
    fn test_serialized_plan_carries_full_transform() {
        let plan = GeometryPlan::single(PlanObject::new("cube", ObjectType::Box, [("width", 2.0)]));
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["objects"][0]["transform"][3], json!([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(value["objects"][0]["type"], "Box");
        assert_eq!(value["operations"], json!([]));
    }
}
