//! Deterministic, LLM-free generation
//!
//! Infers one primitive from keywords and the first measurement in the
//! prompt, then emits a one-object plan and a matching CadQuery script. When
//! even the CAD library is missing, [`synthesize_box_gltf`] builds a small
//! but loadable glTF document directly.

use crate::executor::data_uri;
use crate::plan::{GeometryPlan, ObjectType, PlanObject};
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

/// Edge length used when the prompt carries no measurement (mm)
pub const DEFAULT_DIMENSION: f64 = 20.0;

const CYLINDER_KEYWORDS: &[&str] = &[
    "cylinder",
    "cylindrical",
    "tube",
    "pipe",
    "rod",
    "shaft",
    "gear",
    "washer",
    "disc",
    "disk",
    "wheel",
];

const SPHERE_KEYWORDS: &[&str] = &["sphere", "spherical", "ball", "orb", "globe"];

static MEASUREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:\b(radius|diameter)\s*(?:of|=|:)?\s*)?(\d+(?:\.\d+)?)\s*(mm|cm|inches|inch|in)\b(?:\s*(radius|diameter)\b)?",
    )
    .expect("valid measurement regex")
});

static SCRIPT_BOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.box\s*\(\s*(\d+(?:\.\d+)?)\s*,\s*(\d+(?:\.\d+)?)\s*,\s*(\d+(?:\.\d+)?)")
        .expect("valid box call regex")
});

static SCRIPT_CYLINDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.cylinder\s*\(\s*(\d+(?:\.\d+)?)\s*,\s*(\d+(?:\.\d+)?)")
        .expect("valid cylinder call regex")
});

static SCRIPT_SPHERE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.sphere\s*\(\s*(\d+(?:\.\d+)?)").expect("valid sphere call regex")
});

/// Primitive inferred from a prompt, dimensions in mm
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Box { width: f64, height: f64, depth: f64 },
    Cylinder { radius: f64, height: f64 },
    Sphere { radius: f64 },
}

impl Shape {
    /// Axis-aligned extents as (width, height, depth)
    pub fn bounding_box(&self) -> (f64, f64, f64) {
        match *self {
            Shape::Box {
                width,
                height,
                depth,
            } => (width, height, depth),
            Shape::Cylinder { radius, height } => (2.0 * radius, height, 2.0 * radius),
            Shape::Sphere { radius } => (2.0 * radius, 2.0 * radius, 2.0 * radius),
        }
    }

    fn object(&self) -> PlanObject {
        match *self {
            Shape::Box {
                width,
                height,
                depth,
            } => PlanObject::new(
                "fallback_box",
                ObjectType::Box,
                [("width", width), ("height", height), ("depth", depth)],
            ),
            Shape::Cylinder { radius, height } => PlanObject::new(
                "fallback_cylinder",
                ObjectType::Cylinder,
                [("radius", radius), ("height", height)],
            ),
            Shape::Sphere { radius } => {
                PlanObject::new("fallback_sphere", ObjectType::Sphere, [("radius", radius)])
            }
        }
    }

    fn construction(&self) -> String {
        match *self {
            Shape::Box {
                width,
                height,
                depth,
            } => format!("box({width}, {height}, {depth})"),
            Shape::Cylinder { radius, height } => format!("cylinder({height}, {radius})"),
            Shape::Sphere { radius } => format!("sphere({radius})"),
        }
    }

    fn script(&self) -> String {
        format!(
            "import cadquery as cq\n\
             \n\
             result = cq.Workplane(\"XY\").{}\n\
             \n\
             cq.Assembly().add(result, name=\"part\").save(\"output.gltf\")\n\
             cq.exporters.export(result, \"output.step\")\n",
            self.construction()
        )
    }
}

/// Plan and script synthesized for a prompt
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackDesign {
    pub shape: Shape,
    pub plan: GeometryPlan,
    pub script: String,
}

/// Build the fallback plan and script for `prompt`. Identical prompts give
/// identical designs.
pub fn design(prompt: &str) -> FallbackDesign {
    let shape = infer_shape(prompt);
    FallbackDesign {
        shape,
        plan: GeometryPlan::single(shape.object()),
        script: shape.script(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Plain,
    Radius,
    Diameter,
}

#[derive(Debug, Clone, Copy)]
struct Measurement {
    mm: f64,
    role: Role,
}

/// Classify the prompt and size the primitive
pub fn infer_shape(prompt: &str) -> Shape {
    let lowered = prompt.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let measurements = measurements(prompt);

    let plain = measurements
        .iter()
        .find(|m| m.role == Role::Plain)
        .map(|m| m.mm);
    let radius = measurements.iter().find_map(|m| match m.role {
        Role::Radius => Some(m.mm),
        Role::Diameter => Some(m.mm / 2.0),
        Role::Plain => None,
    });
    let primary = measurements
        .first()
        .map_or(DEFAULT_DIMENSION, |m| m.mm);

    if mentions_any(&words, CYLINDER_KEYWORDS) {
        let base = plain.unwrap_or(DEFAULT_DIMENSION);
        Shape::Cylinder {
            radius: radius.unwrap_or(base / 2.0),
            height: base,
        }
    } else if mentions_any(&words, SPHERE_KEYWORDS) {
        Shape::Sphere {
            radius: radius.unwrap_or(primary / 2.0),
        }
    } else {
        let side = plain.unwrap_or(primary);
        Shape::Box {
            width: side,
            height: side,
            depth: side,
        }
    }
}

fn mentions_any(words: &[&str], keywords: &[&str]) -> bool {
    words.iter().any(|word| {
        keywords.iter().any(|kw| {
            word.strip_prefix(kw)
                .is_some_and(|rest| matches!(rest, "" | "s" | "es"))
        })
    })
}

fn measurements(prompt: &str) -> Vec<Measurement> {
    MEASUREMENT
        .captures_iter(prompt)
        .filter_map(|caps| {
            let value: f64 = caps.get(2)?.as_str().parse().ok()?;
            let scale = match caps.get(3)?.as_str().to_ascii_lowercase().as_str() {
                "cm" => 10.0,
                "in" | "inch" | "inches" => 25.4,
                _ => 1.0,
            };
            let mm = round_mm(value * scale);
            if mm <= 0.0 {
                return None;
            }

            let keyword = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|k| k.as_str().to_ascii_lowercase());
            let role = match keyword.as_deref() {
                Some("radius") => Role::Radius,
                Some("diameter") => Role::Diameter,
                _ => Role::Plain,
            };
            Some(Measurement { mm, role })
        })
        .collect()
}

/// Drop float noise from unit conversion (2.54 * 10 etc.)
fn round_mm(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Recover bounding-box dimensions from a script's first primitive call:
/// `.box(w, h, d)`, else `.cylinder(h, r)`, else `.sphere(r)`. Defaults to a
/// cube of [`DEFAULT_DIMENSION`].
pub fn dimensions_from_script(script: &str) -> (f64, f64, f64) {
    let numbers = |re: &Regex| -> Option<Vec<f64>> {
        let caps = re.captures(script)?;
        caps.iter()
            .skip(1)
            .map(|m| m?.as_str().parse::<f64>().ok().filter(|v| *v > 0.0))
            .collect()
    };

    if let Some(v) = numbers(&SCRIPT_BOX) {
        return (v[0], v[1], v[2]);
    }
    if let Some(v) = numbers(&SCRIPT_CYLINDER) {
        let (height, radius) = (v[0], v[1]);
        return (2.0 * radius, height, 2.0 * radius);
    }
    if let Some(v) = numbers(&SCRIPT_SPHERE) {
        let d = 2.0 * v[0];
        return (d, d, d);
    }
    (DEFAULT_DIMENSION, DEFAULT_DIMENSION, DEFAULT_DIMENSION)
}

/// Triangles of the unit cube, counter-clockwise seen from outside. Vertex
/// `i` sits at (+x if bit 0, +y if bit 1, +z if bit 2).
const CUBE_INDICES: [u16; 36] = [
    0, 2, 1, 1, 2, 3, // -z
    4, 5, 6, 5, 7, 6, // +z
    0, 4, 2, 2, 4, 6, // -x
    1, 3, 5, 3, 7, 5, // +x
    0, 1, 4, 1, 5, 4, // -y
    2, 6, 3, 3, 6, 7, // +y
];

const POSITIONS_LEN: usize = 8 * 3 * 4;
const INDICES_LEN: usize = 36 * 2;

/// Self-contained glTF 2.0 document for an axis-aligned box centered at the
/// origin (x = width, y = height, z = depth)
pub fn synthesize_box_gltf(width: f64, height: f64, depth: f64) -> String {
    let half = [
        (width / 2.0) as f32,
        (height / 2.0) as f32,
        (depth / 2.0) as f32,
    ];

    let mut buffer = Vec::with_capacity(POSITIONS_LEN + INDICES_LEN);
    for i in 0..8u8 {
        for (axis, extent) in half.iter().enumerate() {
            let sign = if i & (1 << axis) != 0 { 1.0 } else { -1.0 };
            buffer.extend_from_slice(&(sign * extent).to_le_bytes());
        }
    }
    for index in CUBE_INDICES {
        buffer.extend_from_slice(&index.to_le_bytes());
    }

    let min: Vec<f32> = half.iter().map(|h| -h).collect();
    let doc = json!({
        "asset": {"version": "2.0", "generator": "cadagent fallback"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [{"mesh": 0, "name": "fallback_box"}],
        "meshes": [{"primitives": [{"attributes": {"POSITION": 0}, "indices": 1, "mode": 4}]}],
        "buffers": [{
            "byteLength": buffer.len(),
            "uri": data_uri("application/octet-stream", &buffer),
        }],
        "bufferViews": [
            {"buffer": 0, "byteOffset": 0, "byteLength": POSITIONS_LEN, "target": 34962},
            {"buffer": 0, "byteOffset": POSITIONS_LEN, "byteLength": INDICES_LEN, "target": 34963}
        ],
        "accessors": [
            {"bufferView": 0, "componentType": 5126, "count": 8, "type": "VEC3", "min": min, "max": half},
            {"bufferView": 1, "componentType": 5123, "count": 36, "type": "SCALAR"}
        ]
    });

    doc.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::Value;

    #[test]
    fn test_patterns_compile() {
        LazyLock::force(&MEASUREMENT);
        LazyLock::force(&SCRIPT_BOX);
        LazyLock::force(&SCRIPT_CYLINDER);
        LazyLock::force(&SCRIPT_SPHERE);
    }

    #[test]
    fn test_cube_prompt() {
        let design = design("Create a 20mm cube");
        let object = &design.plan.objects[0];
        assert_eq!(object.object_type, ObjectType::Box);
        for key in ["width", "height", "depth"] {
            assert_eq!(object.param(key), Some(20.0));
        }
        assert!(design.script.contains(".box(20, 20, 20)"));
        assert!(design.script.contains("output.gltf"));
    }

    #[test]
    fn test_cylinder_radius_prompt() {
        let design = design("cylinder 30mm radius");
        let object = &design.plan.objects[0];
        assert_eq!(object.object_type, ObjectType::Cylinder);
        assert_eq!(object.param("radius"), Some(30.0));
        assert_eq!(object.param("height"), Some(DEFAULT_DIMENSION));
        assert!(design.script.contains(".cylinder(20, 30)"));
    }

    #[test]
    fn test_units_are_converted() {
        assert_eq!(
            infer_shape("a 2cm block"),
            Shape::Box {
                width: 20.0,
                height: 20.0,
                depth: 20.0
            }
        );
        assert_eq!(
            infer_shape("ball, 1 inch"),
            Shape::Sphere { radius: 12.7 }
        );
    }

    #[test]
    fn test_cylinder_dimensions() {
        assert_eq!(
            infer_shape("a steel rod 40 mm long with a diameter of 8mm"),
            Shape::Cylinder {
                radius: 4.0,
                height: 40.0
            }
        );
        assert_eq!(
            infer_shape("washer 10mm"),
            Shape::Cylinder {
                radius: 5.0,
                height: 10.0
            }
        );
    }

    #[test]
    fn test_cylinder_keywords_win_over_sphere() {
        assert!(matches!(
            infer_shape("a gear shaped like a ball"),
            Shape::Cylinder { .. }
        ));
    }

    #[test]
    fn test_no_measurement_uses_default() {
        assert_eq!(
            infer_shape("something nice"),
            Shape::Box {
                width: DEFAULT_DIMENSION,
                height: DEFAULT_DIMENSION,
                depth: DEFAULT_DIMENSION
            }
        );
        assert_eq!(infer_shape("a globe"), Shape::Sphere { radius: 10.0 });
    }

    #[test]
    fn test_design_is_deterministic() {
        let a = design("a 35mm pipe");
        let b = design("a 35mm pipe");
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a.plan).unwrap(),
            serde_json::to_string(&b.plan).unwrap()
        );
        assert!(a.plan.check().is_ok());
    }

    #[test]
    fn test_dimensions_from_script() {
        assert_eq!(
            dimensions_from_script("cq.Workplane().box(10, 20.5, 30)"),
            (10.0, 20.5, 30.0)
        );
        assert_eq!(
            dimensions_from_script("cq.Workplane().cylinder(15, 4)"),
            (8.0, 15.0, 8.0)
        );
        assert_eq!(
            dimensions_from_script("cq.Workplane().sphere(6)"),
            (12.0, 12.0, 12.0)
        );
        assert_eq!(
            dimensions_from_script("print('nothing')"),
            (DEFAULT_DIMENSION, DEFAULT_DIMENSION, DEFAULT_DIMENSION)
        );
    }

    #[test]
    fn test_dimensions_from_spaced_calls() {
        assert_eq!(
            dimensions_from_script("cq.Workplane(\"XY\").box (10, 20, 30)"),
            (10.0, 20.0, 30.0)
        );
        assert_eq!(
            dimensions_from_script("cq.Workplane().cylinder\t(15, 4)"),
            (8.0, 15.0, 8.0)
        );
    }

    #[test]
    fn test_synthetic_gltf_is_well_formed() {
        let gltf: Value = serde_json::from_str(&synthesize_box_gltf(10.0, 20.0, 30.0)).unwrap();
        assert_eq!(gltf["asset"]["version"], "2.0");
        assert_eq!(gltf["buffers"][0]["byteLength"], 168);
        assert_eq!(gltf["accessors"][0]["max"], json!([5.0, 10.0, 15.0]));
        assert_eq!(gltf["accessors"][0]["min"], json!([-5.0, -10.0, -15.0]));

        let uri = gltf["buffers"][0]["uri"].as_str().unwrap();
        let bytes = STANDARD
            .decode(uri.strip_prefix("data:application/octet-stream;base64,").unwrap())
            .unwrap();
        assert_eq!(bytes.len(), 168);

        let last_vertex: Vec<f32> = bytes[84..96]
            .chunks(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(last_vertex, vec![5.0, 10.0, 15.0]);

        let indices: Vec<u16> = bytes[96..]
            .chunks(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(indices, CUBE_INDICES.to_vec());
    }
}
