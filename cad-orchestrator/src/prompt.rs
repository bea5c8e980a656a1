//! Prompt construction
//!
//! Turns a raw user phrase into an enriched engineering instruction and wraps
//! it in the two-section answer contract (`JSON_PLAN:` / `PYTHON_CODE:`) the
//! response parser expects. Everything here is a pure text transformation.

/// Geometric feature keywords and the engineering gloss they expand to
const FEATURE_TERMS: &[(&str, &str)] = &[
    ("twist", "Twist: rotate successive cross-sections along the main axis (loft or twistExtrude), 90° total unless stated"),
    ("chamfer", "Chamfer: 45° angled edge cut, 1 mm leg unless stated"),
    ("fillet", "Fillet: rounded edge, 1-2 mm radius unless stated"),
    ("round", "Round: rounded external edge, treat as a fillet"),
    ("boss", "Boss: raised cylindrical feature, usually carrying a fastener hole"),
    ("flange", "Flange: radial projection with a bolt circle for mounting"),
    ("bracket", "Bracket: L-shaped support, 3-5 mm thick, with mounting holes and stress-relief fillets"),
    ("pipe", "Pipe: hollow cylinder defined by outer diameter and wall thickness"),
    ("tube", "Tube: hollow cylinder defined by outer diameter and wall thickness"),
    ("housing", "Housing: hollow container with wall thickness and access or mounting features"),
    ("enclosure", "Enclosure: hollow container with wall thickness and access or mounting features"),
    ("hole", "Hole: through-hole, M4 clearance (4.5 mm diameter) unless stated"),
    ("slot", "Slot: elongated through-cut with full-round ends"),
    ("thread", "Thread: model cosmetically as a plain cylinder at the major diameter"),
    ("gear", "Gear: cylindrical blank with teeth approximated by an extruded profile"),
    ("rib", "Rib: thin stiffening wall, about 60% of the adjoining wall thickness"),
    ("washer", "Washer: flat ring defined by outer diameter, inner diameter and thickness"),
];

/// Qualitative size words and the default overall dimension in mm
const SIZE_TERMS: &[(&str, f64)] = &[
    ("tiny", 5.0),
    ("small", 10.0),
    ("medium", 50.0),
    ("large", 100.0),
    ("big", 100.0),
    ("huge", 200.0),
];

/// Qualitative thickness words and the default wall thickness in mm
const THICKNESS_TERMS: &[(&str, f64)] = &[
    ("thin", 1.5),
    ("light", 2.0),
    ("sturdy", 4.0),
    ("thick", 5.0),
    ("heavy", 6.0),
];

const MANUFACTURING_DEFAULTS: &str = "\
MANUFACTURING DEFAULTS:
- All dimensions in millimeters
- General tolerance ±0.1 mm, precision features ±0.01 mm
- Minimum wall thickness 1 mm for plastic, 3 mm for metal
- Minimum feature size 0.5 mm
- Closed, watertight solids centered at the origin (X = width, Y = depth, Z = height)";

/// System prompt describing the plan schema and the two-section answer format
pub const SYSTEM_PROMPT: &str = r#"You are a CAD engineer who turns part descriptions into a structured geometry plan and an executable CadQuery script.

Your answer has exactly TWO sections, in this order:

JSON_PLAN:
{
  "objects": [
    {
      "name": "unique_name",
      "type": "Box|Cylinder|Sphere|Cone|Torus|Pyramid|Loft|Extrude",
      "params": {"width": 50, "height": 50, "depth": 50},
      "transform": [[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]]
    }
  ],
  "operations": [
    {
      "action": "fillet_edges|translate|rotate|union|subtract",
      "target": "object_name",
      "edges": "all|vertical|horizontal|top|bottom",
      "radius": 5,
      "vector": [0, 0, 25],
      "angle": 90,
      "axis": [0, 0, 1]
    }
  ]
}

PYTHON_CODE:
```python
import cadquery as cq
# build the part described by the plan
result = ...
cq.Assembly().add(result, name="part").save("output.gltf")
cq.exporters.export(result, "output.step")
```

Object parameters:
- Box: width, height, depth
- Cylinder: radius, height
- Sphere: radius
- Cone: radius1, radius2, height
- Torus: majorRadius, minorRadius
- Pyramid: base, height
- Loft / Extrude: height plus any profile dimensions you need

Rules:
- Every object name is unique and every operation target names an existing object.
- Transforms are complete 4x4 row-major matrices.
- All dimensions are in millimeters.
- The script imports cadquery as cq, assigns the final solid to `result`, and
  writes output.gltf (and output.step) into the current directory.
- The script must not read or write any other files, open sockets, or spawn processes."#;

/// Expand a raw user phrase into an engineering instruction.
///
/// Each term table is scanned independently; every match becomes a bullet
/// under the interpretation section, in table order.
pub fn compile_prompt(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    let mut bullets = Vec::new();

    for (term, gloss) in FEATURE_TERMS {
        if mentions(&words, term) {
            bullets.push(format!("- {gloss}"));
        }
    }

    for (term, size) in SIZE_TERMS {
        if mentions(&words, term) {
            bullets.push(format!(
                "- Size \"{term}\": assume about {size} mm for the largest unspecified dimension"
            ));
        }
    }

    for (term, wall) in THICKNESS_TERMS {
        if mentions(&words, term) {
            bullets.push(format!(
                "- Thickness \"{term}\": use {wall} mm walls unless stated"
            ));
        }
    }

    if bullets.is_empty() {
        bullets.push(
            "- No domain terms recognized: infer dimensions from context and engineering standards"
                .to_string(),
        );
    }

    let request = raw.trim();
    let request = if request.is_empty() {
        "a simple mechanical part of your choice"
    } else {
        request
    };

    format!(
        "REQUEST: {request}\n\nENGINEERING INTERPRETATION:\n{}\n\n{MANUFACTURING_DEFAULTS}",
        bullets.join("\n")
    )
}

/// User message for one attempt. `feedback` explains why the previous attempt
/// was rejected, if there was one.
pub fn build_user_message(instruction: &str, feedback: Option<&str>) -> String {
    let mut message = format!(
        "Generate a complete CAD pipeline for this request.\n\n{instruction}\n\n\
         Answer with the JSON_PLAN section followed by the PYTHON_CODE section."
    );

    if let Some(reason) = feedback {
        message.push_str(&format!(
            "\n\nYOUR PREVIOUS ANSWER WAS REJECTED: {reason}\n\
             Return both sections again, complete and consistent with each other."
        ));
    }

    message
}

/// Whole-word match, tolerating simple inflections ("holes", "filleted")
fn mentions(words: &[&str], term: &str) -> bool {
    words.iter().any(|word| {
        word.strip_prefix(term)
            .is_some_and(|rest| matches!(rest, "" | "s" | "es" | "ed" | "ing" | "er" | "-duty"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_prompt_gives_generic_instruction() {
        let compiled = compile_prompt("");
        assert!(compiled.contains("ENGINEERING INTERPRETATION:"));
        assert!(compiled.contains("No domain terms recognized"));
        assert!(compiled.contains("MANUFACTURING DEFAULTS:"));
    }

    #[test]
    fn test_matches_across_all_tables() {
        let compiled = compile_prompt("A small, THIN bracket with two Holes and a chamfer");
        assert!(compiled.contains("Bracket:"));
        assert!(compiled.contains("Hole:"));
        assert!(compiled.contains("Chamfer:"));
        assert!(compiled.contains("Size \"small\""));
        assert!(compiled.contains("Thickness \"thin\""));
        assert!(!compiled.contains("No domain terms recognized"));
    }

    #[test]
    fn test_bullets_follow_table_order() {
        let compiled = compile_prompt("washer with a twist");
        let twist = compiled.find("Twist:").unwrap();
        let washer = compiled.find("Washer:").unwrap();
        assert!(twist < washer);
    }

    #[test]
    fn test_does_not_match_inside_other_words() {
        let compiled = compile_prompt("think about something");
        assert!(!compiled.contains("Thickness \"thin\""));
    }

    #[test]
    fn test_heavy_duty_counts_as_thickness() {
        let compiled = compile_prompt("heavy-duty hook");
        assert!(compiled.contains("Thickness \"heavy\""));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let prompt = "large flange with boss and fillets";
        assert_eq!(compile_prompt(prompt), compile_prompt(prompt));
    }

    #[test]
    fn test_user_message_includes_feedback() {
        let message = build_user_message("REQUEST: cube", Some("no PYTHON_CODE section"));
        assert!(message.contains("REQUEST: cube"));
        assert!(message.contains("REJECTED: no PYTHON_CODE section"));
        assert!(!build_user_message("REQUEST: cube", None).contains("REJECTED"));
    }
}
