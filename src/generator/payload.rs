//! Turning generator answers into domain records.

use crate::errors::GeneratorError;
use crate::generator::GeneratedCode;
use crate::util::{extract_json_object, strip_code_fence};
use cadforge_common::{
    Complexity, Concept, Dimensions, ManufacturingMethod, Part, PartBreakdown,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct ConceptPayload {
    refined_description: String,
    #[serde(default)]
    design_type: Option<String>,
    #[serde(default)]
    key_features: Vec<String>,
    #[serde(default, alias = "complexity")]
    estimated_complexity: Option<Complexity>,
    #[serde(default)]
    estimated_parts_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct BreakdownPayload {
    #[serde(default)]
    parts: Vec<PartPayload>,
}

#[derive(Debug, Deserialize)]
struct PartPayload {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    manufacturing_method: Option<String>,
    #[serde(default, alias = "material")]
    material_recommendation: Option<String>,
    #[serde(default, alias = "dimensions")]
    estimated_dimensions: Option<Dimensions>,
    #[serde(default)]
    complexity: Option<Complexity>,
    #[serde(default)]
    notes: Option<String>,
}

fn parse_json<T: for<'de> Deserialize<'de>>(
    generated: &GeneratedCode,
    what: &str,
) -> Result<T, GeneratorError> {
    let text = strip_code_fence(&generated.code);
    let json = extract_json_object(&text)
        .ok_or_else(|| GeneratorError::empty(format!("{} answer contains no JSON object", what)))?;
    serde_json::from_str(&json)
        .map_err(|e| GeneratorError::empty(format!("{} answer is not valid: {}", what, e)))
}

/// Source code from a code-stage answer, without any markdown fence.
pub fn source_code(generated: &GeneratedCode) -> Result<String, GeneratorError> {
    let code = strip_code_fence(&generated.code);
    if code.trim().is_empty() {
        return Err(GeneratorError::empty("generator returned blank code"));
    }
    Ok(code)
}

pub fn parse_concept(
    project_id: Uuid,
    revision: u32,
    feedback: Option<&str>,
    generated: &GeneratedCode,
) -> Result<Concept, GeneratorError> {
    let payload: ConceptPayload = parse_json(generated, "concept")?;
    if payload.refined_description.trim().is_empty() {
        return Err(GeneratorError::empty("concept has no refined description"));
    }

    Ok(Concept {
        project_id,
        revision,
        refined_description: payload.refined_description.trim().to_string(),
        design_type: payload
            .design_type
            .unwrap_or_else(|| "other".to_string())
            .into(),
        key_features: payload.key_features,
        complexity: payload.estimated_complexity.unwrap_or_default(),
        estimated_parts_count: payload.estimated_parts_count.unwrap_or(1).max(1),
        feedback: feedback.map(str::to_string),
        created_at: Utc::now(),
    })
}

pub fn parse_breakdown(
    project_id: Uuid,
    revision: u32,
    generated: &GeneratedCode,
) -> Result<PartBreakdown, GeneratorError> {
    let payload: BreakdownPayload = parse_json(generated, "part breakdown")?;
    if payload.parts.is_empty() {
        return Err(GeneratorError::empty("part breakdown lists no parts"));
    }

    let parts = payload
        .parts
        .into_iter()
        .map(|raw| {
            let mut part = Part::new(0, raw.name.trim(), &raw.description);
            if let Some(method) = raw.manufacturing_method.as_deref() {
                part.manufacturing_method = method.parse().unwrap_or_else(|_| {
                    tracing::debug!(method, "Unknown manufacturing method, assuming 3d_print");
                    ManufacturingMethod::ThreeDPrint
                });
            }
            if let Some(material) = raw.material_recommendation.filter(|m| !m.trim().is_empty()) {
                part.material = material;
            }
            part.dimensions = raw.estimated_dimensions.unwrap_or_default();
            part.complexity = raw.complexity.unwrap_or_default();
            part.notes = raw.notes.filter(|n| !n.trim().is_empty());
            part
        })
        .collect();

    Ok(PartBreakdown::new(project_id, revision, parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadforge_common::DesignType;

    fn answer(code: &str) -> GeneratedCode {
        GeneratedCode {
            code: code.to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn parses_concept_inside_prose() {
        let text = r#"Sure! Here is the concept:
```json
{"refined_description": "Solid sphere, 40mm diameter", "design_type": "geometric_primitive",
 "key_features": ["smooth surface"], "estimated_complexity": "low", "estimated_parts_count": 1}
```"#;
        let concept = parse_concept(Uuid::nil(), 1, None, &answer(text)).unwrap();
        assert_eq!(concept.design_type, DesignType::GeometricPrimitive);
        assert_eq!(concept.complexity, Complexity::Low);
        assert!(concept.is_single_part());
        assert_eq!(concept.key_features, vec!["smooth surface"]);
    }

    #[test]
    fn concept_defaults_and_feedback() {
        let concept = parse_concept(
            Uuid::nil(),
            2,
            Some("make it taller"),
            &answer(r#"{"refined_description": "Tall vase", "estimated_parts_count": 0}"#),
        )
        .unwrap();
        assert_eq!(concept.revision, 2);
        assert_eq!(concept.estimated_parts_count, 1);
        assert_eq!(concept.complexity, Complexity::Medium);
        assert_eq!(concept.feedback.as_deref(), Some("make it taller"));
    }

    #[test]
    fn concept_without_json_is_empty_result() {
        let err = parse_concept(Uuid::nil(), 1, None, &answer("I cannot help")).unwrap_err();
        assert!(matches!(err, GeneratorError::EmptyResult { .. }));

        let err =
            parse_concept(Uuid::nil(), 1, None, &answer(r#"{"refined_description": " "}"#))
                .unwrap_err();
        assert!(matches!(err, GeneratorError::EmptyResult { .. }));
    }

    #[test]
    fn parses_breakdown_fields() {
        let text = r#"{"parts": [
            {"name": "Base", "description": "Round base", "manufacturing_method": "cnc",
             "material_recommendation": "Aluminium", "estimated_dimensions": {"x": 80, "y": 80, "z": 10}},
            {"name": "Lid", "description": "Snap lid", "notes": "flexible hinge"}
        ]}"#;
        let breakdown = parse_breakdown(Uuid::nil(), 1, &answer(text)).unwrap();
        assert_eq!(breakdown.len(), 2);
        let base = breakdown.part(1).unwrap();
        assert_eq!(base.manufacturing_method, ManufacturingMethod::Cnc);
        assert_eq!(base.material, "Aluminium");
        assert_eq!(base.dimensions, Dimensions::new(80.0, 80.0, 10.0));
        let lid = breakdown.part(2).unwrap();
        assert_eq!(lid.material, "PLA");
        assert_eq!(lid.notes.as_deref(), Some("flexible hinge"));
    }

    #[test]
    fn empty_breakdown_is_empty_result() {
        let err = parse_breakdown(Uuid::nil(), 1, &answer(r#"{"parts": []}"#)).unwrap_err();
        assert!(matches!(err, GeneratorError::EmptyResult { .. }));
    }

    #[test]
    fn source_code_strips_fence_and_rejects_blank() {
        let code = source_code(&answer("```python\nresult = cq.Workplane().sphere(20)\n```"))
            .unwrap();
        assert_eq!(code, "result = cq.Workplane().sphere(20)");
        assert!(source_code(&answer("  \n")).is_err());
    }
}
