//! Property schemas per node kind.
//!
//! Every kind accepts the common presentation keys plus its own required and
//! optional keys. Unknown keys are violations so that a malformed model output
//! cannot smuggle arbitrary data into the document.

use serde_json::Value;

use crate::node::{NodeKind, Props};

/// Reason a property bag does not fit its node kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("{kind} does not accept property `{key}`")]
    UnknownProperty { kind: NodeKind, key: String },
    #[error("{kind} requires property `{key}`")]
    MissingProperty { kind: NodeKind, key: &'static str },
    #[error("property `{key}` must be {expected}")]
    InvalidValue {
        key: String,
        expected: &'static str,
    },
}

#[derive(Clone, Copy)]
enum PropType {
    String,
    Bool,
    Object,
    /// Number with an inclusive lower and upper bound.
    Number(f64, f64),
    /// Number strictly greater than zero.
    Positive,
    /// Array of exactly three numbers.
    Vec3,
    OneOf(&'static [&'static str]),
}

impl PropType {
    fn expected(self) -> &'static str {
        match self {
            PropType::String => "a string",
            PropType::Bool => "a boolean",
            PropType::Object => "an object",
            PropType::Number(min, max) if min == 0.0 && max == 1.0 => "a number between 0 and 1",
            PropType::Number(min, _) if min > f64::MIN => "a non-negative number",
            PropType::Number(..) => "a number",
            PropType::Positive => "a number greater than 0",
            PropType::Vec3 => "an array of three numbers",
            PropType::OneOf(_) => "one of the allowed values",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            PropType::String => value.is_string(),
            PropType::Bool => value.is_boolean(),
            PropType::Object => value.is_object(),
            PropType::Number(min, max) => value
                .as_f64()
                .is_some_and(|n| n.is_finite() && n >= min && n <= max),
            PropType::Positive => value.as_f64().is_some_and(|n| n.is_finite() && n > 0.0),
            PropType::Vec3 => value.as_array().is_some_and(|items| {
                items.len() == 3
                    && items
                        .iter()
                        .all(|v| v.as_f64().is_some_and(f64::is_finite))
            }),
            PropType::OneOf(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
        }
    }
}

const NON_NEGATIVE: PropType = PropType::Number(0.0, f64::MAX);
const UNIT: PropType = PropType::Number(0.0, 1.0);

const COMMON: &[(&str, PropType)] = &[
    ("name", PropType::String),
    ("visible", PropType::Bool),
    ("color", PropType::String),
    ("opacity", UNIT),
    ("position", PropType::Vec3),
    ("rotation", PropType::Vec3),
    ("scale", PropType::Vec3),
    ("width", NON_NEGATIVE),
    ("height", NON_NEGATIVE),
    ("style", PropType::Object),
];

struct KindSchema {
    required: &'static [(&'static str, PropType)],
    optional: &'static [(&'static str, PropType)],
}

fn schema_for(kind: NodeKind) -> KindSchema {
    match kind {
        NodeKind::Container => KindSchema {
            required: &[],
            optional: &[(
                "layout",
                PropType::OneOf(&["stack", "row", "grid", "free"]),
            )],
        },
        NodeKind::Text => KindSchema {
            required: &[("content", PropType::String)],
            optional: &[("font_size", PropType::Positive)],
        },
        NodeKind::Image => KindSchema {
            required: &[("src", PropType::String)],
            optional: &[("alt", PropType::String)],
        },
        NodeKind::Video => KindSchema {
            required: &[("src", PropType::String)],
            optional: &[("autoplay", PropType::Bool), ("looping", PropType::Bool)],
        },
        NodeKind::Shape => KindSchema {
            required: &[(
                "shape",
                PropType::OneOf(&["rectangle", "circle", "ellipse", "line"]),
            )],
            optional: &[],
        },
        NodeKind::Mesh => KindSchema {
            required: &[(
                "geometry",
                PropType::OneOf(&["box", "sphere", "plane", "cylinder"]),
            )],
            optional: &[("material", PropType::Object)],
        },
        NodeKind::Light => KindSchema {
            required: &[(
                "light",
                PropType::OneOf(&["ambient", "point", "directional", "spot"]),
            )],
            optional: &[("intensity", NON_NEGATIVE)],
        },
    }
}

fn lookup(schema: &KindSchema, key: &str) -> Option<PropType> {
    schema
        .required
        .iter()
        .chain(schema.optional)
        .chain(COMMON)
        .find(|(name, _)| *name == key)
        .map(|(_, ty)| *ty)
}

/// Validates a complete property bag against the schema of `kind`.
pub fn validate_props(kind: NodeKind, props: &Props) -> Result<(), SchemaViolation> {
    let schema = schema_for(kind);
    for (key, value) in props {
        let ty = lookup(&schema, key).ok_or_else(|| SchemaViolation::UnknownProperty {
            kind,
            key: key.clone(),
        })?;
        if !ty.accepts(value) {
            return Err(SchemaViolation::InvalidValue {
                key: key.clone(),
                expected: ty.expected(),
            });
        }
    }
    if let Some((key, _)) = schema.required.iter().find(|(k, _)| !props.contains_key(*k)) {
        return Err(SchemaViolation::MissingProperty { kind, key });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Props {
        match value {
            Value::Object(map) => map,
            _ => panic!("props must be an object"),
        }
    }

    #[test]
    fn text_requires_content() {
        let err = validate_props(NodeKind::Text, &props(json!({"color": "#fff"})))
            .expect_err("content missing");
        assert!(matches!(
            err,
            SchemaViolation::MissingProperty { key: "content", .. }
        ));
        validate_props(NodeKind::Text, &props(json!({"content": "hi", "font_size": 18})))
            .expect("valid text");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = validate_props(NodeKind::Container, &props(json!({"onclick": "x()"})))
            .expect_err("unknown key");
        assert!(matches!(err, SchemaViolation::UnknownProperty { .. }));
    }

    #[test]
    fn vectors_and_ranges_are_checked() {
        assert!(
            validate_props(
                NodeKind::Mesh,
                &props(json!({"geometry": "box", "position": [1, 2]}))
            )
            .is_err()
        );
        assert!(
            validate_props(
                NodeKind::Light,
                &props(json!({"light": "point", "opacity": 1.5}))
            )
            .is_err()
        );
        validate_props(
            NodeKind::Mesh,
            &props(json!({"geometry": "box", "position": [-1.2, 0, 0], "opacity": 0.5})),
        )
        .expect("valid mesh");
    }

    #[test]
    fn font_size_must_be_positive() {
        let err = validate_props(NodeKind::Text, &props(json!({"content": "hi", "font_size": 0})))
            .expect_err("zero font size");
        assert!(matches!(
            err,
            SchemaViolation::InvalidValue { ref key, expected: "a number greater than 0" } if key == "font_size"
        ));
        assert!(validate_props(NodeKind::Text, &props(json!({"content": "hi", "font_size": -4}))).is_err());
        validate_props(NodeKind::Text, &props(json!({"content": "hi", "font_size": 0.5})))
            .expect("fractional size");
    }

    #[test]
    fn lights_accept_only_listed_keys() {
        let err = validate_props(NodeKind::Light, &props(json!({"light": "point", "distance": 10})))
            .expect_err("distance is not a light property");
        assert!(matches!(err, SchemaViolation::UnknownProperty { ref key, .. } if key == "distance"));
        validate_props(NodeKind::Light, &props(json!({"light": "point", "intensity": 0})))
            .expect("zero intensity");
    }

    #[test]
    fn enumerated_values_are_enforced() {
        assert!(validate_props(NodeKind::Shape, &props(json!({"shape": "hexagon"}))).is_err());
        validate_props(NodeKind::Shape, &props(json!({"shape": "circle"}))).expect("circle");
    }
}
