//! Static operator attributes as a closed tagged union.

use std::collections::BTreeMap;

use crate::error::{error, ErrorKind, Result};
use crate::onnx::{AttributeProto, AttributeType};

/// One attribute value. ONNX tensor- and graphs-typed attributes are not
/// representable here; sub-graph references are resolved to graph names at
/// construction time.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Str(String),
    GraphRef(String),
}

/// Ordered attribute dictionary of one op.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    values: BTreeMap<String, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    /// Parses ONNX node attributes. Attribute payload types outside the
    /// closed union are rejected; completely absent names are simply not
    /// present (per-op setup decides what is required).
    pub fn from_protos(protos: &[AttributeProto]) -> Result<Self> {
        let mut values = BTreeMap::new();
        for proto in protos {
            let value = match AttributeType::try_from(proto.r#type)
                .unwrap_or(AttributeType::Undefined)
            {
                AttributeType::Int => AttrValue::Int(proto.i),
                AttributeType::Float => AttrValue::Float(proto.f),
                AttributeType::Ints => AttrValue::Ints(proto.ints.clone()),
                AttributeType::Floats => AttrValue::Floats(proto.floats.clone()),
                AttributeType::String => AttrValue::Str(
                    String::from_utf8_lossy(&proto.s).into_owned(),
                ),
                AttributeType::Graph => {
                    let name = proto
                        .g
                        .as_ref()
                        .map(|g| g.name.clone())
                        .unwrap_or_default();
                    AttrValue::GraphRef(name)
                }
                other => {
                    return Err(error!(
                        ErrorKind::UnknownAttribute,
                        "attribute {} has unsupported payload type {:?}", proto.name, other
                    ))
                }
            };
            values.insert(proto.name.clone(), value);
        }
        Ok(Attributes { values })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttrValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        match self.values.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(type_error(name, "int", other)),
            None => Err(missing(name)),
        }
    }

    pub fn int_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.values.get(name) {
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(type_error(name, "int", other)),
            None => Ok(default),
        }
    }

    pub fn float(&self, name: &str) -> Result<f32> {
        match self.values.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(other) => Err(type_error(name, "float", other)),
            None => Err(missing(name)),
        }
    }

    pub fn float_or(&self, name: &str, default: f32) -> Result<f32> {
        match self.values.get(name) {
            Some(AttrValue::Float(v)) => Ok(*v),
            Some(other) => Err(type_error(name, "float", other)),
            None => Ok(default),
        }
    }

    pub fn ints(&self, name: &str) -> Result<&[i64]> {
        match self.values.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v),
            Some(other) => Err(type_error(name, "ints", other)),
            None => Err(missing(name)),
        }
    }

    pub fn ints_or_empty(&self, name: &str) -> Result<&[i64]> {
        match self.values.get(name) {
            Some(AttrValue::Ints(v)) => Ok(v),
            Some(other) => Err(type_error(name, "ints", other)),
            None => Ok(&[]),
        }
    }

    pub fn floats(&self, name: &str) -> Result<&[f32]> {
        match self.values.get(name) {
            Some(AttrValue::Floats(v)) => Ok(v),
            Some(other) => Err(type_error(name, "floats", other)),
            None => Err(missing(name)),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        match self.values.get(name) {
            Some(AttrValue::Str(v)) => Ok(v),
            Some(other) => Err(type_error(name, "string", other)),
            None => Err(missing(name)),
        }
    }

    pub fn graph_ref(&self, name: &str) -> Result<&str> {
        match self.values.get(name) {
            Some(AttrValue::GraphRef(v)) => Ok(v),
            Some(other) => Err(type_error(name, "graph", other)),
            None => Err(missing(name)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn missing(name: &str) -> crate::error::Error {
    error!(ErrorKind::UnknownAttribute, "required attribute {name} is absent")
}

fn type_error(name: &str, wanted: &str, got: &AttrValue) -> crate::error::Error {
    error!(
        ErrorKind::UnknownAttribute,
        "attribute {name} is not of type {wanted} (found {got:?})"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let attrs = Attributes::new()
            .with("axis", AttrValue::Int(1))
            .with("perm", AttrValue::Ints(vec![1, 0]))
            .with("scale", AttrValue::Float(3.0));
        assert_eq!(attrs.int("axis").unwrap(), 1);
        assert_eq!(attrs.ints("perm").unwrap(), &[1, 0]);
        assert_eq!(attrs.float("scale").unwrap(), 3.0);
        assert_eq!(attrs.int_or("missing", 7).unwrap(), 7);
        assert!(attrs.int("perm").is_err());
        assert_eq!(
            attrs.int("nope").unwrap_err().kind(),
            ErrorKind::UnknownAttribute
        );
    }

    #[test]
    fn proto_parsing_covers_the_union() {
        let protos = vec![
            AttributeProto {
                name: "k".into(),
                i: 3,
                r#type: AttributeType::Int as i32,
                ..Default::default()
            },
            AttributeProto {
                name: "pads".into(),
                ints: vec![0, 0, 1, 1],
                r#type: AttributeType::Ints as i32,
                ..Default::default()
            },
            AttributeProto {
                name: "mode".into(),
                s: b"constant".to_vec(),
                r#type: AttributeType::String as i32,
                ..Default::default()
            },
        ];
        let attrs = Attributes::from_protos(&protos).unwrap();
        assert_eq!(attrs.int("k").unwrap(), 3);
        assert_eq!(attrs.ints("pads").unwrap(), &[0, 0, 1, 1]);
        assert_eq!(attrs.string("mode").unwrap(), "constant");
    }
}
