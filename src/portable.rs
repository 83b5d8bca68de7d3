//! Process-independent value encoding.
//!
//! Everything that crosses the worker boundary, in either direction, is a
//! [`Portable`]. Conversion is fallible per value: a failure describes why
//! the value cannot travel and never aborts the surrounding snapshot or diff.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::script::{Function, FunctionDef, Namespace, RichDisplay, Value, builtins};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Portable {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    NonFinite(NonFinite),
    Str(String),
    List(Vec<Portable>),
    Tuple(Vec<Portable>),
    Dict(BTreeMap<String, Portable>),
    Display { mime: String, data: String },
    Function(Box<PortableFunction>),
    Builtin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonFinite {
    #[serde(rename = "nan")]
    Nan,
    #[serde(rename = "inf")]
    Inf,
    #[serde(rename = "-inf")]
    NegInf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableFunction {
    pub def: FunctionDef,
    pub defaults: Vec<Option<Portable>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, Portable>,
}

/// Why a value cannot cross the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot serialize {type_name}: {reason}")]
pub struct Unserializable {
    pub type_name: String,
    pub reason: String,
}

impl Unserializable {
    fn new(value: &Value, reason: impl Into<String>) -> Self {
        Self {
            type_name: value.type_name().to_string(),
            reason: reason.into(),
        }
    }
}

/// SHA-256 over the canonical JSON encoding of a [`Portable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

pub fn fingerprint(value: &Portable) -> Fingerprint {
    // Dict keys are BTreeMap-ordered, so the encoding is deterministic.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    Fingerprint(Sha256::digest(&bytes).into())
}

pub fn to_portable(value: &Value) -> Result<Portable, Unserializable> {
    Encoder::default().encode(value)
}

pub fn from_portable(value: Portable) -> Value {
    match value {
        Portable::None => Value::None,
        Portable::Bool(flag) => Value::Bool(flag),
        Portable::Int(number) => Value::Int(number),
        Portable::Float(number) => Value::Float(number),
        Portable::NonFinite(NonFinite::Nan) => Value::Float(f64::NAN),
        Portable::NonFinite(NonFinite::Inf) => Value::Float(f64::INFINITY),
        Portable::NonFinite(NonFinite::NegInf) => Value::Float(f64::NEG_INFINITY),
        Portable::Str(text) => Value::Str(text),
        Portable::List(items) => Value::list(items.into_iter().map(from_portable).collect()),
        Portable::Tuple(items) => Value::tuple(items.into_iter().map(from_portable).collect()),
        Portable::Dict(entries) => Value::dict(
            entries
                .into_iter()
                .map(|(key, value)| (key, from_portable(value)))
                .collect(),
        ),
        Portable::Display { mime, data } => Value::Rich(Rc::new(RichDisplay { mime, data })),
        Portable::Function(function) => {
            let PortableFunction {
                def,
                defaults,
                captured,
            } = *function;
            Value::Function(Rc::new(Function {
                def,
                defaults: defaults
                    .into_iter()
                    .map(|slot| slot.map(from_portable))
                    .collect(),
                captured: namespace_from_portable(captured),
            }))
        }
        Portable::Builtin(name) => builtins::lookup(&name).unwrap_or(Value::None),
    }
}

pub fn namespace_from_portable(entries: BTreeMap<String, Portable>) -> Namespace {
    entries
        .into_iter()
        .map(|(name, value)| (name, from_portable(value)))
        .collect()
}

#[derive(Default)]
struct Encoder {
    /// Containers currently being encoded, to reject cycles.
    open: Vec<usize>,
}

impl Encoder {
    fn encode(&mut self, value: &Value) -> Result<Portable, Unserializable> {
        match value {
            Value::None => Ok(Portable::None),
            Value::Bool(flag) => Ok(Portable::Bool(*flag)),
            Value::Int(number) => Ok(Portable::Int(*number)),
            Value::Float(number) => Ok(encode_float(*number)),
            Value::Str(text) => Ok(Portable::Str(text.clone())),
            Value::List(items) => {
                let items = self.nested(value, |encoder| {
                    items.borrow().iter().map(|item| encoder.encode(item)).collect()
                })?;
                Ok(Portable::List(items))
            }
            Value::Tuple(items) => {
                let items = self.nested(value, |encoder| {
                    items.iter().map(|item| encoder.encode(item)).collect()
                })?;
                Ok(Portable::Tuple(items))
            }
            Value::Dict(entries) => {
                let entries = self.nested(value, |encoder| {
                    entries
                        .borrow()
                        .iter()
                        .map(|(key, item)| Ok((key.clone(), encoder.encode(item)?)))
                        .collect()
                })?;
                Ok(Portable::Dict(entries))
            }
            Value::Rich(rich) => Ok(Portable::Display {
                mime: rich.mime.clone(),
                data: rich.data.clone(),
            }),
            Value::Function(function) => {
                let defaults = self.nested(value, |encoder| {
                    function
                        .defaults
                        .iter()
                        .map(|slot| slot.as_ref().map(|item| encoder.encode(item)).transpose())
                        .collect()
                })?;
                let captured = self.nested(value, |encoder| {
                    function
                        .captured
                        .iter()
                        .map(|(key, item)| Ok((key.clone(), encoder.encode(item)?)))
                        .collect()
                })?;
                Ok(Portable::Function(Box::new(PortableFunction {
                    def: function.def.clone(),
                    defaults,
                    captured,
                })))
            }
            Value::Builtin(name) => Ok(Portable::Builtin((*name).to_string())),
            Value::Method(_) => Err(Unserializable::new(
                value,
                "bound methods cannot be serialized",
            )),
            Value::Module(kind) => Err(Unserializable::new(
                value,
                format!("module '{}' cannot be serialized", kind.name()),
            )),
            Value::Iterator(_) => Err(Unserializable::new(
                value,
                "iterator state cannot be serialized",
            )),
            Value::Exception(exc) => Err(Unserializable::new(
                value,
                format!("{} instances cannot be serialized", exc.kind),
            )),
        }
    }

    fn nested<T>(
        &mut self,
        container: &Value,
        encode: impl FnOnce(&mut Self) -> Result<T, Unserializable>,
    ) -> Result<T, Unserializable> {
        let id = container.identity().unwrap_or(0);
        if self.open.contains(&id) {
            return Err(Unserializable::new(
                container,
                "self-referencing container cannot be serialized",
            ));
        }
        self.open.push(id);
        let result = encode(self).map_err(|inner| Unserializable {
            type_name: container.type_name().to_string(),
            reason: format!("contains {}: {}", inner.type_name, inner.reason),
        });
        self.open.pop();
        result
    }
}

fn encode_float(number: f64) -> Portable {
    if number.is_nan() {
        Portable::NonFinite(NonFinite::Nan)
    } else if number.is_infinite() && number > 0.0 {
        Portable::NonFinite(NonFinite::Inf)
    } else if number.is_infinite() {
        Portable::NonFinite(NonFinite::NegInf)
    } else {
        Portable::Float(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterator_inside_list_is_unserializable_with_nested_reason() {
        let iter = Value::Iterator(Rc::new(std::cell::RefCell::new(Default::default())));
        let value = Value::list(vec![Value::Int(1), iter]);
        let err = to_portable(&value).unwrap_err();
        assert_eq!(err.type_name, "list");
        assert!(err.reason.contains("iterator"), "{}", err.reason);
    }

    #[test]
    fn self_referencing_list_is_rejected() {
        let value = Value::list(Vec::new());
        if let Value::List(items) = &value {
            items.borrow_mut().push(value.clone());
        }
        let err = to_portable(&value).unwrap_err();
        assert!(err.reason.contains("self-referencing"), "{}", err.reason);
    }

    #[test]
    fn shared_but_acyclic_lists_are_accepted() {
        let inner = Value::list(vec![Value::Int(1)]);
        let outer = Value::list(vec![inner.clone(), inner]);
        assert!(to_portable(&outer).is_ok());
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let portable = to_portable(&Value::Float(f64::NEG_INFINITY)).expect("portable");
        let json = serde_json::to_string(&portable).expect("json");
        assert_eq!(json, r#"{"kind":"non_finite","value":"-inf"}"#);
        let decoded: Portable = serde_json::from_str(&json).expect("decode");
        let Value::Float(number) = from_portable(decoded) else {
            panic!("expected float");
        };
        assert!(number.is_infinite() && number < 0.0);
    }

    #[test]
    fn fingerprint_tracks_content_not_identity() {
        let a = to_portable(&Value::list(vec![Value::Int(1)])).expect("portable");
        let b = to_portable(&Value::list(vec![Value::Int(1)])).expect("portable");
        let c = to_portable(&Value::list(vec![Value::Int(2)])).expect("portable");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }
}
