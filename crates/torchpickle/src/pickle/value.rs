use std::{
    any::Any,
    cell::{Ref, RefCell},
    collections::{HashMap, HashSet},
    fmt,
    rc::Rc,
};

use crate::array::Array;

use super::error::UnpickleError;

/// Everything the opcode machine can push on its stack.
///
/// Containers are reference-counted so that a memoized value and the copy
/// still being mutated on the stack stay aliased; cloning a Value is cheap
/// and never deep. Conversion back to a typed payload goes through the
/// explicit `as_*` accessors, which answer present-or-absent and never
/// coerce.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<HashMap<DictKey, Value>>>),
    Set(Rc<RefCell<HashSet<DictKey>>>),
    /// Stack sentinel delimiting variable-length opcode arguments. Never
    /// part of a finished value graph.
    Mark,
    Object(Rc<RefCell<Object>>),
    /// Escape hatch for opaque host values passed through unchanged, such
    /// as out-of-band buffers.
    Any(Rc<dyn Any>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: HashMap<DictKey, Value>) -> Value {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn set(items: HashSet<DictKey>) -> Value {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn object(
        tag: impl Into<String>,
        payload: Payload,
    ) -> Value {
        Value::Object(Rc::new(RefCell::new(Object::new(tag, payload))))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Rc<RefCell<Vec<Value>>>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Rc<RefCell<HashMap<DictKey, Value>>>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Rc<RefCell<HashSet<DictKey>>>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<RefCell<Object>>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Looks up a string key in a Dict value.
    pub fn get(
        &self,
        key: &str,
    ) -> Option<Value> {
        let dict = self.as_dict()?;
        let found = dict.borrow().get(&DictKey::String(key.to_string())).cloned();
        found
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Mark => "mark",
            Value::Object(_) => "object",
            Value::Any(_) => "any",
        }
    }

    /// Structural walk checking that no Mark sentinel leaked into a
    /// finished value graph.
    pub fn contains_mark(&self) -> bool {
        match self {
            Value::Mark => true,
            Value::List(items) => {
                items.borrow().iter().any(Value::contains_mark)
            },
            Value::Tuple(items) => items.iter().any(Value::contains_mark),
            Value::Dict(entries) => {
                entries.borrow().values().any(Value::contains_mark)
            },
            Value::Object(object) => match object.borrow().payload() {
                Payload::Value(inner) => inner.contains_mark(),
                _ => false,
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::List(l) => write!(f, "List({:?})", l.borrow()),
            Value::Tuple(t) => write!(f, "Tuple({t:?})"),
            Value::Dict(d) => write!(f, "Dict({:?})", d.borrow()),
            Value::Set(s) => write!(f, "Set({:?})", s.borrow()),
            Value::Mark => write!(f, "Mark"),
            Value::Object(o) => write!(f, "{:?}", o.borrow()),
            Value::Any(_) => write!(f, "Any(<opaque>)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(
        &self,
        other: &Value,
    ) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            },
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            },
            (Value::Set(a), Value::Set(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            },
            (Value::Mark, Value::Mark) => true,
            (Value::Object(a), Value::Object(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            },
            (Value::Any(a), Value::Any(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The hashable subset of [`Value`], used for dict keys and set members.
///
/// Floats, containers and objects are not hashable on the host side;
/// converting one fails rather than coercing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    pub fn to_value(&self) -> Value {
        match self {
            DictKey::None => Value::None,
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Int(i) => Value::Int(*i),
            DictKey::String(s) => Value::String(s.clone()),
            DictKey::Bytes(b) => Value::Bytes(b.clone()),
            DictKey::Tuple(items) => {
                Value::tuple(items.iter().map(DictKey::to_value).collect())
            },
        }
    }
}

impl TryFrom<Value> for DictKey {
    type Error = UnpickleError;

    fn try_from(value: Value) -> Result<Self, UnpickleError> {
        match value {
            Value::None => Ok(DictKey::None),
            Value::Bool(b) => Ok(DictKey::Bool(b)),
            Value::Int(i) => Ok(DictKey::Int(i)),
            Value::String(s) => Ok(DictKey::String(s)),
            Value::Bytes(b) => Ok(DictKey::Bytes(b)),
            Value::Tuple(items) => {
                let keys = items
                    .iter()
                    .cloned()
                    .map(DictKey::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DictKey::Tuple(keys))
            },
            other => Err(UnpickleError::malformed(format!(
                "value of type {} is not hashable",
                other.type_name()
            ))),
        }
    }
}

/// A reconstructed foreign object: an opaque payload plus the symbolic tag
/// naming its host-side variant.
#[derive(Debug, PartialEq)]
pub struct Object {
    tag: String,
    payload: Payload,
}

impl Object {
    pub fn new(
        tag: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            tag: tag.into(),
            payload,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn set_payload(
        &mut self,
        payload: Payload,
    ) {
        self.payload = payload;
    }

    pub fn tensor(&self) -> Option<&Array> {
        match &self.payload {
            Payload::Tensor(array) => Some(array),
            _ => None,
        }
    }

    pub fn storage_bytes(&self) -> Option<&Rc<Vec<u8>>> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// What an instantiator put inside an [`Object`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A bare class reference or a not-yet-initialized instance.
    Empty,
    /// Raw storage contents, filled in by the persistent-load callback.
    Bytes(Rc<Vec<u8>>),
    /// A host numerical array.
    Tensor(Array),
    /// Reconstructed state for dict-tagged and custom objects.
    Value(Value),
}

/// Borrows the Object behind a Value, for read-side convenience.
pub fn borrow_object(value: &Value) -> Option<Ref<'_, Object>> {
    match value {
        Value::Object(cell) => Some(cell.borrow()),
        _ => None,
    }
}
