use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    sync::{Arc, LazyLock, RwLock},
};

use crate::{
    array::{size_for_shape, Array},
    data_type::DataType,
};

use super::{
    error::UnpickleError,
    value::{DictKey, Payload, Value},
};

/// Separator between a module path and a class name in fully-qualified
/// lookups, e.g. `collections` + `.` + `OrderedDict`.
pub const MODULE_DIVIDER: &str = ".";

pub type CreateFn = Box<dyn Fn(&str) -> Value + Send + Sync>;
pub type InitializeFn =
    Box<dyn Fn(Value, Value) -> Result<Value, UnpickleError> + Send + Sync>;

/// One registry entry: how to manufacture and initialize host objects for a
/// set of foreign classes.
///
/// `create` receives the class name (or type tag) it was looked up under and
/// returns an empty host object. `initialize` applies reduction arguments or
/// saved state and returns a possibly-new object; implementations that
/// mutate in place return their input so memoized references stay aliased.
pub struct Instantiator {
    classes: Vec<String>,
    tags: Vec<String>,
    create: CreateFn,
    initialize: InitializeFn,
}

impl Instantiator {
    pub fn new(
        classes: &[&str],
        tags: &[&str],
        create: impl Fn(&str) -> Value + Send + Sync + 'static,
        initialize: impl Fn(Value, Value) -> Result<Value, UnpickleError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            classes: classes.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            create: Box::new(create),
            initialize: Box::new(initialize),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_class: HashMap<String, Arc<Instantiator>>,
    by_tag: HashMap<String, Arc<Instantiator>>,
}

impl RegistryInner {
    fn insert(
        &mut self,
        handler: Instantiator,
    ) {
        let handler = Arc::new(handler);
        for class in &handler.classes {
            self.by_class.insert(class.clone(), handler.clone());
        }
        for tag in &handler.tags {
            self.by_tag.insert(tag.clone(), handler.clone());
        }
    }

    fn with_builtins() -> Self {
        let mut inner = RegistryInner::default();
        inner.insert(tensor_handler());
        inner.insert(storage_handler());
        inner.insert(ordered_dict_handler());
        inner
    }
}

static REGISTRY: LazyLock<RwLock<RegistryInner>> =
    LazyLock::new(|| RwLock::new(RegistryInner::with_builtins()));

/// Process-wide catalogue of instantiators, keyed both by fully-qualified
/// foreign class name and by the type tag of the objects they produce.
///
/// Entries are installed at startup and read during loads; callers that
/// mutate the registry while loads are in flight are responsible for
/// serializing the two.
pub struct InstantiatorRegistry;

impl InstantiatorRegistry {
    /// Installs a handler. Re-adding a class or tag overwrites the previous
    /// owner of that key.
    pub fn add(handler: Instantiator) {
        let mut inner =
            REGISTRY.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.insert(handler);
    }

    /// Manufactures an empty object for `module` + divider + `class`, or
    /// `None` when the fully-qualified name is not registered.
    pub fn create(
        module: &str,
        class: &str,
    ) -> Option<Value> {
        let qualified = format!("{module}{MODULE_DIVIDER}{class}");
        let handler = {
            let inner = REGISTRY
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.by_class.get(&qualified).cloned()
        }?;
        Some((handler.create)(class))
    }

    /// Creates a fresh object for `tag` and initializes it with
    /// `arguments`: the reduction path.
    pub fn construct(
        tag: &str,
        arguments: Value,
    ) -> Result<Value, UnpickleError> {
        let handler = {
            let inner = REGISTRY
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.by_tag.get(tag).cloned()
        }
        .ok_or(UnpickleError::ClassCouldNotBeInstantiated)?;
        let fresh = (handler.create)(tag);
        (handler.initialize)(fresh, arguments)
    }

    /// Runs the initializer registered for `tag` against an existing
    /// object: the state-restoration path. `None` when the tag is
    /// unregistered, leaving the fallback decision to the caller.
    pub fn initialize(
        tag: &str,
        object: Value,
        arguments: Value,
    ) -> Option<Result<Value, UnpickleError>> {
        let handler = {
            let inner = REGISTRY
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.by_tag.get(tag).cloned()
        }?;
        Some((handler.initialize)(object, arguments))
    }
}

const STORAGE_CLASSES: &[&str] = &[
    "DoubleStorage",
    "FloatStorage",
    "HalfStorage",
    "LongStorage",
    "IntStorage",
    "ShortStorage",
    "CharStorage",
    "ByteStorage",
    "BoolStorage",
    "BFloat16Storage",
    "ComplexFloatStorage",
    "CompleteFloatStorage",
];

fn storage_handler() -> Instantiator {
    let classes: Vec<String> = STORAGE_CLASSES
        .iter()
        .map(|name| format!("torch{MODULE_DIVIDER}{name}"))
        .collect();
    let class_refs: Vec<&str> = classes.iter().map(String::as_str).collect();
    Instantiator::new(
        &class_refs,
        STORAGE_CLASSES,
        |name| Value::object(name, Payload::Bytes(Rc::new(Vec::new()))),
        // Storages are populated by the persistent-load callback, not by
        // construction arguments.
        |object, _arguments| Ok(object),
    )
}

fn tensor_handler() -> Instantiator {
    Instantiator::new(
        &["torch._utils._rebuild_tensor_v2"],
        &["Tensor"],
        |_| Value::object("Tensor", Payload::Empty),
        rebuild_tensor,
    )
}

/// `(storage, storage_offset, shape, stride, requires_grad, hooks, …)` →
/// a Tensor object. Stride, the grad flag and the hooks are discarded; the
/// host array is contiguous.
fn rebuild_tensor(
    _object: Value,
    arguments: Value,
) -> Result<Value, UnpickleError> {
    let Value::Tuple(args) = &arguments else {
        return Err(UnpickleError::malformed(
            "tensor rebuild arguments must be a tuple",
        ));
    };
    if args.len() < 3 {
        return Err(UnpickleError::malformed(format!(
            "tensor rebuild takes at least 3 arguments, got {}",
            args.len()
        )));
    }

    let storage_cell = args[0].as_object().ok_or_else(|| {
        UnpickleError::malformed("tensor rebuild expects a storage object")
    })?;
    let storage = storage_cell.borrow();
    let data_type =
        DataType::from_storage_class(storage.tag()).ok_or_else(|| {
            UnpickleError::malformed(format!(
                "unsupported storage class {}",
                storage.tag()
            ))
        })?;
    let bytes = storage.storage_bytes().ok_or_else(|| {
        UnpickleError::malformed("storage object carries no byte payload")
    })?;

    let offset = args[1].as_int().ok_or_else(|| {
        UnpickleError::malformed("storage offset must be an integer")
    })?;
    if offset < 0 {
        return Err(UnpickleError::malformed("storage offset is negative"));
    }
    let shape = shape_of(&args[2])?;

    let begin = offset as usize * data_type.size_in_bytes();
    let needed = size_for_shape(&shape, data_type);
    if begin + needed > bytes.len() {
        return Err(UnpickleError::malformed(format!(
            "storage of {} bytes is too small for shape {:?} of {:?} at \
            element offset {offset}",
            bytes.len(),
            shape,
            data_type
        )));
    }

    let array =
        Array::from_bytes(bytes[begin..begin + needed].to_vec(), &shape, data_type)
            .map_err(|e| UnpickleError::malformed(e.to_string()))?;
    Ok(Value::object("Tensor", Payload::Tensor(array)))
}

fn shape_of(value: &Value) -> Result<Vec<usize>, UnpickleError> {
    let dims = value.as_tuple().ok_or_else(|| {
        UnpickleError::malformed("tensor shape must be a tuple")
    })?;
    dims.iter()
        .map(|dim| {
            dim.as_int()
                .filter(|d| *d >= 0)
                .map(|d| d as usize)
                .ok_or_else(|| {
                    UnpickleError::malformed(
                        "tensor dimensions must be nonnegative integers",
                    )
                })
        })
        .collect()
}

fn ordered_dict_handler() -> Instantiator {
    Instantiator::new(
        &["collections.OrderedDict"],
        &["Dict"],
        |_| Value::object("Dict", Payload::Value(Value::dict(HashMap::new()))),
        init_mapping,
    )
}

/// Applies constructor arguments or saved state to a dict-tagged object:
/// a sequence of 2-item sequences is inserted pairwise, a dict is merged.
/// Mutates in place and returns the same object.
fn init_mapping(
    object: Value,
    arguments: Value,
) -> Result<Value, UnpickleError> {
    let dict = {
        let cell = object.as_object().ok_or_else(|| {
            UnpickleError::malformed("mapping initializer expects an object")
        })?;
        let mut inner = cell.borrow_mut();
        let existing = match inner.payload() {
            Payload::Value(Value::Dict(dict)) => Some(dict.clone()),
            Payload::Empty => None,
            _ => {
                return Err(UnpickleError::malformed(
                    "mapping object holds a non-dict payload",
                ))
            },
        };
        match existing {
            Some(dict) => dict,
            None => {
                let dict = Rc::new(RefCell::new(HashMap::new()));
                inner.set_payload(Payload::Value(Value::Dict(dict.clone())));
                dict
            },
        }
    };
    insert_entries(&dict, &arguments)?;
    Ok(object)
}

fn insert_entries(
    dict: &Rc<RefCell<HashMap<DictKey, Value>>>,
    value: &Value,
) -> Result<(), UnpickleError> {
    match value {
        Value::None => Ok(()),
        Value::Dict(entries) => {
            let mut target = dict.borrow_mut();
            for (key, item) in entries.borrow().iter() {
                target.insert(key.clone(), item.clone());
            }
            Ok(())
        },
        Value::Tuple(args) => match args.len() {
            0 => Ok(()),
            1 => insert_entries(dict, &args[0]),
            n => Err(UnpickleError::malformed(format!(
                "mapping constructor takes at most one argument, got {n}"
            ))),
        },
        Value::List(items) => {
            for item in items.borrow().iter() {
                insert_pair(dict, item)?;
            }
            Ok(())
        },
        other => Err(UnpickleError::malformed(format!(
            "cannot build a mapping from a value of type {}",
            other.type_name()
        ))),
    }
}

fn insert_pair(
    dict: &Rc<RefCell<HashMap<DictKey, Value>>>,
    pair: &Value,
) -> Result<(), UnpickleError> {
    let items: Vec<Value> = match pair {
        Value::Tuple(items) => items.as_ref().clone(),
        Value::List(items) => items.borrow().clone(),
        other => {
            return Err(UnpickleError::malformed(format!(
                "mapping entry must be a 2-item sequence, found {}",
                other.type_name()
            )))
        },
    };
    if items.len() != 2 {
        return Err(UnpickleError::malformed(format!(
            "mapping entry must have exactly 2 items, found {}",
            items.len()
        )));
    }
    let key = DictKey::try_from(items[0].clone())?;
    dict.borrow_mut().insert(key, items[1].clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_create_is_tagged_and_empty() {
        let value = InstantiatorRegistry::create("torch", "FloatStorage")
            .expect("builtin storage class");
        let object = value.as_object().unwrap().borrow();
        assert_eq!(object.tag(), "FloatStorage");
        assert_eq!(object.storage_bytes().unwrap().len(), 0);
    }

    #[test]
    fn test_unregistered_class_is_absent() {
        assert!(InstantiatorRegistry::create("torch", "QInt8Storage").is_none());
    }

    #[test]
    fn test_ordered_dict_construct_from_pairs() {
        let pairs = Value::list(vec![
            Value::tuple(vec![Value::String("a".into()), Value::Int(1)]),
            Value::tuple(vec![Value::String("b".into()), Value::Int(2)]),
        ]);
        let value =
            InstantiatorRegistry::construct("Dict", Value::tuple(vec![pairs]))
                .unwrap();
        let object = value.as_object().unwrap().borrow();
        let state = object.state().unwrap();
        assert_eq!(state.get("a"), Some(Value::Int(1)));
        assert_eq!(state.get("b"), Some(Value::Int(2)));
    }

    #[test]
    fn test_rebuild_tensor_from_storage_bytes() {
        let bytes: Vec<u8> = (0..24).collect();
        let storage = Value::object(
            "ByteStorage",
            Payload::Bytes(Rc::new(bytes)),
        );
        let arguments = Value::tuple(vec![
            storage,
            Value::Int(0),
            Value::tuple(vec![Value::Int(4), Value::Int(6)]),
            Value::tuple(vec![Value::Int(6), Value::Int(1)]),
            Value::Bool(false),
            Value::None,
        ]);
        let value =
            InstantiatorRegistry::construct("Tensor", arguments).unwrap();
        let object = value.as_object().unwrap().borrow();
        let tensor = object.tensor().unwrap();
        assert_eq!(tensor.shape(), &[4, 6]);
        assert_eq!(tensor.data_type(), DataType::U8);
        assert_eq!(tensor.as_slice::<u8>()[7], 7);
    }

    #[test]
    fn test_rebuild_tensor_applies_element_offset() {
        let bytes: Vec<u8> = (0..8).collect();
        let storage =
            Value::object("ByteStorage", Payload::Bytes(Rc::new(bytes)));
        let arguments = Value::tuple(vec![
            storage,
            Value::Int(4),
            Value::tuple(vec![Value::Int(4)]),
        ]);
        let value =
            InstantiatorRegistry::construct("Tensor", arguments).unwrap();
        let object = value.as_object().unwrap().borrow();
        assert_eq!(object.tensor().unwrap().as_slice::<u8>(), &[4, 5, 6, 7]);
    }

    #[test]
    fn test_rebuild_tensor_rejects_short_storage() {
        let storage = Value::object(
            "FloatStorage",
            Payload::Bytes(Rc::new(vec![0u8; 8])),
        );
        let arguments = Value::tuple(vec![
            storage,
            Value::Int(0),
            Value::tuple(vec![Value::Int(100)]),
        ]);
        assert!(matches!(
            InstantiatorRegistry::construct("Tensor", arguments),
            Err(UnpickleError::Malformed(_))
        ));
    }
}
