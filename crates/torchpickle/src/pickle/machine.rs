use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::{Rc, Weak},
};

use tracing::{debug, warn};

use super::{
    error::UnpickleError,
    instantiate::InstantiatorRegistry,
    opcode::Opcode,
    reader::{ByteSource, Unframer},
    value::{DictKey, Value},
};

/// How the legacy 8-bit string opcodes decode their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringEncoding {
    /// Payload must be pure ASCII.
    #[default]
    Ascii,
    /// Payload is decoded as UTF-8.
    Utf8,
    /// Payload is rendered as lowercase hex text.
    BytesHex,
}

/// Resolves persistent-id records into values, typically by fetching tensor
/// storage bytes from the surrounding archive.
///
/// The machine holds this by weak reference: the archive reader that owns
/// the callback also consumes the machine's output, and the relation must
/// not own it back.
pub trait PersistentLoad {
    fn persistent_load(
        &self,
        pid: Value,
    ) -> Result<Value, UnpickleError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MachineState {
    Fresh,
    Running,
    Terminated,
}

/// The opcode machine. One instance decodes one stream, once.
///
/// `load` drives the dispatch loop until STOP and returns the value left on
/// the stack. Any error, and STOP itself, leaves the machine terminated;
/// further `load` calls are refused. All per-load state (stack, metastack,
/// memo) lives on the instance, so decoding a new stream means building a
/// new machine.
pub struct Unpickler<S: ByteSource> {
    reader: Unframer<S>,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: HashMap<usize, Value>,
    extensions: HashMap<i64, (String, String)>,
    proto: u8,
    string_encoding: StringEncoding,
    persistent_load: Option<Weak<dyn PersistentLoad>>,
    buffers: Option<std::vec::IntoIter<Value>>,
    state: MachineState,
}

impl<S: ByteSource> Unpickler<S> {
    pub fn new(source: S) -> Self {
        Self {
            reader: Unframer::new(source),
            stack: Vec::with_capacity(32),
            metastack: Vec::new(),
            memo: HashMap::new(),
            extensions: HashMap::new(),
            proto: 0,
            string_encoding: StringEncoding::default(),
            persistent_load: None,
            buffers: None,
            state: MachineState::Fresh,
        }
    }

    pub fn with_string_encoding(
        mut self,
        encoding: StringEncoding,
    ) -> Self {
        self.string_encoding = encoding;
        self
    }

    pub fn with_persistent_load(
        mut self,
        callback: Weak<dyn PersistentLoad>,
    ) -> Self {
        self.persistent_load = Some(callback);
        self
    }

    /// Supplies values for `NEXT_BUFFER`, in stream order.
    pub fn with_buffers(
        mut self,
        buffers: Vec<Value>,
    ) -> Self {
        self.buffers = Some(buffers.into_iter());
        self
    }

    /// Maps an extension code to the (module, class) pair it stands for.
    pub fn register_extension(
        &mut self,
        code: i64,
        module: &str,
        class: &str,
    ) {
        self.extensions
            .insert(code, (module.to_string(), class.to_string()));
    }

    pub fn protocol(&self) -> u8 {
        self.proto
    }

    /// Consumes opcodes until STOP and returns the final value. One-shot:
    /// whatever the outcome, the machine ends up terminated.
    pub fn load(&mut self) -> Result<Value, UnpickleError> {
        if self.state == MachineState::Terminated {
            return Err(UnpickleError::malformed(
                "load called on a terminated machine",
            ));
        }
        let result = self.run();
        self.state = MachineState::Terminated;
        result
    }

    fn run(&mut self) -> Result<Value, UnpickleError> {
        loop {
            let byte = self.read_byte()?;
            if self.state == MachineState::Fresh {
                self.state = MachineState::Running;
            }
            match Opcode::from_u8(byte)? {
                // Protocol & framing
                Opcode::Proto => {
                    let version = self.read_byte()?;
                    if version > 5 {
                        return Err(UnpickleError::UnsupportedProtocol(
                            version,
                        ));
                    }
                    self.proto = version;
                },
                Opcode::Frame => {
                    let size = checked_len(self.read_u64_le()?)?;
                    self.reader.load_frame(size)?;
                },

                // Primitives
                Opcode::None => self.stack.push(Value::None),
                Opcode::NewTrue => self.stack.push(Value::Bool(true)),
                Opcode::NewFalse => self.stack.push(Value::Bool(false)),
                Opcode::Int => {
                    let value = self.parse_int_line()?;
                    self.stack.push(value);
                },
                Opcode::BinInt => {
                    let value = self.read_i32_le()?;
                    self.stack.push(Value::Int(value as i64));
                },
                Opcode::BinInt1 => {
                    let value = self.read_byte()?;
                    self.stack.push(Value::Int(value as i64));
                },
                Opcode::BinInt2 => {
                    let value = self.read_u16_le()?;
                    self.stack.push(Value::Int(value as i64));
                },
                Opcode::Long => {
                    let value = self.parse_long_line()?;
                    self.stack.push(Value::Int(value));
                },
                Opcode::Long1 => {
                    let count = self.read_byte()? as usize;
                    let data = self.reader.read_exact(count)?;
                    self.stack.push(Value::Int(decode_long(&data)?));
                },
                Opcode::Long4 => {
                    let count = self.read_i32_le()?;
                    if count < 0 {
                        return Err(UnpickleError::NegativeByteCount);
                    }
                    let data = self.reader.read_exact(count as usize)?;
                    self.stack.push(Value::Int(decode_long(&data)?));
                },
                Opcode::Float => {
                    let line = self.read_text_line()?;
                    let value = line.parse::<f64>().map_err(|_| {
                        UnpickleError::malformed(format!(
                            "invalid float literal {line:?}"
                        ))
                    })?;
                    self.stack.push(Value::Float(value));
                },
                Opcode::BinFloat => {
                    let data = self.reader.read_exact(8)?;
                    let bits = u64::from_be_bytes(
                        data.try_into().expect("read_exact returned 8 bytes"),
                    );
                    self.stack.push(Value::Float(f64::from_bits(bits)));
                },

                // Strings & bytes
                Opcode::String => {
                    let value = self.parse_quoted_string_line()?;
                    self.stack.push(value);
                },
                Opcode::BinString => {
                    let count = self.read_i32_le()?;
                    if count < 0 {
                        return Err(UnpickleError::NegativeByteCount);
                    }
                    let data = self.reader.read_exact(count as usize)?;
                    let value = self.decode_legacy_string(&data)?;
                    self.stack.push(value);
                },
                Opcode::ShortBinString => {
                    let count = self.read_byte()? as usize;
                    let data = self.reader.read_exact(count)?;
                    let value = self.decode_legacy_string(&data)?;
                    self.stack.push(value);
                },
                Opcode::Unicode => {
                    let line = self.read_line_terminated()?;
                    let text = decode_raw_unicode_escape(&line)?;
                    self.stack.push(Value::String(text));
                },
                Opcode::BinUnicode => {
                    let count = self.read_u32_le()? as usize;
                    let value = self.read_utf8(count)?;
                    self.stack.push(value);
                },
                Opcode::ShortBinUnicode => {
                    let count = self.read_byte()? as usize;
                    let value = self.read_utf8(count)?;
                    self.stack.push(value);
                },
                Opcode::BinUnicode8 => {
                    let count = checked_len(self.read_u64_le()?)?;
                    let value = self.read_utf8(count)?;
                    self.stack.push(value);
                },
                Opcode::BinBytes => {
                    let count = self.read_u32_le()? as usize;
                    let data = self.reader.read_exact(count)?;
                    self.stack.push(Value::Bytes(data));
                },
                Opcode::ShortBinBytes => {
                    let count = self.read_byte()? as usize;
                    let data = self.reader.read_exact(count)?;
                    self.stack.push(Value::Bytes(data));
                },
                Opcode::BinBytes8 => {
                    let count = checked_len(self.read_u64_le()?)?;
                    let data = self.reader.read_exact(count)?;
                    self.stack.push(Value::Bytes(data));
                },
                Opcode::ByteArray8 => {
                    let count = checked_len(self.read_u64_le()?)?;
                    let data = self.reader.read_exact(count)?;
                    self.stack.push(Value::Bytes(data));
                },

                // Out-of-band buffers
                Opcode::NextBuffer => {
                    let value = self.next_buffer()?;
                    self.stack.push(value);
                },
                Opcode::ReadonlyBuffer => {
                    // No mutability distinction at this layer.
                },

                // Composite builders
                Opcode::EmptyTuple => {
                    self.stack.push(Value::tuple(Vec::new()));
                },
                Opcode::EmptyList => self.stack.push(Value::list(Vec::new())),
                Opcode::EmptyDict => {
                    self.stack.push(Value::dict(HashMap::new()));
                },
                Opcode::EmptySet => self.stack.push(Value::set(HashSet::new())),
                Opcode::Tuple1 => {
                    let a = self.pop()?;
                    self.stack.push(Value::tuple(vec![a]));
                },
                Opcode::Tuple2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::tuple(vec![a, b]));
                },
                Opcode::Tuple3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::tuple(vec![a, b, c]));
                },
                Opcode::Tuple => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::tuple(items));
                },
                Opcode::List => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::list(items));
                },
                Opcode::Dict => {
                    let items = self.pop_mark()?;
                    let mut entries = HashMap::new();
                    let mut iter = items.into_iter();
                    // An odd trailing item is dropped.
                    while let (Some(key), Some(value)) =
                        (iter.next(), iter.next())
                    {
                        entries.insert(DictKey::try_from(key)?, value);
                    }
                    self.stack.push(Value::dict(entries));
                },
                Opcode::FrozenSet => {
                    let items = self.pop_mark()?;
                    let members = items
                        .into_iter()
                        .map(DictKey::try_from)
                        .collect::<Result<HashSet<_>, _>>()?;
                    self.stack.push(Value::set(members));
                },
                Opcode::Append => {
                    let value = self.pop()?;
                    self.top_list()?.borrow_mut().push(value);
                },
                Opcode::Appends => {
                    let items = self.pop_mark()?;
                    self.top_list()?.borrow_mut().extend(items);
                },
                Opcode::SetItem => {
                    let value = self.pop()?;
                    let key = DictKey::try_from(self.pop()?)?;
                    self.top_dict()?.borrow_mut().insert(key, value);
                },
                Opcode::SetItems => {
                    let items = self.pop_mark()?;
                    let dict = self.top_dict()?;
                    let mut iter = items.into_iter();
                    while let (Some(key), Some(value)) =
                        (iter.next(), iter.next())
                    {
                        dict.borrow_mut()
                            .insert(DictKey::try_from(key)?, value);
                    }
                },
                Opcode::AddItems => {
                    let items = self.pop_mark()?;
                    let set = self.top_set()?;
                    for item in items {
                        set.borrow_mut().insert(DictKey::try_from(item)?);
                    }
                },

                // Memoization
                Opcode::Get => {
                    let index = self.parse_get_index_line()?;
                    let value = self.memo_get(index)?;
                    self.stack.push(value);
                },
                Opcode::BinGet => {
                    let index = self.read_byte()? as usize;
                    let value = self.memo_get(index)?;
                    self.stack.push(value);
                },
                Opcode::LongBinGet => {
                    let index = self.read_u32_le()? as usize;
                    let value = self.memo_get(index)?;
                    self.stack.push(value);
                },
                Opcode::Put => {
                    let index = self.parse_put_index_line()?;
                    self.memo_put(index)?;
                },
                Opcode::BinPut => {
                    let index = self.read_byte()? as usize;
                    self.memo_put(index)?;
                },
                Opcode::LongBinPut => {
                    let index = self.read_u32_le()? as usize;
                    self.memo_put(index)?;
                },
                Opcode::Memoize => {
                    let index = self.memo.len();
                    self.memo_put(index)?;
                },

                // Stack discipline
                Opcode::Mark => {
                    self.metastack.push(std::mem::take(&mut self.stack));
                },
                Opcode::Pop => {
                    if self.stack.pop().is_none() {
                        self.stack =
                            self.metastack.pop().ok_or_else(|| {
                                UnpickleError::malformed(
                                    "POP on an empty stack with no mark",
                                )
                            })?;
                    }
                },
                Opcode::PopMark => {
                    self.pop_mark()?;
                },
                Opcode::Dup => {
                    let top = self.stack.last().cloned().ok_or_else(|| {
                        UnpickleError::malformed("DUP on an empty stack")
                    })?;
                    self.stack.push(top);
                },

                // Reduction and construction
                Opcode::Global => {
                    let module = self.read_text_line()?;
                    let class = self.read_text_line()?;
                    self.push_class(&module, &class);
                },
                Opcode::StackGlobal => {
                    let class = self.pop_string("STACK_GLOBAL class name")?;
                    let module = self.pop_string("STACK_GLOBAL module")?;
                    self.push_class(&module, &class);
                },
                Opcode::Ext1 => {
                    let code = self.read_byte()? as i64;
                    self.push_extension(code)?;
                },
                Opcode::Ext2 => {
                    let code = self.read_u16_le()? as i64;
                    self.push_extension(code)?;
                },
                Opcode::Ext4 => {
                    let code = self.read_i32_le()? as i64;
                    self.push_extension(code)?;
                },
                Opcode::Reduce => {
                    let arguments = self.pop()?;
                    let callable = self.pop()?;
                    let value = self.instantiate(callable, arguments)?;
                    self.stack.push(value);
                },
                Opcode::NewObj => {
                    let arguments = self.pop()?;
                    let class = self.pop()?;
                    let value = self.instantiate(class, arguments)?;
                    self.stack.push(value);
                },
                Opcode::NewObjEx => {
                    let kwargs = self.pop()?;
                    let arguments = self.pop()?;
                    let class = self.pop()?;
                    if let Some(entries) = kwargs.as_dict() {
                        if !entries.borrow().is_empty() {
                            return Err(UnpickleError::malformed(
                                "keyword arguments in object construction \
                                are not supported",
                            ));
                        }
                    }
                    let value = self.instantiate(class, arguments)?;
                    self.stack.push(value);
                },
                Opcode::Inst => {
                    let module = self.read_text_line()?;
                    let class = self.read_text_line()?;
                    let arguments = Value::tuple(self.pop_mark()?);
                    let classref = InstantiatorRegistry::create(
                        &module, &class,
                    )
                    .ok_or(UnpickleError::ClassCouldNotBeInstantiated)?;
                    let value = self.instantiate(classref, arguments)?;
                    self.stack.push(value);
                },
                Opcode::Obj => {
                    let mut items = self.pop_mark()?.into_iter();
                    let classref = items.next().ok_or_else(|| {
                        UnpickleError::malformed(
                            "OBJ with an empty argument group",
                        )
                    })?;
                    let arguments = Value::tuple(items.collect());
                    let value = self.instantiate(classref, arguments)?;
                    self.stack.push(value);
                },
                Opcode::Build => {
                    let state = self.pop()?;
                    let object = self.pop()?;
                    let value = self.build(object, state)?;
                    self.stack.push(value);
                },

                // Persistent IDs
                Opcode::PersId => {
                    let pid = Value::String(self.read_text_line()?);
                    let value = self.call_persistent(pid)?;
                    self.stack.push(value);
                },
                Opcode::BinPersId => {
                    let pid = self.pop()?;
                    let value = self.call_persistent(pid)?;
                    self.stack.push(value);
                },

                // Termination
                Opcode::Stop => {
                    let value = self.pop()?;
                    if !self.stack.is_empty() || !self.metastack.is_empty() {
                        return Err(UnpickleError::malformed(format!(
                            "{} value(s) left behind after STOP",
                            self.stack.len()
                                + self
                                    .metastack
                                    .iter()
                                    .map(Vec::len)
                                    .sum::<usize>()
                        )));
                    }
                    return Ok(value);
                },
            }
        }
    }

    // Stack helpers

    fn pop(&mut self) -> Result<Value, UnpickleError> {
        self.stack.pop().ok_or_else(|| {
            UnpickleError::malformed("pop from an empty stack")
        })
    }

    fn pop_string(
        &mut self,
        what: &str,
    ) -> Result<String, UnpickleError> {
        match self.pop()? {
            Value::String(s) => Ok(s),
            other => Err(UnpickleError::malformed(format!(
                "{what} must be a string, found {}",
                other.type_name()
            ))),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, UnpickleError> {
        let below = self.metastack.pop().ok_or_else(|| {
            UnpickleError::malformed("no mark on the stack")
        })?;
        Ok(std::mem::replace(&mut self.stack, below))
    }

    fn top_list(
        &self
    ) -> Result<Rc<RefCell<Vec<Value>>>, UnpickleError> {
        match self.stack.last() {
            Some(Value::List(items)) => Ok(items.clone()),
            Some(other) => Err(UnpickleError::malformed(format!(
                "expected a list on the stack, found {}",
                other.type_name()
            ))),
            None => Err(UnpickleError::malformed(
                "list operation on an empty stack",
            )),
        }
    }

    fn top_dict(
        &self
    ) -> Result<Rc<RefCell<HashMap<DictKey, Value>>>, UnpickleError> {
        match self.stack.last() {
            Some(Value::Dict(entries)) => Ok(entries.clone()),
            Some(other) => Err(UnpickleError::malformed(format!(
                "expected a dict on the stack, found {}",
                other.type_name()
            ))),
            None => Err(UnpickleError::malformed(
                "dict operation on an empty stack",
            )),
        }
    }

    fn top_set(
        &self
    ) -> Result<Rc<RefCell<HashSet<DictKey>>>, UnpickleError> {
        match self.stack.last() {
            Some(Value::Set(members)) => Ok(members.clone()),
            Some(other) => Err(UnpickleError::malformed(format!(
                "expected a set on the stack, found {}",
                other.type_name()
            ))),
            None => Err(UnpickleError::malformed(
                "set operation on an empty stack",
            )),
        }
    }

    // Memo helpers

    fn memo_get(
        &self,
        index: usize,
    ) -> Result<Value, UnpickleError> {
        self.memo
            .get(&index)
            .cloned()
            .ok_or(UnpickleError::MemoNotFound(index as i64))
    }

    fn memo_put(
        &mut self,
        index: usize,
    ) -> Result<(), UnpickleError> {
        let top = self.stack.last().cloned().ok_or_else(|| {
            UnpickleError::malformed("memo store on an empty stack")
        })?;
        self.memo.insert(index, top);
        Ok(())
    }

    // Registry paths

    fn push_class(
        &mut self,
        module: &str,
        class: &str,
    ) {
        match InstantiatorRegistry::create(module, class) {
            Some(value) => self.stack.push(value),
            None => {
                debug!(module, class, "unregistered class reference");
                self.stack.push(Value::None);
            },
        }
    }

    fn push_extension(
        &mut self,
        code: i64,
    ) -> Result<(), UnpickleError> {
        let (module, class) = self
            .extensions
            .get(&code)
            .cloned()
            .ok_or(UnpickleError::UnregisteredExtension(code))?;
        self.push_class(&module, &class);
        Ok(())
    }

    fn instantiate(
        &self,
        callable: Value,
        arguments: Value,
    ) -> Result<Value, UnpickleError> {
        let object = callable
            .as_object()
            .ok_or(UnpickleError::ClassCouldNotBeInstantiated)?;
        let tag = object.borrow().tag().to_string();
        InstantiatorRegistry::construct(&tag, arguments)
    }

    fn build(
        &self,
        object: Value,
        state: Value,
    ) -> Result<Value, UnpickleError> {
        if let Some(cell) = object.as_object() {
            let tag = cell.borrow().tag().to_string();
            if let Some(result) =
                InstantiatorRegistry::initialize(&tag, object.clone(), state.clone())
            {
                return result;
            }
        }
        self.build_fallback(object, state)
    }

    /// Merges a dict state into a dict-shaped object when no initializer is
    /// registered: ordinary attribute-dict restoration.
    fn build_fallback(
        &self,
        object: Value,
        state: Value,
    ) -> Result<Value, UnpickleError> {
        let target = match &object {
            Value::Dict(entries) => entries.clone(),
            Value::Object(cell) => match cell.borrow().state() {
                Some(Value::Dict(entries)) => entries.clone(),
                _ => {
                    return Err(UnpickleError::malformed(format!(
                        "no initializer for objects tagged {:?} and the \
                        target is not a dict",
                        cell.borrow().tag()
                    )))
                },
            },
            other => {
                return Err(UnpickleError::malformed(format!(
                    "state restoration on a value of type {}",
                    other.type_name()
                )))
            },
        };
        let source = state.as_dict().ok_or_else(|| {
            UnpickleError::malformed(format!(
                "state for a dict merge must be a dict, found {}",
                state.type_name()
            ))
        })?;
        warn!("no registered initializer; merging state into a dict");
        {
            let mut target = target.borrow_mut();
            for (key, value) in source.borrow().iter() {
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(object)
    }

    fn call_persistent(
        &mut self,
        pid: Value,
    ) -> Result<Value, UnpickleError> {
        match self.persistent_load.as_ref().and_then(Weak::upgrade) {
            Some(callback) => callback.persistent_load(pid),
            None => {
                warn!(
                    "persistent id with no loader installed; substituting None"
                );
                Ok(Value::None)
            },
        }
    }

    fn next_buffer(&mut self) -> Result<Value, UnpickleError> {
        let Some(buffers) = self.buffers.as_mut() else {
            return Err(UnpickleError::malformed(
                "stream requests an out-of-band buffer but none were supplied",
            ));
        };
        buffers.next().ok_or_else(|| {
            UnpickleError::malformed(
                "stream requests more out-of-band buffers than supplied",
            )
        })
    }

    // Operand readers

    fn read_byte(&mut self) -> Result<u8, UnpickleError> {
        Ok(self.reader.read_exact(1)?[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, UnpickleError> {
        let data = self.reader.read_exact(2)?;
        Ok(u16::from_le_bytes(
            data.try_into().expect("read_exact returned 2 bytes"),
        ))
    }

    fn read_u32_le(&mut self) -> Result<u32, UnpickleError> {
        let data = self.reader.read_exact(4)?;
        Ok(u32::from_le_bytes(
            data.try_into().expect("read_exact returned 4 bytes"),
        ))
    }

    fn read_i32_le(&mut self) -> Result<i32, UnpickleError> {
        let data = self.reader.read_exact(4)?;
        Ok(i32::from_le_bytes(
            data.try_into().expect("read_exact returned 4 bytes"),
        ))
    }

    fn read_u64_le(&mut self) -> Result<u64, UnpickleError> {
        let data = self.reader.read_exact(8)?;
        Ok(u64::from_le_bytes(
            data.try_into().expect("read_exact returned 8 bytes"),
        ))
    }

    fn read_utf8(
        &mut self,
        count: usize,
    ) -> Result<Value, UnpickleError> {
        let data = self.reader.read_exact(count)?;
        let text = String::from_utf8(data).map_err(|_| {
            UnpickleError::malformed("invalid UTF-8 in unicode string")
        })?;
        Ok(Value::String(text))
    }

    /// A newline-terminated line, terminator stripped. A line that ends at
    /// EOF without its terminator is malformed.
    fn read_line_terminated(&mut self) -> Result<Vec<u8>, UnpickleError> {
        let mut line = self.reader.read_line()?;
        if line.last() != Some(&b'\n') {
            return Err(UnpickleError::malformed(
                "text line without a newline terminator",
            ));
        }
        line.pop();
        Ok(line)
    }

    fn read_text_line(&mut self) -> Result<String, UnpickleError> {
        let line = self.read_line_terminated()?;
        String::from_utf8(line).map_err(|_| {
            UnpickleError::malformed("invalid UTF-8 in text line")
        })
    }

    // Text-operand parsers

    fn parse_int_line(&mut self) -> Result<Value, UnpickleError> {
        let text = self.read_text_line()?;
        // Protocol 0 spells booleans as the integers 00 and 01.
        match text.as_str() {
            "00" => return Ok(Value::Bool(false)),
            "01" => return Ok(Value::Bool(true)),
            _ => {},
        }
        Ok(Value::Int(parse_decimal(&text)?))
    }

    fn parse_long_line(&mut self) -> Result<i64, UnpickleError> {
        let text = self.read_text_line()?;
        let digits = text.strip_suffix('L').unwrap_or(&text);
        parse_decimal(digits)
    }

    fn parse_put_index_line(&mut self) -> Result<usize, UnpickleError> {
        let text = self.read_text_line()?;
        if text.starts_with('-') {
            return Err(UnpickleError::NegativeArgument);
        }
        text.parse::<usize>().map_err(|_| {
            UnpickleError::malformed(format!("invalid memo index {text:?}"))
        })
    }

    /// A memo read is a plain lookup; a negative index names a slot that
    /// can never have been stored, so it is reported as absent.
    fn parse_get_index_line(&mut self) -> Result<usize, UnpickleError> {
        let text = self.read_text_line()?;
        match text.parse::<i64>() {
            Ok(index) if index >= 0 => Ok(index as usize),
            Ok(index) => Err(UnpickleError::MemoNotFound(index)),
            Err(_) => Err(UnpickleError::malformed(format!(
                "invalid memo index {text:?}"
            ))),
        }
    }

    fn parse_quoted_string_line(&mut self) -> Result<Value, UnpickleError> {
        let line = self.read_line_terminated()?;
        let stripped = match (line.first(), line.last()) {
            (Some(b'\''), Some(b'\'')) | (Some(b'"'), Some(b'"'))
                if line.len() >= 2 =>
            {
                &line[1..line.len() - 1]
            },
            _ => {
                return Err(UnpickleError::malformed(
                    "8-bit string line is not quoted",
                ))
            },
        };
        self.decode_legacy_string(stripped)
    }

    fn decode_legacy_string(
        &self,
        data: &[u8],
    ) -> Result<Value, UnpickleError> {
        match self.string_encoding {
            StringEncoding::Ascii => {
                if !data.is_ascii() {
                    return Err(UnpickleError::malformed(
                        "non-ASCII byte in an 8-bit string",
                    ));
                }
                Ok(Value::String(
                    String::from_utf8(data.to_vec())
                        .expect("ASCII is valid UTF-8"),
                ))
            },
            StringEncoding::Utf8 => {
                let text = String::from_utf8(data.to_vec()).map_err(|_| {
                    UnpickleError::malformed(
                        "invalid UTF-8 in an 8-bit string",
                    )
                })?;
                Ok(Value::String(text))
            },
            StringEncoding::BytesHex => {
                let mut text = String::with_capacity(data.len() * 2);
                for byte in data {
                    text.push_str(&format!("{byte:02x}"));
                }
                Ok(Value::String(text))
            },
        }
    }
}

/// Decodes a two's-complement little-endian integer of arbitrary length
/// into an i64. Values that do not fit fail rather than wrap.
fn decode_long(data: &[u8]) -> Result<i64, UnpickleError> {
    if data.is_empty() {
        return Ok(0);
    }
    let negative = data.last().expect("nonempty") & 0x80 != 0;
    let fill = if negative { 0xFF } else { 0x00 };
    if data.len() > 8 {
        if data[8..].iter().any(|&b| b != fill) {
            return Err(UnpickleError::ExceedsMaxSize);
        }
        // The truncated top bit must still agree with the sign.
        if (data[7] & 0x80 != 0) != negative {
            return Err(UnpickleError::ExceedsMaxSize);
        }
    }
    let mut buf = [fill; 8];
    let n = data.len().min(8);
    buf[..n].copy_from_slice(&data[..n]);
    Ok(i64::from_le_bytes(buf))
}

fn checked_len(len: u64) -> Result<usize, UnpickleError> {
    if len > isize::MAX as u64 {
        return Err(UnpickleError::ExceedsMaxSize);
    }
    Ok(len as usize)
}

fn parse_decimal(text: &str) -> Result<i64, UnpickleError> {
    match text.parse::<i64>() {
        Ok(value) => Ok(value),
        Err(_) => {
            let digits = text.strip_prefix('-').unwrap_or(text);
            if !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit())
            {
                Err(UnpickleError::ExceedsMaxSize)
            } else {
                Err(UnpickleError::malformed(format!(
                    "invalid integer literal {text:?}"
                )))
            }
        },
    }
}

/// Latin-1 with `\uXXXX` and `\UXXXXXXXX` escapes expanded.
fn decode_raw_unicode_escape(
    data: &[u8]
) -> Result<String, UnpickleError> {
    let mut out = String::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\\'
            && i + 1 < data.len()
            && matches!(data[i + 1], b'u' | b'U')
        {
            let width = if data[i + 1] == b'u' { 4 } else { 8 };
            let end = i + 2 + width;
            if end > data.len() {
                return Err(UnpickleError::malformed(
                    "truncated unicode escape",
                ));
            }
            let hex = std::str::from_utf8(&data[i + 2..end])
                .ok()
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    UnpickleError::malformed("invalid unicode escape digits")
                })?;
            out.push(char::from_u32(hex).ok_or_else(|| {
                UnpickleError::malformed("escape names an invalid codepoint")
            })?);
            i = end;
        } else {
            out.push(data[i] as char);
            i += 1;
        }
    }
    Ok(out)
}
