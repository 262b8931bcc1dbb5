pub mod error;
pub use error::UnpickleError;

pub mod reader;
pub use reader::{ByteSource, IoSource, SliceSource, Unframer};

pub mod opcode;
pub use opcode::Opcode;

pub mod value;
pub use value::{borrow_object, DictKey, Object, Payload, Value};

pub mod instantiate;
pub use instantiate::{Instantiator, InstantiatorRegistry, MODULE_DIVIDER};

pub mod machine;
pub use machine::{PersistentLoad, StringEncoding, Unpickler};

/// Decodes one pickle stream held in memory, with default options and no
/// persistent-load callback.
pub fn unpickle(data: &[u8]) -> Result<Value, UnpickleError> {
    Unpickler::new(SliceSource::new(data)).load()
}
