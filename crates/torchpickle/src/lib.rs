pub mod array;
pub use array::{Array, ArrayError};

pub mod data_type;
pub use data_type::{ArrayElement, DataType};

pub mod pickle;
pub use pickle::{
    unpickle, Instantiator, InstantiatorRegistry, Payload, PersistentLoad,
    StringEncoding, UnpickleError, Unpickler, Value,
};

pub mod checkpoint;
pub use checkpoint::{read_checkpoint, CheckpointError, CheckpointReader};
