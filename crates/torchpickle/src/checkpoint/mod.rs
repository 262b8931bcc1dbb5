use std::{
    cell::RefCell,
    collections::HashMap,
    fs::File,
    io::{Read, Seek},
    path::Path,
    rc::Rc,
};

use thiserror::Error;
use tracing::debug;
use zip::{result::ZipError, ZipArchive};

use crate::{
    data_type::DataType,
    pickle::{
        PersistentLoad, Payload, SliceSource, UnpickleError, Unpickler, Value,
    },
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read the checkpoint archive")]
    Archive(#[from] ZipError),

    #[error("i/o failure while reading the checkpoint")]
    Io(#[from] std::io::Error),

    #[error("the archive has no entry ending with \"{0}\"")]
    EntryNotFound(String),

    #[error("invalid \"{entry}\" entry: {detail}")]
    InvalidEntry { entry: String, detail: String },

    #[error(transparent)]
    Unpickle(#[from] UnpickleError),
}

/// Declared byte order of the numbers inside a checkpoint archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }
}

const PICKLE_ENTRY: &str = "/data.pkl";
const BYTEORDER_ENTRY: &str = "/byteorder";
const FORMAT_VERSION_ENTRY: &str = "/.format_version";
const STORAGE_ALIGNMENT_ENTRY: &str = "/.storage_alignment";

/// Reads one checkpoint archive: a ZIP holding a pickled object graph at
/// `…/data.pkl` and one raw entry per tensor storage at `…/data/<key>`.
///
/// The reader owns the storage loader; the opcode machine only ever sees a
/// weak reference to it, so the reader can own the machine's output without
/// forming a cycle. `Rc` plumbing pins the whole reader to the thread it
/// was built on.
pub struct CheckpointReader<R: Read + Seek> {
    loader: Rc<StorageLoader<R>>,
    format_version: Option<u64>,
    storage_alignment: Option<u64>,
}

impl CheckpointReader<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek + 'static> CheckpointReader<R> {
    pub fn new(inner: R) -> Result<Self, CheckpointError> {
        let mut archive = ZipArchive::new(inner)?;

        let byte_order = match read_optional_text(&mut archive, BYTEORDER_ENTRY)?
        {
            None => ByteOrder::native(),
            Some(text) => match text.trim() {
                "little" => ByteOrder::Little,
                "big" => ByteOrder::Big,
                other => {
                    return Err(CheckpointError::InvalidEntry {
                        entry: BYTEORDER_ENTRY.to_string(),
                        detail: format!("unknown byte order {other:?}"),
                    })
                },
            },
        };
        let format_version =
            read_optional_int(&mut archive, FORMAT_VERSION_ENTRY)?;
        let storage_alignment =
            read_optional_int(&mut archive, STORAGE_ALIGNMENT_ENTRY)?;

        Ok(Self {
            loader: Rc::new(StorageLoader {
                archive: RefCell::new(archive),
                byte_order,
                cache: RefCell::new(HashMap::new()),
            }),
            format_version,
            storage_alignment,
        })
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.loader.byte_order
    }

    pub fn format_version(&self) -> Option<u64> {
        self.format_version
    }

    pub fn storage_alignment(&self) -> Option<u64> {
        self.storage_alignment
    }

    /// Decodes the object graph, resolving tensor storages through the
    /// archive. Each call runs a fresh machine over `…/data.pkl`.
    pub fn load(&self) -> Result<Value, CheckpointError> {
        let data = {
            let mut archive = self.loader.archive.borrow_mut();
            let name = match_suffix(archive.file_names(), PICKLE_ENTRY)
                .ok_or_else(|| {
                    CheckpointError::EntryNotFound(PICKLE_ENTRY.to_string())
                })?;
            read_entry(&mut archive, &name)?
        };
        let callback: Rc<dyn PersistentLoad> = self.loader.clone();
        let mut machine = Unpickler::new(SliceSource::new(&data))
            .with_persistent_load(Rc::downgrade(&callback));
        Ok(machine.load()?)
    }
}

/// Convenience entry point: open, decode, done.
pub fn read_checkpoint(
    path: impl AsRef<Path>
) -> Result<Value, CheckpointError> {
    CheckpointReader::open(path)?.load()
}

/// Resolves `("storage", <class>, <key>, …)` persistent-id records against
/// the archive, caching extracted bytes per storage key.
pub struct StorageLoader<R: Read + Seek> {
    archive: RefCell<ZipArchive<R>>,
    byte_order: ByteOrder,
    cache: RefCell<HashMap<String, (Rc<Vec<u8>>, String)>>,
}

impl<R: Read + Seek> StorageLoader<R> {
    fn read_storage(
        &self,
        key: &str,
        data_type: DataType,
    ) -> Result<Vec<u8>, CheckpointError> {
        let suffix = format!("/data/{key}");
        let mut archive = self.archive.borrow_mut();
        let name =
            match_suffix(archive.file_names(), &suffix).ok_or_else(|| {
                CheckpointError::EntryNotFound(suffix.clone())
            })?;
        let mut bytes = read_entry(&mut archive, &name)?;
        // Numbers were written on a machine of the declared order; swap
        // before anything downstream caches or views them.
        if self.byte_order != ByteOrder::native() {
            swap_byte_order(&mut bytes, data_type.swap_width());
        }
        Ok(bytes)
    }
}

impl<R: Read + Seek> PersistentLoad for StorageLoader<R> {
    fn persistent_load(
        &self,
        pid: Value,
    ) -> Result<Value, UnpickleError> {
        let record = pid
            .as_tuple()
            .ok_or(UnpickleError::UnsupportedPersistentId)?;
        if record.len() < 3 || record[0].as_str() != Some("storage") {
            return Err(UnpickleError::UnsupportedPersistentId);
        }
        let class = record[1]
            .as_object()
            .ok_or(UnpickleError::UnsupportedPersistentId)?
            .borrow()
            .tag()
            .to_string();
        let data_type = DataType::from_storage_class(&class)
            .ok_or(UnpickleError::UnsupportedPersistentId)?;
        let key = record[2]
            .as_str()
            .ok_or(UnpickleError::UnsupportedPersistentId)?
            .to_string();

        if let Some((bytes, cached_class)) = self.cache.borrow().get(&key) {
            return Ok(Value::object(
                cached_class.clone(),
                Payload::Bytes(bytes.clone()),
            ));
        }

        debug!(key = %key, class = %class, "extracting tensor storage");
        let bytes = Rc::new(self.read_storage(&key, data_type).map_err(
            |e| {
                UnpickleError::malformed(format!(
                    "failed to extract storage {key}: {e}"
                ))
            },
        )?);
        self.cache
            .borrow_mut()
            .insert(key, (bytes.clone(), class.clone()));
        Ok(Value::object(class, Payload::Bytes(bytes)))
    }
}

fn match_suffix<'a>(
    mut names: impl Iterator<Item = &'a str>,
    suffix: &str,
) -> Option<String> {
    names
        .find(|name| name.ends_with(suffix) || *name == &suffix[1..])
        .map(str::to_string)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, CheckpointError> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn read_optional_text<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    suffix: &str,
) -> Result<Option<String>, CheckpointError> {
    let Some(name) = match_suffix(archive.file_names(), suffix) else {
        return Ok(None);
    };
    let bytes = read_entry(archive, &name)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| CheckpointError::InvalidEntry {
            entry: suffix.to_string(),
            detail: "entry is not valid UTF-8".to_string(),
        })
}

fn read_optional_int<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    suffix: &str,
) -> Result<Option<u64>, CheckpointError> {
    let Some(text) = read_optional_text(archive, suffix)? else {
        return Ok(None);
    };
    text.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| CheckpointError::InvalidEntry {
            entry: suffix.to_string(),
            detail: format!("expected a base-10 integer, found {text:?}"),
        })
}

fn swap_byte_order(
    bytes: &mut [u8],
    width: usize,
) {
    if width <= 1 {
        return;
    }
    for chunk in bytes.chunks_exact_mut(width) {
        chunk.reverse();
    }
}
