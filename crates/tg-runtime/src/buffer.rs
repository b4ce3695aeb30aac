use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tg_core::{DType, Element, Storage, StorageError};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Device-resident storage shared between the host and queued kernels.
///
/// Clones share the same storage. Ids are unique per process and give
/// the lock order used by kernels touching several buffers.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    id: u64,
    dtype: DType,
    len: usize,
    storage: Arc<RwLock<Storage>>,
}

impl DeviceBuffer {
    #[must_use]
    pub fn from_storage(storage: Storage) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            dtype: storage.dtype(),
            len: storage.len(),
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    #[must_use]
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        Self::from_storage(Storage::from_vec(values))
    }

    pub fn zeros(dtype: DType, len: usize) -> Result<Self, BufferError> {
        Ok(Self::from_storage(Storage::zeros(dtype, len)?))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn same_storage(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Storage>, BufferError> {
        self.storage
            .read()
            .map_err(|_| BufferError::Poisoned { id: self.id })
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Storage>, BufferError> {
        self.storage
            .write()
            .map_err(|_| BufferError::Poisoned { id: self.id })
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, BufferError> {
        let storage = self.read()?;
        storage
            .typed::<T>()
            .map(<[T]>::to_vec)
            .ok_or(BufferError::DTypeMismatch {
                id: self.id,
                expected: self.dtype,
                actual: T::DTYPE,
            })
    }

    /// Overwrites the whole buffer from host memory.
    pub fn upload<T: Element>(&self, values: &[T]) -> Result<(), BufferError> {
        if values.len() != self.len {
            return Err(BufferError::LengthMismatch {
                id: self.id,
                expected: self.len,
                actual: values.len(),
            });
        }
        let mut storage = self.write()?;
        let slots = storage
            .typed_mut::<T>()
            .ok_or(BufferError::DTypeMismatch {
                id: self.id,
                expected: self.dtype,
                actual: T::DTYPE,
            })?;
        slots.copy_from_slice(values);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferError {
    Poisoned {
        id: u64,
    },
    DTypeMismatch {
        id: u64,
        expected: DType,
        actual: DType,
    },
    LengthMismatch {
        id: u64,
        expected: usize,
        actual: usize,
    },
    Storage(StorageError),
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poisoned { id } => write!(f, "buffer {id} lock is poisoned"),
            Self::DTypeMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "buffer {id} holds {expected} elements, requested {actual}"
            ),
            Self::LengthMismatch {
                id,
                expected,
                actual,
            } => write!(
                f,
                "buffer {id} holds {expected} elements, host slice has {actual}"
            ),
            Self::Storage(error) => write!(f, "buffer storage: {error}"),
        }
    }
}

impl std::error::Error for BufferError {}

impl From<StorageError> for BufferError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

#[cfg(test)]
mod tests {
    use tg_core::DType;

    use super::{BufferError, DeviceBuffer};

    #[test]
    fn buffers_get_unique_ids_and_clones_share_storage() {
        let first = DeviceBuffer::from_vec(vec![1.0f32, 2.0]);
        let second = DeviceBuffer::from_vec(vec![1.0f32, 2.0]);
        let alias = first.clone();

        assert_ne!(first.id(), second.id());
        assert!(first.same_storage(&alias));
        assert!(!first.same_storage(&second));

        alias.upload(&[5.0f32, 6.0]).expect("upload");
        assert_eq!(first.to_vec::<f32>().expect("read back"), vec![5.0, 6.0]);
    }

    #[test]
    fn typed_access_checks_element_type_and_length() {
        let buffer = DeviceBuffer::zeros(DType::I16, 3).expect("i16 storage");
        let err = buffer.to_vec::<f32>().expect_err("wrong element type");
        assert!(matches!(
            err,
            BufferError::DTypeMismatch {
                expected: DType::I16,
                actual: DType::F32,
                ..
            }
        ));

        let err = buffer.upload(&[1i16]).expect_err("wrong length");
        assert!(matches!(err, BufferError::LengthMismatch { expected: 3, actual: 1, .. }));
    }

    #[test]
    fn uninstantiated_types_cannot_be_allocated() {
        let err = DeviceBuffer::zeros(DType::U64, 4).expect_err("no u64 storage");
        assert!(matches!(err, BufferError::Storage(_)));
    }
}
