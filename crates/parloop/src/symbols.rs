use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{OffloadError, Result};
use crate::ir::types::{Literal, ScalarType};

/// Identity of one backing store. Two descriptors alias exactly when they
/// carry the same id; the dependence analyzer never looks at names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

impl StorageId {
    fn mint() -> StorageId {
        StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Access discipline of a declared array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayFlags {
    pub read_only: bool,
    /// Contents before the loop are dead; staging skips the upload.
    pub write_only: bool,
    /// Device-local scratch, no host storage behind it.
    pub scratch: bool,
}

impl ArrayFlags {
    pub fn read_only() -> Self {
        ArrayFlags {
            read_only: true,
            ..ArrayFlags::default()
        }
    }

    pub fn write_only() -> Self {
        ArrayFlags {
            write_only: true,
            ..ArrayFlags::default()
        }
    }
}

/// Static shape of a declared array: element type and rank. Extents live on
/// the bound storage and may change between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub elem: ScalarType,
    pub dims: usize,
    pub flags: ArrayFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Scalar(ScalarType),
    Array(ArrayMeta),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolDecl {
    pub name: String,
    pub kind: SymbolKind,
}

/// Declarations for one program: a slot per symbol plus a name index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SymbolDecl>", into = "Vec<SymbolDecl>")]
pub struct SymbolTable {
    decls: Vec<SymbolDecl>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn scalar(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.declare(name.into(), SymbolKind::Scalar(ty));
        self
    }

    pub fn array(mut self, name: impl Into<String>, elem: ScalarType, dims: usize) -> Self {
        self.declare(
            name.into(),
            SymbolKind::Array(ArrayMeta {
                elem,
                dims,
                flags: ArrayFlags::default(),
            }),
        );
        self
    }

    pub fn array_with(
        mut self,
        name: impl Into<String>,
        elem: ScalarType,
        dims: usize,
        flags: ArrayFlags,
    ) -> Self {
        self.declare(name.into(), SymbolKind::Array(ArrayMeta { elem, dims, flags }));
        self
    }

    fn declare(&mut self, name: String, kind: SymbolKind) {
        debug_assert!(
            !self.index.contains_key(&name),
            "duplicate symbol '{name}'"
        );
        self.index.insert(name.clone(), self.decls.len());
        self.decls.push(SymbolDecl { name, kind });
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn kind(&self, name: &str) -> Option<SymbolKind> {
        self.slot(name).map(|s| self.decls[s].kind)
    }

    pub fn array_meta(&self, name: &str) -> Option<ArrayMeta> {
        match self.kind(name) {
            Some(SymbolKind::Array(meta)) => Some(meta),
            _ => None,
        }
    }

    pub fn scalar_type(&self, name: &str) -> Option<ScalarType> {
        match self.kind(name) {
            Some(SymbolKind::Scalar(ty)) => Some(ty),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn decls(&self) -> &[SymbolDecl] {
        &self.decls
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolDecl> {
        self.decls.iter()
    }
}

impl PartialEq for SymbolTable {
    fn eq(&self, other: &Self) -> bool {
        self.decls == other.decls
    }
}

impl From<Vec<SymbolDecl>> for SymbolTable {
    fn from(decls: Vec<SymbolDecl>) -> Self {
        let index = decls
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        SymbolTable { decls, index }
    }
}

impl From<SymbolTable> for Vec<SymbolDecl> {
    fn from(table: SymbolTable) -> Self {
        table.decls
    }
}

/// Typed flat storage for one array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Buf {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
}

impl Buf {
    pub fn len(&self) -> usize {
        match self {
            Buf::I32(v) => v.len(),
            Buf::I64(v) => v.len(),
            Buf::F64(v) => v.len(),
            Buf::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem(&self) -> ScalarType {
        match self {
            Buf::I32(_) => ScalarType::I32,
            Buf::I64(_) => ScalarType::I64,
            Buf::F64(_) => ScalarType::F64,
            Buf::Bool(_) => ScalarType::Bool,
        }
    }

    fn zeros(elem: ScalarType, len: usize) -> Buf {
        match elem {
            ScalarType::I32 => Buf::I32(vec![0; len]),
            ScalarType::I64 => Buf::I64(vec![0; len]),
            ScalarType::F64 => Buf::F64(vec![0.0; len]),
            ScalarType::Bool => Buf::Bool(vec![false; len]),
        }
    }
}

/// One array binding: storage identity, extents, and the flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayData {
    id: StorageId,
    /// Host mutation counter. Staging remembers the version a device copy
    /// was taken from and re-uploads when it has moved.
    version: u64,
    pub dims: SmallVec<[usize; 3]>,
    pub buf: Buf,
}

impl ArrayData {
    pub fn new(dims: impl Into<SmallVec<[usize; 3]>>, buf: Buf) -> Result<ArrayData> {
        let dims = dims.into();
        let expected: usize = dims.iter().product();
        if buf.len() != expected {
            return Err(OffloadError::bound(
                "<new array>",
                format!("buffer holds {} elements, extents need {expected}", buf.len()),
            ));
        }
        Ok(ArrayData {
            id: StorageId::mint(),
            version: 0,
            dims,
            buf,
        })
    }

    pub fn zeros(elem: ScalarType, dims: impl Into<SmallVec<[usize; 3]>>) -> ArrayData {
        let dims = dims.into();
        let len: usize = dims.iter().product();
        ArrayData {
            id: StorageId::mint(),
            version: 0,
            dims,
            buf: Buf::zeros(elem, len),
        }
    }

    pub fn from_i32(values: Vec<i32>) -> ArrayData {
        let dims: SmallVec<[usize; 3]> = smallvec::smallvec![values.len()];
        ArrayData {
            id: StorageId::mint(),
            version: 0,
            dims,
            buf: Buf::I32(values),
        }
    }

    pub fn from_i64(values: Vec<i64>) -> ArrayData {
        let dims: SmallVec<[usize; 3]> = smallvec::smallvec![values.len()];
        ArrayData {
            id: StorageId::mint(),
            version: 0,
            dims,
            buf: Buf::I64(values),
        }
    }

    pub fn from_f64(values: Vec<f64>) -> ArrayData {
        let dims: SmallVec<[usize; 3]> = smallvec::smallvec![values.len()];
        ArrayData {
            id: StorageId::mint(),
            version: 0,
            dims,
            buf: Buf::F64(values),
        }
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record a mutation made directly through `buf`.
    pub fn touch(&mut self) {
        self.version += 1;
    }

    pub fn elem(&self) -> ScalarType {
        self.buf.elem()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.elem().byte_width()
    }

    /// Row-major flattening of a multi-dimensional index.
    pub fn flatten(&self, index: &[i64]) -> Option<usize> {
        if index.len() != self.dims.len() {
            return None;
        }
        let mut flat: usize = 0;
        for (pos, (&i, &extent)) in index.iter().zip(self.dims.iter()).enumerate() {
            if i < 0 || (i as usize) >= extent {
                return None;
            }
            flat = if pos == 0 { i as usize } else { flat * extent + i as usize };
        }
        Some(flat)
    }

    pub fn get(&self, flat: usize) -> Literal {
        match &self.buf {
            Buf::I32(v) => Literal::I32(v[flat]),
            Buf::I64(v) => Literal::I64(v[flat]),
            Buf::F64(v) => Literal::F64(v[flat]),
            Buf::Bool(v) => Literal::Bool(v[flat]),
        }
    }

    pub fn set(&mut self, flat: usize, value: Literal) -> Result<()> {
        match (&mut self.buf, value) {
            (Buf::I32(v), Literal::I32(x)) => v[flat] = x,
            (Buf::I64(v), Literal::I64(x)) => v[flat] = x,
            (Buf::F64(v), Literal::F64(x)) => v[flat] = x,
            (Buf::Bool(v), Literal::Bool(x)) => v[flat] = x,
            (buf, value) => {
                return Err(OffloadError::unsupported(
                    "array store",
                    format!("stored {} into {} storage", value.ty(), buf.elem()),
                ))
            }
        }
        self.version += 1;
        Ok(())
    }

    /// Native-endian byte image for device transfer.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.buf {
            Buf::I32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            Buf::I64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            Buf::F64(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
            Buf::Bool(v) => v.iter().map(|&b| b as u8).collect(),
        }
    }

    /// Overwrite contents from a device byte image.
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.byte_len() {
            return Err(OffloadError::device(format!(
                "transfer size mismatch: got {} bytes, storage holds {}",
                bytes.len(),
                self.byte_len()
            )));
        }
        match &mut self.buf {
            Buf::I32(v) => {
                for (dst, chunk) in v.iter_mut().zip(bytes.chunks_exact(4)) {
                    *dst = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
            }
            Buf::I64(v) => {
                for (dst, chunk) in v.iter_mut().zip(bytes.chunks_exact(8)) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    *dst = i64::from_ne_bytes(raw);
                }
            }
            Buf::F64(v) => {
                for (dst, chunk) in v.iter_mut().zip(bytes.chunks_exact(8)) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    *dst = f64::from_ne_bytes(raw);
                }
            }
            Buf::Bool(v) => {
                for (dst, &b) in v.iter_mut().zip(bytes.iter()) {
                    *dst = b != 0;
                }
            }
        }
        self.version += 1;
        Ok(())
    }
}

/// Shared handle to one array. Clones alias the same storage and therefore
/// the same [`StorageId`].
#[derive(Debug, Clone)]
pub struct ArrayRef(Arc<Mutex<ArrayData>>);

impl ArrayRef {
    pub fn new(data: ArrayData) -> ArrayRef {
        ArrayRef(Arc::new(Mutex::new(data)))
    }

    pub fn lock(&self) -> MutexGuard<'_, ArrayData> {
        self.0.lock().expect("array storage lock poisoned")
    }

    pub fn id(&self) -> StorageId {
        self.lock().id
    }
}

/// Runtime value bound to one symbol slot.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Literal),
    Array(ArrayRef),
}

/// The activation record for one call: slot-indexed values plus the name
/// index copied from the program's symbol table.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    slots: Vec<Option<Value>>,
    names: HashMap<String, usize>,
}

impl Bindings {
    pub fn for_table(table: &SymbolTable) -> Bindings {
        Bindings {
            slots: vec![None; table.len()],
            names: table
                .iter()
                .enumerate()
                .map(|(i, d)| (d.name.clone(), i))
                .collect(),
        }
    }

    pub fn set_scalar(&mut self, name: &str, value: Literal) -> Result<()> {
        let slot = self.slot(name)?;
        self.slots[slot] = Some(Value::Scalar(value));
        Ok(())
    }

    pub fn set_array(&mut self, name: &str, array: ArrayRef) -> Result<()> {
        let slot = self.slot(name)?;
        self.slots[slot] = Some(Value::Array(array));
        Ok(())
    }

    pub fn scalar(&self, name: &str) -> Result<Literal> {
        match self.value(name)? {
            Value::Scalar(lit) => Ok(*lit),
            Value::Array(_) => Err(OffloadError::unsupported(
                "binding",
                format!("'{name}' is bound to an array where a scalar is needed"),
            )),
        }
    }

    pub fn array(&self, name: &str) -> Result<&ArrayRef> {
        match self.value(name)? {
            Value::Array(arr) => Ok(arr),
            Value::Scalar(_) => Err(OffloadError::unsupported(
                "binding",
                format!("'{name}' is bound to a scalar where an array is needed"),
            )),
        }
    }

    fn value(&self, name: &str) -> Result<&Value> {
        let slot = self.slot(name)?;
        self.slots[slot].as_ref().ok_or_else(|| {
            OffloadError::unsupported("binding", format!("'{name}' has no bound value"))
        })
    }

    fn slot(&self, name: &str) -> Result<usize> {
        self.names.get(name).copied().ok_or_else(|| {
            OffloadError::unsupported("binding", format!("'{name}' is not a declared symbol"))
        })
    }
}
