//! Program snapshots: a framed bincode image of one call (program plus
//! activation record) so tooling can capture a call-site and replay it
//! offline. Array storage is pooled by identity, so aliased bindings stay
//! aliased after a round trip.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::ir::program::Program;
use crate::ir::types::Literal;
use crate::symbols::{ArrayData, ArrayRef, Bindings, Buf, SymbolKind};

const MAGIC: &[u8; 8] = b"PARLOOPS";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArrayImage {
    dims: Vec<usize>,
    buf: Buf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ValueImage {
    Scalar(Literal),
    /// Index into the shared array pool.
    Array(usize),
}

/// One captured call. Build with [`Snapshot::capture`], replay with
/// [`Snapshot::restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    program: Program,
    arrays: Vec<ArrayImage>,
    values: Vec<(String, ValueImage)>,
}

impl Snapshot {
    pub fn capture(program: &Program, bindings: &Bindings) -> Result<Snapshot, SnapshotError> {
        let mut arrays = Vec::new();
        let mut pool = HashMap::new();
        let mut values = Vec::new();
        for decl in program.symbols.iter() {
            match decl.kind {
                SymbolKind::Scalar(_) => {
                    if let Ok(lit) = bindings.scalar(&decl.name) {
                        values.push((decl.name.clone(), ValueImage::Scalar(lit)));
                    }
                }
                SymbolKind::Array(_) => {
                    if let Ok(array) = bindings.array(&decl.name) {
                        let id = array.id();
                        let index = *pool.entry(id).or_insert_with(|| {
                            let data = array.lock();
                            arrays.push(ArrayImage {
                                dims: data.dims.to_vec(),
                                buf: data.buf.clone(),
                            });
                            arrays.len() - 1
                        });
                        values.push((decl.name.clone(), ValueImage::Array(index)));
                    }
                }
            }
        }
        Ok(Snapshot {
            program: program.clone(),
            arrays,
            values,
        })
    }

    /// Rebuild the program and a fresh activation record. Pool entries are
    /// minted once, so names that shared storage at capture time share it
    /// again.
    pub fn restore(&self) -> Result<(Program, Bindings), SnapshotError> {
        let program = self.program.clone();
        let mut bindings = Bindings::for_table(&program.symbols);
        let mut minted: Vec<Option<ArrayRef>> = vec![None; self.arrays.len()];
        for (name, value) in &self.values {
            match value {
                ValueImage::Scalar(lit) => {
                    bindings
                        .set_scalar(name, *lit)
                        .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
                }
                ValueImage::Array(index) => {
                    let image = self
                        .arrays
                        .get(*index)
                        .ok_or_else(|| SnapshotError::Corrupt(format!(
                            "array pool index {index} out of range"
                        )))?;
                    let entry = &mut minted[*index];
                    let array = match entry {
                        Some(existing) => existing.clone(),
                        None => {
                            let data = ArrayData::new(image.dims.as_slice(), image.buf.clone())
                                .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
                            let fresh = ArrayRef::new(data);
                            *entry = Some(fresh.clone());
                            fresh
                        }
                    };
                    bindings
                        .set_array(name, array)
                        .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
                }
            }
        }
        Ok((program, bindings))
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Snapshot, SnapshotError> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Snapshot::read_from(&mut reader)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bincode::serialize_into(&mut bytes, self)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
        Snapshot::read_from(&mut bytes)
    }

    fn read_from(reader: &mut impl Read) -> Result<Snapshot, SnapshotError> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        let found = u32::from_le_bytes(version);
        if found != VERSION {
            return Err(SnapshotError::VersionMismatch {
                found,
                expected: VERSION,
            });
        }
        Ok(bincode::deserialize_from(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::program::{Expr, LoopLevel, Program, Stmt};
    use crate::ir::types::ScalarType;
    use crate::symbols::SymbolTable;

    fn saxpy() -> (Program, Bindings) {
        let symbols = SymbolTable::new()
            .scalar("n", ScalarType::I64)
            .scalar("a", ScalarType::F64)
            .array("x", ScalarType::F64, 1)
            .array("y", ScalarType::F64, 1);
        let body = vec![Stmt::Store {
            array: "y".to_string(),
            index: vec![Expr::scalar("i")],
            value: Expr::add(
                Expr::mul(Expr::scalar("a"), Expr::load("x", vec![Expr::scalar("i")])),
                Expr::load("y", vec![Expr::scalar("i")]),
            ),
        }];
        let program = Program::loop_nest(
            "saxpy",
            symbols,
            LoopLevel::upto("i", Expr::scalar("n")),
            body,
        );
        let mut bindings = Bindings::for_table(&program.symbols);
        bindings.set_scalar("n", Literal::I64(4)).unwrap();
        bindings.set_scalar("a", Literal::F64(2.0)).unwrap();
        bindings
            .set_array("x", ArrayRef::new(ArrayData::from_f64(vec![1.0, 2.0, 3.0, 4.0])))
            .unwrap();
        bindings
            .set_array("y", ArrayRef::new(ArrayData::from_f64(vec![0.0; 4])))
            .unwrap();
        (program, bindings)
    }

    #[test]
    fn byte_round_trip_preserves_program_and_values() {
        let (program, bindings) = saxpy();
        let snapshot = Snapshot::capture(&program, &bindings).unwrap();
        let bytes = snapshot.to_bytes().unwrap();
        let restored = Snapshot::from_bytes(&bytes).unwrap();
        let (program2, bindings2) = restored.restore().unwrap();
        assert_eq!(program2.name, "saxpy");
        assert_eq!(bindings2.scalar("n").unwrap(), Literal::I64(4));
        let x = bindings2.array("x").unwrap().lock().clone();
        assert_eq!(x.len(), 4);
        assert_eq!(x.get(2), Literal::F64(3.0));
    }

    #[test]
    fn aliased_bindings_stay_aliased_after_restore() {
        let (program, mut bindings) = saxpy();
        let shared = bindings.array("x").unwrap().clone();
        bindings.set_array("y", shared).unwrap();
        let snapshot = Snapshot::capture(&program, &bindings).unwrap();
        let (_, restored) = Snapshot::from_bytes(&snapshot.to_bytes().unwrap())
            .unwrap()
            .restore()
            .unwrap();
        assert_eq!(
            restored.array("x").unwrap().id(),
            restored.array("y").unwrap().id()
        );
    }

    #[test]
    fn distinct_storage_stays_distinct_after_restore() {
        let (program, bindings) = saxpy();
        let snapshot = Snapshot::capture(&program, &bindings).unwrap();
        let (_, restored) = snapshot.restore().unwrap();
        assert_ne!(
            restored.array("x").unwrap().id(),
            restored.array("y").unwrap().id()
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (program, bindings) = saxpy();
        let mut bytes = Snapshot::capture(&program, &bindings)
            .unwrap()
            .to_bytes()
            .unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(SnapshotError::BadMagic)
        ));
    }

    #[test]
    fn future_versions_are_rejected() {
        let (program, bindings) = saxpy();
        let mut bytes = Snapshot::capture(&program, &bindings)
            .unwrap()
            .to_bytes()
            .unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            Snapshot::from_bytes(&bytes),
            Err(SnapshotError::VersionMismatch {
                found: 99,
                expected: VERSION,
            })
        ));
    }
}
