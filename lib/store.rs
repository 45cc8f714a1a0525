//! Labeled storage of flat numeric vectors, used to save and restore bases at
//! sweep boundaries.
//!
//! Storage is organized as a flat map from `/`-separated labels to
//! one-dimensional arrays of unsigned integers, signed integers, reals, or
//! booleans. [`DataOut`] and [`DataIn`] abstract over where the data goes; two
//! implementations are provided:
//! - [`MemStore`], an in-memory map, mostly useful for tests and for handing
//!   data between parts of a program;
//! - [`NpzOut`]/[`NpzIn`], which write to and read from NumPy `.npz` archives
//!   through [`ndarray_npy`], one `.npy` entry per label.

use std::io::{ Read, Seek, Write };
use ndarray as nd;
use ndarray_npy::{ NpzReader, NpzWriter, ReadNpzError, WriteNpzError };
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error writing npz: {0}")]
    WriteNpz(#[from] WriteNpzError),

    #[error("error reading npz: {0}")]
    ReadNpz(#[from] ReadNpzError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when a label isn't present in the store.
    #[error("missing label '{0}'")]
    MissingLabel(String),

    /// Returned when a label holds data of a different kind than requested.
    #[error("label '{label}' does not hold {expected}")]
    WrongKind { label: String, expected: &'static str },

    /// Returned when a vector doesn't have the length implied by other data.
    #[error("label '{label}' has length {got}, expected {expected}")]
    LengthMismatch { label: String, expected: usize, got: usize },

    /// Returned when an element of a vector is out of range for its meaning.
    #[error("label '{0}' has a bad value at position {1}")]
    BadValue(String, usize),
}
use StoreError::*;
pub type StoreResult<T> = Result<T, StoreError>;

/// Sink for labeled data.
pub trait DataOut {
    /// Declare a group. Labels written afterward may use `label` as a prefix.
    fn create_group(&mut self, label: &str) -> StoreResult<()>;

    fn write_ints(&mut self, label: &str, data: &[u64]) -> StoreResult<()>;

    fn write_signed(&mut self, label: &str, data: &[i64]) -> StoreResult<()>;

    fn write_reals(&mut self, label: &str, data: &[f64]) -> StoreResult<()>;

    fn write_flags(&mut self, label: &str, data: &[bool]) -> StoreResult<()>;

    /// Write a single boolean.
    fn write_flag(&mut self, label: &str, flag: bool) -> StoreResult<()> {
        self.write_flags(label, &[flag])
    }
}

/// Source of labeled data.
pub trait DataIn {
    /// Return `true` if `label` is present.
    fn contains(&mut self, label: &str) -> bool;

    fn read_ints(&mut self, label: &str) -> StoreResult<Vec<u64>>;

    fn read_signed(&mut self, label: &str) -> StoreResult<Vec<i64>>;

    fn read_reals(&mut self, label: &str) -> StoreResult<Vec<f64>>;

    fn read_flags(&mut self, label: &str) -> StoreResult<Vec<bool>>;

    /// Read a single boolean.
    fn read_flag(&mut self, label: &str) -> StoreResult<bool> {
        let flags = self.read_flags(label)?;
        match flags.as_slice() {
            [flag] => Ok(*flag),
            _ => Err(LengthMismatch { label: label.into(), expected: 1, got: flags.len() }),
        }
    }
}

/// A single stored item.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    Group,
    Ints(Vec<u64>),
    Signed(Vec<i64>),
    Reals(Vec<f64>),
    Flags(Vec<bool>),
}

/// In-memory store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemStore {
    entries: HashMap<String, Entry>,
}

impl MemStore {
    /// Create a new, empty store.
    pub fn new() -> Self { Self::default() }

    /// Return the number of stored items, groups included.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Return `true` if nothing has been stored.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Return the item stored under `label`, if it exists.
    pub fn get(&self, label: &str) -> Option<&Entry> { self.entries.get(label) }

    /// Remove and return the item stored under `label`, if it exists.
    pub fn remove(&mut self, label: &str) -> Option<Entry> {
        self.entries.remove(label)
    }

    /// Iterate over all labels in arbitrary order.
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(|k| k.as_str())
    }

    fn insert(&mut self, label: &str, entry: Entry) -> StoreResult<()> {
        self.entries.insert(label.to_string(), entry);
        Ok(())
    }

    fn fetch(&self, label: &str) -> StoreResult<&Entry> {
        self.entries.get(label).ok_or_else(|| MissingLabel(label.into()))
    }
}

impl DataOut for MemStore {
    fn create_group(&mut self, label: &str) -> StoreResult<()> {
        self.insert(label, Entry::Group)
    }

    fn write_ints(&mut self, label: &str, data: &[u64]) -> StoreResult<()> {
        self.insert(label, Entry::Ints(data.to_vec()))
    }

    fn write_signed(&mut self, label: &str, data: &[i64]) -> StoreResult<()> {
        self.insert(label, Entry::Signed(data.to_vec()))
    }

    fn write_reals(&mut self, label: &str, data: &[f64]) -> StoreResult<()> {
        self.insert(label, Entry::Reals(data.to_vec()))
    }

    fn write_flags(&mut self, label: &str, data: &[bool]) -> StoreResult<()> {
        self.insert(label, Entry::Flags(data.to_vec()))
    }
}

impl DataIn for MemStore {
    fn contains(&mut self, label: &str) -> bool {
        self.entries.contains_key(label)
    }

    fn read_ints(&mut self, label: &str) -> StoreResult<Vec<u64>> {
        match self.fetch(label)? {
            Entry::Ints(v) => Ok(v.clone()),
            _ => Err(WrongKind { label: label.into(), expected: "unsigned integers" }),
        }
    }

    fn read_signed(&mut self, label: &str) -> StoreResult<Vec<i64>> {
        match self.fetch(label)? {
            Entry::Signed(v) => Ok(v.clone()),
            _ => Err(WrongKind { label: label.into(), expected: "signed integers" }),
        }
    }

    fn read_reals(&mut self, label: &str) -> StoreResult<Vec<f64>> {
        match self.fetch(label)? {
            Entry::Reals(v) => Ok(v.clone()),
            _ => Err(WrongKind { label: label.into(), expected: "reals" }),
        }
    }

    fn read_flags(&mut self, label: &str) -> StoreResult<Vec<bool>> {
        match self.fetch(label)? {
            Entry::Flags(v) => Ok(v.clone()),
            _ => Err(WrongKind { label: label.into(), expected: "booleans" }),
        }
    }
}

/// Writer for `.npz` archives.
///
/// Archives are flat, so groups only exist as label prefixes and
/// [`DataOut::create_group`] writes nothing. Booleans are stored as `u8`.
/// Call [`Self::finish`] to complete the archive.
pub struct NpzOut<W>
where W: Write + Seek
{
    npz: NpzWriter<W>,
}

impl<W> NpzOut<W>
where W: Write + Seek
{
    /// Start a new (uncompressed) archive.
    pub fn new(writer: W) -> Self { Self { npz: NpzWriter::new(writer) } }

    /// Finish writing the archive and return the underlying writer.
    pub fn finish(self) -> StoreResult<W> { Ok(self.npz.finish()?) }
}

impl<W> DataOut for NpzOut<W>
where W: Write + Seek
{
    fn create_group(&mut self, _label: &str) -> StoreResult<()> { Ok(()) }

    fn write_ints(&mut self, label: &str, data: &[u64]) -> StoreResult<()> {
        Ok(self.npz.add_array(label, &nd::ArrayView1::from(data))?)
    }

    fn write_signed(&mut self, label: &str, data: &[i64]) -> StoreResult<()> {
        Ok(self.npz.add_array(label, &nd::ArrayView1::from(data))?)
    }

    fn write_reals(&mut self, label: &str, data: &[f64]) -> StoreResult<()> {
        Ok(self.npz.add_array(label, &nd::ArrayView1::from(data))?)
    }

    fn write_flags(&mut self, label: &str, data: &[bool]) -> StoreResult<()> {
        let bytes: nd::Array1<u8> = data.iter().map(|b| u8::from(*b)).collect();
        Ok(self.npz.add_array(label, &bytes)?)
    }
}

/// Reader for `.npz` archives written by [`NpzOut`] (or by NumPy's `savez`).
pub struct NpzIn<R>
where R: Read + Seek
{
    npz: NpzReader<R>,
    names: Vec<String>, // as stored in the archive
}

impl<R> NpzIn<R>
where R: Read + Seek
{
    /// Open an archive.
    pub fn new(reader: R) -> StoreResult<Self> {
        let mut npz = NpzReader::new(reader)?;
        let names = npz.names()?;
        Ok(Self { npz, names })
    }

    /// Return all labels in the archive, with any `.npy` extension stripped.
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter()
            .map(|name| name.strip_suffix(".npy").unwrap_or(name.as_str()))
    }

    // entries may or may not carry the `.npy` extension depending on the
    // writer
    fn entry_name(&self, label: &str) -> StoreResult<String> {
        let with_ext = format!("{label}.npy");
        self.names.iter()
            .find(|name| *name == label || **name == with_ext)
            .cloned()
            .ok_or_else(|| MissingLabel(label.into()))
    }

    fn read_vec<T>(&mut self, label: &str) -> StoreResult<Vec<T>>
    where T: ndarray_npy::ReadableElement
    {
        let name = self.entry_name(label)?;
        let arr: nd::Array1<T> = self.npz.by_name(&name)?;
        Ok(arr.into_raw_vec())
    }
}

impl<R> DataIn for NpzIn<R>
where R: Read + Seek
{
    fn contains(&mut self, label: &str) -> bool {
        self.entry_name(label).is_ok()
    }

    fn read_ints(&mut self, label: &str) -> StoreResult<Vec<u64>> {
        self.read_vec(label)
    }

    fn read_signed(&mut self, label: &str) -> StoreResult<Vec<i64>> {
        self.read_vec(label)
    }

    fn read_reals(&mut self, label: &str) -> StoreResult<Vec<f64>> {
        self.read_vec(label)
    }

    fn read_flags(&mut self, label: &str) -> StoreResult<Vec<bool>> {
        let bytes: Vec<u8> = self.read_vec(label)?;
        Ok(bytes.into_iter().map(|b| b != 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use super::*;

    #[test]
    fn mem_store_kinds() {
        let mut store = MemStore::new();
        store.create_group("g").unwrap();
        store.write_ints("g/a", &[1, 2, 3]).unwrap();
        store.write_flag("g/f", true).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.read_ints("g/a").unwrap(), vec![1, 2, 3]);
        assert!(store.read_flag("g/f").unwrap());
        assert!(matches!(store.read_reals("g/a"), Err(WrongKind { .. })));
        assert!(matches!(store.read_ints("g/b"), Err(MissingLabel(_))));
    }

    #[test]
    fn npz_round_trip() {
        let mut out = NpzOut::new(Cursor::new(Vec::<u8>::new()));
        out.create_group("basis").unwrap();
        out.write_ints("basis/PARTITION", &[0, 2, 3]).unwrap();
        out.write_signed("basis/M", &[-1, 1]).unwrap();
        out.write_reals("basis/W", &[0.25, 0.75]).unwrap();
        out.write_flags("basis/SIGNS", &[true, false, true]).unwrap();
        let mut cursor = out.finish().unwrap();
        cursor.set_position(0);

        let mut input = NpzIn::new(cursor).unwrap();
        assert!(input.contains("basis/PARTITION"));
        assert!(!input.contains("basis/NOPE"));
        assert_eq!(input.read_ints("basis/PARTITION").unwrap(), vec![0, 2, 3]);
        assert_eq!(input.read_signed("basis/M").unwrap(), vec![-1, 1]);
        assert_eq!(input.read_reals("basis/W").unwrap(), vec![0.25, 0.75]);
        assert_eq!(input.read_flags("basis/SIGNS").unwrap(), vec![true, false, true]);
        let mut labels: Vec<&str> = input.labels().collect();
        labels.sort();
        assert_eq!(labels, vec!["basis/M", "basis/PARTITION", "basis/SIGNS", "basis/W"]);
    }
}
