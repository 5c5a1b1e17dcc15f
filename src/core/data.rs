//! Constant payloads referenced indirectly by emitted code.
//!
//! Code that cannot encode a value as an immediate (floating point
//! constants, wide integers, raw tables) loads it from a data section laid
//! out right after the code. [`DataSection`] collects the items of one
//! compilation and computes their final layout; deduplication by value is
//! done by the compilation result builder in front of it.

use std::fmt;
use std::sync::Arc;

use super::error::{EmitError, EmitResult};

/// A constant value stored in the data section.
///
/// Floating point values are held as raw bits so that equality and hashing
/// follow bit patterns (`-0.0` and `0.0` are distinct, NaN payloads are
/// preserved).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    Bytes(Box<[u8]>),
}

impl Constant {
    pub fn float(value: f32) -> Self {
        Constant::Float(value.to_bits())
    }

    pub fn double(value: f64) -> Self {
        Constant::Double(value.to_bits())
    }

    pub fn size(&self) -> u32 {
        match self {
            Constant::Int(_) | Constant::Float(_) => 4,
            Constant::Long(_) | Constant::Double(_) => 8,
            Constant::Bytes(b) => b.len() as u32,
        }
    }

    /// Alignment a data item for this constant starts out with.
    pub fn natural_alignment(&self) -> u32 {
        match self {
            Constant::Bytes(_) => 1,
            other => other.size(),
        }
    }

    /// Little-endian serialized form.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Constant::Int(v) => v.to_le_bytes().to_vec(),
            Constant::Long(v) => v.to_le_bytes().to_vec(),
            Constant::Float(bits) => bits.to_le_bytes().to_vec(),
            Constant::Double(bits) => bits.to_le_bytes().to_vec(),
            Constant::Bytes(b) => b.to_vec(),
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "int {v}"),
            Constant::Long(v) => write!(f, "long {v}"),
            Constant::Float(bits) => write!(f, "float {} ({bits:#x})", f32::from_bits(*bits)),
            Constant::Double(bits) => write!(f, "double {} ({bits:#x})", f64::from_bits(*bits)),
            Constant::Bytes(b) => write!(f, "bytes[{}]", b.len()),
        }
    }
}

/// Handle to an item of one compilation's data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataRef(u32);

impl DataRef {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Address of a data item, handed to the instruction that loads it. The
/// displacement is fixed when the data section is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAddress {
    pub reference: DataRef,
    /// Start of the instruction that carries the reference.
    pub instruction_start: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    pub constant: Arc<Constant>,
    pub alignment: u32,
}

pub fn check_alignment(alignment: u32) -> EmitResult<()> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(EmitError::contract(format!(
            "data alignment {alignment} is not a power of two"
        )));
    }
    Ok(())
}

pub(crate) const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Final placement of the data section relative to the start of the code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataLayout {
    pub start: u32,
    pub alignment: u32,
    pub size: u32,
    offsets: Vec<u32>,
}

impl DataLayout {
    /// Offset of an item from the start of the code buffer.
    pub fn address_of(&self, item: DataRef) -> Option<u32> {
        self.offsets.get(item.index()).map(|off| self.start + off)
    }

    /// Offset of an item from the start of the data section.
    pub fn offset_in_section(&self, item: DataRef) -> Option<u32> {
        self.offsets.get(item.index()).copied()
    }
}

/// Ordered data items of one compilation.
#[derive(Debug, Clone, Default)]
pub struct DataSection {
    items: Vec<DataItem>,
    closed: bool,
}

impl DataSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, constant: Arc<Constant>, alignment: u32) -> EmitResult<DataRef> {
        if self.closed {
            return Err(EmitError::contract("data section is closed"));
        }
        check_alignment(alignment)?;
        if constant.size() == 0 {
            return Err(EmitError::contract("empty data item"));
        }
        let reference = DataRef(self.items.len() as u32);
        self.items.push(DataItem {
            constant,
            alignment,
        });
        Ok(reference)
    }

    /// Raise the alignment of an item to at least `alignment`.
    pub fn update_alignment(&mut self, item: DataRef, alignment: u32) -> EmitResult<()> {
        if self.closed {
            return Err(EmitError::contract("data section is closed"));
        }
        check_alignment(alignment)?;
        let entry = self
            .items
            .get_mut(item.index())
            .ok_or_else(|| EmitError::contract(format!("unknown data item {item}")))?;
        entry.alignment = entry.alignment.max(alignment);
        Ok(())
    }

    pub fn item(&self, item: DataRef) -> Option<&DataItem> {
        self.items.get(item.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (DataRef, &DataItem)> + '_ {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (DataRef(i as u32), item))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.closed = false;
    }

    /// Place items in insertion order after `code_size` bytes of code.
    pub fn layout(&self, code_size: u32, min_alignment: u32) -> DataLayout {
        let alignment = self
            .items
            .iter()
            .map(|item| item.alignment)
            .fold(min_alignment.max(1), u32::max);
        let start = align_up(code_size, alignment);
        let mut offsets = Vec::with_capacity(self.items.len());
        let mut size = 0;
        for item in &self.items {
            let offset = align_up(size, item.alignment);
            offsets.push(offset);
            size = offset + item.constant.size();
        }
        DataLayout {
            start,
            alignment,
            size,
            offsets,
        }
    }

    /// Serialize the section according to `layout`, zero padded.
    pub fn build(&self, layout: &DataLayout) -> Vec<u8> {
        let mut bytes = vec![0u8; layout.size as usize];
        for (i, item) in self.items.iter().enumerate() {
            let offset = layout.offsets[i] as usize;
            let payload = item.constant.to_le_bytes();
            bytes[offset..offset + payload.len()].copy_from_slice(&payload);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_respects_item_and_section_alignment() {
        let mut section = DataSection::new();
        let a = section
            .insert(Arc::new(Constant::Int(7)), 4)
            .unwrap();
        let b = section
            .insert(Arc::new(Constant::double(1.0)), 8)
            .unwrap();
        let layout = section.layout(13, 16);
        assert_eq!(layout.alignment, 16);
        assert_eq!(layout.start, 16);
        assert_eq!(layout.offset_in_section(a), Some(0));
        assert_eq!(layout.offset_in_section(b), Some(8));
        assert_eq!(layout.address_of(b), Some(24));
        assert_eq!(layout.size, 16);

        let bytes = section.build(&layout);
        assert_eq!(&bytes[0..4], &7i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &1.0f64.to_bits().to_le_bytes());
    }

    #[test]
    fn alignment_only_grows() {
        let mut section = DataSection::new();
        let r = section.insert(Arc::new(Constant::Long(1)), 8).unwrap();
        section.update_alignment(r, 4).unwrap();
        assert_eq!(section.item(r).unwrap().alignment, 8);
        section.update_alignment(r, 32).unwrap();
        assert_eq!(section.item(r).unwrap().alignment, 32);
    }

    #[test]
    fn invalid_requests_are_contract_errors() {
        let mut section = DataSection::new();
        let err = section
            .insert(Arc::new(Constant::Int(1)), 3)
            .unwrap_err();
        assert!(matches!(err, EmitError::Contract(_)));
        let err = section
            .insert(Arc::new(Constant::Bytes(Box::new([]))), 1)
            .unwrap_err();
        assert!(matches!(err, EmitError::Contract(_)));

        section.close();
        assert!(section.insert(Arc::new(Constant::Int(1)), 4).is_err());
    }

    #[test]
    fn float_constants_compare_by_bits() {
        assert_ne!(Constant::double(0.0), Constant::double(-0.0));
        assert_eq!(Constant::double(f64::NAN), Constant::double(f64::NAN));
        assert_eq!(Constant::Double(0x3FF0_0000_0000_0000), Constant::double(1.0));
    }
}
