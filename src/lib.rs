#![deny(unsafe_code)]
//! Module for parsing the box tree of HEIF / ISO Base Media Format files.
//!
//! A file is a sequence of length-prefixed boxes, some of which nest further
//! boxes. [`read_boxes`] decodes the whole tree into owned [`BmffBox`] nodes;
//! [`BoxReader`] does the same one top-level box at a time.
//!
//! Every decoder works on a byte budget taken from its parent, so a
//! truncated or hostile file can only ever produce errors, never reads past
//! a box boundary.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use arrayvec::{ArrayString, ArrayVec};
use log::{debug, warn};

use bitreader::BitReader;
use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use std::convert::{TryFrom, TryInto as _};

use std::io::Read;

mod boxes;
pub use crate::boxes::{BoxType, FourCC};

mod dump;


/// Upper bound for allocations sized from untrusted counts, before any
/// data backing them has actually been read.
const PREALLOC_LIMIT: u64 = 4096;

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// Indicate the current offset (i.e., bytes already read) in a reader
trait Offset {
    fn offset(&self) -> u64;
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;
/// Strings are kept as the raw bytes found in the file.
pub type TryString = fallible_collections::TryVec<u8>;

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser failures.
///
/// This enum wraps the standard `io::Error` type, unified with
/// our own parser error states and those of crates we use.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// The byte budget (or the underlying stream) ran out before a required
    /// field could be read.
    EndOfData,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::EndOfData => "end of data",
            Self::Io(err) => return err.fmt(f),
            Self::OutOfMemory => "OOM",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::EndOfData,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::EndOfData => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resource limits applied while building the box tree.
///
/// # Examples
///
/// ```rust
/// use zenheif_parse::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Tighter limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_max_depth(16)
///     .with_max_boxes(10_000);
///
/// // No limits at all
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Deepest nesting level a container may read children at.
    /// Default: 64
    pub max_depth: Option<u32>,

    /// Maximum number of boxes in the whole tree.
    /// Default: 1,000,000
    pub max_boxes: Option<u32>,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_depth: Some(64),
            max_boxes: Some(1_000_000),
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            max_depth: None,
            max_boxes: None,
        }
    }

    /// Set the maximum container nesting depth
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set the maximum number of boxes in the tree
    pub fn with_max_boxes(mut self, boxes: u32) -> Self {
        self.max_boxes = Some(boxes);
        self
    }
}

struct ParseContext {
    config: DecodeConfig,
    depth: u32,
    boxes: u32,
}

impl ParseContext {
    fn new(config: &DecodeConfig) -> Self {
        Self {
            config: config.clone(),
            depth: 0,
            boxes: 0,
        }
    }

    fn enter(&mut self) -> Result<()> {
        if let Some(limit) = self.config.max_depth {
            if self.depth >= limit {
                return Err(Error::ResourceLimitExceeded("box nesting depth limit exceeded"));
            }
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn check_box_count(&self) -> Result<()> {
        if let Some(limit) = self.config.max_boxes {
            if self.boxes >= limit {
                return Err(Error::ResourceLimitExceeded("box count limit exceeded"));
            }
        }
        Ok(())
    }

    fn count_box(&mut self) {
        self.boxes = self.boxes.saturating_add(1);
    }
}

/// A byte budget over the input stream.
///
/// Reads are charged against `remaining` before they touch the stream, so a
/// decoder can never get past the end of the box it was handed. A read that
/// doesn't fit sets `eof()` without charging anything; smaller reads that
/// still fit are allowed after that. Once the budget is gone `eof()` stays set.
struct BoxRange<'a, T> {
    src: &'a mut T,
    remaining: u64,
    end_reached: bool,
    /// Stream offset of the next unread byte.
    offset: u64,
    /// Running out of stream before the budget is spent is expected here:
    /// the unbounded top level, or a size-0 box inside another open-ended range.
    open_ended: bool,
}

impl<T> Offset for BoxRange<'_, T> {
    fn offset(&self) -> u64 {
        self.offset
    }
}

impl<'a, T: Read> BoxRange<'a, T> {
    fn new(src: &'a mut T, length: u64) -> Self {
        Self {
            src,
            remaining: length,
            end_reached: length == 0,
            offset: 0,
            open_ended: false,
        }
    }

    fn bytes_left(&self) -> u64 {
        self.remaining
    }

    fn eof(&self) -> bool {
        self.end_reached
    }

    /// Charge `n` bytes for an upcoming read.
    ///
    /// If fewer than `n` bytes are left nothing is charged, the range is
    /// marked as ended and `false` is returned.
    fn read(&mut self, n: u64) -> bool {
        if n > self.remaining {
            self.end_reached = true;
            return false;
        }
        self.consume(n);
        true
    }

    fn consume(&mut self, n: u64) {
        debug_assert!(n <= self.remaining);
        self.remaining -= n;
        self.offset = self.offset.saturating_add(n);
        if self.remaining == 0 {
            self.end_reached = true;
        }
    }

    fn require(&mut self, n: u64) -> Result<()> {
        if self.read(n) {
            Ok(())
        } else {
            Err(Error::EndOfData)
        }
    }

    /// The stream itself failed; nothing after this point can be trusted.
    #[cold]
    fn source_failed(&mut self, err: std::io::Error) -> Error {
        self.remaining = 0;
        self.end_reached = true;
        err.into()
    }

    /// Carve out the next `length` bytes for a child.
    ///
    /// The whole `length` is charged to `self` up front, no matter how much
    /// of it the child ends up reading, so siblings always start where the
    /// previous box said it would end.
    fn sub_range(&mut self, length: u64) -> Result<BoxRange<'_, T>> {
        let start = self.offset;
        if !self.read(length) {
            return Err(Error::EndOfData);
        }
        Ok(BoxRange {
            src: &mut *self.src,
            remaining: length,
            end_reached: length == 0,
            offset: start,
            open_ended: false,
        })
    }

    /// Advance the stream past whatever is left of this range.
    fn skip_remaining(&mut self) -> Result<()> {
        let limit = self.remaining;
        if limit == 0 {
            return Ok(());
        }
        let copied = std::io::copy(&mut self.src.by_ref().take(limit), &mut std::io::sink());
        let skipped = copied.map_err(|e| self.source_failed(e))?;
        self.consume(skipped.min(limit));
        if skipped < limit {
            self.remaining = 0;
            self.end_reached = true;
            if !self.open_ended {
                return Err(Error::EndOfData);
            }
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        let value = self.src.read_u8();
        value.map_err(|e| self.source_failed(e))
    }

    fn be_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        let value = self.src.read_u16::<byteorder::BigEndian>();
        value.map_err(|e| self.source_failed(e))
    }

    fn be_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        let value = self.src.read_u32::<byteorder::BigEndian>();
        value.map_err(|e| self.source_failed(e))
    }

    /// Two consecutive 32-bit words, high word first.
    fn be_u64(&mut self) -> Result<u64> {
        self.require(8)?;
        let high = self.src.read_u32::<byteorder::BigEndian>();
        let high = high.map_err(|e| self.source_failed(e))?;
        let low = self.src.read_u32::<byteorder::BigEndian>();
        let low = low.map_err(|e| self.source_failed(e))?;
        Ok(u64::from(high) << 32 | u64::from(low))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.require(buf.len().to_u64())?;
        let read = self.src.read_exact(buf);
        read.map_err(|e| self.source_failed(e))
    }

    /// A NUL-terminated string, without the terminator.
    fn read_string(&mut self) -> Result<TryString> {
        let mut s = TryString::new();
        loop {
            match self.read_u8()? {
                0 => return Ok(s),
                c => s.push(c)?,
            }
        }
    }

    /// Everything up to the end of the range.
    fn read_into_try_vec(&mut self) -> Result<TryVec<u8>> {
        let limit = self.remaining;
        let mut vec = std::vec::Vec::new();
        vec.try_reserve_exact(limit.min(PREALLOC_LIMIT).try_into()?)
            .map_err(|_| Error::OutOfMemory)?;
        let result = self.src.by_ref().take(limit).read_to_end(&mut vec);
        let read = result.map_err(|e| self.source_failed(e))?.to_u64();
        self.consume(read.min(limit));
        if read < limit {
            self.remaining = 0;
            self.end_reached = true;
            if !self.open_ended {
                return Err(Error::EndOfData);
            }
        }
        Ok(vec.into())
    }
}

/// Capacity to reserve for `count` entries of at least `min_entry_size`
/// bytes each, given what is left in `src`.
fn capacity_for<T: Read>(count: u64, src: &BoxRange<'_, T>, min_entry_size: u64) -> Result<usize> {
    Ok(count.min(src.bytes_left() / min_entry_size).min(PREALLOC_LIMIT).try_into()?)
}

/// Basic ISO box structure.
///
/// mp4 files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box. Together these
/// are enough to interpret the contents of that section of the file.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    /// Box type.
    name: BoxType,
    /// Size of the box in bytes, header included. 0 means the box runs to
    /// the end of its container.
    size: u64,
    /// Bytes taken by the header itself: 8, 16, 24 or 32.
    header_size: u64,
    /// Uuid for extended type.
    uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    const MIN_LARGE_SIZE: u64 = 16;
    /// Extended type of a 'uuid' box
    const UUID_SIZE: u64 = 16;
    /// Sentinel for "extends to the end of the container"
    pub const SIZE_UNTIL_END: u64 = 0;

    pub fn box_type(&self) -> BoxType {
        self.name
    }

    pub fn fourcc(&self) -> FourCC {
        self.name.into()
    }

    /// Declared size, header included. See [`Self::SIZE_UNTIL_END`].
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn uuid(&self) -> Option<&[u8; 16]> {
        self.uuid.as_ref()
    }

    /// The raw type: 16 bytes for 'uuid' boxes, the four-character code otherwise.
    pub fn type_bytes(&self) -> ArrayVec<u8, 16> {
        let mut bytes = ArrayVec::new();
        match &self.uuid {
            Some(uuid) => bytes.extend(uuid.iter().copied()),
            None => bytes.extend(self.fourcc().value),
        }
        bytes
    }

    /// Human-readable type: the four characters, or the extended type of a
    /// 'uuid' box formatted as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
    pub fn type_string(&self) -> ArrayString<36> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut s = ArrayString::new();
        match &self.uuid {
            Some(uuid) => {
                for (i, &b) in uuid.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        s.push('-');
                    }
                    s.push(HEX[usize::from(b >> 4)] as char);
                    s.push(HEX[usize::from(b & 0xf)] as char);
                }
            },
            None => {
                for b in self.fourcc().value {
                    s.push(if b.is_ascii() { b as char } else { '?' });
                }
            },
        }
        s
    }

    /// Payload length, or `None` when the box runs to the end of its container.
    fn content_size(&self) -> Result<Option<u64>> {
        if self.size == Self::SIZE_UNTIL_END {
            return Ok(None);
        }
        self.size
            .checked_sub(self.header_size)
            .map(Some)
            .ok_or(Error::InvalidData("box size smaller than its header"))
    }
}

/// Version and flags of a full box.
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullBoxHeader {
    pub version: u8,
    /// Only the low 24 bits are used.
    pub flags: u32,
}

/// Read and parse a box header.
///
/// Call this first to determine the type of a particular box and its
/// length. Used internally for dispatching to specific parsers for the
/// internal content, or to get the length to skip unknown or uninteresting
/// boxes.
///
/// See ISO 14496-12:2015 § 4.2
fn read_box_header<T: Read>(src: &mut BoxRange<'_, T>) -> Result<BoxHeader> {
    let size32 = src.be_u32()?;
    let name = BoxType::from(src.be_u32()?);
    let (size, mut header_size) = match size32 {
        1 => (src.be_u64()?, BoxHeader::MIN_LARGE_SIZE),
        _ => (u64::from(size32), BoxHeader::MIN_SIZE),
    };
    let uuid = if name == BoxType::UuidBox {
        let mut buffer = [0u8; 16];
        src.read_exact(&mut buffer)?;
        header_size += BoxHeader::UUID_SIZE;
        Some(buffer)
    } else {
        None
    };
    Ok(BoxHeader { name, size, header_size, uuid })
}

/// Parse the extra header fields for a full box.
fn read_fullbox_extra<T: Read>(src: &mut BoxRange<'_, T>) -> Result<FullBoxHeader> {
    let data = src.be_u32()?;
    Ok(FullBoxHeader {
        version: (data >> 24) as u8,
        flags: data & 0x00FF_FFFF,
    })
}

/// One node of the box tree.
///
/// A box whose payload failed to decode is still part of the tree: its
/// header is known and its span was skipped, and [`Self::error`] says what
/// went wrong.
#[derive(Debug)]
pub struct BmffBox {
    head: BoxHeader,
    offset: u64,
    full: Option<FullBoxHeader>,
    payload: BoxPayload,
    children: TryVec<BmffBox>,
    error: Option<Error>,
}

impl BmffBox {
    fn new(head: BoxHeader, offset: u64) -> Self {
        Self {
            head,
            offset,
            full: None,
            payload: BoxPayload::Opaque,
            children: TryVec::new(),
            error: None,
        }
    }

    pub fn header(&self) -> &BoxHeader {
        &self.head
    }

    pub fn box_type(&self) -> BoxType {
        self.head.name
    }

    pub fn fourcc(&self) -> FourCC {
        self.head.fourcc()
    }

    pub fn type_string(&self) -> ArrayString<36> {
        self.head.type_string()
    }

    /// Declared size, header included. 0 for boxes running to the end of
    /// their container.
    pub fn size(&self) -> u64 {
        self.head.size
    }

    pub fn header_size(&self) -> u64 {
        self.head.header_size
    }

    /// Stream offset of the first header byte, relative to where reading started.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Version and flags, for full boxes whose header could be read.
    pub fn full_header(&self) -> Option<FullBoxHeader> {
        self.full
    }

    pub fn payload(&self) -> &BoxPayload {
        &self.payload
    }

    pub fn children(&self) -> &[BmffBox] {
        &self.children
    }

    /// Why this box's payload could not be fully decoded, if it couldn't.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// First direct child of the given type.
    pub fn child(&self, box_type: BoxType) -> Option<&Self> {
        self.children.iter().find(|b| b.head.name == box_type)
    }

    /// First box of the given type in this subtree, depth-first, including `self`.
    pub fn find(&self, box_type: BoxType) -> Option<&Self> {
        if self.head.name == box_type {
            return Some(self);
        }
        self.children.iter().find_map(|b| b.find(box_type))
    }

    /// Entries of an 'iinf' box, in stream order.
    pub fn item_infos(&self) -> impl Iterator<Item = &ItemInfoEntry> {
        self.children.iter().filter_map(|b| match &b.payload {
            BoxPayload::ItemInfoEntry(entry) => Some(entry),
            _ => None,
        })
    }

    fn version(&self) -> u8 {
        self.full.map_or(0, |full| full.version)
    }

    fn flags(&self) -> u32 {
        self.full.map_or(0, |full| full.flags)
    }
}

/// Decoded fields of a box, by type.
#[derive(Debug)]
pub enum BoxPayload {
    /// Unknown type, or a box that failed to decode. Its bytes were skipped.
    Opaque,
    /// A box holding nothing but child boxes ('meta', 'iprp', 'ipco').
    Container,
    FileType(FileTypeBox),
    Handler(HandlerBox),
    PrimaryItem(PrimaryItemBox),
    ItemLocation(ItemLocationBox),
    /// The entries themselves are the 'infe' children of the node.
    ItemInfo(ItemInfoBox),
    ItemInfoEntry(ItemInfoEntry),
    ItemReference(ItemReferenceBox),
    ImageSpatialExtents(ImageSpatialExtents),
    PropertyAssociation(ItemPropertyAssociationBox),
    PixelInformation(PixelInformation),
    AuxiliaryType(AuxiliaryTypeProperty),
}

/// File type box 'ftyp'.
#[derive(Debug, PartialEq)]
pub struct FileTypeBox {
    pub major_brand: FourCC,
    pub minor_version: u32,
    pub compatible_brands: TryVec<FourCC>,
}

/// Handler reference box 'hdlr'
#[derive(Debug, PartialEq)]
pub struct HandlerBox {
    pub pre_defined: u32,
    pub handler_type: FourCC,
    pub reserved: [u32; 3],
    pub name: TryString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryItemBox {
    pub item_id: u32,
}

/// Image spatial extents (dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpatialExtents {
    pub width: u32,
    pub height: u32,
}

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// An absent field reads as 0.
    fn read<T: Read>(self, src: &mut BoxRange<'_, T>) -> Result<u64> {
        match self {
            Self::Zero => Ok(0),
            Self::Four => src.be_u32().map(u64::from),
            Self::Eight => src.be_u64(),
        }
    }
}

impl From<u8> for IlocFieldSize {
    /// Codes other than 4 and 8 are treated as an absent field.
    fn from(value: u8) -> Self {
        match value {
            4 => Self::Four,
            8 => Self::Eight,
            _ => Self::Zero,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

/// Item location box 'iloc'
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug, PartialEq)]
pub struct ItemLocationBox {
    pub offset_size: IlocFieldSize,
    pub length_size: IlocFieldSize,
    pub base_offset_size: IlocFieldSize,
    /// Always `Zero` for version 0 boxes.
    pub index_size: IlocFieldSize,
    pub items: TryVec<ItemLocationBoxItem>,
}

#[derive(Debug, PartialEq)]
pub struct ItemLocationBoxItem {
    pub item_id: u32,
    /// `File` for version 0 boxes, which have no such field.
    pub construction_method: ConstructionMethod,
    pub data_reference_index: u16,
    pub base_offset: u64,
    pub extents: TryVec<ItemLocationBoxExtent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstructionMethod {
    File,
    Idat,
    Item,
    Reserved(u8),
}

impl From<u8> for ConstructionMethod {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::File,
            1 => Self::Idat,
            2 => Self::Item,
            other => Self::Reserved(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemLocationBoxExtent {
    /// Only present in version 1 and 2 boxes with a non-zero index_size.
    pub index: Option<u64>,
    pub offset: u64,
    pub length: u64,
}

/// Item information box 'iinf'
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfoBox {
    pub entry_count: u32,
}

/// Used for 'infe' boxes within 'iinf' boxes
/// See ISO 14496-12:2015 § 8.11.6
#[derive(Debug, PartialEq)]
pub struct ItemInfoEntry {
    pub item_id: u32,
    pub item_protection_index: u16,
    /// Only versions 2 and up carry an item type.
    pub item_type: Option<FourCC>,
    pub item_name: TryString,
    pub content_type: TryString,
    pub content_encoding: TryString,
    pub item_uri_type: TryString,
}

/// Item reference box 'iref'
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug, PartialEq)]
pub struct ItemReferenceBox {
    pub references: TryVec<SingleItemTypeReference>,
}

#[derive(Debug, PartialEq)]
pub struct SingleItemTypeReference {
    pub reference_type: FourCC,
    pub from_item_id: u32,
    pub to_item_ids: TryVec<u32>,
}

/// Item property association box 'ipma'
/// See ISO/IEC 23008-12:2017 § 9.3
#[derive(Debug, PartialEq)]
pub struct ItemPropertyAssociationBox {
    pub associations: TryVec<Association>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub item_id: u32,
    pub essential: bool,
    /// 1-based index into the 'ipco' children; 0 means no property.
    pub property_index: u16,
}

/// Pixel information property 'pixi'
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelInformation {
    pub bits_per_channel: ArrayVec<u8, 16>,
}

/// Auxiliary type property 'auxC'
#[derive(Debug, PartialEq)]
pub struct AuxiliaryTypeProperty {
    pub aux_type: TryString,
    pub aux_subtype: TryVec<u8>,
}

/// Reads top-level boxes one at a time.
///
/// ```no_run
/// use zenheif_parse::BoxReader;
///
/// let mut file = std::fs::File::open("image.heic")?;
/// for b in BoxReader::new(&mut file) {
///     println!("{} ({} bytes)", b.type_string(), b.size());
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct BoxReader<'a, T> {
    range: BoxRange<'a, T>,
    ctx: ParseContext,
}

impl<'a, T: Read> BoxReader<'a, T> {
    /// Read until the stream ends, with default limits.
    pub fn new(src: &'a mut T) -> Self {
        let mut reader = Self::with_config(src, u64::MAX, &DecodeConfig::default());
        reader.range.open_ended = true;
        reader
    }

    /// Read at most `budget` bytes from `src`.
    pub fn with_config(src: &'a mut T, budget: u64, config: &DecodeConfig) -> Self {
        Self {
            range: BoxRange::new(src, budget),
            ctx: ParseContext::new(config),
        }
    }

    /// The next top-level box, or `None` once no further box header can be read.
    pub fn next_box(&mut self) -> Option<BmffBox> {
        if self.range.eof() {
            return None;
        }
        if let Err(err) = self.ctx.check_box_count() {
            warn!("stopping at offset {}: {err}", self.range.offset());
            return None;
        }
        read_box(&mut self.range, &mut self.ctx)
    }
}

impl<T: Read> Iterator for BoxReader<'_, T> {
    type Item = BmffBox;

    fn next(&mut self) -> Option<BmffBox> {
        self.next_box()
    }
}

/// Read every box in `f`, with default limits.
pub fn read_boxes<T: Read>(f: &mut T) -> Result<TryVec<BmffBox>> {
    collect_boxes(BoxReader::new(f))
}

/// Read the boxes in the first `budget` bytes of `f`.
pub fn read_boxes_with_config<T: Read>(f: &mut T, budget: u64, config: &DecodeConfig) -> Result<TryVec<BmffBox>> {
    collect_boxes(BoxReader::with_config(f, budget, config))
}

fn collect_boxes<T: Read>(reader: BoxReader<'_, T>) -> Result<TryVec<BmffBox>> {
    let mut boxes = TryVec::new();
    for b in reader {
        boxes.push(b)?;
    }
    Ok(boxes)
}

/// Read one box and its subtree.
///
/// Returns `None` when not even a header could be read; `src` is then at its end.
/// Payload errors are recorded on the returned box instead, and the parent
/// is charged for the whole declared span either way.
fn read_box<T: Read>(src: &mut BoxRange<'_, T>, ctx: &mut ParseContext) -> Option<BmffBox> {
    let offset = src.offset();
    let head = match read_box_header(src) {
        Ok(head) => head,
        Err(Error::EndOfData) => return None,
        Err(err) => {
            warn!("unreadable box header at offset {offset}: {err}");
            return None;
        },
    };
    ctx.count_box();
    let mut b = BmffBox::new(head, offset);

    let content_size = match head.content_size() {
        Ok(size) => size.unwrap_or_else(|| src.bytes_left()),
        Err(err) => {
            // Nowhere to resume from; the rest of the parent is unusable
            warn!("'{}' at offset {offset}: {err}", head.type_string());
            b.error = Some(err);
            if let Err(err) = src.skip_remaining() {
                debug!("skipping rest of container: {err}");
            }
            return Some(b);
        },
    };

    let parent_open_ended = src.open_ended;
    let mut content = match src.sub_range(content_size) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "'{}' at offset {offset} claims {content_size} bytes, only {} left",
                head.type_string(),
                src.bytes_left()
            );
            b.error = Some(err);
            return Some(b);
        },
    };
    // Only a box that runs to the end of an unbounded stream may end early
    content.open_ended = head.size == BoxHeader::SIZE_UNTIL_END && parent_open_ended;

    if let Err(err) = read_box_content(&mut b, &mut content, ctx) {
        warn!("'{}' at offset {offset}: {err}", head.type_string());
        b.error = Some(err);
    }

    let unread = content.bytes_left();
    if unread > 0 {
        debug!("Dropping {unread} bytes in '{}'", head.type_string());
    }
    if let Err(err) = content.skip_remaining() {
        if b.error.is_none() {
            b.error = Some(err);
        }
    }
    Some(b)
}

/// Decode the payload of `b` according to its type.
fn read_box_content<T: Read>(b: &mut BmffBox, src: &mut BoxRange<'_, T>, ctx: &mut ParseContext) -> Result<()> {
    let name = b.head.name;
    if name.is_full_box() {
        b.full = Some(read_fullbox_extra(src)?);
    }
    let version = b.version();

    b.payload = match name {
        BoxType::FileTypeBox => BoxPayload::FileType(read_ftyp(src)?),
        BoxType::MetadataBox | BoxType::ImagePropertiesBox | BoxType::ItemPropertyContainerBox => {
            read_children(src, &mut b.children, ctx)?;
            BoxPayload::Container
        },
        BoxType::HandlerBox => BoxPayload::Handler(read_hdlr(src)?),
        BoxType::PrimaryItemBox => BoxPayload::PrimaryItem(read_pitm(src, version)?),
        BoxType::ItemLocationBox => BoxPayload::ItemLocation(read_iloc(src, version)?),
        BoxType::ItemInfoBox => BoxPayload::ItemInfo(read_iinf(src, version, &mut b.children, ctx)?),
        BoxType::ItemInfoEntry => BoxPayload::ItemInfoEntry(read_infe(src, version)?),
        BoxType::ImageReferenceBox => BoxPayload::ItemReference(read_iref(src, version)?),
        BoxType::ImageSpatialExtentsBox => BoxPayload::ImageSpatialExtents(read_ispe(src)?),
        BoxType::ItemPropertyAssociationBox => BoxPayload::PropertyAssociation(read_ipma(src, version, b.flags())?),
        BoxType::PixelInformationBox => BoxPayload::PixelInformation(read_pixi(src, version)?),
        BoxType::AuxiliaryTypeProperty => BoxPayload::AuxiliaryType(read_auxc(src, version)?),
        BoxType::UuidBox | BoxType::UnknownBox(_) => {
            skip_box_content(&b.head, src)?;
            BoxPayload::Opaque
        },
    };
    Ok(())
}

/// Read boxes until `src` is used up.
///
/// Running out of data is the normal way for this to end, not an error.
fn read_children<T: Read>(
    src: &mut BoxRange<'_, T>,
    children: &mut TryVec<BmffBox>,
    ctx: &mut ParseContext,
) -> Result<()> {
    ctx.enter()?;
    let result = read_box_list(src, children, ctx);
    ctx.leave();
    result
}

fn read_box_list<T: Read>(
    src: &mut BoxRange<'_, T>,
    children: &mut TryVec<BmffBox>,
    ctx: &mut ParseContext,
) -> Result<()> {
    while !src.eof() {
        ctx.check_box_count()?;
        if let Some(b) = read_box(src, ctx) {
            children.push(b)?;
        }
    }
    Ok(())
}

/// Skip over the entire contents of a box.
fn skip_box_content<T: Read>(header: &BoxHeader, src: &mut BoxRange<'_, T>) -> Result<()> {
    debug!("{header:?} (skipped)");
    src.skip_remaining()
}

/// Parse an ftyp box.
/// See ISO 14496-12:2015 § 4.3
fn read_ftyp<T: Read>(src: &mut BoxRange<'_, T>) -> Result<FileTypeBox> {
    let major = src.be_u32()?;
    let minor = src.be_u32()?;
    // Not stored in the file; whatever is left holds the brands
    let mut brands = TryVec::with_capacity(capacity_for(src.bytes_left() / 4, src, 4)?)?;
    while src.bytes_left() >= 4 {
        match src.be_u32() {
            Ok(brand) => brands.push(brand.into())?,
            // A size-0 'ftyp' at the end of the file ends with the stream
            Err(Error::EndOfData) if src.open_ended => break,
            Err(err) => return Err(err),
        }
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// Parse a Handler Reference box
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr<T: Read>(src: &mut BoxRange<'_, T>) -> Result<HandlerBox> {
    let pre_defined = src.be_u32()?;
    let handler_type = FourCC::from(src.be_u32()?);
    let reserved = [src.be_u32()?, src.be_u32()?, src.be_u32()?];
    let name = src.read_string()?;
    Ok(HandlerBox {
        pre_defined,
        handler_type,
        reserved,
        name,
    })
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
fn read_pitm<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<PrimaryItemBox> {
    let item_id = match version {
        0 => src.be_u16()?.into(),
        1 => src.be_u32()?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };

    Ok(PrimaryItemBox { item_id })
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
fn read_iloc<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<ItemLocationBox> {
    let version: IlocVersion = version.try_into()?;

    let descriptor = src.be_u16()?.to_be_bytes();
    let mut descriptor = BitReader::new(&descriptor);

    let offset_size = IlocFieldSize::from(descriptor.read_u8(4)?);
    let length_size = IlocFieldSize::from(descriptor.read_u8(4)?);
    let base_offset_size = IlocFieldSize::from(descriptor.read_u8(4)?);

    // The fourth nibble is reserved in version 0
    let index_size = match version {
        IlocVersion::One | IlocVersion::Two => IlocFieldSize::from(descriptor.read_u8(4)?),
        IlocVersion::Zero => IlocFieldSize::Zero,
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => src.be_u16()?.into(),
        IlocVersion::Two => src.be_u32()?,
    };

    // item_ID + data_reference_index + extent_count
    let mut items = TryVec::with_capacity(capacity_for(item_count.into(), src, 6)?)?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => src.be_u16()?.into(),
            IlocVersion::Two => src.be_u32()?,
        };

        // Version 0 has no construction_method field; it always means file offsets.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => ConstructionMethod::from((src.be_u16()? & 0xF) as u8),
        };

        let data_reference_index = src.be_u16()?;
        let base_offset = base_offset_size.read(src)?;
        let extent_count = src.be_u16()?;

        let min_extent_size = u64::from(offset_size.bytes() + length_size.bytes() + index_size.bytes()).max(1);
        let mut extents = TryVec::with_capacity(capacity_for(extent_count.into(), src, min_extent_size)?)?;

        for _ in 0..extent_count {
            let index = match index_size {
                IlocFieldSize::Zero => None,
                index_size => Some(index_size.read(src)?),
            };
            let offset = offset_size.read(src)?;
            let length = length_size.read(src)?;
            extents.push(ItemLocationBoxExtent { index, offset, length })?;
        }

        items.push(ItemLocationBoxItem {
            item_id,
            construction_method,
            data_reference_index,
            base_offset,
            extents,
        })?;
    }

    Ok(ItemLocationBox {
        offset_size,
        length_size,
        base_offset_size,
        index_size,
        items,
    })
}

/// Parse an Item Information Box
///
/// Exactly `entry_count` children are read, and each one has to be a
/// well-formed 'infe'.
/// See ISO 14496-12:2015 § 8.11.6
fn read_iinf<T: Read>(
    src: &mut BoxRange<'_, T>,
    version: u8,
    children: &mut TryVec<BmffBox>,
    ctx: &mut ParseContext,
) -> Result<ItemInfoBox> {
    let entry_count = if version == 0 {
        src.be_u16()?.into()
    } else {
        src.be_u32()?
    };

    ctx.enter()?;
    let result = read_item_info_entries(src, entry_count, children, ctx);
    ctx.leave();
    result?;

    Ok(ItemInfoBox { entry_count })
}

fn read_item_info_entries<T: Read>(
    src: &mut BoxRange<'_, T>,
    entry_count: u32,
    children: &mut TryVec<BmffBox>,
    ctx: &mut ParseContext,
) -> Result<()> {
    for _ in 0..entry_count {
        ctx.check_box_count()?;
        let b = read_box(src, ctx).ok_or(Error::EndOfData)?;
        let is_infe = b.head.name == BoxType::ItemInfoEntry;
        let failure = match &b.error {
            None => None,
            Some(Error::EndOfData) => Some(Error::EndOfData),
            Some(_) => Some(Error::InvalidData("malformed infe box in iinf")),
        };
        children.push(b)?;
        if !is_infe {
            return Err(Error::InvalidData("iinf box should contain only infe boxes"));
        }
        if let Some(err) = failure {
            return Err(err);
        }
    }
    Ok(())
}

/// Parse an Item Info Entry
///
/// Versions 0 and 1 carry name, content type and encoding strings; from
/// version 2 on there is an item type, and which strings follow depends on it.
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<ItemInfoEntry> {
    let mut item_id = 0;
    let mut item_protection_index = 0;
    let mut item_type = None;
    let mut item_name = TryString::new();
    let mut content_type = TryString::new();
    let mut content_encoding = TryString::new();
    let mut item_uri_type = TryString::new();

    if version <= 1 {
        item_id = src.be_u16()?.into();
        item_protection_index = src.be_u16()?;
        item_name = src.read_string()?;
        content_type = src.read_string()?;
        content_encoding = read_optional_string(src)?;
    }

    if version >= 2 {
        item_id = if version == 2 {
            src.be_u16()?.into()
        } else {
            src.be_u32()?
        };
        item_protection_index = src.be_u16()?;
        let fourcc = FourCC::from(src.be_u32()?);
        item_type = Some(fourcc);

        item_name = src.read_string()?;
        if fourcc == b"mime" {
            content_type = src.read_string()?;
            content_encoding = read_optional_string(src)?;
        } else if fourcc == b"uri " {
            item_uri_type = src.read_string()?;
        }
    }

    debug!("infe item_id {item_id} item_type: {item_type:?}");

    Ok(ItemInfoEntry {
        item_id,
        item_protection_index,
        item_type,
        item_name,
        content_type,
        content_encoding,
        item_uri_type,
    })
}

/// content_encoding may be left out entirely at the end of an 'infe'.
fn read_optional_string<T: Read>(src: &mut BoxRange<'_, T>) -> Result<TryString> {
    if src.bytes_left() == 0 {
        Ok(TryString::new())
    } else {
        src.read_string()
    }
}

/// Parse an Item Reference box; each child box is one reference type.
/// See ISO 14496-12:2015 § 8.11.12
fn read_iref<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<ItemReferenceBox> {
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    let mut references = TryVec::new();
    while !src.eof() {
        let head = read_box_header(src)?;
        let size = head.content_size()?.unwrap_or_else(|| src.bytes_left());
        let mut b = src.sub_range(size)?;

        let from_item_id = if version == 0 {
            b.be_u16()?.into()
        } else {
            b.be_u32()?
        };
        let reference_count = b.be_u16()?;
        let id_size = if version == 0 { 2 } else { 4 };
        let mut to_item_ids = TryVec::with_capacity(capacity_for(reference_count.into(), &b, id_size)?)?;
        for _ in 0..reference_count {
            let to_item_id = if version == 0 {
                b.be_u16()?.into()
            } else {
                b.be_u32()?
            };
            if from_item_id == to_item_id {
                return Err(Error::InvalidData("from_item_id and to_item_id must be different"));
            }
            to_item_ids.push(to_item_id)?;
        }
        b.skip_remaining()?;

        references.push(SingleItemTypeReference {
            reference_type: head.fourcc(),
            from_item_id,
            to_item_ids,
        })?;
    }
    Ok(ItemReferenceBox { references })
}

/// Parse an Item Property Association box
/// See ISO/IEC 23008-12:2017 § 9.3
fn read_ipma<T: Read>(src: &mut BoxRange<'_, T>, version: u8, flags: u32) -> Result<ItemPropertyAssociationBox> {
    let mut associations = TryVec::new();

    let entry_count = src.be_u32()?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            src.be_u16()?.into()
        } else {
            src.be_u32()?
        };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association {
                item_id,
                essential,
                property_index,
            })?;
        }
    }
    Ok(ItemPropertyAssociationBox { associations })
}

/// Parse an Image Spatial Extents property box
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe<T: Read>(src: &mut BoxRange<'_, T>) -> Result<ImageSpatialExtents> {
    let width = src.be_u32()?;
    let height = src.be_u32()?;
    Ok(ImageSpatialExtents { width, height })
}

fn read_pixi<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<PixelInformation> {
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = src.read_u8()?.to_usize();
    let mut channels = ArrayVec::<u8, 16>::new();
    if num_channels > channels.capacity() {
        return Err(Error::InvalidData("invalid num_channels"));
    }
    channels.extend((0..num_channels).map(|_| 0));
    src.read_exact(&mut channels)?;

    Ok(PixelInformation { bits_per_channel: channels })
}

fn read_auxc<T: Read>(src: &mut BoxRange<'_, T>, version: u8) -> Result<AuxiliaryTypeProperty> {
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }

    let aux_type = src.read_string()?;
    let aux_subtype = src.read_into_try_vec()?;

    Ok(AuxiliaryTypeProperty { aux_type, aux_subtype })
}
