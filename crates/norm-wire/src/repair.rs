//! Repair request wire form.
//!
//! # Wire Format
//!
//! ```text
//! REPAIR REQUEST
//!
//!   Byte  0:      Form (1 = items, 2 = ranges, 3 = erasures)
//!   Byte  1:      Flags (0x01 SEGMENT, 0x02 BLOCK, 0x04 INFO, 0x08 OBJECT)
//!   Bytes 2-3:    Item payload length in bytes (u16 LE)
//!   Bytes 4+:     Repair items (10 bytes each)
//!
//! REPAIR ITEM
//!
//!   Bytes 0-1:    Object ID (u16 LE)
//!   Bytes 2-5:    Block ID (u32 LE)
//!   Bytes 6-7:    FEC block length / data symbol count (u16 LE)
//!   Bytes 8-9:    Symbol ID (u16 LE)
//! ```
//!
//! A RANGES request encodes each consecutive run as two adjacent items: the
//! run's first and last symbol. The selection rule is observable on the wire
//! and fixed: runs of one or two symbols use ITEMS, runs of three or more use
//! RANGES.

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use norm_core::{BlockId, ObjectId, SegmentId};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Repair request header length in bytes.
pub const REPAIR_REQUEST_HEADER_LEN: usize = 4;

/// Repair item length in bytes.
pub const REPAIR_ITEM_LEN: usize = 10;

bitflags! {
    /// Repair request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RepairFlags: u8 {
        /// Individual segments are requested.
        const SEGMENT = 0x01;
        /// Whole blocks are requested.
        const BLOCK = 0x02;
        /// Object info is also missing.
        const INFO = 0x04;
        /// Whole objects are requested.
        const OBJECT = 0x08;
    }
}

/// How a repair request lists its symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RepairForm {
    /// No form chosen yet; never emitted on the wire.
    #[default]
    Invalid = 0,
    /// One item per symbol.
    Items = 1,
    /// First/last item pairs covering consecutive runs.
    Ranges = 2,
    /// Erasure-count form; defined by the wire but not produced here.
    Erasures = 3,
}

impl RepairForm {
    const fn to_wire(self) -> u8 {
        self as u8
    }

    fn from_wire(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Self::Items),
            2 => Ok(Self::Ranges),
            3 => Ok(Self::Erasures),
            _ => Err(WireError::InvalidForm { value }),
        }
    }
}

/// One repair item: an (object, block, symbol) coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairItem {
    pub object_id: ObjectId,
    pub block_id: BlockId,
    /// FEC block length (data symbol count) of the referenced block.
    pub num_data: u16,
    pub symbol_id: SegmentId,
}

impl RepairItem {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.object_id.raw());
        buf.put_u32_le(self.block_id.raw());
        buf.put_u16_le(self.num_data);
        buf.put_u16_le(self.symbol_id);
    }

    fn decode(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= REPAIR_ITEM_LEN);
        Self {
            object_id: ObjectId::new(u16::from_le_bytes([bytes[0], bytes[1]])),
            block_id: BlockId::new(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])),
            num_data: u16::from_le_bytes([bytes[6], bytes[7]]),
            symbol_id: u16::from_le_bytes([bytes[8], bytes[9]]),
        }
    }
}

/// A repair request under construction or decoded off the wire.
///
/// The form is read at pack time, so callers may set it before or after the
/// request is attached to a message; both orders produce identical bytes.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    flags: RepairFlags,
    form: RepairForm,
    items: Vec<RepairItem>,
}

impl RepairRequest {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: RepairFlags::empty(),
            form: RepairForm::Invalid,
            items: Vec::new(),
        }
    }

    /// Add `flag` to the request's flag set.
    pub fn set_flag(&mut self, flag: RepairFlags) {
        self.flags |= flag;
    }

    #[must_use]
    pub const fn flags(&self) -> RepairFlags {
        self.flags
    }

    pub fn set_form(&mut self, form: RepairForm) {
        self.form = form;
    }

    #[must_use]
    pub const fn form(&self) -> RepairForm {
        self.form
    }

    #[must_use]
    pub fn items(&self) -> &[RepairItem] {
        &self.items
    }

    /// Append a single-symbol item.
    pub fn append_repair_item(
        &mut self,
        object_id: ObjectId,
        block_id: BlockId,
        num_data: u16,
        symbol_id: SegmentId,
    ) {
        self.items.push(RepairItem {
            object_id,
            block_id,
            num_data,
            symbol_id,
        });
    }

    /// Append a first/last pair covering a consecutive run.
    pub fn append_repair_range(&mut self, first: RepairItem, last: RepairItem) {
        self.items.push(first);
        self.items.push(last);
    }

    /// Encoded size: header plus items.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        REPAIR_REQUEST_HEADER_LEN + self.items.len() * REPAIR_ITEM_LEN
    }

    /// Serialize into `buf`.
    #[allow(clippy::cast_possible_truncation)] // item payload bounded by segment size
    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(self.form != RepairForm::Invalid, "packing a formless request");
        buf.put_u8(self.form.to_wire());
        buf.put_u8(self.flags.bits());
        buf.put_u16_le((self.items.len() * REPAIR_ITEM_LEN) as u16);
        for item in &self.items {
            item.encode_into(buf);
        }
    }

    /// Drop accumulated items and form so the builder can be reused for the
    /// next request in the same message.
    pub(crate) fn reset(&mut self) {
        self.items.clear();
        self.form = RepairForm::Invalid;
    }

    /// Decode one request from the front of `bytes`.
    ///
    /// Returns the request and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `WireError` on a truncated header, unknown form, item payload
    /// longer than the buffer, or a RANGES payload with an odd item count.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WireError> {
        if bytes.len() < REPAIR_REQUEST_HEADER_LEN {
            return Err(WireError::TooShort {
                len: bytes.len(),
                min: REPAIR_REQUEST_HEADER_LEN,
            });
        }
        let form = RepairForm::from_wire(bytes[0])?;
        let flags = RepairFlags::from_bits_truncate(bytes[1]);
        let claimed = usize::from(u16::from_le_bytes([bytes[2], bytes[3]]));
        let available = bytes.len() - REPAIR_REQUEST_HEADER_LEN;
        if claimed > available || claimed % REPAIR_ITEM_LEN != 0 {
            return Err(WireError::LengthMismatch { claimed, available });
        }
        let item_count = claimed / REPAIR_ITEM_LEN;
        if form == RepairForm::Ranges && item_count % 2 != 0 {
            return Err(WireError::DanglingRangeItem);
        }
        let mut items = Vec::with_capacity(item_count);
        for i in 0..item_count {
            let start = REPAIR_REQUEST_HEADER_LEN + i * REPAIR_ITEM_LEN;
            items.push(RepairItem::decode(&bytes[start..start + REPAIR_ITEM_LEN]));
        }
        Ok((
            Self { flags, form, items },
            REPAIR_REQUEST_HEADER_LEN + claimed,
        ))
    }

    /// Expand the request into the symbol-id sequence it encodes.
    ///
    /// ITEMS yields each item's symbol; RANGES yields every symbol of each
    /// first/last pair inclusive. ERASURES carries counts, not ids, and
    /// yields nothing.
    #[must_use]
    pub fn symbol_ids(&self) -> Vec<SegmentId> {
        match self.form {
            RepairForm::Items => self.items.iter().map(|item| item.symbol_id).collect(),
            RepairForm::Ranges => self
                .items
                .chunks_exact(2)
                .flat_map(|pair| pair[0].symbol_id..=pair[1].symbol_id)
                .collect(),
            RepairForm::Invalid | RepairForm::Erasures => Vec::new(),
        }
    }
}

impl Default for RepairRequest {
    fn default() -> Self {
        Self::new()
    }
}
