//! Per-block pending/repair bookkeeping, parity accounting, and NACK /
//! repair-advertisement synthesis.
//!
//! A block owns `size` symbol slots (data in `[0, num_data)`, parity in
//! `[num_data, size)`) and two equal-length masks. A set pending bit means
//! "must be (re)transmitted" at a sender or "still missing" at a receiver; a
//! set repair bit means "proposed for the next repair cycle but not yet
//! committed".

// Symbol counts are protocol-bounded to u16; mask indices convert losslessly.
#![allow(clippy::cast_possible_truncation)]

use bitflags::bitflags;
use norm_core::{BitMask, BlockId, ObjectId, SegmentId};
use norm_wire::{
    RepairFlags, RepairForm, RepairItem, RepairRequest, RepairRequestContainer, WireError,
    STREAM_PAYLOAD_HEADER_LEN,
};
use serde::Serialize;

use crate::config::BlockPoolConfig;
use crate::error::PoolError;
use crate::segment::{Segment, SegmentPool};

bitflags! {
    /// Block state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// The block is being retransmitted as repair.
        const IN_REPAIR = 0x01;
    }
}

/// A transmission block and its repair state machine.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    size: u16,
    segment_table: Vec<Option<Segment>>,
    pending_mask: BitMask,
    repair_mask: BitMask,
    erasure_count: u16,
    parity_count: u16,
    parity_offset: u16,
    flags: BlockFlags,
}

impl Block {
    /// Construct an empty block of `total_size` symbol slots.
    #[must_use]
    pub fn new(total_size: u16) -> Self {
        Self {
            id: BlockId::new(0),
            size: total_size,
            segment_table: (0..total_size).map(|_| None).collect(),
            pending_mask: BitMask::new(usize::from(total_size)),
            repair_mask: BitMask::new(usize::from(total_size)),
            erasure_count: 0,
            parity_count: 0,
            parity_offset: 0,
            flags: BlockFlags::empty(),
        }
    }

    /// Re-initialize for a new use, resizing if the symbol count changed.
    ///
    /// The block must hold no segments.
    pub fn init(&mut self, id: BlockId, total_size: u16) {
        debug_assert!(self.is_empty(), "re-initializing a block that owns segments");
        self.id = id;
        if total_size == self.size {
            self.pending_mask.clear();
            self.repair_mask.clear();
        } else {
            self.size = total_size;
            self.segment_table.clear();
            self.segment_table
                .resize_with(usize::from(total_size), || None);
            self.pending_mask.resize(usize::from(total_size));
            self.repair_mask.resize(usize::from(total_size));
        }
        self.erasure_count = 0;
        self.parity_count = 0;
        self.parity_offset = 0;
        self.flags = BlockFlags::empty();
    }

    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    /// Total symbol count (`num_data + num_parity`).
    #[must_use]
    pub const fn size(&self) -> u16 {
        self.size
    }

    pub fn set_flag(&mut self, flag: BlockFlags) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: BlockFlags) {
        self.flags &= !flag;
    }

    #[must_use]
    pub const fn in_repair(&self) -> bool {
        self.flags.contains(BlockFlags::IN_REPAIR)
    }

    // ── segment slots ──────────────────────────────────────────────────

    /// Install a segment in slot `index`, returning any displaced one.
    pub fn set_segment(&mut self, index: SegmentId, segment: Segment) -> Option<Segment> {
        self.segment_table[usize::from(index)].replace(segment)
    }

    pub fn take_segment(&mut self, index: SegmentId) -> Option<Segment> {
        self.segment_table[usize::from(index)].take()
    }

    #[must_use]
    pub fn segment(&self, index: SegmentId) -> Option<&Segment> {
        self.segment_table[usize::from(index)].as_ref()
    }

    pub fn segment_mut(&mut self, index: SegmentId) -> Option<&mut Segment> {
        self.segment_table[usize::from(index)].as_mut()
    }

    /// Return every owned segment to `pool`.
    ///
    /// The caller supplies the pool the segments were drawn from; slot
    /// origin is not recorded per segment.
    pub fn empty_to_pool(&mut self, pool: &mut SegmentPool) {
        for slot in &mut self.segment_table {
            if let Some(segment) = slot.take() {
                pool.put(segment);
            }
        }
    }

    /// Whether no slot holds a segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segment_table.iter().all(Option::is_none)
    }

    // ── pending / repair masks ─────────────────────────────────────────

    #[must_use]
    pub fn is_pending(&self, index: SegmentId) -> bool {
        self.pending_mask.test(usize::from(index))
    }

    pub fn set_pending(&mut self, index: SegmentId) {
        self.pending_mask.set(usize::from(index));
    }

    pub fn unset_pending(&mut self, index: SegmentId) {
        self.pending_mask.unset(usize::from(index));
    }

    pub fn set_pending_range(&mut self, start: SegmentId, count: u16) {
        self.pending_mask
            .set_bits(usize::from(start), usize::from(count));
    }

    pub fn clear_pending(&mut self) {
        self.pending_mask.clear();
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_mask.any_set()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_mask.count()
    }

    #[must_use]
    pub fn first_pending(&self) -> Option<SegmentId> {
        self.pending_mask.first_set().map(|bit| bit as u16)
    }

    /// First pending symbol at or above `index`.
    #[must_use]
    pub fn next_pending(&self, index: SegmentId) -> Option<SegmentId> {
        self.pending_mask
            .next_set(usize::from(index))
            .map(|bit| bit as u16)
    }

    #[must_use]
    pub fn is_repair(&self, index: SegmentId) -> bool {
        self.repair_mask.test(usize::from(index))
    }

    pub fn set_repair(&mut self, index: SegmentId) {
        self.repair_mask.set(usize::from(index));
    }

    pub fn clear_repairs(&mut self) {
        self.repair_mask.clear();
    }

    #[must_use]
    pub fn has_repairs(&self) -> bool {
        self.repair_mask.any_set()
    }

    #[must_use]
    pub fn first_repair(&self) -> Option<SegmentId> {
        self.repair_mask.first_set().map(|bit| bit as u16)
    }

    /// First repair-staged symbol at or above `index`.
    #[must_use]
    pub fn next_repair(&self, index: SegmentId) -> Option<SegmentId> {
        self.repair_mask
            .next_set(usize::from(index))
            .map(|bit| bit as u16)
    }

    // ── parity accounting ──────────────────────────────────────────────

    #[must_use]
    pub const fn erasure_count(&self) -> u16 {
        self.erasure_count
    }

    pub fn set_erasure_count(&mut self, count: u16) {
        self.erasure_count = count;
    }

    pub fn increment_erasure_count(&mut self) {
        self.erasure_count += 1;
    }

    pub fn decrement_erasure_count(&mut self) {
        self.erasure_count -= 1;
    }

    #[must_use]
    pub const fn parity_count(&self) -> u16 {
        self.parity_count
    }

    #[must_use]
    pub const fn parity_offset(&self) -> u16 {
        self.parity_offset
    }

    /// Whether the sender has folded all `num_data` data symbols into its
    /// incremental parity state (`erasure_count` doubles as the encode
    /// cursor on the send side).
    #[must_use]
    pub const fn parity_ready(&self, num_data: u16) -> bool {
        self.erasure_count == num_data
    }

    // ── sender state machine ───────────────────────────────────────────

    /// Reset the block for a new transmission cycle: all data plus the
    /// first `auto_parity` parity symbols become pending, the rest of the
    /// parity is unmarked.
    ///
    /// Returns `false` when the pending set already matched, so callers can
    /// skip redundant repair-timer scheduling.
    pub fn tx_reset(
        &mut self,
        num_data: u16,
        num_parity: u16,
        auto_parity: u16,
        segment_size: u16,
    ) -> bool {
        let auto_end = usize::from(num_data + auto_parity);
        let total = usize::from(num_data + num_parity);
        // Build the target pattern in repair_mask and XOR against pending:
        // any surviving bit is a symbol whose status would change.
        self.repair_mask.set_bits(0, auto_end);
        self.repair_mask.unset_bits(auto_end, total - auto_end);
        self.repair_mask.xor_with(&self.pending_mask);
        if !self.repair_mask.any_set() {
            return false;
        }
        self.repair_mask.clear();
        self.pending_mask.set_bits(0, auto_end);
        self.pending_mask.unset_bits(auto_end, total - auto_end);
        self.parity_offset = auto_parity;
        // No fresh parity is spendable this cycle.
        self.parity_count = num_parity;
        self.flags |= BlockFlags::IN_REPAIR;
        if !self.parity_ready(num_data) {
            // Stale incremental parity would corrupt the recomputation.
            let payload_max = usize::from(segment_size) + STREAM_PAYLOAD_HEADER_LEN;
            for slot in &mut self.segment_table[usize::from(num_data)..total] {
                if let Some(segment) = slot {
                    segment.zero_prefix(payload_max + 1);
                }
            }
            self.erasure_count = 0;
        }
        true
    }

    /// Fold a NACK received during the repair holdoff window directly into
    /// the pending mask.
    ///
    /// Returns whether the pending set grew.
    pub fn tx_update(
        &mut self,
        next_id: SegmentId,
        last_id: SegmentId,
        num_data: u16,
        num_parity: u16,
        erasure_count: u16,
    ) -> bool {
        apply_segment_request(
            &mut self.pending_mask,
            &mut self.parity_count,
            &mut self.parity_offset,
            next_id,
            last_id,
            num_data,
            num_parity,
            erasure_count,
        )
    }

    /// Stage a NACK received outside the holdoff window into the repair
    /// mask; [`Block::activate_repairs`] commits the staged set later.
    ///
    /// Returns whether the staged set grew.
    pub fn handle_segment_request(
        &mut self,
        next_id: SegmentId,
        last_id: SegmentId,
        num_data: u16,
        num_parity: u16,
        erasure_count: u16,
    ) -> bool {
        tracing::debug!(
            block = %self.id,
            first = next_id,
            last = last_id,
            erasures = erasure_count,
            "segment repair request"
        );
        apply_segment_request(
            &mut self.repair_mask,
            &mut self.parity_count,
            &mut self.parity_offset,
            next_id,
            last_id,
            num_data,
            num_parity,
            erasure_count,
        )
    }

    /// Commit staged repairs: pending |= repair, repair cleared.
    ///
    /// Returns whether anything was staged.
    pub fn activate_repairs(&mut self) -> bool {
        if self.repair_mask.any_set() {
            self.pending_mask.or_with(&self.repair_mask);
            self.repair_mask.clear();
            true
        } else {
            false
        }
    }

    // ── receiver state machine ─────────────────────────────────────────

    /// Whether this block still needs a NACK.
    ///
    /// Side effect, relied on by [`Block::append_repair_adv`]: the repair
    /// mask is left holding exactly the pending bits *not* covered by the
    /// erasure/parity policy, i.e. the bits an explicit request would list.
    /// Repair bits already set on entry (overheard from other receivers'
    /// NACKs) count as covered, which is what suppresses duplicate requests.
    pub fn is_repair_pending(&mut self, num_data: u16, num_parity: u16) -> bool {
        // A receiver asks for a block of parity to cover its erasures; when
        // parity is short it asks for data segments too.
        if self.erasure_count > num_parity {
            if num_parity > 0 {
                // The first num_parity pending symbols will be filled by the
                // requested parity.
                let mut next_id = self.pending_mask.first_set().unwrap_or(0);
                for _ in 0..num_parity {
                    if next_id >= usize::from(self.size) {
                        break;
                    }
                    self.repair_mask.set(next_id);
                    next_id += 1;
                    if let Some(found) = self.pending_mask.next_set(next_id) {
                        next_id = found;
                    }
                }
            } else if self.size > num_data {
                self.repair_mask
                    .set_bits(usize::from(num_data), usize::from(self.size - num_data));
            }
        } else {
            self.repair_mask.set_bits(0, usize::from(num_data));
            self.repair_mask.set_bits(
                usize::from(num_data + self.erasure_count),
                usize::from(num_parity - self.erasure_count),
            );
        }
        // repair_mask := pending_mask - repair_mask
        self.repair_mask.difference_from(&self.pending_mask);
        self.repair_mask.any_set()
    }

    // ── NACK / advertisement synthesis ─────────────────────────────────

    /// Append this block's repair requests to a NACK.
    ///
    /// The window follows the erasure/parity policy: with more erasures than
    /// parity, skip the first `num_parity` pending symbols (parity covers
    /// them) and request the rest explicitly up to `num_data + num_parity`;
    /// otherwise request pending parity over
    /// `[num_data, num_data + erasure_count)`.
    ///
    /// # Errors
    ///
    /// Returns `WireError` when the message payload budget is exhausted.
    pub fn append_repair_request<M: RepairRequestContainer>(
        &self,
        msg: &mut M,
        num_data: u16,
        num_parity: u16,
        object_id: ObjectId,
        pending_info: bool,
        segment_size: u16,
    ) -> Result<(), WireError> {
        let (next_id, end_id) = if self.erasure_count > num_parity {
            let mut next = self.pending_mask.first_set().unwrap_or(0);
            for _ in 0..num_parity {
                next += 1;
                if let Some(found) = self.pending_mask.next_set(next) {
                    next = found;
                }
            }
            (next, usize::from(num_data + num_parity))
        } else {
            let mut next = usize::from(num_data);
            if let Some(found) = self.pending_mask.next_set(next) {
                next = found;
            }
            (next, usize::from(num_data + self.erasure_count))
        };
        let mut flags = RepairFlags::SEGMENT;
        if pending_info {
            flags |= RepairFlags::INFO;
        }
        self.append_runs(
            msg,
            &self.pending_mask,
            next_id,
            end_id,
            object_id,
            num_data,
            flags,
            segment_size,
        )
    }

    /// Append this block's outstanding repair state to a repair
    /// advertisement, for NACK suppression at other nodes.
    ///
    /// Sources the repair mask over the whole block; call after
    /// [`Block::is_repair_pending`] has distilled it.
    ///
    /// # Errors
    ///
    /// Returns `WireError` when the message payload budget is exhausted.
    pub fn append_repair_adv<M: RepairRequestContainer>(
        &self,
        msg: &mut M,
        object_id: ObjectId,
        repair_info: bool,
        num_data: u16,
        segment_size: u16,
    ) -> Result<(), WireError> {
        let mut flags = RepairFlags::SEGMENT;
        if repair_info {
            flags |= RepairFlags::INFO;
        }
        if let Some(first) = self.repair_mask.first_set() {
            self.append_runs(
                msg,
                &self.repair_mask,
                first,
                usize::from(self.size),
                object_id,
                num_data,
                flags,
                segment_size,
            )?;
        }
        Ok(())
    }

    /// Compress the set bits of `mask` over `[next_id, end_id)` into repair
    /// requests: maximal consecutive runs of one or two symbols become
    /// ITEMS, runs of three or more become a RANGES first/last pair. A form
    /// change packs the previous request and attaches a fresh one.
    #[allow(clippy::too_many_arguments)]
    fn append_runs<M: RepairRequestContainer>(
        &self,
        msg: &mut M,
        mask: &BitMask,
        mut next_id: usize,
        end_id: usize,
        object_id: ObjectId,
        num_data: u16,
        flags: RepairFlags,
        segment_size: u16,
    ) -> Result<(), WireError> {
        let mut request = RepairRequest::new();
        request.set_flag(flags);
        let mut prev_form = RepairForm::Invalid;
        let mut segment_count: u16 = 0;
        let mut first_id: usize = 0;
        while next_id < end_id {
            let current_id = next_id;
            next_id = mask.next_set(current_id + 1).unwrap_or(end_id);
            if segment_count == 0 {
                first_id = current_id;
            }
            segment_count += 1;
            // A gap or the window end closes the run.
            if next_id - current_id > 1 || next_id >= end_id {
                let form = if segment_count <= 2 {
                    RepairForm::Items
                } else {
                    RepairForm::Ranges
                };
                if form != prev_form {
                    if prev_form != RepairForm::Invalid {
                        msg.pack_repair_request(&mut request)?;
                    }
                    request.set_form(form);
                    msg.attach_repair_request(&mut request, segment_size)?;
                    prev_form = form;
                }
                match form {
                    RepairForm::Items => {
                        request.append_repair_item(object_id, self.id, num_data, first_id as u16);
                        if segment_count == 2 {
                            request.append_repair_item(
                                object_id,
                                self.id,
                                num_data,
                                current_id as u16,
                            );
                        }
                    }
                    RepairForm::Ranges => {
                        request.append_repair_range(
                            RepairItem {
                                object_id,
                                block_id: self.id,
                                num_data,
                                symbol_id: first_id as u16,
                            },
                            RepairItem {
                                object_id,
                                block_id: self.id,
                                num_data,
                                symbol_id: current_id as u16,
                            },
                        );
                    }
                    RepairForm::Invalid | RepairForm::Erasures => unreachable!(),
                }
                segment_count = 0;
            }
        }
        if prev_form != RepairForm::Invalid {
            msg.pack_repair_request(&mut request)?;
        }
        Ok(())
    }
}

/// Fold one NACK'd segment range into `mask`, spending fresh parity before
/// falling back to explicit per-segment repair.
#[allow(clippy::too_many_arguments)]
fn apply_segment_request(
    mask: &mut BitMask,
    parity_count: &mut u16,
    parity_offset: &mut u16,
    mut next_id: SegmentId,
    last_id: SegmentId,
    num_data: u16,
    num_parity: u16,
    erasure_count: u16,
) -> bool {
    let mut increased = false;
    if next_id < num_data {
        // Explicit data request: commit to worst-case parity this cycle.
        *parity_offset = num_parity;
        *parity_count = num_parity;
        while next_id <= last_id {
            if !mask.test(usize::from(next_id)) {
                mask.set(usize::from(next_id));
                increased = true;
            }
            next_id += 1;
        }
    } else {
        let parity_available = num_parity - *parity_offset;
        if erasure_count <= parity_available {
            // Fresh parity covers the whole request; extend the pending run
            // only past what this cycle already committed.
            if erasure_count > *parity_count {
                mask.set_bits(
                    usize::from(num_data + *parity_offset + *parity_count),
                    usize::from(erasure_count - *parity_count),
                );
                *parity_count = erasure_count;
                increased = true;
            }
        } else {
            // Spend any remaining fresh parity...
            if *parity_count < parity_available {
                let count = parity_available - *parity_count;
                mask.set_bits(
                    usize::from(num_data + *parity_offset + *parity_count),
                    usize::from(count),
                );
                *parity_count = parity_available;
                next_id += parity_available;
                increased = true;
            }
            // ...and explicit repair for the rest.
            while next_id <= last_id {
                if !mask.test(usize::from(next_id)) {
                    mask.set(usize::from(next_id));
                    increased = true;
                }
                next_id += 1;
            }
        }
    }
    increased
}

/// Point-in-time block pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct BlockPoolStats {
    /// Preconstructed block count.
    pub total: u32,
    /// Blocks currently on the free list.
    pub available: u32,
    /// Distinct exhaustion episodes.
    pub overruns: u64,
}

/// LIFO free list of preconstructed blocks, all sized to a common symbol
/// count.
#[derive(Debug)]
pub struct BlockPool {
    free: Vec<Block>,
    total: u32,
    overruns: u64,
    overrun_flag: bool,
}

impl BlockPool {
    /// Preconstruct `num_blocks` blocks of `total_size` symbols each.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for a zero block count or symbol
    /// count.
    pub fn new(num_blocks: u32, total_size: u16) -> Result<Self, PoolError> {
        if num_blocks == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "block count must be nonzero",
            });
        }
        if total_size == 0 {
            return Err(PoolError::InvalidConfig {
                reason: "block symbol count must be nonzero",
            });
        }
        let free = (0..num_blocks).map(|_| Block::new(total_size)).collect();
        Ok(Self {
            free,
            total: num_blocks,
            overruns: 0,
            overrun_flag: false,
        })
    }

    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for a zero block count or symbol
    /// count.
    pub fn from_config(config: &BlockPoolConfig) -> Result<Self, PoolError> {
        Self::new(config.num_blocks, config.total_size)
    }

    /// Take a block off the free list.
    ///
    /// Returns `None` when the pool is exhausted; the first failure of an
    /// exhaustion episode is counted and logged, later failures in the same
    /// episode are silent.
    pub fn get(&mut self) -> Option<Block> {
        match self.free.pop() {
            Some(block) => {
                self.overrun_flag = false;
                Some(block)
            }
            None => {
                if !self.overrun_flag {
                    tracing::warn!(
                        total = self.total,
                        "block pool exhausted, operating with constrained buffering"
                    );
                    self.overruns += 1;
                    self.overrun_flag = true;
                }
                None
            }
        }
    }

    /// Return a block to the free list. The block must be empty.
    pub fn put(&mut self, block: Block) {
        debug_assert!(block.is_empty(), "block returned to pool still owns segments");
        self.free.push(block);
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    #[must_use]
    pub const fn overruns(&self) -> u64 {
        self.overruns
    }

    #[must_use]
    pub fn stats(&self) -> BlockPoolStats {
        BlockPoolStats {
            total: self.total,
            available: self.available(),
            overruns: self.overruns,
        }
    }
}
