/*! IPv6 extension-header list decompression.

Compressed lists name their items by 3- or 7-bit indices into a per
context slot table (`based_table`); the item bodies ride along only the
first time a slot is used. A full list is therefore just an ordered
sequence of slot indices, published under a `gen_id` and kept in a
sliding window so later packets can patch an older generation by
reference.

Four encoding schemes exist:

* ET=0 generic: the whole index sequence, spelled out.
* ET=1 insertion only: reference generation plus an insertion bit mask.
* ET=2 removal only: reference generation plus a removal bit mask.
* ET=3 remove then insert: both masks, removal applied first.

Decoding is split from committing. [`ListDecompressor::decode`] only
reads, returning a [`PendingList`]; nothing in the tables changes until
the packet's CRC has proven the reconstruction and
[`ListDecompressor::commit`] is called. A failed packet therefore leaves
no trace.
 */
use std::collections::VecDeque;

use itertools::Itertools;
use log::{debug, trace};

use crate::bits::BitReader;
use crate::headers::{ExtHeader, Proto};
use crate::{Error, Result};

/// Slot count of the item table. A 7-bit XI could name more, but no
/// sane extension chain comes close.
pub const MAX_ITEM: usize = 15;

/// Default generation window size.
pub const DEFAULT_WINDOW: usize = 100;

/// One item body: an extension header, keyed by its own type octet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Extension header type (HOPOPTS, ROUTING, AH, DSTOPTS).
    pub typ: u8,
    /// Full header bytes; byte 0 is a placeholder until serialization.
    pub data: Vec<u8>,
}

/// Translation table entry: `known` says the compressor may reference
/// this slot without re-sending the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransSlot {
    /// Set once a CRC-validated packet carried the item body.
    pub known: bool,
}

/// A published list generation: ordered slot indices.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Identifier; `None` for anonymous lists sent with GP=0.
    pub gen_id: Option<u8>,
    /// Slot indices, list order.
    pub slots: Vec<u8>,
}

/// A decoded-but-unvalidated list: everything needed to build the
/// extension chain and, after CRC approval, update the tables.
#[derive(Debug, Clone)]
pub struct PendingList {
    /// Generation id to publish under.
    pub gen_id: Option<u8>,
    /// Slot indices, list order.
    pub slots: Vec<u8>,
    /// Bodies first seen in this packet, slot → item.
    pub new_items: Vec<(u8, Item)>,
}

/// Per-context list state: slot tables plus the generation window.
#[derive(Debug, Clone)]
pub struct ListDecompressor {
    based_table: Vec<Option<Item>>,
    trans_table: Vec<TransSlot>,
    window: VecDeque<Generation>,
    window_cap: usize,
    ref_list: Option<Generation>,
}

impl Default for ListDecompressor {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl ListDecompressor {
    /// Create with a generation window of `window_cap` (≥ 2).
    #[must_use]
    pub fn new(window_cap: usize) -> Self {
        Self {
            based_table: vec![None; MAX_ITEM],
            trans_table: vec![TransSlot::default(); MAX_ITEM],
            window: VecDeque::new(),
            window_cap: window_cap.max(2),
            ref_list: None,
        }
    }

    /// The currently referenced generation's slots, empty before any
    /// list arrived.
    #[must_use]
    pub fn current_slots(&self) -> &[u8] {
        self.ref_list.as_ref().map_or(&[], |g| &g.slots)
    }

    /// True once any generation has been committed.
    #[must_use]
    pub fn has_list(&self) -> bool {
        self.ref_list.is_some()
    }

    /// Decode one compressed list. Pure read; commit separately.
    pub fn decode(&self, r: &mut BitReader) -> Result<PendingList> {
        let byte0 = r.read_u8()?;
        let et = byte0 >> 6;
        let gp = byte0 & 0x20 != 0;
        let ps = byte0 & 0x10 != 0;
        let nibble = byte0 & 0x0f;
        let gen_id = if gp { Some(r.read_u8()?) } else { None };
        trace!("list: ET={et} GP={gp} PS={ps} nibble={nibble:#x} gen={gen_id:?}");

        let pending = match et {
            0 => self.decode_generic(r, ps, usize::from(nibble), gen_id),
            1 => self.decode_insert(r, ps, nibble, gen_id),
            2 => self.decode_remove(r, nibble, gen_id),
            3 => self.decode_remove_insert(r, ps, nibble, gen_id),
            _ => unreachable!(),
        }?;
        debug!(
            "list: gen {:?} -> [{}]",
            pending.gen_id,
            pending.slots.iter().format(", ")
        );
        Ok(pending)
    }

    fn decode_generic(
        &self,
        r: &mut BitReader,
        ps: bool,
        count: usize,
        gen_id: Option<u8>,
    ) -> Result<PendingList> {
        let xis = read_xi_list(r, ps, count, None)?;
        let (slots, new_items) = self.resolve(r, &xis)?;
        Ok(PendingList {
            gen_id,
            slots,
            new_items,
        })
    }

    fn decode_insert(
        &self,
        r: &mut BitReader,
        ps: bool,
        xi1: u8,
        gen_id: Option<u8>,
    ) -> Result<PendingList> {
        let base = self.lookup(r.read_u8()?)?;
        let mask = read_mask(r)?;
        let (slots, new_items) = self.insert(r, &base, &mask, ps, xi1)?;
        Ok(PendingList {
            gen_id,
            slots,
            new_items,
        })
    }

    fn decode_remove(
        &self,
        r: &mut BitReader,
        count: u8,
        gen_id: Option<u8>,
    ) -> Result<PendingList> {
        let base = self.lookup(r.read_u8()?)?;
        if usize::from(count) != base.len() {
            return Err(Error::Malformed(format!(
                "removal count {count} against a {}-item reference",
                base.len()
            )));
        }
        let mask = read_mask(r)?;
        Ok(PendingList {
            gen_id,
            slots: remove(&base, &mask),
            new_items: Vec::new(),
        })
    }

    fn decode_remove_insert(
        &self,
        r: &mut BitReader,
        ps: bool,
        xi1: u8,
        gen_id: Option<u8>,
    ) -> Result<PendingList> {
        let base = self.lookup(r.read_u8()?)?;
        let removal = read_mask(r)?;
        let trimmed = remove(&base, &removal);
        let insertion = read_mask(r)?;
        let (slots, new_items) = self.insert(r, &trimmed, &insertion, ps, xi1)?;
        Ok(PendingList {
            gen_id,
            slots,
            new_items,
        })
    }

    /// Find the reference generation by id.
    fn lookup(&self, ref_id: u8) -> Result<Vec<u8>> {
        self.window
            .iter()
            .rev()
            .find(|g| g.gen_id == Some(ref_id))
            .map(|g| g.slots.clone())
            .ok_or(Error::ListReferenceMissing { gen_id: ref_id })
    }

    /// Walk an explicit XI list, reading bodies for X=1 entries.
    fn resolve(&self, r: &mut BitReader, xis: &[Xi]) -> Result<(Vec<u8>, Vec<(u8, Item)>)> {
        let mut slots = Vec::with_capacity(xis.len());
        let mut new_items = Vec::new();
        for xi in xis {
            if xi.x {
                let item = read_item(r)?;
                new_items.push((xi.index, item));
            } else if !self.is_known(xi.index) {
                return Err(Error::Malformed(format!(
                    "reference to unpopulated item slot {}",
                    xi.index
                )));
            }
            slots.push(xi.index);
        }
        Ok((slots, new_items))
    }

    /// Merge reference slots with inserted XIs according to the mask.
    fn insert(
        &self,
        r: &mut BitReader,
        base: &[u8],
        mask: &Mask,
        ps: bool,
        xi1: u8,
    ) -> Result<(Vec<u8>, Vec<(u8, Item)>)> {
        let n = mask.ones();
        let xis = read_xi_list(r, ps, n, Some(xi1))?;
        let mut xi_it = xis.iter();
        let mut base_it = base.iter();
        let mut order = Vec::new();
        for i in 0..mask.len() {
            if mask.bit(i) {
                // Unwrap can't fire: the XI list was sized from the mask.
                order.push(*xi_it.next().unwrap());
            } else {
                match base_it.next() {
                    Some(&slot) => order.push(Xi {
                        x: false,
                        index: slot,
                    }),
                    None => break,
                }
            }
        }
        let mut slots = Vec::with_capacity(order.len());
        let mut new_items = Vec::new();
        for xi in &order {
            if xi.x {
                new_items.push((xi.index, read_item(r)?));
            } else if !self.is_known(xi.index) {
                return Err(Error::Malformed(format!(
                    "reference to unpopulated item slot {}",
                    xi.index
                )));
            }
            slots.push(xi.index);
        }
        Ok((slots, new_items))
    }

    fn is_known(&self, slot: u8) -> bool {
        self.trans_table[usize::from(slot)].known
    }

    /// Materialize the extension chain a pending list describes.
    pub fn chain(&self, pending: &PendingList) -> Result<Vec<ExtHeader>> {
        pending
            .slots
            .iter()
            .map(|&slot| {
                let item = pending
                    .new_items
                    .iter()
                    .find(|(s, _)| *s == slot)
                    .map(|(_, item)| item)
                    .or_else(|| self.based_table[usize::from(slot)].as_ref())
                    .ok_or_else(|| {
                        Error::Malformed(format!("slot {slot} has no body"))
                    })?;
                Ok(ExtHeader {
                    typ: item.typ,
                    data: item.data.clone(),
                })
            })
            .collect()
    }

    /// Publish a pending list after CRC validation. Populates slots,
    /// flips `known` bits, pushes the generation and evicts beyond the
    /// window.
    pub fn commit(&mut self, pending: PendingList) {
        for (slot, item) in pending.new_items {
            let i = usize::from(slot);
            self.based_table[i] = Some(item);
            self.trans_table[i].known = true;
        }
        let generation = Generation {
            gen_id: pending.gen_id,
            slots: pending.slots,
        };
        if generation.gen_id.is_some() {
            // Republishing a gen_id replaces the old entry.
            self.window.retain(|g| g.gen_id != generation.gen_id);
            self.window.push_back(generation.clone());
            while self.window.len() > self.window_cap {
                self.window.pop_front();
            }
        }
        self.ref_list = Some(generation);
    }

    /// Current chain from the committed reference list.
    pub fn committed_chain(&self) -> Result<Vec<ExtHeader>> {
        let slots = self.current_slots().to_vec();
        self.chain(&PendingList {
            gen_id: None,
            slots,
            new_items: Vec::new(),
        })
    }
}

/// Apply a removal mask to a reference list. Positions beyond the mask
/// are kept.
fn remove(base: &[u8], mask: &Mask) -> Vec<u8> {
    base.iter()
        .enumerate()
        .filter(|(i, _)| *i >= mask.len() || !mask.bit(*i))
        .map(|(_, &slot)| slot)
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Xi {
    x: bool,
    index: u8,
}

fn check_index(index: u8) -> Result<u8> {
    if usize::from(index) >= MAX_ITEM {
        return Err(Error::Malformed(format!("item index {index} out of range")));
    }
    Ok(index)
}

/// Read `n` XI entries. With `first` set (insertion schemes, PS=0), the
/// initial 4-bit XI comes from the encoding's first octet.
fn read_xi_list(r: &mut BitReader, ps: bool, n: usize, first: Option<u8>) -> Result<Vec<Xi>> {
    let mut xis = Vec::with_capacity(n);
    if ps {
        for _ in 0..n {
            let b = r.read_u8()?;
            xis.push(Xi {
                x: b & 0x80 != 0,
                index: check_index(b & 0x7f)?,
            });
        }
        return Ok(xis);
    }
    let mut nibbles = Vec::with_capacity(n);
    let mut left = n;
    if let Some(xi1) = first
        && left > 0
    {
        nibbles.push(xi1);
        left -= 1;
    }
    for _ in 0..left.div_ceil(2) {
        let b = r.read_u8()?;
        nibbles.push(b >> 4);
        nibbles.push(b & 0x0f);
    }
    for nib in nibbles.into_iter().take(n) {
        xis.push(Xi {
            x: nib & 0x8 != 0,
            index: check_index(nib & 0x7)?,
        });
    }
    Ok(xis)
}

/// 7- or 15-bit insertion/removal mask, MSB flag selecting the length.
#[derive(Debug)]
struct Mask {
    bits: u16,
    len: usize,
}

impl Mask {
    fn bit(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        self.bits & (1 << (self.len - 1 - i)) != 0
    }
    fn len(&self) -> usize {
        self.len
    }
    fn ones(&self) -> usize {
        self.bits.count_ones() as usize
    }
}

fn read_mask(r: &mut BitReader) -> Result<Mask> {
    let b = r.read_u8()?;
    if b & 0x80 == 0 {
        Ok(Mask {
            bits: u16::from(b & 0x7f),
            len: 7,
        })
    } else {
        let b2 = r.read_u8()?;
        Ok(Mask {
            bits: (u16::from(b & 0x7f) << 8) | u16::from(b2),
            len: 15,
        })
    }
}

/// Read one item body: type octet, length octet, then the rest of the
/// header. Lengths follow IPv6 conventions (8-octet units; 4-octet for
/// AH).
fn read_item(r: &mut BitReader) -> Result<Item> {
    let typ = r.peek_bits(8)? as u8;
    let total = match typ {
        Proto::HOPOPTS | Proto::DSTOPTS | Proto::ROUTING => {
            let len = r.peek_bits(16)? & 0xff;
            (len as usize + 1) * 8
        }
        Proto::AH => {
            let len = r.peek_bits(16)? & 0xff;
            (len as usize + 2) * 4
        }
        other => {
            return Err(Error::Malformed(format!(
                "unknown extension header type {other}"
            )));
        }
    };
    if total < 8 {
        return Err(Error::Malformed(format!("item of {total} bytes")));
    }
    let data = r.read_bytes(total)?.to_vec();
    Ok(Item { typ, data })
}
