//! Metadata node allocation.
//!
//! Each allocator claims space, maps the node's block, zero-fills it and
//! stamps the minimal valid header. The block comes back still held and
//! dirty inside [`NewNode`], so the caller can finish filling it in before
//! anything else can map it.
//!
//! If the block cannot be mapped, or the exhaustive check rejects the new
//! node, the space is given back before the error is returned.

use crate::check::chk_sectors;
use crate::dirband::alloc_in_dirband;
use crate::free::{free_dnode, free_sectors};
use crate::global::alloc_sector;
use crate::capacity::count_free_dirband_groups;
use crate::{AllocSession, AllocUnit, CheckLevel, Forward};
use sfs_block::{BufferCache, MappedBlock, SectorDevice};
use sfs_error::{Result, SfsError};
use sfs_types::{
    ANODE_MAGIC, DNODE_MAGIC, DNODE_SECTORS, FNODE_MAGIC, SectorNumber, write_le_u16,
    write_le_u32,
};
use tracing::{debug, warn};

// ── Header layouts ──────────────────────────────────────────────────────────

const DNODE_FIRST_FREE: usize = 4;
/// First free byte of a dnode holding only the end dirent.
const EMPTY_DNODE_FIRST_FREE: u32 = 52;
const DNODE_SELF: usize = 16;
const DNODE_DIRENT: usize = 20;
/// Dirent header plus a one-byte name, padded to 4.
const END_DIRENT_LEN: u16 = 32;
const DIRENT_FLAG_LAST: u8 = 0x08;
const DIRENT_NAMELEN: usize = 30;
const DIRENT_NAME: usize = 31;

const FNODE_BTREE: usize = 56;
const FNODE_EA_OFFS: usize = 0xB8;
const FNODE_EA_START: u16 = 0xC4;
const FNODE_BTREE_SLOTS: u8 = 8;

const ANODE_SELF: usize = 4;
const ANODE_BTREE: usize = 12;
const ANODE_BTREE_SLOTS: u8 = 40;

/// B+tree header field offsets, relative to the header.
const BTREE_N_FREE: usize = 4;
const BTREE_N_USED: usize = 5;
const BTREE_FIRST_FREE: usize = 6;
/// Header size; the first slot starts right after it.
const BTREE_HEADER_LEN: u16 = 8;

/// A freshly allocated node whose block is still held.
pub struct NewNode<'c, D: SectorDevice> {
    pub sector: SectorNumber,
    pub block: MappedBlock<'c, D>,
}

// ── Dnodes ──────────────────────────────────────────────────────────────────

/// Allocate and initialize a dnode near `near`.
///
/// While the directory band has more than `free_dnodes_add` free groups the
/// band is tried first; otherwise the main bitmap is. Only exhaustion of the
/// first source falls through to the second.
pub fn alloc_dnode<'c, D: SectorDevice>(
    cache: &'c BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
) -> Result<NewNode<'c, D>> {
    let sector = pick_dnode_sector(cache, session, near)?;
    let mut block = match cache.get_4sectors(sector) {
        Ok(block) => block,
        Err(err) => {
            release_node(cache, session, sector, DNODE_SECTORS, "dnode");
            return Err(err);
        }
    };
    init_dnode(block.data_mut(), sector);
    block.mark_dirty();
    if let Err(err) = verify_node(cache, session, sector, DNODE_SECTORS, "dnode") {
        drop(block);
        release_node(cache, session, sector, DNODE_SECTORS, "dnode");
        return Err(err);
    }
    debug!(target: "sfs::alloc", event = "alloc_dnode", near = near.0, sector = sector.0);
    Ok(NewNode { sector, block })
}

fn pick_dnode_sector<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
) -> Result<SectorNumber> {
    let band_first = count_free_dirband_groups(cache, session)? > session.config.free_dnodes_add;
    if band_first {
        if let Some(sector) = alloc_in_dirband(cache, session, near)? {
            return Ok(sector);
        }
        return alloc_sector(cache, session, near, AllocUnit::Dnode, Forward::Check(0));
    }
    match alloc_sector(cache, session, near, AllocUnit::Dnode, Forward::Check(0)) {
        Err(SfsError::NoSpace) => alloc_in_dirband(cache, session, near)?.ok_or(SfsError::NoSpace),
        other => other,
    }
}

fn init_dnode(data: &mut [u8], sector: SectorNumber) {
    data.fill(0);
    write_le_u32(data, 0, DNODE_MAGIC);
    write_le_u32(data, DNODE_FIRST_FREE, EMPTY_DNODE_FIRST_FREE);
    write_le_u32(data, DNODE_SELF, sector.0);
    let dirent = &mut data[DNODE_DIRENT..];
    write_le_u16(dirent, 0, END_DIRENT_LEN);
    dirent[2] = DIRENT_FLAG_LAST;
    dirent[DIRENT_NAMELEN] = 1;
    dirent[DIRENT_NAME] = 0xFF;
}

// ── Fnodes and anodes ───────────────────────────────────────────────────────

/// Allocate and initialize an fnode near `near`.
pub fn alloc_fnode<'c, D: SectorDevice>(
    cache: &'c BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
) -> Result<NewNode<'c, D>> {
    let forward = session.config.fnode_alloc_fwd;
    alloc_single(cache, session, near, forward, "fnode", init_fnode)
}

/// Allocate and initialize an anode near `near`.
pub fn alloc_anode<'c, D: SectorDevice>(
    cache: &'c BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
) -> Result<NewNode<'c, D>> {
    let forward = session.config.anode_alloc_fwd;
    alloc_single(cache, session, near, forward, "anode", init_anode)
}

fn alloc_single<'c, D: SectorDevice>(
    cache: &'c BufferCache<D>,
    session: &mut AllocSession,
    near: SectorNumber,
    forward: u32,
    kind: &'static str,
    init: fn(&mut [u8], SectorNumber),
) -> Result<NewNode<'c, D>> {
    let sector = alloc_sector(cache, session, near, AllocUnit::Sector, Forward::Check(forward))?;
    let mut block = match cache.get_sector(sector) {
        Ok(block) => block,
        Err(err) => {
            release_node(cache, session, sector, 1, kind);
            return Err(err);
        }
    };
    init(block.data_mut(), sector);
    block.mark_dirty();
    if let Err(err) = verify_node(cache, session, sector, 1, kind) {
        drop(block);
        release_node(cache, session, sector, 1, kind);
        return Err(err);
    }
    debug!(target: "sfs::alloc", event = "alloc_node", kind, near = near.0, sector = sector.0);
    Ok(NewNode { sector, block })
}

fn init_fnode(data: &mut [u8], _sector: SectorNumber) {
    data.fill(0);
    write_le_u32(data, 0, FNODE_MAGIC);
    data[FNODE_BTREE + BTREE_N_FREE] = FNODE_BTREE_SLOTS;
    write_le_u16(data, FNODE_BTREE + BTREE_FIRST_FREE, BTREE_HEADER_LEN);
    write_le_u16(data, FNODE_EA_OFFS, FNODE_EA_START);
}

fn init_anode(data: &mut [u8], sector: SectorNumber) {
    data.fill(0);
    write_le_u32(data, 0, ANODE_MAGIC);
    write_le_u32(data, ANODE_SELF, sector.0);
    data[ANODE_BTREE + BTREE_N_FREE] = ANODE_BTREE_SLOTS;
    data[ANODE_BTREE + BTREE_N_USED] = 0;
    write_le_u16(data, ANODE_BTREE + BTREE_FIRST_FREE, BTREE_HEADER_LEN);
}

/// Return the space of a node that could not be set up. The caller's error
/// is what gets reported; a failed rollback is only logged.
fn release_node<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &mut AllocSession,
    sector: SectorNumber,
    len: u32,
    kind: &str,
) {
    let undo = if len == DNODE_SECTORS {
        free_dnode(cache, session, sector)
    } else {
        free_sectors(cache, session, sector, len)
    };
    match undo {
        Ok(()) => debug!(
            target: "sfs::alloc",
            event = "node_rolled_back",
            kind,
            sector = sector.0
        ),
        Err(undo) => warn!(
            target: "sfs::alloc",
            event = "node_rollback_failed",
            kind,
            sector = sector.0,
            len,
            error = %undo
        ),
    }
}

fn verify_node<D: SectorDevice>(
    cache: &BufferCache<D>,
    session: &AllocSession,
    sector: SectorNumber,
    len: u32,
    kind: &str,
) -> Result<()> {
    if session.config.check_level >= CheckLevel::Exhaustive {
        chk_sectors(cache, session, sector, len, kind)?;
    }
    Ok(())
}
