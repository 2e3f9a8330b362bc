// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Refcounted arena for decoded pictures in flight between the decoder
//! and the render sink.
//!
//! The codec owns the actual buffer memory; the pool only tracks which
//! buffer indices are referenced by [`OutputPicture`] handles. Releases
//! are deferred onto a recycle list that the session drains back into
//! the codec on its next cycle, so handle holders never touch the codec
//! directly.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::PictureFlags;
use crate::Resolution;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SlotToken {
    index: usize,
    /// Bumped on every rebind and invalidation. A handle whose
    /// generation no longer matches its slot is stale and must not
    /// touch the refcount.
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    refs: u32,
    generation: u32,
    buffer_index: usize,
    /// Sticky across handles: true once any release reported the
    /// picture on screen.
    rendered: bool,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    soft_cap: usize,
    recycle: Vec<(usize, bool)>,
}

impl PoolInner {
    fn release(&mut self, token: SlotToken, rendered: bool) {
        let slot = &mut self.slots[token.index];
        if slot.generation != token.generation {
            log::debug!("release of a stale picture handle ignored");
            return;
        }
        if slot.refs == 0 {
            log::warn!("double release of picture slot {}", token.index);
            return;
        }
        slot.refs -= 1;
        slot.rendered |= rendered;
        if slot.refs == 0 {
            self.recycle.push((slot.buffer_index, slot.rendered));
        }
    }
}

/// Tracks codec output buffers from delivery until every handle on them
/// is gone.
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    /// `soft_cap` bounds how many pictures may be in flight at once;
    /// `wrap` declines beyond it rather than growing without limit.
    pub fn new(soft_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                slots: Vec::new(),
                soft_cap,
                recycle: Vec::new(),
            })),
        }
    }

    /// Binds a freshly dequeued codec buffer to a free slot and returns
    /// the first handle on it, or `None` if the pool is at capacity.
    pub fn wrap(
        &self,
        buffer_index: usize,
        pts: Option<i64>,
        size: Resolution,
        flags: PictureFlags,
    ) -> Option<OutputPicture> {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.slots.iter().position(|slot| slot.refs == 0) {
            Some(index) => index,
            None if inner.slots.len() < inner.soft_cap => {
                inner.slots.push(Default::default());
                inner.slots.len() - 1
            }
            None => return None,
        };
        let slot = &mut inner.slots[index];
        slot.refs = 1;
        slot.generation = slot.generation.wrapping_add(1);
        slot.buffer_index = buffer_index;
        slot.rendered = false;
        let token = SlotToken { index, generation: slot.generation };
        Some(OutputPicture {
            pool: Arc::downgrade(&self.inner),
            token,
            released: false,
            pts,
            duration_us: 0,
            size,
            flags,
        })
    }

    /// Drains the buffer indices whose last handle has been dropped,
    /// with whether each was actually rendered. Called by the session,
    /// which hands them back to the codec.
    pub fn take_recycled(&self) -> Vec<(usize, bool)> {
        std::mem::take(&mut self.inner.lock().unwrap().recycle)
    }

    /// Force-releases every in-flight picture without rendering, for
    /// flush. Outstanding handles become inert.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for slot in &mut inner.slots {
            if slot.refs > 0 {
                slot.refs = 0;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        // The codec's own flush reclaims every buffer, so pending
        // recycle entries would only be returned twice.
        inner.recycle.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().slots.iter().filter(|slot| slot.refs > 0).count()
    }

    /// True when every slot is referenced and the cap forbids growth,
    /// i.e. the next `wrap` would decline.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() >= inner.soft_cap && inner.slots.iter().all(|slot| slot.refs > 0)
    }
}

/// A shared handle on one decoded picture. Cloning takes another
/// reference; the buffer goes back to the codec once the last handle is
/// released or dropped.
#[derive(Debug)]
pub struct OutputPicture {
    pool: Weak<Mutex<PoolInner>>,
    token: SlotToken,
    released: bool,
    /// Presentation timestamp in microseconds, after any correction.
    pub pts: Option<i64>,
    /// How long this picture should stay on screen, in microseconds.
    pub duration_us: i64,
    pub size: Resolution,
    pub flags: PictureFlags,
}

impl OutputPicture {
    /// Releases this handle, recording whether the picture made it to
    /// the display.
    pub fn release(mut self, rendered: bool) {
        self.release_once(rendered);
    }

    fn release_once(&mut self, rendered: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.lock().unwrap().release(self.token, rendered);
        }
    }
}

impl Clone for OutputPicture {
    fn clone(&self) -> Self {
        let mut released = true;
        if !self.released {
            if let Some(pool) = self.pool.upgrade() {
                let mut inner = pool.lock().unwrap();
                let slot = &mut inner.slots[self.token.index];
                if slot.generation == self.token.generation && slot.refs > 0 {
                    slot.refs += 1;
                    released = false;
                }
            }
        }
        // A clone of a stale handle starts out inert.
        Self {
            pool: self.pool.clone(),
            token: self.token,
            released,
            pts: self.pts,
            duration_us: self.duration_us,
            size: self.size,
            flags: self.flags,
        }
    }
}

impl Drop for OutputPicture {
    fn drop(&mut self) {
        self.release_once(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(pool: &BufferPool, buffer_index: usize, pts: i64) -> OutputPicture {
        pool.wrap(buffer_index, Some(pts), (16, 16).into(), Default::default()).unwrap()
    }

    #[test]
    fn release_recycles_once_refs_reach_zero() {
        let pool = BufferPool::new(4);
        let picture = wrap(&pool, 7, 0);
        let clone = picture.clone();
        assert_eq!(pool.in_flight(), 1);

        picture.release(true);
        assert!(pool.take_recycled().is_empty());

        clone.release(false);
        assert_eq!(pool.take_recycled(), vec![(7, true)]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn dropped_handle_counts_as_discarded() {
        let pool = BufferPool::new(4);
        // Dropped without an explicit release: discarded.
        drop(wrap(&pool, 3, 0));
        assert_eq!(pool.take_recycled(), vec![(3, false)]);
    }

    #[test]
    fn wrap_declines_past_soft_cap() {
        let pool = BufferPool::new(2);
        let _a = wrap(&pool, 0, 0);
        assert!(!pool.is_full());
        let _b = wrap(&pool, 1, 0);
        assert!(pool.is_full());
        assert!(pool.wrap(2, None, (16, 16).into(), Default::default()).is_none());
    }

    #[test]
    fn slots_are_rebound_after_recycle() {
        let pool = BufferPool::new(1);
        wrap(&pool, 0, 0).release(true);
        pool.take_recycled();
        assert!(pool.wrap(1, None, (16, 16).into(), Default::default()).is_some());
    }

    #[test]
    fn invalidate_makes_outstanding_handles_inert() {
        let pool = BufferPool::new(4);
        let picture = wrap(&pool, 5, 0);
        pool.invalidate_all();
        assert_eq!(pool.in_flight(), 0);

        // Neither the release nor a late clone may touch the slot.
        let clone = picture.clone();
        picture.release(true);
        drop(clone);
        assert!(pool.take_recycled().is_empty());

        // The slot is free for rebinding.
        assert!(pool.wrap(6, None, (16, 16).into(), Default::default()).is_some());
    }
}
