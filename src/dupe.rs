//! A marker trait for cheap, `Arc`-like clones.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `Clone` makes no promise about cost: cloning a `Vec<u8>` and cloning an
//! `Arc<T>` both compile to `.clone()`. Throughout this crate, types that are
//! handed around between the reader task and callers are always `Arc`- or
//! channel-handle-backed, so a clone is always O(1). `Dupe::dupe` exists so
//! that reaching for a full clone of something expensive is a visible,
//! deliberate `.clone()` rather than indistinguishable from a `.dupe()`.

use std::sync::Arc;

/// A cheap, reference-counted duplicate of `self`.
pub trait Dupe {
    /// Produce a cheap duplicate of `self`.
    fn dupe(&self) -> Self;
}

impl<T> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T> Dupe for tokio::sync::mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for tokio::sync::mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
