//! Graph queries.
//!
//! A [`Snapshot`] captures the record handles present when the query was
//! made. Later announcements never change it, so callbacks may mutate the
//! graph while a caller is still iterating. Filtering is lazy and each
//! call to [`Snapshot::iter`] starts again from the beginning.

use std::fmt;
use std::sync::Arc;

use crate::map::MapStatus;
use crate::model::{SignalPath, Type};
use crate::signal::Direction;

use super::{MapRecord, SignalRecord};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Point-in-time query result.
pub struct Snapshot<T> {
    items: Arc<[Arc<T>]>,
    keep: Predicate<T>,
}

impl<T> Snapshot<T> {
    pub(crate) fn new(items: Vec<Arc<T>>, keep: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self { items: items.into(), keep: Arc::new(keep) }
    }

    /// Matching records in query order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> + '_ {
        self.items.iter().filter(|item| (self.keep)(item))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn first(&self) -> Option<&Arc<T>> {
        self.iter().next()
    }

    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.iter().cloned().collect()
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self { items: self.items.clone(), keep: self.keep.clone() }
    }
}

impl<T> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot").field("captured", &self.items.len()).finish_non_exhaustive()
    }
}

impl<'a, T> IntoIterator for &'a Snapshot<T> {
    type Item = &'a Arc<T>;
    type IntoIter = Box<dyn Iterator<Item = &'a Arc<T>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Signal query filter. The default matches everything; every set field
/// must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalFilter {
    pub device: Option<String>,
    pub direction: Option<Direction>,
    pub ty: Option<Type>,
    /// Substring of the signal name.
    pub name_contains: Option<String>,
}

impl SignalFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn ty(mut self, ty: Type) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn name_contains(mut self, text: impl Into<String>) -> Self {
        self.name_contains = Some(text.into());
        self
    }

    pub fn matches(&self, signal: &SignalRecord) -> bool {
        self.device.as_ref().is_none_or(|d| *d == signal.device)
            && self.direction.is_none_or(|d| d == signal.direction)
            && self.ty.is_none_or(|t| t == signal.ty)
            && self.name_contains.as_ref().is_none_or(|n| signal.name.contains(n.as_str()))
    }
}

/// Map query filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapFilter {
    /// Any endpoint on this device.
    pub device: Option<String>,
    /// This signal as source or destination.
    pub signal: Option<SignalPath>,
    pub creator: Option<String>,
    pub ready_only: bool,
}

impl MapFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn signal(mut self, path: SignalPath) -> Self {
        self.signal = Some(path);
        self
    }

    pub fn creator(mut self, device: impl Into<String>) -> Self {
        self.creator = Some(device.into());
        self
    }

    pub fn ready(mut self) -> Self {
        self.ready_only = true;
        self
    }

    pub fn matches(&self, map: &MapRecord) -> bool {
        self.device.as_ref().is_none_or(|d| map.involves_device(d))
            && self.signal.as_ref().is_none_or(|p| map.involves_signal(p))
            && self.creator.as_ref().is_none_or(|c| *c == map.creator)
            && (!self.ready_only || map.status == MapStatus::Ready)
    }
}
