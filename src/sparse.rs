//! Position-preserving sequences of optional values
//!
//! A [`SparseSeq`] correlates an original batch of items with the subset that
//! survived an asynchronous step. Absent slots keep their position, so the
//! outcome of a downstream step can be merged back onto the upstream batch.

use std::iter::Flatten;

/// A fixed-length sequence of optional values.
///
/// Every operation returns a new sequence; the receiver is either borrowed or
/// consumed, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseSeq<E> {
    slots: Vec<Option<E>>,
}

impl<E> Default for SparseSeq<E> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<E> SparseSeq<E> {
    /// Wrap every value as present.
    pub fn create<I>(values: I) -> Self
    where
        I: IntoIterator<Item = E>,
    {
        Self {
            slots: values.into_iter().map(Some).collect(),
        }
    }

    /// Wrap explicit optional slots.
    pub fn wrap<I>(slots: I) -> Self
    where
        I: IntoIterator<Item = Option<E>>,
    {
        Self {
            slots: slots.into_iter().collect(),
        }
    }

    /// Total number of slots, present or absent.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of present slots.
    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_present(&self, index: usize) -> bool {
        matches!(self.slots.get(index), Some(Some(_)))
    }

    pub fn get(&self, index: usize) -> Option<&E> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Iterate over present values in positional order.
    pub fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        self.slots.iter().flatten()
    }

    pub fn slots(&self) -> &[Option<E>] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<Option<E>> {
        self.slots
    }

    /// The presence pattern of this sequence, without its values.
    pub fn presence(&self) -> SparseSeq<()> {
        SparseSeq {
            slots: self.slots.iter().map(|s| s.as_ref().map(|_| ())).collect(),
        }
    }

    /// Apply `mapper` to every present value, keeping absent slots absent.
    pub fn map<V, F>(self, mut mapper: F) -> SparseSeq<V>
    where
        F: FnMut(E) -> V,
    {
        SparseSeq {
            slots: self.slots.into_iter().map(|s| s.map(&mut mapper)).collect(),
        }
    }

    /// Lazy counterpart of [`SparseSeq::map`]: `mapper` runs only as the
    /// returned iterator is advanced. Collecting it yields a `SparseSeq<V>`.
    pub fn map_iter<'a, V, F>(&'a self, mut mapper: F) -> impl Iterator<Item = Option<V>> + 'a
    where
        F: FnMut(&E) -> V + 'a,
    {
        self.slots.iter().map(move |s| s.as_ref().map(&mut mapper))
    }

    /// Replace the present values with `values`, consumed in order, one per
    /// present slot. Absent slots stay absent.
    ///
    /// A present slot left without a replacement value becomes absent.
    pub fn replace<V, I>(&self, values: I) -> SparseSeq<V>
    where
        I: IntoIterator<Item = V>,
    {
        self.replace_optional(values.into_iter().map(Some))
    }

    /// Like [`SparseSeq::replace`], but a replacement may itself be absent,
    /// which turns the corresponding present slot absent.
    pub fn replace_optional<V, I>(&self, values: I) -> SparseSeq<V>
    where
        I: IntoIterator<Item = Option<V>>,
    {
        let mut values = values.into_iter();
        let mut exhausted = false;
        let slots = self
            .slots
            .iter()
            .map(|slot| match slot {
                Some(_) => match values.next() {
                    Some(value) => value,
                    None => {
                        exhausted = true;
                        None
                    }
                },
                None => None,
            })
            .collect();
        if exhausted {
            log::warn!("replace ran out of values; trailing present slots were emptied");
        } else if values.next().is_some() {
            log::warn!("replace received more values than present slots; extras were ignored");
        }
        SparseSeq { slots }
    }

    /// Merge in the empty slots of `other`: a present slot becomes absent when
    /// `other` is absent at the same position. Positions beyond the end of
    /// `other` are kept as they are.
    pub fn merge_empties<V>(self, other: &SparseSeq<V>) -> SparseSeq<E> {
        let mut from = other.slots.iter();
        SparseSeq {
            slots: self
                .slots
                .into_iter()
                .map(|slot| match from.next() {
                    Some(None) => None,
                    _ => slot,
                })
                .collect(),
        }
    }
}

impl<E> IntoIterator for SparseSeq<E> {
    type Item = E;
    type IntoIter = Flatten<std::vec::IntoIter<Option<E>>>;

    /// Consumes the sequence, yielding only present values.
    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter().flatten()
    }
}

impl<E> FromIterator<Option<E>> for SparseSeq<E> {
    fn from_iter<I: IntoIterator<Item = Option<E>>>(iter: I) -> Self {
        Self::wrap(iter)
    }
}
