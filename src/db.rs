use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::{Handle, HandleRange, Io, Uuid};

/// Attribute value source. A static value is an immutable byte string owned
/// by the server; a dynamic value is produced on demand by an upper-layer
/// [`Io`] callback.
#[derive(Debug)]
pub enum Value {
    Static(Box<[u8]>),
    Dynamic(Io),
}

impl From<&[u8]> for Value {
    #[inline]
    fn from(v: &[u8]) -> Self {
        Self::Static(v.into())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    #[inline]
    fn from(v: [u8; N]) -> Self {
        Self::Static(v.into())
    }
}

impl From<Vec<u8>> for Value {
    #[inline]
    fn from(v: Vec<u8>) -> Self {
        Self::Static(v.into())
    }
}

impl From<Io> for Value {
    #[inline]
    fn from(io: Io) -> Self {
        Self::Dynamic(io)
    }
}

/// A single server attribute ([Vol 3] Part F, Section 3.2). The ending
/// handle is only meaningful for grouping attributes, where it marks the
/// last handle of the group; for all others it equals the attribute handle.
#[derive(Debug)]
pub struct Attr {
    hdl: Handle,
    end: Handle,
    typ: Uuid,
    val: Value,
}

impl Attr {
    /// Creates a non-grouping attribute.
    #[inline]
    pub fn new(hdl: Handle, typ: Uuid, val: impl Into<Value>) -> Self {
        Self {
            hdl,
            end: hdl,
            typ,
            val: val.into(),
        }
    }

    /// Creates a grouping attribute covering handles `hdl..=end`.
    ///
    /// # Panics
    ///
    /// Panics if `end < hdl`.
    #[inline]
    pub fn group(hdl: Handle, end: Handle, typ: Uuid, val: impl Into<Value>) -> Self {
        assert!(hdl <= end);
        Self {
            hdl,
            end,
            typ,
            val: val.into(),
        }
    }

    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the group ending handle.
    #[inline(always)]
    #[must_use]
    pub const fn ending_handle(&self) -> Handle {
        self.end
    }

    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub const fn typ(&self) -> Uuid {
        self.typ
    }

    /// Returns the static value or [`None`] for a dynamic attribute.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self.val {
            Value::Static(ref v) => Some(v),
            Value::Dynamic(_) => None,
        }
    }

    /// Returns the value source.
    #[inline(always)]
    pub(crate) const fn val(&self) -> &Value {
        &self.val
    }
}

/// Attribute database: all attributes of one server, ordered by handle.
#[derive(Debug, Default)]
#[must_use]
pub struct Db {
    attrs: BTreeMap<Handle, Attr>,
}

impl Db {
    /// Creates an empty database.
    #[inline]
    pub fn new() -> Self {
        Self {
            attrs: BTreeMap::new(),
        }
    }

    /// Allocates the next handle for a new non-grouping attribute. Returns
    /// `None` if the handle space is exhausted.
    pub fn append(&mut self, typ: Uuid, val: impl Into<Value>) -> Option<Handle> {
        let hdl = match self.attrs.last_key_value() {
            None => Handle::MIN,
            Some((&hdl, _)) => hdl.next()?,
        };
        self.attrs.insert(hdl, Attr::new(hdl, typ, val));
        Some(hdl)
    }

    /// Inserts an attribute with a pre-defined handle. Returns `false` if the
    /// handle is already taken.
    pub fn insert(&mut self, at: Attr) -> bool {
        let Entry::Vacant(e) = self.attrs.entry(at.hdl) else {
            return false;
        };
        e.insert(at);
        true
    }

    /// Returns the attribute with the specified handle.
    #[inline]
    #[must_use]
    pub fn get(&self, hdl: Handle) -> Option<&Attr> {
        self.attrs.get(&hdl)
    }

    /// Returns all attributes within the handle range in ascending handle
    /// order.
    #[inline]
    pub fn range(&self, hdls: HandleRange) -> impl Iterator<Item = &Attr> {
        self.attrs.range(hdls).map(|(_, at)| at)
    }

    /// Returns the number of attributes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns whether the database is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}
