//! Transaction-local references for objects that have no address yet.
//!
//! Operates in two phases. While a transaction runs, objects are registered
//! with [`IntRefs::ref_to_int`] and may be replaced with [`IntRefs::update`].
//! At commit [`IntRefs::start_store`] freezes the table, after which each
//! intref can be given the address it was persisted at.

use crate::storage::address::{Address, Ref};

/// Intref table owned by a single transaction.
#[derive(Debug)]
pub struct IntRefs<T> {
    list: Vec<T>,
    adrs: Option<Vec<Option<Address>>>,
}

impl<T> Default for IntRefs<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn index(r: Ref) -> usize {
    match r {
        Ref::IntRef(i) => i as usize,
        Ref::Adr(adr) => panic!("{adr:?} is not an intref"),
    }
}

impl<T> IntRefs<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: Vec::new(),
            adrs: None,
        }
    }

    /// Register `obj` and return its intref.
    ///
    /// # Panics
    ///
    /// Panics after [`start_store`](Self::start_store).
    pub fn ref_to_int(&mut self, obj: T) -> Ref {
        assert!(self.adrs.is_none(), "ref_to_int after start_store");
        let i = u32::try_from(self.list.len()).unwrap_or_else(|_| panic!("too many intrefs"));
        self.list.push(obj);
        Ref::IntRef(i)
    }

    /// The object registered for `intref`.
    ///
    /// # Panics
    ///
    /// Panics if `intref` is an address or was not issued by this table.
    #[must_use]
    pub fn int_to_ref(&self, intref: Ref) -> &T {
        let i = index(intref);
        self.list
            .get(i)
            .unwrap_or_else(|| panic!("intref {i} out of range"))
    }

    pub fn int_to_ref_mut(&mut self, intref: Ref) -> &mut T {
        assert!(self.adrs.is_none(), "mutation after start_store");
        let i = index(intref);
        self.list
            .get_mut(i)
            .unwrap_or_else(|| panic!("intref {i} out of range"))
    }

    /// Replace the object registered for `intref`.
    pub fn update(&mut self, intref: Ref, obj: T) {
        *self.int_to_ref_mut(intref) = obj;
    }

    /// Drop every object registered after the first `len`.
    ///
    /// # Panics
    ///
    /// Panics after [`start_store`](Self::start_store).
    pub fn truncate(&mut self, len: usize) {
        assert!(self.adrs.is_none(), "truncate after start_store");
        self.list.truncate(len);
    }

    /// Freeze the table and start assigning addresses.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start_store(&mut self) {
        assert!(self.adrs.is_none(), "start_store called twice");
        self.adrs = Some(vec![None; self.list.len()]);
    }

    #[must_use]
    pub const fn is_storing(&self) -> bool {
        self.adrs.is_some()
    }

    /// Record the address `intref`'s object was persisted at.
    ///
    /// # Panics
    ///
    /// Panics before [`start_store`](Self::start_store).
    pub fn set_adr(&mut self, intref: Ref, adr: Address) {
        let i = index(intref);
        let adrs = self
            .adrs
            .as_mut()
            .unwrap_or_else(|| panic!("set_adr before start_store"));
        let slot = adrs
            .get_mut(i)
            .unwrap_or_else(|| panic!("intref {i} out of range"));
        *slot = Some(adr);
    }

    /// The address recorded for `intref`, if it has been stored.
    ///
    /// # Panics
    ///
    /// Panics before [`start_store`](Self::start_store).
    #[must_use]
    pub fn get_adr(&self, intref: Ref) -> Option<Address> {
        let i = index(intref);
        let adrs = self
            .adrs
            .as_ref()
            .unwrap_or_else(|| panic!("get_adr before start_store"));
        *adrs
            .get(i)
            .unwrap_or_else(|| panic!("intref {i} out of range"))
    }

    /// Resolve `r` to an address: addresses pass through, intrefs must have
    /// been stored.
    ///
    /// # Panics
    ///
    /// Panics if `r` is an intref with no recorded address.
    #[must_use]
    pub fn resolve(&self, r: Ref) -> Address {
        match r {
            Ref::Adr(adr) => adr,
            Ref::IntRef(i) => self
                .get_adr(r)
                .unwrap_or_else(|| panic!("intref {i} has not been stored")),
        }
    }

    /// Registered objects with their intrefs, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (Ref, &T)> {
        (0u32..).zip(&self.list).map(|(i, obj)| (Ref::IntRef(i), obj))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
