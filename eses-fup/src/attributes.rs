// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2022 Oxide Computer Company

//! Typed access to the per-component attributes of an enclosure.

use crate::error::AttributeError;
use eses_messages::FW_REVISION_SIZE;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::Mutex;

/// Firmware revision string as reported by a component. Compared byte for
/// byte; embedded NULs are significant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize,
)]
pub struct FwRevision(pub [u8; FW_REVISION_SIZE]);

impl FwRevision {
    /// Build a revision from `s`, truncated or NUL-padded to fit.
    pub fn from_str_lossy(s: &str) -> Self {
        let mut rev = [0; FW_REVISION_SIZE];
        let n = s.len().min(FW_REVISION_SIZE);
        rev[..n].copy_from_slice(&s.as_bytes()[..n]);
        Self(rev)
    }
}

impl fmt::Display for FwRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub enum ComponentType {
    Lcc,
    PowerSupply,
    Cooling,
    Sps,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub enum AttributeId {
    FwRevision,
    /// Whether this LCC is the one we are attached to.
    IsLocal,
    Side,
    PowerCycleRequest,
    PowerCycleDuration,
    PowerCycleDelay,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum PowerCycleRequest {
    #[default]
    None,
    Begin,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    U8(u8),
    Revision(FwRevision),
    PowerCycle(PowerCycleRequest),
}

pub trait AttributeStore: Send + Sync {
    fn get(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
    ) -> Result<AttributeValue, AttributeError>;

    fn set(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
        value: AttributeValue,
    ) -> Result<(), AttributeError>;

    fn component_count(&self, component: ComponentType) -> usize;

    fn get_bool(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
    ) -> Result<bool, AttributeError> {
        match self.get(attribute, component, index)? {
            AttributeValue::Bool(b) => Ok(b),
            _ => Err(AttributeError::TypeMismatch { attribute }),
        }
    }

    fn get_u8(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
    ) -> Result<u8, AttributeError> {
        match self.get(attribute, component, index)? {
            AttributeValue::U8(v) => Ok(v),
            _ => Err(AttributeError::TypeMismatch { attribute }),
        }
    }

    fn get_revision(
        &self,
        component: ComponentType,
        index: usize,
    ) -> Result<FwRevision, AttributeError> {
        let attribute = AttributeId::FwRevision;
        match self.get(attribute, component, index)? {
            AttributeValue::Revision(rev) => Ok(rev),
            _ => Err(AttributeError::TypeMismatch { attribute }),
        }
    }

    fn get_power_cycle_request(
        &self,
        index: usize,
    ) -> Result<PowerCycleRequest, AttributeError> {
        let attribute = AttributeId::PowerCycleRequest;
        match self.get(attribute, ComponentType::Lcc, index)? {
            AttributeValue::PowerCycle(req) => Ok(req),
            _ => Err(AttributeError::TypeMismatch { attribute }),
        }
    }

    /// Index of the first `component` whose boolean `attribute` equals
    /// `value`.
    fn find_first_bool(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        value: bool,
    ) -> Result<usize, AttributeError> {
        for index in 0..self.component_count(component) {
            if self.get_bool(attribute, component, index)? == value {
                return Ok(index);
            }
        }
        Err(AttributeError::InvalidIndex {
            component,
            index: self.component_count(component),
        })
    }

    /// Index of the `component` installed on `side`.
    fn index_for_side(
        &self,
        component: ComponentType,
        side: u8,
    ) -> Result<usize, AttributeError> {
        for index in 0..self.component_count(component) {
            if self.get_u8(AttributeId::Side, component, index)? == side {
                return Ok(index);
            }
        }
        Err(AttributeError::NotFound { component, side })
    }
}

impl<T: AttributeStore + ?Sized> AttributeStore for Arc<T> {
    fn get(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
    ) -> Result<AttributeValue, AttributeError> {
        (**self).get(attribute, component, index)
    }

    fn set(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
        value: AttributeValue,
    ) -> Result<(), AttributeError> {
        (**self).set(attribute, component, index, value)
    }

    fn component_count(&self, component: ComponentType) -> usize {
        (**self).component_count(component)
    }
}

type Attributes = BTreeMap<AttributeId, AttributeValue>;

/// An [`AttributeStore`] backed by a map per component. Attributes must be
/// registered with [`InMemoryAttributeStore::add_component`] before they can
/// be set, and keep the type they were registered with.
#[derive(Debug, Default)]
pub struct InMemoryAttributeStore {
    components: Mutex<BTreeMap<ComponentType, Vec<Attributes>>>,
}

impl InMemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a component, returning its index.
    pub fn add_component<I>(&self, component: ComponentType, attrs: I) -> usize
    where
        I: IntoIterator<Item = (AttributeId, AttributeValue)>,
    {
        let mut components = self.components.lock().unwrap();
        let slots = components.entry(component).or_default();
        slots.push(attrs.into_iter().collect());
        slots.len() - 1
    }
}

impl AttributeStore for InMemoryAttributeStore {
    fn get(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
    ) -> Result<AttributeValue, AttributeError> {
        let components = self.components.lock().unwrap();
        let attrs = components
            .get(&component)
            .and_then(|slots| slots.get(index))
            .ok_or(AttributeError::InvalidIndex { component, index })?;
        attrs
            .get(&attribute)
            .copied()
            .ok_or(AttributeError::Unsupported { attribute, component })
    }

    fn set(
        &self,
        attribute: AttributeId,
        component: ComponentType,
        index: usize,
        value: AttributeValue,
    ) -> Result<(), AttributeError> {
        let mut components = self.components.lock().unwrap();
        let attrs = components
            .get_mut(&component)
            .and_then(|slots| slots.get_mut(index))
            .ok_or(AttributeError::InvalidIndex { component, index })?;
        let slot = attrs
            .get_mut(&attribute)
            .ok_or(AttributeError::Unsupported { attribute, component })?;
        if mem::discriminant(slot) != mem::discriminant(&value) {
            return Err(AttributeError::TypeMismatch { attribute });
        }
        *slot = value;
        Ok(())
    }

    fn component_count(&self, component: ComponentType) -> usize {
        let components = self.components.lock().unwrap();
        components.get(&component).map_or(0, Vec::len)
    }
}

/// Attributes carried by an LCC slot in a typical two-sided enclosure.
pub fn lcc_attributes(
    side: u8,
    is_local: bool,
    revision: FwRevision,
) -> [(AttributeId, AttributeValue); 6] {
    [
        (AttributeId::Side, AttributeValue::U8(side)),
        (AttributeId::IsLocal, AttributeValue::Bool(is_local)),
        (AttributeId::FwRevision, AttributeValue::Revision(revision)),
        (
            AttributeId::PowerCycleRequest,
            AttributeValue::PowerCycle(PowerCycleRequest::None),
        ),
        (AttributeId::PowerCycleDuration, AttributeValue::U8(0)),
        (AttributeId::PowerCycleDelay, AttributeValue::U8(0)),
    ]
}

/// Attributes carried by a power supply, cooling module or SPS slot.
pub fn field_replaceable_attributes(
    side: u8,
    revision: FwRevision,
) -> [(AttributeId, AttributeValue); 2] {
    [
        (AttributeId::Side, AttributeValue::U8(side)),
        (AttributeId::FwRevision, AttributeValue::Revision(revision)),
    ]
}
