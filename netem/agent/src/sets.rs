//! Named address-set store.
//!
//! Tracks the membership of every set the agent created so that element
//! adds are idempotent and deletes of absent elements surface as
//! [`EmitError::NotFound`] instead of a kernel error. The in-memory view
//! is authoritative for bookkeeping only; the kernel holds the real sets.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ipnet::Ipv4Net;
use netem_crd::{ProtoConst, Protocol};
use serde_json::{json, Value};
use tracing::Level;

use crate::{
    emitter::Emitter,
    error::EmitError,
    nft::{Element, NftCommand, NftObject, Set, SetKind},
};

/// One element of a typed set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SetElement {
    Net(Ipv4Net),
    Proto(ProtoConst),
    ProtoPort(Protocol, u16),
}

impl SetElement {
    /// The bare nftables JSON value of this element.
    fn to_value(&self) -> Value {
        match self {
            SetElement::Net(net) if net.prefix_len() == 32 => json!(net.addr().to_string()),
            SetElement::Net(net) => json!({
                "prefix": { "addr": net.addr().to_string(), "len": net.prefix_len() }
            }),
            SetElement::Proto(proto) => proto.to_value(),
            SetElement::ProtoPort(proto, port) => json!({ "concat": [proto.name(), port] }),
        }
    }

    /// The element as emitted on `add`, wrapping the value with its
    /// diagnostic annotation when one is present.
    fn to_elem(&self, annotation: Option<&str>) -> Value {
        match annotation {
            Some(comment) => json!({ "elem": { "val": self.to_value(), "comment": comment } }),
            None => self.to_value(),
        }
    }
}

#[derive(Debug)]
struct SetState {
    kind: SetKind,
    elements: HashMap<SetElement, Option<String>>,
}

/// Store of all named sets, keyed by `(table, set name)`.
#[derive(Debug)]
pub struct SetStore<E> {
    emitter: Arc<E>,
    sets: Mutex<HashMap<(String, String), SetState>>,
}

impl<E: Emitter> SetStore<E> {
    pub fn new(emitter: Arc<E>) -> Self {
        Self {
            emitter,
            sets: Mutex::new(HashMap::new()),
        }
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    pub async fn create_set(&self, table: &str, name: &str, kind: SetKind) -> Result<(), EmitError> {
        self.emitter
            .nft(vec![NftCommand::Add(NftObject::Set(Set::typed(
                table, name, kind,
            )))])
            .await?;

        self.sets.lock().unwrap().insert(
            (table.to_string(), name.to_string()),
            SetState {
                kind,
                elements: HashMap::new(),
            },
        );

        Ok(())
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    pub async fn delete_set(&self, table: &str, name: &str) -> Result<(), EmitError> {
        self.sets
            .lock()
            .unwrap()
            .remove(&(table.to_string(), name.to_string()))
            .ok_or_else(|| EmitError::UnknownSet(name.to_string()))?;

        self.emitter
            .nft(vec![NftCommand::Delete(NftObject::Set(Set::named(
                table, name,
            )))])
            .await
            .map(|_| ())
    }

    /// Add an element; a no-op when the element is already present.
    pub async fn add_element(
        &self,
        table: &str,
        name: &str,
        element: SetElement,
        annotation: Option<String>,
    ) -> Result<(), EmitError> {
        {
            let mut sets = self.sets.lock().unwrap();
            let state = sets
                .get_mut(&(table.to_string(), name.to_string()))
                .ok_or_else(|| EmitError::UnknownSet(name.to_string()))?;

            if state.elements.contains_key(&element) {
                tracing::trace!(set = name, ?element, "Element already present");
                return Ok(());
            }

            state.elements.insert(element.clone(), annotation.clone());
        }

        let elem = element.to_elem(annotation.as_deref());
        let result = self
            .emitter
            .nft(vec![NftCommand::Add(NftObject::Element(Element::new(
                table,
                name,
                vec![elem],
            )))])
            .await;

        if result.is_err() {
            if let Some(state) = self
                .sets
                .lock()
                .unwrap()
                .get_mut(&(table.to_string(), name.to_string()))
            {
                state.elements.remove(&element);
            }
        }

        result.map(|_| ())
    }

    /// Delete an element; fails with [`EmitError::NotFound`] when absent.
    pub async fn delete_element(
        &self,
        table: &str,
        name: &str,
        element: &SetElement,
    ) -> Result<(), EmitError> {
        {
            let mut sets = self.sets.lock().unwrap();
            let state = sets
                .get_mut(&(table.to_string(), name.to_string()))
                .ok_or_else(|| EmitError::UnknownSet(name.to_string()))?;

            if state.elements.remove(element).is_none() {
                return Err(EmitError::NotFound {
                    set: name.to_string(),
                });
            }
        }

        self.emitter
            .nft(vec![NftCommand::Delete(NftObject::Element(Element::new(
                table,
                name,
                vec![element.to_value()],
            )))])
            .await
            .map(|_| ())
    }

    /// Current elements of a set, if it exists.
    pub fn elements(&self, table: &str, name: &str) -> Option<Vec<SetElement>> {
        self.sets
            .lock()
            .unwrap()
            .get(&(table.to_string(), name.to_string()))
            .map(|state| state.elements.keys().cloned().collect())
    }

    /// Element type of a set, if it exists.
    #[cfg(test)]
    pub fn kind(&self, table: &str, name: &str) -> Option<SetKind> {
        self.sets
            .lock()
            .unwrap()
            .get(&(table.to_string(), name.to_string()))
            .map(|state| state.kind)
    }
}
