//! Inclusion filters: which verified transactions of a block are kept.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use warp_core::constants::{APP_NAME_CONTRACT, APP_NAME_INTERACTION, TAG_APP_NAME};
use warp_core::types::Transaction;

pub trait InclusionFilter: Send + Sync {
    fn accepts(&self, tx: &Transaction) -> bool;
}

/// Keeps every transaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl InclusionFilter for AcceptAll {
    fn accepts(&self, _tx: &Transaction) -> bool {
        true
    }
}

/// Keeps transactions carrying a tag with exactly this name and value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    pub name: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl InclusionFilter for TagFilter {
    fn accepts(&self, tx: &Transaction) -> bool {
        tx.tags
            .iter()
            .any(|t| t.name.as_bytes() == self.name.as_bytes() && t.value.as_bytes() == self.value.as_bytes())
    }
}

/// Filter backed by an arbitrary predicate.
pub struct FnFilter<F>(pub F);

impl<F> InclusionFilter for FnFilter<F>
where
    F: Fn(&Transaction) -> bool + Send + Sync,
{
    fn accepts(&self, tx: &Transaction) -> bool {
        (self.0)(tx)
    }
}

/// Filter selection as it appears in configuration files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterConfig {
    AcceptAll,
    /// Contract interactions (`App-Name: SmartWeaveAction`).
    #[default]
    Interactions,
    /// Contract deployments (`App-Name: SmartWeaveContract`).
    Contracts,
    Tag { name: String, value: String },
}

impl FilterConfig {
    pub fn build(&self) -> Arc<dyn InclusionFilter> {
        match self {
            Self::AcceptAll => Arc::new(AcceptAll),
            Self::Interactions => Arc::new(TagFilter::new(TAG_APP_NAME, APP_NAME_INTERACTION)),
            Self::Contracts => Arc::new(TagFilter::new(TAG_APP_NAME, APP_NAME_CONTRACT)),
            Self::Tag { name, value } => Arc::new(TagFilter::new(name.clone(), value.clone())),
        }
    }
}
