//! Tombstone verification
//!
//! A tombstone may bury parts of a split object only while the chain is
//! incomplete, i.e. no link object describes it yet. Otherwise removing a
//! part would corrupt an object the user still sees.
//!
//! ```text
//!   member ─head─▶ SplitInfo ─────────────▶ ok (whole object removal)
//!            │
//!            ├──▶ no split fields ────────▶ ok (small object)
//!            ├──▶ split ID (V1) ──search split ID──▶ any child with a
//!            │                                       children list? ─▶ error
//!            └──▶ first/parent (V2) ──search first ID + type LINK──▶ any? ─▶ error
//! ```
//!
//! Members are checked concurrently, at most [`MAX_CONCURRENT_CHECKS`] at a
//! time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, Span};

use crate::domain::{ObjectSource, TombstoneSource};
use crate::error::{Error, Result};
use crate::object::{Address, ContainerId, MatchType, ObjectId, ObjectType, SearchFilters, SplitId, Tombstone};

/// Members of one tombstone checked simultaneously
pub const MAX_CONCURRENT_CHECKS: usize = 16;

/// Decides whether a tombstone may be applied
#[async_trait]
pub trait TombVerifier: Send + Sync {
    async fn verify_tomb(&self, container: &ContainerId, tombstone: &Tombstone) -> Result<()>;
}

pub struct Verifier {
    objects: Arc<dyn ObjectSource>,
    span: Span,
}

impl Verifier {
    pub fn new(objects: Arc<dyn ObjectSource>, span: Span) -> Self {
        Self { objects, span }
    }

    async fn verify_member(&self, container: &ContainerId, member: ObjectId) -> Result<()> {
        let address = Address::new(*container, member);
        let header = match self.objects.head(&address).await {
            Ok(header) => header,
            // removing the parent of a split chain
            Err(Error::SplitInfo(_)) => return Ok(()),
            Err(e) => return Err(wrap("heading object", e)),
        };

        let split_id = header.split_id();
        let first_id = header.first_id();
        if split_id.is_none() && first_id.is_none() && header.parent().is_none() {
            return Ok(());
        }

        match split_id {
            Some(split_id) => self
                .verify_v1_child(container, &split_id)
                .await
                .map_err(|e| wrap("verify V1 split", e)),
            // the first part is the only one without a first ID
            None => self
                .verify_v2_child(container, first_id.unwrap_or(member))
                .await
                .map_err(|e| wrap("verify V2 split", e)),
        }
    }

    async fn verify_v1_child(&self, container: &ContainerId, split_id: &SplitId) -> Result<()> {
        let mut filters = SearchFilters::new();
        filters.add_split_id_filter(MatchType::StringEqual, split_id);
        let ids = self
            .objects
            .search(container, &filters)
            .await
            .map_err(|e| wrap("searching objects", e))?;

        for id in ids {
            let address = Address::new(*container, id);
            let header = self
                .objects
                .head(&address)
                .await
                .map_err(|e| wrap(format!("heading {} object that was searched", address), e))?;
            if !header.children().is_empty() {
                return Err(Error::TombstoneVerification(format!("found link object {}", address)));
            }
        }
        Ok(())
    }

    async fn verify_v2_child(&self, container: &ContainerId, first: ObjectId) -> Result<()> {
        let mut filters = SearchFilters::new();
        filters.add_first_split_object_filter(MatchType::StringEqual, &first);
        filters.add_type_filter(MatchType::StringEqual, ObjectType::Link);
        let ids = self
            .objects
            .search(container, &filters)
            .await
            .map_err(|e| wrap("searching objects", e))?;

        match ids.as_slice() {
            [] => Ok(()),
            [link] => Err(Error::TombstoneVerification(format!(
                "found link object {}",
                Address::new(*container, *link)
            ))),
            _ => Err(Error::TombstoneVerification("link object was found".into())),
        }
    }
}

#[async_trait]
impl TombVerifier for Verifier {
    async fn verify_tomb(&self, container: &ContainerId, tombstone: &Tombstone) -> Result<()> {
        if let Some(split_id) = &tombstone.split_id {
            return Err(Error::TombstoneVerification(format!("unexpected split ID: {}", split_id)));
        }

        stream::iter(tombstone.members.iter().copied())
            .map(|member| async move {
                self.verify_member(container, member)
                    .await
                    .map_err(|e| wrap(format!("verifying {} member", member), e))
            })
            .buffer_unordered(MAX_CONCURRENT_CHECKS)
            .try_collect::<Vec<()>>()
            .await?;

        debug!(parent: &self.span, container = %container, members = tombstone.members.len(), "Tombstone verified");
        Ok(())
    }
}

/// Prefix a verification failure with what was being done
fn wrap(context: impl fmt::Display, e: Error) -> Error {
    match e {
        Error::TombstoneVerification(reason) => Error::TombstoneVerification(format!("{}: {}", context, reason)),
        other => Error::TombstoneVerification(format!("{}: {}", context, other)),
    }
}

// =============================================================================
// Tombstone Source
// =============================================================================

/// Tombstone availability read straight from an object source
pub struct FlatTombstoneSource {
    objects: Arc<dyn ObjectSource>,
    span: Span,
}

impl FlatTombstoneSource {
    pub fn new(objects: Arc<dyn ObjectSource>, span: Span) -> Self {
        Self { objects, span }
    }
}

#[async_trait]
impl TombstoneSource for FlatTombstoneSource {
    async fn is_tombstone_available(&self, address: &Address, epoch: u64) -> bool {
        match self.objects.head(address).await {
            Ok(header) => !header.is_expired(epoch),
            Err(e @ (Error::ObjectNotFound | Error::ObjectAlreadyRemoved | Error::ObjectExpired)) => {
                debug!(parent: &self.span, tombstone = %address, error = %e, "Tombstone is gone");
                false
            }
            // keep the graves until the tombstone can be checked
            Err(e) => {
                debug!(parent: &self.span, tombstone = %address, error = %e, "Could not check tombstone");
                true
            }
        }
    }
}
