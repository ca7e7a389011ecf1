//! The cache facade: storage plus resource lifecycle and size caps.
//!
//! Everything the executor does to the store goes through [`HttpCache`]:
//! variant-aware lookup, size-capped commits, 304 merges, and invalidation.
//! Parent entries reference children by storage key only; a dangling child
//! reference reads as a miss and is repaired by the next store.

use std::time::SystemTime;

use http::{request, response, HeaderMap, Response, StatusCode};

use crate::body::Body;
use crate::entry::{CacheEntry, Variant, VARIANT_PARENT_STATUS};
use crate::error::Result;
use crate::invalidate;
use crate::key;
use crate::policy::merge::{self, MergeOutcome};
use crate::reader::{self, ReadOutcome};
use crate::storage::CacheManager;
use crate::{CacheConfig, HttpVersion};

/// Result of a variant-aware lookup.
#[derive(Debug)]
pub enum Lookup {
    /// A concrete entry for this request's variant
    Entry {
        /// The stored entry
        entry: CacheEntry,
        /// Selector the lookup used (empty for unvarying resources)
        selector: String,
        /// Key the entry lives under
        storage_key: String,
    },
    /// A parent exists but no child matches this request's selector
    VariantMiss {
        /// The coordinating parent entry
        parent: CacheEntry,
        /// Selector derived for this request
        selector: String,
        /// Live sibling variants, for multi-variant revalidation
        variants: Vec<Variant>,
    },
}

/// Composes a [`CacheManager`] with body-resource lifecycle and size caps.
#[derive(Debug, Clone)]
pub struct HttpCache<T: CacheManager> {
    /// The backing store
    pub manager: T,
    /// Cache-wide configuration
    pub config: CacheConfig,
}

impl<T: CacheManager> HttpCache<T> {
    /// Creates a facade over `manager`.
    pub fn new(manager: T, config: CacheConfig) -> Self {
        Self { manager, config }
    }

    /// Looks up the stored state for a request, resolving variants.
    pub async fn find(
        &self,
        parts: &request::Parts,
    ) -> Result<Option<Lookup>> {
        let fingerprint = key::fingerprint(parts)?;
        let primary_key = fingerprint.primary_key().to_string();
        let Some(root) = self.manager.get(&primary_key).await? else {
            return Ok(None);
        };

        if !root.is_variant_parent() {
            return Ok(Some(Lookup::Entry {
                entry: root,
                selector: String::new(),
                storage_key: primary_key,
            }));
        }

        let vary = root.vary_fields();
        let Ok(selector) = key::variant_selector(&vary, &parts.headers)
        else {
            // Vary degenerated to `*`; nothing stored can match.
            return Ok(None);
        };

        if let Some(child_key) = root.variant_map.get(&selector).cloned() {
            if let Some(child) = self.manager.get(&child_key).await? {
                return Ok(Some(Lookup::Entry {
                    entry: child,
                    selector,
                    storage_key: child_key,
                }));
            }
        }
        let variants = self.variant_entries_with_etags(&root).await?;
        Ok(Some(Lookup::VariantMiss { parent: root, selector, variants }))
    }

    /// Enumerates the live children of a parent entry that carry an `ETag`.
    ///
    /// Children whose storage entry has vanished are skipped; the reference
    /// is re-derived on the next store.
    pub async fn variant_entries_with_etags(
        &self,
        parent: &CacheEntry,
    ) -> Result<Vec<Variant>> {
        let mut variants = Vec::with_capacity(parent.variant_map.len());
        for (variant_key, storage_key) in &parent.variant_map {
            if let Some(entry) = self.manager.get(storage_key).await? {
                if entry.etag().is_some() {
                    variants.push(Variant {
                        variant_key: variant_key.clone(),
                        storage_key: storage_key.clone(),
                        entry,
                    });
                }
            }
        }
        Ok(variants)
    }

    /// Commits an origin response, enforcing the object size cap.
    ///
    /// Returns the response to hand to the client: rebuilt from the stored
    /// entry when cached, or the byte-identical pass-through when the body
    /// exceeded `max_object_size`. The inbound body is consumed (and its
    /// stream released) on every path.
    pub async fn store_response(
        &self,
        parts: &request::Parts,
        response: Response<Body>,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<Response<Body>> {
        let (resp_parts, body) = response.into_parts();

        let resource =
            match reader::read_limited(body, self.config.max_object_size)
                .await?
            {
                ReadOutcome::Complete(resource) => resource,
                ReadOutcome::Overflow(passthrough) => {
                    return Ok(Response::from_parts(resp_parts, passthrough));
                }
            };

        self.commit(parts, &resp_parts, &resource, request_date, response_date)
            .await?;
        let body = Body::full(resource.read().await?);
        Ok(Response::from_parts(resp_parts, body))
    }

    /// Writes an already size-checked response body into the store.
    ///
    /// A varying response is written child-first, then registered in the
    /// parent's variant map; a reader either sees the new variant or
    /// doesn't, never a dangling reference.
    pub async fn commit(
        &self,
        parts: &request::Parts,
        resp_parts: &response::Parts,
        resource: &crate::entry::Resource,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<()> {
        let entry = self.build_entry(
            parts,
            resp_parts,
            resource,
            request_date,
            response_date,
        )?;

        let fingerprint = key::fingerprint(parts)?;
        let primary_key = fingerprint.primary_key().to_string();
        let vary = entry.vary_fields();

        if vary.is_empty() {
            // A HEAD exchange refreshes an existing GET entry's metadata
            // instead of replacing its body with nothing.
            if parts.method == http::Method::HEAD {
                let template = entry;
                let fresh_headers = resp_parts.headers.clone();
                self.manager
                    .update(&primary_key, &|current: Option<&CacheEntry>| {
                        match current {
                            Some(cur) if cur.body.is_some() => {
                                match merge::merge_not_modified(
                                    cur,
                                    &fresh_headers,
                                    request_date,
                                    response_date,
                                ) {
                                    MergeOutcome::Updated(entry) => entry,
                                    MergeOutcome::RequiresUnconditionalRetry => {
                                        cur.clone()
                                    }
                                }
                            }
                            _ => template.clone(),
                        }
                    })
                    .await?;
                return Ok(());
            }
            self.manager.put(primary_key, entry).await?;
        } else {
            let selector = key::variant_selector(&vary, &parts.headers)?;
            let child_key =
                key::variant_storage_key(&selector, &primary_key);
            self.manager.put(child_key.clone(), entry.clone()).await?;
            let parent_template = parent_from(&entry);
            self.manager
                .update(&primary_key, &|current: Option<&CacheEntry>| {
                    let mut parent = match current {
                        Some(cur) if cur.is_variant_parent() => cur.clone(),
                        _ => parent_template.clone(),
                    };
                    parent.headers = parent_template.headers.clone();
                    parent.request_date = parent_template.request_date;
                    parent.response_date = parent_template.response_date;
                    parent
                        .variant_map
                        .insert(selector.clone(), child_key.clone());
                    parent
                })
                .await?;
        }
        Ok(())
    }

    /// Merges a `304` into the stored entry under `storage_key`.
    ///
    /// Returns `None` when the 304 is older than the stored entry and the
    /// exchange must be retried unconditionally. A concurrent writer that
    /// stored something fresher wins; the merge then leaves it untouched.
    pub async fn update_from_not_modified(
        &self,
        storage_key: &str,
        held: &CacheEntry,
        not_modified: &HeaderMap,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<Option<CacheEntry>> {
        let merged_held = match merge::merge_not_modified(
            held,
            not_modified,
            request_date,
            response_date,
        ) {
            MergeOutcome::Updated(entry) => entry,
            MergeOutcome::RequiresUnconditionalRetry => return Ok(None),
        };

        let updated = self
            .manager
            .update(storage_key, &|current: Option<&CacheEntry>| {
                match current {
                    Some(current) => match merge::merge_not_modified(
                        current,
                        not_modified,
                        request_date,
                        response_date,
                    ) {
                        MergeOutcome::Updated(entry) => entry,
                        MergeOutcome::RequiresUnconditionalRetry => {
                            current.clone()
                        }
                    },
                    None => merged_held.clone(),
                }
            })
            .await?;
        Ok(Some(updated))
    }

    /// Flushes the resource a request targets when its method invalidates.
    ///
    /// Idempotent per resource; safe methods never reach the store.
    pub async fn flush_invalidated_entries_for(
        &self,
        parts: &request::Parts,
    ) -> Result<()> {
        if !invalidate::invalidates_request_uri(parts) {
            return Ok(());
        }
        let fingerprint = key::fingerprint(parts)?;
        self.flush_resource(fingerprint.primary_key()).await
    }

    /// Flushes entries superseded by an exchange's `Content-Location` /
    /// `Location` references.
    pub async fn invalidate_from_exchange(
        &self,
        parts: &request::Parts,
        resp_headers: &HeaderMap,
    ) -> Result<()> {
        let fingerprint = key::fingerprint(parts)?;
        for uri in invalidate::location_invalidation_uris(
            fingerprint.primary_key(),
            resp_headers,
        ) {
            if let Some(entry) = self.manager.get(&uri).await? {
                if invalidate::supersedes(
                    resp_headers,
                    &parts.method,
                    &entry,
                    &self.config,
                ) {
                    self.flush_resource(&uri).await?;
                }
            }
        }
        Ok(())
    }

    /// Removes a resource and every variant child registered under it.
    pub async fn flush_resource(&self, primary_key: &str) -> Result<()> {
        if let Some(entry) = self.manager.get(primary_key).await? {
            for child_key in invalidate::resource_keys(primary_key, &entry) {
                self.manager.delete(&child_key).await?;
            }
        } else {
            self.manager.delete(primary_key).await?;
        }
        Ok(())
    }

    fn build_entry(
        &self,
        parts: &request::Parts,
        resp_parts: &response::Parts,
        resource: &crate::entry::Resource,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<CacheEntry> {
        let version = HttpVersion::try_from(resp_parts.version)?;
        let body = if resource.is_empty() {
            None
        } else {
            Some(resource.clone())
        };
        Ok(CacheEntry::new(
            request_date,
            response_date,
            resp_parts.status.as_u16(),
            version,
            CacheEntry::headers_from_map(&resp_parts.headers),
            body,
            parts.method.as_str(),
        ))
    }
}

/// Builds a client response from a stored entry.
pub fn response_from_entry(
    entry: &CacheEntry,
    body: Body,
) -> Result<Response<Body>> {
    let mut response = Response::builder()
        .status(StatusCode::from_u16(entry.status)?)
        .version(entry.version.into())
        .body(body)?;
    *response.headers_mut() = entry.header_map();
    Ok(response)
}

fn parent_from(child: &CacheEntry) -> CacheEntry {
    let mut parent = child.clone();
    parent.status = VARIANT_PARENT_STATUS;
    parent.body = None;
    parent.variant_map.clear();
    parent
}
