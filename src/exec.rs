//! The caching executor: the request-handling state machine.
//!
//! A request moves through compliance, invalidation, cacheability, lookup,
//! and suitability, and ends in one of three places: served from the store,
//! revalidated against the origin, or forwarded untouched. Whatever comes
//! back carries this cache's `Via` entry, and the per-call [`ExecContext`]
//! records how it was produced.
//!
//! Failures inside the cache subsystem are logged and degrade to a miss;
//! they never become user-visible errors.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use http::header::HeaderValue;
use http::{request, Method, Request, Response, StatusCode, Version};
use url::Url;

use crate::body::Body;
use crate::compliance;
use crate::entry::{CacheEntry, Variant};
use crate::error::{CacheError, Result};
use crate::facade::{self, HttpCache, Lookup};
use crate::policy::suitability::{self, Suitability, Unsuitable};
use crate::policy::{conditional, request as request_policy, response as response_policy, validity};
use crate::reader::{self, ReadOutcome};
use crate::revalidate::AsyncValidator;
use crate::storage::CacheManager;
use crate::{
    CacheConfig, CacheStats, CacheStatus, ExecContext, HttpVersion, XCACHE,
    XCACHELOOKUP,
};

/// The origin an exchange is routed to. Opaque to the cache; handed through
/// to the backend transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Origin the backend connects to
    pub origin: Url,
}

impl Route {
    /// A route to `origin`.
    #[must_use]
    pub fn new(origin: Url) -> Self {
        Self { origin }
    }
}

/// The transport that actually talks to the origin.
///
/// The response body is streaming; the caller owns it and releases the
/// underlying connection by dropping it.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Forwards `request` along `route` and returns the origin's response.
    async fn execute(
        &self,
        route: &Route,
        request: Request<Body>,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>>;
}

/// Composes the policy modules, the cache facade, and a backend into the
/// full RFC 2616 caching pipeline.
#[derive(Clone)]
pub struct CachingExecutor<T: CacheManager + Clone> {
    cache: HttpCache<T>,
    backend: Arc<dyn Backend>,
    validator: AsyncValidator,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl<T: CacheManager + Clone> std::fmt::Debug for CachingExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: CacheManager + Clone> CachingExecutor<T> {
    /// Builds an executor over `cache` and `backend`.
    pub fn new(
        cache: HttpCache<T>,
        backend: Arc<dyn Backend>,
        config: CacheConfig,
    ) -> Self {
        Self {
            cache,
            backend,
            validator: AsyncValidator::new(&config),
            config,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Running hit/miss/update counters.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// The background validator, for explicit teardown.
    #[must_use]
    pub fn validator(&self) -> &AsyncValidator {
        &self.validator
    }

    /// Runs one exchange through the cache.
    pub async fn execute(
        &self,
        route: &Route,
        request: Request<Body>,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let (mut parts, req_body) = request.into_parts();

        if let Err(err) = compliance::normalize_request(
            &mut parts,
            !req_body.is_empty_hint(),
        ) {
            log::debug!("rejecting non-compliant request: {err}");
            return self.module_response(
                StatusCode::BAD_REQUEST,
                Body::full(err.to_string().into_bytes()),
                &parts,
                ctx,
            );
        }

        if parts.method == Method::OPTIONS && max_forwards_is_zero(&parts) {
            return self.module_response(
                StatusCode::OK,
                Body::empty(),
                &parts,
                ctx,
            );
        }

        if let Err(err) =
            self.cache.flush_invalidated_entries_for(&parts).await
        {
            if err.is_cache_subsystem() {
                log::warn!("cache invalidation failed: {err}");
            } else {
                // Not a storage failure: the cache cannot even key this
                // request, which makes it fatally non-compliant.
                log::debug!("rejecting request the cache cannot key: {err}");
                return self.module_response(
                    StatusCode::BAD_REQUEST,
                    Body::full(err.to_string().into_bytes()),
                    &parts,
                    ctx,
                );
            }
        }

        if !request_policy::is_servable_from_cache(&parts) {
            return self.call_backend(route, parts, req_body, ctx).await;
        }

        let lookup = match self.cache.find(&parts).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_cache_subsystem() => {
                log::warn!("cache lookup failed, treating as miss: {err}");
                None
            }
            Err(err) => {
                log::debug!("rejecting request the cache cannot key: {err}");
                return self.module_response(
                    StatusCode::BAD_REQUEST,
                    Body::full(err.to_string().into_bytes()),
                    &parts,
                    ctx,
                );
            }
        };

        let Some(lookup) = lookup else {
            if request_policy::only_if_cached(&parts) {
                return self.gateway_timeout(&parts, ctx);
            }
            return self.call_backend(route, parts, req_body, ctx).await;
        };

        match lookup {
            Lookup::Entry { entry, selector, storage_key } => {
                self.dispatch_entry(
                    route, parts, req_body, entry, &selector, storage_key,
                    ctx,
                )
                .await
            }
            Lookup::VariantMiss { selector: _, parent: _, variants } => {
                if request_policy::only_if_cached(&parts) {
                    return self.gateway_timeout(&parts, ctx);
                }
                self.negotiate_variants(route, parts, req_body, variants, ctx)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_entry(
        &self,
        route: &Route,
        parts: request::Parts,
        req_body: Body,
        entry: CacheEntry,
        selector: &str,
        storage_key: String,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let now = SystemTime::now();
        match suitability::check(&parts, &entry, selector, now, &self.config)
        {
            Suitability::Suitable => {
                let stale = !validity::is_fresh(&entry, now, &self.config);
                self.serve_entry(
                    &entry,
                    &parts,
                    now,
                    stale,
                    CacheStatus::CacheHit,
                    ctx,
                )
                .await
            }
            Suitability::SuitableNotModified => {
                self.synthesize_not_modified(&entry, &parts, now, ctx)
            }
            Suitability::Unsuitable(reason) => {
                if !validity::is_revalidatable(&entry) {
                    if request_policy::only_if_cached(&parts) {
                        return self.gateway_timeout(&parts, ctx);
                    }
                    return self
                        .call_backend(route, parts, req_body, ctx)
                        .await;
                }

                if reason == Unsuitable::Stale
                    && validity::may_return_stale_while_revalidating(
                        &entry,
                        now,
                        &self.config,
                    )
                {
                    self.spawn_revalidation(
                        route,
                        &parts,
                        entry.clone(),
                        storage_key,
                    );
                    return self
                        .serve_entry(
                            &entry,
                            &parts,
                            now,
                            true,
                            CacheStatus::CacheHit,
                            ctx,
                        )
                        .await;
                }

                if request_policy::only_if_cached(&parts) {
                    return self.gateway_timeout(&parts, ctx);
                }

                let force_end_to_end = matches!(
                    reason,
                    Unsuitable::MustRevalidate
                        | Unsuitable::RevalidationForced
                );
                self.revalidate(
                    route,
                    parts,
                    entry,
                    &storage_key,
                    force_end_to_end,
                    ctx,
                )
                .await
            }
        }
    }

    async fn revalidate(
        &self,
        route: &Route,
        parts: request::Parts,
        entry: CacheEntry,
        storage_key: &str,
        force_end_to_end: bool,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let cond_parts =
            conditional::build_conditional(&parts, &entry, force_end_to_end);
        let request_date = SystemTime::now();
        let result = self
            .backend
            .execute(route, Request::from_parts(cond_parts, Body::empty()), ctx)
            .await;
        let response_date = SystemTime::now();

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                return self
                    .stale_or_error(err, &entry, &parts, response_date, ctx)
                    .await;
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            let (rparts, stale_body) = response.into_parts();
            stale_body.close();
            match self
                .cache
                .update_from_not_modified(
                    storage_key,
                    &entry,
                    &rparts.headers,
                    request_date,
                    response_date,
                )
                .await
            {
                Ok(Some(updated)) => {
                    self.serve_entry(
                        &updated,
                        &parts,
                        response_date,
                        false,
                        CacheStatus::Validated,
                        ctx,
                    )
                    .await
                }
                Ok(None) => {
                    // The 304 is older than what we hold; ask again with
                    // caching switched off end to end.
                    let refresh =
                        conditional::build_unconditional_refresh(&parts);
                    self.call_backend(route, refresh, Body::empty(), ctx)
                        .await
                }
                Err(err) => {
                    log::warn!("storing revalidation result failed: {err}");
                    self.serve_entry(
                        &entry,
                        &parts,
                        response_date,
                        false,
                        CacheStatus::Validated,
                        ctx,
                    )
                    .await
                }
            }
        } else if status.is_server_error() {
            let lenient = validity::may_return_stale_if_error(
                &entry,
                response_date,
                &self.config,
            ) || !validity::must_revalidate(&entry, &self.config);
            if lenient {
                let (rparts, error_body) = response.into_parts();
                drop(rparts);
                error_body.close();
                self.serve_entry(
                    &entry,
                    &parts,
                    response_date,
                    true,
                    CacheStatus::CacheHit,
                    ctx,
                )
                .await
            } else {
                self.process_backend_response(
                    &parts,
                    response,
                    request_date,
                    response_date,
                    CacheStatus::CacheMiss,
                    true,
                    ctx,
                )
                .await
            }
        } else {
            // Full replacement (or an unrelated status) from the validator.
            self.process_backend_response(
                &parts,
                response,
                request_date,
                response_date,
                CacheStatus::Validated,
                true,
                ctx,
            )
            .await
        }
    }

    async fn negotiate_variants(
        &self,
        route: &Route,
        parts: request::Parts,
        req_body: Body,
        variants: Vec<Variant>,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        if variants.is_empty() {
            return self.call_backend(route, parts, req_body, ctx).await;
        }

        let cond_parts =
            conditional::build_conditional_from_variants(&parts, &variants);
        let request_date = SystemTime::now();
        let result = self
            .backend
            .execute(route, Request::from_parts(cond_parts, Body::empty()), ctx)
            .await;
        let response_date = SystemTime::now();
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                ctx.cache_status = Some(CacheStatus::Failure);
                return Err(err);
            }
        };

        if response.status() != StatusCode::NOT_MODIFIED {
            return self
                .process_backend_response(
                    &parts,
                    response,
                    request_date,
                    response_date,
                    CacheStatus::CacheMiss,
                    true,
                    ctx,
                )
                .await;
        }

        // The origin picked one of the offered entity-tags.
        let (rparts, stale_body) = response.into_parts();
        stale_body.close();
        let chosen = rparts
            .headers
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .and_then(|etag| {
                variants.into_iter().find(|v| v.entry.etag() == Some(etag))
            });
        let Some(chosen) = chosen else {
            // A 304 naming no variant we hold cannot be used; fetch fresh.
            let refresh = conditional::build_unconditional_refresh(&parts);
            return self.call_backend(route, refresh, Body::empty(), ctx).await;
        };

        match self
            .cache
            .update_from_not_modified(
                &chosen.storage_key,
                &chosen.entry,
                &rparts.headers,
                request_date,
                response_date,
            )
            .await
        {
            Ok(Some(updated)) => {
                self.serve_entry(
                    &updated,
                    &parts,
                    response_date,
                    false,
                    CacheStatus::Validated,
                    ctx,
                )
                .await
            }
            Ok(None) => {
                let refresh = conditional::build_unconditional_refresh(&parts);
                self.call_backend(route, refresh, Body::empty(), ctx).await
            }
            Err(err) => {
                log::warn!("storing variant revalidation failed: {err}");
                self.serve_entry(
                    &chosen.entry,
                    &parts,
                    response_date,
                    false,
                    CacheStatus::Validated,
                    ctx,
                )
                .await
            }
        }
    }

    async fn call_backend(
        &self,
        route: &Route,
        parts: request::Parts,
        req_body: Body,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let request_date = SystemTime::now();
        let forwarded = Request::from_parts(parts.clone(), req_body);
        let result = self.backend.execute(route, forwarded, ctx).await;
        let response_date = SystemTime::now();
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                ctx.cache_status = Some(CacheStatus::Failure);
                return Err(err);
            }
        };
        self.process_backend_response(
            &parts,
            response,
            request_date,
            response_date,
            CacheStatus::CacheMiss,
            false,
            ctx,
        )
        .await
    }

    /// Common tail for responses arriving from the origin: hop-by-hop
    /// scrubbing, location invalidation, storability, size cap, commit.
    #[allow(clippy::too_many_arguments)]
    async fn process_backend_response(
        &self,
        parts: &request::Parts,
        response: Response<Body>,
        request_date: SystemTime,
        response_date: SystemTime,
        classification: CacheStatus,
        lookup_hit: bool,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let (mut rparts, rbody) = response.into_parts();
        compliance::scrub_hop_by_hop(&mut rparts.headers);

        if rparts.status != StatusCode::NOT_MODIFIED {
            if let Err(err) = self
                .cache
                .invalidate_from_exchange(parts, &rparts.headers)
                .await
            {
                log::warn!("location invalidation failed: {err}");
            }
        }

        let is_get_head =
            parts.method == Method::GET || parts.method == Method::HEAD;
        let version = HttpVersion::try_from(rparts.version)
            .unwrap_or(HttpVersion::Http11);
        let storable = is_get_head
            && response_policy::is_storable(
                parts,
                rparts.status.as_u16(),
                version,
                &rparts.headers,
                &self.config,
            );

        let out_body = if storable {
            match reader::read_limited(rbody, self.config.max_object_size)
                .await
            {
                Ok(ReadOutcome::Complete(resource)) => {
                    if let Err(err) = self
                        .cache
                        .commit(
                            parts,
                            &rparts,
                            &resource,
                            request_date,
                            response_date,
                        )
                        .await
                    {
                        log::warn!("cache commit failed: {err}");
                    }
                    Body::full(resource.read().await?)
                }
                // Over the object size cap: pass through, uncached.
                Ok(ReadOutcome::Overflow(passthrough)) => passthrough,
                Err(err) => {
                    ctx.cache_status = Some(CacheStatus::Failure);
                    return Err(err.into());
                }
            }
        } else {
            rbody
        };

        self.finish(&mut rparts.headers, false, lookup_hit);
        self.classify(ctx, classification);
        Ok(Response::from_parts(rparts, out_body))
    }

    async fn serve_entry(
        &self,
        entry: &CacheEntry,
        parts: &request::Parts,
        now: SystemTime,
        stale: bool,
        classification: CacheStatus,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let include_body = parts.method != Method::HEAD;
        let body = match (&entry.body, include_body) {
            (Some(resource), true) => Body::full(resource.read().await?),
            _ => Body::empty(),
        };
        let mut response = facade::response_from_entry(entry, body)?;
        compliance::scrub_hop_by_hop(response.headers_mut());

        let age = validity::current_age(entry, now).as_secs();
        response.headers_mut().insert(
            http::header::AGE,
            HeaderValue::from_str(&age.to_string())?,
        );
        if stale {
            // Every stale response served carries warn-code 110.
            let warning = format!(
                "110 {} \"Response is stale\"",
                self.config.via_pseudonym
            );
            response
                .headers_mut()
                .append(crate::WARNING, HeaderValue::from_str(&warning)?);
        }

        self.finish(response.headers_mut(), true, true);
        self.classify(ctx, classification);
        Ok(response)
    }

    fn synthesize_not_modified(
        &self,
        entry: &CacheEntry,
        parts: &request::Parts,
        now: SystemTime,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let mut response = Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .version(entry.version.into())
            .body(Body::empty())?;
        *response.headers_mut() = entry.header_map();
        compliance::scrub_hop_by_hop(response.headers_mut());
        // Entity headers come off only when the client's validator matched
        // strongly; a weak match still identifies the entity loosely enough
        // that the client may need them.
        if suitability::matched_validator_is_strong(parts, entry) {
            compliance::strip_entity_headers_from_304(response.headers_mut());
        }
        let age = validity::current_age(entry, now).as_secs();
        response.headers_mut().insert(
            http::header::AGE,
            HeaderValue::from_str(&age.to_string())?,
        );
        self.finish(response.headers_mut(), true, true);
        self.classify(ctx, CacheStatus::CacheHit);
        Ok(response)
    }

    fn gateway_timeout(
        &self,
        parts: &request::Parts,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        self.module_response(
            StatusCode::GATEWAY_TIMEOUT,
            Body::from("Gateway Timeout"),
            parts,
            ctx,
        )
    }

    fn module_response(
        &self,
        status: StatusCode,
        body: Body,
        parts: &request::Parts,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let mut response =
            Response::builder().status(status).version(parts.version).body(body)?;
        self.finish(response.headers_mut(), false, false);
        self.classify(ctx, CacheStatus::CacheModuleResponse);
        Ok(response)
    }

    fn finish(
        &self,
        headers: &mut http::HeaderMap,
        hit: bool,
        lookup_hit: bool,
    ) {
        if self.config.cache_status_headers {
            let mark = |yes: bool| {
                HeaderValue::from_static(if yes { "HIT" } else { "MISS" })
            };
            headers.insert(XCACHE, mark(hit));
            headers.insert(XCACHELOOKUP, mark(lookup_hit));
        }
        compliance::add_via(
            headers,
            Version::HTTP_11,
            &self.config.via_pseudonym,
        );
    }

    fn classify(&self, ctx: &mut ExecContext, status: CacheStatus) {
        ctx.cache_status = Some(status);
        match status {
            CacheStatus::CacheHit => self.stats.record_hit(),
            CacheStatus::CacheMiss => self.stats.record_miss(),
            CacheStatus::Validated => self.stats.record_update(),
            CacheStatus::CacheModuleResponse | CacheStatus::Failure => {}
        }
    }

    async fn stale_or_error(
        &self,
        err: CacheError,
        entry: &CacheEntry,
        parts: &request::Parts,
        now: SystemTime,
        ctx: &mut ExecContext,
    ) -> Result<Response<Body>> {
        let lenient = validity::may_return_stale_if_error(
            entry,
            now,
            &self.config,
        ) || !validity::must_revalidate(entry, &self.config);
        if lenient {
            log::debug!("serving stale entry after backend failure: {err}");
            self.serve_entry(
                entry,
                parts,
                now,
                true,
                CacheStatus::CacheHit,
                ctx,
            )
            .await
        } else {
            ctx.cache_status = Some(CacheStatus::Failure);
            Err(err)
        }
    }

    fn spawn_revalidation(
        &self,
        route: &Route,
        parts: &request::Parts,
        entry: CacheEntry,
        storage_key: String,
    ) {
        let cond_parts = conditional::build_conditional(parts, &entry, false);
        let cache = self.cache.clone();
        let backend = Arc::clone(&self.backend);
        let stats = Arc::clone(&self.stats);
        let config = self.config.clone();
        let route = route.clone();
        let req_parts = parts.clone();
        let key = storage_key.clone();

        self.validator.enqueue(&storage_key, async move {
            let mut ctx = ExecContext::new();
            let request_date = SystemTime::now();
            let response = backend
                .execute(
                    &route,
                    Request::from_parts(cond_parts, Body::empty()),
                    &mut ctx,
                )
                .await?;
            let response_date = SystemTime::now();
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                let (rparts, stale_body) = response.into_parts();
                stale_body.close();
                if cache
                    .update_from_not_modified(
                        &key,
                        &entry,
                        &rparts.headers,
                        request_date,
                        response_date,
                    )
                    .await?
                    .is_some()
                {
                    stats.record_update();
                }
                Ok(())
            } else if status.is_success() {
                let (mut rparts, rbody) = response.into_parts();
                compliance::scrub_hop_by_hop(&mut rparts.headers);
                let version = HttpVersion::try_from(rparts.version)
                    .unwrap_or(HttpVersion::Http11);
                if response_policy::is_storable(
                    &req_parts,
                    status.as_u16(),
                    version,
                    &rparts.headers,
                    &config,
                ) {
                    match reader::read_limited(
                        rbody,
                        config.max_object_size,
                    )
                    .await?
                    {
                        ReadOutcome::Complete(resource) => {
                            cache
                                .commit(
                                    &req_parts,
                                    &rparts,
                                    &resource,
                                    request_date,
                                    response_date,
                                )
                                .await?;
                            stats.record_update();
                        }
                        ReadOutcome::Overflow(oversized) => {
                            oversized.close();
                        }
                    }
                }
                Ok(())
            } else {
                let stale_body = response.into_body();
                stale_body.close();
                Err(CacheError::backend(format!(
                    "origin answered {status} during background revalidation"
                )))
            }
        });
    }
}

fn max_forwards_is_zero(parts: &request::Parts) -> bool {
    parts
        .headers
        .get("max-forwards")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        == Some("0")
}
