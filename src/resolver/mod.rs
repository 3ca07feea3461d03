//! # Resolution Engine
//!
//! Orchestrates the full resolution pipeline: cache consultation, prefix
//! service discovery, referral chains with cycle and depth limits, the
//! dual-stack transport race, challenge/response authentication, and
//! session-backed signed operations.
//!
//! State machine per logical request:
//! ```text
//! START -> CACHE_CHECK -> (hit: return)
//!       -> DISCOVER_SERVICE -> SEND
//!       -> {SUCCESS, REFERRAL -> DISCOVER_SERVICE (bounded), ERROR}
//!       -> CACHE_UPDATE -> return
//! ```
//!
//! The engine holds no global state: everything shared by concurrent
//! resolutions (request ids, response-time history, preferred primaries)
//! lives in [`context::ResolverContext`], created with the engine and torn
//! down with it.

pub mod cache;
pub mod context;

pub use cache::{CachedResult, HandleCache, MemoryCache};
pub use context::ResolverContext;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, instrument, trace, warn};

use crate::auth::{
    answer_challenge, now_epoch, sign_message, verify_message_signature, verify_request_digest,
    AuthenticationCredential,
};
use crate::config::ClientConfig;
use crate::core::codec::{decode_message, encode_message, site_info_from_bytes};
use crate::core::envelope::Envelope;
use crate::core::message::{
    Message, MessageBody, MessageBuilder, OpFlags, ResponseCode, SessionKeyMode,
};
use crate::error::{HandleError, Result};
use crate::session::{complete_setup, setup_request, SessionManager, SessionScope};
use crate::transport::udp::UdpTransport;
use crate::transport::{
    Attempt, FixedRequest, RacerConfig, RequestRenderer, TransportRacer,
};
use crate::types::handle::{authority_handle, is_authority_handle, parent_prefix, prefix_of};
use crate::types::site::{InterfaceProtocol, ATTR_DOMAIN, ATTR_PATH};
use crate::types::{HandleValue, SiteInfo, TtlType};

/// Value type holding a serialized site record.
pub const TYPE_SITE: &[u8] = b"HS_SITE";
/// Value type holding a service-handle indirection: its data is another
/// handle whose `HS_SITE` values describe the service.
pub const TYPE_SERVICE: &[u8] = b"HS_SERV";
/// Value type holding an admin record.
pub const TYPE_ADMIN: &[u8] = b"HS_ADMIN";

/// Lifetime stamped on outgoing requests.
const REQUEST_LIFETIME: Duration = Duration::from_secs(300);
/// Default cache lifetime when a response carries no usable TTL.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Challenge/response rounds before authentication fails. Two rounds allow
/// one protocol downgrade against an older verifying party.
const MAX_CHALLENGE_ROUNDS: usize = 2;

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ResolutionOptions {
    /// Require a signed (certified) response, verified against the
    /// answering server's site key.
    pub certify: bool,
    /// Only primary sites may answer.
    pub authoritative: bool,
    /// Restrict the response (and the cache) to publicly readable values.
    pub public_only: bool,
    /// Bypass the cache for this call.
    pub skip_cache: bool,
}

impl Default for ResolutionOptions {
    fn default() -> Self {
        Self {
            certify: false,
            authoritative: false,
            public_only: true,
            skip_cache: false,
        }
    }
}

type StaleSiteCallback = Box<dyn Fn(&str, u16) + Send + Sync>;

pub struct ResolutionEngine {
    recursion_limit: usize,
    negative_cache_ttl: Duration,
    protocols: Vec<InterfaceProtocol>,
    ipv4_handicap: Duration,
    root_sites: Vec<SiteInfo>,
    site_overrides: HashMap<String, Vec<SiteInfo>>,
    cache: Arc<dyn HandleCache>,
    context: Arc<ResolverContext>,
    racer: TransportRacer,
    sessions: SessionManager,
    session_use_dh: bool,
    credential: Option<Arc<dyn AuthenticationCredential>>,
    on_stale_site_info: Option<StaleSiteCallback>,
}

impl ResolutionEngine {
    /// Build an engine from configuration. Fails on invalid configuration.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate_strict()?;
        let racer = TransportRacer::new(
            RacerConfig {
                ipv4_handicap: config.transport.ipv4_handicap,
                race_enabled: config.transport.race_enabled,
                ipv6_enabled: config.transport.ipv6_enabled,
                ipv4_enabled: config.transport.ipv4_enabled,
                stream_timeout: config.transport.stream_timeout,
            },
            UdpTransport::new(
                config.transport.max_udp_payload,
                config.transport.udp_retry_schedule(),
            ),
        );
        Ok(Self {
            recursion_limit: config.resolution.recursion_limit as usize,
            negative_cache_ttl: config.resolution.negative_cache_ttl,
            protocols: config.resolution.protocols(),
            ipv4_handicap: config.transport.ipv4_handicap,
            root_sites: config.root_sites()?,
            site_overrides: config.site_overrides()?,
            cache: Arc::new(MemoryCache::new(config.resolution.cache_capacity)),
            context: Arc::new(ResolverContext::new()),
            racer,
            sessions: SessionManager::new(config.session.max_sessions, config.session.timeout),
            session_use_dh: config.session.use_diffie_hellman,
            credential: None,
            on_stale_site_info: None,
        })
    }

    /// Replace the cache collaborator.
    pub fn with_cache(mut self, cache: Arc<dyn HandleCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Attach the credential used to answer challenges and sign
    /// administrative requests.
    pub fn with_credential(mut self, credential: Arc<dyn AuthenticationCredential>) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Register the callback invoked when a response's site serial shows
    /// the client's cached site information is out of date.
    pub fn on_stale_site_info(
        mut self,
        callback: impl Fn(&str, u16) + Send + Sync + 'static,
    ) -> Self {
        self.on_stale_site_info = Some(Box::new(callback));
        self
    }

    pub fn context(&self) -> Arc<ResolverContext> {
        Arc::clone(&self.context)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Resolve a handle to its values with default options.
    pub async fn resolve(
        &self,
        handle: &str,
        types: &[Vec<u8>],
        indexes: &[u32],
    ) -> Result<Vec<HandleValue>> {
        self.resolve_with(handle, types, indexes, ResolutionOptions::default())
            .await
    }

    /// Resolve a handle to its values.
    ///
    /// A remembered or fresh "not found" answer returns an empty value
    /// list, not an error; hard failures (no service, recursion exhausted,
    /// security failures) are errors.
    #[instrument(skip(self, types, indexes, options))]
    pub async fn resolve_with(
        &self,
        handle: &str,
        types: &[Vec<u8>],
        indexes: &[u32],
        options: ResolutionOptions,
    ) -> Result<Vec<HandleValue>> {
        if handle.is_empty() {
            return Err(HandleError::InvalidHandle(handle.to_string()));
        }
        if !options.skip_cache {
            match self.cache.get(handle, types, indexes) {
                Some(CachedResult::Values(values)) => {
                    trace!(handle, "cache hit");
                    return Ok(values);
                }
                Some(CachedResult::NotFound) => {
                    trace!(handle, "negative cache hit");
                    return Ok(Vec::new());
                }
                None => {}
            }
        }

        let mut visited = HashSet::new();
        let sites = self.discover(handle, 0, &mut visited).await?;
        let response = self
            .resolve_against(&sites, handle, types, indexes, &options, 0)
            .await?;

        match (&response.response_code, &response.body) {
            (ResponseCode::Success, MessageBody::ResolutionResponse { values, .. }) => {
                let cacheable: Vec<HandleValue> = if options.public_only {
                    values
                        .iter()
                        .filter(|v| v.permissions.public_read)
                        .cloned()
                        .collect()
                } else {
                    values.clone()
                };
                self.cache.put(
                    handle,
                    types,
                    indexes,
                    cacheable,
                    cache_ttl(values),
                );
                Ok(values.clone())
            }
            (ResponseCode::HandleNotFound | ResponseCode::ValuesNotFound, _) => {
                self.cache.put_not_found(handle, self.negative_cache_ttl);
                Ok(Vec::new())
            }
            (code, MessageBody::Error { message, .. }) => Err(HandleError::ServerError {
                code: *code,
                message: String::from_utf8_lossy(message).into_owned(),
            }),
            (code, _) => Err(HandleError::Protocol(format!(
                "unexpected response {code:?} to resolution"
            ))),
        }
    }

    /// Perform an arbitrary operation against the service responsible for
    /// `handle`. Mutating opcodes invalidate the handle's cache entries
    /// before anything reaches the network and are sent to primary sites
    /// only.
    #[instrument(skip(self, body, options))]
    pub async fn perform(
        &self,
        handle: &str,
        body: MessageBody,
        options: ResolutionOptions,
    ) -> Result<Message> {
        let op = body
            .request_op_code()
            .ok_or_else(|| HandleError::Protocol("not a request body".into()))?;
        let admin = op.is_mutating();
        if admin {
            self.cache.remove_handle(handle);
        }
        let mut visited = HashSet::new();
        let sites = self.discover(handle, 0, &mut visited).await?;
        self.send_request(&sites, handle, body, &options, 0, admin)
            .await
    }

    // -- service discovery ------------------------------------------------

    /// Sites to send a request for `handle` to: pinned overrides first,
    /// root sites for authority handles, otherwise the sites extracted
    /// from the handle's authority record — resolved recursively, bounded
    /// by the recursion ceiling and a visited set.
    fn discover<'a>(
        &'a self,
        handle: &'a str,
        depth: usize,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<Vec<SiteInfo>>> {
        Box::pin(async move {
            if depth > self.recursion_limit {
                return Err(HandleError::RecursionLimit(handle.to_string()));
            }
            let prefix_key = prefix_of(handle).to_ascii_uppercase();
            if let Some(pinned) = self.site_overrides.get(&prefix_key) {
                trace!(handle, "using pinned site override");
                return Ok(pinned.clone());
            }
            if is_authority_handle(handle) {
                // Authority handles are served by the global root.
                return Ok(self.root_sites.clone());
            }

            let authority = authority_handle(handle);
            if !visited.insert(authority.to_ascii_uppercase()) {
                return Err(HandleError::RecursionLimit(authority));
            }

            // Walk up derived prefixes: 0.NA/10.5000.200 falls back to
            // 0.NA/10.5000 when the derived authority does not exist.
            let mut target = authority;
            loop {
                match self
                    .authority_sites(&target, depth, visited)
                    .await
                {
                    Ok(sites) if !sites.is_empty() => return Ok(sites),
                    Ok(_) => {}
                    Err(HandleError::ServerError {
                        code: ResponseCode::HandleNotFound,
                        ..
                    }) => {}
                    Err(err) => return Err(err),
                }
                let suffix = target
                    .split_once('/')
                    .map(|(_, s)| s.to_string())
                    .unwrap_or_default();
                match parent_prefix(&suffix) {
                    Some(parent) => {
                        target = format!("0.NA/{parent}");
                        if !visited.insert(target.to_ascii_uppercase()) {
                            return Err(HandleError::RecursionLimit(target));
                        }
                    }
                    None => {
                        return Err(HandleError::ServiceNotFound(
                            prefix_of(handle).to_string(),
                        ))
                    }
                }
            }
        })
    }

    /// Resolve one authority handle and extract its site records, chasing
    /// service-handle indirections.
    async fn authority_sites(
        &self,
        authority: &str,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<SiteInfo>> {
        let base = self.discover(authority, depth + 1, visited).await?;
        let response = self
            .resolve_against(
                &base,
                authority,
                &[TYPE_SITE.to_vec(), TYPE_SERVICE.to_vec()],
                &[],
                &ResolutionOptions::default(),
                depth,
            )
            .await?;

        let values = match (&response.response_code, response.body) {
            (ResponseCode::Success, MessageBody::ResolutionResponse { values, .. }) => values,
            (code @ (ResponseCode::HandleNotFound | ResponseCode::ValuesNotFound), _) => {
                return Err(HandleError::ServerError {
                    code: *code,
                    message: format!("authority {authority} not found"),
                })
            }
            (code, MessageBody::Error { message, .. }) => {
                return Err(HandleError::ServerError {
                    code: *code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            (code, _) => {
                return Err(HandleError::Protocol(format!(
                    "unexpected response {code:?} to authority resolution"
                )))
            }
        };

        let mut sites = Vec::new();
        for value in &values {
            if value.value_type == TYPE_SITE {
                match site_info_from_bytes(&value.data) {
                    Ok(site) => sites.push(site),
                    Err(err) => {
                        warn!(authority, error = %err, "skipping malformed site record")
                    }
                }
            }
        }
        for value in &values {
            if value.value_type != TYPE_SERVICE {
                continue;
            }
            let Ok(service_handle) = String::from_utf8(value.data.clone()) else {
                warn!(authority, "skipping non-UTF-8 service handle");
                continue;
            };
            if !visited.insert(service_handle.to_ascii_uppercase()) {
                // Cycle through service indirections.
                return Err(HandleError::RecursionLimit(service_handle));
            }
            debug!(authority, service_handle, "following service indirection");
            match self
                .service_handle_sites(&service_handle, depth + 1, visited)
                .await
            {
                Ok(mut indirect) => sites.append(&mut indirect),
                Err(err) if matches!(err, HandleError::RecursionLimit(_)) => return Err(err),
                Err(err) => warn!(service_handle, error = %err, "service indirection failed"),
            }
        }
        Ok(sites)
    }

    /// Sites listed on a `HS_SERV` target handle.
    async fn service_handle_sites(
        &self,
        service_handle: &str,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Vec<SiteInfo>> {
        let base = self.discover(service_handle, depth, visited).await?;
        let response = self
            .resolve_against(
                &base,
                service_handle,
                &[TYPE_SITE.to_vec()],
                &[],
                &ResolutionOptions::default(),
                depth,
            )
            .await?;
        let mut sites = Vec::new();
        if let (ResponseCode::Success, MessageBody::ResolutionResponse { values, .. }) =
            (&response.response_code, &response.body)
        {
            for value in values {
                if value.value_type == TYPE_SITE {
                    if let Ok(site) = site_info_from_bytes(&value.data) {
                        sites.push(site);
                    }
                }
            }
        }
        Ok(sites)
    }

    // -- request transmission ---------------------------------------------

    /// Send a resolution request, looping on referral responses with the
    /// recursion ceiling and a seen-referral set.
    async fn resolve_against(
        &self,
        sites: &[SiteInfo],
        handle: &str,
        types: &[Vec<u8>],
        indexes: &[u32],
        options: &ResolutionOptions,
        depth: usize,
    ) -> Result<Message> {
        let mut sites = sites.to_vec();
        let mut recursion = depth;
        let mut referrals_seen: HashSet<String> = HashSet::new();
        loop {
            if recursion > self.recursion_limit {
                return Err(HandleError::RecursionLimit(handle.to_string()));
            }
            let body = MessageBody::Resolution {
                handle: handle.to_string(),
                types: types.to_vec(),
                indexes: indexes.to_vec(),
            };
            let response = self
                .send_request(&sites, handle, body, options, recursion as u8, false)
                .await?;
            if !response.response_code.is_referral() {
                return Ok(response);
            }

            let MessageBody::Referral {
                referral_handle,
                sites: referred,
            } = &response.body
            else {
                return Err(HandleError::Protocol(
                    "referral response without referral body".into(),
                ));
            };
            debug!(
                handle,
                referral_handle,
                code = ?response.response_code,
                "following referral"
            );
            recursion += 1;
            if !referred.is_empty() {
                sites = referred.clone();
            } else {
                if !referrals_seen.insert(referral_handle.to_ascii_uppercase()) {
                    return Err(HandleError::RecursionLimit(referral_handle.clone()));
                }
                let mut visited = HashSet::new();
                sites = self
                    .discover(referral_handle, recursion, &mut visited)
                    .await?;
            }
        }
    }

    /// One request against a site list: expand candidates, race, validate,
    /// record response times, and transparently answer challenges.
    async fn send_request(
        &self,
        sites: &[SiteInfo],
        handle: &str,
        body: MessageBody,
        options: &ResolutionOptions,
        recursion: u8,
        admin: bool,
    ) -> Result<Message> {
        let primary_only = admin || options.authoritative;
        let eligible: Vec<&SiteInfo> = sites
            .iter()
            .filter(|site| !primary_only || site.is_primary)
            .collect();
        if eligible.is_empty() {
            return Err(HandleError::ServiceNotFound(prefix_of(handle).to_string()));
        }

        let request_id = self.context.next_request_id();
        let flags = OpFlags {
            certify: options.certify,
            authoritative: options.authoritative,
            public_only: options.public_only,
            return_request_digest: options.certify,
            ..OpFlags::default()
        };
        let mut message = MessageBuilder::request(body)
            .request_id(request_id)
            .recursion_count(recursion)
            .expires_at(now_epoch() + REQUEST_LIFETIME.as_secs() as u32)
            .flags(flags)
            .build();
        if admin {
            if let Some(credential) = &self.credential {
                let unsigned = encode_message(&message);
                message.signature = Some(sign_message(credential.as_ref(), &unsigned)?);
            }
        }
        let encoded = encode_message(&message);

        let (attempts, server_keys, primary_addrs, site_serials) =
            self.expand_candidates(&eligible, handle, admin).await?;
        if attempts.is_empty() {
            return Err(HandleError::ServiceNotFound(prefix_of(handle).to_string()));
        }

        let path = http_path(&eligible, handle);
        let renderer = FixedRequest {
            envelope: Envelope::new(message.version, message.session_id, request_id),
            message: encoded.bytes().to_vec(),
        };
        let request_bytes = encoded.bytes().to_vec();
        let certify = options.certify;
        let validate = move |server: SocketAddr, envelope: &Envelope, bytes: &[u8]| {
            validate_response(
                server,
                envelope,
                bytes,
                request_id,
                certify,
                &server_keys,
                &request_bytes,
            )
        };

        let prefix = prefix_of(handle).to_ascii_uppercase();
        let handicap = match self.context.preferred_primary(&prefix) {
            // A preferred primary already known to answer fast on IPv4
            // forfeits the IPv6 head start.
            Some(IpAddr::V4(_)) => Duration::ZERO,
            _ => self.ipv4_handicap,
        };
        let outcome = self
            .racer
            .send(&attempts, &path, &renderer, &validate, handicap)
            .await?;

        self.context
            .record_response_time(outcome.server.ip(), outcome.elapsed);
        if primary_addrs.contains(&outcome.server.ip()) {
            self.context
                .set_preferred_primary(prefix.clone(), outcome.server.ip());
        }

        let response = decode_message(&outcome.message, &outcome.envelope)?;
        if let Some(known_serial) = site_serials.get(&outcome.server.ip()) {
            if response.site_info_serial > *known_serial {
                if let Some(callback) = &self.on_stale_site_info {
                    callback(&prefix, response.site_info_serial);
                }
            }
        }

        if response.response_code == ResponseCode::AuthenticationNeeded {
            return self
                .answer_challenges(outcome.server, &message, response)
                .await;
        }
        Ok(response)
    }

    /// Expand sites into concrete (address, protocol) attempts: shard to
    /// the responsible server, resolve placeholder addresses through the
    /// site's domain attribute, order by remembered response time, and
    /// fan out across the protocol preference.
    async fn expand_candidates(
        &self,
        sites: &[&SiteInfo],
        handle: &str,
        admin: bool,
    ) -> Result<(
        Vec<Attempt>,
        HashMap<SocketAddr, Vec<u8>>,
        HashSet<IpAddr>,
        HashMap<IpAddr, u16>,
    )> {
        let mut attempts = Vec::new();
        let mut server_keys = HashMap::new();
        let mut primary_addrs = HashSet::new();
        let mut site_serials = HashMap::new();

        for site in sites {
            let Some(server) = site.server_for(handle) else {
                continue;
            };
            let addresses: Vec<IpAddr> = if server.has_placeholder_address() {
                let Some(domain) = site
                    .attribute(ATTR_DOMAIN)
                    .and_then(|d| String::from_utf8(d.to_vec()).ok())
                else {
                    warn!("site server has placeholder address and no domain");
                    continue;
                };
                let resolved = match tokio::net::lookup_host((domain.as_str(), 0)).await {
                    Ok(resolved) => resolved.map(|sa| sa.ip()).collect(),
                    Err(err) => {
                        warn!(domain, error = %err, "name resolution failed");
                        continue;
                    }
                };
                resolved
            } else {
                vec![server.ip_addr()]
            };

            for protocol in &self.protocols {
                let Some(interface) = server.interface_for(*protocol, admin) else {
                    continue;
                };
                for ip in &addresses {
                    let addr = SocketAddr::new(*ip, interface.port as u16);
                    attempts.push(Attempt {
                        server: addr,
                        protocol: *protocol,
                    });
                    server_keys.insert(addr, server.public_key.clone());
                    site_serials.insert(*ip, site.serial);
                    if site.is_primary {
                        primary_addrs.insert(*ip);
                    }
                }
            }
        }

        // Bias toward historically fast servers; the sort is stable, so the
        // protocol preference order survives within each server.
        let mut unique_ips: Vec<IpAddr> = Vec::new();
        for attempt in &attempts {
            if !unique_ips.contains(&attempt.server.ip()) {
                unique_ips.push(attempt.server.ip());
            }
        }
        self.context.order_by_response_time(&mut unique_ips);
        let rank: HashMap<IpAddr, usize> = unique_ips
            .into_iter()
            .enumerate()
            .map(|(rank, ip)| (ip, rank))
            .collect();
        attempts.sort_by_key(|a| rank.get(&a.server.ip()).copied().unwrap_or(usize::MAX));

        Ok((attempts, server_keys, primary_addrs, site_serials))
    }

    /// Answer server challenges with the configured credential, up to
    /// [`MAX_CHALLENGE_ROUNDS`] rounds.
    async fn answer_challenges(
        &self,
        server: SocketAddr,
        original_request: &Message,
        mut response: Message,
    ) -> Result<Message> {
        let Some(credential) = &self.credential else {
            return Err(HandleError::Authentication(
                "server demanded authentication but no credential is configured".into(),
            ));
        };
        for round in 0..MAX_CHALLENGE_ROUNDS {
            let MessageBody::Challenge {
                nonce,
                request_digest,
            } = &response.body
            else {
                return Err(HandleError::Protocol(
                    "challenge response without challenge body".into(),
                ));
            };
            debug!(%server, round, "answering authentication challenge");
            let answer = answer_challenge(credential.as_ref(), nonce, request_digest)?;
            let message = MessageBuilder::request(answer)
                .request_id(self.context.next_request_id())
                .session(response.session_id)
                .expires_at(now_epoch() + REQUEST_LIFETIME.as_secs() as u32)
                .flags(original_request.flags)
                .build();
            response = self.exchange_with_server(server, &message).await?;
            if response.response_code != ResponseCode::AuthenticationNeeded {
                return Ok(response);
            }
        }
        Err(HandleError::Authentication(
            "server kept demanding authentication".into(),
        ))
    }

    /// One direct exchange with a specific server, trying protocols in
    /// preference order without racing.
    async fn exchange_with_server(
        &self,
        server: SocketAddr,
        message: &Message,
    ) -> Result<Message> {
        let encoded = encode_message(message);
        let renderer = FixedRequest {
            envelope: Envelope::new(message.version, message.session_id, message.request_id),
            message: encoded.bytes().to_vec(),
        };
        self.exchange_rendered(server, message.request_id, &renderer)
            .await
    }

    async fn exchange_rendered(
        &self,
        server: SocketAddr,
        request_id: u32,
        renderer: &dyn RequestRenderer,
    ) -> Result<Message> {
        let attempts: Vec<Attempt> = self
            .protocols
            .iter()
            .map(|protocol| Attempt {
                server,
                protocol: *protocol,
            })
            .collect();
        let validate = move |_server: SocketAddr, envelope: &Envelope, bytes: &[u8]| {
            let message = decode_message(bytes, envelope)?;
            check_response_shape(&message, request_id)
        };
        let outcome = self
            .racer
            .send(&attempts, "", renderer, &validate, Duration::ZERO)
            .await?;
        decode_message(&outcome.message, &outcome.envelope)
    }

    // -- sessions ----------------------------------------------------------

    /// Establish an authenticated session with a server, returning its id.
    #[instrument(skip(self))]
    pub async fn establish_session(&self, server: SocketAddr, identity: &str) -> Result<u32> {
        let timeout = self.sessions.default_timeout();
        let (body, exchange) = setup_request(timeout.as_secs() as u32, self.session_use_dh);
        let message = MessageBuilder::request(body)
            .request_id(self.context.next_request_id())
            .expires_at(now_epoch() + REQUEST_LIFETIME.as_secs() as u32)
            .build();
        let response = self.exchange_with_server(server, &message).await?;

        let (mode, algorithm, data) = match (&response.response_code, &response.body) {
            (
                ResponseCode::Success,
                MessageBody::SessionSetupResponse {
                    mode,
                    algorithm,
                    data,
                },
            ) => (*mode, algorithm.clone(), data.clone()),
            (code, MessageBody::Error { message, .. }) => {
                return Err(HandleError::Session(format!(
                    "session setup failed with {code:?}: {}",
                    String::from_utf8_lossy(message)
                )))
            }
            (code, _) => {
                return Err(HandleError::Protocol(format!(
                    "unexpected response {code:?} to session setup"
                )))
            }
        };

        let established = complete_setup(
            response.session_id,
            response.version,
            mode,
            &algorithm,
            &data,
            exchange,
            timeout,
        )?;
        let scope = SessionScope::new(server, identity);
        let session_id = established.session.session_id;
        self.sessions.store(scope.clone(), established.session).await;

        if let Some(follow_up) = established.follow_up {
            debug!(%server, session_id, "sending sealed session key");
            if mode == SessionKeyMode::ServerPublicKey {
                let response = self
                    .send_on_session_once(server, identity, follow_up)
                    .await?;
                if response.response_code != ResponseCode::Success {
                    self.sessions.remove(&scope).await;
                    return Err(HandleError::Session(format!(
                        "key exchange rejected with {:?}",
                        response.response_code
                    )));
                }
            }
        }
        Ok(session_id)
    }

    /// Send a request signed with the live session for (server, identity).
    /// A session-failure response tears the session down, re-establishes
    /// once, and retries once; a second failure is surfaced.
    pub async fn send_on_session(
        &self,
        server: SocketAddr,
        identity: &str,
        body: MessageBody,
    ) -> Result<Message> {
        let response = self
            .send_on_session_once(server, identity, body.clone())
            .await?;
        if !response.response_code.is_session_failure() {
            return Ok(response);
        }

        debug!(%server, code = ?response.response_code, "session failed, repairing");
        let scope = SessionScope::new(server, identity);
        self.sessions.remove(&scope).await;
        self.establish_session(server, identity).await?;
        let retry = self.send_on_session_once(server, identity, body).await?;
        if retry.response_code.is_session_failure() {
            self.sessions.remove(&scope).await;
            return Err(HandleError::Session(format!(
                "session failed again after repair: {:?}",
                retry.response_code
            )));
        }
        Ok(retry)
    }

    async fn send_on_session_once(
        &self,
        server: SocketAddr,
        identity: &str,
        body: MessageBody,
    ) -> Result<Message> {
        let scope = SessionScope::new(server, identity);
        let session_id = self
            .sessions
            .session_id(&scope)
            .await
            .ok_or_else(|| HandleError::Session("no live session for server".into()))?;
        let base = MessageBuilder::request(body)
            .request_id(self.context.next_request_id())
            .session(session_id)
            .expires_at(now_epoch() + REQUEST_LIFETIME.as_secs() as u32)
            .build();
        let renderer = SessionRenderer {
            sessions: &self.sessions,
            scope: scope.clone(),
            base: base.clone(),
        };
        let response = self
            .exchange_rendered(server, base.request_id, &renderer)
            .await?;

        // Inbound MACs on the session are verified (and their counters
        // consumed) before the response is trusted.
        if let Some(block) = &response.signature {
            if block.signer_handle.is_empty() && block.session_counter != 0 {
                let encoded = encode_message(&response);
                self.sessions.verify(&scope, &encoded, block).await?;
            }
        }
        Ok(response)
    }

    /// Tear down a session locally and tell the server.
    pub async fn terminate_session(&self, server: SocketAddr, identity: &str) -> Result<()> {
        let scope = SessionScope::new(server, identity);
        if self.sessions.session_id(&scope).await.is_some() {
            let _ = self
                .send_on_session_once(server, identity, MessageBody::SessionTerminate)
                .await;
        }
        self.sessions.remove(&scope).await;
        Ok(())
    }
}

/// Renderer that re-signs the request with a fresh session counter on
/// every render, so UDP retries are not rejected as counter replays.
struct SessionRenderer<'a> {
    sessions: &'a SessionManager,
    scope: SessionScope,
    base: Message,
}

impl RequestRenderer for SessionRenderer<'_> {
    fn render(&self) -> BoxFuture<'_, Result<(Envelope, Vec<u8>)>> {
        Box::pin(async move {
            let unsigned = encode_message(&self.base);
            let (session_id, block) = self
                .sessions
                .sign(&self.scope, &unsigned)
                .await
                .ok_or_else(|| HandleError::Session("session vanished mid-request".into()))?;
            let mut message = self.base.clone();
            message.session_id = session_id;
            message.signature = Some(block);
            let encoded = encode_message(&message);
            let envelope = Envelope::new(message.version, session_id, message.request_id);
            Ok((envelope, encoded.bytes().to_vec()))
        })
    }
}

/// Structural checks every response must pass before it can win a race.
fn check_response_shape(message: &Message, request_id: u32) -> Result<()> {
    if message.request_id != request_id {
        // A stale response from an earlier request on the same socket.
        return Err(HandleError::Transport("response for a different request".into()));
    }
    if message.is_request() {
        return Err(HandleError::Protocol("received a request, expected a response".into()));
    }
    if message.is_expired(now_epoch()) {
        return Err(HandleError::MessageExpired);
    }
    Ok(())
}

/// Full response validation run inside the race, including certification.
fn validate_response(
    server: SocketAddr,
    envelope: &Envelope,
    bytes: &[u8],
    request_id: u32,
    certify: bool,
    server_keys: &HashMap<SocketAddr, Vec<u8>>,
    request_bytes: &[u8],
) -> Result<()> {
    let message = decode_message(bytes, envelope)?;
    check_response_shape(&message, request_id)?;

    if let Some(digest) = &message.request_digest {
        verify_request_digest(digest, request_bytes)?;
    }
    if certify {
        let Some(block) = &message.signature else {
            return Err(HandleError::NotCertified);
        };
        // Session MACs are verified by the session layer, which owns the
        // key and the counter state; here only asymmetric signatures can
        // be checked.
        if !block.signer_handle.is_empty() {
            let key = server_keys
                .get(&server)
                .filter(|key| !key.is_empty())
                .ok_or(HandleError::NotCertified)?;
            let encoded = encode_message(&message);
            verify_message_signature(key, &encoded, block)?;
        }
    }
    Ok(())
}

/// Derive the URI path used by the HTTP transports: the site's `path`
/// attribute when present, with the handle appended.
fn http_path(sites: &[&SiteInfo], handle: &str) -> String {
    let base = sites
        .iter()
        .find_map(|site| site.attribute(ATTR_PATH))
        .and_then(|p| String::from_utf8(p.to_vec()).ok())
        .unwrap_or_else(|| "api/handles".to_string());
    format!(
        "{}/{}",
        base.trim_matches('/'),
        handle.replace('/', "%2F")
    )
}

/// Cache lifetime for a value list: the smallest TTL among the values.
fn cache_ttl(values: &[HandleValue]) -> Duration {
    let now = now_epoch();
    values
        .iter()
        .map(|value| match value.ttl_type {
            TtlType::Relative => Duration::from_secs(u64::from(value.ttl)),
            TtlType::Absolute => Duration::from_secs(u64::from(value.ttl.saturating_sub(now))),
        })
        .min()
        .unwrap_or(DEFAULT_CACHE_TTL)
}
