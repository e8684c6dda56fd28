//! Ticket orchestration.
//!
//! Decides, for each authentication outcome, whether to issue a new root
//! session ticket, renew the presented one, or replace it. Also grants and
//! validates derived tickets against a root ticket.
//!
//! # Concurrency
//!
//! Every change to an existing ticket is a read-modify-write through
//! [`TicketRegistry::update`], retried on `VersionConflict` up to
//! `max_update_attempts` times. Each failed attempt means another writer
//! succeeded, so with N concurrent writers a budget of N attempts suffices.
//!
//! # Invariants
//!
//! - A creation call performs at most one `add`.
//! - A renewal keeps the ticket id and use count.
//! - A derived ticket is added only after its root lists it.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::error::{OrchestratorError, TicketError};
use crate::expiration::ExpirationPolicy;
use crate::registry::TicketRegistry;
use crate::ticket::{DerivedTicket, Descendant, RootSessionTicket};
use crate::time::Clock;
use crate::tracking::SessionTrackingPolicy;
use crate::types::{Authentication, TicketId, TicketIdGenerator, TicketKind};

/// Policies applied by the orchestrator to the tickets it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Expiration policy of new root session tickets.
    pub root_policy: ExpirationPolicy,
    /// Expiration policy of new derived tickets.
    pub derived_policy: ExpirationPolicy,
    /// Which descendants a root ticket keeps.
    pub tracking: SessionTrackingPolicy,
    /// Attempts of a read-modify-write before `VersionConflict` surfaces.
    pub max_update_attempts: usize,
}

impl OrchestratorSettings {
    /// Default attempt budget for read-modify-write cycles.
    pub const DEFAULT_MAX_UPDATE_ATTEMPTS: usize = 32;
}

impl Default for OrchestratorSettings {
    /// Eight hour sliding sessions with single-use, ten second derived tickets.
    fn default() -> Self {
        Self {
            root_policy: ExpirationPolicy::Timeout {
                time_to_kill_ms: 8 * 60 * 60 * 1000,
                max_time_to_live_ms: None,
            },
            derived_policy: ExpirationPolicy::MultiUseOrTimeout {
                max_uses: 1,
                time_to_kill_ms: 10_000,
            },
            tracking: SessionTrackingPolicy::TrackAll,
            max_update_attempts: Self::DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }
}

/// Issues, renews and destroys tickets on top of a registry.
#[derive(Debug)]
pub struct TicketOrchestrator<R: TicketRegistry> {
    registry: Arc<R>,
    clock: Arc<dyn Clock>,
    ids: TicketIdGenerator,
    settings: OrchestratorSettings,
}

impl<R: TicketRegistry> TicketOrchestrator<R> {
    /// Create an orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if either policy is invalid or the attempt
    /// budget is zero.
    pub fn new(
        registry: Arc<R>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Result<Self, TicketError> {
        settings.root_policy.validate()?;
        settings.derived_policy.validate()?;
        if settings.max_update_attempts == 0 {
            return Err(TicketError::Configuration(
                "max_update_attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            registry,
            clock,
            ids: TicketIdGenerator::new(),
            settings,
        })
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Produce the root session ticket for a successful authentication.
    ///
    /// - No (or a blank) `existing_root_id`: issue a new ticket.
    /// - The presented ticket is gone (absent, expired or unreadable): remove
    ///   what is left of it and issue a new ticket.
    /// - The presented ticket belongs to the same identity: merge the new
    ///   attributes into it and keep its id.
    /// - The presented ticket belongs to another identity: delete it with its
    ///   descendants and issue a new ticket.
    ///
    /// # Errors
    ///
    /// Returns `TicketCreation` carrying the presented id when the registry
    /// fails for any reason other than the presented ticket being gone.
    pub async fn create_or_update(
        &self,
        authentication: Authentication,
        existing_root_id: Option<&str>,
    ) -> Result<RootSessionTicket, OrchestratorError> {
        let Some(presented) = existing_root_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return self
                .issue_root(authentication)
                .await
                .map_err(|e| OrchestratorError::creation(None, e));
        };

        let id = TicketId::new(presented);
        self.reconcile(&id, authentication)
            .await
            .map_err(|e| OrchestratorError::creation(Some(presented), e))
    }

    async fn reconcile(
        &self,
        id: &TicketId,
        authentication: Authentication,
    ) -> Result<RootSessionTicket, TicketError> {
        for attempt in 1..=self.settings.max_update_attempts {
            let fetched = self.registry.get_root(id).await.and_then(|root| {
                if root.state().is_expired_at(self.clock.now_ms()) {
                    Err(TicketError::NotFound)
                } else {
                    Ok(root)
                }
            });
            let mut existing = match fetched {
                Ok(existing) => existing,
                Err(e) if e.is_ticket_gone() => {
                    debug!(ticket_id = %id, "presented root ticket is gone, issuing a new one");
                    self.delete_best_effort(id).await;
                    return self.issue_root(authentication).await;
                }
                Err(e) => return Err(e),
            };

            if !existing.authentication().is_identity_equal(&authentication) {
                info!(
                    ticket_id = %id,
                    "presented root ticket belongs to another identity, replacing it"
                );
                self.registry.delete(id).await?;
                return self.issue_root(authentication).await;
            }

            existing.merge_authentication(&authentication);
            match self.registry.update(existing.into()).await {
                Ok(updated) => {
                    debug!(ticket_id = %id, "renewed root ticket");
                    return updated.into_root().ok_or(TicketError::NotFound);
                }
                Err(TicketError::VersionConflict(_)) => {
                    trace!(ticket_id = %id, attempt, "renewal lost a version race, retrying");
                }
                Err(TicketError::NotFound) => {
                    debug!(ticket_id = %id, "root ticket vanished during renewal, issuing a new one");
                    return self.issue_root(authentication).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(TicketError::VersionConflict(id.clone()))
    }

    async fn issue_root(&self, authentication: Authentication) -> Result<RootSessionTicket, TicketError> {
        let id = self.ids.next(TicketKind::Root);
        let ticket = RootSessionTicket::new(
            id,
            authentication,
            self.settings.root_policy,
            self.clock.now_ms(),
        );
        let stored = self.registry.add(ticket.into()).await?;
        let root = stored.into_root().ok_or(TicketError::NotFound)?;
        info!(
            ticket_id = %root.id(),
            principal = %root.authentication().principal.id,
            "issued root ticket"
        );
        Ok(root)
    }

    /// Grant a derived ticket for `service` against the root ticket `root_id`.
    ///
    /// Counts one use of the root ticket and records the new descendant
    /// through the tracking policy. Descendants the policy evicts are deleted
    /// best-effort.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the root ticket is absent or expired
    /// - `InvalidTicketState` if `service` is blank
    /// - `VersionConflict` if the attempt budget ran out
    /// - `StorageUnavailable` if the registry cannot be reached
    pub async fn grant_derived_ticket(
        &self,
        root_id: &TicketId,
        service: &str,
        tracking_key: Option<&str>,
    ) -> Result<DerivedTicket, TicketError> {
        if service.trim().is_empty() {
            return Err(TicketError::InvalidTicketState(
                "service must not be blank".to_string(),
            ));
        }
        let derived_id = self.ids.next(TicketKind::Derived);

        for attempt in 1..=self.settings.max_update_attempts {
            let mut root = self.registry.get_root(root_id).await?;
            let now = self.clock.now_ms();
            if root.state().is_expired_at(now) {
                debug!(root_id = %root_id, "root ticket expired before the grant");
                return Err(TicketError::NotFound);
            }
            let descendant = Descendant {
                id: derived_id.clone(),
                service: service.to_string(),
                tracking_key: tracking_key.map(str::to_string),
            };
            let evicted = root.record_grant(descendant, self.settings.tracking, now);

            match self.registry.update(root.into()).await {
                Ok(_) => {
                    let derived = DerivedTicket::new(
                        derived_id,
                        root_id.clone(),
                        service.to_string(),
                        self.settings.derived_policy,
                        now,
                    );
                    let stored = self
                        .registry
                        .add(derived.into())
                        .await?
                        .into_derived()
                        .ok_or(TicketError::NotFound)?;
                    for superseded in &evicted {
                        debug!(ticket_id = %superseded, "deleting superseded derived ticket");
                        self.delete_best_effort(superseded).await;
                    }
                    debug!(ticket_id = %stored.id(), root_id = %root_id, "granted derived ticket");
                    return Ok(stored);
                }
                Err(TicketError::VersionConflict(_)) => {
                    trace!(root_id = %root_id, attempt, "grant lost a version race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TicketError::VersionConflict(root_id.clone()))
    }

    /// Validate a derived ticket presented by `service`.
    ///
    /// Records one use of the ticket; a ticket that this use exhausted (for
    /// example the last allowed use) is deleted. Returns the authentication of the
    /// root session.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the ticket is absent, expired, or orphaned
    /// - `InvalidTicketState` if it was granted for another service (the
    ///   ticket is deleted)
    /// - `VersionConflict` if the attempt budget ran out
    /// - `StorageUnavailable` if the registry cannot be reached
    pub async fn validate_derived_ticket(
        &self,
        id: &TicketId,
        service: &str,
    ) -> Result<Authentication, TicketError> {
        for attempt in 1..=self.settings.max_update_attempts {
            let mut derived = self.registry.get_derived(id).await?;
            if derived.service() != service {
                warn!(
                    ticket_id = %id,
                    expected = %derived.service(),
                    presented = %service,
                    "derived ticket presented by another service"
                );
                self.delete_best_effort(id).await;
                return Err(TicketError::InvalidTicketState(format!(
                    "ticket {id} was not granted for {service}"
                )));
            }
            let root = self.registry.get_root(derived.parent_id()).await?;

            let now = self.clock.now_ms();
            if derived.state().is_expired_at(now) || root.state().is_expired_at(now) {
                debug!(ticket_id = %id, "derived ticket expired before validation");
                return Err(TicketError::NotFound);
            }
            derived.record_use(now);
            let state = derived.state();
            let exhausted = state.expiration_policy().is_exhausted_at(Some(state), now);

            match self.registry.update(derived.into()).await {
                Ok(_) => {
                    if exhausted {
                        debug!(ticket_id = %id, "derived ticket used up");
                        self.delete_best_effort(id).await;
                    }
                    return Ok(root.authentication().clone());
                }
                Err(TicketError::VersionConflict(_)) => {
                    trace!(ticket_id = %id, attempt, "validation lost a version race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(TicketError::VersionConflict(id.clone()))
    }

    /// Destroy a root session ticket and its descendants (logout).
    ///
    /// Returns the number of records removed; zero if nothing was stored.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the registry cannot be reached.
    pub async fn destroy_session(&self, root_id: &TicketId) -> Result<usize, TicketError> {
        let removed = self.registry.delete(root_id).await?;
        info!(ticket_id = %root_id, removed, "destroyed session");
        Ok(removed)
    }

    async fn delete_best_effort(&self, id: &TicketId) {
        if let Err(e) = self.registry.delete(id).await {
            warn!(ticket_id = %id, error = %e, "best-effort ticket deletion failed");
        }
    }
}
