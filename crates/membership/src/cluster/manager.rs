//! Holder of the agreed composite cluster membership

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, info};

use super::element::{ClusterMembershipElement, ClusterMembershipElementDelta};
use super::membership::{
    ClusterMembership, ClusterMembershipChange, ClusterMembershipDelta, DomainMembership,
    DomainMembershipChange, DomainMembershipDelta,
};
use super::provider::{ClusterMembershipProvider, DeltaContext};
use crate::error::{MembershipError, MembershipResult, ensure_invariant};
use crate::listener::{ListenerRegistry, ListenerResult, dispatch};
use crate::node::{CORE_DOMAIN, Node};

/// Result of applying a received delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First membership installed
    Installed(u64),
    /// Membership advanced
    Changed(u64),
    /// Delta id not newer than the installed membership; nothing done
    Stale,
    /// Incremental delta does not follow the installed membership
    Gap {
        /// Installed id
        current: u64,
        /// Received id
        received: u64,
    },
    /// Incremental delta received while nothing is installed
    NeedsFull,
}

impl ApplyOutcome {
    /// Whether the delta was applied
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Installed(_) | Self::Changed(_))
    }
}

/// Observer of the cluster membership
pub trait ClusterMembershipListener: Send + Sync {
    /// First cluster membership installed
    fn on_joined(&self, _membership: &ClusterMembership) -> ListenerResult {
        Ok(())
    }

    /// Cluster membership advanced
    fn on_membership_changed(&self, _change: &ClusterMembershipChange) -> ListenerResult {
        Ok(())
    }

    /// Cluster membership uninstalled
    fn on_left(&self) -> ListenerResult {
        Ok(())
    }
}

/// Maintains the composite membership built by the registered providers
pub struct ClusterMembershipManager {
    providers: Vec<Arc<dyn ClusterMembershipProvider>>,
    current: ArcSwapOption<ClusterMembership>,
    last_delta: ArcSwapOption<ClusterMembershipDelta>,
    listeners: ListenerRegistry<dyn ClusterMembershipListener>,
}

impl ClusterMembershipManager {
    /// Create a manager; providers are used in the given order
    pub fn new(providers: Vec<Arc<dyn ClusterMembershipProvider>>) -> MembershipResult<Self> {
        ensure_invariant!(
            !providers.is_empty(),
            "at least one cluster membership provider is required"
        );
        for (index, provider) in providers.iter().enumerate() {
            ensure_invariant!(
                !providers[..index].iter().any(|p| Arc::ptr_eq(p, provider)),
                "provider {} registered twice",
                provider.name()
            );
        }

        Ok(Self {
            providers,
            current: ArcSwapOption::empty(),
            last_delta: ArcSwapOption::empty(),
            listeners: ListenerRegistry::new(),
        })
    }

    /// Registered providers
    pub fn providers(&self) -> &[Arc<dyn ClusterMembershipProvider>] {
        &self.providers
    }

    /// Installed membership
    pub fn membership(&self) -> Option<Arc<ClusterMembership>> {
        self.current.load_full()
    }

    /// Delta that produced the installed membership
    pub fn last_delta(&self) -> Option<Arc<ClusterMembershipDelta>> {
        self.last_delta.load_full()
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn ClusterMembershipListener>) {
        self.listeners.add(listener);
    }

    /// Remove a listener
    pub fn remove_listener(&self, listener: &Arc<dyn ClusterMembershipListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Compute the next delta from the providers' pending changes.
    ///
    /// Returns a full delta with id 1 when nothing is installed, and `None`
    /// when no domain changed.
    pub fn build_delta(&self) -> MembershipResult<Option<ClusterMembershipDelta>> {
        let old = self.current.load_full();
        let old = old.as_deref();

        let mut names: BTreeSet<String> = BTreeSet::new();
        for provider in &self.providers {
            names.extend(provider.domains(old));
        }
        let full = old.is_none();
        if full {
            names.insert(CORE_DOMAIN.to_string());
        }
        if names.is_empty() {
            return Ok(None);
        }

        let id = old.map_or(1, |membership| membership.id() + 1);
        let core_first = names.take(CORE_DOMAIN).into_iter().chain(names);

        let mut core_elements: Option<Vec<Arc<ClusterMembershipElement>>> = old
            .and_then(|membership| membership.core_domain())
            .map(|domain| domain.elements().to_vec());
        let mut domains = Vec::new();

        for name in core_first {
            let is_core = name == CORE_DOMAIN;
            let old_domain = old.and_then(|m| m.domain(&name)).map(Arc::as_ref);
            let mut new_elements: Vec<Arc<ClusterMembershipElement>> =
                Vec::with_capacity(self.providers.len());
            let mut deltas: Vec<ClusterMembershipElementDelta> =
                Vec::with_capacity(self.providers.len());
            let mut changed = false;

            for (index, provider) in self.providers.iter().enumerate() {
                let context = DeltaContext {
                    membership_id: id,
                    domain: &name,
                    old_membership: old,
                    old_domain,
                    old_element: old_domain.and_then(|d| d.element(index)),
                    new_elements: &new_elements,
                    deltas: &deltas,
                    new_core_elements: if is_core {
                        None
                    } else {
                        core_elements.as_deref()
                    },
                };
                let (element, delta) = provider.delta(&context)?;

                changed |= delta.is_some();
                new_elements.push(element);
                deltas.push(delta.unwrap_or(ClusterMembershipElementDelta::Empty));
            }

            if is_core {
                core_elements = Some(new_elements);
            }

            if changed || old_domain.is_none() {
                domains.push(DomainMembershipDelta {
                    name,
                    elements: deltas,
                });
            } else {
                debug!("Domain {} unchanged in cluster membership {}", name, id);
            }
        }

        if domains.is_empty() {
            return Ok(None);
        }

        Ok(Some(ClusterMembershipDelta { id, full, domains }))
    }

    /// Apply a delta, received or locally built
    pub fn apply_delta(&self, delta: &ClusterMembershipDelta) -> MembershipResult<ApplyOutcome> {
        let old = self.current.load_full();

        match old.as_deref() {
            Some(current) if delta.id <= current.id() => return Ok(ApplyOutcome::Stale),
            Some(current) if !delta.full && delta.id != current.id() + 1 => {
                return Ok(ApplyOutcome::Gap {
                    current: current.id(),
                    received: delta.id,
                });
            }
            None if !delta.full => return Ok(ApplyOutcome::NeedsFull),
            _ => {}
        }

        let base = if delta.full { None } else { old.as_deref() };
        let (membership, domains) = self.rebuild(base, delta)?;
        let membership = Arc::new(membership);

        match old {
            None => {
                self.install(membership, delta.clone())?;
                Ok(ApplyOutcome::Installed(delta.id))
            }
            Some(_) => {
                self.change(ClusterMembershipChange {
                    membership,
                    delta: delta.clone(),
                    domains,
                })?;
                Ok(ApplyOutcome::Changed(delta.id))
            }
        }
    }

    /// Install the first membership
    pub fn install(
        &self,
        membership: Arc<ClusterMembership>,
        delta: ClusterMembershipDelta,
    ) -> MembershipResult<()> {
        ensure_invariant!(
            self.current.load().is_none(),
            "cluster membership already installed"
        );
        ensure_invariant!(
            delta.full && delta.id == membership.id(),
            "first cluster membership must come from a full delta"
        );

        info!("Installed {}", membership);
        self.current.store(Some(membership.clone()));
        self.last_delta.store(Some(Arc::new(delta)));

        dispatch(
            "cluster joined",
            self.listeners.snapshot().as_slice(),
            |l| l.on_joined(&membership),
        )
    }

    /// Advance to the next membership
    pub fn change(&self, change: ClusterMembershipChange) -> MembershipResult<()> {
        let current = self.current.load_full().ok_or_else(|| {
            MembershipError::invariant("cannot change cluster membership: nothing is installed")
        })?;
        let next_id = change.membership.id();
        ensure_invariant!(
            next_id == current.id() + 1 || (change.delta.full && next_id > current.id()),
            "cluster membership {} does not follow {}",
            next_id,
            current.id()
        );

        info!(
            "Changed to {} (domains {:?})",
            change.membership,
            change.delta.domain_names()
        );
        self.current.store(Some(change.membership.clone()));
        self.last_delta.store(Some(Arc::new(change.delta.clone())));

        dispatch(
            "cluster membership changed",
            self.listeners.snapshot().as_slice(),
            |l| l.on_membership_changed(&change),
        )
    }

    /// Drop the installed membership; no-op when nothing is installed
    pub fn uninstall(&self) -> MembershipResult<()> {
        self.last_delta.store(None);
        if self.current.swap(None).is_none() {
            return Ok(());
        }

        info!("Uninstalled cluster membership");
        dispatch("cluster left", self.listeners.snapshot().as_slice(), |l| {
            l.on_left()
        })
    }

    /// Full delta recreating the installed membership
    pub fn full_snapshot(&self) -> Option<ClusterMembershipDelta> {
        let membership = self.current.load_full()?;
        let domains = membership
            .domains()
            .iter()
            .map(|domain| DomainMembershipDelta {
                name: domain.name().to_string(),
                elements: self
                    .providers
                    .iter()
                    .zip(domain.elements())
                    .map(|(provider, element)| provider.core_full_delta(element))
                    .collect(),
            })
            .collect();

        Some(ClusterMembershipDelta {
            id: membership.id(),
            full: true,
            domains,
        })
    }

    /// Full view of the installed membership as published to a worker:
    /// the core domain and the worker's own domain
    pub fn worker_view(&self, worker: &Node) -> Option<ClusterMembershipDelta> {
        let membership = self.current.load_full()?;
        let domains = [CORE_DOMAIN, worker.domain()]
            .into_iter()
            .filter_map(|name| membership.domain(name))
            .map(|domain| DomainMembershipDelta {
                name: domain.name().to_string(),
                elements: self
                    .providers
                    .iter()
                    .zip(domain.elements())
                    .map(|(provider, element)| provider.worker_delta(element, worker))
                    .collect(),
            })
            .collect();

        Some(ClusterMembershipDelta {
            id: membership.id(),
            full: true,
            domains,
        })
    }

    /// Incremental delta bringing a worker from the previous membership to
    /// the installed one, if the last delta is incremental
    pub fn worker_increment(&self, worker: &Node) -> Option<ClusterMembershipDelta> {
        let membership = self.current.load_full()?;
        let delta = self.last_delta.load_full()?;
        if delta.full || delta.id != membership.id() {
            return None;
        }
        Some(delta.restricted_to(&[CORE_DOMAIN, worker.domain()]))
    }

    fn rebuild(
        &self,
        base: Option<&ClusterMembership>,
        delta: &ClusterMembershipDelta,
    ) -> MembershipResult<(ClusterMembership, Vec<DomainMembershipChange>)> {
        let provider_count = self.providers.len();
        let mut domains: Vec<Arc<DomainMembership>> =
            base.map(|m| m.domains().to_vec()).unwrap_or_default();
        let mut changes = Vec::with_capacity(delta.domains.len());

        for domain_delta in &delta.domains {
            ensure_invariant!(
                domain_delta.elements.len() == provider_count,
                "delta of domain {} carries {} elements but {} providers are registered",
                domain_delta.name,
                domain_delta.elements.len(),
                provider_count
            );

            let position = domains.iter().position(|d| d.name() == domain_delta.name);
            let old_domain = position.map(|index| domains[index].clone());

            let mut elements = Vec::with_capacity(provider_count);
            let mut element_changes = Vec::with_capacity(provider_count);
            for (index, (provider, element_delta)) in
                self.providers.iter().zip(&domain_delta.elements).enumerate()
            {
                let old_element = old_domain.as_ref().and_then(|d| d.element(index));
                let element = provider.create_membership(element_delta, old_element)?;
                element_changes.push(provider.create_change(
                    element_delta,
                    old_element.map(Arc::as_ref),
                    &element,
                ));
                elements.push(element);
            }

            let domain = Arc::new(DomainMembership::new(domain_delta.name.clone(), elements));
            match position {
                Some(index) => domains[index] = domain,
                None if domain.is_core() => domains.insert(0, domain),
                None => domains.push(domain),
            }

            changes.push(DomainMembershipChange {
                name: domain_delta.name.clone(),
                new_domain: position.is_none(),
                elements: element_changes,
            });
        }

        let membership = ClusterMembership::new(delta.id, domains, provider_count)?;
        Ok((membership, changes))
    }
}
