//! # Candidate Gathering and Racing Engine
//!
//! Bridges selection properties to concrete transports. Establishment runs
//! in three steps:
//!
//! 1. **Filter and rank** the registered adapters: a stack is eligible iff
//!    every `Require` is provided and no `Prohibit` is; eligible stacks are
//!    ranked by satisfied `Prefer` minus satisfied `Avoid`, ties broken by
//!    registration order (UDP → TCP → QUIC). An empty eligible set fails
//!    `initiate`/`listen` synchronously with `NoCandidate`.
//! 2. **Gather candidates**: resolve the remote endpoints and cross the
//!    ranked adapters with every resolved address the adapter's families
//!    support.
//! 3. **Race**: start every candidate concurrently on the reactor; the
//!    first to establish wins and is attached to the Connection, the losers
//!    are aborted without ever touching user callbacks. When every
//!    candidate fails, the failure of the last-ranked candidate is reported
//!    — an arbitrary but deterministic aggregate.
//!
//! An optional deadline bounds the whole race; expiry aborts every
//! outstanding candidate and reports `Timeout`.

use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionCallbacks};
use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::error::{Result, TapsError};
use crate::preconnection::Preconnection;
use crate::properties::{Preference, SelectionProperties, SelectionProperty};
use crate::protocol::{EstablishedTransport, ProtocolAdapter, ProtocolCapabilities};
use crate::runtime;
use crate::security::SecurityParameters;

/// One raceable pairing of a protocol adapter and a resolved remote.
pub(crate) struct CandidateStack {
    pub adapter: &'static dyn ProtocolAdapter,
    pub remote: RemoteEndpoint,
}

/// Filter adapters against Require/Prohibit and rank the survivors.
/// The sort is stable, so equal scores keep registration order.
pub(crate) fn rank_eligible(
    selection: &SelectionProperties,
    adapters: &[&'static dyn ProtocolAdapter],
) -> Vec<&'static dyn ProtocolAdapter> {
    let mut scored: Vec<(i32, &'static dyn ProtocolAdapter)> = Vec::new();

    'adapters: for adapter in adapters {
        let capabilities = adapter.capabilities();
        let mut score = 0i32;
        for property in SelectionProperty::ALL {
            let provides = capabilities.provides(property);
            match selection.preference(property) {
                Preference::Require if !provides => continue 'adapters,
                Preference::Prohibit if provides => continue 'adapters,
                Preference::Prefer if provides => score += 1,
                Preference::Avoid if provides => score -= 1,
                _ => {}
            }
        }
        scored.push((score, *adapter));
    }

    scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
    scored.into_iter().map(|(_, adapter)| adapter).collect()
}

/// Resolve the remote endpoints and cross them with the ranked adapters,
/// filtered by address-family support. Adapter rank dominates the order.
pub(crate) async fn gather_candidates(
    ranked: &[&'static dyn ProtocolAdapter],
    remotes: &[RemoteEndpoint],
) -> Result<Vec<CandidateStack>> {
    let mut resolved: Vec<RemoteEndpoint> = Vec::new();
    let mut last_error = None;
    for remote in remotes {
        match remote.resolve().await {
            Ok(entries) => resolved.extend(entries),
            Err(e) => {
                warn!("endpoint resolution failed for {}: {}", remote, e);
                last_error = Some(e);
            }
        }
    }
    if resolved.is_empty() {
        return Err(last_error.unwrap_or(TapsError::NoCandidate));
    }

    let mut candidates = Vec::new();
    for adapter in ranked {
        for remote in &resolved {
            let addr = remote
                .resolved_address()
                .expect("resolved endpoint without address");
            if adapter.capabilities().supports_address(&addr) {
                candidates.push(CandidateStack {
                    adapter: *adapter,
                    remote: remote.clone(),
                });
            }
        }
    }
    if candidates.is_empty() {
        return Err(TapsError::NoCandidate);
    }
    Ok(candidates)
}

/// Active establishment entry point backing `Preconnection::initiate`.
///
/// Adapter eligibility is evaluated synchronously so a hopeless selection
/// fails with `NoCandidate` before any connection exists; everything else
/// happens on the reactor, reporting through the registered callbacks.
pub(crate) fn initiate(
    preconnection: &Preconnection,
    callbacks: ConnectionCallbacks,
    timeout: Option<Duration>,
) -> Result<Rc<Connection>> {
    runtime::ensure_initialized()?;
    if preconnection.remote_endpoints().is_empty() {
        return Err(TapsError::InvalidArgument(
            "preconnection has no remote endpoint",
        ));
    }

    let adapters = runtime::adapters()?;
    let ranked = rank_eligible(preconnection.transport_properties().selection(), &adapters);
    if ranked.is_empty() {
        return Err(TapsError::NoCandidate);
    }

    let conn = Connection::new_outbound(
        preconnection.transport_properties(),
        preconnection.security_parameters(),
        callbacks,
    );
    let race = runtime::spawn(race_task(
        Rc::clone(&conn),
        ranked,
        preconnection.remote_endpoints().to_vec(),
        preconnection.local_endpoint().cloned(),
        preconnection.security_parameters().clone(),
        timeout,
    ));
    conn.set_race_task(race);
    Ok(conn)
}

async fn race_task(
    conn: Rc<Connection>,
    ranked: Vec<&'static dyn ProtocolAdapter>,
    remotes: Vec<RemoteEndpoint>,
    local: Option<LocalEndpoint>,
    security: SecurityParameters,
    timeout: Option<Duration>,
) {
    // The local endpoint resolves once, shared by every candidate.
    let local = match local {
        Some(endpoint) => match endpoint.resolve().await {
            Ok(entries) => entries.into_iter().next(),
            Err(e) => {
                conn.establishment_failed(e);
                return;
            }
        },
        None => None,
    };

    let outcome = match timeout {
        Some(deadline) => {
            match tokio::time::timeout(deadline, run_race(&ranked, &remotes, local, security)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(TapsError::Timeout),
            }
        }
        None => run_race(&ranked, &remotes, local, security).await,
    };

    if conn.cancelled() {
        // A user close during racing already settled the connection.
        return;
    }
    match outcome {
        Ok((capabilities, remote, transport)) => {
            conn.attach_transport(transport, remote, capabilities)
        }
        Err(error) => conn.establishment_failed(error),
    }
}

type RaceWin = (
    &'static ProtocolCapabilities,
    RemoteEndpoint,
    EstablishedTransport,
);

async fn run_race(
    ranked: &[&'static dyn ProtocolAdapter],
    remotes: &[RemoteEndpoint],
    local: Option<LocalEndpoint>,
    security: SecurityParameters,
) -> Result<RaceWin> {
    let candidates = gather_candidates(ranked, remotes).await?;
    info!("racing {} candidate stack(s)", candidates.len());

    let total = candidates.len();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut attempts = Vec::with_capacity(total);
    for (index, candidate) in candidates.into_iter().enumerate() {
        let tx = tx.clone();
        let local = local.clone();
        let security = security.clone();
        attempts.push(runtime::spawn(async move {
            let capabilities = candidate.adapter.capabilities();
            let result = candidate
                .adapter
                .connect(&candidate.remote, local.as_ref(), &security)
                .await;
            let _ = tx.send((index, capabilities, candidate.remote, result));
        }));
    }
    drop(tx);

    let mut failures: Vec<Option<TapsError>> = std::iter::repeat_with(|| None).take(total).collect();
    while let Some((index, capabilities, remote, result)) = rx.recv().await {
        match result {
            Ok(transport) => {
                debug!("candidate {} ({}) won the race", index, capabilities.name);
                // Losers are aborted; their sockets drop without ever
                // reaching user callbacks.
                for (i, attempt) in attempts.iter().enumerate() {
                    if i != index {
                        attempt.abort();
                    }
                }
                return Ok((capabilities, remote, transport));
            }
            Err(error) => {
                debug!("candidate {} ({}) failed: {}", index, capabilities.name, error);
                failures[index] = Some(error);
            }
        }
    }

    // Every candidate failed: report the last-ranked candidate's failure.
    Err(failures
        .into_iter()
        .flatten()
        .last()
        .unwrap_or(TapsError::NoCandidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::SelectionProperties;
    use crate::protocol::builtin_adapters;

    fn names(adapters: &[&'static dyn ProtocolAdapter]) -> Vec<&'static str> {
        adapters.iter().map(|a| a.capabilities().name).collect()
    }

    #[test]
    fn no_preferences_keep_registration_order() {
        let ranked = rank_eligible(&SelectionProperties::build(), &builtin_adapters());
        assert_eq!(names(&ranked), vec!["udp", "tcp", "quic"]);
    }

    #[test]
    fn require_reliability_excludes_udp() {
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::Reliability, Preference::Require);

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert_eq!(names(&ranked), vec!["tcp", "quic"]);
    }

    #[test]
    fn prohibit_reliability_leaves_only_udp() {
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::Reliability, Preference::Prohibit);

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert_eq!(names(&ranked), vec!["udp"]);
    }

    #[test]
    fn require_multistreaming_forces_quic() {
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::Reliability, Preference::Require);
        selection.set_preference(SelectionProperty::Multistreaming, Preference::Require);

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert_eq!(names(&ranked), vec!["quic"]);
    }

    #[test]
    fn prefer_ranks_providers_first() {
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::Reliability, Preference::Require);
        selection.set_preference(SelectionProperty::Multistreaming, Preference::Prefer);

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert_eq!(names(&ranked), vec!["quic", "tcp"]);
    }

    #[test]
    fn avoid_ranks_providers_last() {
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::CongestionControl, Preference::Avoid);

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert_eq!(names(&ranked), vec!["udp", "tcp", "quic"]);
    }

    #[test]
    fn contradictory_requirements_yield_no_candidate() {
        // Reliability excludes UDP, message boundaries exclude TCP, and
        // the multistreaming prohibition excludes QUIC.
        let mut selection = SelectionProperties::build();
        selection.set_preference(SelectionProperty::Reliability, Preference::Require);
        selection.set_preference(SelectionProperty::Multistreaming, Preference::Prohibit);
        selection.set_preference(
            SelectionProperty::PreserveMsgBoundaries,
            Preference::Require,
        );

        let ranked = rank_eligible(&selection, &builtin_adapters());
        assert!(ranked.is_empty());
    }

    #[tokio::test]
    async fn gathering_crosses_adapters_with_resolved_endpoints() {
        let ranked = rank_eligible(&SelectionProperties::build(), &builtin_adapters());
        let remotes = vec![RemoteEndpoint::build()
            .with_hostname("127.0.0.1")
            .with_port(4433)];

        let candidates = gather_candidates(&ranked, &remotes).await.unwrap();

        assert_eq!(candidates.len(), 3);
        assert!(candidates
            .iter()
            .all(|c| c.remote.resolved_address().unwrap().port() == 4433));
    }
}
