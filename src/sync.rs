//! Provisioning orchestrator
//!
//! Runs the three synchronization steps in order (WiFi, identity, sensor
//! credentials). A step is only attempted once every earlier step resolved
//! during the same boot. Completing a portal form or losing the transport
//! ends the run with [`SyncOutcome::Restart`]; the caller resets the chip.

use crate::broker::{BrokerConnector, CorrelatedRequestClient};
use crate::config::{EmptyCredentialPolicy, SyncConfig};
use crate::correlation::{CorrelationToken, EntropySource};
use crate::payload;
use crate::portal::{FormKind, PortalIo, ProvisioningPortal};
use crate::records::{SensorCredentials, UserEntry, WifiCredentials};
use crate::state_machine::{SyncEvent, SyncState, SyncStateMachine};
use crate::status_led::{LedStatus, StatusIndicator};
use crate::store::{RecordKey, RecordStorage, RecordStore};
use crate::sync_step::{Acquisition, StepOutcome, SyncStep, run_step};
use crate::BoardError;
use alloc::string::String;
use alloc::vec::Vec;
use log::{info, warn};

/// Why the node has to restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// WiFi credentials were saved from the portal
    WifiSubmitted,
    /// The identity was saved from the portal
    IdentitySubmitted,
    /// WiFi or broker became unreachable
    TransportLost,
    /// The broker refused the identity, which was cleared
    IdentityRejected,
}

/// Station-mode and access-point control
#[allow(async_fn_in_trait)]
pub trait WifiLink {
    /// Leave station mode and bring up the provisioning access point
    async fn start_access_point(&mut self) -> Result<(), BoardError>;

    /// Join `credentials` and wait for an address
    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError>;

    fn is_connected(&self) -> bool;
}

/// Everything a fully provisioned node knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedNode {
    pub wifi: WifiCredentials,
    pub entry: UserEntry,
    pub credentials: SensorCredentials,
    /// Token of the request that bound the sensors, when recorded
    pub binding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced(ProvisionedNode),
    Restart(RestartReason),
}

/// Collaborators of one orchestrator run
pub struct SyncDeps<S: RecordStorage, L, P, C, E, I> {
    pub store: RecordStore<S>,
    pub link: L,
    pub portal_io: P,
    pub connector: C,
    pub entropy: E,
    pub indicator: I,
}

pub struct SyncOrchestrator<S, L, P, C, E, I>
where
    S: RecordStorage,
    C: BrokerConnector,
{
    store: RecordStore<S>,
    link: L,
    portal_io: P,
    client: CorrelatedRequestClient<C>,
    entropy: E,
    indicator: I,
    config: SyncConfig,
    machine: SyncStateMachine,
}

impl<S, L, P, C, E, I> SyncOrchestrator<S, L, P, C, E, I>
where
    S: RecordStorage,
    L: WifiLink,
    P: PortalIo,
    C: BrokerConnector,
    E: EntropySource,
    I: StatusIndicator,
{
    pub fn new(deps: SyncDeps<S, L, P, C, E, I>, config: SyncConfig) -> Self {
        Self {
            store: deps.store,
            link: deps.link,
            portal_io: deps.portal_io,
            client: CorrelatedRequestClient::new(deps.connector, &config),
            entropy: deps.entropy,
            indicator: deps.indicator,
            config,
            machine: SyncStateMachine::new(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.machine.get_current_state()
    }

    pub fn store_mut(&mut self) -> &mut RecordStore<S> {
        &mut self.store
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn portal_io(&self) -> &P {
        &self.portal_io
    }

    pub fn portal_io_mut(&mut self) -> &mut P {
        &mut self.portal_io
    }

    pub fn connector(&self) -> &C {
        self.client.connector()
    }

    pub fn connector_mut(&mut self) -> &mut C {
        self.client.connector_mut()
    }

    pub fn indicator(&self) -> &I {
        &self.indicator
    }

    /// Delete every persisted record (factory reset)
    pub fn forget(&mut self) -> Result<(), BoardError> {
        forget(&mut self.store)
    }

    /// Run WiFi, identity and credential sync in order
    pub async fn run(&mut self) -> Result<SyncOutcome, BoardError> {
        self.indicator.set_status(self.machine.get_led_status());

        let result = self.run_stages().await;
        match &result {
            Ok(SyncOutcome::Synced(_)) => {
                self.machine.handle_event(SyncEvent::CredentialsResolved);
            }
            Ok(SyncOutcome::Restart(reason)) => {
                self.machine.handle_event(SyncEvent::RestartRequested(*reason));
            }
            Err(e) => {
                warn!("[SYNC] Provisioning failed: {}", e);
                self.machine.handle_event(SyncEvent::StageFailed);
            }
        }
        self.indicator.set_status(self.machine.get_led_status());
        result
    }

    async fn run_stages(&mut self) -> Result<SyncOutcome, BoardError> {
        let mut wifi_step = WifiStep {
            link: &mut self.link,
            portal_io: &mut self.portal_io,
            indicator: &mut self.indicator,
            config: &self.config,
        };
        let wifi = match run_step(&mut self.store, &mut wifi_step).await? {
            StepOutcome::Cached(wifi) | StepOutcome::Acquired(wifi) => wifi,
            StepOutcome::Restart(reason) => return Ok(SyncOutcome::Restart(reason)),
        };
        self.advance(SyncEvent::WiFiResolved);

        let mut identity_step = IdentityStep {
            link: &mut self.link,
            portal_io: &mut self.portal_io,
            indicator: &mut self.indicator,
            config: &self.config,
        };
        let entry = match run_step(&mut self.store, &mut identity_step).await? {
            StepOutcome::Cached(entry) | StepOutcome::Acquired(entry) => entry,
            StepOutcome::Restart(reason) => return Ok(SyncOutcome::Restart(reason)),
        };
        self.advance(SyncEvent::IdentityResolved);

        let mut credential_step = CredentialStep {
            link: &mut self.link,
            client: &mut self.client,
            entropy: &mut self.entropy,
            indicator: &mut self.indicator,
            config: &self.config,
            wifi: &wifi,
            entry: &entry,
            token: None,
        };
        let outcome = run_step(&mut self.store, &mut credential_step).await?;
        let token = credential_step.token.take();

        let (credentials, binding) = match outcome {
            StepOutcome::Cached(credentials) => (credentials, self.recorded_binding()),
            StepOutcome::Acquired(credentials) => {
                let binding = token.map(|token| {
                    self.record_binding(&token);
                    String::from(token.as_str())
                });
                (credentials, binding)
            }
            StepOutcome::Restart(reason) => return Ok(SyncOutcome::Restart(reason)),
        };

        info!("[SYNC] Node provisioned with {} sensor bindings", credentials.len());
        Ok(SyncOutcome::Synced(ProvisionedNode {
            wifi,
            entry,
            credentials,
            binding,
        }))
    }

    fn advance(&mut self, event: SyncEvent) {
        self.machine.handle_event(event);
        self.indicator.set_status(self.machine.get_led_status());
    }

    fn recorded_binding(&mut self) -> Option<String> {
        match self.store.read_lines(RecordKey::SelfBinding, '\n') {
            Ok(lines) => lines.into_iter().find(|line| !line.is_empty()),
            Err(BoardError::NotFound) => None,
            Err(e) => {
                warn!("[SYNC] Cannot read binding: {}", e);
                None
            }
        }
    }

    fn record_binding(&mut self, token: &CorrelationToken) {
        if let Err(e) = self
            .store
            .write_lines(RecordKey::SelfBinding, &[token.as_str()], false)
        {
            warn!("[SYNC] Failed to record binding {}: {}", token, e);
        }
    }
}

/// Delete every persisted record, skipping the ones already absent
pub fn forget<S: RecordStorage>(store: &mut RecordStore<S>) -> Result<(), BoardError> {
    for key in RecordKey::ALL {
        match store.delete(key) {
            Ok(()) | Err(BoardError::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    info!("[SYNC] All records deleted");
    Ok(())
}

/// Clear a record, logging instead of failing
fn discard<S: RecordStorage>(store: &mut RecordStore<S>, key: RecordKey) {
    if let Err(e) = store.clear(key) {
        warn!("[SYNC] Failed to clear {}: {}", key.path(), e);
    }
}

/// Bring up the access point and serve `kind` until it is submitted
async fn collect_through_portal<S, L, P, I, T>(
    kind: FormKind,
    link: &mut L,
    portal_io: &mut P,
    indicator: &mut I,
    config: &SyncConfig,
    store: &mut RecordStore<S>,
) -> Result<Acquisition<T>, BoardError>
where
    S: RecordStorage,
    L: WifiLink,
    P: PortalIo,
    I: StatusIndicator,
{
    link.start_access_point().await?;
    indicator.set_status(LedStatus::PortalActive);

    ProvisioningPortal::new(kind, config)
        .serve(store, portal_io)
        .await?;

    let reason = match kind {
        FormKind::Wifi => RestartReason::WifiSubmitted,
        FormKind::Identity => RestartReason::IdentitySubmitted,
    };
    Ok(Acquisition::Restart(reason))
}

struct WifiStep<'a, L, P, I> {
    link: &'a mut L,
    portal_io: &'a mut P,
    indicator: &'a mut I,
    config: &'a SyncConfig,
}

impl<L: WifiLink, P: PortalIo, I: StatusIndicator> SyncStep for WifiStep<'_, L, P, I> {
    type Value = WifiCredentials;

    fn name(&self) -> &'static str {
        "WiFi"
    }

    fn key(&self) -> RecordKey {
        RecordKey::WifiSession
    }

    fn parse(&self, lines: &[String]) -> Result<WifiCredentials, BoardError> {
        WifiCredentials::from_lines(lines)
    }

    fn encode(&self, value: &WifiCredentials) -> Result<Vec<String>, BoardError> {
        Ok(value.to_lines())
    }

    async fn acquire<S: RecordStorage>(
        &mut self,
        store: &mut RecordStore<S>,
    ) -> Result<Acquisition<WifiCredentials>, BoardError> {
        collect_through_portal(
            FormKind::Wifi,
            self.link,
            self.portal_io,
            self.indicator,
            self.config,
            store,
        )
        .await
    }
}

struct IdentityStep<'a, L, P, I> {
    link: &'a mut L,
    portal_io: &'a mut P,
    indicator: &'a mut I,
    config: &'a SyncConfig,
}

impl<L: WifiLink, P: PortalIo, I: StatusIndicator> SyncStep for IdentityStep<'_, L, P, I> {
    type Value = UserEntry;

    fn name(&self) -> &'static str {
        "Identity"
    }

    fn key(&self) -> RecordKey {
        RecordKey::UserEntry
    }

    fn parse(&self, lines: &[String]) -> Result<UserEntry, BoardError> {
        UserEntry::from_lines(lines)
    }

    fn encode(&self, value: &UserEntry) -> Result<Vec<String>, BoardError> {
        Ok(value.to_lines())
    }

    async fn acquire<S: RecordStorage>(
        &mut self,
        store: &mut RecordStore<S>,
    ) -> Result<Acquisition<UserEntry>, BoardError> {
        collect_through_portal(
            FormKind::Identity,
            self.link,
            self.portal_io,
            self.indicator,
            self.config,
            store,
        )
        .await
    }
}

struct CredentialStep<'a, L, C: BrokerConnector, E, I> {
    link: &'a mut L,
    client: &'a mut CorrelatedRequestClient<C>,
    entropy: &'a mut E,
    indicator: &'a mut I,
    config: &'a SyncConfig,
    wifi: &'a WifiCredentials,
    entry: &'a UserEntry,
    /// Token of the request that produced the acquired value
    token: Option<CorrelationToken>,
}

impl<L, C, E, I> SyncStep for CredentialStep<'_, L, C, E, I>
where
    L: WifiLink,
    C: BrokerConnector,
    E: EntropySource,
    I: StatusIndicator,
{
    type Value = SensorCredentials;

    fn name(&self) -> &'static str {
        "Sensor credentials"
    }

    fn key(&self) -> RecordKey {
        RecordKey::Typing
    }

    fn parse(&self, lines: &[String]) -> Result<SensorCredentials, BoardError> {
        SensorCredentials::from_lines(lines)
    }

    fn encode(&self, value: &SensorCredentials) -> Result<Vec<String>, BoardError> {
        value.to_lines()
    }

    async fn acquire<S: RecordStorage>(
        &mut self,
        store: &mut RecordStore<S>,
    ) -> Result<Acquisition<SensorCredentials>, BoardError> {
        if !self.link.is_connected() {
            if let Err(e) = self.link.connect(self.wifi).await {
                warn!("[SYNC] Cannot join {}: {}, forgetting the network", self.wifi.ssid, e);
                discard(store, RecordKey::WifiSession);
                return Ok(Acquisition::Restart(RestartReason::TransportLost));
            }
        }

        let token = CorrelationToken::generate(self.entropy);
        let request = self.entry.clone().with_id(token.as_str());
        let body = payload::sync_request_json(&request)?;

        let reply = match self
            .client
            .request(&token, self.config.sync_topic, body.as_bytes())
            .await
        {
            Ok(reply) => reply,
            Err(BoardError::TransportUnavailable) => {
                return Ok(Acquisition::Restart(RestartReason::TransportLost));
            }
            Err(e) => return Err(e),
        };

        match payload::parse_response(&reply) {
            Ok(credentials) => {
                self.token = Some(token);
                Ok(Acquisition::Value(credentials))
            }
            Err(BoardError::Empty) if self.config.empty_credentials == EmptyCredentialPolicy::Accept => {
                info!("[SYNC] Broker bound no sensors, keeping the empty set");
                self.token = Some(token);
                Ok(Acquisition::Value(SensorCredentials::new()))
            }
            Err(e @ (BoardError::Empty | BoardError::InvalidPayload | BoardError::StructuralParseError)) => {
                warn!("[SYNC] Broker rejected the identity ({}), clearing it", e);
                discard(store, RecordKey::UserEntry);
                Ok(Acquisition::Restart(RestartReason::IdentityRejected))
            }
            Err(e) => Err(e),
        }
    }
}
