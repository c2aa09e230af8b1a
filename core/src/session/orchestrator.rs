//! Connection orchestrator
//!
//! Consumes `TransportEvent`s one at a time, walks the connection state
//! machine, and runs the handshake: next nonce, seal, fragment, ordered
//! writes. All mutation happens inside `handle_event` or the public request
//! methods, so the caller only needs to serialize those calls.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{HandshakeMode, OrchestratorConfig};
use super::state::{ConnectionState, StateError, Trigger};
use super::{ConnectionStatus, OrchestratorDelegate, OrchestratorError};
use crate::crypto::{AeadNonce, Command, PacketCodec, SharedKey};
use crate::nonce::{NonceError, NonceManager, NonceStore};
use crate::transport::ble::{Characteristic, ChunkQueue, Fragmenter, GattError, WriteMode};
use crate::transport::{
    AdapterState, Advertisement, PeripheralId, Transport, TransportError, TransportEvent,
};

/// The packet currently being written
#[derive(Debug, Clone, Copy)]
struct InFlight {
    counter: u64,
    mode: WriteMode,
    awaiting_ack: bool,
}

pub struct ConnectionOrchestrator<T: Transport, S: NonceStore> {
    transport: T,
    nonces: NonceManager<S>,
    key: SharedKey,
    config: OrchestratorConfig,
    delegate: Option<Arc<dyn OrchestratorDelegate>>,

    state: ConnectionState,
    adapter: AdapterState,
    started: bool,

    peripheral: Option<PeripheralId>,
    known_peripheral: Option<PeripheralId>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    battery_char: Option<Characteristic>,

    outbound: ChunkQueue,
    in_flight: Option<InFlight>,
    /// Start of the current wait for a challenge (reactive mode)
    ready_since: Option<Instant>,

    authenticated_count: u64,
    battery_level: Option<u8>,
    last_nonce: Option<u64>,
}

impl<T: Transport, S: NonceStore> ConnectionOrchestrator<T, S> {
    pub fn new(
        transport: T,
        nonces: NonceManager<S>,
        key: SharedKey,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            nonces,
            key,
            config,
            delegate: None,
            state: ConnectionState::Disconnected,
            adapter: AdapterState::Unknown,
            started: false,
            peripheral: None,
            known_peripheral: None,
            write_char: None,
            notify_char: None,
            battery_char: None,
            outbound: ChunkQueue::new_default(),
            in_flight: None,
            ready_since: None,
            authenticated_count: 0,
            battery_level: None,
            last_nonce: None,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn OrchestratorDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Reconnect to this peripheral instead of scanning
    pub fn with_known_peripheral(mut self, peripheral: PeripheralId) -> Self {
        self.known_peripheral = Some(peripheral);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn nonces(&self) -> &NonceManager<S> {
        &self.nonces
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn known_peripheral(&self) -> Option<&PeripheralId> {
        self.known_peripheral.as_ref()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            adapter: self.adapter,
            peripheral: self.peripheral.clone(),
            handshake_mode: self.config.handshake_mode,
            authenticated_count: self.authenticated_count,
            battery_level: self.battery_level,
            last_nonce: self.last_nonce,
            next_nonce: self.nonces.peek(),
        }
    }

    /// Validate the configuration, restore the nonce counter and begin
    /// discovery (unless the adapter is known to be off).
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        self.config.validate()?;
        self.nonces.restore()?;
        self.started = true;
        info!(
            "Orchestrator started ({} handshake, adapter {})",
            self.config.handshake_mode, self.adapter
        );

        if self.adapter_usable() {
            self.begin_discovery()
        } else {
            info!("Waiting for adapter to power on");
            Ok(())
        }
    }

    /// Stop reconnecting and drop the current link
    pub fn shutdown(&mut self) {
        self.started = false;
        if let Some(peripheral) = self.peripheral.clone() {
            if let Err(e) = self.transport.disconnect(&peripheral) {
                warn!("Disconnect on shutdown failed: {}", e);
            }
        }
        if self.state == ConnectionState::Scanning {
            if let Err(e) = self.transport.stop_scan() {
                warn!("Stop scan on shutdown failed: {}", e);
            }
        }
        self.reset_link();
        self.link_lost();
    }

    pub fn handle_event(&mut self, event: TransportEvent) -> Result<(), OrchestratorError> {
        debug!("Event {} in state {}", event, self.state);

        match event {
            TransportEvent::AdapterStateChanged(adapter) => self.on_adapter_state(adapter),
            TransportEvent::Restored { peripheral } => self.on_restored(peripheral),
            TransportEvent::Discovered(advertisement) => self.on_discovered(advertisement),
            TransportEvent::Connected { peripheral } => self.on_connected(peripheral),
            TransportEvent::ConnectFailed { peripheral, error } => {
                if !self.is_current(&peripheral) {
                    return Ok(());
                }
                warn!("Connect to {} failed: {}", peripheral, error);
                // Rescan next time; the fob may have changed address
                self.known_peripheral = None;
                self.handle_link_loss(self.should_reconnect())
            }
            TransportEvent::Disconnected { peripheral, error } => {
                if !self.is_current(&peripheral) {
                    return Ok(());
                }
                match error {
                    Some(e) => warn!("Link to {} lost: {}", peripheral, e),
                    None => info!("Disconnected from {}", peripheral),
                }
                self.handle_link_loss(self.should_reconnect())
            }
            TransportEvent::ServicesFound {
                peripheral,
                services,
            } => self.on_services_found(peripheral, services),
            TransportEvent::CharacteristicsFound {
                peripheral,
                service,
                characteristics,
            } => self.on_characteristics_found(peripheral, service, characteristics),
            TransportEvent::NotificationStateChanged {
                characteristic,
                result,
                ..
            } => {
                match result {
                    Ok(()) => debug!("Notifications enabled on {}", characteristic),
                    Err(e) => warn!("Enabling notifications on {} failed: {}", characteristic, e),
                }
                Ok(())
            }
            TransportEvent::Notified {
                peripheral,
                characteristic,
                payload,
            } => self.on_notified(peripheral, characteristic, payload),
            TransportEvent::WriteCompleted {
                peripheral,
                characteristic,
                result,
            } => self.on_write_completed(peripheral, characteristic, result),
            TransportEvent::ValueRead {
                peripheral,
                characteristic,
                value,
            } => {
                if self.is_current(&peripheral) {
                    self.on_value(characteristic, &value);
                }
                Ok(())
            }
            TransportEvent::Tick { now } => self.on_tick(now),
        }
    }

    /// Seal and send one authentication packet.
    ///
    /// A no-op while a packet is already in flight. Fails without sending
    /// anything if the nonce cannot be persisted.
    pub fn request_handshake(&mut self) -> Result<(), OrchestratorError> {
        match self.state {
            ConnectionState::Authenticating => {
                debug!("Handshake already in flight, trigger ignored");
                return Ok(());
            }
            ConnectionState::Ready => {}
            other => {
                return Err(StateError::InvalidTransition {
                    from: other,
                    trigger: Trigger::HandshakeDispatched,
                }
                .into())
            }
        }

        let (peripheral, write_char) = match (&self.peripheral, &self.write_char) {
            (Some(p), Some(c)) => (p.clone(), c.clone()),
            _ => return Err(TransportError::NotConnected.into()),
        };

        let counter = match self.nonces.next() {
            Ok(counter) => counter,
            Err(NonceError::Exhausted) => {
                return Err(self.raise_fault("nonce counter exhausted".to_string()));
            }
            Err(e) => {
                error!("Handshake skipped, nonce unavailable: {}", e);
                return Err(e.into());
            }
        };

        let packet = match PacketCodec::seal(
            Command::Authenticate.as_u32(),
            &[],
            &self.key,
            &AeadNonce::from_counter(counter),
        ) {
            Ok(packet) => packet,
            Err(e) => {
                return Err(self.raise_fault(format!("seal under nonce {}: {}", counter, e)));
            }
        };

        let mode = write_char.write_mode();
        let chunk_size = match self.transport.max_write_len(&peripheral, mode) {
            0 => self.config.default_mtu,
            n => n,
        };
        let chunks = Fragmenter::fragment(packet.as_bytes(), chunk_size)?;
        let chunk_count = chunks.len();
        self.outbound.clear();
        self.outbound.enqueue_all(chunks)?;

        self.transition(Trigger::HandshakeDispatched)?;
        self.in_flight = Some(InFlight {
            counter,
            mode,
            awaiting_ack: false,
        });
        self.last_nonce = Some(counter);
        self.ready_since = None;

        info!(
            "Sending handshake under nonce {} ({} bytes in {} writes)",
            counter,
            packet.len(),
            chunk_count
        );
        self.pump_writes()
    }

    /// Ask the fob for its battery level; the answer arrives as `ValueRead`
    pub fn read_battery_level(&mut self) -> Result<(), OrchestratorError> {
        let peripheral = match (&self.peripheral, self.state.is_linked()) {
            (Some(p), true) => p.clone(),
            _ => return Err(TransportError::NotConnected.into()),
        };
        let battery = self.battery_char.clone().ok_or(GattError::CharacteristicNotFound(
            self.config.battery_characteristic,
        ))?;
        self.transport.read(&peripheral, &battery)?;
        Ok(())
    }

    fn on_adapter_state(&mut self, adapter: AdapterState) -> Result<(), OrchestratorError> {
        let previous = std::mem::replace(&mut self.adapter, adapter);
        if previous == adapter {
            return Ok(());
        }

        if adapter == AdapterState::PoweredOn {
            info!("Adapter powered on");
            if self.started && self.state.is_idle() {
                return self.begin_discovery();
            }
            return Ok(());
        }

        warn!("Adapter is {}", adapter);
        if !self.state.is_idle() {
            // Power returns through AdapterStateChanged(PoweredOn)
            return self.handle_link_loss(false);
        }
        Ok(())
    }

    fn on_restored(&mut self, peripheral: PeripheralId) -> Result<(), OrchestratorError> {
        info!("Restored peripheral {}", peripheral);
        self.known_peripheral = Some(peripheral.clone());

        match self.state {
            ConnectionState::Disconnected if self.started && self.adapter_usable() => {
                self.begin_discovery()
            }
            ConnectionState::Scanning => self.connect_to(peripheral),
            _ => Ok(()),
        }
    }

    fn on_discovered(&mut self, advertisement: Advertisement) -> Result<(), OrchestratorError> {
        if self.state != ConnectionState::Scanning {
            return Ok(());
        }
        if !advertisement
            .services
            .contains(&self.config.advertised_service)
        {
            debug!("Ignoring {}: service not advertised", advertisement.peripheral);
            return Ok(());
        }

        info!(
            "Discovered fob {} ({})",
            advertisement.peripheral,
            advertisement.local_name.as_deref().unwrap_or("unnamed")
        );
        self.connect_to(advertisement.peripheral)
    }

    fn on_connected(&mut self, peripheral: PeripheralId) -> Result<(), OrchestratorError> {
        if self.state != ConnectionState::Connecting || !self.is_current(&peripheral) {
            debug!("Ignoring unexpected connect from {}", peripheral);
            return Ok(());
        }

        self.transition(Trigger::LinkUp)?;
        info!("Connected to {}", peripheral);
        if let Err(e) = self.transport.discover_services(&peripheral) {
            self.drop_link(&peripheral);
            return Err(e.into());
        }
        Ok(())
    }

    fn on_services_found(
        &mut self,
        peripheral: PeripheralId,
        services: Vec<Uuid>,
    ) -> Result<(), OrchestratorError> {
        if self.state != ConnectionState::Connected || !self.is_current(&peripheral) {
            return Ok(());
        }

        if !services.contains(&self.config.uart_service) {
            warn!("{} has no UART service, disconnecting", peripheral);
            self.drop_link(&peripheral);
            return Err(GattError::ServiceNotFound(self.config.uart_service).into());
        }

        self.transition(Trigger::ServicesResolved)?;
        let uart_filter = [
            self.config.write_characteristic,
            self.config.notify_characteristic,
        ];
        if let Err(e) =
            self.transport
                .discover_characteristics(&peripheral, self.config.uart_service, &uart_filter)
        {
            self.drop_link(&peripheral);
            return Err(e.into());
        }

        if services.contains(&self.config.battery_service) {
            let battery_filter = [self.config.battery_characteristic];
            if let Err(e) = self.transport.discover_characteristics(
                &peripheral,
                self.config.battery_service,
                &battery_filter,
            ) {
                warn!("Battery characteristic discovery failed: {}", e);
            }
        }
        Ok(())
    }

    fn on_characteristics_found(
        &mut self,
        peripheral: PeripheralId,
        service: Uuid,
        characteristics: Vec<Characteristic>,
    ) -> Result<(), OrchestratorError> {
        if !self.state.is_linked() || !self.is_current(&peripheral) {
            return Ok(());
        }

        if service == self.config.battery_service {
            self.battery_char = characteristics
                .into_iter()
                .find(|c| c.uuid == self.config.battery_characteristic);
            if self.config.read_battery_on_connect {
                if let Some(battery) = &self.battery_char {
                    if let Err(e) = self.transport.read(&peripheral, battery) {
                        warn!("Battery read failed: {}", e);
                    }
                }
            }
            return Ok(());
        }
        if service != self.config.uart_service {
            return Ok(());
        }

        let find = |uuid: Uuid| characteristics.iter().find(|c| c.uuid == uuid).cloned();
        let write_char = find(self.config.write_characteristic);
        let notify_char = find(self.config.notify_characteristic);

        let missing = match (&write_char, &notify_char, self.config.handshake_mode) {
            (None, _, _) => Some(self.config.write_characteristic),
            (Some(_), None, HandshakeMode::Reactive) => Some(self.config.notify_characteristic),
            _ => None,
        };
        if let Some(uuid) = missing {
            warn!("{} lacks characteristic {}, disconnecting", peripheral, uuid);
            self.drop_link(&peripheral);
            return Err(GattError::CharacteristicNotFound(uuid).into());
        }

        if let Some(notify) = &notify_char {
            if let Err(e) = self.transport.subscribe(&peripheral, notify) {
                warn!("Subscribe to {} failed: {}", notify.uuid, e);
            }
        }
        self.write_char = write_char;
        self.notify_char = notify_char;

        if self.state == ConnectionState::ServicesDiscovered {
            self.transition(Trigger::CharacteristicsResolved)?;
            self.ready_since = Some(Instant::now());
            if self.config.handshake_mode == HandshakeMode::Eager {
                return self.request_handshake();
            }
        }
        Ok(())
    }

    fn on_notified(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        payload: Vec<u8>,
    ) -> Result<(), OrchestratorError> {
        if !self.is_current(&peripheral) {
            return Ok(());
        }
        if characteristic == self.config.battery_characteristic {
            self.on_value(characteristic, &payload);
            return Ok(());
        }
        if characteristic != self.config.notify_characteristic {
            debug!("Ignoring notification on {}", characteristic);
            return Ok(());
        }

        let text = match std::str::from_utf8(&payload) {
            Ok(text) => text,
            Err(_) => {
                warn!("Dropping non-UTF-8 notification ({} bytes)", payload.len());
                return Ok(());
            }
        };
        if text != self.config.challenge {
            debug!("Ignoring notification {:?}", text);
            return Ok(());
        }

        match self.state {
            ConnectionState::Ready | ConnectionState::Authenticating => {
                debug!("Challenge received");
                self.request_handshake()
            }
            other => {
                debug!("Challenge received while {}, ignored", other);
                Ok(())
            }
        }
    }

    fn on_write_completed(
        &mut self,
        peripheral: PeripheralId,
        characteristic: Uuid,
        result: Result<(), String>,
    ) -> Result<(), OrchestratorError> {
        if !self.is_current(&peripheral) || characteristic != self.config.write_characteristic {
            return Ok(());
        }
        match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.awaiting_ack => in_flight.awaiting_ack = false,
            _ => {
                debug!("Unexpected write completion on {}", characteristic);
                return Ok(());
            }
        }

        match result {
            Ok(()) => self.pump_writes(),
            Err(e) => self.abort_handshake(TransportError::Operation(e)),
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: &[u8]) {
        if characteristic != self.config.battery_characteristic {
            debug!("Ignoring value of {}", characteristic);
            return;
        }
        match value.first() {
            Some(&percent) => {
                info!("Battery level {}%", percent);
                self.battery_level = Some(percent);
                if let Some(delegate) = &self.delegate {
                    delegate.on_battery_level(percent);
                }
            }
            None => warn!("Empty battery level value"),
        }
    }

    fn on_tick(&mut self, now: Instant) -> Result<(), OrchestratorError> {
        if self.state != ConnectionState::Ready
            || self.config.handshake_mode != HandshakeMode::Reactive
        {
            return Ok(());
        }
        let (timeout, since) = match (self.config.challenge_timeout(), self.ready_since) {
            (Some(timeout), Some(since)) => (timeout, since),
            _ => return Ok(()),
        };

        if now.saturating_duration_since(since) >= timeout {
            warn!("No challenge within {:?}, dropping link", timeout);
            self.tear_down_link();
        }
        Ok(())
    }

    /// Write queued chunks until one needs an acknowledgement or the queue
    /// drains
    fn pump_writes(&mut self) -> Result<(), OrchestratorError> {
        loop {
            let in_flight = match self.in_flight {
                Some(in_flight) if !in_flight.awaiting_ack => in_flight,
                _ => return Ok(()),
            };

            let chunk = match self.outbound.dequeue() {
                Some(chunk) => chunk,
                None => return self.finish_handshake(in_flight.counter),
            };

            let (peripheral, write_char) = match (&self.peripheral, &self.write_char) {
                (Some(p), Some(c)) => (p.clone(), c.clone()),
                _ => return self.abort_handshake(TransportError::NotConnected),
            };

            if let Err(e) = self
                .transport
                .write(&peripheral, &write_char, &chunk, in_flight.mode)
            {
                return self.abort_handshake(e);
            }

            if in_flight.mode == WriteMode::WithResponse {
                if let Some(in_flight) = self.in_flight.as_mut() {
                    in_flight.awaiting_ack = true;
                }
            }
        }
    }

    fn finish_handshake(&mut self, counter: u64) -> Result<(), OrchestratorError> {
        self.in_flight = None;
        self.transition(Trigger::HandshakeFinished)?;
        self.authenticated_count += 1;
        info!("Handshake under nonce {} delivered", counter);
        if let Some(delegate) = &self.delegate {
            delegate.on_authenticated(counter);
        }
        Ok(())
    }

    /// A chunk write failed: discard the rest and tear the link down
    fn abort_handshake(&mut self, cause: TransportError) -> Result<(), OrchestratorError> {
        warn!("Handshake aborted: {}", cause);
        self.outbound.clear();
        self.in_flight = None;
        self.transition(Trigger::HandshakeAborted)?;
        self.tear_down_link();
        Err(cause.into())
    }

    /// Log a contract violation and report it to the delegate
    fn raise_fault(&self, reason: String) -> OrchestratorError {
        let fault = OrchestratorError::Fault(reason);
        error!("{}", fault);
        if let Some(delegate) = &self.delegate {
            delegate.on_fault(&fault);
        }
        fault
    }

    /// Drop the GATT handles, move to `Disconnected` and request a
    /// disconnect. The peripheral stays current so its `Disconnected` event
    /// still drives reconnection.
    fn tear_down_link(&mut self) {
        let peripheral = self.peripheral.take();
        self.reset_link();
        self.link_lost();
        if let Some(peripheral) = peripheral {
            self.peripheral = Some(peripheral.clone());
            self.drop_link(&peripheral);
        }
    }

    fn begin_discovery(&mut self) -> Result<(), OrchestratorError> {
        if !self.state.is_idle() {
            return Ok(());
        }

        if let Some(known) = self.known_peripheral.clone() {
            self.transition(Trigger::ReconnectRequested)?;
            self.peripheral = Some(known.clone());
            info!("Reconnecting to {}", known);
            match self.transport.connect(&known) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Reconnect to {} failed: {}, scanning", known, e);
                    self.peripheral = None;
                    self.link_lost();
                }
            }
        }

        self.transition(Trigger::ScanStarted)?;
        info!("Scanning for {}", self.config.advertised_service);
        if let Err(e) = self.transport.scan(&[self.config.advertised_service]) {
            self.link_lost();
            return Err(e.into());
        }
        Ok(())
    }

    fn connect_to(&mut self, peripheral: PeripheralId) -> Result<(), OrchestratorError> {
        if let Err(e) = self.transport.stop_scan() {
            warn!("Stop scan failed: {}", e);
        }
        self.transition(Trigger::TargetDiscovered)?;
        self.peripheral = Some(peripheral.clone());
        self.known_peripheral = Some(peripheral.clone());

        if let Err(e) = self.transport.connect(&peripheral) {
            self.reset_link();
            self.link_lost();
            return Err(e.into());
        }
        Ok(())
    }

    /// Request a disconnect; the `Disconnected` event finishes the reset. If
    /// the request cannot be issued, reset locally.
    fn drop_link(&mut self, peripheral: &PeripheralId) {
        if let Err(e) = self.transport.disconnect(peripheral) {
            warn!("Disconnect from {} failed: {}", peripheral, e);
            let reconnect = self.should_reconnect();
            if let Err(e) = self.handle_link_loss(reconnect) {
                warn!("Recovery after failed disconnect: {}", e);
            }
        }
    }

    fn handle_link_loss(&mut self, reconnect: bool) -> Result<(), OrchestratorError> {
        if self.in_flight.is_some() || !self.outbound.is_empty() {
            warn!(
                "Link lost with {} chunks unsent, packet discarded",
                self.outbound.len()
            );
        }
        self.reset_link();
        self.link_lost();

        if reconnect {
            self.begin_discovery()
        } else {
            Ok(())
        }
    }

    fn reset_link(&mut self) {
        self.peripheral = None;
        self.write_char = None;
        self.notify_char = None;
        self.battery_char = None;
        self.outbound.clear();
        self.in_flight = None;
        self.ready_since = None;
    }

    fn transition(&mut self, trigger: Trigger) -> Result<(), OrchestratorError> {
        let to = match self.state.apply(trigger) {
            Ok(to) => to,
            Err(e) => {
                warn!("{}", e);
                return Err(e.into());
            }
        };
        self.enter(to, trigger);
        Ok(())
    }

    /// `LinkLost` is accepted from every state
    fn link_lost(&mut self) {
        self.enter(ConnectionState::Disconnected, Trigger::LinkLost);
    }

    fn enter(&mut self, to: ConnectionState, trigger: Trigger) {
        let from = self.state;
        if from != to {
            self.state = to;
            debug!("State {} -> {} ({})", from, to, trigger);
            if let Some(delegate) = &self.delegate {
                delegate.on_state_changed(from, to);
            }
        }
    }

    fn is_current(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(peripheral)
    }

    fn adapter_usable(&self) -> bool {
        matches!(self.adapter, AdapterState::PoweredOn | AdapterState::Unknown)
    }

    fn should_reconnect(&self) -> bool {
        self.started && self.config.auto_reconnect && self.adapter_usable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AuthPacket;
    use crate::nonce::{MemoryNonceStore, MockNonceStore, NonceError};
    use crate::transport::ble::CharProperties;

    #[derive(Default)]
    struct StubTransport {
        writes: Vec<Vec<u8>>,
        disconnects: usize,
        scans: usize,
        fail_writes: bool,
    }

    impl Transport for StubTransport {
        fn scan(&mut self, _: &[Uuid]) -> Result<(), TransportError> {
            self.scans += 1;
            Ok(())
        }
        fn stop_scan(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
        fn connect(&mut self, _: &PeripheralId) -> Result<(), TransportError> {
            Ok(())
        }
        fn disconnect(&mut self, _: &PeripheralId) -> Result<(), TransportError> {
            self.disconnects += 1;
            Ok(())
        }
        fn discover_services(&mut self, _: &PeripheralId) -> Result<(), TransportError> {
            Ok(())
        }
        fn discover_characteristics(
            &mut self,
            _: &PeripheralId,
            _: Uuid,
            _: &[Uuid],
        ) -> Result<(), TransportError> {
            Ok(())
        }
        fn write(
            &mut self,
            _: &PeripheralId,
            _: &Characteristic,
            data: &[u8],
            _: WriteMode,
        ) -> Result<(), TransportError> {
            if self.fail_writes {
                return Err(TransportError::Operation("radio busy".to_string()));
            }
            self.writes.push(data.to_vec());
            Ok(())
        }
        fn subscribe(&mut self, _: &PeripheralId, _: &Characteristic) -> Result<(), TransportError> {
            Ok(())
        }
        fn read(&mut self, _: &PeripheralId, _: &Characteristic) -> Result<(), TransportError> {
            Ok(())
        }
        fn max_write_len(&self, _: &PeripheralId, _: WriteMode) -> usize {
            0
        }
    }

    fn fob() -> PeripheralId {
        PeripheralId::from("fob")
    }

    fn uart_chars(config: &OrchestratorConfig) -> Vec<Characteristic> {
        vec![
            Characteristic::new(
                config.uart_service,
                config.write_characteristic,
                CharProperties {
                    write_without_response: true,
                    ..Default::default()
                },
            ),
            Characteristic::new(
                config.uart_service,
                config.notify_characteristic,
                CharProperties {
                    notify: true,
                    ..Default::default()
                },
            ),
        ]
    }

    fn drive_to_ready<S: NonceStore>(orch: &mut ConnectionOrchestrator<StubTransport, S>) {
        let chars = uart_chars(orch.config());
        drive_to_ready_with(orch, chars);
    }

    fn drive_to_ready_with<S: NonceStore>(
        orch: &mut ConnectionOrchestrator<StubTransport, S>,
        characteristics: Vec<Characteristic>,
    ) {
        let config = orch.config().clone();
        orch.start().unwrap();
        orch.handle_event(TransportEvent::Discovered(Advertisement {
            peripheral: fob(),
            local_name: Some("Fob".to_string()),
            services: vec![config.advertised_service],
            rssi: Some(-60),
        }))
        .unwrap();
        orch.handle_event(TransportEvent::Connected { peripheral: fob() })
            .unwrap();
        orch.handle_event(TransportEvent::ServicesFound {
            peripheral: fob(),
            services: vec![config.uart_service],
        })
        .unwrap();
        let _ = orch.handle_event(TransportEvent::CharacteristicsFound {
            peripheral: fob(),
            service: config.uart_service,
            characteristics,
        });
    }

    fn challenge(config: &OrchestratorConfig) -> TransportEvent {
        TransportEvent::Notified {
            peripheral: fob(),
            characteristic: config.notify_characteristic,
            payload: config.challenge.as_bytes().to_vec(),
        }
    }

    fn orchestrator(
        mode: HandshakeMode,
    ) -> ConnectionOrchestrator<StubTransport, MemoryNonceStore> {
        ConnectionOrchestrator::new(
            StubTransport::default(),
            NonceManager::new(MemoryNonceStore::new()),
            SharedKey::from_bytes([7u8; 32]),
            OrchestratorConfig::default().with_mode(mode),
        )
    }

    #[test]
    fn test_reactive_waits_for_challenge() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        drive_to_ready(&mut orch);
        assert_eq!(orch.state(), ConnectionState::Ready);
        assert!(orch.transport().writes.is_empty());

        let config = orch.config().clone();
        orch.handle_event(challenge(&config)).unwrap();

        let packet = orch.transport().writes.concat();
        assert_eq!(packet.len(), 44);
        assert_eq!(orch.transport().writes.len(), 3);
        assert_eq!(AuthPacket::from_bytes(&packet).unwrap().nonce().counter(), 1);
        assert_eq!(orch.status().authenticated_count, 1);
        assert_eq!(orch.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_eager_sends_on_ready() {
        let mut orch = orchestrator(HandshakeMode::Eager);
        drive_to_ready(&mut orch);
        assert_eq!(orch.transport().writes.concat().len(), 44);
        assert_eq!(orch.status().last_nonce, Some(1));
    }

    #[test]
    fn test_other_notifications_ignored() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        drive_to_ready(&mut orch);
        let tx = orch.config().notify_characteristic;

        for payload in [b"hello".to_vec(), vec![0xFF, 0xFE, 0x00]] {
            orch.handle_event(TransportEvent::Notified {
                peripheral: fob(),
                characteristic: tx,
                payload,
            })
            .unwrap();
        }
        assert!(orch.transport().writes.is_empty());
        assert_eq!(orch.nonces().peek(), 1);
    }

    #[test]
    fn test_nonce_failure_keeps_ready() {
        let mut store = MockNonceStore::new();
        store.expect_load().returning(|| Ok(0));
        store
            .expect_store()
            .returning(|_| Err(NonceError::Storage("disk full".to_string())));

        let mut orch = ConnectionOrchestrator::new(
            StubTransport::default(),
            NonceManager::new(store),
            SharedKey::from_bytes([7u8; 32]),
            OrchestratorConfig::default(),
        );
        drive_to_ready(&mut orch);

        let config = orch.config().clone();
        let err = orch.handle_event(challenge(&config)).unwrap_err();
        assert!(matches!(err, OrchestratorError::Nonce(NonceError::Storage(_))));
        assert_eq!(orch.state(), ConnectionState::Ready);
        assert!(orch.transport().writes.is_empty());
    }

    #[test]
    fn test_write_failure_aborts_and_disconnects() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        drive_to_ready(&mut orch);
        orch.transport_mut().fail_writes = true;

        let config = orch.config().clone();
        assert!(orch.handle_event(challenge(&config)).is_err());
        assert_eq!(orch.state(), ConnectionState::Disconnected);
        assert_eq!(orch.transport().disconnects, 1);

        // The disconnect completes and reconnection starts
        orch.handle_event(TransportEvent::Disconnected {
            peripheral: fob(),
            error: None,
        })
        .unwrap();
        assert_eq!(orch.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_failed_ack_blocks_handshakes_until_reconnect() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        let config = orch.config().clone();
        let mut chars = uart_chars(&config);
        chars[0].properties = CharProperties {
            write: true,
            ..Default::default()
        };
        drive_to_ready_with(&mut orch, chars);

        orch.handle_event(challenge(&config)).unwrap();
        assert_eq!(orch.transport().writes.len(), 1);

        let err = orch
            .handle_event(TransportEvent::WriteCompleted {
                peripheral: fob(),
                characteristic: config.write_characteristic,
                result: Err("att error".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Transport(_)));
        assert_eq!(orch.state(), ConnectionState::Disconnected);

        // A challenge queued ahead of the disconnect must not reuse the link
        orch.handle_event(challenge(&config)).unwrap();
        assert_eq!(orch.transport().writes.len(), 1);
        assert_eq!(orch.nonces().peek(), 2);
    }

    #[derive(Default)]
    struct FaultRecorder {
        faults: parking_lot::Mutex<Vec<OrchestratorError>>,
    }

    impl OrchestratorDelegate for FaultRecorder {
        fn on_fault(&self, error: &OrchestratorError) {
            self.faults.lock().push(error.clone());
        }
    }

    #[test]
    fn test_exhausted_nonce_raises_fault() {
        let recorder = Arc::new(FaultRecorder::default());
        let mut orch = ConnectionOrchestrator::new(
            StubTransport::default(),
            NonceManager::new(MemoryNonceStore::with_value(u64::MAX)),
            SharedKey::from_bytes([7u8; 32]),
            OrchestratorConfig::default(),
        )
        .with_delegate(recorder.clone());
        drive_to_ready(&mut orch);

        let config = orch.config().clone();
        let err = orch.handle_event(challenge(&config)).unwrap_err();
        assert!(matches!(err, OrchestratorError::Fault(_)));
        assert_eq!(recorder.faults.lock().as_slice(), &[err]);
        assert!(orch.transport().writes.is_empty());
        assert_eq!(orch.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_handshake_outside_ready_rejected() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        let err = orch.request_handshake().unwrap_err();
        assert!(matches!(err, OrchestratorError::State(_)));
        assert_eq!(orch.nonces().peek(), 1);
    }

    #[test]
    fn test_missing_uart_service_disconnects() {
        let mut orch = orchestrator(HandshakeMode::Reactive);
        orch.start().unwrap();
        let config = orch.config().clone();
        orch.handle_event(TransportEvent::Discovered(Advertisement {
            peripheral: fob(),
            local_name: None,
            services: vec![config.advertised_service],
            rssi: None,
        }))
        .unwrap();
        orch.handle_event(TransportEvent::Connected { peripheral: fob() })
            .unwrap();

        let err = orch
            .handle_event(TransportEvent::ServicesFound {
                peripheral: fob(),
                services: vec![config.battery_service],
            })
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Gatt(GattError::ServiceNotFound(config.uart_service))
        );
        assert_eq!(orch.transport().disconnects, 1);
    }

    #[test]
    fn test_challenge_timeout_drops_link() {
        let mut orch = ConnectionOrchestrator::new(
            StubTransport::default(),
            NonceManager::new(MemoryNonceStore::new()),
            SharedKey::from_bytes([7u8; 32]),
            OrchestratorConfig {
                challenge_timeout_ms: Some(500),
                ..Default::default()
            },
        );
        drive_to_ready(&mut orch);

        orch.handle_event(TransportEvent::Tick { now: Instant::now() })
            .unwrap();
        assert_eq!(orch.transport().disconnects, 0);

        let later = Instant::now() + std::time::Duration::from_secs(1);
        orch.handle_event(TransportEvent::Tick { now: later }).unwrap();
        assert_eq!(orch.transport().disconnects, 1);
        assert_eq!(orch.state(), ConnectionState::Disconnected);
    }
}
