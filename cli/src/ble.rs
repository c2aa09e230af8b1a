//! btleplug-backed `Transport`
//!
//! The orchestrator's requests are queued to a worker task that owns the
//! adapter, performs the async btleplug calls in order, and reports each
//! outcome back as a `TransportEvent`.

use anyhow::{Context, Result};
use btleplug::api::{
    CentralEvent, CharPropFlags, Central, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use fobkey_core::transport::ble::{CharProperties, Characteristic, WriteMode};
use fobkey_core::transport::{
    AdapterState, Advertisement, EventSender, PeripheralId, Transport, TransportError,
    TransportEvent,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Request {
    Scan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics {
        peripheral: PeripheralId,
        service: Uuid,
        filter: Vec<Uuid>,
    },
    Write {
        peripheral: PeripheralId,
        characteristic: Characteristic,
        data: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe {
        peripheral: PeripheralId,
        characteristic: Characteristic,
    },
    Read {
        peripheral: PeripheralId,
        characteristic: Characteristic,
    },
}

/// Handle the orchestrator owns; cheap to call from the event loop
pub struct BtleTransport {
    requests: mpsc::UnboundedSender<Request>,
}

impl BtleTransport {
    /// Open the first adapter and start the worker
    pub async fn spawn(events: EventSender) -> Result<Self> {
        let adapter = get_adapter().await?;
        let central_events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;

        let (requests, request_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            adapter,
            events,
            known: HashMap::new(),
            connected: HashSet::new(),
            forwarders: Forwarders::default(),
        };
        // btleplug only hands out an adapter that is usable
        let _ = worker
            .events
            .send(TransportEvent::AdapterStateChanged(AdapterState::PoweredOn));

        tokio::spawn(worker.run(request_rx, central_events));
        Ok(Self { requests })
    }

    fn send(&self, request: Request) -> Result<(), TransportError> {
        self.requests
            .send(request)
            .map_err(|_| TransportError::Unavailable("BLE worker stopped".to_string()))
    }
}

impl Transport for BtleTransport {
    fn scan(&mut self, service_filter: &[Uuid]) -> Result<(), TransportError> {
        self.send(Request::Scan(service_filter.to_vec()))
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.send(Request::StopScan)
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.send(Request::Connect(peripheral.clone()))
    }

    fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.send(Request::Disconnect(peripheral.clone()))
    }

    fn discover_services(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.send(Request::DiscoverServices(peripheral.clone()))
    }

    fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
        filter: &[Uuid],
    ) -> Result<(), TransportError> {
        self.send(Request::DiscoverCharacteristics {
            peripheral: peripheral.clone(),
            service,
            filter: filter.to_vec(),
        })
    }

    fn write(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.send(Request::Write {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
            data: data.to_vec(),
            mode,
        })
    }

    fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        self.send(Request::Subscribe {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
        })
    }

    fn read(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Result<(), TransportError> {
        self.send(Request::Read {
            peripheral: peripheral.clone(),
            characteristic: characteristic.clone(),
        })
    }

    /// btleplug does not expose the negotiated ATT MTU; 0 selects the
    /// configured default
    fn max_write_len(&self, _peripheral: &PeripheralId, _mode: WriteMode) -> usize {
        0
    }
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .context("Failed to start BLE manager")?;
    let adapters = manager.adapters().await.context("Failed to list adapters")?;
    adapters
        .into_iter()
        .next()
        .context("No Bluetooth adapter found")
}

struct Worker {
    adapter: Adapter,
    events: EventSender,
    /// Peripherals seen while scanning, keyed by address
    known: HashMap<PeripheralId, Peripheral>,
    connected: HashSet<PeripheralId>,
    forwarders: Forwarders,
}

/// One notification forwarder task per peripheral
#[derive(Default)]
struct Forwarders {
    tasks: HashMap<PeripheralId, JoinHandle<()>>,
}

impl Forwarders {
    fn replace(&mut self, peripheral: PeripheralId, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks.insert(peripheral, task) {
            previous.abort();
        }
    }

    fn cancel(&mut self, peripheral: &PeripheralId) {
        if let Some(task) = self.tasks.remove(peripheral) {
            task.abort();
        }
    }
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    ) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = central_events.next() => match event {
                    Some(event) => self.handle_central_event(event).await,
                    None => {
                        warn!("Adapter event stream ended");
                        break;
                    }
                },
            }
        }
        debug!("BLE worker stopped");
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Event loop gone, dropping transport event");
        }
    }

    async fn handle_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                    return;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    return;
                };
                let key = PeripheralId::new(peripheral.address().to_string());
                self.known.insert(key.clone(), peripheral);
                self.emit(TransportEvent::Discovered(Advertisement {
                    peripheral: key,
                    local_name: props.local_name,
                    services: props.services,
                    rssi: props.rssi,
                }));
            }
            CentralEvent::DeviceDisconnected(id) => {
                if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                    let key = PeripheralId::new(peripheral.address().to_string());
                    self.mark_disconnected(&key, Some("link lost".to_string()));
                }
            }
            _ => {}
        }
    }

    fn mark_disconnected(&mut self, peripheral: &PeripheralId, error: Option<String>) {
        self.forwarders.cancel(peripheral);
        if self.connected.remove(peripheral) {
            self.emit(TransportEvent::Disconnected {
                peripheral: peripheral.clone(),
                error,
            });
        }
    }

    fn lookup(&self, peripheral: &PeripheralId) -> Option<Peripheral> {
        self.known.get(peripheral).cloned()
    }

    /// Like `lookup`, but also asks the adapter, which may remember the
    /// peripheral from an earlier session
    async fn find(&mut self, id: &PeripheralId) -> Option<Peripheral> {
        if let Some(peripheral) = self.lookup(id) {
            return Some(peripheral);
        }
        let peripherals = self.adapter.peripherals().await.ok()?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string() == id.as_str())?;
        self.known.insert(id.clone(), peripheral.clone());
        Some(peripheral)
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Scan(filter) => {
                let scan_filter = ScanFilter { services: filter };
                if let Err(e) = self.adapter.start_scan(scan_filter).await {
                    warn!("Scan failed to start: {}", e);
                }
            }
            Request::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("Stop scan failed: {}", e);
                }
            }
            Request::Connect(id) => {
                let Some(peripheral) = self.find(&id).await else {
                    self.emit(TransportEvent::ConnectFailed {
                        peripheral: id,
                        error: "peripheral not known to the adapter".to_string(),
                    });
                    return;
                };
                match peripheral.connect().await {
                    Ok(()) => {
                        info!("BLE link up to {}", id);
                        self.connected.insert(id.clone());
                        self.emit(TransportEvent::Connected { peripheral: id });
                    }
                    Err(e) => self.emit(TransportEvent::ConnectFailed {
                        peripheral: id,
                        error: e.to_string(),
                    }),
                }
            }
            Request::Disconnect(id) => {
                if let Some(peripheral) = self.lookup(&id) {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Disconnect from {} failed: {}", id, e);
                    }
                }
                self.mark_disconnected(&id, None);
            }
            Request::DiscoverServices(id) => {
                let Some(peripheral) = self.lookup(&id) else {
                    return self.mark_disconnected(&id, Some("unknown peripheral".to_string()));
                };
                match peripheral.discover_services().await {
                    Ok(()) => {
                        let services = peripheral.services().iter().map(|s| s.uuid).collect();
                        self.emit(TransportEvent::ServicesFound {
                            peripheral: id,
                            services,
                        });
                    }
                    Err(e) => self.fail_link(&peripheral, &id, e.to_string()).await,
                }
            }
            Request::DiscoverCharacteristics {
                peripheral: id,
                service,
                filter,
            } => {
                let Some(peripheral) = self.lookup(&id) else {
                    return;
                };
                // btleplug resolves every characteristic during service discovery
                let characteristics = peripheral
                    .characteristics()
                    .into_iter()
                    .filter(|c| c.service_uuid == service)
                    .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
                    .map(|c| Characteristic::new(service, c.uuid, properties(c.properties)))
                    .collect();
                self.emit(TransportEvent::CharacteristicsFound {
                    peripheral: id,
                    service,
                    characteristics,
                });
            }
            Request::Write {
                peripheral: id,
                characteristic,
                data,
                mode,
            } => {
                let Some((peripheral, target)) = self.resolve(&id, &characteristic) else {
                    return self.mark_disconnected(&id, Some("write target missing".to_string()));
                };
                let write_type = match mode {
                    WriteMode::WithResponse => WriteType::WithResponse,
                    WriteMode::WithoutResponse => WriteType::WithoutResponse,
                };
                let result = peripheral
                    .write(&target, &data, write_type)
                    .await
                    .map_err(|e| e.to_string());

                match (mode, result) {
                    (WriteMode::WithResponse, result) => {
                        self.emit(TransportEvent::WriteCompleted {
                            peripheral: id,
                            characteristic: characteristic.uuid,
                            result,
                        });
                    }
                    (WriteMode::WithoutResponse, Ok(())) => {}
                    // Unacknowledged writes have no completion; reset the link instead
                    (WriteMode::WithoutResponse, Err(e)) => {
                        self.fail_link(&peripheral, &id, e).await;
                    }
                }
            }
            Request::Subscribe {
                peripheral: id,
                characteristic,
            } => {
                let Some((peripheral, target)) = self.resolve(&id, &characteristic) else {
                    return;
                };
                let result = peripheral.subscribe(&target).await.map_err(|e| e.to_string());
                if result.is_ok() {
                    self.forward_notifications(&peripheral, &id).await;
                }
                self.emit(TransportEvent::NotificationStateChanged {
                    peripheral: id,
                    characteristic: characteristic.uuid,
                    result,
                });
            }
            Request::Read {
                peripheral: id,
                characteristic,
            } => {
                let Some((peripheral, target)) = self.resolve(&id, &characteristic) else {
                    return;
                };
                match peripheral.read(&target).await {
                    Ok(value) => self.emit(TransportEvent::ValueRead {
                        peripheral: id,
                        characteristic: characteristic.uuid,
                        value,
                    }),
                    Err(e) => warn!("Read of {} failed: {}", characteristic.uuid, e),
                }
            }
        }
    }

    fn resolve(
        &self,
        id: &PeripheralId,
        characteristic: &Characteristic,
    ) -> Option<(Peripheral, btleplug::api::Characteristic)> {
        let peripheral = self.lookup(id)?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)?;
        Some((peripheral, target))
    }

    async fn fail_link(&mut self, peripheral: &Peripheral, id: &PeripheralId, error: String) {
        warn!("BLE operation on {} failed: {}", id, error);
        let _ = peripheral.disconnect().await;
        self.mark_disconnected(id, Some(error));
    }

    async fn forward_notifications(&mut self, peripheral: &Peripheral, id: &PeripheralId) {
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Notification stream unavailable: {}", e);
                return;
            }
        };
        let events = self.events.clone();
        let key = id.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let event = TransportEvent::Notified {
                    peripheral: key.clone(),
                    characteristic: notification.uuid,
                    payload: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        self.forwarders.replace(id.clone(), task);
    }
}

fn properties(flags: CharPropFlags) -> CharProperties {
    CharProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
    }
}
