use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{Connection, NotificationSink, Transport, TransportError, WriteMode};

/// Desk controller service advertised by the BLE module.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ff12_0000_1000_8000_00805f9b34fb);
/// Characteristic command frames are written to.
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
/// Characteristic height and lock reports are notified on.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);
/// How often the adapter's peripheral list is checked while scanning.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BleOptions {
    /// How long to scan when the desk is not yet known to the adapter. Zero
    /// disables scanning.
    pub scan_timeout: Duration,
    pub service_uuid: Uuid,
    pub write_uuid: Uuid,
    pub notify_uuid: Uuid,
}

impl Default for BleOptions {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            service_uuid: SERVICE_UUID,
            write_uuid: WRITE_CHARACTERISTIC_UUID,
            notify_uuid: NOTIFY_CHARACTERISTIC_UUID,
        }
    }
}

/// [`Transport`] backed by the host's first Bluetooth adapter.
pub struct BleTransport {
    adapter: Adapter,
    options: BleOptions,
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        Self::with_options(BleOptions::default()).await
    }

    pub async fn with_options(options: BleOptions) -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        Ok(Self { adapter, options })
    }

    async fn find_known(&self, address: BDAddr) -> Result<Option<Peripheral>, TransportError> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals.into_iter().find(|p| p.address() == address))
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Device = Peripheral;
    type Connection = BleConnection;

    async fn resolve(&self, address: &str) -> Result<Option<Peripheral>, TransportError> {
        let address = address
            .parse::<BDAddr>()
            .map_err(|err| TransportError::Other(format!("invalid address {address}: {err}")))?;

        if let Some(peripheral) = self.find_known(address).await? {
            return Ok(Some(peripheral));
        }
        if self.options.scan_timeout.is_zero() {
            return Ok(None);
        }

        debug!(%address, timeout = ?self.options.scan_timeout, "scanning for desk");
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.options.service_uuid],
            })
            .await?;
        let deadline = Instant::now() + self.options.scan_timeout;
        let found = poll_until(deadline, SCAN_POLL_INTERVAL, || self.find_known(address)).await;
        if let Err(err) = self.adapter.stop_scan().await {
            warn!(%err, "failed to stop scan");
        }

        found
    }

    async fn connect(&self, device: &Peripheral) -> Result<BleConnection, TransportError> {
        device.connect().await?;

        let (write_characteristic, notify_characteristic) =
            match self.discover_characteristics(device).await {
                Ok(found) => found,
                Err(err) => {
                    if let Err(disconnect_err) = device.disconnect().await {
                        warn!(%disconnect_err, "failed to drop incomplete desk link");
                    }
                    return Err(err);
                }
            };

        Ok(BleConnection {
            peripheral: device.clone(),
            write_characteristic,
            notify_characteristic,
            forwarder: Mutex::new(None),
        })
    }
}

impl BleTransport {
    async fn discover_characteristics(
        &self,
        device: &Peripheral,
    ) -> Result<(Characteristic, Characteristic), TransportError> {
        device.discover_services().await?;

        let characteristics = device.characteristics();
        Ok((
            find_characteristic(&characteristics, self.options.write_uuid)?,
            find_characteristic(&characteristics, self.options.notify_uuid)?,
        ))
    }
}

fn find_characteristic<'a>(
    characteristics: impl IntoIterator<Item = &'a Characteristic>,
    uuid: Uuid,
) -> Result<Characteristic, TransportError> {
    characteristics
        .into_iter()
        .find(|ch| ch.uuid == uuid)
        .cloned()
        .ok_or_else(|| TransportError::MissingCharacteristic(uuid.to_string()))
}

/// Write-without-response is only honoured when the characteristic supports it.
fn write_type_for(mode: WriteMode, properties: CharPropFlags) -> WriteType {
    match mode {
        WriteMode::WithoutResponse
            if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) =>
        {
            WriteType::WithoutResponse
        }
        WriteMode::WithoutResponse | WriteMode::WithResponse => WriteType::WithResponse,
    }
}

/// Runs `probe` every `interval` until it yields a value, fails, or `deadline`
/// passes. The probe always runs at least once.
async fn poll_until<T, F, Fut>(
    deadline: Instant,
    interval: Duration,
    mut probe: F,
) -> Result<Option<T>, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, TransportError>>,
{
    loop {
        if let Some(found) = probe().await? {
            return Ok(Some(found));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

pub struct BleConnection {
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    notify_characteristic: Characteristic,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BleConnection {
    fn replace_forwarder(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self.forwarder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = std::mem::replace(&mut *slot, task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl Connection for BleConnection {
    async fn subscribe(&self, sink: NotificationSink) -> Result<(), TransportError> {
        self.peripheral.subscribe(&self.notify_characteristic).await?;
        let mut notifications = self.peripheral.notifications().await?;
        let notify_uuid = self.notify_characteristic.uuid;

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                if sink.send(notification.value).is_err() {
                    break;
                }
            }
            trace!("notification stream closed");
        });
        self.replace_forwarder(Some(task));
        Ok(())
    }

    async fn write(&self, data: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let write_type = write_type_for(mode, self.write_characteristic.properties);
        self.peripheral
            .write(&self.write_characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.replace_forwarder(None);
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        self.replace_forwarder(None);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use btleplug::api::{CharPropFlags, Characteristic, WriteType};
    use tokio::time::Instant;

    use super::{
        BleOptions, NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID,
        find_characteristic, poll_until, write_type_for,
    };
    use crate::transport::{TransportError, WriteMode};

    #[test]
    fn uuids_use_bluetooth_base() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000ff12-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            WRITE_CHARACTERISTIC_UUID.to_string(),
            "0000ff01-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            NOTIFY_CHARACTERISTIC_UUID.to_string(),
            "0000ff02-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn default_options_target_desk_service() {
        let options = BleOptions::default();
        assert_eq!(options.service_uuid, SERVICE_UUID);
        assert!(!options.scan_timeout.is_zero());
    }

    #[test]
    fn write_without_response_needs_characteristic_support() {
        assert_eq!(
            write_type_for(
                WriteMode::WithoutResponse,
                CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE
            ),
            WriteType::WithoutResponse
        );
        assert_eq!(
            write_type_for(WriteMode::WithoutResponse, CharPropFlags::WRITE),
            WriteType::WithResponse
        );
        assert_eq!(
            write_type_for(
                WriteMode::WithResponse,
                CharPropFlags::WRITE_WITHOUT_RESPONSE
            ),
            WriteType::WithResponse
        );
    }

    #[test]
    fn missing_characteristic_names_the_uuid() {
        let characteristics: BTreeSet<Characteristic> = BTreeSet::new();

        let err = find_characteristic(&characteristics, WRITE_CHARACTERISTIC_UUID)
            .expect_err("nothing was discovered");

        assert!(matches!(
            err,
            TransportError::MissingCharacteristic(uuid)
                if uuid == WRITE_CHARACTERISTIC_UUID.to_string()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_stops_as_soon_as_the_desk_appears() {
        let started = Instant::now();
        let mut polls = 0;

        let found = poll_until(
            started + Duration::from_secs(5),
            Duration::from_millis(250),
            || {
                polls += 1;
                let count = polls;
                async move { Ok::<_, TransportError>((count == 3).then_some(count)) }
            },
        )
        .await
        .expect("polling should succeed");

        assert_eq!(found, Some(3));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "waited {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn scan_gives_up_at_the_deadline() {
        let started = Instant::now();

        let found = poll_until(
            started + Duration::from_secs(1),
            Duration::from_millis(300),
            || async { Ok::<Option<()>, TransportError>(None) },
        )
        .await
        .expect("polling should succeed");

        assert_eq!(found, None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "waited {elapsed:?}");
    }
}
