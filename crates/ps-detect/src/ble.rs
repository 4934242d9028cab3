//! BLE discovery
//!
//! A timed scan collects advertisements keyed by address. Peripherals often
//! report several advertisements (one with the service list, one scan
//! response with only a name), so the table keeps the most informative one
//! per address before candidates are filtered and selected.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::DetectError;

/// Default advertised name prefix of PS02 sensors
pub const DEFAULT_NAME_PREFIX: &str = "PS02-LF";

/// One advertisement, reduced to the fields discovery cares about
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Upper-cased device address
    pub address: String,
    /// Advertised local name
    pub local_name: Option<String>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
    /// Whether manufacturer-specific data was present
    pub has_manufacturer_data: bool,
}

impl Advertisement {
    /// Build from btleplug peripheral properties
    pub fn from_properties(props: &PeripheralProperties) -> Self {
        Self {
            address: props.address.to_string().to_uppercase(),
            local_name: props.local_name.clone(),
            rssi: props.rssi,
            services: props.services.clone(),
            has_manufacturer_data: !props.manufacturer_data.is_empty(),
        }
    }

    /// How much this advertisement tells us
    ///
    /// A service list outweighs a name, which outweighs manufacturer data.
    pub fn info_score(&self) -> u32 {
        let mut score = 0;
        if !self.services.is_empty() {
            score += 100;
        }
        if self.local_name.as_deref().is_some_and(|n| !n.is_empty()) {
            score += 10;
        }
        if self.has_manufacturer_data {
            score += 5;
        }
        score
    }

    /// Whether the advertisement lists `service`
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    /// Case-insensitive name prefix match; an empty prefix matches everything
    pub fn name_matches(&self, prefix: &str) -> bool {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return true;
        }
        self.local_name
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            .starts_with(&prefix)
    }
}

/// Scan results deduplicated by address
///
/// Generic over the device handle so selection logic is testable without a
/// radio.
#[derive(Debug)]
pub struct AdvertisementTable<D> {
    entries: HashMap<String, (D, Advertisement)>,
}

impl<D> AdvertisementTable<D> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Record an advertisement
    ///
    /// An existing entry is replaced when the new advertisement scores at
    /// least as high, so later reports win ties.
    pub fn insert(&mut self, device: D, mut adv: Advertisement) {
        adv.address = adv.address.to_uppercase();
        match self.entries.get(&adv.address) {
            Some((_, old)) if adv.info_score() < old.info_score() => {
                trace!("Keeping richer advertisement for {}", adv.address);
            }
            _ => {
                self.entries.insert(adv.address.clone(), (device, adv));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the kept advertisement for an address (any case)
    pub fn get(&self, address: &str) -> Option<&(D, Advertisement)> {
        self.entries.get(&address.to_uppercase())
    }

    /// Iterate over kept advertisements
    pub fn advertisements(&self) -> impl Iterator<Item = &Advertisement> {
        self.entries.values().map(|(_, adv)| adv)
    }

    /// Consume the table into `(device, advertisement)` pairs
    pub fn into_entries(self) -> Vec<(D, Advertisement)> {
        self.entries.into_values().collect()
    }
}

impl<D> Default for AdvertisementTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep devices that advertise `service` and whose name starts with `prefix`
pub fn filter_candidates<D>(
    table: AdvertisementTable<D>,
    prefix: &str,
    service: &Uuid,
) -> Vec<(D, Advertisement)> {
    table
        .into_entries()
        .into_iter()
        .filter(|(_, adv)| adv.advertises(service) && adv.name_matches(prefix))
        .collect()
}

/// Pick one candidate
///
/// A preferred address must be among the candidates. Without one, the
/// strongest signal wins; unknown RSSI ranks last.
pub fn select_candidate<D>(
    candidates: Vec<(D, Advertisement)>,
    preferred_address: Option<&str>,
) -> Result<(D, Advertisement), DetectError> {
    if candidates.is_empty() {
        return Err(DetectError::DeviceNotFound(
            "no BLE sensors advertising the UART service".to_string(),
        ));
    }

    if let Some(pref) = preferred_address.filter(|a| !a.is_empty()) {
        let pref = pref.to_uppercase();
        return candidates
            .into_iter()
            .find(|(_, adv)| adv.address == pref)
            .ok_or_else(|| {
                DetectError::DeviceNotFound(format!(
                    "preferred address {} not among UART-capable candidates",
                    pref
                ))
            });
    }

    candidates
        .into_iter()
        .max_by_key(|(_, adv)| adv.rssi.unwrap_or(i16::MIN))
        .ok_or_else(|| DetectError::DeviceNotFound("no BLE candidates".to_string()))
}

/// Entry in an unfiltered device listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleDeviceSummary {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub matches_prefix: bool,
}

/// Summarize every scanned device, strongest first
///
/// Unlike candidate filtering, the prefix check here is case-sensitive and
/// nothing is excluded.
pub fn list_devices<D>(table: &AdvertisementTable<D>, prefix: &str) -> Vec<BleDeviceSummary> {
    let mut out: Vec<_> = table
        .advertisements()
        .map(|adv| {
            let name = adv.local_name.clone().unwrap_or_default();
            BleDeviceSummary {
                matches_prefix: name.starts_with(prefix),
                name: if name.is_empty() { "Unknown".to_string() } else { name },
                address: adv.address.clone(),
                rssi: adv.rssi,
            }
        })
        .collect();
    out.sort_by_key(|d| std::cmp::Reverse(d.rssi.unwrap_or(i16::MIN)));
    out
}

/// Await `body`, then `stop` whatever `body` returned
///
/// A failing `stop` is logged; the result of `body` is passed through.
async fn stop_after<T>(
    body: impl Future<Output = Result<T, DetectError>>,
    stop: impl Future<Output = Result<(), DetectError>>,
) -> Result<T, DetectError> {
    let result = body.await;
    if let Err(e) = stop.await {
        warn!("Failed to stop BLE scan: {}", e);
    }
    result
}

/// Scanner bound to the first available Bluetooth adapter
pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    /// Open the system Bluetooth manager and take its first adapter
    pub async fn new() -> Result<Self, DetectError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(DetectError::NoAdapter)?;
        Ok(Self { adapter })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration`, collecting advertisements
    pub async fn scan(&self, duration: Duration) -> Result<AdvertisementTable<Peripheral>, DetectError> {
        info!("Scanning BLE for {:?}...", duration);
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let collected = async {
            let mut table = AdvertisementTable::new();
            let deadline = tokio::time::Instant::now() + duration;
            loop {
                let event = match tokio::time::timeout_at(deadline, events.next()).await {
                    Ok(Some(event)) => event,
                    Ok(None) | Err(_) => break,
                };
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. }
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                match self.adapter.peripheral(&id).await {
                    Ok(peripheral) => self.record(&mut table, peripheral).await,
                    Err(e) => trace!("Peripheral {:?} vanished: {}", id, e),
                }
            }

            // Devices cached by the OS before the scan may never raise an event
            for peripheral in self.adapter.peripherals().await? {
                if table.get(&peripheral.address().to_string()).is_none() {
                    self.record(&mut table, peripheral).await;
                }
            }
            Ok::<_, DetectError>(table)
        };

        let table = stop_after(collected, async {
            self.adapter.stop_scan().await.map_err(DetectError::from)
        })
        .await?;
        info!("BLE scan saw {} device(s)", table.len());
        Ok(table)
    }

    async fn record(&self, table: &mut AdvertisementTable<Peripheral>, peripheral: Peripheral) {
        match peripheral.properties().await {
            Ok(Some(props)) => {
                let adv = Advertisement::from_properties(&props);
                trace!("Advertisement {} score {}", adv.address, adv.info_score());
                table.insert(peripheral, adv);
            }
            Ok(None) => {}
            Err(e) => debug!("No properties for {}: {}", peripheral.address(), e),
        }
    }

    /// Scan and return UART-capable sensors matching `prefix`
    pub async fn find_sensors(
        &self,
        prefix: &str,
        service: &Uuid,
        duration: Duration,
    ) -> Result<Vec<(Peripheral, Advertisement)>, DetectError> {
        let table = self.scan(duration).await?;
        let candidates = filter_candidates(table, prefix, service);
        info!(
            "{} BLE candidate(s) with prefix {:?} and the UART service",
            candidates.len(),
            prefix
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UART: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

    fn adv(address: &str, name: Option<&str>, rssi: i16, services: bool) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            local_name: name.map(str::to_string),
            rssi: Some(rssi),
            services: if services { vec![UART] } else { vec![] },
            has_manufacturer_data: false,
        }
    }

    #[test]
    fn test_info_score_priority() {
        let mut a = adv("AA", None, -50, false);
        assert_eq!(a.info_score(), 0);
        a.has_manufacturer_data = true;
        assert_eq!(a.info_score(), 5);
        a.local_name = Some("PS02-LF-1".into());
        assert_eq!(a.info_score(), 15);
        a.services = vec![UART];
        assert_eq!(a.info_score(), 115);
    }

    #[test]
    fn test_dedup_keeps_service_uuids() {
        let mut table = AdvertisementTable::new();
        table.insert(1, adv("aa:bb", Some("PS02-LF"), -40, true));
        table.insert(2, adv("AA:BB", Some("PS02-LF"), -30, false));

        assert_eq!(table.len(), 1);
        let (dev, kept) = table.get("aa:bb").unwrap();
        assert_eq!(*dev, 1);
        assert_eq!(kept.services, vec![UART]);
    }

    #[test]
    fn test_dedup_tie_replaces() {
        let mut table = AdvertisementTable::new();
        table.insert(1, adv("AA", Some("PS02-LF"), -70, true));
        table.insert(2, adv("AA", Some("PS02-LF"), -40, true));
        assert_eq!(table.get("AA").unwrap().0, 2);
    }

    #[test]
    fn test_filter_candidates() {
        let mut table = AdvertisementTable::new();
        table.insert(1, adv("01", Some("PS02-LF-A"), -40, true));
        table.insert(2, adv("02", Some("ps02-lf-b"), -40, true));
        table.insert(3, adv("03", Some("PS02-LF-C"), -40, false));
        table.insert(4, adv("04", Some("Other"), -40, true));
        table.insert(5, adv("05", None, -40, true));

        let mut ids: Vec<_> = filter_candidates(table, "PS02-LF", &UART)
            .into_iter()
            .map(|(d, _)| d)
            .collect();
        ids.sort();
        assert_eq!(ids, [1, 2]);
    }

    #[test]
    fn test_empty_prefix_matches_all_names() {
        assert!(adv("01", None, 0, true).name_matches(""));
        assert!(adv("01", Some("x"), 0, true).name_matches("  "));
    }

    #[test]
    fn test_select_strongest() {
        let candidates = vec![
            (1, adv("01", Some("PS02-LF"), -80, true)),
            (2, adv("02", Some("PS02-LF"), -35, true)),
            (3, Advertisement {
                rssi: None,
                ..adv("03", Some("PS02-LF"), 0, true)
            }),
        ];
        assert_eq!(select_candidate(candidates, None).unwrap().0, 2);
    }

    #[test]
    fn test_select_preferred() {
        let candidates = vec![
            (1, adv("DA:F8:B0:CB:68:1C", Some("PS02-LF"), -80, true)),
            (2, adv("02", Some("PS02-LF"), -35, true)),
        ];
        let (dev, _) = select_candidate(candidates.clone(), Some("da:f8:b0:cb:68:1c")).unwrap();
        assert_eq!(dev, 1);

        assert!(matches!(
            select_candidate(candidates, Some("FF:FF")),
            Err(DetectError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_select_none() {
        assert!(matches!(
            select_candidate::<u8>(vec![], None),
            Err(DetectError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_list_devices() {
        let mut table = AdvertisementTable::new();
        table.insert((), adv("01", None, -90, false));
        table.insert((), adv("02", Some("PS02-LF-9"), -40, true));

        let list = list_devices(&table, "PS02-LF");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, "02");
        assert!(list[0].matches_prefix);
        assert_eq!(list[1].name, "Unknown");
        assert!(!list[1].matches_prefix);
    }

    #[tokio::test]
    async fn test_scan_stopped_after_failed_collection() {
        let stopped = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), _> = stop_after(
            async { Err(DetectError::NoAdapter) },
            async {
                stopped.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(DetectError::NoAdapter)));
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_collected_result() {
        let result = stop_after(async { Ok(3) }, async {
            Err(DetectError::DeviceNotFound("adapter gone".to_string()))
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }
}
