//! Property tests for BLE advertisement dedup and candidate selection

use proptest::prelude::*;
use ps_detect::{select_candidate, Advertisement, AdvertisementTable};
use uuid::Uuid;

const UART: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

fn address(n: usize) -> String {
    format!("aa:bb:cc:dd:ee:{:02x}", n)
}

fn report(slot: u8, services: bool, named: bool, manufacturer: bool) -> Advertisement {
    Advertisement {
        address: address(slot as usize),
        local_name: named.then(|| "PS02-LF-01".to_string()),
        rssi: Some(-50),
        services: if services { vec![UART] } else { Vec::new() },
        has_manufacturer_data: manufacturer,
    }
}

proptest! {
    #[test]
    fn strongest_signal_selected(rssis in prop::collection::vec(prop::option::of(-100i16..0), 1..20)) {
        let candidates: Vec<(usize, Advertisement)> = rssis
            .iter()
            .enumerate()
            .map(|(i, &rssi)| (i, Advertisement { address: address(i).to_uppercase(), rssi, ..Default::default() }))
            .collect();

        let (chosen, adv) = select_candidate(candidates, None).unwrap();
        let best = rssis.iter().map(|r| r.unwrap_or(i16::MIN)).max().unwrap();
        prop_assert_eq!(adv.rssi.unwrap_or(i16::MIN), best);
        // Among equally strong candidates the last one wins
        let last_best = rssis.iter().rposition(|r| r.unwrap_or(i16::MIN) == best).unwrap();
        prop_assert_eq!(chosen, last_best);
    }

    #[test]
    fn preferred_address_matches_any_case(count in 1usize..10, pick in any::<prop::sample::Index>()) {
        let candidates: Vec<(usize, Advertisement)> = (0..count)
            .map(|i| (i, Advertisement { address: address(i).to_uppercase(), rssi: Some(-90 + i as i16), ..Default::default() }))
            .collect();
        let wanted = pick.index(count);

        let (chosen, _) = select_candidate(candidates, Some(&address(wanted))).unwrap();
        prop_assert_eq!(chosen, wanted);
    }

    #[test]
    fn dedup_keeps_most_informative(
        reports in prop::collection::vec((0u8..4, any::<bool>(), any::<bool>(), any::<bool>()), 1..40)
    ) {
        let mut table = AdvertisementTable::new();
        for (i, &(slot, services, named, manufacturer)) in reports.iter().enumerate() {
            table.insert(i, report(slot, services, named, manufacturer));
        }

        for slot in 0..4u8 {
            let scores: Vec<(usize, u32)> = reports
                .iter()
                .enumerate()
                .filter(|(_, r)| r.0 == slot)
                .map(|(i, &(s, services, named, manufacturer))| (i, report(s, services, named, manufacturer).info_score()))
                .collect();
            let kept = table.get(&address(slot as usize).to_uppercase());
            let Some(best) = scores.iter().map(|&(_, score)| score).max() else {
                prop_assert!(kept.is_none());
                continue;
            };
            let expected = scores.iter().rev().find(|&&(_, score)| score == best).unwrap().0;
            let (device, adv) = kept.unwrap();
            prop_assert_eq!(*device, expected);
            prop_assert_eq!(adv.info_score(), best);
        }
    }
}
