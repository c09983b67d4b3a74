//! Demo dataset for local runs.
//!
//! Orders are scattered around two delivery areas roughly 25 km apart:
//! - Da'an, Taipei (dense, short hops)
//! - Zhongli/Taoyuan (sparser)
//!
//! Every eighth order has no coordinate, so clustering reports it under
//! `needsGeocoding` until the geocoder resolves it.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Coordinate, Courier, OrderId};
use crate::error::StoreError;
use crate::store::{NewOrder, OrderStore};

/// Courier names using the phonetic alphabet.
const COURIER_NAMES: [&str; 6] = ["Alpha", "Bravo", "Charlie", "Delta", "Echo", "Foxtrot"];

/// First order id of the generated dataset.
pub const FIRST_ORDER_ID: OrderId = 1001;

struct Area {
    name: &'static str,
    center: Coordinate,
    /// Spread in degrees around the center.
    spread: f64,
    streets: &'static [&'static str],
}

const AREAS: [Area; 2] = [
    Area {
        name: "Da'an",
        center: Coordinate {
            lat: 25.0260,
            lng: 121.5430,
        },
        spread: 0.012,
        streets: &[
            "Sec. 4, Zhongxiao E. Rd.",
            "Sec. 3, Xinyi Rd.",
            "Sec. 1, Fuxing S. Rd.",
            "Sec. 2, Heping E. Rd.",
            "Sec. 1, Da'an Rd.",
            "Sec. 4, Ren'ai Rd.",
        ],
    },
    Area {
        name: "Zhongli",
        center: Coordinate {
            lat: 24.9930,
            lng: 121.3010,
        },
        spread: 0.02,
        streets: &[
            "Zhongzheng Rd.",
            "Yanping Rd.",
            "Minzu Rd.",
            "Zhongshan E. Rd.",
        ],
    },
];

/// Generates `count` orders alternating between the two areas.
///
/// # Examples
///
/// ```
/// use courier_dispatch::demo_data::generate_orders;
///
/// let orders = generate_orders(24, 7);
/// assert_eq!(orders.len(), 24);
/// assert_eq!(orders.iter().filter(|o| o.coordinate.is_none()).count(), 3);
/// assert_eq!(generate_orders(24, 7)[5].address, orders[5].address);
/// ```
pub fn generate_orders(count: usize, seed: u64) -> Vec<NewOrder> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|i| {
            let area = &AREAS[i % AREAS.len()];
            let street = area.streets[rng.gen_range(0..area.streets.len())];
            let number: u32 = rng.gen_range(1..=300);
            let lat = area.center.lat + rng.gen_range(-area.spread..=area.spread);
            let lng = area.center.lng + rng.gen_range(-area.spread..=area.spread);
            let total_cents = rng.gen_range(300..=4_500) * 10;

            NewOrder {
                id: FIRST_ORDER_ID + i as OrderId,
                address: format!("No. {}, {}, {}", number, street, area.name),
                coordinate: (i % 8 != 7).then_some(Coordinate::new(lat, lng)),
                total_cents,
            }
        })
        .collect()
}

/// Demo couriers, each parked in one of the areas.
///
/// ```
/// use courier_dispatch::demo_data::demo_couriers;
///
/// let couriers = demo_couriers();
/// assert_eq!(couriers.len(), 6);
/// assert!(couriers.iter().all(|c| c.location.is_some()));
/// ```
pub fn demo_couriers() -> Vec<Courier> {
    COURIER_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let area = &AREAS[i % AREAS.len()];
            Courier::new(i as i64 + 1, *name).with_location(area.center)
        })
        .collect()
}

/// Loads the demo orders and couriers into `store`. Returns the number of orders.
pub async fn seed_store(store: &dyn OrderStore, now: DateTime<Utc>) -> Result<usize, StoreError> {
    let orders = generate_orders(48, 42);
    let count = orders.len();
    for order in orders {
        store.insert_order(order, now).await?;
    }
    for courier in demo_couriers() {
        store.save_courier(&courier).await?;
    }
    tracing::info!(orders = count, backend = store.backend(), "Seeded demo data");
    Ok(count)
}
