//! Watering statistics, derived from current plant state on every call.

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::model::{Plant, UserId};
use crate::store::{list_entities, EntityStore, Query};
use crate::time::whole_days_between;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_plants: u32,
    pub needs_water: u32,
    pub healthy: u32,
}

/// A plant needs water when it was never watered or when at least its
/// watering interval (in whole days) has passed.
pub fn needs_watering(plant: &Plant, now: i64) -> bool {
    match plant.last_watered {
        None => true,
        Some(at) => whole_days_between(at, now) >= i64::from(plant.watering_interval_days()),
    }
}

pub fn compute_statistics<'a, I>(plants: I, now: i64) -> Statistics
where
    I: IntoIterator<Item = &'a Plant>,
{
    let mut stats = Statistics::default();
    for plant in plants {
        stats.total_plants += 1;
        if needs_watering(plant, now) {
            stats.needs_water += 1;
        }
    }
    stats.healthy = stats.total_plants - stats.needs_water;
    stats
}

/// Statistics over the user's active plants in `store`.
pub async fn get_statistics(
    store: &dyn EntityStore,
    user: &UserId,
    now: i64,
) -> SyncResult<Statistics> {
    let records = list_entities::<Plant>(store, &Query::owned_by(user.as_str())).await?;
    let active = records
        .iter()
        .map(|record| &record.body)
        .filter(|plant| plant.active);
    Ok(compute_statistics(active, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MS_PER_DAY;

    const NOW: i64 = 1_760_000_000_000;

    fn plant(last_watered_days_ago: Option<i64>, frequency: Option<u32>) -> Plant {
        let mut plant = Plant::new(&UserId::new("u1"), "Fern");
        plant.last_watered = last_watered_days_ago.map(|days| NOW - days * MS_PER_DAY);
        plant.watering_frequency_days = frequency;
        plant
    }

    #[test]
    fn overdue_and_fresh_examples() {
        assert!(needs_watering(&plant(Some(10), Some(7)), NOW));
        assert!(!needs_watering(&plant(Some(3), Some(7)), NOW));
    }

    #[test]
    fn boundary_day_counts_as_due() {
        assert!(needs_watering(&plant(Some(7), Some(7)), NOW));
        let almost = Plant {
            last_watered: Some(NOW - 7 * MS_PER_DAY + 1),
            ..plant(None, Some(7))
        };
        assert!(!needs_watering(&almost, NOW));
    }

    #[test]
    fn missing_frequency_uses_default() {
        assert!(needs_watering(&plant(Some(8), None), NOW));
        assert!(!needs_watering(&plant(Some(6), None), NOW));
    }

    #[test]
    fn five_plants_two_overdue() {
        let plants = vec![
            plant(Some(10), Some(7)),
            plant(None, Some(30)),
            plant(Some(1), Some(7)),
            plant(Some(2), Some(3)),
            plant(Some(0), Some(1)),
        ];
        let stats = compute_statistics(&plants, NOW);
        assert_eq!(
            stats,
            Statistics {
                total_plants: 5,
                needs_water: 2,
                healthy: 3
            }
        );
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(Statistics {
            total_plants: 1,
            needs_water: 1,
            healthy: 0,
        })
        .expect("serialize");
        assert_eq!(json["totalPlants"], 1);
        assert_eq!(json["needsWater"], 1);
    }
}
