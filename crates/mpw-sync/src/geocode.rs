//! Location enrichment. Geocoding runs after sync and never blocks
//! correctness; a failed or missing lookup just leaves coordinates empty.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use mpw_core::CaseRecord;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolves a place to (latitude, longitude). Ok(None) means the
    /// provider does not know the place; that is not an error.
    async fn geocode(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> anyhow::Result<Option<(f64, f64)>>;
}

/// Offline stand-in used until a real provider is wired up.
#[derive(Debug, Default)]
pub struct NullGeocoder;

#[async_trait]
impl Geocoder for NullGeocoder {
    async fn geocode(
        &self,
        _city: &str,
        _state: &str,
        _country: &str,
    ) -> anyhow::Result<Option<(f64, f64)>> {
        Ok(None)
    }
}

fn cache_key(city: &str, state: &str, country: &str) -> String {
    format!(
        "{}|{}|{}",
        city.trim().to_lowercase(),
        state.trim().to_lowercase(),
        country.trim().to_lowercase()
    )
}

/// Memoizing wrapper. Negative answers are cached too, so an unknown place
/// costs one provider call per process, not one per record.
pub struct CachingGeocoder<G> {
    inner: G,
    cache: RwLock<HashMap<String, Option<(f64, f64)>>>,
}

impl<G: Geocoder> CachingGeocoder<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<G: Geocoder> Geocoder for CachingGeocoder<G> {
    async fn geocode(
        &self,
        city: &str,
        state: &str,
        country: &str,
    ) -> anyhow::Result<Option<(f64, f64)>> {
        let key = cache_key(city, state, country);
        if let Some(hit) = self.cache.read().await.get(&key) {
            return Ok(*hit);
        }
        let resolved = self.inner.geocode(city, state, country).await?;
        self.cache.write().await.insert(key, resolved);
        Ok(resolved)
    }
}

/// Fills in coordinates for records that carry a city and state but no
/// position. Lookup failures are logged per record and skipped.
pub async fn enrich_coordinates(geocoder: &dyn Geocoder, records: &mut [CaseRecord]) {
    for record in records {
        if record.latitude.is_some() || record.longitude.is_some() {
            continue;
        }
        let (Some(city), Some(state)) = (record.city.as_deref(), record.state.as_deref()) else {
            continue;
        };
        match geocoder.geocode(city, state, "US").await {
            Ok(Some((lat, lon))) => {
                record.latitude = Some(lat);
                record.longitude = Some(lon);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(case_number = %record.case_number, error = %err, "geocoding failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TableGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for TableGeocoder {
        async fn geocode(
            &self,
            city: &str,
            _state: &str,
            _country: &str,
        ) -> anyhow::Result<Option<(f64, f64)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match city.to_lowercase().as_str() {
                "tucson" => Some((32.22, -110.97)),
                _ => None,
            })
        }
    }

    #[tokio::test]
    async fn cache_answers_repeat_lookups_without_provider_calls() {
        let geocoder = CachingGeocoder::new(TableGeocoder {
            calls: AtomicUsize::new(0),
        });
        assert_eq!(
            geocoder.geocode("Tucson", "AZ", "US").await.unwrap(),
            Some((32.22, -110.97))
        );
        // Key normalization folds case and whitespace.
        assert_eq!(
            geocoder.geocode(" TUCSON ", "az", "us").await.unwrap(),
            Some((32.22, -110.97))
        );
        assert_eq!(geocoder.inner.calls.load(Ordering::SeqCst), 1);

        // Misses are cached too.
        assert_eq!(geocoder.geocode("Nowhere", "ZZ", "US").await.unwrap(), None);
        assert_eq!(geocoder.geocode("Nowhere", "ZZ", "US").await.unwrap(), None);
        assert_eq!(geocoder.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enrichment_only_touches_records_missing_coordinates() {
        let geocoder = CachingGeocoder::new(TableGeocoder {
            calls: AtomicUsize::new(0),
        });
        let mut records = vec![
            CaseRecord {
                case_number: "MP-1".into(),
                source_id: "namus".into(),
                city: Some("Tucson".into()),
                state: Some("AZ".into()),
                ..Default::default()
            },
            CaseRecord {
                case_number: "MP-2".into(),
                source_id: "namus".into(),
                city: Some("Tucson".into()),
                state: Some("AZ".into()),
                latitude: Some(1.0),
                longitude: Some(2.0),
                ..Default::default()
            },
            CaseRecord {
                case_number: "MP-3".into(),
                source_id: "namus".into(),
                ..Default::default()
            },
        ];
        enrich_coordinates(&geocoder, &mut records).await;
        assert_eq!(records[0].latitude, Some(32.22));
        assert_eq!(records[1].latitude, Some(1.0));
        assert_eq!(records[2].latitude, None);
    }
}
