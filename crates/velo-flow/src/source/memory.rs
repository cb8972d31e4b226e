//! In-memory sources serving fixed records per partition.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream;
use velo_core::PartitionKey;

use super::{Availability, RecordSource, RecordStream};
use crate::error::{Error, Result};
use crate::record::{TripRecord, WeatherObservation};

/// Fixed records keyed by partition. Partitions without records are not ready.
#[derive(Debug)]
pub struct StaticSource<T> {
    name: String,
    partitions: RwLock<HashMap<PartitionKey, Arc<Vec<T>>>>,
}

/// In-memory trip source.
pub type StaticTripSource = StaticSource<TripRecord>;

/// In-memory weather source.
pub type StaticWeatherSource = StaticSource<WeatherObservation>;

impl<T> StaticSource<T> {
    /// Creates an empty source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Publishes `records` for `partition`, replacing earlier records.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn publish(&self, partition: PartitionKey, records: Vec<T>) -> Result<()> {
        self.partitions
            .write()
            .map_err(|_| Error::source_error(self.name.clone(), "source lock poisoned"))?
            .insert(partition, Arc::new(records));
        Ok(())
    }

    /// Builder-style [`StaticSource::publish`].
    #[must_use]
    pub fn with_partition(self, partition: PartitionKey, records: Vec<T>) -> Self {
        if let Ok(mut partitions) = self.partitions.write() {
            partitions.insert(partition, Arc::new(records));
        }
        self
    }

    fn records(&self, partition: PartitionKey) -> Result<Option<Arc<Vec<T>>>> {
        Ok(self
            .partitions
            .read()
            .map_err(|_| Error::source_error(self.name.clone(), "source lock poisoned"))?
            .get(&partition)
            .cloned())
    }
}

#[async_trait]
impl<T> RecordSource<T> for StaticSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability> {
        Ok(match self.records(partition)? {
            Some(_) => Availability::Ready,
            None => Availability::NotReady {
                reason: format!("{} has no data for {partition}", self.name),
            },
        })
    }

    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<T>> {
        let Some(records) = self.records(partition)? else {
            return Err(Error::SourceUnavailable {
                source_name: self.name.clone(),
                reason: format!("{} has no data for {partition}", self.name),
            });
        };
        let len = records.len();
        Ok(Box::pin(stream::iter(
            (0..len).filter_map(move |i| records.get(i).cloned().map(Ok)),
        )))
    }
}
