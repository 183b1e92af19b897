use axum::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::{info, instrument};

use crate::domain::{PriceChange, PriceReading, StoredPrice};

#[derive(Debug, Error)]
pub(crate) enum PriceRepositoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// The reads and writes the change gate needs, scoped to one unit of work.
#[async_trait]
pub(crate) trait PriceLedger: Send {
    async fn ensure_region(
        &mut self,
        region_id: i32,
        region_name: Option<&str>,
    ) -> Result<(), PriceRepositoryError>;

    async fn latest_price(
        &mut self,
        region_id: i32,
    ) -> Result<Option<Decimal>, PriceRepositoryError>;

    async fn append_price(
        &mut self,
        region_id: i32,
        timestamp: DateTime<Utc>,
        price: Decimal,
    ) -> Result<(), PriceRepositoryError>;
}

/// Stamp every reading with `timestamp` and append it only when its price
/// differs from the latest one stored for the region.
pub(crate) async fn record_changed_prices<L: PriceLedger + ?Sized>(
    ledger: &mut L,
    readings: &[PriceReading],
    timestamp: DateTime<Utc>,
) -> Result<Vec<PriceChange>, PriceRepositoryError> {
    let mut changes = Vec::with_capacity(readings.len());

    for reading in readings.iter().map(|reading| reading.stamped(timestamp)) {
        ledger
            .ensure_region(reading.region_id, reading.region_name.as_deref())
            .await?;

        let previous = ledger.latest_price(reading.region_id).await?;
        let changed = previous != Some(reading.price);

        if changed {
            ledger
                .append_price(reading.region_id, reading.timestamp, reading.price)
                .await?;
            info!(
                "Value for region {} changed to {} {}",
                reading.region_id, reading.price, reading.unit
            );
        } else {
            info!(
                "Value for region {} stayed identical at {} {}",
                reading.region_id, reading.price, reading.unit
            );
        }

        changes.push(PriceChange {
            region_id: reading.region_id,
            price: reading.price,
            changed,
        });
    }

    Ok(changes)
}

#[async_trait]
pub(crate) trait PriceRepository: Send + Sync {
    async fn persist_changed_prices(
        &self,
        readings: &[PriceReading],
    ) -> Result<Vec<PriceChange>, PriceRepositoryError>;

    /// Rows of `region` stored at or after `since`, newest first.
    async fn fetch_prices_of_region_since(
        &self,
        region_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredPrice>, PriceRepositoryError>;
}

#[derive(Clone, Debug)]
pub(crate) struct PostgresPriceRepository {
    db: PgPool,
}

impl PostgresPriceRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PriceRepository for PostgresPriceRepository {
    #[instrument(skip_all, fields(readings = readings.len()))]
    async fn persist_changed_prices(
        &self,
        readings: &[PriceReading],
    ) -> Result<Vec<PriceChange>, PriceRepositoryError> {
        let mut ledger = PostgresLedger {
            tx: self.db.begin().await?,
        };

        let changes = record_changed_prices(&mut ledger, readings, Utc::now()).await?;

        ledger.tx.commit().await?;

        info!(
            "Persisted {} of {} prices",
            changes.iter().filter(|change| change.changed).count(),
            changes.len()
        );

        Ok(changes)
    }

    #[instrument(skip(self))]
    async fn fetch_prices_of_region_since(
        &self,
        region_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredPrice>, PriceRepositoryError> {
        let rows = sqlx::query_as::<_, StoredPrice>(
            r#"
            select id, region, timestamp, price
            from price
            where region = $1 and timestamp >= $2
            order by timestamp desc, id desc
            "#,
        )
        .bind(region_id)
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }
}

/// Runs the change gate inside a single transaction; dropping it without
/// committing rolls every insert back.
struct PostgresLedger {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl PriceLedger for PostgresLedger {
    async fn ensure_region(
        &mut self,
        region_id: i32,
        region_name: Option<&str>,
    ) -> Result<(), PriceRepositoryError> {
        sqlx::query(
            "insert into region (id, region_name) values ($1, $2) on conflict (id) do nothing",
        )
        .bind(region_id)
        .bind(region_name)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn latest_price(
        &mut self,
        region_id: i32,
    ) -> Result<Option<Decimal>, PriceRepositoryError> {
        let price = sqlx::query_scalar::<_, Decimal>(
            "select price from price where region = $1 order by timestamp desc, id desc limit 1",
        )
        .bind(region_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(price)
    }

    async fn append_price(
        &mut self,
        region_id: i32,
        timestamp: DateTime<Utc>,
        price: Decimal,
    ) -> Result<(), PriceRepositoryError> {
        sqlx::query("insert into price (region, timestamp, price) values ($1, $2, $3)")
            .bind(region_id)
            .bind(timestamp)
            .bind(price)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    use super::memory::MemoryLedger;
    use super::*;

    fn reading(region_id: i32, price: Decimal) -> PriceReading {
        PriceReading {
            region_id,
            region_name: Some(format!("NO{}", region_id)),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap(),
            price,
            unit: "øre/kWh".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_first_reading_of_a_region_is_inserted() {
        let mut ledger = MemoryLedger::default();

        let changes = record_changed_prices(&mut ledger, &[reading(1, dec!(45.12))], now())
            .await
            .unwrap();

        assert_eq!(ledger.rows.len(), 1);
        assert_eq!(ledger.rows[0].region, 1);
        assert_eq!(ledger.rows[0].price, dec!(45.12));
        assert_eq!(ledger.rows[0].timestamp, now());
        assert!(changes[0].changed);
        assert_eq!(ledger.regions.get(&1), Some(&Some("NO1".to_string())));
    }

    #[tokio::test]
    async fn test_identical_price_is_skipped() {
        let mut ledger = MemoryLedger::default();
        record_changed_prices(&mut ledger, &[reading(1, dec!(45.12))], now())
            .await
            .unwrap();

        let later = now() + Duration::hours(1);
        let changes = record_changed_prices(&mut ledger, &[reading(1, dec!(45.120))], later)
            .await
            .unwrap();

        assert_eq!(ledger.rows.len(), 1);
        assert!(!changes[0].changed);
    }

    #[tokio::test]
    async fn test_changed_price_is_appended_with_new_timestamp() {
        let mut ledger = MemoryLedger::default();
        record_changed_prices(&mut ledger, &[reading(1, dec!(45.12))], now())
            .await
            .unwrap();

        let later = now() + Duration::hours(1);
        let changes = record_changed_prices(&mut ledger, &[reading(1, dec!(47))], later)
            .await
            .unwrap();

        assert_eq!(ledger.rows.len(), 2);
        assert_eq!(ledger.rows[1].price, dec!(47));
        assert_eq!(ledger.rows[1].timestamp, later);
        assert!(changes[0].changed);
    }

    #[tokio::test]
    async fn test_only_latest_row_is_compared() {
        let mut ledger = MemoryLedger::default();
        for (hour, price) in [(0, dec!(1)), (1, dec!(2))] {
            record_changed_prices(&mut ledger, &[reading(1, price)], now() + Duration::hours(hour))
                .await
                .unwrap();
        }

        record_changed_prices(&mut ledger, &[reading(1, dec!(1))], now() + Duration::hours(2))
            .await
            .unwrap();

        let prices: Vec<Decimal> = ledger.rows.iter().map(|row| row.price).collect();
        assert_eq!(prices, vec![dec!(1), dec!(2), dec!(1)]);
    }

    #[tokio::test]
    async fn test_regions_are_gated_independently_with_one_timestamp() {
        let mut ledger = MemoryLedger::default();
        record_changed_prices(&mut ledger, &[reading(1, dec!(10)), reading(2, dec!(20))], now())
            .await
            .unwrap();

        let later = now() + Duration::hours(1);
        let changes = record_changed_prices(
            &mut ledger,
            &[reading(1, dec!(10)), reading(2, dec!(21)), reading(3, dec!(30))],
            later,
        )
        .await
        .unwrap();

        let changed: Vec<(i32, bool)> = changes.iter().map(|c| (c.region_id, c.changed)).collect();
        assert_eq!(changed, vec![(1, false), (2, true), (3, true)]);
        assert_eq!(ledger.rows.len(), 4);
        assert!(ledger.rows[2..].iter().all(|row| row.timestamp == later));
    }

    #[tokio::test]
    async fn test_duplicate_region_within_one_batch_is_gated() {
        let mut ledger = MemoryLedger::default();

        record_changed_prices(&mut ledger, &[reading(4, dec!(3)), reading(4, dec!(3))], now())
            .await
            .unwrap();

        assert_eq!(ledger.rows.len(), 1);
    }

    struct FailingLedger;

    #[async_trait]
    impl PriceLedger for FailingLedger {
        async fn ensure_region(
            &mut self,
            _: i32,
            _: Option<&str>,
        ) -> Result<(), PriceRepositoryError> {
            Ok(())
        }

        async fn latest_price(
            &mut self,
            _: i32,
        ) -> Result<Option<Decimal>, PriceRepositoryError> {
            Err(PriceRepositoryError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn append_price(
            &mut self,
            _: i32,
            _: DateTime<Utc>,
            _: Decimal,
        ) -> Result<(), PriceRepositoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_errors_propagate() {
        let result = record_changed_prices(&mut FailingLedger, &[reading(1, dec!(1))], now()).await;

        assert!(matches!(
            result,
            Err(PriceRepositoryError::Database(sqlx::Error::PoolTimedOut))
        ));
    }
}
