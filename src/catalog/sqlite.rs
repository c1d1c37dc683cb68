use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use super::{confidence_percent, Catalog, DetectionEvent, StreamInfo, SubscribedObserver};

/// SQLite-backed catalog. One connection, serialised behind a mutex.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open catalog database {}", db_path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("catalog connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS classes (
              class_id INTEGER PRIMARY KEY AUTOINCREMENT,
              label TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS stream (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              address TEXT NOT NULL,
              name TEXT NOT NULL DEFAULT '',
              link TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS observer (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              email TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS subscription (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              observer_id INTEGER NOT NULL REFERENCES observer(id),
              stream_id INTEGER NOT NULL REFERENCES stream(id),
              alert INTEGER NOT NULL DEFAULT 1,
              alert_interval TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection_event (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              class INTEGER NOT NULL REFERENCES classes(class_id),
              count INTEGER NOT NULL,
              stream_address TEXT NOT NULL,
              created INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detection (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              confidence INTEGER NOT NULL,
              location_top INTEGER NOT NULL,
              location_left INTEGER NOT NULL,
              width INTEGER NOT NULL,
              height INTEGER NOT NULL,
              event INTEGER NOT NULL REFERENCES detection_event(id)
            );

            CREATE TABLE IF NOT EXISTS alert (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_event_id INTEGER NOT NULL REFERENCES detection_event(id),
              subscription_id INTEGER NOT NULL REFERENCES subscription(id),
              created INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alert_subscription ON alert(subscription_id, created);
            CREATE INDEX IF NOT EXISTS idx_stream_address ON stream(address);
            "#,
        )?;
        Ok(())
    }

    pub fn add_class(&self, label: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO classes(label) VALUES (?1)", params![label])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_stream(&self, address: &str, name: &str, link: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO stream(address, name, link) VALUES (?1, ?2, ?3)",
            params![address, name, link],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn add_observer(&self, email: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute("INSERT INTO observer(email) VALUES (?1)", params![email])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn subscribe(
        &self,
        observer_id: i64,
        stream_id: i64,
        alert_interval: &str,
        alert: bool,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO subscription(observer_id, stream_id, alert, alert_interval)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![observer_id, stream_id, alert, alert_interval],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn event_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM detection_event", [], |row| row.get(0))?)
    }

    pub fn detection_count(&self, event_id: i64) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM detection WHERE event = ?1",
            params![event_id],
            |row| row.get(0),
        )?)
    }

    pub fn alert_count(&self, subscription_id: i64) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM alert WHERE subscription_id = ?1",
            params![subscription_id],
            |row| row.get(0),
        )?)
    }
}

impl Catalog for SqliteCatalog {
    fn class_id_for(&self, label: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT class_id FROM classes WHERE label = ?1",
                params![label],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("look up class {}", label))?;
        Ok(id)
    }

    fn persist_event(&self, event: &DetectionEvent) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO detection_event(class, count, stream_address, created)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                event.class_id,
                event.count() as i64,
                event.stream_address,
                event.captured_at
            ],
        )
        .context("insert detection event")?;
        let event_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO detection(confidence, location_top, location_left, width, height, event)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for obj in &event.objects {
                stmt.execute(params![
                    confidence_percent(obj.confidence),
                    obj.bbox.top,
                    obj.bbox.left,
                    obj.bbox.width,
                    obj.bbox.height,
                    event_id
                ])
                .context("insert detection")?;
            }
        }

        tx.commit()?;
        Ok(event_id)
    }

    fn subscribed_observers(&self, stream_address: &str) -> Result<Vec<SubscribedObserver>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT observer.email, subscription.id, subscription.alert_interval
            FROM subscription
            JOIN observer ON observer.id = subscription.observer_id
            JOIN stream ON stream.id = subscription.stream_id
            WHERE stream.address = ?1 AND subscription.alert = 1
            ORDER BY subscription.id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![stream_address], |row| {
            Ok(SubscribedObserver {
                email: row.get(0)?,
                subscription_id: row.get(1)?,
                alert_interval: row.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn last_alert_time(&self, subscription_id: i64) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let last = conn.query_row(
            "SELECT MAX(created) FROM alert WHERE subscription_id = ?1",
            params![subscription_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(last)
    }

    fn record_alert(&self, subscription_id: i64, event_id: i64, at: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO alert(detection_event_id, subscription_id, created)
            VALUES (?1, ?2, ?3)
            "#,
            params![event_id, subscription_id, at],
        )
        .context("record alert")?;
        Ok(())
    }

    fn configured_stream_addresses(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT address FROM stream ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let address = row?;
            if !address.is_empty() {
                out.push(address);
            }
        }
        Ok(out)
    }

    fn stream_info(&self, stream_address: &str) -> Result<Option<StreamInfo>> {
        let conn = self.lock()?;
        let info = conn
            .query_row(
                "SELECT name, link FROM stream WHERE address = ?1 ORDER BY id ASC LIMIT 1",
                params![stream_address],
                |row| {
                    Ok(StreamInfo {
                        name: row.get(0)?,
                        link: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }
}
