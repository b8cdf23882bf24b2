//! Connection registry
//!
//! Authoritative record of endpoints, their addresses, liveness status and
//! installation keys. Every call is a round trip to the shared state DB;
//! nothing is cached in process, so each reader sees the latest committed
//! write from either the prober or the registration path.
//!
//! Tables:
//! - endpoints: one row per remote machine
//! - installation_keys: single-use registration credentials

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;
use vncdesk_common::{
    now_epoch_secs, Database, Endpoint, EndpointStatus, Error, InstallationKey,
    MachineRegistration, NewEndpoint, Result,
};

const ENDPOINT_COLUMNS: &str = "id, name, address, location, country, city, status, last_seen, \
     installation_key, created_at, port, secret";

/// Registry over the shared state DB
#[derive(Clone)]
pub struct ConnectionRegistry {
    db: Database,
}

/// Endpoint counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
    pub installing: u64,
    pub error: u64,
}

fn parse_status(idx: usize, raw: String) -> rusqlite::Result<EndpointStatus> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Endpoint> {
    Ok(Endpoint {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        location: row.get(3)?,
        country: row.get(4)?,
        city: row.get(5)?,
        status: parse_status(6, row.get(6)?)?,
        last_seen: row.get(7)?,
        installation_key: row.get(8)?,
        created_at: row.get(9)?,
        port: row.get(10)?,
        secret: row.get(11)?,
    })
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<InstallationKey> {
    Ok(InstallationKey {
        id: row.get(0)?,
        key: row.get(1)?,
        machine_name: row.get(2)?,
        created_at: row.get(3)?,
        used: row.get(4)?,
        used_at: row.get(5)?,
        endpoint_id: row.get(6)?,
    })
}

impl ConnectionRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Run registry calls on the blocking pool so a slow or contended
    /// store never holds up the reactor.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ConnectionRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    // ========================================================================
    // Endpoint operations
    // ========================================================================

    /// Create a pending endpoint together with its installation key.
    pub fn create(
        &self,
        req: NewEndpoint,
        installation_key: &str,
        port: u16,
        secret: &str,
    ) -> Result<Endpoint> {
        let now = now_epoch_secs();
        let endpoint = Endpoint {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            address: None,
            location: req.location,
            country: req.country,
            city: req.city,
            status: EndpointStatus::Inactive,
            last_seen: None,
            installation_key: installation_key.to_string(),
            created_at: now,
            port,
            secret: secret.to_string(),
        };

        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO endpoints ({}) VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?10)",
                ENDPOINT_COLUMNS
            ),
            params![
                endpoint.id,
                endpoint.name,
                endpoint.location,
                endpoint.country,
                endpoint.city,
                endpoint.status.as_str(),
                endpoint.installation_key,
                endpoint.created_at,
                endpoint.port,
                endpoint.secret,
            ],
        )?;
        tx.execute(
            "INSERT INTO installation_keys (id, key, machine_name, created_at, used, used_at, endpoint_id)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
            params![
                Uuid::new_v4().to_string(),
                installation_key,
                endpoint.name,
                now,
                endpoint.id,
            ],
        )?;
        tx.commit()?;

        info!("Created endpoint {} ({})", endpoint.id, endpoint.name);
        Ok(endpoint)
    }

    /// Look up an endpoint by id
    pub fn lookup(&self, id: &str) -> Result<Endpoint> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM endpoints WHERE id = ?1", ENDPOINT_COLUMNS),
            params![id],
            endpoint_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("endpoint", id))
    }

    pub fn list(&self) -> Result<Vec<Endpoint>> {
        self.query_endpoints(&format!(
            "SELECT {} FROM endpoints ORDER BY created_at, rowid",
            ENDPOINT_COLUMNS
        ))
    }

    /// Endpoints that have completed registration and can be probed
    pub fn list_with_address(&self) -> Result<Vec<Endpoint>> {
        self.query_endpoints(&format!(
            "SELECT {} FROM endpoints
             WHERE address IS NOT NULL AND TRIM(address) != ''
             ORDER BY created_at, rowid",
            ENDPOINT_COLUMNS
        ))
    }

    fn query_endpoints(&self, sql: &str) -> Result<Vec<Endpoint>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], endpoint_from_row)?;
        let mut endpoints = Vec::new();
        for row in rows {
            endpoints.push(row?);
        }
        Ok(endpoints)
    }

    /// Overwrite status and last-seen. Last writer wins.
    pub fn set_status(&self, id: &str, status: EndpointStatus, last_seen: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute(
            "UPDATE endpoints SET status = ?1, last_seen = ?2 WHERE id = ?3",
            params![status.as_str(), last_seen, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("endpoint", id));
        }
        debug!("Endpoint {} status -> {}", id, status);
        Ok(())
    }

    pub fn set_address(&self, id: &str, address: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let rows = conn.execute(
            "UPDATE endpoints SET address = ?1 WHERE id = ?2",
            params![address, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("endpoint", id));
        }
        Ok(())
    }

    /// Delete an endpoint and every installation key bound to it
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        let rows = tx.execute("DELETE FROM endpoints WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::not_found("endpoint", id));
        }
        tx.execute(
            "DELETE FROM installation_keys WHERE endpoint_id = ?1",
            params![id],
        )?;
        tx.commit()?;
        info!("Deleted endpoint {}", id);
        Ok(())
    }

    pub fn count_by_status(&self) -> Result<StatusCounts> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM endpoints GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((parse_status(0, row.get(0)?)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as u64;
            counts.total += n;
            match status {
                EndpointStatus::Active => counts.active = n,
                EndpointStatus::Inactive => counts.inactive = n,
                EndpointStatus::Installing => counts.installing = n,
                EndpointStatus::Error => counts.error = n,
            }
        }
        Ok(counts)
    }

    // ========================================================================
    // Installation keys
    // ========================================================================

    pub fn lookup_key(&self, key: &str) -> Result<InstallationKey> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, key, machine_name, created_at, used, used_at, endpoint_id
             FROM installation_keys WHERE key = ?1",
            params![key],
            key_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("installation key", key))
    }

    /// Consume an installation key and bind the caller's address to its endpoint.
    ///
    /// The key is claimed with a conditional update inside the same
    /// transaction that writes the address, so at most one call can succeed
    /// per key and a losing call leaves the endpoint untouched.
    pub fn register_machine(&self, reg: &MachineRegistration) -> Result<Endpoint> {
        let key = reg.installation_key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("Installation key required".to_string()));
        }

        let address = reg
            .ip_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty());
        let status = reg.status.unwrap_or(EndpointStatus::Active);
        if status == EndpointStatus::Active && address.is_none() {
            return Err(Error::InvalidInput(
                "ip_address required to register an active machine".to_string(),
            ));
        }

        let now = now_epoch_secs();
        let endpoint_id = {
            let conn = self.db.connection();
            let mut conn = conn.lock();
            let tx = conn.transaction()?;

            let (used, endpoint_id): (bool, Option<String>) = tx
                .query_row(
                    "SELECT used, endpoint_id FROM installation_keys WHERE key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| Error::not_found("installation key", key))?;

            if used {
                return Err(Error::KeyAlreadyUsed);
            }
            let endpoint_id = endpoint_id.ok_or_else(|| {
                Error::invalid_state("installation key", key, "not bound to an endpoint")
            })?;

            let claimed = tx.execute(
                "UPDATE installation_keys SET used = 1, used_at = ?1 WHERE key = ?2 AND used = 0",
                params![now, key],
            )?;
            if claimed == 0 {
                return Err(Error::KeyAlreadyUsed);
            }

            let updated = tx.execute(
                "UPDATE endpoints SET address = ?1, status = ?2, last_seen = ?3 WHERE id = ?4",
                params![address, status.as_str(), now, endpoint_id],
            )?;
            if updated == 0 {
                return Err(Error::not_found("endpoint", endpoint_id));
            }

            tx.commit()?;
            endpoint_id
        };

        info!(
            "Machine {} registered for endpoint {} at {}",
            reg.machine_name.as_deref().unwrap_or("<unnamed>"),
            endpoint_id,
            address.unwrap_or("-")
        );
        self.lookup(&endpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Database::open_memory().unwrap())
    }

    fn new_endpoint(name: &str) -> NewEndpoint {
        NewEndpoint {
            name: name.to_string(),
            location: "Lab 3".to_string(),
            country: "Russia".to_string(),
            city: "Moscow".to_string(),
        }
    }

    fn registration(key: &str, ip: &str) -> MachineRegistration {
        MachineRegistration {
            installation_key: key.to_string(),
            machine_name: Some("LAB-PC-01".to_string()),
            ip_address: Some(ip.to_string()),
            status: None,
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let reg = test_registry();
        let ep = reg.create(new_endpoint("lab-01"), "k1", 5900, "pw").unwrap();
        assert_eq!(ep.status, EndpointStatus::Inactive);
        assert!(ep.address.is_none());

        let fetched = reg.lookup(&ep.id).unwrap();
        assert_eq!(fetched, ep);

        let key = reg.lookup_key("k1").unwrap();
        assert!(!key.used);
        assert_eq!(key.endpoint_id.as_deref(), Some(ep.id.as_str()));
        assert_eq!(key.machine_name, "lab-01");
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        let reg = test_registry();
        assert!(matches!(reg.lookup("nope"), Err(Error::NotFound { .. })));
        assert!(matches!(
            reg.set_status("nope", EndpointStatus::Active, 0),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_with_address_filters_unregistered() {
        let reg = test_registry();
        let a = reg.create(new_endpoint("a"), "ka", 5900, "pw").unwrap();
        reg.create(new_endpoint("b"), "kb", 5900, "pw").unwrap();
        let c = reg.create(new_endpoint("c"), "kc", 5900, "pw").unwrap();
        reg.set_address(&a.id, "10.0.0.1").unwrap();
        reg.set_address(&c.id, "").unwrap();

        let listed = reg.list_with_address().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(reg.list().unwrap().len(), 3);
    }

    #[test]
    fn test_register_machine_consumes_key_once() {
        let reg = test_registry();
        let ep = reg.create(new_endpoint("lab-01"), "k1", 5900, "pw").unwrap();

        let registered = reg.register_machine(&registration("k1", "10.1.2.3")).unwrap();
        assert_eq!(registered.id, ep.id);
        assert_eq!(registered.address.as_deref(), Some("10.1.2.3"));
        assert_eq!(registered.status, EndpointStatus::Active);
        assert!(registered.last_seen.is_some());

        let key = reg.lookup_key("k1").unwrap();
        assert!(key.used);
        assert!(key.used_at.is_some());

        let second = reg.register_machine(&registration("k1", "10.9.9.9"));
        assert!(matches!(second, Err(Error::KeyAlreadyUsed)));
        assert_eq!(
            reg.lookup(&ep.id).unwrap().address.as_deref(),
            Some("10.1.2.3")
        );
    }

    #[test]
    fn test_register_machine_rejects_bad_input() {
        let reg = test_registry();
        reg.create(new_endpoint("lab-01"), "k1", 5900, "pw").unwrap();

        assert!(matches!(
            reg.register_machine(&registration("", "10.0.0.1")),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            reg.register_machine(&registration("missing", "10.0.0.1")),
            Err(Error::NotFound { .. })
        ));

        let mut no_ip = registration("k1", "");
        assert!(matches!(
            reg.register_machine(&no_ip),
            Err(Error::InvalidInput(_))
        ));
        // Failed validation leaves the key claimable
        assert!(!reg.lookup_key("k1").unwrap().used);

        no_ip.status = Some(EndpointStatus::Installing);
        let ep = reg.register_machine(&no_ip).unwrap();
        assert_eq!(ep.status, EndpointStatus::Installing);
        assert!(ep.address.is_none());
    }

    #[test]
    fn test_delete_removes_keys() {
        let reg = test_registry();
        let ep = reg.create(new_endpoint("lab-01"), "k1", 5900, "pw").unwrap();
        reg.delete(&ep.id).unwrap();
        assert!(matches!(reg.lookup(&ep.id), Err(Error::NotFound { .. })));
        assert!(matches!(reg.lookup_key("k1"), Err(Error::NotFound { .. })));
        assert!(matches!(reg.delete(&ep.id), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_count_by_status() {
        let reg = test_registry();
        let a = reg.create(new_endpoint("a"), "ka", 5900, "pw").unwrap();
        let b = reg.create(new_endpoint("b"), "kb", 5900, "pw").unwrap();
        reg.create(new_endpoint("c"), "kc", 5900, "pw").unwrap();
        reg.set_status(&a.id, EndpointStatus::Active, 1).unwrap();
        reg.set_status(&b.id, EndpointStatus::Error, 1).unwrap();

        let counts = reg.count_by_status().unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                total: 3,
                active: 1,
                inactive: 1,
                installing: 0,
                error: 1,
            }
        );
    }
}
