//! SQLite-backed document store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use meshvisor_id::{DiskId, NodeId, VmId, VpcId};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{DocumentStore, StoreError};
use crate::model::{Disk, VirtualMachine, VmState, Vpc};

/// Document store on a local SQLite database.
///
/// Documents are stored as JSON. Fields updated independently of the rest of
/// the document (VM state, disk attachment, link lease) live in their own
/// columns so writers never clobber each other.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                state TEXT NOT NULL,
                document TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vms_node ON vms(node_id);

            CREATE TABLE IF NOT EXISTS disks (
                id TEXT PRIMARY KEY,
                source_instance TEXT,
                instance TEXT,
                document TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vpcs (
                id TEXT PRIMARY KEY,
                link_node TEXT,
                link_timestamp INTEGER,
                document TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Document store schema initialized");
        Ok(())
    }

    /// Insert or replace a VM document.
    pub fn put_vm(&self, vm: &VirtualMachine) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO vms (id, node_id, state, document) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                node_id = excluded.node_id,
                state = excluded.state,
                document = excluded.document
            "#,
            params![
                vm.id.to_string(),
                vm.node_id.to_string(),
                vm.state.as_str(),
                serde_json::to_string(vm)?,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a disk document.
    pub fn put_disk(&self, disk: &Disk) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO disks (id, source_instance, instance, document) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                source_instance = excluded.source_instance,
                instance = excluded.instance,
                document = excluded.document
            "#,
            params![
                disk.id.to_string(),
                disk.source_instance.as_ref().map(ToString::to_string),
                disk.instance.as_ref().map(ToString::to_string),
                serde_json::to_string(disk)?,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a VPC document, including its link lease.
    pub fn put_vpc(&self, vpc: &Vpc) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO vpcs (id, link_node, link_timestamp, document) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                link_node = excluded.link_node,
                link_timestamp = excluded.link_timestamp,
                document = excluded.document
            "#,
            params![
                vpc.id.to_string(),
                vpc.link_node.as_ref().map(ToString::to_string),
                vpc.link_timestamp.map(|ts| ts.timestamp_millis()),
                serde_json::to_string(vpc)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_vpc(&self, id: &VpcId) -> Result<Vpc, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT document, link_node, link_timestamp FROM vpcs WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some(row) => vpc_from_row(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}

fn vm_from_row((document, state): (String, String)) -> Result<VirtualMachine, StoreError> {
    let mut vm: VirtualMachine = serde_json::from_str(&document)?;
    vm.state = VmState::parse(&state)
        .ok_or_else(|| StoreError::Invalid(format!("unknown vm state: {state}")))?;
    Ok(vm)
}

fn disk_from_row(
    (document, instance): (String, Option<String>),
) -> Result<Disk, StoreError> {
    let mut disk: Disk = serde_json::from_str(&document)?;
    disk.instance = instance
        .map(|raw| raw.parse::<VmId>())
        .transpose()
        .map_err(|e| StoreError::Invalid(e.to_string()))?;
    Ok(disk)
}

fn vpc_from_row(
    (document, link_node, link_timestamp): (String, Option<String>, Option<i64>),
) -> Result<Vpc, StoreError> {
    let mut vpc: Vpc = serde_json::from_str(&document)?;
    vpc.link_node = link_node
        .map(|raw| raw.parse::<NodeId>())
        .transpose()
        .map_err(|e| StoreError::Invalid(e.to_string()))?;
    vpc.link_timestamp = link_timestamp.and_then(millis_to_utc);
    Ok(vpc)
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get_vm(&self, id: &VmId) -> Result<VirtualMachine, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT document, state FROM vms WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some(row) => vm_from_row(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn list_node_vms(&self, node: &NodeId) -> Result<Vec<VirtualMachine>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT document, state FROM vms WHERE node_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![node.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(vm_from_row).collect()
    }

    async fn commit_vm_state(&self, id: &VmId, state: VmState) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE vms SET state = ?1 WHERE id = ?2",
            params![state.as_str(), id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        debug!(vm_id = %id, state = %state, "Committed vm state");
        Ok(())
    }

    async fn get_disk(&self, id: &DiskId) -> Result<Disk, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT document, instance FROM disks WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some(row) => disk_from_row(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn delete_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM disks WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn detach_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        let updated = self.conn().execute(
            "UPDATE disks SET instance = NULL WHERE id = ?1",
            params![id.to_string()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_vpcs(&self) -> Result<Vec<Vpc>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT document, link_node, link_timestamp FROM vpcs ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(vpc_from_row).collect()
    }

    async fn ping_link(
        &self,
        vpc: &VpcId,
        node: &NodeId,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let now = Utc::now().timestamp_millis();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let stale_before = now.saturating_sub(timeout_ms);

        let updated = self.conn().execute(
            r#"
            UPDATE vpcs SET link_node = ?1, link_timestamp = ?2
            WHERE id = ?3 AND (
                link_node IS NULL
                OR link_node = ?1
                OR link_timestamp IS NULL
                OR link_timestamp <= ?4
            )
            "#,
            params![node.to_string(), now, vpc.to_string(), stale_before],
        )?;

        Ok(updated == 1)
    }
}
