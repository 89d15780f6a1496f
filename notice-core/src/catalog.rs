//! External services, internal systems and the dependency edges between them.

use crate::error::{is_constraint_violation, Conflict, Error, Result};
use crate::models::{Dependency, ExternalService, InternalSystem, Pagination};
use crate::store::Store;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Clone, Debug, Default)]
pub struct ExternalServicePatch {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct InternalSystemPatch {
    pub name: Option<String>,
    pub responsible_contact: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Catalog {
    store: Store,
}

impl Catalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Returns the existing row when the name is taken.
    pub fn create_external_service(
        &self,
        name: &str,
        provider: Option<&str>,
        description: Option<&str>,
    ) -> Result<ExternalService> {
        let name = required_name(name)?;
        self.store.with_tx(|tx| {
            if let Some(existing) = service_by_name(tx, name)? {
                tracing::info!(name, id = existing.id, "external service already exists");
                return Ok(existing);
            }
            tx.execute(
                "INSERT INTO external_services (name, provider, description) VALUES (?1, ?2, ?3)",
                params![name, provider, description],
            )?;
            let id = tx.last_insert_rowid();
            tracing::info!(name, id, "created external service");
            load_service(tx, id)?.ok_or_else(|| Error::not_found("external service", id))
        })
    }

    pub fn get_external_service(&self, id: i64) -> Result<ExternalService> {
        let conn = self.store.connection()?;
        load_service(&conn, id)?.ok_or_else(|| Error::not_found("external service", id))
    }

    pub fn get_external_service_by_name(&self, name: &str) -> Result<Option<ExternalService>> {
        let conn = self.store.connection()?;
        service_by_name(&conn, name)
    }

    pub fn list_external_services(&self, page: Pagination) -> Result<Vec<ExternalService>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM external_services ORDER BY name LIMIT ?1 OFFSET ?2",
            ExternalService::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![page.limit, page.skip], ExternalService::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Names only, for the extraction prompt.
    pub fn external_service_names(&self) -> Result<Vec<String>> {
        let conn = self.store.connection()?;
        let mut stmt = conn.prepare("SELECT name FROM external_services ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_external_service(
        &self,
        id: i64,
        patch: &ExternalServicePatch,
    ) -> Result<ExternalService> {
        let name = patch.name.as_deref().map(required_name).transpose()?;
        self.store.with_tx(|tx| {
            load_service(tx, id)?.ok_or_else(|| Error::not_found("external service", id))?;
            tx.execute(
                "UPDATE external_services SET
                    name = COALESCE(?2, name),
                    provider = COALESCE(?3, provider),
                    description = COALESCE(?4, description)
                 WHERE id = ?1",
                params![id, name, patch.provider, patch.description],
            )
            .map_err(|err| rename_conflict(err, "external service", name))?;
            load_service(tx, id)?.ok_or_else(|| Error::not_found("external service", id))
        })
    }

    pub fn delete_external_service(&self, id: i64) -> Result<()> {
        self.store.with_tx(|tx| {
            load_service(tx, id)?.ok_or_else(|| Error::not_found("external service", id))?;
            let refs = count_refs(tx, "external_service_id", id)?;
            if refs > 0 {
                return Err(Error::Conflict(Conflict::InUse(format!(
                    "external service {id} has {refs} dependencies"
                ))));
            }
            tx.execute("DELETE FROM external_services WHERE id = ?1", params![id])?;
            tracing::info!(id, "deleted external service");
            Ok(())
        })
    }

    /// Returns the existing row when the name is taken.
    pub fn create_internal_system(
        &self,
        name: &str,
        responsible_contact: Option<&str>,
        description: Option<&str>,
    ) -> Result<InternalSystem> {
        let name = required_name(name)?;
        self.store.with_tx(|tx| {
            if let Some(existing) = system_by_name(tx, name)? {
                tracing::info!(name, id = existing.id, "internal system already exists");
                return Ok(existing);
            }
            tx.execute(
                "INSERT INTO internal_systems (name, responsible_contact, description)
                 VALUES (?1, ?2, ?3)",
                params![name, responsible_contact, description],
            )?;
            let id = tx.last_insert_rowid();
            tracing::info!(name, id, "created internal system");
            load_system(tx, id)?.ok_or_else(|| Error::not_found("internal system", id))
        })
    }

    pub fn get_internal_system(&self, id: i64) -> Result<InternalSystem> {
        let conn = self.store.connection()?;
        load_system(&conn, id)?.ok_or_else(|| Error::not_found("internal system", id))
    }

    pub fn get_internal_system_by_name(&self, name: &str) -> Result<Option<InternalSystem>> {
        let conn = self.store.connection()?;
        system_by_name(&conn, name)
    }

    pub fn list_internal_systems(&self, page: Pagination) -> Result<Vec<InternalSystem>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM internal_systems ORDER BY name LIMIT ?1 OFFSET ?2",
            InternalSystem::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![page.limit, page.skip], InternalSystem::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_internal_system(
        &self,
        id: i64,
        patch: &InternalSystemPatch,
    ) -> Result<InternalSystem> {
        let name = patch.name.as_deref().map(required_name).transpose()?;
        self.store.with_tx(|tx| {
            load_system(tx, id)?.ok_or_else(|| Error::not_found("internal system", id))?;
            tx.execute(
                "UPDATE internal_systems SET
                    name = COALESCE(?2, name),
                    responsible_contact = COALESCE(?3, responsible_contact),
                    description = COALESCE(?4, description)
                 WHERE id = ?1",
                params![id, name, patch.responsible_contact, patch.description],
            )
            .map_err(|err| rename_conflict(err, "internal system", name))?;
            load_system(tx, id)?.ok_or_else(|| Error::not_found("internal system", id))
        })
    }

    pub fn delete_internal_system(&self, id: i64) -> Result<()> {
        self.store.with_tx(|tx| {
            load_system(tx, id)?.ok_or_else(|| Error::not_found("internal system", id))?;
            let refs = count_refs(tx, "internal_system_id", id)?;
            if refs > 0 {
                return Err(Error::Conflict(Conflict::InUse(format!(
                    "internal system {id} has {refs} dependencies"
                ))));
            }
            tx.execute("DELETE FROM internal_systems WHERE id = ?1", params![id])?;
            tracing::info!(id, "deleted internal system");
            Ok(())
        })
    }

    /// Both ends must exist; an existing pair is returned unchanged.
    pub fn create_dependency(
        &self,
        internal_system_id: i64,
        external_service_id: i64,
        description: Option<&str>,
    ) -> Result<Dependency> {
        self.store.with_tx(|tx| {
            load_system(tx, internal_system_id)?
                .ok_or_else(|| Error::not_found("internal system", internal_system_id))?;
            load_service(tx, external_service_id)?
                .ok_or_else(|| Error::not_found("external service", external_service_id))?;

            let sql = format!(
                "SELECT {} FROM dependencies WHERE internal_system_id = ?1 AND external_service_id = ?2",
                Dependency::COLUMNS
            );
            if let Some(existing) = tx
                .query_row(
                    &sql,
                    params![internal_system_id, external_service_id],
                    Dependency::from_row,
                )
                .optional()?
            {
                tracing::info!(
                    internal_system_id,
                    external_service_id,
                    id = existing.id,
                    "dependency already exists"
                );
                return Ok(existing);
            }

            tx.execute(
                "INSERT INTO dependencies (internal_system_id, external_service_id, description)
                 VALUES (?1, ?2, ?3)",
                params![internal_system_id, external_service_id, description],
            )?;
            let id = tx.last_insert_rowid();
            tracing::info!(internal_system_id, external_service_id, id, "created dependency");
            load_dependency(tx, id)?.ok_or_else(|| Error::not_found("dependency", id))
        })
    }

    pub fn get_dependency(&self, id: i64) -> Result<Dependency> {
        let conn = self.store.connection()?;
        load_dependency(&conn, id)?.ok_or_else(|| Error::not_found("dependency", id))
    }

    pub fn list_dependencies(&self, page: Pagination) -> Result<Vec<Dependency>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM dependencies ORDER BY id LIMIT ?1 OFFSET ?2",
            Dependency::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![page.limit, page.skip], Dependency::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn dependencies_for_service(&self, external_service_id: i64) -> Result<Vec<Dependency>> {
        let conn = self.store.connection()?;
        let sql = format!(
            "SELECT {} FROM dependencies WHERE external_service_id = ?1 ORDER BY id",
            Dependency::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![external_service_id], Dependency::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_dependency(&self, id: i64, description: Option<&str>) -> Result<Dependency> {
        self.store.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE dependencies SET description = ?2 WHERE id = ?1",
                params![id, description],
            )?;
            if updated == 0 {
                return Err(Error::not_found("dependency", id));
            }
            load_dependency(tx, id)?.ok_or_else(|| Error::not_found("dependency", id))
        })
    }

    pub fn delete_dependency(&self, id: i64) -> Result<()> {
        let conn = self.store.connection()?;
        let deleted = conn.execute("DELETE FROM dependencies WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::not_found("dependency", id));
        }
        tracing::info!(id, "deleted dependency");
        Ok(())
    }
}

fn required_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        Err(Error::Validation("name must not be empty".into()))
    } else {
        Ok(name)
    }
}

fn rename_conflict(err: rusqlite::Error, entity: &str, name: Option<&str>) -> Error {
    if is_constraint_violation(&err) {
        Error::Conflict(Conflict::Duplicate(format!(
            "{entity} named '{}' already exists",
            name.unwrap_or_default()
        )))
    } else {
        Error::from(err)
    }
}

fn count_refs(conn: &Connection, column: &str, id: i64) -> Result<i64> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM dependencies WHERE {column} = ?1"),
        params![id],
        |row| row.get(0),
    )?)
}

pub(crate) fn service_by_name(conn: &Connection, name: &str) -> Result<Option<ExternalService>> {
    let sql = format!(
        "SELECT {} FROM external_services WHERE name = ?1",
        ExternalService::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![name], ExternalService::from_row)
        .optional()?)
}

fn load_service(conn: &Connection, id: i64) -> Result<Option<ExternalService>> {
    let sql = format!("SELECT {} FROM external_services WHERE id = ?1", ExternalService::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], ExternalService::from_row)
        .optional()?)
}

fn system_by_name(conn: &Connection, name: &str) -> Result<Option<InternalSystem>> {
    let sql = format!(
        "SELECT {} FROM internal_systems WHERE name = ?1",
        InternalSystem::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![name], InternalSystem::from_row)
        .optional()?)
}

pub(crate) fn load_system(conn: &Connection, id: i64) -> Result<Option<InternalSystem>> {
    let sql = format!("SELECT {} FROM internal_systems WHERE id = ?1", InternalSystem::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], InternalSystem::from_row)
        .optional()?)
}

fn load_dependency(conn: &Connection, id: i64) -> Result<Option<Dependency>> {
    let sql = format!("SELECT {} FROM dependencies WHERE id = ?1", Dependency::COLUMNS);
    Ok(conn
        .query_row(&sql, params![id], Dependency::from_row)
        .optional()?)
}
