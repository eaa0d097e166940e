use crate::db::models::{Route, RouteFields};
use crate::error::AppError;
use crate::modality::chat::ChatFormat;
use parking_lot::RwLock;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

const SELECT_ROUTES: &str = r#"SELECT id, name, model, api_url, api_key, "group", format, enabled, created, updated
    FROM model_routes ORDER BY id ASC"#;

/// Immutable view of every route. Readers hold an `Arc` to one of these, so a
/// lookup never observes a half-applied write.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    routes: BTreeMap<i64, Route>,
    by_key: HashMap<(String, String), i64>,
}

impl RouteSnapshot {
    fn build(rows: Vec<Route>) -> Self {
        let by_key = rows
            .iter()
            .map(|r| ((r.name.clone(), r.model.clone()), r.id))
            .collect();
        let routes = rows.into_iter().map(|r| (r.id, r)).collect();
        Self { routes, by_key }
    }

    /// Every route, ordered by id.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.values().cloned().collect()
    }

    pub fn get(&self, id: i64) -> Option<&Route> {
        self.routes.get(&id)
    }

    pub fn find_by_key(&self, name: &str, model: &str) -> Option<&Route> {
        self.by_key
            .get(&(name.to_string(), model.to_string()))
            .and_then(|id| self.routes.get(id))
    }

    fn enabled(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().filter(|r| r.enabled)
    }

    /// Candidate routes for `model`.
    ///
    /// A `"RouteName/model"` request selects that single route when it exists
    /// and is enabled. Otherwise the whole string is a model name: enabled routes
    /// serving it come first, then every other enabled route in a non-empty group
    /// shared with one of them. Both parts are ordered by id.
    pub fn lookup(&self, model: &str) -> Vec<Route> {
        if let Some((name, inner)) = model.split_once('/') {
            if let Some(route) = self.find_by_key(name, inner).filter(|r| r.enabled) {
                return vec![route.clone()];
            }
        }

        let mut candidates: Vec<Route> = self
            .enabled()
            .filter(|r| r.model == model)
            .cloned()
            .collect();

        let groups: BTreeSet<&str> = candidates
            .iter()
            .map(|r| r.group.as_str())
            .filter(|g| !g.is_empty())
            .collect();
        if groups.is_empty() {
            return candidates;
        }

        let members: Vec<Route> = self
            .enabled()
            .filter(|r| r.model != model && groups.contains(r.group.as_str()))
            .cloned()
            .collect();
        candidates.extend(members);
        candidates
    }

    /// True iff some non-empty group has at least two enabled routes.
    pub fn has_multi_model_routes(&self) -> bool {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for route in self.enabled().filter(|r| !r.group.is_empty()) {
            let count = counts.entry(route.group.as_str()).or_insert(0);
            *count += 1;
            if *count >= 2 {
                return true;
            }
        }
        false
    }

    pub fn route_count(&self) -> i64 {
        self.enabled().count() as i64
    }

    pub fn model_count(&self) -> i64 {
        self.enabled()
            .map(|r| r.model.as_str())
            .collect::<BTreeSet<_>>()
            .len() as i64
    }
}

/// SQLite-backed route table with a copy-on-write in-memory snapshot.
pub struct RouteTable {
    db: SqlitePool,
    snapshot: RwLock<Arc<RouteSnapshot>>,
    // serializes writers; readers never take it
    write_lock: tokio::sync::Mutex<()>,
}

fn now() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn required(value: &str, what: &str) -> Result<String, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", what)));
    }
    Ok(value.to_string())
}

fn normalize_format(format: &str) -> Result<String, AppError> {
    if format.trim().is_empty() {
        return Ok(ChatFormat::OpenaiChat.as_str().to_string());
    }
    ChatFormat::from_str_loose(format)
        .map(|f| f.as_str().to_string())
        .ok_or_else(|| AppError::Validation(format!("Unsupported format: {}", format)))
}

/// Trim and validate user-supplied route fields.
pub fn normalize_fields(fields: &RouteFields) -> Result<RouteFields, AppError> {
    Ok(RouteFields {
        name: required(&fields.name, "route name")?,
        model: required(&fields.model, "model")?,
        api_url: required(&fields.api_url, "api_url")?,
        api_key: fields.api_key.trim().to_string(),
        group: fields.group.trim().to_string(),
        format: normalize_format(&fields.format)?,
    })
}

fn duplicate(name: &str, model: &str) -> AppError {
    AppError::Validation(format!("Route '{}' already serves model '{}'", name, model))
}

/// Map a `(name, model)` unique-index violation to the same error the snapshot check gives.
fn map_unique(err: sqlx::Error, name: &str, model: &str) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => duplicate(name, model),
        _ => AppError::Database(err),
    }
}

impl RouteTable {
    pub async fn load(db: SqlitePool) -> Result<Self, AppError> {
        let rows = sqlx::query_as::<_, Route>(SELECT_ROUTES)
            .fetch_all(&db)
            .await?;
        log::info!("Loaded {} routes", rows.len());
        Ok(Self {
            db,
            snapshot: RwLock::new(Arc::new(RouteSnapshot::build(rows))),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Current snapshot. Cheap: one `Arc` clone under a read lock.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.snapshot().routes()
    }

    pub fn lookup(&self, model: &str) -> Vec<Route> {
        self.snapshot().lookup(model)
    }

    pub fn has_multi_model_routes(&self) -> bool {
        self.snapshot().has_multi_model_routes()
    }

    async fn publish(&self) -> Result<(), AppError> {
        let rows = sqlx::query_as::<_, Route>(SELECT_ROUTES)
            .fetch_all(&self.db)
            .await?;
        *self.snapshot.write() = Arc::new(RouteSnapshot::build(rows));
        Ok(())
    }

    pub async fn insert(&self, fields: &RouteFields) -> Result<Route, AppError> {
        let fields = normalize_fields(fields)?;
        let _guard = self.write_lock.lock().await;
        if self.snapshot().find_by_key(&fields.name, &fields.model).is_some() {
            return Err(duplicate(&fields.name, &fields.model));
        }

        let ts = now();
        let id = sqlx::query(
            r#"INSERT INTO model_routes (name, model, api_url, api_key, "group", format, enabled, created, updated)
               VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)"#,
        )
        .bind(&fields.name)
        .bind(&fields.model)
        .bind(&fields.api_url)
        .bind(&fields.api_key)
        .bind(&fields.group)
        .bind(&fields.format)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.db)
        .await
        .map_err(|e| map_unique(e, &fields.name, &fields.model))?
        .last_insert_rowid();

        self.publish().await?;
        log::info!("Added route {} ({}/{})", id, fields.name, fields.model);
        self.fetch(id)
    }

    /// One route per model, all named `base_name`. The batch is all-or-nothing.
    pub async fn bulk_insert(
        &self,
        base_name: &str,
        models: &[String],
        api_url: &str,
        api_key: &str,
        group: &str,
        format: &str,
    ) -> Result<Vec<Route>, AppError> {
        if models.is_empty() {
            return Err(AppError::Validation("at least one model is required".into()));
        }
        let mut batch = Vec::with_capacity(models.len());
        let mut seen = BTreeSet::new();
        for model in models {
            let fields = normalize_fields(&RouteFields {
                name: base_name.to_string(),
                model: model.clone(),
                api_url: api_url.to_string(),
                api_key: api_key.to_string(),
                group: group.to_string(),
                format: format.to_string(),
            })?;
            if !seen.insert(fields.model.clone()) {
                return Err(AppError::Validation(format!(
                    "Model '{}' appears more than once in the batch",
                    fields.model
                )));
            }
            batch.push(fields);
        }

        let _guard = self.write_lock.lock().await;
        let snapshot = self.snapshot();
        if let Some(taken) = batch
            .iter()
            .find(|f| snapshot.find_by_key(&f.name, &f.model).is_some())
        {
            return Err(duplicate(&taken.name, &taken.model));
        }

        let ts = now();
        let mut tx = self.db.begin().await?;
        let mut ids = Vec::with_capacity(batch.len());
        for fields in &batch {
            let id = sqlx::query(
                r#"INSERT INTO model_routes (name, model, api_url, api_key, "group", format, enabled, created, updated)
                   VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)"#,
            )
            .bind(&fields.name)
            .bind(&fields.model)
            .bind(&fields.api_url)
            .bind(&fields.api_key)
            .bind(&fields.group)
            .bind(&fields.format)
            .bind(&ts)
            .bind(&ts)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_unique(e, &fields.name, &fields.model))?
            .last_insert_rowid();
            ids.push(id);
        }
        tx.commit().await?;

        self.publish().await?;
        log::info!("Added {} routes under '{}'", ids.len(), base_name);
        ids.into_iter().map(|id| self.fetch(id)).collect()
    }

    pub async fn update(&self, id: i64, fields: &RouteFields) -> Result<Route, AppError> {
        let fields = normalize_fields(fields)?;
        let _guard = self.write_lock.lock().await;
        self.update_locked(id, &fields).await
    }

    /// Update the route currently identified by `(old_name, old_model)`.
    pub async fn update_by_key(
        &self,
        old_name: &str,
        old_model: &str,
        fields: &RouteFields,
    ) -> Result<Route, AppError> {
        let fields = normalize_fields(fields)?;
        let _guard = self.write_lock.lock().await;
        let id = self.id_for_key(old_name, old_model)?;
        self.update_locked(id, &fields).await
    }

    async fn update_locked(&self, id: i64, fields: &RouteFields) -> Result<Route, AppError> {
        let snapshot = self.snapshot();
        if snapshot.get(id).is_none() {
            return Err(AppError::NotFound(format!("route {}", id)));
        }
        if let Some(other) = snapshot.find_by_key(&fields.name, &fields.model) {
            if other.id != id {
                return Err(duplicate(&fields.name, &fields.model));
            }
        }

        sqlx::query(
            r#"UPDATE model_routes SET name = ?, model = ?, api_url = ?, api_key = ?, "group" = ?, format = ?, updated = ?
               WHERE id = ?"#,
        )
        .bind(&fields.name)
        .bind(&fields.model)
        .bind(&fields.api_url)
        .bind(&fields.api_key)
        .bind(&fields.group)
        .bind(&fields.format)
        .bind(now())
        .bind(id)
        .execute(&self.db)
        .await
        .map_err(|e| map_unique(e, &fields.name, &fields.model))?;

        self.publish().await?;
        self.fetch(id)
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<Route, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("UPDATE model_routes SET enabled = ?, updated = ? WHERE id = ?")
            .bind(enabled)
            .bind(now())
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("route {}", id)));
        }
        self.publish().await?;
        self.fetch(id)
    }

    pub async fn delete(&self, id: i64) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM model_routes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("route {}", id)));
        }
        self.publish().await
    }

    pub async fn delete_by_key(&self, name: &str, model: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let id = self.id_for_key(name, model)?;
        sqlx::query("DELETE FROM model_routes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        self.publish().await
    }

    /// Remove every route. Returns how many were deleted.
    pub async fn clear(&self) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM model_routes")
            .execute(&self.db)
            .await?;
        self.publish().await?;
        log::info!("Cleared {} routes", result.rows_affected());
        Ok(result.rows_affected())
    }

    fn id_for_key(&self, name: &str, model: &str) -> Result<i64, AppError> {
        self.snapshot()
            .find_by_key(name, model)
            .map(|r| r.id)
            .ok_or_else(|| AppError::NotFound(format!("route {}/{}", name, model)))
    }

    fn fetch(&self, id: i64) -> Result<Route, AppError> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("route {} missing after write", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn fields(name: &str, model: &str, group: &str) -> RouteFields {
        RouteFields {
            name: name.into(),
            model: model.into(),
            api_url: "https://api.example.com".into(),
            api_key: "sk-test".into(),
            group: group.into(),
            format: "openai".into(),
        }
    }

    async fn table() -> RouteTable {
        let pool = db::init_memory_pool().await.unwrap();
        RouteTable::load(pool).await.unwrap()
    }

    fn ids(routes: &[Route]) -> Vec<i64> {
        routes.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn insert_normalizes_and_rejects_duplicates() {
        let table = table().await;
        let mut input = fields(" Primary ", "gpt-4", "");
        input.format = "Claude".into();
        let route = table.insert(&input).await.unwrap();
        assert_eq!(route.name, "Primary");
        assert_eq!(route.format, "anthropic");
        assert!(route.enabled);

        let err = table.insert(&fields("Primary", "gpt-4", "")).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(table.routes().len(), 1);
    }

    #[tokio::test]
    async fn invalid_format_is_a_validation_error() {
        let table = table().await;
        let mut input = fields("a", "gpt-4", "");
        input.format = "cohere".into();
        let err = table.insert(&input).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn bulk_insert_creates_one_route_per_model() {
        let table = table().await;
        let models = vec!["gpt-4".to_string(), "gpt-4o".to_string(), "o3".to_string()];
        let routes = table
            .bulk_insert("Relay", &models, "https://relay.example", "k", "pool", "openai")
            .await
            .unwrap();

        assert_eq!(routes.len(), 3);
        for (route, model) in routes.iter().zip(&models) {
            assert_eq!(route.name, "Relay");
            assert_eq!(&route.model, model);
            assert_eq!(route.api_url, "https://relay.example");
            assert_eq!(route.group, "pool");
        }
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let table = table().await;
        table.insert(&fields("Relay", "o3", "")).await.unwrap();

        let repeated = vec!["gpt-4".to_string(), "gpt-4".to_string()];
        let err = table
            .bulk_insert("Relay", &repeated, "https://relay.example", "", "", "openai")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let colliding = vec!["gpt-4".to_string(), "o3".to_string()];
        let err = table
            .bulk_insert("Relay", &colliding, "https://relay.example", "", "", "openai")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(table.routes().len(), 1);
    }

    #[tokio::test]
    async fn lookup_expands_to_the_group() {
        let table = table().await;
        let a = table.insert(&fields("a", "gpt-4", "g1")).await.unwrap();
        let b = table.insert(&fields("b", "gpt-4o", "g1")).await.unwrap();
        let c = table.insert(&fields("c", "gpt-4", "")).await.unwrap();
        table.insert(&fields("d", "claude", "g2")).await.unwrap();

        assert_eq!(ids(&table.lookup("gpt-4")), vec![a.id, c.id, b.id]);
        assert_eq!(ids(&table.lookup("gpt-4o")), vec![b.id, a.id]);
        assert!(table.lookup("unknown").is_empty());
    }

    #[tokio::test]
    async fn lookup_skips_disabled_routes() {
        let table = table().await;
        let a = table.insert(&fields("a", "gpt-4", "g")).await.unwrap();
        let b = table.insert(&fields("b", "gpt-4", "g")).await.unwrap();
        table.set_enabled(a.id, false).await.unwrap();
        assert_eq!(ids(&table.lookup("gpt-4")), vec![b.id]);
    }

    #[tokio::test]
    async fn name_prefixed_lookup_selects_one_route() {
        let table = table().await;
        table.insert(&fields("a", "gpt-4", "g")).await.unwrap();
        let b = table.insert(&fields("b", "gpt-4", "g")).await.unwrap();
        let slash = table.insert(&fields("x", "meta/llama", "")).await.unwrap();

        assert_eq!(ids(&table.lookup("b/gpt-4")), vec![b.id]);
        // no route named "meta": the whole string is the model
        assert_eq!(ids(&table.lookup("meta/llama")), vec![slash.id]);
    }

    #[tokio::test]
    async fn multi_model_flag_follows_enabled_group_members() {
        let table = table().await;
        assert!(!table.has_multi_model_routes());
        let a = table.insert(&fields("a", "gpt-4", "g")).await.unwrap();
        table.insert(&fields("b", "gpt-4o", "g")).await.unwrap();
        table.insert(&fields("c", "o1", "")).await.unwrap();
        table.insert(&fields("d", "o3", "")).await.unwrap();
        assert!(table.has_multi_model_routes());

        table.set_enabled(a.id, false).await.unwrap();
        assert!(!table.has_multi_model_routes());
        table.set_enabled(a.id, true).await.unwrap();
        assert!(table.has_multi_model_routes());
    }

    #[tokio::test]
    async fn key_based_update_and_delete() {
        let table = table().await;
        let route = table.insert(&fields("a", "gpt-4", "")).await.unwrap();
        table.insert(&fields("b", "gpt-4", "")).await.unwrap();

        let updated = table
            .update_by_key("a", "gpt-4", &fields("a", "gpt-4.1", "g"))
            .await
            .unwrap();
        assert_eq!(updated.id, route.id);
        assert_eq!(updated.model, "gpt-4.1");

        let err = table
            .update(route.id, &fields("b", "gpt-4", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        table.delete_by_key("a", "gpt-4.1").await.unwrap();
        assert!(matches!(
            table.delete_by_key("a", "gpt-4.1").await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert_eq!(table.routes().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_survives_reload_and_clear() {
        let pool = db::init_memory_pool().await.unwrap();
        let table = RouteTable::load(pool.clone()).await.unwrap();
        table.insert(&fields("a", "gpt-4", "")).await.unwrap();
        let held = table.snapshot();

        let reloaded = RouteTable::load(pool).await.unwrap();
        assert_eq!(reloaded.routes(), table.routes());

        assert_eq!(table.clear().await.unwrap(), 1);
        assert!(table.routes().is_empty());
        // readers holding the old snapshot are unaffected
        assert_eq!(held.routes().len(), 1);
    }

    #[tokio::test]
    async fn counts_only_enabled_routes() {
        let table = table().await;
        table.insert(&fields("a", "gpt-4", "")).await.unwrap();
        table.insert(&fields("b", "gpt-4", "")).await.unwrap();
        let c = table.insert(&fields("c", "o3", "")).await.unwrap();
        table.set_enabled(c.id, false).await.unwrap();

        let snapshot = table.snapshot();
        assert_eq!(snapshot.route_count(), 2);
        assert_eq!(snapshot.model_count(), 1);
    }
}
